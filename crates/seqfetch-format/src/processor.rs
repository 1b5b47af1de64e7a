use std::fmt;

use seqfetch_types::{Blob, ChunkContent, ChunkId};

use crate::error::{FormatError, FormatResult};

/// Header size: 4 bytes magic + 2 bytes version.
pub const HEADER_LEN: usize = 6;

/// Decode a payload (header already stripped) into a blob.
pub type DecodeFn = fn(&[u8]) -> FormatResult<Blob>;
/// Encode a blob into a payload (header added by the caller).
pub type EncodeFn = fn(&Blob) -> FormatResult<Vec<u8>>;
/// Decode a complete chunk message and check it carries the expected id.
pub type DecodeChunkFn = fn(&[u8], ChunkId) -> FormatResult<ChunkContent>;
/// Encode a chunk into a complete chunk message.
pub type EncodeChunkFn = fn(&ChunkContent) -> FormatResult<Vec<u8>>;

/// Skeleton/chunk half of a processor that splits heavyweight payloads out
/// of the main record.
#[derive(Clone, Copy)]
pub struct SplitCodec {
    pub decode_chunk: DecodeChunkFn,
    pub encode_chunk: EncodeChunkFn,
}

/// One row of the processor table.
#[derive(Clone, Copy)]
pub struct Processor {
    /// Unique name, used to pick an encoder and to remember which
    /// processor decoded a blob.
    pub name: &'static str,
    /// Magic prefix, or `None` for headerless formats.
    pub magic: Option<[u8; 4]>,
    pub version: u16,
    pub decode: DecodeFn,
    pub encode: EncodeFn,
    /// Present for formats that ship a skeleton first and chunks later. For
    /// those, `decode` is the skeleton decoder.
    pub split: Option<SplitCodec>,
}

impl Processor {
    /// Returns `true` if `data` starts with this processor's exact header.
    pub fn matches_header(&self, data: &[u8]) -> bool {
        match self.magic {
            Some(magic) => read_header(data) == Some((magic, self.version)),
            None => false,
        }
    }

    /// Decode a complete message (header included, if any).
    pub fn decode_message(&self, data: &[u8]) -> FormatResult<Blob> {
        match self.magic {
            Some(_) => {
                if !self.matches_header(data) {
                    return Err(FormatError::Decode {
                        processor: self.name,
                        reason: "header does not match".into(),
                    });
                }
                (self.decode)(&data[HEADER_LEN..])
            }
            None => (self.decode)(data),
        }
    }

    /// Encode a blob into a complete message (header included, if any).
    pub fn encode_message(&self, blob: &Blob) -> FormatResult<Vec<u8>> {
        let payload = (self.encode)(blob)?;
        match self.magic {
            Some(magic) => {
                let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
                write_header(&mut buf, magic, self.version);
                buf.extend_from_slice(&payload);
                Ok(buf)
            }
            None => Ok(payload),
        }
    }

    /// Returns `true` if this processor supports skeleton/chunk loading.
    pub fn is_split(&self) -> bool {
        self.split.is_some()
    }
}

impl fmt::Debug for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Processor")
            .field("name", &self.name)
            .field("magic", &self.magic.map(|m| magic_str(&m)))
            .field("version", &self.version)
            .field("split", &self.split.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Framing helpers shared by the built-in processors
// ---------------------------------------------------------------------------

/// Split off the `(magic, version)` header, if `data` is long enough.
pub fn read_header(data: &[u8]) -> Option<([u8; 4], u16)> {
    if data.len() < HEADER_LEN {
        return None;
    }
    let mut magic = [0u8; 4];
    magic.copy_from_slice(&data[0..4]);
    let version = u16::from_be_bytes([data[4], data[5]]);
    Some((magic, version))
}

pub fn write_header(buf: &mut Vec<u8>, magic: [u8; 4], version: u16) {
    buf.extend_from_slice(&magic);
    buf.extend_from_slice(&version.to_be_bytes());
}

/// Printable form of a magic value.
pub fn magic_str(magic: &[u8]) -> String {
    if magic.iter().all(|b| b.is_ascii_graphic()) {
        String::from_utf8_lossy(magic).into_owned()
    } else {
        magic.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Append a little-endian CRC32 of `payload`.
pub(crate) fn seal(mut payload: Vec<u8>) -> Vec<u8> {
    let crc = crc32fast::hash(&payload);
    payload.extend_from_slice(&crc.to_le_bytes());
    payload
}

/// Verify and strip the CRC32 trailer written by [`seal`].
pub(crate) fn unseal<'a>(processor: &'static str, data: &'a [u8]) -> FormatResult<&'a [u8]> {
    if data.len() < 4 {
        return Err(FormatError::Truncated {
            processor,
            len: data.len(),
        });
    }
    let (payload, trailer) = data.split_at(data.len() - 4);
    let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let actual = crc32fast::hash(payload);
    if expected != actual {
        return Err(FormatError::Checksum {
            processor,
            expected,
            actual,
        });
    }
    Ok(payload)
}
