use std::io::Read;

use seqfetch_types::{Blob, ChunkContent, ChunkId};

use crate::error::{FormatError, FormatResult};
use crate::processor::{read_header, seal, unseal, write_header, Processor, SplitCodec, HEADER_LEN};

pub const WHOLE_MAGIC: [u8; 4] = *b"SQWR";
pub const COMPRESSED_MAGIC: [u8; 4] = *b"SQWZ";
pub const SKELETON_MAGIC: [u8; 4] = *b"SQSK";
pub const CHUNK_MAGIC: [u8; 4] = *b"SQCK";

const ZSTD_LEVEL: i32 = 3;

/// Largest decompressed record the `compressed` processor will produce.
pub const MAX_DECOMPRESSED: usize = 256 << 20;

/// Legacy whole-record encoding: bincode blob with a CRC32 trailer.
pub const WHOLE: Processor = Processor {
    name: "whole",
    magic: Some(WHOLE_MAGIC),
    version: 1,
    decode: decode_whole,
    encode: encode_whole,
    split: None,
};

/// Whole record, zstd-compressed, with a CRC32 trailer over the frame.
pub const COMPRESSED: Processor = Processor {
    name: "compressed",
    magic: Some(COMPRESSED_MAGIC),
    version: 2,
    decode: decode_compressed,
    encode: encode_compressed,
    split: None,
};

/// Skeleton + chunks encoding.
pub const SPLIT: Processor = Processor {
    name: "split",
    magic: Some(SKELETON_MAGIC),
    version: 1,
    decode: decode_skeleton,
    encode: encode_skeleton,
    split: Some(SplitCodec {
        decode_chunk,
        encode_chunk,
    }),
};

/// Headerless JSON records from older text-based sources.
pub const JSON: Processor = Processor {
    name: "json",
    magic: None,
    version: 0,
    decode: decode_json,
    encode: encode_json,
    split: None,
};

/// Every built-in processor, in registration order.
pub const ALL: [Processor; 4] = [WHOLE, COMPRESSED, SPLIT, JSON];

// ---------------------------------------------------------------------------
// whole
// ---------------------------------------------------------------------------

fn decode_whole(payload: &[u8]) -> FormatResult<Blob> {
    let body = unseal("whole", payload)?;
    from_bincode("whole", body)
}

fn encode_whole(blob: &Blob) -> FormatResult<Vec<u8>> {
    Ok(seal(to_bincode("whole", blob)?))
}

// ---------------------------------------------------------------------------
// compressed
// ---------------------------------------------------------------------------

fn decode_compressed(payload: &[u8]) -> FormatResult<Blob> {
    let frame = unseal("compressed", payload)?;
    let raw = inflate_bounded("compressed", frame, MAX_DECOMPRESSED)?;
    from_bincode("compressed", &raw)
}

fn encode_compressed(blob: &Blob) -> FormatResult<Vec<u8>> {
    let raw = to_bincode("compressed", blob)?;
    let frame = zstd::encode_all(&raw[..], ZSTD_LEVEL).map_err(|e| FormatError::Encode {
        processor: "compressed",
        reason: e.to_string(),
    })?;
    Ok(seal(frame))
}

/// Decompress a zstd frame, refusing to produce more than `limit` bytes.
fn inflate_bounded(processor: &'static str, frame: &[u8], limit: usize) -> FormatResult<Vec<u8>> {
    let decode_err = |e: std::io::Error| FormatError::Decode {
        processor,
        reason: e.to_string(),
    };
    let decoder = zstd::stream::read::Decoder::new(frame).map_err(decode_err)?;
    let mut raw = Vec::new();
    decoder
        .take(limit as u64 + 1)
        .read_to_end(&mut raw)
        .map_err(decode_err)?;
    if raw.len() > limit {
        return Err(FormatError::TooLarge { processor, limit });
    }
    Ok(raw)
}

// ---------------------------------------------------------------------------
// split
// ---------------------------------------------------------------------------

fn decode_skeleton(payload: &[u8]) -> FormatResult<Blob> {
    let body = unseal("split", payload)?;
    let blob: Blob = from_bincode("split", body)?;
    if let Some(bad) = blob.loaded_chunks.iter().find(|id| blob.chunk_info(**id).is_none()) {
        return Err(FormatError::Decode {
            processor: "split",
            reason: format!("skeleton marks undeclared {bad} as loaded"),
        });
    }
    Ok(blob)
}

fn encode_skeleton(blob: &Blob) -> FormatResult<Vec<u8>> {
    Ok(seal(to_bincode("split", blob)?))
}

fn decode_chunk(data: &[u8], expected: ChunkId) -> FormatResult<ChunkContent> {
    match read_header(data) {
        Some((CHUNK_MAGIC, 1)) => {}
        Some((magic, version)) if magic == CHUNK_MAGIC => {
            return Err(FormatError::UnsupportedVersion {
                magic: "SQCK".into(),
                version,
            })
        }
        _ => {
            return Err(FormatError::Decode {
                processor: "split",
                reason: "chunk payload lacks SQCK header".into(),
            })
        }
    }
    let body = unseal("split", &data[HEADER_LEN..])?;
    let content: ChunkContent = from_bincode("split", body)?;
    if content.id != expected {
        return Err(FormatError::ChunkMismatch {
            expected,
            actual: content.id,
        });
    }
    Ok(content)
}

fn encode_chunk(content: &ChunkContent) -> FormatResult<Vec<u8>> {
    let mut buf = Vec::new();
    write_header(&mut buf, CHUNK_MAGIC, 1);
    buf.extend_from_slice(&seal(to_bincode("split", content)?));
    Ok(buf)
}

// ---------------------------------------------------------------------------
// json
// ---------------------------------------------------------------------------

fn decode_json(data: &[u8]) -> FormatResult<Blob> {
    let first = data.iter().find(|b| !b.is_ascii_whitespace());
    if first != Some(&b'{') {
        return Err(FormatError::Decode {
            processor: "json",
            reason: "not a JSON object".into(),
        });
    }
    serde_json::from_slice(data).map_err(|e| FormatError::Decode {
        processor: "json",
        reason: e.to_string(),
    })
}

fn encode_json(blob: &Blob) -> FormatResult<Vec<u8>> {
    serde_json::to_vec(blob).map_err(|e| FormatError::Encode {
        processor: "json",
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

fn to_bincode<T: serde::Serialize>(processor: &'static str, value: &T) -> FormatResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| FormatError::Encode {
        processor,
        reason: e.to_string(),
    })
}

fn from_bincode<T: serde::de::DeserializeOwned>(
    processor: &'static str,
    data: &[u8],
) -> FormatResult<T> {
    bincode::deserialize(data).map_err(|e| FormatError::Decode {
        processor,
        reason: e.to_string(),
    })
}
