use seqfetch_types::{Blob, ChunkContent, ChunkId};
use tracing::debug;

use crate::builtin;
use crate::error::{FormatError, FormatResult};
use crate::processor::{magic_str, read_header, Processor, HEADER_LEN};

/// Result of a successful decode: the blob and which processor produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decoded {
    pub blob: Blob,
    pub processor: &'static str,
}

/// Strategy table of format processors keyed by magic + version.
///
/// Selection inspects the header of the fetched bytes. Rows whose exact
/// header matches are tried in registration order, followed by headerless
/// rows; the first candidate that parses without structural error wins.
#[derive(Clone, Debug, Default)]
pub struct ProcessorTable {
    rows: Vec<Processor>,
}

impl ProcessorTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// A table holding every built-in processor.
    pub fn with_builtin() -> Self {
        Self {
            rows: builtin::ALL.to_vec(),
        }
    }

    /// Append a row. Names must be unique.
    pub fn register(&mut self, processor: Processor) -> FormatResult<()> {
        if self.rows.iter().any(|p| p.name == processor.name) {
            return Err(FormatError::DuplicateProcessor(processor.name));
        }
        self.rows.push(processor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> FormatResult<&Processor> {
        self.rows
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| FormatError::UnknownProcessor(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Processors that may understand `data`, in the order they are tried.
    pub fn candidates(&self, data: &[u8]) -> Vec<&Processor> {
        let exact = self.rows.iter().filter(|p| p.matches_header(data));
        let headerless = self.rows.iter().filter(|p| p.magic.is_none());
        exact.chain(headerless).collect()
    }

    /// Decode fetched bytes with the first processor that accepts them.
    pub fn decode(&self, data: &[u8]) -> FormatResult<Decoded> {
        let candidates = self.candidates(data);
        if candidates.is_empty() {
            return Err(self.unrecognised(data));
        }

        let mut last_err = None;
        for processor in candidates {
            match processor.decode_message(data) {
                Ok(blob) => {
                    debug!(processor = processor.name, key = %blob.key, "blob decoded");
                    return Ok(Decoded {
                        blob,
                        processor: processor.name,
                    });
                }
                Err(e) => {
                    debug!(processor = processor.name, error = %e, "candidate rejected data");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| self.unrecognised(data)))
    }

    /// Decode a skeleton: like [`decode`](Self::decode), but the winning
    /// processor must support chunks.
    pub fn decode_skeleton(&self, data: &[u8]) -> FormatResult<Decoded> {
        let decoded = self.decode(data)?;
        if !self.get(decoded.processor)?.is_split() {
            return Err(FormatError::NotSplit(decoded.processor.to_string()));
        }
        Ok(decoded)
    }

    /// Decode one chunk payload with the processor that decoded its skeleton.
    pub fn decode_chunk(
        &self,
        processor: &str,
        data: &[u8],
        chunk: ChunkId,
    ) -> FormatResult<ChunkContent> {
        let row = self.get(processor)?;
        let codec = row
            .split
            .ok_or_else(|| FormatError::NotSplit(processor.to_string()))?;
        (codec.decode_chunk)(data, chunk)
    }

    /// Encode a blob with the named processor.
    pub fn encode(&self, processor: &str, blob: &Blob) -> FormatResult<Vec<u8>> {
        self.get(processor)?.encode_message(blob)
    }

    /// Encode one chunk with the named split processor.
    pub fn encode_chunk(&self, processor: &str, content: &ChunkContent) -> FormatResult<Vec<u8>> {
        let row = self.get(processor)?;
        let codec = row
            .split
            .ok_or_else(|| FormatError::NotSplit(processor.to_string()))?;
        (codec.encode_chunk)(content)
    }

    fn unrecognised(&self, data: &[u8]) -> FormatError {
        if let Some((magic, version)) = read_header(data) {
            if self.rows.iter().any(|p| p.magic == Some(magic)) {
                return FormatError::UnsupportedVersion {
                    magic: magic_str(&magic),
                    version,
                };
            }
        }
        let prefix = &data[..data.len().min(HEADER_LEN)];
        FormatError::UnknownFormat {
            prefix: magic_str(prefix),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::{COMPRESSED, JSON, SPLIT, WHOLE};
    use crate::processor::write_header;
    use crate::split::split_blob;
    use seqfetch_types::{Annotation, BlobKey, NeedUpdate, SeqEntry, SeqSegment};

    fn sample() -> Blob {
        let mut entry = SeqEntry::sequence("NC_000017.11");
        entry.annotations.push(Annotation {
            name: "genes".into(),
            features: Vec::new(),
        });
        entry.seq_data.push(SeqSegment {
            start: 0,
            residues: "ACGTACGT".into(),
        });
        Blob::new(BlobKey::new(8, 1, 17).with_version(11), entry)
    }

    fn failing_decode(_: &[u8]) -> FormatResult<Blob> {
        Err(FormatError::Decode {
            processor: "strict",
            reason: "schema revision mismatch".into(),
        })
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    #[test]
    fn dispatch_by_magic() {
        let table = ProcessorTable::with_builtin();
        for name in ["whole", "compressed", "split", "json"] {
            let bytes = table.encode(name, &sample()).unwrap();
            let decoded = table.decode(&bytes).unwrap();
            assert_eq!(decoded.processor, name);
            assert_eq!(decoded.blob, sample());
        }
    }

    #[test]
    fn ambiguous_rows_tried_in_registration_order() {
        let strict = Processor {
            name: "strict",
            decode: failing_decode,
            ..WHOLE
        };
        let mut table = ProcessorTable::new();
        table.register(strict).unwrap();
        table.register(WHOLE).unwrap();

        let bytes = WHOLE.encode_message(&sample()).unwrap();
        assert_eq!(table.candidates(&bytes).len(), 2);
        let decoded = table.decode(&bytes).unwrap();
        assert_eq!(decoded.processor, "whole");
    }

    #[test]
    fn last_error_reported_when_all_candidates_fail() {
        let strict = Processor {
            name: "strict",
            decode: failing_decode,
            ..WHOLE
        };
        let mut table = ProcessorTable::new();
        table.register(strict).unwrap();
        let bytes = WHOLE.encode_message(&sample()).unwrap();
        assert!(matches!(
            table.decode(&bytes),
            Err(FormatError::Decode {
                processor: "strict",
                ..
            })
        ));
    }

    #[test]
    fn headerless_fallback() {
        let table = ProcessorTable::with_builtin();
        let bytes = JSON.encode_message(&sample()).unwrap();
        assert_eq!(table.candidates(&bytes).len(), 1);
        assert_eq!(table.decode(&bytes).unwrap().processor, "json");
    }

    #[test]
    fn unknown_version_reported() {
        let mut table = ProcessorTable::new();
        table.register(WHOLE).unwrap();
        let mut bytes = Vec::new();
        write_header(&mut bytes, *b"SQWR", 9);
        bytes.extend_from_slice(b"payload");
        assert_eq!(
            table.decode(&bytes).unwrap_err(),
            FormatError::UnsupportedVersion {
                magic: "SQWR".into(),
                version: 9
            }
        );
    }

    #[test]
    fn unknown_magic_reported() {
        let mut table = ProcessorTable::new();
        table.register(COMPRESSED).unwrap();
        assert!(matches!(
            table.decode(b"XXXX\x00\x01abc"),
            Err(FormatError::UnknownFormat { .. })
        ));
        assert!(matches!(
            table.decode(b"ab"),
            Err(FormatError::UnknownFormat { .. })
        ));
    }

    #[test]
    fn duplicate_name_rejected() {
        let mut table = ProcessorTable::with_builtin();
        assert_eq!(
            table.register(WHOLE).unwrap_err(),
            FormatError::DuplicateProcessor("whole")
        );
    }

    // -----------------------------------------------------------------------
    // Skeleton / chunks
    // -----------------------------------------------------------------------

    #[test]
    fn skeleton_and_chunks() {
        let table = ProcessorTable::with_builtin();
        let (skeleton, chunks) = split_blob(&sample(), NeedUpdate::SEQ_DATA);
        let bytes = table.encode("split", &skeleton).unwrap();
        let decoded = table.decode_skeleton(&bytes).unwrap();
        assert_eq!(decoded.blob.chunks.len(), 1);
        assert!(decoded.blob.entry(0).unwrap().seq_data.is_empty());

        let chunk = &chunks[0];
        let payload = table.encode_chunk("split", chunk).unwrap();
        let content = table.decode_chunk("split", &payload, chunk.id).unwrap();
        assert_eq!(&content, chunk);
    }

    #[test]
    fn decode_skeleton_requires_split_processor() {
        let table = ProcessorTable::with_builtin();
        let bytes = table.encode("whole", &sample()).unwrap();
        assert_eq!(
            table.decode_skeleton(&bytes).unwrap_err(),
            FormatError::NotSplit("whole".into())
        );
        assert!(table.decode_chunk("whole", &bytes, seqfetch_types::ChunkId(1)).is_err());
        assert!(SPLIT.is_split());
    }
}
