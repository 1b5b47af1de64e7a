use std::mem;

use seqfetch_types::{Blob, ChunkContent, ChunkId, ChunkInfo, NeedUpdate};

/// Split the given parts of every entry out of `blob` into chunks.
///
/// Returns the skeleton (the blob with those parts removed and declared as
/// chunk placeholders) and one chunk per entry that held any of the parts.
/// Chunk ids are assigned from 1 in pre-order. Core summaries always stay in
/// the skeleton.
pub fn split_blob(blob: &Blob, parts: NeedUpdate) -> (Blob, Vec<ChunkContent>) {
    let parts = parts.own().difference(NeedUpdate::CORE);
    let mut skeleton = blob.clone();
    let mut chunks = Vec::new();
    let mut next_id = skeleton
        .chunks
        .iter()
        .map(|c| c.id.0)
        .max()
        .unwrap_or(0)
        + 1;

    for index in 0..skeleton.entry_count() {
        let Some(entry) = skeleton.root.get_mut(index) else {
            continue;
        };
        let carried = entry.present_parts() & parts;
        if carried.is_empty() {
            continue;
        }

        let mut content = ChunkContent::empty(ChunkId(next_id), index);
        if carried.contains(NeedUpdate::DESCRIPTION) {
            content.descriptions = mem::take(&mut entry.descriptions);
        }
        if carried.contains(NeedUpdate::ANNOTATION) {
            content.annotations = mem::take(&mut entry.annotations);
        }
        if carried.contains(NeedUpdate::SEQ_DATA) {
            content.seq_data = mem::take(&mut entry.seq_data);
        }
        if carried.contains(NeedUpdate::ASSEMBLY) {
            content.assembly = mem::take(&mut entry.assembly);
        }

        skeleton.chunks.push(ChunkInfo {
            id: content.id,
            target: index,
            parts: carried,
        });
        chunks.push(content);
        next_id += 1;
    }
    (skeleton, chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use seqfetch_types::{Annotation, BlobKey, Molecule, SeqEntry, SeqSegment, SeqSummary};

    fn member(acc: &str, with_seq: bool) -> SeqEntry {
        let mut e = SeqEntry::sequence(acc);
        e.summary = Some(SeqSummary {
            length: 8,
            molecule: Molecule::Dna,
        });
        e.annotations.push(Annotation {
            name: format!("{acc}-features"),
            features: Vec::new(),
        });
        if with_seq {
            e.seq_data.push(SeqSegment {
                start: 0,
                residues: "ACGTACGT".into(),
            });
        }
        e
    }

    fn blob() -> Blob {
        Blob::new(
            BlobKey::new(1, 0, 1),
            SeqEntry::set(vec![member("A", true), member("B", false)]),
        )
    }

    #[test]
    fn split_moves_parts_into_chunks() {
        let (skeleton, chunks) = split_blob(&blob(), NeedUpdate::ANNOTATION | NeedUpdate::SEQ_DATA);
        assert_eq!(chunks.len(), 2);
        assert_eq!(skeleton.chunks[0].target, 1);
        assert_eq!(
            skeleton.chunks[0].parts,
            NeedUpdate::ANNOTATION | NeedUpdate::SEQ_DATA
        );
        assert_eq!(skeleton.chunks[1].parts, NeedUpdate::ANNOTATION);
        assert!(skeleton.entry(1).unwrap().annotations.is_empty());
        assert!(skeleton.entry(1).unwrap().summary.is_some());
    }

    #[test]
    fn attaching_all_chunks_restores_the_record() {
        let original = blob();
        let (mut skeleton, chunks) = split_blob(&original, NeedUpdate::ALL);
        for chunk in chunks {
            skeleton.attach_chunk(chunk).unwrap();
        }
        assert_eq!(skeleton.root, original.root);
        assert_eq!(skeleton.pending_chunks().count(), 0);
    }

    #[test]
    fn core_never_split() {
        let (skeleton, chunks) = split_blob(&blob(), NeedUpdate::CORE);
        assert!(chunks.is_empty());
        assert!(skeleton.chunks.is_empty());
    }
}
