//! Ingestion Chunker
//!
//! Splits preprocessed prose into ordered chunks of roughly the target
//! word count with overlap between consecutive chunks. Each chunk becomes
//! a Source.

/// One ingestion chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestChunk {
    pub index: usize,
    pub text: String,
    /// Word offsets (start, end) into the tokenized document
    pub word_range: (usize, usize),
}

/// Split text into overlapping word-window chunks
///
/// `overlap_words` is clamped below `target_words`; the final chunk keeps
/// the remainder even when short.
pub fn chunk_words(text: &str, target_words: usize, overlap_words: usize) -> Vec<IngestChunk> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return Vec::new();
    }
    let target = target_words.max(1);
    let overlap = overlap_words.min(target.saturating_sub(1));
    let step = target - overlap;

    let mut chunks = Vec::new();
    let mut start = 0usize;
    loop {
        let end = (start + target).min(words.len());
        chunks.push(IngestChunk {
            index: chunks.len(),
            text: words[start..end].join(" "),
            word_range: (start, end),
        });
        if end >= words.len() {
            break;
        }
        start += step;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize) -> String {
        (0..n).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn test_short_text_is_one_chunk() {
        let chunks = chunk_words(&words(50), 1000, 200);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].word_range, (0, 50));
    }

    #[test]
    fn test_empty_text_has_no_chunks() {
        assert!(chunk_words("   ", 1000, 200).is_empty());
    }

    #[test]
    fn test_overlap_between_consecutive_chunks() {
        let chunks = chunk_words(&words(2500), 1000, 200);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].word_range, (0, 1000));
        assert_eq!(chunks[1].word_range, (800, 1800));
        assert_eq!(chunks[2].word_range, (1600, 2500));

        // The overlapping words are shared verbatim
        let tail: Vec<&str> = chunks[0].text.split_whitespace().rev().take(200).collect();
        let head: Vec<&str> = chunks[1].text.split_whitespace().take(200).collect();
        let mut tail_sorted = tail.clone();
        tail_sorted.reverse();
        assert_eq!(tail_sorted, head);
    }

    #[test]
    fn test_degenerate_overlap_is_clamped() {
        // Overlap >= target would loop forever without the clamp
        let chunks = chunk_words(&words(30), 10, 50);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.word_range.1 <= 30));
        assert_eq!(chunks.last().unwrap().word_range.1, 30);
    }

    #[test]
    fn test_indexes_are_ordered() {
        let chunks = chunk_words(&words(5000), 1000, 200);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
        }
    }
}
