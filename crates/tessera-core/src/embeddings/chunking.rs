//! Source Chunking Strategies
//!
//! Splits a source's full text into spans for embedding. Offsets are byte
//! offsets into the original text and always satisfy
//! `full_text[start..end] == chunk_text`, which is what query-time hash
//! verification recomputes.

use crate::graph::ChunkStrategy;

/// Maximum characters per sentence-strategy chunk
pub const SENTENCE_CHUNK_CHARS: usize = 500;

/// Maximum characters per semantic-strategy chunk
pub const SEMANTIC_CHUNK_CHARS: usize = 1000;

/// One chunk span cut from a source text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpan {
    pub index: usize,
    /// Byte offset of the span start in the full text
    pub start_offset: usize,
    /// Byte offset one past the span end
    pub end_offset: usize,
    pub text: String,
}

/// Split text according to the given strategy
///
/// Whitespace-only texts produce no chunks. A single unit longer than the
/// strategy's limit stays whole; limits bound packing, not splitting.
pub fn split(full_text: &str, strategy: ChunkStrategy) -> Vec<ChunkSpan> {
    if full_text.trim().is_empty() {
        return Vec::new();
    }
    match strategy {
        ChunkStrategy::Paragraph => vec![ChunkSpan {
            index: 0,
            start_offset: 0,
            end_offset: full_text.len(),
            text: full_text.to_string(),
        }],
        ChunkStrategy::Sentence => pack(full_text, sentence_spans(full_text), SENTENCE_CHUNK_CHARS),
        ChunkStrategy::Semantic => pack(full_text, block_spans(full_text), SEMANTIC_CHUNK_CHARS),
    }
}

/// Sentence spans as (start, end) byte offsets
fn sentence_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0usize;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        let is_terminator = matches!(c, '.' | '!' | '?');
        let followed_by_space = chars
            .peek()
            .map(|(_, next)| next.is_whitespace())
            .unwrap_or(true);
        if is_terminator && followed_by_space {
            let end = i + c.len_utf8();
            if text[start..end].trim().is_empty() {
                start = end;
                continue;
            }
            spans.push((start, end));
            start = end;
        }
    }
    if start < text.len() && !text[start..].trim().is_empty() {
        spans.push((start, text.len()));
    }
    spans
}

/// Semantic block spans: blank-line separated blocks, headings on their own
fn block_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut block_start: Option<usize> = None;
    let mut offset = 0usize;

    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        let trimmed = line.trim();

        if trimmed.is_empty() {
            if let Some(start) = block_start.take() {
                spans.push((start, line_start));
            }
            continue;
        }

        // Headings terminate the running block and stand alone
        if trimmed.starts_with('#') {
            if let Some(start) = block_start.take() {
                spans.push((start, line_start));
            }
            spans.push((line_start, offset));
            continue;
        }

        if block_start.is_none() {
            block_start = Some(line_start);
        }
    }
    if let Some(start) = block_start {
        spans.push((start, text.len()));
    }
    spans
}

/// Greedily pack unit spans into chunks bounded by `max_chars`
fn pack(text: &str, units: Vec<(usize, usize)>, max_chars: usize) -> Vec<ChunkSpan> {
    let mut chunks = Vec::new();
    let mut current: Option<(usize, usize)> = None;

    for (start, end) in units {
        match current {
            None => current = Some((start, end)),
            Some((cur_start, cur_end)) => {
                let merged_chars = text[cur_start..end].chars().count();
                if merged_chars <= max_chars {
                    current = Some((cur_start, end));
                } else {
                    push_span(text, &mut chunks, cur_start, cur_end);
                    current = Some((start, end));
                }
            }
        }
    }
    if let Some((start, end)) = current {
        push_span(text, &mut chunks, start, end);
    }
    chunks
}

fn push_span(text: &str, chunks: &mut Vec<ChunkSpan>, start: usize, end: usize) {
    let span_text = &text[start..end];
    if span_text.trim().is_empty() {
        return;
    }
    chunks.push(ChunkSpan {
        index: chunks.len(),
        start_offset: start,
        end_offset: end,
        text: span_text.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paragraph_is_whole_text() {
        let text = "First paragraph.\n\nSecond paragraph.";
        let chunks = split(text, ChunkStrategy::Paragraph);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, text);
        assert_eq!(chunks[0].start_offset, 0);
        assert_eq!(chunks[0].end_offset, text.len());
    }

    #[test]
    fn test_empty_text_yields_no_chunks() {
        assert!(split("   \n  ", ChunkStrategy::Sentence).is_empty());
        assert!(split("", ChunkStrategy::Paragraph).is_empty());
    }

    #[test]
    fn test_offsets_slice_back_to_chunk_text() {
        let text = "One sentence here. Another follows! A third? Plus a trailing fragment";
        for strategy in [ChunkStrategy::Sentence, ChunkStrategy::Semantic] {
            for chunk in split(text, strategy) {
                assert_eq!(&text[chunk.start_offset..chunk.end_offset], chunk.text);
            }
        }
    }

    #[test]
    fn test_sentence_packing_respects_limit() {
        let sentence = "This sentence is about sixty characters long, give or take. ";
        let text = sentence.repeat(20);
        let chunks = split(&text, ChunkStrategy::Sentence);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.text.chars().count() <= SENTENCE_CHUNK_CHARS + sentence.len());
        }
        // Chunks are contiguous and ordered
        for pair in chunks.windows(2) {
            assert!(pair[0].end_offset <= pair[1].start_offset);
            assert_eq!(pair[0].index + 1, pair[1].index);
        }
    }

    #[test]
    fn test_semantic_splits_on_blank_lines_and_headings() {
        let text = "# Title\n\nFirst block line one.\nLine two.\n\nSecond block.";
        let chunks = split(text, ChunkStrategy::Semantic);
        assert!(!chunks.is_empty());
        for chunk in &chunks {
            assert_eq!(&text[chunk.start_offset..chunk.end_offset], chunk.text);
        }
        assert!(chunks[0].text.contains("# Title"));
    }

    #[test]
    fn test_long_single_sentence_stays_whole() {
        let text = "word ".repeat(300);
        let chunks = split(&text, ChunkStrategy::Sentence);
        assert_eq!(chunks.len(), 1);
    }
}
