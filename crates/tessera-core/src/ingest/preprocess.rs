//! Markdown Preprocessing
//!
//! Parses markdown input and replaces code and diagram blocks with prose
//! descriptions from the reasoning provider (one call per block, bounded
//! by a small semaphore per document). Everything else passes through
//! unchanged; the serialized prose is what chunking sees.

use std::ops::Range;
use std::sync::Arc;

use pulldown_cmark::{CodeBlockKind, Event, Parser, Tag, TagEnd};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::{EngineError, Result};
use crate::providers::{BlockKind, ReasoningProvider, RetryPolicy, with_retries};

/// Fence languages treated as diagram notation
const DIAGRAM_LANGUAGES: &[&str] = &["mermaid", "dot", "graphviz", "plantuml", "d2"];

/// A fenced block found in the document
#[derive(Debug, Clone)]
struct FencedBlock {
    range: Range<usize>,
    kind: BlockKind,
    content: String,
}

/// Markdown preprocessor with bounded block-translation parallelism
pub struct Preprocessor {
    reasoning: Arc<dyn ReasoningProvider>,
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl Preprocessor {
    pub fn new(reasoning: Arc<dyn ReasoningProvider>, permits: usize) -> Self {
        Self {
            reasoning,
            permits: Arc::new(Semaphore::new(permits.max(1))),
            retry: RetryPolicy::default(),
        }
    }

    /// Replace code/diagram blocks with provider prose
    ///
    /// Non-markdown input (no fenced blocks) comes back unchanged.
    pub async fn preprocess(&self, text: &str) -> Result<String> {
        let blocks = find_fenced_blocks(text);
        if blocks.is_empty() {
            return Ok(text.to_string());
        }

        // One describe call per block, at most `permits` in flight
        let mut join_set: JoinSet<Result<(usize, String)>> = JoinSet::new();
        for (index, block) in blocks.iter().enumerate() {
            let reasoning = Arc::clone(&self.reasoning);
            let permits = Arc::clone(&self.permits);
            let retry = self.retry;
            let content = block.content.clone();
            let kind = block.kind.clone();
            join_set.spawn(async move {
                let _permit = permits
                    .acquire()
                    .await
                    .map_err(|_| EngineError::Internal("preprocess semaphore closed".into()))?;
                let prose = with_retries(&retry, "describe_block", || {
                    let reasoning = Arc::clone(&reasoning);
                    let content = content.clone();
                    let kind = kind.clone();
                    async move { reasoning.describe(&content, &kind).await }
                })
                .await?;
                Ok((index, prose))
            });
        }

        let mut descriptions: Vec<Option<String>> = vec![None; blocks.len()];
        while let Some(joined) = join_set.join_next().await {
            let (index, prose) =
                joined.map_err(|e| EngineError::Internal(format!("describe task panicked: {}", e)))??;
            descriptions[index] = Some(prose);
        }

        // Splice descriptions back in, front to back
        let mut output = String::with_capacity(text.len());
        let mut cursor = 0usize;
        for (block, description) in blocks.iter().zip(descriptions) {
            let description = description
                .ok_or_else(|| EngineError::Internal("missing block description".into()))?;
            output.push_str(&text[cursor..block.range.start]);
            output.push_str(description.trim());
            output.push('\n');
            cursor = block.range.end;
        }
        output.push_str(&text[cursor..]);
        Ok(output)
    }
}

/// Locate fenced code blocks with their byte ranges
fn find_fenced_blocks(text: &str) -> Vec<FencedBlock> {
    let mut blocks = Vec::new();
    let mut current: Option<(usize, BlockKind, String)> = None;

    for (event, range) in Parser::new(text).into_offset_iter() {
        match event {
            Event::Start(Tag::CodeBlock(kind)) => {
                let block_kind = match &kind {
                    CodeBlockKind::Fenced(lang) => {
                        let lang = lang.trim().to_lowercase();
                        if DIAGRAM_LANGUAGES.contains(&lang.as_str()) {
                            BlockKind::Diagram
                        } else {
                            BlockKind::Code {
                                language: (!lang.is_empty()).then_some(lang),
                            }
                        }
                    }
                    CodeBlockKind::Indented => BlockKind::Code { language: None },
                };
                current = Some((range.start, block_kind, String::new()));
            }
            Event::Text(chunk) => {
                if let Some((_, _, content)) = current.as_mut() {
                    content.push_str(&chunk);
                }
            }
            Event::End(TagEnd::CodeBlock) => {
                if let Some((start, kind, content)) = current.take() {
                    blocks.push(FencedBlock {
                        range: start..range.end,
                        kind,
                        content,
                    });
                }
            }
            _ => {}
        }
    }
    blocks
}
