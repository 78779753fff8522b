//! Ingestion
//!
//! Document intake: markdown preprocessing, overlapping word chunking, and
//! the extract-embed-upsert pipeline executed by job workers.

mod chunker;
mod pipeline;
mod preprocess;

pub use chunker::{IngestChunk, chunk_words};
pub use pipeline::{IngestAnalysis, IngestPipeline, IngestReport, IngestRequest};
pub use preprocess::Preprocessor;
