//! # Tessera Core
//!
//! Knowledge graph engine with probabilistic semantic grounding:
//!
//! - **Property Graph**: dedup-merged concepts, ontology-scoped sources,
//!   quote-level evidence instances, typed edges from a curated vocabulary
//! - **Vector Embeddings**: one dimension D system-wide, HNSW indexes per
//!   namespace (USearch), hash-verified source chunks
//! - **Grounding**: a scalar in [-1, 1] per concept from projecting its
//!   incoming edge types onto the vocabulary polarity axis
//! - **Polarity Queries**: the same projection math between arbitrary
//!   concept poles, with correlation statistics
//! - **Self-Organization**: probabilistic vocabulary classification,
//!   measured semantic roles, synonym consolidation, ontology annealing
//! - **Durable Jobs**: SQLite-backed queue with an explicit state machine,
//!   approval gating, a single-leader scheduler and conditional launchers
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tessera_core::{EngineOptions, KnowledgeEngine, IngestRequest};
//!
//! let engine = KnowledgeEngine::open(options).await?;
//! engine.initialize_builtin_vocab().await?;
//!
//! let job = engine.submit_ingest(IngestRequest {
//!     ontology: "research".into(),
//!     document: "paper.md".into(),
//!     text: markdown,
//!     markdown: true,
//!     ..Default::default()
//! })?;
//!
//! let hits = engine.search_concepts("recursion", 10, None, None, 0).await?;
//! ```
//!
//! ## Feature Flags
//!
//! - `bundled-sqlite` (default): compile SQLite into the binary
//! - `local-embeddings`: fully local embedding backend via fastembed
//! - `metal`: Apple Silicon acceleration for the local backend

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod annealing;
pub mod api;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod graph;
pub mod grounding;
pub mod ingest;
pub mod jobs;
pub mod providers;
pub mod search;
pub mod storage;
pub mod vocab;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Facade
pub use api::{
    BackgroundHandles, ConceptDetails, ConsolidationOutcome, EngineOptions, KnowledgeEngine,
};

// Errors
pub use error::{EngineError, Result};

// Graph entities
pub use graph::{
    ChunkStrategy, Concept, ConceptSeed, Instance, Ontology, Relationship, SkippedRelationship,
    Source, SourceChunk, UpsertOutcome,
};

// Storage
pub use storage::{EngineStats, GraphStore, KeyRecord, KeyValidationStatus, RelationshipFilter};

// Configuration
pub use config::{
    AiProviderConfig, AutomationLevel, ConfigRegistry, EmbeddingConfig, EngineSettings, Precision,
    default_polarity_pairs, secrets::SecretStore,
};

// Providers
pub use providers::{
    BlockKind, ConceptProposal, Decision, DecisionContext, EmbeddingOutput, EmbeddingProvider,
    ExtractionResult, ProviderCapability, ReasoningProvider, RelationshipProposal, RetryPolicy,
};

// Embeddings
pub use embeddings::{
    CoverageReport, Embedding, EmbeddingService, NamespaceCoverage, RegenReport, RegenScope,
    cosine_similarity, dot_product,
};

// Vocabulary
pub use vocab::{
    Category, ConsolidateReport, GroundingStats, SemanticRole, VocabRegistry, VocabType,
    install_builtin_vocab,
};

// Grounding & polarity
pub use grounding::{
    AxisQuality, Direction, GroundingEngine, PolarityAnalysis, PolarityOptions, PolarityQuery,
};

// Search & traversal
pub use search::{
    ConceptSearchResult, Neighborhood, PathResult, SearchApi, SourceSearchResult,
};

// Ingestion
pub use ingest::{IngestAnalysis, IngestPipeline, IngestReport, IngestRequest};

// Jobs & scheduling
pub use jobs::{
    CancelFlag, Job, JobEvent, JobQueue, JobSpec, JobStatus, JobType, JobWorker, Scheduler,
};

// Annealing
pub use annealing::{AnnealingManager, AnnealingProposal, AnnealingReport, ProposalStatus};
