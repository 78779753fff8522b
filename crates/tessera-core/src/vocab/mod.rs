//! Vocabulary Engine
//!
//! Curates the relationship-type registry: builtin seeds, probabilistic
//! category classification, measured semantic roles, and synonym
//! consolidation with grounded merge decisions.

pub mod builtin;
pub mod classify;
pub mod consolidate;
pub mod registry;
pub mod roles;
mod types;

pub use builtin::{BUILTIN_TYPES, BuiltinType, install_builtin_vocab};
pub use classify::{CategoryClassification, classify, run_classification};
pub use consolidate::{ConsolidateOutcome, ConsolidateReport, VocabConsolidator};
pub use registry::{VOCAB_CHANGE_COUNTER, VocabRegistry, VocabSnapshot};
pub use roles::{measure_roles, role_from_stats};
pub use types::{Category, GroundingStats, SemanticRole, VocabType};
