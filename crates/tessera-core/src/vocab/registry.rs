//! Vocabulary Registry
//!
//! Read-mostly snapshot of the active relationship types. Readers get a
//! cheap `Arc` clone of a consistent snapshot; every write path reloads the
//! snapshot and bumps the generation counter, which is what the polarity
//! axis cache keys on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::Utc;

use crate::error::{EngineError, Result};
use crate::storage::GraphStore;
use crate::vocab::{Category, SemanticRole, VocabType};

/// Meta counter tracking vocabulary-affecting events
pub const VOCAB_CHANGE_COUNTER: &str = "vocab_change_counter";

/// Immutable snapshot of the registry at one generation
#[derive(Debug, Clone)]
pub struct VocabSnapshot {
    types: HashMap<String, VocabType>,
    generation: u64,
}

impl VocabSnapshot {
    /// Look up a type by name
    pub fn get(&self, name: &str) -> Option<&VocabType> {
        self.types.get(name)
    }

    /// All types in the snapshot
    pub fn types(&self) -> impl Iterator<Item = &VocabType> {
        self.types.values()
    }

    /// Names of active types
    pub fn active_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .types
            .values()
            .filter(|vt| vt.is_active)
            .map(|vt| vt.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Whether a type exists and is active
    pub fn is_active(&self, name: &str) -> bool {
        self.types.get(name).map(|vt| vt.is_active).unwrap_or(false)
    }

    /// Embedding of a type, when present
    pub fn embedding_of(&self, name: &str) -> Option<&[f32]> {
        self.types
            .get(name)
            .and_then(|vt| vt.embedding.as_deref())
    }

    /// Generation this snapshot was taken at
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of active types
    pub fn active_count(&self) -> usize {
        self.types.values().filter(|vt| vt.is_active).count()
    }
}

/// Process-wide vocabulary registry
pub struct VocabRegistry {
    store: Arc<GraphStore>,
    snapshot: RwLock<Arc<VocabSnapshot>>,
    generation: AtomicU64,
}

impl VocabRegistry {
    /// Load the registry from the store
    pub fn new(store: Arc<GraphStore>) -> Result<Self> {
        let registry = Self {
            store,
            snapshot: RwLock::new(Arc::new(VocabSnapshot {
                types: HashMap::new(),
                generation: 0,
            })),
            generation: AtomicU64::new(0),
        };
        registry.reload()?;
        Ok(registry)
    }

    /// Current consistent snapshot
    pub fn snapshot(&self) -> Arc<VocabSnapshot> {
        self.snapshot
            .read()
            .expect("vocab snapshot lock poisoned")
            .clone()
    }

    /// Current generation; bumps on every reload
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Rebuild the snapshot from the store and bump the generation
    pub fn reload(&self) -> Result<u64> {
        let types: HashMap<String, VocabType> = self
            .store
            .list_vocab_types(false)?
            .into_iter()
            .map(|vt| (vt.name.clone(), vt))
            .collect();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let mut guard = self
            .snapshot
            .write()
            .expect("vocab snapshot lock poisoned");
        *guard = Arc::new(VocabSnapshot { types, generation });
        Ok(generation)
    }

    /// Record vocabulary-affecting events for the re-measure launcher
    pub fn note_change(&self, events: i64) -> Result<i64> {
        self.store.meta_incr(VOCAB_CHANGE_COUNTER, events)
    }

    /// Pending vocabulary-affecting events since the last role measurement
    pub fn pending_changes(&self) -> Result<i64> {
        self.store.meta_i64(VOCAB_CHANGE_COUNTER)
    }

    /// Reset the change counter after a role measurement run
    pub fn reset_changes(&self) -> Result<()> {
        self.store.meta_set(VOCAB_CHANGE_COUNTER, "0")
    }

    /// Register a curator-defined relationship type
    ///
    /// The name must be a non-empty uppercase identifier not already taken.
    pub fn register_custom(&self, name: &str, description: &str) -> Result<VocabType> {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(EngineError::Conflict(format!(
                "vocabulary names are uppercase identifiers, got {:?}",
                name
            )));
        }
        if self.store.get_vocab_type(name)?.is_some() {
            return Err(EngineError::Conflict(format!(
                "vocabulary type {} already exists",
                name
            )));
        }

        let now = Utc::now();
        let vocab_type = VocabType {
            name: name.to_string(),
            description: description.to_string(),
            category: Category::Semantic,
            category_confidence: 0.0,
            ambiguous: false,
            runner_up_category: None,
            is_builtin: false,
            is_active: true,
            usage_count: 0,
            embedding: None,
            embedding_dimension: None,
            embedding_model: None,
            semantic_role: SemanticRole::Unclassified,
            grounding_stats: None,
            created_at: now,
            updated_at: now,
        };
        self.store.upsert_vocab_type(&vocab_type)?;
        self.note_change(1)?;
        self.reload()?;
        Ok(vocab_type)
    }

    /// Deactivate a type; its edges stay but new ones are rejected
    pub fn deactivate(&self, name: &str) -> Result<()> {
        self.store.set_vocab_active(name, false)?;
        self.note_change(1)?;
        self.reload()?;
        Ok(())
    }

    /// Reactivate a type
    pub fn activate(&self, name: &str) -> Result<()> {
        self.store.set_vocab_active(name, true)?;
        self.note_change(1)?;
        self.reload()?;
        Ok(())
    }
}
