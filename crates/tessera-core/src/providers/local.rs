//! Local Embedding Backend
//!
//! Fully local inference through fastembed (ONNX). No API calls, no keys.
//!
//! The model is process-global: fastembed initialization is expensive and
//! the engine serializes inference per device anyway. Requested dimensions
//! below the model's native 768 use Matryoshka truncation.

use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

use crate::embeddings::device::{self, Device};
use crate::error::{EngineError, Result};
use crate::providers::{EmbeddingOutput, EmbeddingProvider};

/// Native output dimension of nomic-embed-text-v1.5
const NATIVE_DIMENSIONS: usize = 768;

/// Model identifier reported in embedding metadata
const MODEL_NAME: &str = "nomic-embed-text-v1.5";

static EMBEDDING_MODEL_RESULT: OnceLock<std::result::Result<Mutex<TextEmbedding>, String>> =
    OnceLock::new();

/// Cache directory for downloaded model files
///
/// `TESSERA_MODEL_CACHE` overrides; otherwise the platform cache directory.
fn model_cache_dir() -> std::path::PathBuf {
    if let Ok(path) = std::env::var("TESSERA_MODEL_CACHE") {
        return std::path::PathBuf::from(path);
    }
    if let Some(proj_dirs) = directories::ProjectDirs::from("io", "tessera", "core") {
        return proj_dirs.cache_dir().join("fastembed");
    }
    std::path::PathBuf::from(".tessera_model_cache")
}

fn get_model() -> Result<std::sync::MutexGuard<'static, TextEmbedding>> {
    let result = EMBEDDING_MODEL_RESULT.get_or_init(|| {
        let cache_dir = model_cache_dir();
        if let Err(e) = std::fs::create_dir_all(&cache_dir) {
            tracing::warn!("failed to create model cache dir {:?}: {}", cache_dir, e);
        }

        let options = InitOptions::new(EmbeddingModel::NomicEmbedTextV15)
            .with_show_download_progress(false)
            .with_cache_dir(cache_dir);

        TextEmbedding::try_new(options)
            .map(Mutex::new)
            .map_err(|e| format!("failed to initialize {}: {}", MODEL_NAME, e))
    });

    match result {
        Ok(model) => model
            .lock()
            .map_err(|e| EngineError::Internal(format!("model lock poisoned: {}", e))),
        Err(err) => Err(EngineError::ProviderUnavailable(err.clone())),
    }
}

/// Local embedding provider backed by fastembed
pub struct LocalEmbeddingProvider {
    dimension: usize,
    min_free_device_memory: u64,
}

impl LocalEmbeddingProvider {
    /// Create a provider producing vectors of the given dimension
    ///
    /// Dimensions above the model's native 768 are rejected.
    pub fn new(dimension: usize, min_free_device_memory: u64) -> Result<Self> {
        if dimension == 0 || dimension > NATIVE_DIMENSIONS {
            return Err(EngineError::DimensionMismatch {
                expected: NATIVE_DIMENSIONS,
                actual: dimension,
            });
        }
        Ok(Self {
            dimension,
            min_free_device_memory,
        })
    }

    fn truncate(&self, mut vector: Vec<f32>) -> Vec<f32> {
        // Matryoshka truncation: the first N dims are the N-dim representation
        vector.truncate(self.dimension);
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for LocalEmbeddingProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn embed(&self, text: &str) -> Result<EmbeddingOutput> {
        let batch = self.embed_batch(&[text.to_string()]).await?;
        batch
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::Internal("empty embedding batch".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<EmbeddingOutput>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        // One device decision per batch, never mid-batch
        let dev = device::select_device(self.min_free_device_memory);
        tracing::debug!(device = %dev, batch = texts.len(), "embedding batch");
        if dev == Device::Cpu {
            device::warn_cpu_fallback_once();
        }

        let inputs: Vec<String> = texts.to_vec();
        let dimension = self.dimension;
        let raw = tokio::task::spawn_blocking(move || -> Result<Vec<Vec<f32>>> {
            let mut model = get_model()?;
            model
                .embed(inputs, None)
                .map_err(|e| EngineError::ProviderUnavailable(format!("inference failed: {}", e)))
        })
        .await
        .map_err(|e| EngineError::Internal(format!("embedding task panicked: {}", e)))??;

        Ok(raw
            .into_iter()
            .map(|vector| EmbeddingOutput {
                vector: self.truncate(vector),
                model: MODEL_NAME.to_string(),
                dimension,
            })
            .collect())
    }
}
