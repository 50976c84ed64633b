//! Embedding generation backends.
//!
//! The index only talks to the [`Embedder`] trait. Two implementations exist:
//! - [`crate::semantic::ollama::OllamaClient`]: remote inference over HTTP
//! - [`LocalEmbedder`]: in-process fastembed model (feature `local-embeddings`)

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Inference backend unreachable: {0}")]
    Unreachable(String),

    #[error("Inference backend returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Invalid embedding response: {0}")]
    InvalidResponse(String),

    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),
}

impl EmbeddingError {
    /// Whether the failure means the backend could not be reached at all.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, EmbeddingError::Unreachable(_))
    }
}

/// Turns text into a vector.
pub trait Embedder: Send + Sync {
    /// Generate an embedding for `text` with `model`.
    fn generate(&self, text: &str, model: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Cheap round-trip proving the backend is reachable.
    fn test_connection(&self) -> bool;
}

#[cfg(feature = "local-embeddings")]
pub use local::LocalEmbedder;

#[cfg(feature = "local-embeddings")]
mod local {
    use fastembed::{InitOptions, TextEmbedding};
    use std::path::PathBuf;
    use std::sync::Mutex;

    use super::{Embedder, EmbeddingError};

    /// Wrapper around fastembed's TextEmbedding model.
    /// Uses a Mutex because fastembed's embed() requires &mut self.
    pub struct LocalEmbedder {
        model: Mutex<TextEmbedding>,
        model_name: String,
        dimensions: usize,
    }

    impl LocalEmbedder {
        /// Load (downloading on first use) the named model into `cache_dir`.
        pub fn new(model_name: &str, cache_dir: PathBuf) -> Result<Self, EmbeddingError> {
            let model_enum = Self::parse_model_name(model_name)?;

            std::fs::create_dir_all(&cache_dir).map_err(|e| {
                EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
            })?;

            let options = InitOptions::new(model_enum)
                .with_cache_dir(cache_dir)
                .with_show_download_progress(true);

            let mut model = TextEmbedding::try_new(options)
                .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

            let dimensions = Self::probe_dimensions(&mut model)?;

            Ok(Self {
                model: Mutex::new(model),
                model_name: model_name.to_string(),
                dimensions,
            })
        }

        pub fn name(&self) -> &str {
            &self.model_name
        }

        pub fn dimensions(&self) -> usize {
            self.dimensions
        }

        fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
            match name.to_lowercase().as_str() {
                "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
                "all-minilm-l6-v2-q" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2Q),
                "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
                "bge-small-en-v1.5-q" => Ok(fastembed::EmbeddingModel::BGESmallENV15Q),
                "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
                "bge-base-en-v1.5-q" => Ok(fastembed::EmbeddingModel::BGEBaseENV15Q),
                "nomic-embed-text" | "nomic-embed-text-v1.5" => {
                    Ok(fastembed::EmbeddingModel::NomicEmbedTextV15)
                }
                _ => Err(EmbeddingError::InvalidModel(format!(
                    "Unknown local model: {}. Supported models: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5, nomic-embed-text (add -q suffix for quantized MiniLM/BGE)",
                    name
                ))),
            }
        }

        fn probe_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
            let test_embeddings = model.embed(vec!["test"], None).map_err(|e| {
                EmbeddingError::InitFailed(format!("Failed to probe dimensions: {}", e))
            })?;

            test_embeddings
                .first()
                .map(|v| v.len())
                .ok_or_else(|| EmbeddingError::InitFailed("Model returned no embedding".to_string()))
        }
    }

    impl Embedder for LocalEmbedder {
        fn generate(&self, text: &str, model: &str) -> Result<Vec<f32>, EmbeddingError> {
            if !model.eq_ignore_ascii_case(&self.model_name) {
                return Err(EmbeddingError::InvalidModel(format!(
                    "local backend loaded {}, asked for {}",
                    self.model_name, model
                )));
            }

            let mut model = self.model.lock().map_err(|e| {
                EmbeddingError::InvalidResponse(format!("Failed to acquire model lock: {}", e))
            })?;

            let embeddings = model
                .embed(vec![text], None)
                .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;

            embeddings
                .into_iter()
                .next()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| EmbeddingError::InvalidResponse("No embedding returned".to_string()))
        }

        fn test_connection(&self) -> bool {
            true
        }
    }

}
