use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use homedir::my_home;
use serde::{Deserialize, Serialize};

use crate::semantic::{ServiceConfig, DEFAULT_MODEL};

const CONFIG_FILE_NAME: &str = "config.yaml";

const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_RELEVANT_NOTES: usize = 5;
const DEFAULT_MIN_SIMILARITY: f32 = 0.1;
const DEFAULT_MAX_BATCH_ERRORS: usize = 10;
const DEFAULT_MAX_EMBEDDING_CHARS: usize = 512;
const DEFAULT_RESULT_EXCERPT_CHARS: usize = 500;
const DEFAULT_MODIFY_DEBOUNCE_SECS: u64 = 10;
const DEFAULT_SAVE_DEBOUNCE_SECS: u64 = 5;
const DEFAULT_THROTTLE_EVERY: usize = 3;
const DEFAULT_THROTTLE_PAUSE_MS: u64 = 200;
const DEFAULT_PROGRESS_EVERY: usize = 5;

/// Which embedder generates vectors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Ollama,
    Local,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: Backend,

    #[serde(default = "default_ollama_base_url")]
    pub ollama_base_url: String,
    #[serde(default)]
    pub ollama_auth_token: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Empty means no model selected
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Folders (relative to the notes root) excluded from indexing
    #[serde(default)]
    pub ignored_folders: Vec<String>,

    #[serde(default = "default_max_relevant_notes")]
    pub max_relevant_notes: usize,
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
    #[serde(default = "default_max_batch_errors")]
    pub max_batch_errors: usize,
    #[serde(default = "default_max_embedding_chars")]
    pub max_embedding_chars: usize,
    #[serde(default = "default_result_excerpt_chars")]
    pub result_excerpt_chars: usize,

    #[serde(default = "default_modify_debounce_secs")]
    pub modify_debounce_secs: u64,
    #[serde(default = "default_save_debounce_secs")]
    pub save_debounce_secs: u64,
    #[serde(default = "default_throttle_every")]
    pub throttle_every: usize,
    #[serde(default = "default_throttle_pause_ms")]
    pub throttle_pause_ms: u64,
    #[serde(default = "default_progress_every")]
    pub progress_every: usize,

    /// Model cache of the local backend, defaults to `<base_path>/models`
    #[serde(default)]
    pub models_dir: Option<PathBuf>,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            ollama_base_url: default_ollama_base_url(),
            ollama_auth_token: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            embedding_model: default_embedding_model(),
            ignored_folders: Vec::new(),
            max_relevant_notes: DEFAULT_MAX_RELEVANT_NOTES,
            min_similarity: DEFAULT_MIN_SIMILARITY,
            max_batch_errors: DEFAULT_MAX_BATCH_ERRORS,
            max_embedding_chars: DEFAULT_MAX_EMBEDDING_CHARS,
            result_excerpt_chars: DEFAULT_RESULT_EXCERPT_CHARS,
            modify_debounce_secs: DEFAULT_MODIFY_DEBOUNCE_SECS,
            save_debounce_secs: DEFAULT_SAVE_DEBOUNCE_SECS,
            throttle_every: DEFAULT_THROTTLE_EVERY,
            throttle_pause_ms: DEFAULT_THROTTLE_PAUSE_MS,
            progress_every: DEFAULT_PROGRESS_EVERY,
            models_dir: None,
            base_path: PathBuf::new(),
        }
    }
}

fn default_ollama_base_url() -> String {
    DEFAULT_OLLAMA_URL.to_string()
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_embedding_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_max_relevant_notes() -> usize {
    DEFAULT_MAX_RELEVANT_NOTES
}

fn default_min_similarity() -> f32 {
    DEFAULT_MIN_SIMILARITY
}

fn default_max_batch_errors() -> usize {
    DEFAULT_MAX_BATCH_ERRORS
}

fn default_max_embedding_chars() -> usize {
    DEFAULT_MAX_EMBEDDING_CHARS
}

fn default_result_excerpt_chars() -> usize {
    DEFAULT_RESULT_EXCERPT_CHARS
}

fn default_modify_debounce_secs() -> u64 {
    DEFAULT_MODIFY_DEBOUNCE_SECS
}

fn default_save_debounce_secs() -> u64 {
    DEFAULT_SAVE_DEBOUNCE_SECS
}

fn default_throttle_every() -> usize {
    DEFAULT_THROTTLE_EVERY
}

fn default_throttle_pause_ms() -> u64 {
    DEFAULT_THROTTLE_PAUSE_MS
}

fn default_progress_every() -> usize {
    DEFAULT_PROGRESS_EVERY
}

/// `$NOTEINDEX_BASE_PATH`, or `~/.local/share/noteindex`.
pub fn default_base_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("NOTEINDEX_BASE_PATH") {
        return Ok(PathBuf::from(path));
    }

    let home = my_home()
        .context("could not determine home directory")?
        .context("home directory path is empty")?;
    Ok(home.join(".local/share/noteindex"))
}

impl Config {
    fn validate(&self) -> Result<()> {
        if !(-1.0..=1.0).contains(&self.min_similarity) {
            bail!(
                "min_similarity must be between -1.0 and 1.0, got {}",
                self.min_similarity
            );
        }
        if self.max_relevant_notes == 0 {
            bail!("max_relevant_notes must be greater than 0");
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be greater than 0");
        }
        if self.throttle_every == 0 {
            bail!("throttle_every must be greater than 0");
        }
        if self.progress_every == 0 {
            bail!("progress_every must be greater than 0");
        }
        if self.max_embedding_chars == 0 {
            bail!("max_embedding_chars must be greater than 0");
        }

        Ok(())
    }

    /// Load `config.yaml` from `base_path`, writing defaults if it is missing.
    pub fn load_with(base_path: &Path) -> Result<Self> {
        let path = base_path.join(CONFIG_FILE_NAME);

        // create new if does not exist
        if !path.exists() {
            std::fs::create_dir_all(base_path)
                .with_context(|| format!("failed to create {}", base_path.display()))?;
            std::fs::write(&path, serde_yml::to_string(&Self::default())?)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }

        let config_str = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config: Self = serde_yml::from_str(&config_str)
            .with_context(|| format!("{} is malformed", path.display()))?;

        config.base_path = base_path.to_path_buf();
        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = self.base_path.join(CONFIG_FILE_NAME);
        let config_str = serde_yml::to_string(&self)?;
        std::fs::write(&path, config_str)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn models_dir(&self) -> PathBuf {
        self.models_dir
            .clone()
            .unwrap_or_else(|| self.base_path.join("models"))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn modify_debounce(&self) -> Duration {
        Duration::from_secs(self.modify_debounce_secs)
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            model: self.embedding_model.clone(),
            ignored_folders: self.ignored_folders.clone(),
            max_relevant_notes: self.max_relevant_notes,
            min_similarity: self.min_similarity,
            max_batch_errors: self.max_batch_errors,
            max_embedding_chars: self.max_embedding_chars,
            result_excerpt_chars: self.result_excerpt_chars,
            save_debounce: Duration::from_secs(self.save_debounce_secs),
            throttle_every: self.throttle_every,
            throttle_pause: Duration::from_millis(self.throttle_pause_ms),
            progress_every: self.progress_every,
            ..ServiceConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creates_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_with(dir.path()).unwrap();

        assert!(dir.path().join(CONFIG_FILE_NAME).exists());
        assert_eq!(config.backend, Backend::Ollama);
        assert_eq!(config.embedding_model, DEFAULT_MODEL);
        assert_eq!(config.max_batch_errors, 10);
        assert!((config.min_similarity - 0.1).abs() < f32::EPSILON);
        assert_eq!(config.models_dir(), dir.path().join("models"));
    }

    #[test]
    fn test_partial_config_gets_defaults_and_is_resaved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            "backend: local\nembedding_model: all-minilm-l6-v2\nignored_folders:\n  - templates\n",
        )
        .unwrap();

        let config = Config::load_with(dir.path()).unwrap();
        assert_eq!(config.backend, Backend::Local);
        assert_eq!(config.ignored_folders, vec!["templates".to_string()]);
        assert_eq!(config.modify_debounce(), Duration::from_secs(10));

        let saved = std::fs::read_to_string(&path).unwrap();
        assert!(saved.contains("save_debounce_secs"));

        let service = config.service_config();
        assert_eq!(service.model, "all-minilm-l6-v2");
        assert_eq!(service.throttle_pause, Duration::from_millis(200));
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        std::fs::write(&path, "min_similarity: 1.5\n").unwrap();
        assert!(Config::load_with(dir.path()).is_err());

        std::fs::write(&path, "max_relevant_notes: 0\n").unwrap();
        assert!(Config::load_with(dir.path()).is_err());

        std::fs::write(&path, "throttle_every: 0\n").unwrap();
        assert!(Config::load_with(dir.path()).is_err());
    }

    #[test]
    fn test_malformed_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "backend: [unclosed").unwrap();
        assert!(Config::load_with(dir.path()).is_err());
    }
}
