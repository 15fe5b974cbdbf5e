use config::{Config, Environment, File as ConfigFile};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::chunker::ChunkConfig;
use crate::error::{Error, Result};

pub type Number = f32;

pub const EPSILON: f32 = 1e-6;

/// Base name of the optional config file; any format the `config` crate
/// recognises (`vekta_config.toml`, `.json`, `.yaml`) is picked up.
pub const CONFIG_FILE: &str = "vekta_config";

pub const ENV_PREFIX: &str = "VEKTA";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    pub storage_path: PathBuf,
    pub upload_dir: PathBuf,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub embedding_batch_size: usize,
    pub top_k: usize,
    pub similarity_threshold: f32,
    pub max_file_size: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./data/vector_store"),
            upload_dir: PathBuf::from("./data/uploads"),
            chunk_size: 256,
            chunk_overlap: 200,
            embedding_model: "hashing".to_string(),
            embedding_dimension: 384,
            embedding_batch_size: 32,
            top_k: 5,
            similarity_threshold: 0.0,
            max_file_size: 10 * 1024 * 1024,
        }
    }
}

impl Settings {
    /// Layer defaults, `vekta_config.*` and `VEKTA_*` environment variables.
    pub fn load() -> Result<Self> {
        Self::load_from(CONFIG_FILE)
    }

    pub fn load_from(file_name: &str) -> Result<Self> {
        let defaults = Settings::default();
        let config = Config::builder()
            .set_default("storage_path", defaults.storage_path.to_string_lossy().as_ref())
            .and_then(|b| b.set_default("upload_dir", defaults.upload_dir.to_string_lossy().as_ref()))
            .and_then(|b| b.set_default("chunk_size", defaults.chunk_size as i64))
            .and_then(|b| b.set_default("chunk_overlap", defaults.chunk_overlap as i64))
            .and_then(|b| b.set_default("embedding_model", defaults.embedding_model.as_str()))
            .and_then(|b| b.set_default("embedding_dimension", defaults.embedding_dimension as i64))
            .and_then(|b| b.set_default("embedding_batch_size", defaults.embedding_batch_size as i64))
            .and_then(|b| b.set_default("top_k", defaults.top_k as i64))
            .and_then(|b| b.set_default("similarity_threshold", f64::from(defaults.similarity_threshold)))
            .and_then(|b| b.set_default("max_file_size", defaults.max_file_size as i64))
            .map_err(|e| Error::Config(e.to_string()))?
            .add_source(ConfigFile::with_name(file_name).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        let settings: Settings = config
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.embedding_dimension == 0 {
            return Err(Error::Config("embedding_dimension must be > 0".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be > 0".to_string()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(Error::Config(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.embedding_batch_size == 0 {
            return Err(Error::Config("embedding_batch_size must be > 0".to_string()));
        }
        if self.top_k == 0 {
            return Err(Error::Config("top_k must be > 0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(Error::Config(format!(
                "similarity_threshold must be within [0, 1], got {}",
                self.similarity_threshold
            )));
        }
        Ok(())
    }

    pub fn chunk_config(&self) -> ChunkConfig {
        ChunkConfig {
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
        }
    }

    pub fn print_config(&self) {
        println!("storage_path={}", self.storage_path.display());
        println!("upload_dir={}", self.upload_dir.display());
        println!("chunk_size={}", self.chunk_size);
        println!("chunk_overlap={}", self.chunk_overlap);
        println!("embedding_model={}", self.embedding_model);
        println!("embedding_dimension={}", self.embedding_dimension);
        println!("embedding_batch_size={}", self.embedding_batch_size);
        println!("top_k={}", self.top_k);
        println!("similarity_threshold={}", self.similarity_threshold);
        println!("max_file_size={}", self.max_file_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn test_overlap_not_smaller_than_size_rejected() {
        let settings = Settings {
            chunk_size: 100,
            chunk_overlap: 100,
            ..Settings::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("chunk_overlap"));
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let settings = Settings {
            similarity_threshold: 1.5,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("settings");
        fs::write(
            dir.path().join("settings.toml"),
            "chunk_size = 512\nchunk_overlap = 64\nstorage_path = \"/tmp/vekta-index\"\n",
        )
        .unwrap();

        let settings = Settings::load_from(base.to_str().unwrap()).unwrap();

        assert_eq!(settings.chunk_size, 512);
        assert_eq!(settings.chunk_overlap, 64);
        assert_eq!(settings.storage_path, PathBuf::from("/tmp/vekta-index"));
        assert_eq!(settings.embedding_model, "hashing");
    }

    #[test]
    fn test_load_from_invalid_file_fails_validation() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("broken");
        fs::write(
            dir.path().join("broken.toml"),
            "chunk_size = 50\nchunk_overlap = 80\n",
        )
        .unwrap();

        assert!(matches!(
            Settings::load_from(base.to_str().unwrap()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_chunk_config_mirrors_settings() {
        let settings = Settings::default();
        let chunk = settings.chunk_config();
        assert_eq!(chunk.chunk_size, 256);
        assert_eq!(chunk.chunk_overlap, 200);
    }
}
