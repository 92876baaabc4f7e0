//! Stream configuration.
//!
//! Every field has a default, so a TOML file only needs the values it
//! changes:
//!
//! ```toml
//! chunk_size = 16384
//! compression = false
//!
//! [retry.simple]
//! max_retries = 5
//! backoff_ms = 200
//! ```

use crate::error::{Result, StreamError};
use crate::framing::DEFAULT_COMPRESSION_LEVEL;
use crate::retry::RetryPolicy;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Target packet size for the input direction.
pub const DEFAULT_CHUNK_SIZE: usize = 7 * 1024;

/// Target packet size for the output direction.
pub const DEFAULT_OUTPUT_CHUNK_SIZE: usize = 4 * 1024;

/// Bounded queue depth between an object producer and the stream.
pub const DEFAULT_PIPE_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub chunk_size: usize,
    /// The compressed output server transfers through a buffer twice this size.
    pub output_chunk_size: usize,
    pub compression: bool,
    pub compression_level: i32,
    /// Release packets as soon as data exists. Ignored when compressing.
    pub no_delay: bool,
    pub retry: RetryPolicy,
    pub pipe_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            output_chunk_size: DEFAULT_OUTPUT_CHUNK_SIZE,
            compression: true,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            no_delay: false,
            retry: RetryPolicy::default(),
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
        }
    }
}

impl StreamConfig {
    /// Defaults with compression switched off.
    pub fn uncompressed() -> Self {
        Self {
            compression: false,
            ..Self::default()
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    /// `no_delay` as actually applied.
    pub fn effective_no_delay(&self) -> bool {
        self.no_delay && !self.compression
    }

    /// Size of the compressed output server's transfer buffer.
    pub fn output_transfer_size(&self) -> usize {
        self.output_chunk_size.saturating_mul(2)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(StreamError::Config("chunk_size must be positive".into()));
        }
        if self.output_chunk_size == 0 {
            return Err(StreamError::Config(
                "output_chunk_size must be positive".into(),
            ));
        }
        if self.pipe_capacity == 0 {
            return Err(StreamError::Config("pipe_capacity must be positive".into()));
        }
        let levels = zstd::compression_level_range();
        if !levels.contains(&self.compression_level) {
            return Err(StreamError::Config(format!(
                "compression_level {} outside {}..={}",
                self.compression_level,
                levels.start(),
                levels.end()
            )));
        }
        Ok(())
    }

    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text).context("Failed to parse stream config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("Invalid config in {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = StreamConfig::default();
        assert_eq!(config.chunk_size, 7168);
        assert_eq!(config.output_transfer_size(), 8192);
        assert!(config.compression);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_no_delay_overridden_by_compression() {
        let config = StreamConfig::default().with_no_delay(true);
        assert!(!config.effective_no_delay());
        assert!(StreamConfig::uncompressed()
            .with_no_delay(true)
            .effective_no_delay());
    }

    #[test]
    fn test_partial_toml() {
        let config = StreamConfig::from_toml_str(
            r#"
            chunk_size = 1024
            compression = false

            [retry.simple]
            max_retries = 5
            backoff_ms = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.chunk_size, 1024);
        assert!(!config.compression);
        assert_eq!(config.pipe_capacity, DEFAULT_PIPE_CAPACITY);
        assert_eq!(
            config.retry,
            RetryPolicy::Simple {
                max_retries: 5,
                backoff_ms: 10
            }
        );
    }

    #[test]
    fn test_rejects_zero_sizes() {
        assert!(StreamConfig::from_toml_str("chunk_size = 0").is_err());
        assert!(StreamConfig::from_toml_str("pipe_capacity = 0").is_err());
        assert!(StreamConfig::from_toml_str("compression_level = 1000").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "output_chunk_size = 100").unwrap();
        let config = StreamConfig::load(file.path()).unwrap();
        assert_eq!(config.output_transfer_size(), 200);

        let missing = StreamConfig::load("/nonexistent/ferry.toml").unwrap_err();
        assert!(missing.to_string().contains("Failed to read config file"));
    }
}
