//! TOML configuration files
//!
//! Every setting is optional; anything left out keeps its default, and command-line
//! flags override the file:
//!
//! ```toml
//! # wavezarr.toml
//! [conversion]
//! chunk_length = 5000000
//! compression = "zstd"
//! compression_level = 5
//! shuffle = true
//! format = "auto"
//! overview_buckets = 4000
//! concurrency = 4
//!
//! [upload]
//! mc_binary = "mc"
//! alias = "minio"
//! bucket = "waveforms"
//! keep_local = false
//! ```

use crate::compression::{CompressionLevel, CompressionMethod};
use crate::convert::ConvertOptions;
use crate::error::{ConvertError, Result};
use crate::format::FormatPreference;
use crate::upload::McUploader;
use serde::Deserialize;
use std::path::Path;

/// Root of a `wavezarr.toml` file
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub conversion: ConversionConfig,

    #[serde(default)]
    pub upload: UploadConfig,
}

/// `[conversion]` table
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConversionConfig {
    /// Samples per raw chunk
    pub chunk_length: Option<usize>,
    pub compression: Option<CompressionMethod>,
    pub compression_level: Option<i32>,
    pub shuffle: Option<bool>,
    pub format: Option<FormatPreference>,
    pub overview_buckets: Option<usize>,
    /// Triples converted at once
    pub concurrency: Option<usize>,
}

/// `[upload]` table
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadConfig {
    /// MinIO client executable
    pub mc_binary: Option<String>,
    /// Configured `mc` alias of the object store
    pub alias: Option<String>,
    pub bucket: Option<String>,
    pub keep_local: Option<bool>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConvertError::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| ConvertError::Configuration(format!("invalid TOML configuration: {}", e)))
    }

    /// Conversion options with the file's settings applied over the defaults
    pub fn convert_options(&self) -> ConvertOptions {
        self.conversion.apply(ConvertOptions::default())
    }

    /// Defaults, then the file, then `overrides` (usually command-line flags)
    pub fn convert_options_with(&self, overrides: &ConversionConfig) -> ConvertOptions {
        overrides.apply(self.convert_options())
    }
}

impl ConversionConfig {
    /// Overlay the values present in the file onto `options`
    pub fn apply(&self, mut options: ConvertOptions) -> ConvertOptions {
        if let Some(chunk_length) = self.chunk_length {
            options.chunk_length = chunk_length;
        }
        if let Some(method) = self.compression {
            options.compression = method;
        }
        if let Some(level) = self.compression_level {
            options.level = CompressionLevel::new(level);
        }
        if let Some(shuffle) = self.shuffle {
            options.shuffle = shuffle;
        }
        if let Some(format) = self.format {
            options.format = format;
        }
        if let Some(buckets) = self.overview_buckets {
            options.overview_buckets = buckets;
        }
        if let Some(concurrency) = self.concurrency {
            options.concurrency = concurrency;
        }
        options
    }
}

impl UploadConfig {
    pub fn uploader(&self) -> McUploader {
        let mut uploader = McUploader::default();
        if let Some(binary) = &self.mc_binary {
            uploader = uploader.with_binary(binary.clone());
        }
        if let Some(alias) = &self.alias {
            uploader = uploader.with_alias(alias.clone());
        }
        uploader
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
            [conversion]
            chunk_length = 5000000
            compression = "gzip"
            compression_level = 7
            shuffle = false
            format = "v2"
            overview_buckets = 2000
            concurrency = 4

            [upload]
            mc_binary = "/usr/local/bin/mc"
            alias = "lab"
            bucket = "waveforms"
            keep_local = true
        "#;

        let config = Config::from_str(toml).unwrap();
        assert_eq!(config.conversion.chunk_length, Some(5_000_000));
        assert_eq!(config.conversion.compression, Some(CompressionMethod::Gzip));
        assert_eq!(config.upload.bucket.as_deref(), Some("waveforms"));
        assert_eq!(config.upload.keep_local, Some(true));

        let options = config.convert_options();
        assert_eq!(options.chunk_length, 5_000_000);
        assert_eq!(options.level, CompressionLevel::new(7));
        assert!(!options.shuffle);
        assert_eq!(options.format, FormatPreference::V2);
        assert_eq!(options.overview_buckets, 2000);
        assert_eq!(options.concurrency, 4);

        let uploader = config.upload.uploader();
        assert_eq!(uploader.binary(), "/usr/local/bin/mc");
        assert_eq!(uploader.alias(), "lab");
    }

    #[test]
    fn test_partial_config() {
        let toml = r#"
            [conversion]
            compression_level = 10
        "#;

        let config = Config::from_str(toml).unwrap();
        let options = config.convert_options();
        assert_eq!(options.level, CompressionLevel::new(10));
        assert_eq!(options.chunk_length, ConvertOptions::default().chunk_length);
        assert_eq!(config.upload.uploader().binary(), "mc");
    }

    #[test]
    fn test_overrides_win_over_file() {
        let config = Config::from_str("[conversion]\ncompression = \"gzip\"\nshuffle = false\nconcurrency = 4\n").unwrap();
        let overrides = ConversionConfig {
            compression: Some(CompressionMethod::Zstd),
            concurrency: Some(2),
            ..Default::default()
        };

        let options = config.convert_options_with(&overrides);
        assert_eq!(options.compression, CompressionMethod::Zstd);
        assert_eq!(options.concurrency, 2);
        assert!(!options.shuffle);
        assert_eq!(options.level, CompressionLevel::default());
        assert_eq!(
            config.convert_options_with(&ConversionConfig::default()),
            config.convert_options()
        );
    }

    #[test]
    fn test_empty_config() {
        let config = Config::from_str("").unwrap();
        assert_eq!(config.convert_options(), ConvertOptions::default());
    }

    #[test]
    fn test_rejects_unknown_keys() {
        assert!(matches!(
            Config::from_str("[conversion]\nchunk_size = 10\n"),
            Err(ConvertError::Configuration(_))
        ));
        assert!(Config::from_str("[conversion]\ncompression = \"lz4\"\n").is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("wavezarr.toml");
        std::fs::write(&path, "[conversion]\nconcurrency = 2\n").unwrap();
        assert_eq!(Config::from_file(&path).unwrap().convert_options().concurrency, 2);
        assert!(Config::from_file(&dir.path().join("missing.toml")).is_err());
    }
}
