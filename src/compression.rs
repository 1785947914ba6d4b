//! Chunk compression settings: byte shuffle followed by a general-purpose compressor
//!
//! The codecs themselves are the `zarrs` implementations. This module only describes
//! which pipeline a store should use, and each [`FormatStrategy`](crate::format::FormatStrategy)
//! maps the description onto its own codec metadata.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Compression methods available for chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    /// No compression
    None,
    /// Zstandard compression
    Zstd,
    /// Gzip (deflate with gzip framing)
    Gzip,
    /// Zlib (deflate with zlib framing)
    Zlib,
}

impl CompressionMethod {
    /// Parse a method name as used in configuration files and CLI flags
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "none" => Some(CompressionMethod::None),
            "zstd" => Some(CompressionMethod::Zstd),
            "gzip" => Some(CompressionMethod::Gzip),
            "zlib" => Some(CompressionMethod::Zlib),
            _ => None,
        }
    }
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompressionMethod::None => "none",
            CompressionMethod::Zstd => "zstd",
            CompressionMethod::Gzip => "gzip",
            CompressionMethod::Zlib => "zlib",
        };
        f.write_str(name)
    }
}

/// Compression level; interpreted per method (zstd 1-22, deflate 0-9)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionLevel(i32);

impl CompressionLevel {
    pub fn new(level: i32) -> Self {
        Self(level)
    }

    pub fn fast() -> Self {
        Self(1)
    }

    pub fn value(&self) -> i32 {
        self.0
    }

    pub(crate) fn zstd(&self) -> i32 {
        self.0.clamp(1, 22)
    }

    pub(crate) fn flate(&self) -> u32 {
        self.0.clamp(0, 9) as u32
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(3)
    }
}

/// The per-chunk codec pipeline: optional byte shuffle, then a compressor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkCodec {
    pub shuffle: bool,
    pub compression: CompressionMethod,
    pub level: CompressionLevel,
}

impl ChunkCodec {
    pub fn new(compression: CompressionMethod, level: CompressionLevel) -> Self {
        Self {
            shuffle: true,
            compression,
            level,
        }
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// Short description for logs, e.g. `shuffle+zstd(3)`
    pub fn summary(&self) -> String {
        let compressor = match self.compression {
            CompressionMethod::None => "none".to_string(),
            method => format!("{}({})", method, self.level.value()),
        };
        if self.shuffle {
            format!("shuffle+{}", compressor)
        } else {
            compressor
        }
    }
}

impl Default for ChunkCodec {
    fn default() -> Self {
        Self::new(CompressionMethod::Zstd, CompressionLevel::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_codec() {
        let codec = ChunkCodec::default();
        assert!(codec.shuffle);
        assert_eq!(codec.compression, CompressionMethod::Zstd);
        assert_eq!(codec.level.value(), 3);
        assert_eq!(codec.summary(), "shuffle+zstd(3)");
        assert_eq!(
            ChunkCodec::new(CompressionMethod::None, CompressionLevel::fast())
                .with_shuffle(false)
                .summary(),
            "none"
        );
    }

    #[test]
    fn test_level_clamping() {
        assert_eq!(CompressionLevel::new(99).zstd(), 22);
        assert_eq!(CompressionLevel::new(0).zstd(), 1);
        assert_eq!(CompressionLevel::new(-4).flate(), 0);
        assert_eq!(CompressionLevel::new(12).flate(), 9);
    }

    #[test]
    fn test_method_names() {
        assert_eq!(CompressionMethod::from_name("ZSTD"), Some(CompressionMethod::Zstd));
        assert_eq!(CompressionMethod::from_name("lz4"), None);
        assert_eq!(CompressionMethod::Gzip.to_string(), "gzip");
    }
}
