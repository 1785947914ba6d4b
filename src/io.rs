//! Storage backends for stores

use crate::error::{ConvertError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zarrs::filesystem::FilesystemStore;

/// Storage backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Local file system
    FileSystem,
    /// S3-compatible object storage (reached only through an external uploader)
    S3,
}

impl StorageBackend {
    /// Parse storage backend from URL scheme
    pub fn from_url(url: &str) -> Result<Self> {
        if let Some(scheme_end) = url.find("://") {
            let scheme = &url[..scheme_end];
            match scheme {
                "file" => Ok(StorageBackend::FileSystem),
                "s3" => Ok(StorageBackend::S3),
                _ => Err(ConvertError::InvalidUrl(format!("Unknown scheme: {}", scheme))),
            }
        } else {
            // Assume file system if no scheme
            Ok(StorageBackend::FileSystem)
        }
    }
}

/// Local directory a store URL points at
///
/// Only filesystem destinations are written directly. Object storage is reached by
/// handing a finished local store to an [`Uploader`](crate::upload::Uploader).
pub fn store_root(url: &str) -> Result<PathBuf> {
    match StorageBackend::from_url(url)? {
        StorageBackend::FileSystem => Ok(PathBuf::from(url.strip_prefix("file://").unwrap_or(url))),
        StorageBackend::S3 => Err(ConvertError::Configuration(format!(
            "Stores are written locally; convert to a local path and hand it to an uploader \
            instead of writing to {}",
            url
        ))),
    }
}

/// `zarrs` filesystem storage rooted at `root`; the directory is created on first write
pub fn open_filesystem_store(root: &Path) -> Result<Arc<FilesystemStore>> {
    Ok(Arc::new(FilesystemStore::new(root)?))
}
