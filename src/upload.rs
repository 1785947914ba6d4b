//! Handing finished stores to object storage

use crate::error::{ConvertError, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::path::Path;
use tokio::process::Command;

/// Where a local store goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub bucket: String,
    /// Object key prefix inside the bucket
    pub remote_key: String,
    /// Keep the local store after a successful upload
    pub keep_local: bool,
}

impl UploadRequest {
    pub fn new(bucket: impl Into<String>, remote_key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            remote_key: remote_key.into(),
            keep_local: false,
        }
    }

    pub fn with_keep_local(mut self, keep_local: bool) -> Self {
        self.keep_local = keep_local;
        self
    }
}

/// Copies a local directory tree to `bucket/remote_key`
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, local: &Path, bucket: &str, remote_key: &str) -> Result<()>;
}

/// Uploads through the MinIO client: `mc cp --recursive <local> <alias>/<bucket>/<key>/`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McUploader {
    binary: String,
    alias: String,
}

impl Default for McUploader {
    fn default() -> Self {
        Self {
            binary: "mc".to_string(),
            alias: "local".to_string(),
        }
    }
}

impl McUploader {
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Arguments passed to the client
    pub fn args(&self, local: &Path, bucket: &str, remote_key: &str) -> Vec<String> {
        vec![
            "cp".to_string(),
            "--recursive".to_string(),
            local.display().to_string(),
            format!("{}/{}/{}/", self.alias, bucket, remote_key),
        ]
    }
}

#[async_trait]
impl Uploader for McUploader {
    async fn upload(&self, local: &Path, bucket: &str, remote_key: &str) -> Result<()> {
        let args = self.args(local, bucket, remote_key);
        debug!("Running {} {}", self.binary, args.join(" "));

        let output = Command::new(&self.binary)
            .args(&args)
            .output()
            .await
            .map_err(|e| ConvertError::Upload(format!("cannot run {}: {}", self.binary, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(ConvertError::Upload(format!(
                "{} {} exited with {}: {}",
                self.binary,
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }
        if !stdout.trim().is_empty() {
            debug!("{}", stdout.trim());
        }
        if !stderr.trim().is_empty() {
            warn!("{} stderr: {}", self.binary, stderr.trim());
        }
        Ok(())
    }
}

/// Upload `local` and, unless asked to keep it, remove it afterwards.
///
/// The local store is only removed after a successful upload.
pub async fn hand_off(local: &Path, uploader: &dyn Uploader, request: &UploadRequest) -> Result<()> {
    if !tokio::fs::try_exists(local).await? {
        return Err(ConvertError::NotFound(local.display().to_string()));
    }

    info!(
        "Uploading {} to s3://{}/{}",
        local.display(),
        request.bucket,
        request.remote_key
    );
    uploader
        .upload(local, &request.bucket, &request.remote_key)
        .await?;
    info!("Upload finished");

    if !request.keep_local {
        info!("Removing local store {}", local.display());
        tokio::fs::remove_dir_all(local).await?;
    }
    Ok(())
}
