//! Error types for conversion and store operations

use thiserror::Error;

/// Main error type for conversion operations
#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Source path (or store node) does not exist. Fatal for a conversion job.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Source container lacks the expected sample dataset or has the wrong shape/dtype.
    #[error("Schema error: {0}")]
    Schema(String),

    /// A single attribute could not be represented in the destination encoding.
    #[error("Attribute '{name}' cannot be encoded: {reason}")]
    AttributeEncoding { name: String, reason: String },

    /// A store schema revision cannot express the requested array configuration.
    #[error("Incompatible with {format}: {reason}")]
    Incompatible { format: String, reason: String },

    /// Failure inside the Zarr layer: storage, codecs or node metadata.
    #[error("Zarr error: {0}")]
    Zarr(String),

    /// Failure inside the HDF5 library while reading a source.
    #[error("HDF5 error: {0}")]
    Hdf5(String),

    #[error("Invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid data type: {0}")]
    InvalidDataType(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Upload failed: {0}")]
    Upload(String),
}

/// Specialized Result type for conversion operations
pub type Result<T> = std::result::Result<T, ConvertError>;

macro_rules! impl_from_zarrs {
    ($($err:ty),* $(,)?) => {
        $(
            impl From<$err> for ConvertError {
                fn from(err: $err) -> Self {
                    ConvertError::Zarr(err.to_string())
                }
            }
        )*
    };
}

impl_from_zarrs!(
    zarrs::array::ArrayCreateError,
    zarrs::array::ArrayError,
    zarrs::group::GroupCreateError,
    zarrs::storage::StorageError,
    zarrs::storage::StoreKeyError,
    zarrs::storage::StorePrefixError,
    zarrs::filesystem::FilesystemStoreCreateError,
);

#[cfg(feature = "hdf5")]
impl From<hdf5::Error> for ConvertError {
    fn from(err: hdf5::Error) -> Self {
        ConvertError::Hdf5(err.to_string())
    }
}

impl From<tokio::task::JoinError> for ConvertError {
    fn from(err: tokio::task::JoinError) -> Self {
        ConvertError::Io(std::io::Error::other(err))
    }
}

impl From<serde_json::Error> for ConvertError {
    fn from(err: serde_json::Error) -> Self {
        ConvertError::Serialization(err.to_string())
    }
}

impl ConvertError {
    /// Whether the error aborts a conversion job before anything is written
    pub fn is_source_error(&self) -> bool {
        matches!(self, ConvertError::NotFound(_) | ConvertError::Schema(_))
    }
}
