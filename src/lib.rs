//! wavezarr - waveform recordings to chunked Zarr stores
//!
//! Converts 4-D `i16` waveform recordings `(channel, recording_file, segment, sample)`
//! into a chunked, compressed Zarr store for random-access reads, together with a
//! min/max overview that keeps zoomed-out plots cheap.
//!
//! # Features
//!
//! - Zarr v3 output, with Zarr v2 as a fallback for codecs v3 cannot express
//! - HDF5 waveform files read one trace at a time (`hdf5` feature)
//! - Byte shuffle plus Zstd, Gzip or Zlib chunk compression
//! - Min/max overview pyramid (level `0`) sized for ~4000 buckets per trace
//! - Calibration metadata carried forward, with defaults for anything missing
//! - Async I/O throughout, with optional bounded concurrency across traces
//!
//! # Store layout
//!
//! ```text
//! <name>.zarr/
//!   zarr.json            root attributes: vertical_gains, vertical_offsets, horiz_interval, ...
//!   raw/                 (C, F, S, N) int16, chunks (1, 1, 1, min(10_000_000, N))
//!   overview/0/          (C, F, S, 2, N / d) int16, [.., 0, :] min and [.., 1, :] max
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use wavezarr::{convert, ConvertOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let report = convert("capture.hdf", "capture.zarr", &ConvertOptions::default()).await?;
//! println!("{} traces, overview decimation {}", report.traces, report.decimation);
//! # Ok(())
//! # }
//! ```

pub mod compression;
pub mod config;
pub mod convert;
pub mod error;
pub mod format;
#[cfg(feature = "hdf5")]
pub mod hdf5_source;
pub mod io;
pub mod layout;
pub mod metadata;
pub mod overview;
pub mod source;
pub mod store;
pub mod types;
pub mod upload;

// Re-exports
pub use compression::{ChunkCodec, CompressionLevel, CompressionMethod};
pub use convert::{convert, convert_into_dir, convert_source, output_path_for, ConversionReport, ConvertOptions};
pub use error::{ConvertError, Result};
pub use format::{FormatPreference, ZarrFormat};
pub use io::StorageBackend;
pub use layout::{plan_pyramid, ArrayLayout, ChunkGeometry, PyramidPlan};
pub use metadata::CalibrationMetadata;
pub use overview::build_overview;
#[cfg(feature = "hdf5")]
pub use hdf5_source::Hdf5Source;
pub use source::{open_source, ArraySource, AttrValue, MemorySource};
pub use store::{ArrayHandle, ChunkedStore};
pub use types::{DataType, SampleShape, TraceIndex};
pub use upload::{hand_off, McUploader, UploadRequest, Uploader};

/// Version of the wavezarr implementation
pub const WAVEZARR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!WAVEZARR_VERSION.is_empty());
    }
}
