//! Sample array sources: waveform files and in-memory arrays
//!
//! A source holds one 4-D `i16` sample dataset `(channel, recording_file, segment, sample)`
//! named `samples` (older files use `data`), optional calibration datasets and a flat set
//! of typed attributes. [`open_source`] picks the reader from the file extension.

use crate::error::{ConvertError, Result};
use crate::types::{DataType, SampleShape, TraceIndex};
use async_trait::async_trait;
use ndarray::{s, Array4, ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;

/// Name of the sample dataset
pub const SAMPLES_DATASET: &str = "samples";

/// Name older files use for the sample dataset
pub const LEGACY_SAMPLES_DATASET: &str = "data";

/// File extensions read as HDF5
pub const HDF5_EXTENSIONS: &[&str] = &["hdf", "h5", "hdf5"];

/// A source attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    IntArray { shape: Vec<usize>, data: Vec<i64> },
    FloatArray { shape: Vec<usize>, data: Vec<f64> },
    /// A value of a type with no JSON counterpart (compound, opaque, reference, ...),
    /// carried as a description of that type
    Unsupported(String),
}

impl AttrValue {
    /// Numeric value as an n-d array (scalars are 0-D)
    pub fn to_array(&self) -> Option<ArrayD<f64>> {
        match self {
            AttrValue::Int(v) => Some(ArrayD::from_elem(IxDyn(&[]), *v as f64)),
            AttrValue::Float(v) => Some(ArrayD::from_elem(IxDyn(&[]), *v)),
            AttrValue::IntArray { shape, data } => {
                ArrayD::from_shape_vec(IxDyn(shape), data.iter().map(|&v| v as f64).collect()).ok()
            }
            AttrValue::FloatArray { shape, data } => {
                ArrayD::from_shape_vec(IxDyn(shape), data.clone()).ok()
            }
            AttrValue::Bool(_) | AttrValue::Text(_) | AttrValue::Unsupported(_) => None,
        }
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Text(v.to_string())
    }
}

/// Read-only access to a 4-D sample array and its auxiliary data
#[async_trait]
pub trait ArraySource: Send + Sync {
    /// Extents of the sample array
    fn shape(&self) -> SampleShape;

    /// Element type of the sample array
    fn data_type(&self) -> DataType;

    /// Source-level attributes
    fn attributes(&self) -> &BTreeMap<String, AttrValue>;

    /// An auxiliary dataset (calibration tables), if present
    async fn read_dataset(&self, name: &str) -> Result<Option<ArrayD<f64>>>;

    /// The full sample vector of one triple
    async fn read_trace(&self, index: TraceIndex) -> Result<Vec<i16>>;
}

/// Validate the sample dataset of a source and return its shape
pub(crate) fn check_samples(origin: &Path, dims: &[usize], data_type: Option<DataType>) -> Result<SampleShape> {
    if data_type != Some(DataType::I16) {
        return Err(ConvertError::Schema(format!(
            "sample dataset of {} is {}, expected {}",
            origin.display(),
            data_type.map_or_else(|| "of an unsupported type".to_string(), |t| t.to_string()),
            DataType::I16
        )));
    }
    SampleShape::from_dims(dims)
}

/// Open the waveform file at `path` with the reader its extension calls for.
///
/// A missing path is [`ConvertError::NotFound`]. Directories and unknown extensions are
/// configuration errors.
pub async fn open_source(path: impl AsRef<Path>) -> Result<Box<dyn ArraySource>> {
    let path = path.as_ref();
    if !fs::try_exists(path).await? {
        return Err(ConvertError::NotFound(path.display().to_string()));
    }
    if fs::metadata(path).await?.is_dir() {
        return Err(ConvertError::Configuration(format!(
            "{} is a directory, not a waveform file",
            path.display()
        )));
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if HDF5_EXTENSIONS.contains(&extension.as_str()) {
        open_hdf5(path).await
    } else {
        Err(ConvertError::Configuration(format!(
            "{} is not a supported waveform file (expected one of .{})",
            path.display(),
            HDF5_EXTENSIONS.join(", .")
        )))
    }
}

#[cfg(feature = "hdf5")]
async fn open_hdf5(path: &Path) -> Result<Box<dyn ArraySource>> {
    Ok(Box::new(crate::hdf5_source::Hdf5Source::open(path).await?))
}

#[cfg(not(feature = "hdf5"))]
async fn open_hdf5(path: &Path) -> Result<Box<dyn ArraySource>> {
    Err(ConvertError::Configuration(format!(
        "cannot read {}: built without the `hdf5` feature",
        path.display()
    )))
}

/// A sample array already in memory
#[derive(Debug, Clone)]
pub struct MemorySource {
    samples: Array4<i16>,
    shape: SampleShape,
    attributes: BTreeMap<String, AttrValue>,
    datasets: BTreeMap<String, ArrayD<f64>>,
}

impl MemorySource {
    pub fn new(samples: Array4<i16>) -> Result<Self> {
        let shape = SampleShape::from_dims(samples.shape())?;
        Ok(Self {
            samples,
            shape,
            attributes: BTreeMap::new(),
            datasets: BTreeMap::new(),
        })
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_dataset(mut self, name: impl Into<String>, data: ArrayD<f64>) -> Self {
        self.datasets.insert(name.into(), data);
        self
    }
}

#[async_trait]
impl ArraySource for MemorySource {
    fn shape(&self) -> SampleShape {
        self.shape
    }

    fn data_type(&self) -> DataType {
        DataType::I16
    }

    fn attributes(&self) -> &BTreeMap<String, AttrValue> {
        &self.attributes
    }

    async fn read_dataset(&self, name: &str) -> Result<Option<ArrayD<f64>>> {
        Ok(self.datasets.get(name).cloned())
    }

    async fn read_trace(&self, index: TraceIndex) -> Result<Vec<i16>> {
        self.shape.trace_offset(index)?;
        Ok(self
            .samples
            .slice(s![index.channel, index.recording_file, index.segment, ..])
            .to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ramp(c: usize, f: usize, s: usize, n: usize) -> Array4<i16> {
        Array4::from_shape_fn((c, f, s, n), |(c, f, s, i)| {
            (c as i16 * 1000) + (f as i16 * 100) + (s as i16 * 10) - (i as i16 % 7)
        })
    }

    #[tokio::test]
    async fn test_memory_source() {
        let samples = ramp(1, 2, 1, 5);
        let source = MemorySource::new(samples.clone())
            .unwrap()
            .with_attribute("horiz_interval", 1e-9)
            .with_dataset("horiz_offset", ArrayD::from_elem(IxDyn(&[]), -3e-9));

        assert_eq!(
            source.read_trace(TraceIndex::new(0, 1, 0)).await.unwrap(),
            samples.slice(s![0, 1, 0, ..]).to_vec()
        );
        assert!(source.read_dataset("horiz_offset").await.unwrap().is_some());
        assert!(source.read_dataset("vertical_gain").await.unwrap().is_none());
        assert!(source.read_trace(TraceIndex::new(1, 0, 0)).await.is_err());
        assert!(MemorySource::new(Array4::zeros((1, 0, 1, 5))).is_err());
    }

    #[test]
    fn test_check_samples() {
        let origin = Path::new("run.hdf");
        assert_eq!(
            check_samples(origin, &[2, 3, 1, 10], Some(DataType::I16)).unwrap(),
            SampleShape::new(2, 3, 1, 10)
        );
        assert!(matches!(
            check_samples(origin, &[2, 3, 10], Some(DataType::I16)),
            Err(ConvertError::Schema(_))
        ));
        assert!(matches!(
            check_samples(origin, &[2, 3, 1, 10], Some(DataType::F32)),
            Err(ConvertError::Schema(_))
        ));
        assert!(matches!(
            check_samples(origin, &[2, 3, 1, 10], None),
            Err(ConvertError::Schema(_))
        ));
    }

    #[tokio::test]
    async fn test_open_source_missing_path() {
        let dir = TempDir::new().unwrap();
        for name in ["absent.hdf", "absent.h5", "absent.txt"] {
            let result = open_source(dir.path().join(name)).await;
            assert!(matches!(result, Err(ConvertError::NotFound(_))), "{}", name);
        }
    }

    #[tokio::test]
    async fn test_open_source_rejects_directories_and_unknown_files() {
        let dir = TempDir::new().unwrap();
        let folder = dir.path().join("capture.hdf");
        std::fs::create_dir(&folder).unwrap();
        assert!(matches!(open_source(&folder).await, Err(ConvertError::Configuration(_))));

        let text = dir.path().join("notes.txt");
        std::fs::write(&text, "not a waveform").unwrap();
        assert!(matches!(open_source(&text).await, Err(ConvertError::Configuration(_))));
    }

    #[cfg(not(feature = "hdf5"))]
    #[tokio::test]
    async fn test_hdf5_needs_feature() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("capture.h5");
        std::fs::write(&path, b"\x89HDF").unwrap();
        assert!(matches!(open_source(&path).await, Err(ConvertError::Configuration(_))));
    }

    #[test]
    fn test_attr_value_arrays() {
        let v = AttrValue::IntArray { shape: vec![2], data: vec![3, 4] };
        assert_eq!(v.to_array().unwrap().into_raw_vec_and_offset().0, vec![3.0, 4.0]);
        assert_eq!(AttrValue::Float(2.0).to_array().unwrap().ndim(), 0);
        assert!(AttrValue::Text("x".into()).to_array().is_none());
        assert!(AttrValue::Unsupported("compound".into()).to_array().is_none());
        let bad = AttrValue::FloatArray { shape: vec![3], data: vec![1.0] };
        assert!(bad.to_array().is_none());
    }
}
