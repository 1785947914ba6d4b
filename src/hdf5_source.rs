//! HDF5 waveform files
//!
//! Layout read:
//!
//! ```text
//! /                  root attributes -> source attributes
//! /samples           (C, F, S, N) int16, `/data` in older files
//! /vertical_gain     optional calibration datasets, any numeric type
//! /vertical_offset
//! /horiz_offset
//! ```

use crate::error::{ConvertError, Result};
use crate::source::{check_samples, ArraySource, AttrValue, LEGACY_SAMPLES_DATASET, SAMPLES_DATASET};
use crate::types::{DataType, SampleShape, TraceIndex};
use async_trait::async_trait;
use hdf5::types::{FloatSize, IntSize, TypeDescriptor, VarLenAscii, VarLenUnicode};
use hdf5::{Attribute, File};
use log::debug;
use ndarray::{ArrayD, IxDyn};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Element type of an HDF5 datatype, if it is one the store can hold
fn element_type(descriptor: &TypeDescriptor) -> Option<DataType> {
    match descriptor {
        TypeDescriptor::Unsigned(IntSize::U1) => Some(DataType::U8),
        TypeDescriptor::Unsigned(IntSize::U2) => Some(DataType::U16),
        TypeDescriptor::Integer(IntSize::U2) => Some(DataType::I16),
        TypeDescriptor::Integer(IntSize::U4) => Some(DataType::I32),
        TypeDescriptor::Integer(IntSize::U8) => Some(DataType::I64),
        TypeDescriptor::Float(FloatSize::U4) => Some(DataType::F32),
        TypeDescriptor::Float(FloatSize::U8) => Some(DataType::F64),
        _ => None,
    }
}

fn read_attribute(attr: &Attribute) -> hdf5::Result<AttrValue> {
    let descriptor = attr.dtype()?.to_descriptor()?;
    let shape = attr.shape();
    let scalar = shape.is_empty();
    Ok(match &descriptor {
        TypeDescriptor::Integer(_) | TypeDescriptor::Unsigned(_) if scalar => AttrValue::Int(attr.read_scalar()?),
        TypeDescriptor::Integer(_) | TypeDescriptor::Unsigned(_) => AttrValue::IntArray {
            shape,
            data: attr.read_raw()?,
        },
        TypeDescriptor::Float(_) if scalar => AttrValue::Float(attr.read_scalar()?),
        TypeDescriptor::Float(_) => AttrValue::FloatArray {
            shape,
            data: attr.read_raw()?,
        },
        TypeDescriptor::Boolean if scalar => AttrValue::Bool(attr.read_scalar()?),
        TypeDescriptor::VarLenUnicode if scalar => {
            AttrValue::Text(attr.read_scalar::<VarLenUnicode>()?.as_str().to_string())
        }
        TypeDescriptor::VarLenAscii if scalar => {
            AttrValue::Text(attr.read_scalar::<VarLenAscii>()?.as_str().to_string())
        }
        // fixed-width strings convert to variable length on read
        TypeDescriptor::FixedAscii(_) | TypeDescriptor::FixedUnicode(_) if scalar => {
            match attr.read_scalar::<VarLenUnicode>() {
                Ok(text) => AttrValue::Text(text.as_str().trim_end_matches('\0').to_string()),
                Err(e) => AttrValue::Unsupported(format!("{:?} ({})", descriptor, e)),
            }
        }
        other => AttrValue::Unsupported(format!("{:?} of shape {:?}", other, shape)),
    })
}

/// An HDF5 waveform file opened for reading.
///
/// Only the path and validated layout are kept; every read opens the file on a
/// blocking thread, so no HDF5 handle crosses threads.
#[derive(Debug, Clone)]
pub struct Hdf5Source {
    path: PathBuf,
    samples_name: &'static str,
    shape: SampleShape,
    attributes: BTreeMap<String, AttrValue>,
}

impl Hdf5Source {
    /// Open an HDF5 file and validate its sample dataset
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !tokio::fs::try_exists(&path).await? {
            return Err(ConvertError::NotFound(path.display().to_string()));
        }
        tokio::task::spawn_blocking(move || Self::open_blocking(path)).await?
    }

    fn open_blocking(path: PathBuf) -> Result<Self> {
        let file = File::open(&path)
            .map_err(|e| ConvertError::Schema(format!("{} is not an HDF5 file: {}", path.display(), e)))?;

        let samples_name = [SAMPLES_DATASET, LEGACY_SAMPLES_DATASET]
            .into_iter()
            .find(|name| file.link_exists(name))
            .ok_or_else(|| {
                ConvertError::Schema(format!("no '{}' dataset in {}", SAMPLES_DATASET, path.display()))
            })?;
        let samples = file.dataset(samples_name).map_err(|e| {
            ConvertError::Schema(format!("'{}' in {} is not a dataset: {}", samples_name, path.display(), e))
        })?;
        let data_type = element_type(&samples.dtype()?.to_descriptor()?);
        let shape = check_samples(&path, &samples.shape(), data_type)?;

        let mut attributes = BTreeMap::new();
        for name in file.attr_names()? {
            let value = file
                .attr(&name)
                .and_then(|attr| read_attribute(&attr))
                .unwrap_or_else(|e| AttrValue::Unsupported(e.to_string()));
            attributes.insert(name, value);
        }
        debug!(
            "Opened HDF5 source {} ({}, {} attributes)",
            path.display(),
            shape,
            attributes.len()
        );

        Ok(Self {
            path,
            samples_name,
            shape,
            attributes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ArraySource for Hdf5Source {
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
        let path = self.path.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || {
            let file = File::open(&path)?;
            if !file.link_exists(&name) {
                return Ok(None);
            }
            let dataset = file.dataset(&name)?;
            let values = dataset.read_raw::<f64>()?;
            ArrayD::from_shape_vec(IxDyn(&dataset.shape()), values)
                .map(Some)
                .map_err(|e| ConvertError::Schema(format!("dataset '{}': {}", name, e)))
        })
        .await?
    }

    async fn read_trace(&self, index: TraceIndex) -> Result<Vec<i16>> {
        self.shape.trace_offset(index)?;
        let path = self.path.clone();
        let samples_name = self.samples_name;
        tokio::task::spawn_blocking(move || {
            let dataset = File::open(&path)?.dataset(samples_name)?;
            let trace = dataset.read_slice_1d::<i16, _>((index.channel, index.recording_file, index.segment, ..))?;
            Ok(trace.to_vec())
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use tempfile::TempDir;

    fn sample(c: usize, f: usize, s: usize, i: usize) -> i16 {
        (c * 1000 + f * 100 + s * 10) as i16 - (i % 7) as i16
    }

    fn write_samples(file: &File, name: &str, dims: [usize; 4]) {
        let [c_len, f_len, s_len, n] = dims;
        let mut data = Vec::with_capacity(c_len * f_len * s_len * n);
        for c in 0..c_len {
            for f in 0..f_len {
                for s in 0..s_len {
                    data.extend((0..n).map(|i| sample(c, f, s, i)));
                }
            }
        }
        file.new_dataset::<i16>()
            .shape((c_len, f_len, s_len, n))
            .create(name)
            .unwrap()
            .write_raw(&data)
            .unwrap();
    }

    fn capture(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("capture.hdf");
        let file = File::create(&path).unwrap();
        write_samples(&file, SAMPLES_DATASET, [2, 3, 2, 50]);
        file.new_dataset::<f32>()
            .shape((2, 3))
            .create("vertical_gain")
            .unwrap()
            .write_raw(&[0.5f32, 1.0, 1.5, 2.0, 2.5, 3.0])
            .unwrap();
        file.new_attr::<f64>()
            .create("horiz_interval")
            .unwrap()
            .write_scalar(&2e-10)
            .unwrap();
        file.new_attr::<i32>()
            .create("sample_count")
            .unwrap()
            .write_scalar(&50)
            .unwrap();
        file.new_attr::<VarLenUnicode>()
            .create("instrument")
            .unwrap()
            .write_scalar(&VarLenUnicode::from_str("scope-7").unwrap())
            .unwrap();
        path
    }

    #[tokio::test]
    async fn test_read_capture() {
        let dir = TempDir::new().unwrap();
        let source = Hdf5Source::open(capture(&dir)).await.unwrap();

        assert_eq!(source.shape(), SampleShape::new(2, 3, 2, 50));
        assert_eq!(source.data_type(), DataType::I16);
        assert_eq!(source.attributes()["instrument"], AttrValue::Text("scope-7".into()));
        assert_eq!(source.attributes()["horiz_interval"], AttrValue::Float(2e-10));
        assert_eq!(source.attributes()["sample_count"], AttrValue::Int(50));

        let trace = source.read_trace(TraceIndex::new(1, 2, 1)).await.unwrap();
        assert_eq!(trace, (0..50).map(|i| sample(1, 2, 1, i)).collect::<Vec<_>>());
        assert!(source.read_trace(TraceIndex::new(2, 0, 0)).await.is_err());

        let gain = source.read_dataset("vertical_gain").await.unwrap().unwrap();
        assert_eq!(gain.shape(), &[2, 3]);
        assert_eq!(gain[[1, 0]], 2.0);
        assert!(source.read_dataset("vertical_offset").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_legacy_sample_name() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("legacy.h5");
        write_samples(&File::create(&path).unwrap(), LEGACY_SAMPLES_DATASET, [1, 1, 1, 8]);

        let source = crate::source::open_source(&path).await.unwrap();
        assert_eq!(source.shape().samples, 8);
        assert_eq!(source.read_trace(TraceIndex::new(0, 0, 0)).await.unwrap()[1], -1);
    }

    #[tokio::test]
    async fn test_open_errors() {
        let dir = TempDir::new().unwrap();

        let missing = Hdf5Source::open(dir.path().join("absent.hdf")).await;
        assert!(matches!(missing, Err(ConvertError::NotFound(_))));

        let garbage = dir.path().join("garbage.hdf");
        std::fs::write(&garbage, b"definitely not hdf5").unwrap();
        assert!(matches!(Hdf5Source::open(&garbage).await, Err(ConvertError::Schema(_))));

        // `samples` as a group, not a dataset
        let grouped = dir.path().join("grouped.h5");
        File::create(&grouped).unwrap().create_group(SAMPLES_DATASET).unwrap();
        assert!(matches!(Hdf5Source::open(&grouped).await, Err(ConvertError::Schema(_))));

        let three_d = dir.path().join("three_d.h5");
        File::create(&three_d)
            .unwrap()
            .new_dataset::<i16>()
            .shape((2, 2, 2))
            .create(SAMPLES_DATASET)
            .unwrap();
        assert!(matches!(Hdf5Source::open(&three_d).await, Err(ConvertError::Schema(_))));

        let wrong_type = dir.path().join("wrong_type.h5");
        File::create(&wrong_type)
            .unwrap()
            .new_dataset::<f32>()
            .shape((1, 1, 1, 4))
            .create(SAMPLES_DATASET)
            .unwrap();
        assert!(matches!(Hdf5Source::open(&wrong_type).await, Err(ConvertError::Schema(_))));
    }

    #[test]
    fn test_element_types() {
        assert_eq!(element_type(&TypeDescriptor::Integer(IntSize::U2)), Some(DataType::I16));
        assert_eq!(element_type(&TypeDescriptor::Float(FloatSize::U8)), Some(DataType::F64));
        assert_eq!(element_type(&TypeDescriptor::Boolean), None);
    }
}
