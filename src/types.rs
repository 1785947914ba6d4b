//! Core data types for waveform conversion

use crate::error::{ConvertError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Element data types understood by sources and the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    /// Unsigned 8-bit integer
    U8 = 1,
    /// Unsigned 16-bit integer
    U16 = 2,
    /// Signed 16-bit integer (ADC codes)
    I16 = 6,
    /// Signed 32-bit integer
    I32 = 7,
    /// Signed 64-bit integer
    I64 = 8,
    /// 32-bit floating point
    F32 = 9,
    /// 64-bit floating point
    F64 = 10,
}

impl DataType {
    /// Size in bytes of this data type
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::U8 => 1,
            DataType::U16 | DataType::I16 => 2,
            DataType::I32 | DataType::F32 => 4,
            DataType::I64 | DataType::F64 => 8,
        }
    }

    /// Check if this is a floating point type
    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F32 | DataType::F64)
    }

    /// Zarr v3 `data_type` name
    pub fn v3_name(&self) -> &'static str {
        match self {
            DataType::U8 => "uint8",
            DataType::U16 => "uint16",
            DataType::I16 => "int16",
            DataType::I32 => "int32",
            DataType::I64 => "int64",
            DataType::F32 => "float32",
            DataType::F64 => "float64",
        }
    }

    /// Zarr v2 (numpy typestr) `dtype`, always little-endian
    pub fn v2_typestr(&self) -> &'static str {
        match self {
            DataType::U8 => "|u1",
            DataType::U16 => "<u2",
            DataType::I16 => "<i2",
            DataType::I32 => "<i4",
            DataType::I64 => "<i8",
            DataType::F32 => "<f4",
            DataType::F64 => "<f8",
        }
    }

    pub fn from_v3_name(name: &str) -> Result<Self> {
        [
            DataType::U8,
            DataType::U16,
            DataType::I16,
            DataType::I32,
            DataType::I64,
            DataType::F32,
            DataType::F64,
        ]
        .into_iter()
        .find(|dt| dt.v3_name() == name)
        .ok_or_else(|| ConvertError::InvalidDataType(name.to_string()))
    }

    pub fn from_v2_typestr(typestr: &str) -> Result<Self> {
        // "<u1" and "|u1" both name a single byte
        let normalized = match typestr {
            "<u1" | "|u1" => return Ok(DataType::U8),
            other => other,
        };
        [
            DataType::U16,
            DataType::I16,
            DataType::I32,
            DataType::I64,
            DataType::F32,
            DataType::F64,
        ]
        .into_iter()
        .find(|dt| dt.v2_typestr() == normalized)
        .ok_or_else(|| ConvertError::InvalidDataType(typestr.to_string()))
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.v3_name())
    }
}

/// A fixed-width element that can be stored in a chunk
pub trait Element: zarrs::array::ElementOwned + Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static {
    const DATA_TYPE: DataType;
}

macro_rules! impl_element {
    ($ty:ty, $dt:expr) => {
        impl Element for $ty {
            const DATA_TYPE: DataType = $dt;
        }
    };
}

impl_element!(u8, DataType::U8);
impl_element!(u16, DataType::U16);
impl_element!(i16, DataType::I16);
impl_element!(i32, DataType::I32);
impl_element!(i64, DataType::I64);
impl_element!(f32, DataType::F32);
impl_element!(f64, DataType::F64);

/// Address of one sample vector: a `(channel, recording_file, segment)` triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceIndex {
    pub channel: usize,
    pub recording_file: usize,
    pub segment: usize,
}

impl TraceIndex {
    pub fn new(channel: usize, recording_file: usize, segment: usize) -> Self {
        Self {
            channel,
            recording_file,
            segment,
        }
    }

    /// Leading index prefix into a 4-D (or deeper) array
    pub fn prefix(&self) -> [usize; 3] {
        [self.channel, self.recording_file, self.segment]
    }
}

impl fmt::Display for TraceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 1-based, the way operators number channels and files
        write!(
            f,
            "ch={}, trc={}, seg={}",
            self.channel + 1,
            self.recording_file + 1,
            self.segment + 1
        )
    }
}

/// Extents of a 4-D sample array `(channel, recording_file, segment, sample)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SampleShape {
    pub channels: usize,
    pub recording_files: usize,
    pub segments: usize,
    pub samples: usize,
}

impl SampleShape {
    pub fn new(channels: usize, recording_files: usize, segments: usize, samples: usize) -> Self {
        Self {
            channels,
            recording_files,
            segments,
            samples,
        }
    }

    /// Build from a dataset shape, rejecting anything that is not 4-D with positive extents
    pub fn from_dims(dims: &[usize]) -> Result<Self> {
        match *dims {
            [channels, recording_files, segments, samples] => {
                if dims.iter().any(|&d| d == 0) {
                    return Err(ConvertError::Schema(format!(
                        "sample dataset has an empty axis: {:?}",
                        dims
                    )));
                }
                Ok(Self::new(channels, recording_files, segments, samples))
            }
            _ => Err(ConvertError::Schema(format!(
                "sample dataset must be 4-D (channel, recording_file, segment, sample), got {:?}",
                dims
            ))),
        }
    }

    pub fn dims(&self) -> [usize; 4] {
        [
            self.channels,
            self.recording_files,
            self.segments,
            self.samples,
        ]
    }

    /// Number of `(channel, recording_file, segment)` triples
    pub fn trace_count(&self) -> usize {
        self.channels * self.recording_files * self.segments
    }

    pub fn total_samples(&self) -> usize {
        self.trace_count() * self.samples
    }

    /// All triples in row-major order
    pub fn traces(&self) -> impl Iterator<Item = TraceIndex> {
        let (files, segments) = (self.recording_files, self.segments);
        (0..self.trace_count()).map(move |i| {
            TraceIndex::new(i / (files * segments), (i / segments) % files, i % segments)
        })
    }

    /// Row-major position of a triple's first sample
    pub fn trace_offset(&self, index: TraceIndex) -> Result<usize> {
        if index.channel >= self.channels
            || index.recording_file >= self.recording_files
            || index.segment >= self.segments
        {
            return Err(ConvertError::OutOfBounds(format!(
                "trace ({}) outside {:?}",
                index,
                self.dims()
            )));
        }
        let linear = (index.channel * self.recording_files + index.recording_file) * self.segments
            + index.segment;
        Ok(linear * self.samples)
    }
}

impl fmt::Display for SampleShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} x {} x {} x {}",
            self.channels, self.recording_files, self.segments, self.samples
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_sizes() {
        assert_eq!(DataType::U8.size_in_bytes(), 1);
        assert_eq!(DataType::I16.size_in_bytes(), 2);
        assert_eq!(DataType::F32.size_in_bytes(), 4);
        assert_eq!(DataType::F64.size_in_bytes(), 8);
    }

    #[test]
    fn test_zarr_type_names() {
        assert_eq!(DataType::I16.v3_name(), "int16");
        assert_eq!(DataType::I16.v2_typestr(), "<i2");
        assert_eq!(DataType::from_v3_name("float64").unwrap(), DataType::F64);
        assert_eq!(DataType::from_v2_typestr("<i2").unwrap(), DataType::I16);
        assert_eq!(DataType::from_v2_typestr("<u1").unwrap(), DataType::U8);
        assert!(DataType::from_v2_typestr(">i2").is_err());
        assert!(DataType::from_v3_name("complex64").is_err());
    }

    #[test]
    fn test_element_data_types() {
        assert_eq!(<i16 as Element>::DATA_TYPE, DataType::I16);
        assert_eq!(<f64 as Element>::DATA_TYPE.v3_name(), "float64");
    }

    #[test]
    fn test_sample_shape_traces() {
        let shape = SampleShape::new(2, 3, 2, 10);
        let traces: Vec<_> = shape.traces().collect();
        assert_eq!(traces.len(), 12);
        assert_eq!(traces[0], TraceIndex::new(0, 0, 0));
        assert_eq!(traces[1], TraceIndex::new(0, 0, 1));
        assert_eq!(traces[2], TraceIndex::new(0, 1, 0));
        assert_eq!(traces[11], TraceIndex::new(1, 2, 1));

        for (i, trace) in traces.iter().enumerate() {
            assert_eq!(shape.trace_offset(*trace).unwrap(), i * 10);
        }
        assert!(shape.trace_offset(TraceIndex::new(2, 0, 0)).is_err());
    }

    #[test]
    fn test_sample_shape_validation() {
        assert!(SampleShape::from_dims(&[1, 1, 1, 100]).is_ok());
        assert!(matches!(
            SampleShape::from_dims(&[1, 1, 100]),
            Err(ConvertError::Schema(_))
        ));
        assert!(matches!(
            SampleShape::from_dims(&[1, 0, 1, 100]),
            Err(ConvertError::Schema(_))
        ));
    }

    #[test]
    fn test_trace_index_display() {
        assert_eq!(TraceIndex::new(0, 1, 2).to_string(), "ch=1, trc=2, seg=3");
    }
}
