//! Array layout - chunk geometry and the overview pyramid plan

use crate::error::{ConvertError, Result};
use crate::types::{DataType, SampleShape};
use serde::{Deserialize, Serialize};

/// Default raw chunk length along the sample axis (20 MB of `i16` per chunk)
pub const RAW_CHUNK_LENGTH: usize = 10_000_000;

/// Number of min/max buckets the overview level aims for
pub const OVERVIEW_TARGET_BUCKETS: usize = 4000;

/// Key of the only pyramid level generated
pub const OVERVIEW_LEVEL_KEY: &str = "0";

/// Extent of one chunk along each axis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkGeometry {
    dims: Vec<usize>,
}

impl ChunkGeometry {
    /// Create a chunk geometry; every extent must be positive
    pub fn new(dims: Vec<usize>) -> Result<Self> {
        if dims.is_empty() || dims.iter().any(|&d| d == 0) {
            return Err(ConvertError::InvalidDimensions(format!(
                "chunk extents must be positive, got {:?}",
                dims
            )));
        }
        Ok(Self { dims })
    }

    /// One chunk per leading index, the trailing `trailing` axes kept whole except
    /// the last, which is cut every `last_extent` elements. Clamped to `shape`.
    pub fn trailing(shape: &[usize], trailing: usize, last_extent: usize) -> Result<Self> {
        if trailing == 0 || trailing > shape.len() {
            return Err(ConvertError::InvalidDimensions(format!(
                "cannot keep {} trailing axes of a {}-D array",
                trailing,
                shape.len()
            )));
        }
        let lead = shape.len() - trailing;
        let last = shape.len() - 1;
        let dims = shape
            .iter()
            .enumerate()
            .map(|(axis, &extent)| {
                let want = if axis < lead {
                    1
                } else if axis == last {
                    last_extent
                } else {
                    extent
                };
                want.min(extent).max(1)
            })
            .collect();
        Self::new(dims)
    }

    /// Get the extent for a specific axis
    pub fn get(&self, axis: usize) -> usize {
        self.dims.get(axis).copied().unwrap_or(1)
    }

    /// Get all extents
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Total number of elements in a chunk
    pub fn total_elements(&self) -> usize {
        self.dims.iter().product()
    }
}

/// Shape, element type and chunking of one stored array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayLayout {
    pub shape: Vec<usize>,
    pub data_type: DataType,
    pub chunks: ChunkGeometry,
}

impl ArrayLayout {
    /// Create a layout, validating that the chunk geometry fits the array
    pub fn new(shape: Vec<usize>, data_type: DataType, chunks: ChunkGeometry) -> Result<Self> {
        if shape.len() != chunks.ndim() {
            return Err(ConvertError::InvalidDimensions(format!(
                "chunk geometry {:?} does not match {}-D shape {:?}",
                chunks.dims(),
                shape.len(),
                shape
            )));
        }
        if let Some(axis) = (0..shape.len()).find(|&a| shape[a] > 0 && chunks.get(a) > shape[a]) {
            return Err(ConvertError::InvalidDimensions(format!(
                "chunk extent {} exceeds array extent {} on axis {}",
                chunks.get(axis),
                shape[axis],
                axis
            )));
        }
        Ok(Self {
            shape,
            data_type,
            chunks,
        })
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Get the number of chunks along each axis
    pub fn chunk_count(&self) -> Vec<usize> {
        self.shape
            .iter()
            .enumerate()
            .map(|(i, &extent)| extent.div_ceil(self.chunks.get(i)))
            .collect()
    }

    /// Get the total number of chunks
    pub fn total_chunks(&self) -> usize {
        self.chunk_count().iter().product()
    }

    /// Element range covered by a chunk, trimmed at the array edge
    pub fn chunk_data_range(&self, chunk_coords: &[usize]) -> Vec<(usize, usize)> {
        chunk_coords
            .iter()
            .enumerate()
            .map(|(i, &coord)| {
                let extent = self.chunks.get(i);
                let start = coord * extent;
                let end = (start + extent).min(self.shape[i]);
                (start, end)
            })
            .collect()
    }

    /// Size in bytes of one decoded chunk (edge chunks are padded to this size)
    pub fn chunk_size_bytes(&self) -> usize {
        self.chunks.total_elements() * self.data_type.size_in_bytes()
    }

    /// Total array size in bytes (uncompressed)
    pub fn total_size_bytes(&self) -> usize {
        self.shape.iter().product::<usize>() * self.data_type.size_in_bytes()
    }

    /// Check if coordinates are within bounds
    pub fn is_in_bounds(&self, coords: &[usize]) -> bool {
        coords.len() == self.ndim()
            && coords
                .iter()
                .zip(self.shape.iter())
                .all(|(&coord, &extent)| coord < extent)
    }

    /// Length of the leading index prefix addressing one whole block.
    ///
    /// Block access needs chunk extent 1 on every prefix axis and full extent on
    /// every axis between the prefix and the last axis.
    pub fn block_rank(&self) -> Result<usize> {
        let last = self.ndim().saturating_sub(1);
        let rank = (0..last)
            .find(|&axis| self.chunks.get(axis) != 1)
            .unwrap_or(last);
        if let Some(axis) = (rank..last).find(|&axis| self.chunks.get(axis) != self.shape[axis]) {
            return Err(ConvertError::InvalidDimensions(format!(
                "axis {} is split into chunks of {} (extent {}); only the last axis may be subdivided",
                axis,
                self.chunks.get(axis),
                self.shape[axis]
            )));
        }
        Ok(rank)
    }

    /// Get a summary string of the layout
    pub fn summary(&self) -> String {
        let size_str = self
            .shape
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(" x ");

        format!(
            "{} ({}), chunks {:?}, {} chunks, {:.2} MB uncompressed",
            size_str,
            self.data_type,
            self.chunks.dims(),
            self.total_chunks(),
            self.total_size_bytes() as f64 / (1024.0 * 1024.0)
        )
    }
}

/// Planner knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannerOptions {
    pub raw_chunk_length: usize,
    pub overview_buckets: usize,
}

impl Default for PlannerOptions {
    fn default() -> Self {
        Self {
            raw_chunk_length: RAW_CHUNK_LENGTH,
            overview_buckets: OVERVIEW_TARGET_BUCKETS,
        }
    }
}

/// One decimated min/max level of the overview pyramid
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverviewLevel {
    /// Array name inside the `overview` group
    pub key: String,
    /// Samples per min/max bucket
    pub decimation: usize,
    pub layout: ArrayLayout,
}

/// Layouts of every array a conversion writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PyramidPlan {
    pub raw: ArrayLayout,
    pub levels: Vec<OverviewLevel>,
}

/// Samples per bucket so that roughly `target_buckets` buckets cover `samples`
pub fn decimation_factor(samples: usize, target_buckets: usize) -> usize {
    (samples / target_buckets.max(1)).max(1)
}

/// Plan the raw array and overview level "0" for a sample array
pub fn plan_pyramid(
    shape: SampleShape,
    data_type: DataType,
    options: &PlannerOptions,
) -> Result<PyramidPlan> {
    if options.raw_chunk_length == 0 {
        return Err(ConvertError::Configuration(
            "raw chunk length must be positive".to_string(),
        ));
    }

    let raw_shape = shape.dims().to_vec();
    let raw_chunks = ChunkGeometry::trailing(&raw_shape, 1, options.raw_chunk_length)?;
    let raw = ArrayLayout::new(raw_shape, data_type, raw_chunks)?;

    let decimation = decimation_factor(shape.samples, options.overview_buckets);
    let buckets = shape.samples / decimation;
    let overview_shape = vec![
        shape.channels,
        shape.recording_files,
        shape.segments,
        2,
        buckets,
    ];
    // one chunk per triple: the whole 2 x buckets block
    let overview_chunks = ChunkGeometry::trailing(&overview_shape, 2, buckets)?;
    let overview = ArrayLayout::new(overview_shape, data_type, overview_chunks)?;

    Ok(PyramidPlan {
        raw,
        levels: vec![OverviewLevel {
            key: OVERVIEW_LEVEL_KEY.to_string(),
            decimation,
            layout: overview,
        }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_layout() -> ArrayLayout {
        let shape = vec![2, 3, 5, 25];
        let chunks = ChunkGeometry::trailing(&shape, 1, 10).unwrap();
        ArrayLayout::new(shape, DataType::I16, chunks).unwrap()
    }

    #[test]
    fn test_layout_creation() {
        let layout = create_test_layout();
        assert_eq!(layout.ndim(), 4);
        assert_eq!(layout.data_type, DataType::I16);
        assert_eq!(layout.chunks.dims(), &[1, 1, 1, 10]);
    }

    #[test]
    fn test_chunk_count() {
        let layout = create_test_layout();
        assert_eq!(layout.chunk_count(), vec![2, 3, 5, 3]); // ceil(25/10)
        assert_eq!(layout.total_chunks(), 2 * 3 * 5 * 3);
    }

    #[test]
    fn test_chunk_data_range() {
        let layout = create_test_layout();
        let range = layout.chunk_data_range(&[0, 0, 0, 0]);
        assert_eq!(range, vec![(0, 1), (0, 1), (0, 1), (0, 10)]);

        // Last chunk should be trimmed
        let range = layout.chunk_data_range(&[1, 2, 4, 2]);
        assert_eq!(range, vec![(1, 2), (2, 3), (4, 5), (20, 25)]);
    }

    #[test]
    fn test_is_in_bounds() {
        let layout = create_test_layout();
        assert!(layout.is_in_bounds(&[0, 0, 0, 0]));
        assert!(layout.is_in_bounds(&[1, 2, 4, 24]));
        assert!(!layout.is_in_bounds(&[2, 0, 0, 0]));
        assert!(!layout.is_in_bounds(&[0, 0, 0, 25]));
        assert!(!layout.is_in_bounds(&[0, 0, 0]));
    }

    #[test]
    fn test_chunk_geometry_clamped_to_shape() {
        let chunks = ChunkGeometry::trailing(&[2, 3, 5, 1000], 1, RAW_CHUNK_LENGTH).unwrap();
        assert_eq!(chunks.dims(), &[1, 1, 1, 1000]);
        assert!(ChunkGeometry::new(vec![1, 0]).is_err());

        let shape = vec![4, 100];
        let too_big = ChunkGeometry::new(vec![1, 200]).unwrap();
        assert!(ArrayLayout::new(shape, DataType::I16, too_big).is_err());
    }

    #[test]
    fn test_block_rank() {
        assert_eq!(create_test_layout().block_rank().unwrap(), 3);

        let shape = vec![2, 3, 5, 2, 250];
        let chunks = ChunkGeometry::trailing(&shape, 2, 250).unwrap();
        let overview = ArrayLayout::new(shape, DataType::I16, chunks).unwrap();
        assert_eq!(overview.block_rank().unwrap(), 3);

        let shape = vec![4, 6, 100];
        let chunks = ChunkGeometry::new(vec![2, 3, 100]).unwrap();
        let split = ArrayLayout::new(shape, DataType::I16, chunks).unwrap();
        assert!(split.block_rank().is_err());
    }

    #[test]
    fn test_decimation_factor_boundaries() {
        assert_eq!(decimation_factor(1000, OVERVIEW_TARGET_BUCKETS), 1);
        assert_eq!(decimation_factor(3999, OVERVIEW_TARGET_BUCKETS), 1);
        assert_eq!(decimation_factor(4000, OVERVIEW_TARGET_BUCKETS), 1);
        assert_eq!(decimation_factor(7999, OVERVIEW_TARGET_BUCKETS), 1);
        assert_eq!(decimation_factor(8000, OVERVIEW_TARGET_BUCKETS), 2);
        assert_eq!(decimation_factor(100_000_000, OVERVIEW_TARGET_BUCKETS), 25_000);
        assert_eq!(decimation_factor(10, 0), 10);
    }

    #[test]
    fn test_plan_small_recording() {
        let plan = plan_pyramid(
            SampleShape::new(2, 3, 5, 1000),
            DataType::I16,
            &PlannerOptions::default(),
        )
        .unwrap();
        assert_eq!(plan.raw.shape, vec![2, 3, 5, 1000]);
        assert_eq!(plan.raw.chunks.dims(), &[1, 1, 1, 1000]);

        assert_eq!(plan.levels.len(), 1);
        let level = &plan.levels[0];
        assert_eq!(level.key, "0");
        assert_eq!(level.decimation, 1);
        assert_eq!(level.layout.shape, vec![2, 3, 5, 2, 1000]);
        assert_eq!(level.layout.chunks.dims(), &[1, 1, 1, 2, 1000]);
    }

    #[test]
    fn test_plan_boundaries() {
        let options = PlannerOptions::default();
        for (samples, decimation, buckets) in [(4000, 1, 4000), (8000, 2, 4000), (8001, 2, 4000), (12_345, 3, 4115)] {
            let plan = plan_pyramid(SampleShape::new(1, 1, 1, samples), DataType::I16, &options).unwrap();
            assert_eq!(plan.levels[0].decimation, decimation);
            assert_eq!(plan.levels[0].layout.shape, vec![1, 1, 1, 2, buckets]);
        }
    }

    #[test]
    fn test_plan_long_recording_splits_raw() {
        let plan = plan_pyramid(
            SampleShape::new(1, 1, 3, 25_000_000),
            DataType::I16,
            &PlannerOptions::default(),
        )
        .unwrap();
        assert_eq!(plan.raw.chunk_count(), vec![1, 1, 3, 3]);
        assert_eq!(plan.raw.chunk_size_bytes(), RAW_CHUNK_LENGTH * 2);
        assert_eq!(plan.levels[0].decimation, 6250);
        assert_eq!(plan.levels[0].layout.shape[4], 4000);
    }
}
