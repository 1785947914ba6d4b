//! Conversion jobs: waveform file in, chunked store with overview out

use crate::compression::{ChunkCodec, CompressionLevel, CompressionMethod};
use crate::error::{ConvertError, Result};
use crate::format::{ArrayMetadata, FormatPreference, ZarrFormat};
use crate::layout::{plan_pyramid, PlannerOptions, OVERVIEW_TARGET_BUCKETS, RAW_CHUNK_LENGTH};
use crate::metadata;
use crate::overview::build_overview;
use crate::source::{open_source, ArraySource};
use crate::store::{ArrayHandle, ChunkedStore};
use crate::types::{DataType, SampleShape, TraceIndex};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use log::{debug, info};
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Full-resolution array name
pub const RAW_ARRAY: &str = "raw";

/// Group holding the overview levels
pub const OVERVIEW_GROUP: &str = "overview";

pub const RAW_DIMENSIONS: [&str; 4] = ["channel", "recording_file", "segment", "sample"];
pub const OVERVIEW_DIMENSIONS: [&str; 5] = ["channel", "recording_file", "segment", "minmax", "bucket"];

/// Store extension appended to the input stem
pub const STORE_EXTENSION: &str = "zarr";

/// Conversion settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvertOptions {
    /// Samples per raw chunk along the sample axis
    pub chunk_length: usize,
    pub compression: CompressionMethod,
    pub level: CompressionLevel,
    /// Byte-shuffle chunks before compressing
    pub shuffle: bool,
    pub format: FormatPreference,
    /// Target bucket count of overview level 0
    pub overview_buckets: usize,
    /// Triples in flight at once; 1 is strictly sequential
    pub concurrency: usize,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            chunk_length: RAW_CHUNK_LENGTH,
            compression: CompressionMethod::Zstd,
            level: CompressionLevel::default(),
            shuffle: true,
            format: FormatPreference::Auto,
            overview_buckets: OVERVIEW_TARGET_BUCKETS,
            concurrency: 1,
        }
    }
}

impl ConvertOptions {
    pub fn with_chunk_length(mut self, chunk_length: usize) -> Self {
        self.chunk_length = chunk_length;
        self
    }

    pub fn with_compression(mut self, method: CompressionMethod, level: CompressionLevel) -> Self {
        self.compression = method;
        self.level = level;
        self
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn with_format(mut self, format: FormatPreference) -> Self {
        self.format = format;
        self
    }

    pub fn with_overview_buckets(mut self, buckets: usize) -> Self {
        self.overview_buckets = buckets;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn codec(&self) -> ChunkCodec {
        ChunkCodec::new(self.compression, self.level).with_shuffle(self.shuffle)
    }

    pub fn planner(&self) -> PlannerOptions {
        PlannerOptions {
            raw_chunk_length: self.chunk_length,
            overview_buckets: self.overview_buckets,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_length == 0 {
            return Err(ConvertError::Configuration("chunk_length must be positive".to_string()));
        }
        if self.overview_buckets == 0 {
            return Err(ConvertError::Configuration("overview_buckets must be positive".to_string()));
        }
        if self.concurrency == 0 {
            return Err(ConvertError::Configuration("concurrency must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Outcome of one conversion job
#[derive(Debug, Clone, Serialize)]
pub struct ConversionReport {
    pub job_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub output: String,
    pub format: ZarrFormat,
    pub shape: SampleShape,
    /// Samples per overview bucket
    pub decimation: usize,
    pub overview_shape: Vec<usize>,
    pub traces: usize,
    /// Uncompressed bytes of `raw`
    pub raw_bytes: usize,
    /// Compressed bytes written across all arrays
    pub stored_bytes: usize,
    pub skipped_attributes: Vec<String>,
    pub defaults_added: Vec<String>,
}

impl ConversionReport {
    pub fn compression_ratio(&self) -> f64 {
        if self.stored_bytes == 0 {
            0.0
        } else {
            self.raw_bytes as f64 / self.stored_bytes as f64
        }
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// `out_dir/<input stem>.zarr`
pub fn output_path_for(input: impl AsRef<Path>, out_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let input = input.as_ref();
    let stem = input.file_stem().ok_or_else(|| {
        ConvertError::Configuration(format!("cannot derive a store name from {}", input.display()))
    })?;
    let mut name = stem.to_os_string();
    name.push(".");
    name.push(STORE_EXTENSION);
    Ok(out_dir.as_ref().join(name))
}

fn path_url(path: &Path) -> Result<String> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| ConvertError::InvalidUrl(format!("{} is not valid UTF-8", path.display())))
}

/// Convert the waveform file at `input` into a store at `output`
pub async fn convert(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    options: &ConvertOptions,
) -> Result<ConversionReport> {
    let source = open_source(input).await?;
    convert_source(source.as_ref(), &path_url(output.as_ref())?, options).await
}

/// Convert `input` into `out_dir/<stem>.zarr`, creating `out_dir`
pub async fn convert_into_dir(
    input: impl AsRef<Path>,
    out_dir: impl AsRef<Path>,
    options: &ConvertOptions,
) -> Result<(PathBuf, ConversionReport)> {
    let output = output_path_for(input.as_ref(), out_dir.as_ref())?;
    let source = open_source(input).await?;
    tokio::fs::create_dir_all(out_dir.as_ref()).await?;
    let report = convert_source(source.as_ref(), &path_url(&output)?, options).await?;
    Ok((output, report))
}

/// Convert any sample source into a store at `output`.
///
/// Whatever exists at `output` is replaced. Source problems are reported before the
/// destination is touched; a failure after that leaves a partial store behind.
pub async fn convert_source(
    source: &dyn ArraySource,
    output: &str,
    options: &ConvertOptions,
) -> Result<ConversionReport> {
    let started_at = Utc::now();
    let job_id = Uuid::new_v4();
    options.validate()?;

    let shape = source.shape();
    if source.data_type() != DataType::I16 {
        return Err(ConvertError::Schema(format!(
            "sample array is {}, expected {}",
            source.data_type(),
            DataType::I16
        )));
    }
    let plan = plan_pyramid(shape, DataType::I16, &options.planner())?;
    let codec = options.codec();

    info!("Job {}: converting {} samples into {}", job_id, shape, output);
    let store = ChunkedStore::create(output, options.format, &codec, DataType::I16).await?;

    let propagation = metadata::propagate(source, &store).await?;
    info!(
        "Wrote {} root attributes ({} skipped, {} defaulted)",
        store.attributes().len(),
        propagation.skipped.len(),
        propagation.defaults_added.len()
    );

    info!("Creating array '{}'", RAW_ARRAY);
    let raw = store
        .create_array(
            RAW_ARRAY,
            ArrayMetadata::new(plan.raw.clone(), codec).with_dimension_names(&RAW_DIMENSIONS),
        )
        .await?;
    let raw_array = &raw;
    let mut stored_bytes = for_each_trace(shape, options.concurrency, move |index| async move {
        debug!("Copying raw: {}", index);
        let trace = source.read_trace(index).await?;
        raw_array.write_block(&index.prefix(), &trace).await
    })
    .await?;

    store.create_group(OVERVIEW_GROUP).await?;
    let mut decimation = 1;
    let mut overview_shape = Vec::new();
    for level in &plan.levels {
        let path = format!("{}/{}", OVERVIEW_GROUP, level.key);
        info!(
            "Generating overview ({}): {} samples per bucket",
            level.key, level.decimation
        );
        let array = store
            .create_array(
                &path,
                ArrayMetadata::new(level.layout.clone(), codec).with_dimension_names(&OVERVIEW_DIMENSIONS),
            )
            .await?;
        let (array, d) = (&array, level.decimation);
        stored_bytes += for_each_trace(shape, options.concurrency, move |index| async move {
            write_overview_block(source, array, index, d).await
        })
        .await?;
        decimation = level.decimation;
        overview_shape = level.layout.shape.clone();
    }

    let report = ConversionReport {
        job_id,
        started_at,
        finished_at: Utc::now(),
        output: output.to_string(),
        format: store.format(),
        shape,
        decimation,
        overview_shape,
        traces: shape.trace_count(),
        raw_bytes: plan.raw.total_size_bytes(),
        stored_bytes,
        skipped_attributes: propagation.skipped,
        defaults_added: propagation.defaults_added,
    };
    info!(
        "Job {} done: {} at {} ({:.1}x compression)",
        job_id,
        report.format,
        output,
        report.compression_ratio()
    );
    Ok(report)
}

async fn write_overview_block(
    source: &dyn ArraySource,
    array: &ArrayHandle,
    index: TraceIndex,
    decimation: usize,
) -> Result<usize> {
    let trace = source.read_trace(index).await?;
    let (block, _) = build_overview(&trace, decimation)?.into_raw_vec_and_offset();
    array.write_block(&index.prefix(), &block).await
}

/// Run `task` for every triple, at most `concurrency` at a time, summing the results
async fn for_each_trace<F, Fut>(shape: SampleShape, concurrency: usize, task: F) -> Result<usize>
where
    F: Fn(TraceIndex) -> Fut,
    Fut: Future<Output = Result<usize>>,
{
    let mut pending = stream::iter(shape.traces())
        .map(task)
        .buffer_unordered(concurrency.max(1));
    let mut total = 0;
    while let Some(written) = pending.next().await {
        total += written?;
    }
    Ok(total)
}
