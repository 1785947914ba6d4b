//! # wavezarr
//!
//! Command-line converter from HDF5 waveform files to Zarr stores.
//!
//! ## Usage
//!
//! ```bash
//! # Convert into ./out/capture.zarr
//! wavezarr convert -i capture.hdf -o out
//!
//! # Convert, then copy the store to object storage with the MinIO client
//! wavezarr import -i capture.hdf -o out --bucket waveforms
//!
//! # Describe a converted store
//! wavezarr info out/capture.zarr
//! ```

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use std::path::{Path, PathBuf};

use wavezarr::config::{Config, ConversionConfig};
use wavezarr::convert::{OVERVIEW_GROUP, RAW_ARRAY};
use wavezarr::{
    convert_into_dir, hand_off, CalibrationMetadata, ChunkedStore, CompressionMethod,
    ConversionReport, ConvertOptions, FormatPreference, UploadRequest,
};

/// wavezarr - waveform file to Zarr converter
#[derive(Parser)]
#[command(name = "wavezarr")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v for info, -vv for debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a waveform file into <OUTPUT_DIR>/<name>.zarr
    Convert {
        #[command(flatten)]
        job: JobArgs,
    },

    /// Convert a waveform file, then upload the store with the MinIO client
    Import {
        #[command(flatten)]
        job: JobArgs,

        /// Destination bucket
        #[arg(long, env = "S3_BUCKET_NAME")]
        bucket: Option<String>,

        /// Object key prefix (defaults to the store name without extension)
        #[arg(long)]
        key: Option<String>,

        /// Keep the local store after uploading
        #[arg(long)]
        keep_local: bool,

        /// Only convert
        #[arg(long)]
        skip_upload: bool,

        /// MinIO client executable
        #[arg(long, value_name = "PATH")]
        mc_binary: Option<String>,

        /// MinIO client alias of the object store
        #[arg(long)]
        mc_alias: Option<String>,
    },

    /// Display information about a converted store
    Info {
        /// Store directory
        #[arg(value_name = "STORE")]
        store: PathBuf,
    },
}

#[derive(Args)]
struct JobArgs {
    /// Input waveform file (.hdf, .h5)
    #[arg(short, long, value_name = "FILE")]
    input: PathBuf,

    /// Output directory for the .zarr store
    #[arg(short, long, value_name = "DIR")]
    output_dir: PathBuf,

    /// Load settings from a TOML config file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Samples per raw chunk
    #[arg(long)]
    chunk_length: Option<usize>,

    /// Chunk compressor (zstd, gzip, zlib, none)
    #[arg(short = 'c', long, value_parser = parse_compression)]
    compression: Option<CompressionMethod>,

    /// Compression level
    #[arg(short = 'l', long)]
    level: Option<i32>,

    /// Compress without byte shuffling
    #[arg(long)]
    no_shuffle: bool,

    /// Store format (auto, v2, v3)
    #[arg(short = 'f', long, value_parser = parse_format)]
    format: Option<FormatPreference>,

    /// Target number of overview buckets per trace
    #[arg(long)]
    overview_buckets: Option<usize>,

    /// Traces converted at once
    #[arg(short = 'j', long)]
    jobs: Option<usize>,

    /// Print the conversion report as JSON
    #[arg(long)]
    json: bool,
}

fn parse_compression(name: &str) -> std::result::Result<CompressionMethod, String> {
    CompressionMethod::from_name(name).ok_or_else(|| format!("unknown compression '{}'", name))
}

fn parse_format(name: &str) -> std::result::Result<FormatPreference, String> {
    FormatPreference::from_name(name).ok_or_else(|| format!("unknown format '{}'", name))
}

impl JobArgs {
    fn load_config(&self) -> Result<Config> {
        match &self.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display())),
            None => Ok(Config::default()),
        }
    }

    /// Flags given on the command line, as a `[conversion]` overlay
    fn overrides(&self) -> ConversionConfig {
        ConversionConfig {
            chunk_length: self.chunk_length,
            compression: self.compression,
            compression_level: self.level,
            shuffle: self.no_shuffle.then_some(false),
            format: self.format,
            overview_buckets: self.overview_buckets,
            concurrency: self.jobs,
        }
    }

    /// Defaults, then the config file, then flags
    fn options(&self, config: &Config) -> ConvertOptions {
        config.convert_options_with(&self.overrides())
    }

    async fn run(&self, config: &Config) -> Result<(PathBuf, ConversionReport)> {
        let options = self.options(config);
        let (store, report) = match convert_into_dir(&self.input, &self.output_dir, &options).await {
            Ok(done) => done,
            Err(e) if e.is_source_error() => {
                return Err(e)
                    .with_context(|| format!("Cannot read {} (nothing was written)", self.input.display()))
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to convert {}", self.input.display()))
            }
        };

        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print_report(&store, &report);
        }
        Ok((store, report))
    }
}

fn print_report(store: &Path, report: &ConversionReport) {
    println!("Conversion complete: {}", store.display());
    println!("  Format:       {}", report.format);
    println!("  Shape:        {}", report.shape);
    println!("  Overview:     {:?} (decimation {})", report.overview_shape, report.decimation);
    println!(
        "  Size:         {:.2} MB -> {:.2} MB ({:.1}x)",
        report.raw_bytes as f64 / 1_048_576.0,
        report.stored_bytes as f64 / 1_048_576.0,
        report.compression_ratio()
    );
    if !report.skipped_attributes.is_empty() {
        println!("  Skipped:      {}", report.skipped_attributes.join(", "));
    }
    if !report.defaults_added.is_empty() {
        println!("  Defaulted:    {}", report.defaults_added.join(", "));
    }
    println!("  Elapsed:      {} ms", report.elapsed().num_milliseconds());
}

async fn info(path: &Path) -> Result<()> {
    let url = path
        .to_str()
        .with_context(|| format!("Not a UTF-8 path: {}", path.display()))?;
    let store = ChunkedStore::open(url)
        .await
        .with_context(|| format!("Failed to open store {}", path.display()))?;

    println!("Store Information");
    println!("=================");
    println!("Store:  {}", path.display());
    println!("Format: {}", store.format());
    println!();

    let raw = store.open_array(RAW_ARRAY).await.context("Store has no raw array")?;
    println!("Arrays:");
    println!("  {}: {}", RAW_ARRAY, raw.layout().summary());
    for level in store.array_names(OVERVIEW_GROUP).await? {
        let array = store.open_array(&format!("{}/{}", OVERVIEW_GROUP, level)).await?;
        println!("  {}/{}: {}", OVERVIEW_GROUP, level, array.layout().summary());
    }
    println!();

    let shape = raw.shape();
    let calibration = CalibrationMetadata::from_attributes(&store.attributes(), shape[0], shape[1])
        .context("Invalid calibration attributes")?;
    println!("Calibration:");
    println!("  horiz_interval: {:e} s", calibration.horiz_interval);
    for ((c, f), gain) in calibration.gains.indexed_iter() {
        println!(
            "  ch={}, trc={}: gain {}, offset {}",
            c + 1,
            f + 1,
            gain,
            calibration.offsets[[c, f]]
        );
    }

    println!();
    println!("Attributes:");
    for (key, value) in store.attributes() {
        println!("  {}: {}", key, value);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    match cli.command {
        Commands::Convert { job } => {
            let config = job.load_config()?;
            job.run(&config).await?;
        }
        Commands::Import {
            job,
            bucket,
            key,
            keep_local,
            skip_upload,
            mc_binary,
            mc_alias,
        } => {
            let config = job.load_config()?;
            let (store, _) = job.run(&config).await?;

            if skip_upload {
                info!("Upload skipped (--skip-upload)");
                return Ok(());
            }

            let bucket = bucket
                .or_else(|| config.upload.bucket.clone())
                .context("No bucket given: pass --bucket, set S3_BUCKET_NAME or [upload].bucket")?;
            let key = match key {
                Some(key) => key,
                None => store
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .map(str::to_string)
                    .context("Cannot derive an object key from the store name")?,
            };

            let mut uploader = config.upload.uploader();
            if let Some(binary) = mc_binary {
                uploader = uploader.with_binary(binary);
            }
            if let Some(alias) = mc_alias {
                uploader = uploader.with_alias(alias);
            }
            let request = UploadRequest::new(bucket, key)
                .with_keep_local(keep_local || config.upload.keep_local.unwrap_or(false));

            hand_off(&store, &uploader, &request)
                .await
                .with_context(|| format!("Failed to upload {}", store.display()))?;
            println!(
                "Uploaded {} to s3://{}/{}",
                store.display(),
                request.bucket,
                request.remote_key
            );
        }
        Commands::Info { store } => info(&store).await?,
    }

    Ok(())
}
