//! On-disk schema revisions of the chunked store.
//!
//! Two interchangeable strategies describe the same logical hierarchy as `zarrs`
//! metadata:
//!
//! - [`V3Strategy`]: Zarr v3, one `zarr.json` per node, chunk keys `c/0/0/0/0`
//! - [`V2Strategy`]: Zarr v2, `.zgroup`/`.zarray`/`.zattrs`, chunk keys `0.0.0.0`
//!
//! Documents, chunk keys and codecs are produced by `zarrs`; a strategy only decides
//! which metadata object to hand it. A strategy is chosen once per destination by
//! [`negotiate`].

use crate::compression::{ChunkCodec, CompressionLevel, CompressionMethod};
use crate::error::{ConvertError, Result};
use crate::layout::{ArrayLayout, ChunkGeometry};
use crate::types::DataType;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::num::NonZeroU64;
use std::sync::Arc;
use zarrs::array::builder::ArrayBuilderFillValue;
use zarrs::array::codec::{BytesCodec, GzipCodec, ShuffleCodec, ZstdCodec};
use zarrs::array::{
    ArrayBuilder, ArrayMetadata as ZarrArrayMetadata, ArrayMetadataV2, BytesToBytesCodecTraits,
};
use zarrs::metadata::v2::{DataTypeMetadataV2, GroupMetadataV2, MetadataV2};
use zarrs::metadata::v3::GroupMetadataV3;
use zarrs::metadata::GroupMetadata;

/// Store attribute mapping
pub type Attributes = Map<String, Value>;

/// Attribute under which Zarr v2 readers (xarray) look for axis names
pub const V2_DIMENSIONS_ATTR: &str = "_ARRAY_DIMENSIONS";

/// Schema revision of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZarrFormat {
    V2,
    V3,
}

impl fmt::Display for ZarrFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZarrFormat::V2 => f.write_str("Zarr v2"),
            ZarrFormat::V3 => f.write_str("Zarr v3"),
        }
    }
}

/// Which revision a new store should use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatPreference {
    /// Newest revision that can express the requested codec
    #[default]
    Auto,
    V2,
    V3,
}

impl FormatPreference {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "auto" => Some(FormatPreference::Auto),
            "2" | "v2" => Some(FormatPreference::V2),
            "3" | "v3" => Some(FormatPreference::V3),
            _ => None,
        }
    }
}

/// Everything needed to create or read one array
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayMetadata {
    pub layout: ArrayLayout,
    pub codec: ChunkCodec,
    pub dimension_names: Option<Vec<String>>,
}

impl ArrayMetadata {
    pub fn new(layout: ArrayLayout, codec: ChunkCodec) -> Self {
        Self {
            layout,
            codec,
            dimension_names: None,
        }
    }

    pub fn with_dimension_names(mut self, names: &[&str]) -> Self {
        self.dimension_names = Some(names.iter().map(|n| n.to_string()).collect());
        self
    }
}

/// Metadata encoding of one schema revision
pub trait FormatStrategy: Send + Sync {
    fn format(&self) -> ZarrFormat;

    /// Fails with [`ConvertError::Incompatible`] when this revision cannot express `codec`
    fn check_codec(&self, codec: &ChunkCodec, data_type: DataType) -> Result<()>;

    /// `zarrs` metadata of a group holding `attributes`
    fn group_metadata(&self, attributes: &Attributes) -> GroupMetadata;

    /// `zarrs` metadata of the array described by `metadata`
    fn array_metadata(&self, metadata: &ArrayMetadata) -> Result<ZarrArrayMetadata>;
}

/// Strategy for an explicit revision
pub fn strategy_for(format: ZarrFormat) -> Box<dyn FormatStrategy> {
    match format {
        ZarrFormat::V2 => Box::new(V2Strategy),
        ZarrFormat::V3 => Box::new(V3Strategy),
    }
}

/// Choose the strategy for a new destination.
///
/// `Auto` tries v3 first and falls back to v2 when v3 reports the codec as incompatible.
pub fn negotiate(
    preference: FormatPreference,
    codec: &ChunkCodec,
    data_type: DataType,
) -> Result<Box<dyn FormatStrategy>> {
    match preference {
        FormatPreference::V2 | FormatPreference::V3 => {
            let format = if preference == FormatPreference::V2 {
                ZarrFormat::V2
            } else {
                ZarrFormat::V3
            };
            let strategy = strategy_for(format);
            strategy.check_codec(codec, data_type)?;
            Ok(strategy)
        }
        FormatPreference::Auto => match V3Strategy.check_codec(codec, data_type) {
            Ok(()) => Ok(Box::new(V3Strategy)),
            Err(ConvertError::Incompatible { reason, .. }) => {
                info!("Zarr v3 cannot store this array ({}), using Zarr v2", reason);
                V2Strategy.check_codec(codec, data_type)?;
                Ok(Box::new(V2Strategy))
            }
            Err(e) => Err(e),
        },
    }
}

/// Read our description of an array back out of the metadata `zarrs` opened
pub fn describe_array(metadata: &ZarrArrayMetadata) -> Result<ArrayMetadata> {
    match metadata {
        ZarrArrayMetadata::V3(v3) => {
            let doc = serde_json::to_value(v3)?;
            let data_type = DataType::from_v3_name(str_field(&doc, "data_type")?)?;
            let layout = layout_of(&doc["shape"], &doc["chunk_grid"]["configuration"]["chunk_shape"], data_type)?;
            let codec = V3Strategy::codec_of(&doc["codecs"])?;
            Ok(ArrayMetadata {
                layout,
                codec,
                dimension_names: names_of(&doc["dimension_names"]),
            })
        }
        ZarrArrayMetadata::V2(v2) => {
            let doc = serde_json::to_value(v2)?;
            let data_type = DataType::from_v2_typestr(str_field(&doc, "dtype")?)?;
            let layout = layout_of(&doc["shape"], &doc["chunks"], data_type)?;
            let codec = V2Strategy::codec_of(&doc["compressor"])?;
            Ok(ArrayMetadata {
                layout,
                codec,
                dimension_names: v2.attributes.get(V2_DIMENSIONS_ATTR).and_then(names_of),
            })
        }
    }
}

fn str_field<'a>(doc: &'a Value, key: &str) -> Result<&'a str> {
    doc[key]
        .as_str()
        .ok_or_else(|| ConvertError::Metadata(format!("array metadata has no string '{}'", key)))
}

fn extents(value: &Value) -> Option<Vec<usize>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_u64().map(|n| n as usize))
        .collect()
}

fn layout_of(shape: &Value, chunks: &Value, data_type: DataType) -> Result<ArrayLayout> {
    let shape = extents(shape).ok_or_else(|| ConvertError::Metadata("array shape is not a list of extents".to_string()))?;
    let chunks = extents(chunks)
        .ok_or_else(|| ConvertError::Metadata("only regular chunk grids are supported".to_string()))?;
    ArrayLayout::new(shape, data_type, ChunkGeometry::new(chunks)?)
}

fn names_of(value: &Value) -> Option<Vec<String>> {
    value
        .as_array()?
        .iter()
        .map(|name| name.as_str().map(str::to_string))
        .collect()
}

fn level_of(config: &Value, key: &str) -> CompressionLevel {
    config[key]
        .as_i64()
        .map(|l| CompressionLevel::new(l as i32))
        .unwrap_or_default()
}

fn u64_extents(extents: &[usize]) -> Vec<u64> {
    extents.iter().map(|&e| e as u64).collect()
}

fn fill_value(data_type: DataType) -> ArrayBuilderFillValue {
    match data_type {
        DataType::U8 => 0u8.into(),
        DataType::U16 => 0u16.into(),
        DataType::I16 => 0i16.into(),
        DataType::I32 => 0i32.into(),
        DataType::I64 => 0i64.into(),
        DataType::F32 => 0f32.into(),
        DataType::F64 => 0f64.into(),
    }
}

fn incompatible(format: ZarrFormat, reason: &str) -> ConvertError {
    ConvertError::Incompatible {
        format: format.to_string(),
        reason: reason.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Zarr v3

/// Zarr v3 metadata strategy (preferred)
#[derive(Debug, Default, Clone, Copy)]
pub struct V3Strategy;

impl V3Strategy {
    fn codecs(codec: &ChunkCodec, data_type: DataType) -> Result<Vec<Arc<dyn BytesToBytesCodecTraits>>> {
        let mut codecs: Vec<Arc<dyn BytesToBytesCodecTraits>> = Vec::new();
        if codec.shuffle {
            codecs.push(Arc::new(ShuffleCodec::new(data_type.size_in_bytes())));
        }
        match codec.compression {
            CompressionMethod::None => {}
            CompressionMethod::Zstd => codecs.push(Arc::new(ZstdCodec::new(codec.level.zstd(), false))),
            CompressionMethod::Gzip => {
                let gzip = GzipCodec::new(codec.level.flate())
                    .map_err(|e| ConvertError::Configuration(e.to_string()))?;
                codecs.push(Arc::new(gzip));
            }
            // zarrs has zlib only as the `numcodecs.zlib` extension, which v3 readers need not know
            CompressionMethod::Zlib => return Err(incompatible(ZarrFormat::V3, "no registered codec for zlib")),
        }
        Ok(codecs)
    }

    fn codec_of(codecs: &Value) -> Result<ChunkCodec> {
        let mut codec = ChunkCodec::new(CompressionMethod::None, CompressionLevel::default()).with_shuffle(false);
        for entry in codecs.as_array().into_iter().flatten() {
            let config = &entry["configuration"];
            match entry["name"].as_str().unwrap_or_default() {
                "bytes" => {}
                "shuffle" | "numcodecs.shuffle" => codec.shuffle = true,
                "zstd" => {
                    codec.compression = CompressionMethod::Zstd;
                    codec.level = level_of(config, "level");
                }
                "gzip" => {
                    codec.compression = CompressionMethod::Gzip;
                    codec.level = level_of(config, "level");
                }
                "zlib" | "numcodecs.zlib" => {
                    codec.compression = CompressionMethod::Zlib;
                    codec.level = level_of(config, "level");
                }
                other => {
                    return Err(ConvertError::Metadata(format!("unsupported Zarr v3 codec '{}'", other)));
                }
            }
        }
        Ok(codec)
    }
}

impl FormatStrategy for V3Strategy {
    fn format(&self) -> ZarrFormat {
        ZarrFormat::V3
    }

    fn check_codec(&self, codec: &ChunkCodec, data_type: DataType) -> Result<()> {
        Self::codecs(codec, data_type).map(|_| ())
    }

    fn group_metadata(&self, attributes: &Attributes) -> GroupMetadata {
        let mut group = GroupMetadataV3::default();
        group.attributes = attributes.clone();
        GroupMetadata::V3(group)
    }

    fn array_metadata(&self, metadata: &ArrayMetadata) -> Result<ZarrArrayMetadata> {
        let layout = &metadata.layout;
        let mut builder = ArrayBuilder::new(
            u64_extents(&layout.shape),
            u64_extents(layout.chunks.dims()),
            layout.data_type.v3_name(),
            fill_value(layout.data_type),
        );
        builder
            .array_to_bytes_codec(Arc::new(BytesCodec::little()))
            .bytes_to_bytes_codecs(Self::codecs(&metadata.codec, layout.data_type)?)
            .dimension_names(metadata.dimension_names.clone());
        Ok(ZarrArrayMetadata::V3(builder.build_metadata()?))
    }
}

// ---------------------------------------------------------------------------
// Zarr v2

/// Zarr v2 metadata strategy (legacy, what older browser clients read).
///
/// Plain compressors map to the numcodecs compressor of the same name. Shuffled
/// chunks go through a numcodecs `blosc` compressor, since v2 has no shuffle
/// stage between the filters and the compressor.
#[derive(Debug, Default, Clone, Copy)]
pub struct V2Strategy;

impl V2Strategy {
    fn compressor(codec: &ChunkCodec) -> Result<Option<Value>> {
        let level = codec.level;
        if codec.shuffle {
            let (cname, clevel) = match codec.compression {
                CompressionMethod::None => ("zstd", 0),
                CompressionMethod::Zstd => ("zstd", level.flate()),
                CompressionMethod::Zlib => ("zlib", level.flate()),
                CompressionMethod::Gzip => {
                    return Err(incompatible(ZarrFormat::V2, "blosc cannot shuffle into gzip framing"))
                }
            };
            return Ok(Some(json!({
                "id": "blosc",
                "cname": cname,
                "clevel": clevel,
                "shuffle": 1,
                "blocksize": 0,
            })));
        }
        Ok(match codec.compression {
            CompressionMethod::None => None,
            CompressionMethod::Zstd => Some(json!({ "id": "zstd", "level": level.zstd() })),
            CompressionMethod::Gzip => Some(json!({ "id": "gzip", "level": level.flate() })),
            CompressionMethod::Zlib => Some(json!({ "id": "zlib", "level": level.flate() })),
        })
    }

    fn codec_of(compressor: &Value) -> Result<ChunkCodec> {
        let plain = |method| ChunkCodec::new(method, level_of(compressor, "level")).with_shuffle(false);
        match compressor["id"].as_str() {
            None => Ok(ChunkCodec::new(CompressionMethod::None, CompressionLevel::default()).with_shuffle(false)),
            Some("zstd") => Ok(plain(CompressionMethod::Zstd)),
            Some("gzip") => Ok(plain(CompressionMethod::Gzip)),
            Some("zlib") => Ok(plain(CompressionMethod::Zlib)),
            Some("blosc") => {
                let level = level_of(compressor, "clevel");
                let method = match (compressor["cname"].as_str(), level.value()) {
                    (_, 0) => CompressionMethod::None,
                    (Some("zstd"), _) => CompressionMethod::Zstd,
                    (Some("zlib"), _) => CompressionMethod::Zlib,
                    (cname, _) => {
                        return Err(ConvertError::Metadata(format!("unsupported blosc compressor {:?}", cname)));
                    }
                };
                let level = if method == CompressionMethod::None { CompressionLevel::default() } else { level };
                let shuffle = compressor["shuffle"].as_i64().unwrap_or(0) != 0;
                Ok(ChunkCodec::new(method, level).with_shuffle(shuffle))
            }
            Some(other) => Err(ConvertError::Metadata(format!("unsupported Zarr v2 compressor '{}'", other))),
        }
    }
}

impl FormatStrategy for V2Strategy {
    fn format(&self) -> ZarrFormat {
        ZarrFormat::V2
    }

    fn check_codec(&self, codec: &ChunkCodec, _data_type: DataType) -> Result<()> {
        Self::compressor(codec).map(|_| ())
    }

    fn group_metadata(&self, attributes: &Attributes) -> GroupMetadata {
        let mut group = GroupMetadataV2::default();
        group.attributes = attributes.clone();
        GroupMetadata::V2(group)
    }

    fn array_metadata(&self, metadata: &ArrayMetadata) -> Result<ZarrArrayMetadata> {
        let layout = &metadata.layout;
        let chunks: Vec<NonZeroU64> = layout
            .chunks
            .dims()
            .iter()
            .filter_map(|&d| NonZeroU64::new(d as u64))
            .collect();
        let compressor = Self::compressor(&metadata.codec)?
            .map(serde_json::from_value::<MetadataV2>)
            .transpose()?;

        let mut v2 = ArrayMetadataV2::new(
            u64_extents(&layout.shape),
            chunks
                .try_into()
                .map_err(|_| ConvertError::InvalidDimensions(format!("bad chunk shape {:?}", layout.chunks.dims())))?,
            DataTypeMetadataV2::Simple(layout.data_type.v2_typestr().to_string()),
            serde_json::from_value(json!(0))?,
            compressor,
            None,
        );
        if let Some(names) = &metadata.dimension_names {
            v2.attributes.insert(V2_DIMENSIONS_ATTR.to_string(), json!(names));
        }
        Ok(ZarrArrayMetadata::V2(v2))
    }
}
