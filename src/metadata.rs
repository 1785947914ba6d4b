//! Calibration metadata: carrying source attributes into the store root

use crate::error::{ConvertError, Result};
use crate::format::Attributes;
use crate::source::{ArraySource, AttrValue};
use crate::store::ChunkedStore;
use log::{info, warn};
use ndarray::{Array2, ArrayD, IxDyn};
use serde_json::{Number, Value};

/// Per-(channel, recording_file) gain grid
pub const VERTICAL_GAINS: &str = "vertical_gains";
/// Per-(channel, recording_file) offset grid
pub const VERTICAL_OFFSETS: &str = "vertical_offsets";
/// Seconds between samples
pub const HORIZ_INTERVAL: &str = "horiz_interval";
pub const HORIZ_OFFSET: &str = "horiz_offset";

const VERTICAL_GAIN: &str = "vertical_gain";
const VERTICAL_OFFSET: &str = "vertical_offset";

pub const DEFAULT_GAIN: f64 = 1.0;
pub const DEFAULT_OFFSET: f64 = 0.0;
pub const DEFAULT_HORIZ_INTERVAL: f64 = 1e-9;

/// What happened to the source metadata
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropagationReport {
    /// Attributes copied as-is
    pub copied: usize,
    /// Attributes (or calibration tables) left out, by name
    pub skipped: Vec<String>,
    /// Required attributes filled with defaults
    pub defaults_added: Vec<String>,
}

/// Encode one source attribute as JSON.
///
/// Non-finite floats and opaque byte blobs have no JSON form.
pub fn encode_attribute(name: &str, value: &AttrValue) -> Result<Value> {
    let fail = |reason: &str| ConvertError::AttributeEncoding {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    match value {
        AttrValue::Bool(b) => Ok(Value::Bool(*b)),
        AttrValue::Int(i) => Ok(Value::from(*i)),
        AttrValue::Float(f) => float_value(*f).ok_or_else(|| fail("non-finite float")),
        AttrValue::Text(s) => Ok(Value::String(s.clone())),
        AttrValue::IntArray { shape, data } => {
            check_len(shape, data.len()).map_err(|r| fail(&r))?;
            nest(shape, data.as_slice(), &|v: i64| Some(Value::from(v))).ok_or_else(|| fail("malformed array"))
        }
        AttrValue::FloatArray { shape, data } => {
            check_len(shape, data.len()).map_err(|r| fail(&r))?;
            nest(shape, data.as_slice(), &float_value).ok_or_else(|| fail("array holds non-finite floats"))
        }
        AttrValue::Unsupported(kind) => Err(fail(&format!("no JSON form for {}", kind))),
    }
}

/// Encode an n-d array as nested JSON lists (a 0-D array as a bare number)
pub fn array_to_json(array: &ArrayD<f64>) -> Option<Value> {
    let data: Vec<f64> = array.iter().copied().collect();
    nest(array.shape(), data.as_slice(), &float_value)
}

/// Parse nested JSON lists of numbers into an n-d array
pub fn json_to_array(value: &Value) -> Option<ArrayD<f64>> {
    // the shape follows the first element at every depth; everything else must agree
    let mut shape = Vec::new();
    let mut cursor = value;
    while let Value::Array(items) = cursor {
        shape.push(items.len());
        match items.first() {
            Some(first) => cursor = first,
            None => break,
        }
    }
    let mut data = Vec::new();
    collect_numbers(value, &shape, &mut data)?;
    ArrayD::from_shape_vec(IxDyn(&shape), data).ok()
}

fn collect_numbers(value: &Value, shape: &[usize], data: &mut Vec<f64>) -> Option<()> {
    match (value, shape.split_first()) {
        (Value::Number(n), None) => {
            data.push(n.as_f64()?);
            Some(())
        }
        (Value::Array(items), Some((&extent, rest))) if items.len() == extent => {
            for item in items {
                collect_numbers(item, rest, data)?;
            }
            Some(())
        }
        _ => None,
    }
}

fn float_value(v: f64) -> Option<Value> {
    Number::from_f64(v).map(Value::Number)
}

fn check_len(shape: &[usize], len: usize) -> std::result::Result<(), String> {
    let expected: usize = shape.iter().product();
    if expected == len {
        Ok(())
    } else {
        Err(format!("shape {:?} needs {} values, has {}", shape, expected, len))
    }
}

fn nest<T: Copy>(shape: &[usize], data: &[T], leaf: &dyn Fn(T) -> Option<Value>) -> Option<Value> {
    match shape.split_first() {
        None => leaf(*data.first()?),
        Some((&extent, rest)) => {
            let stride: usize = rest.iter().product();
            (0..extent)
                .map(|i| nest(rest, data.get(i * stride..(i + 1) * stride)?, leaf))
                .collect::<Option<Vec<_>>>()
                .map(Value::Array)
        }
    }
}

/// Bring a gain or offset table to `(channels, recording_files)`.
///
/// A scalar, or one value per channel, is broadcast across recording files.
pub fn normalize_grid(array: &ArrayD<f64>, channels: usize, files: usize) -> Option<Array2<f64>> {
    if array.iter().any(|v| !v.is_finite()) {
        return None;
    }
    match array.shape() {
        [] => array
            .first()
            .map(|&v| Array2::from_elem((channels, files), v)),
        [n] if *n == channels => Some(Array2::from_shape_fn((channels, files), |(c, _)| array[[c]])),
        [c, f] if *c == channels && *f == files => {
            Some(Array2::from_shape_fn((channels, files), |(c, f)| array[[c, f]]))
        }
        _ => None,
    }
}

fn grid_to_json(grid: &Array2<f64>) -> Value {
    Value::Array(
        grid.rows()
            .into_iter()
            .map(|row| Value::Array(row.iter().filter_map(|&v| float_value(v)).collect()))
            .collect(),
    )
}

/// Insert defaults for any missing calibration attribute; returns the names added
pub fn ensure_required_attrs(attrs: &mut Attributes, channels: usize, files: usize) -> Vec<&'static str> {
    let defaults = [
        (VERTICAL_GAINS, grid_to_json(&Array2::from_elem((channels, files), DEFAULT_GAIN))),
        (VERTICAL_OFFSETS, grid_to_json(&Array2::from_elem((channels, files), DEFAULT_OFFSET))),
        (HORIZ_INTERVAL, Value::from(DEFAULT_HORIZ_INTERVAL)),
    ];

    let mut added = Vec::new();
    for (key, value) in defaults {
        if !attrs.contains_key(key) {
            info!("Added missing attribute {}", key);
            attrs.insert(key.to_string(), value);
            added.push(key);
        }
    }
    added
}

/// Build the complete root attribute set for `source`
pub async fn collect_attributes(source: &dyn ArraySource) -> Result<(Attributes, PropagationReport)> {
    let shape = source.shape();
    let mut attrs = Attributes::new();
    let mut report = PropagationReport::default();

    for (name, value) in source.attributes() {
        match encode_attribute(name, value) {
            Ok(json) => {
                attrs.insert(name.clone(), json);
                report.copied += 1;
            }
            Err(e) => {
                warn!("Skipped attribute: {}", e);
                report.skipped.push(name.clone());
            }
        }
    }

    for (singular, plural) in [(VERTICAL_GAIN, VERTICAL_GAINS), (VERTICAL_OFFSET, VERTICAL_OFFSETS)] {
        let table = match source.read_dataset(singular).await? {
            Some(dataset) => Some(dataset),
            None => source
                .attributes()
                .get(singular)
                .or_else(|| source.attributes().get(plural))
                .and_then(AttrValue::to_array),
        };
        attrs.remove(singular);
        let Some(table) = table else {
            if source.attributes().contains_key(singular) || source.attributes().contains_key(plural) {
                warn!("Dropped {}: not a numeric table", plural);
                attrs.remove(plural);
                report.skipped.push(plural.to_string());
            }
            continue;
        };
        match normalize_grid(&table, shape.channels, shape.recording_files) {
            Some(grid) => {
                attrs.insert(plural.to_string(), grid_to_json(&grid));
            }
            None => {
                warn!(
                    "Dropped {} of shape {:?}: expected a scalar, {} values or {} x {}",
                    plural,
                    table.shape(),
                    shape.channels,
                    shape.channels,
                    shape.recording_files
                );
                attrs.remove(plural);
                report.skipped.push(plural.to_string());
            }
        }
    }

    if let Some(offset) = source.read_dataset(HORIZ_OFFSET).await? {
        match array_to_json(&offset) {
            Some(value) => {
                attrs.insert(HORIZ_OFFSET.to_string(), value);
            }
            None => {
                warn!("Skipped dataset {}: non-finite values", HORIZ_OFFSET);
                report.skipped.push(HORIZ_OFFSET.to_string());
            }
        }
    }

    report.defaults_added = ensure_required_attrs(&mut attrs, shape.channels, shape.recording_files)
        .into_iter()
        .map(String::from)
        .collect();
    Ok((attrs, report))
}

/// Copy `source`'s metadata into the store root in a single write
pub async fn propagate(source: &dyn ArraySource, store: &ChunkedStore) -> Result<PropagationReport> {
    let (attrs, report) = collect_attributes(source).await?;
    store.set_attributes(attrs).await?;
    Ok(report)
}

/// Calibration of a converted store
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationMetadata {
    /// `(channels, recording_files)`
    pub gains: Array2<f64>,
    /// `(channels, recording_files)`
    pub offsets: Array2<f64>,
    pub horiz_interval: f64,
}

impl CalibrationMetadata {
    /// Gain 1, offset 0, 1 ns sampling
    pub fn defaults(channels: usize, files: usize) -> Self {
        Self {
            gains: Array2::from_elem((channels, files), DEFAULT_GAIN),
            offsets: Array2::from_elem((channels, files), DEFAULT_OFFSET),
            horiz_interval: DEFAULT_HORIZ_INTERVAL,
        }
    }

    /// Read calibration from root attributes. Absent entries take the defaults.
    pub fn from_attributes(attrs: &Attributes, channels: usize, files: usize) -> Result<Self> {
        let mut calibration = Self::defaults(channels, files);

        let grid = |key: &str| -> Result<Option<Array2<f64>>> {
            let Some(value) = attrs.get(key) else {
                return Ok(None);
            };
            json_to_array(value)
                .and_then(|table| normalize_grid(&table, channels, files))
                .map(Some)
                .ok_or_else(|| {
                    ConvertError::Metadata(format!(
                        "{} is not a {} x {} table of numbers",
                        key, channels, files
                    ))
                })
        };
        if let Some(gains) = grid(VERTICAL_GAINS)? {
            calibration.gains = gains;
        }
        if let Some(offsets) = grid(VERTICAL_OFFSETS)? {
            calibration.offsets = offsets;
        }
        if let Some(value) = attrs.get(HORIZ_INTERVAL) {
            calibration.horiz_interval = value
                .as_f64()
                .filter(|v| v.is_finite() && *v > 0.0)
                .ok_or_else(|| ConvertError::Metadata(format!("{} must be a positive number", HORIZ_INTERVAL)))?;
        }
        Ok(calibration)
    }

    /// `adc * gain + offset` for one recording
    pub fn voltage(&self, adc: i16, channel: usize, recording_file: usize) -> Option<f64> {
        let gain = self.gains.get((channel, recording_file))?;
        let offset = self.offsets.get((channel, recording_file))?;
        Some(f64::from(adc) * gain + offset)
    }

    /// Seconds from the first sample to sample `index`
    pub fn sample_time(&self, index: usize) -> f64 {
        index as f64 * self.horiz_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use ndarray::{arr1, arr2, Array4};
    use serde_json::json;

    fn source(c: usize, f: usize) -> MemorySource {
        MemorySource::new(Array4::zeros((c, f, 1, 16))).unwrap()
    }

    #[test]
    fn test_encode_attribute() {
        assert_eq!(encode_attribute("a", &AttrValue::Int(3)).unwrap(), json!(3));
        assert_eq!(encode_attribute("a", &AttrValue::Text("x".into())).unwrap(), json!("x"));
        let table = AttrValue::FloatArray {
            shape: vec![2, 2],
            data: vec![1.0, 2.0, 3.0, 4.0],
        };
        assert_eq!(encode_attribute("a", &table).unwrap(), json!([[1.0, 2.0], [3.0, 4.0]]));

        for bad in [
            AttrValue::Float(f64::NAN),
            AttrValue::Unsupported("opaque".into()),
            AttrValue::FloatArray { shape: vec![2], data: vec![1.0, f64::INFINITY] },
            AttrValue::IntArray { shape: vec![3], data: vec![1] },
        ] {
            assert!(matches!(
                encode_attribute("bad", &bad),
                Err(ConvertError::AttributeEncoding { .. })
            ));
        }
    }

    #[test]
    fn test_json_arrays() {
        let nested = json!([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        let array = json_to_array(&nested).unwrap();
        assert_eq!(array.shape(), &[2, 3]);
        assert_eq!(array_to_json(&array).unwrap(), nested);
        assert_eq!(json_to_array(&json!(2.5)).unwrap().ndim(), 0);
        assert!(json_to_array(&json!([[1.0], [2.0, 3.0]])).is_none());
        assert!(json_to_array(&json!([1.0, [2.0]])).is_none());
        assert!(json_to_array(&json!(["x"])).is_none());
    }

    #[test]
    fn test_normalize_grid() {
        let scalar = ArrayD::from_elem(IxDyn(&[]), 0.5);
        assert_eq!(normalize_grid(&scalar, 2, 3).unwrap(), Array2::from_elem((2, 3), 0.5));

        let per_channel = arr1(&[1.0, 2.0]).into_dyn();
        assert_eq!(
            normalize_grid(&per_channel, 2, 3).unwrap(),
            arr2(&[[1.0, 1.0, 1.0], [2.0, 2.0, 2.0]])
        );

        let full = arr2(&[[1.0, 2.0], [3.0, 4.0]]).into_dyn();
        assert_eq!(normalize_grid(&full, 2, 2).unwrap()[[1, 0]], 3.0);

        assert!(normalize_grid(&arr1(&[1.0, 2.0, 3.0]).into_dyn(), 2, 3).is_none());
        assert!(normalize_grid(&full, 2, 3).is_none());
    }

    #[test]
    fn test_ensure_required_attrs() {
        let mut attrs = Attributes::new();
        attrs.insert(HORIZ_INTERVAL.to_string(), json!(5e-10));
        let added = ensure_required_attrs(&mut attrs, 2, 3);
        assert_eq!(added, vec![VERTICAL_GAINS, VERTICAL_OFFSETS]);
        assert_eq!(attrs[VERTICAL_GAINS], json!([[1.0, 1.0, 1.0], [1.0, 1.0, 1.0]]));
        assert_eq!(attrs[VERTICAL_OFFSETS], json!([[0.0, 0.0, 0.0], [0.0, 0.0, 0.0]]));
        assert_eq!(attrs[HORIZ_INTERVAL], json!(5e-10));
        assert!(ensure_required_attrs(&mut attrs, 2, 3).is_empty());
    }

    #[tokio::test]
    async fn test_collect_defaults_only() {
        let (attrs, report) = collect_attributes(&source(2, 3)).await.unwrap();
        assert_eq!(attrs.len(), 3);
        assert_eq!(attrs[HORIZ_INTERVAL], json!(1e-9));
        assert_eq!(report.defaults_added.len(), 3);
        assert!(report.skipped.is_empty());
    }

    #[tokio::test]
    async fn test_collect_renames_and_skips() {
        let src = source(2, 1)
            .with_attribute(VERTICAL_GAIN, AttrValue::FloatArray { shape: vec![2], data: vec![0.1, 0.2] })
            .with_attribute("blob", AttrValue::Unsupported("compound".into()))
            .with_attribute("bad_float", f64::INFINITY)
            .with_attribute("operator", "lab-3")
            .with_dataset(VERTICAL_OFFSET, arr2(&[[5.0], [6.0]]).into_dyn())
            .with_dataset(HORIZ_OFFSET, ArrayD::from_elem(IxDyn(&[]), -2e-9));

        let (attrs, report) = collect_attributes(&src).await.unwrap();
        assert!(!attrs.contains_key(VERTICAL_GAIN));
        assert_eq!(attrs[VERTICAL_GAINS], json!([[0.1], [0.2]]));
        assert_eq!(attrs[VERTICAL_OFFSETS], json!([[5.0], [6.0]]));
        assert_eq!(attrs[HORIZ_OFFSET], json!(-2e-9));
        assert_eq!(attrs["operator"], json!("lab-3"));
        assert!(!attrs.contains_key("blob"));
        assert!(!attrs.contains_key("bad_float"));
        assert_eq!(report.skipped, vec!["bad_float".to_string(), "blob".to_string()]);
        assert_eq!(report.defaults_added, vec![HORIZ_INTERVAL.to_string()]);
    }

    #[tokio::test]
    async fn test_dataset_wins_over_attribute() {
        let src = source(1, 2)
            .with_attribute(VERTICAL_GAIN, 9.0)
            .with_dataset(VERTICAL_GAIN, arr2(&[[2.0, 3.0]]).into_dyn());
        let (attrs, _) = collect_attributes(&src).await.unwrap();
        assert_eq!(attrs[VERTICAL_GAINS], json!([[2.0, 3.0]]));
    }

    #[tokio::test]
    async fn test_bad_grid_replaced_by_defaults() {
        let src = source(2, 2).with_dataset(VERTICAL_GAIN, arr1(&[1.0, 2.0, 3.0]).into_dyn());
        let (attrs, report) = collect_attributes(&src).await.unwrap();
        assert_eq!(attrs[VERTICAL_GAINS], json!([[1.0, 1.0], [1.0, 1.0]]));
        assert!(report.skipped.contains(&VERTICAL_GAINS.to_string()));
        assert!(report.defaults_added.contains(&VERTICAL_GAINS.to_string()));
    }

    #[test]
    fn test_calibration_from_attributes() {
        let mut attrs = Attributes::new();
        attrs.insert(VERTICAL_GAINS.to_string(), json!([[0.5, 2.0]]));
        // per-channel lists from older stores broadcast
        attrs.insert(VERTICAL_OFFSETS.to_string(), json!([1.0]));
        attrs.insert(HORIZ_INTERVAL.to_string(), json!(2e-10));

        let cal = CalibrationMetadata::from_attributes(&attrs, 1, 2).unwrap();
        assert_eq!(cal.voltage(100, 0, 1), Some(201.0));
        assert_eq!(cal.voltage(-4, 0, 0), Some(-1.0));
        assert_eq!(cal.voltage(1, 1, 0), None);
        assert!((cal.sample_time(5) - 1e-9).abs() < 1e-24);

        let empty = CalibrationMetadata::from_attributes(&Attributes::new(), 2, 2).unwrap();
        assert_eq!(empty, CalibrationMetadata::defaults(2, 2));

        attrs.insert(VERTICAL_GAINS.to_string(), json!("high"));
        assert!(matches!(
            CalibrationMetadata::from_attributes(&attrs, 1, 2),
            Err(ConvertError::Metadata(_))
        ));
    }
}
