//! Chunked array store - creating, writing and reading Zarr hierarchies through `zarrs`

use crate::compression::ChunkCodec;
use crate::error::{ConvertError, Result};
use crate::format::{
    describe_array, negotiate, strategy_for, ArrayMetadata, Attributes, FormatPreference, FormatStrategy, ZarrFormat,
};
use crate::io::{open_filesystem_store, store_root};
use crate::layout::ArrayLayout;
use crate::types::{DataType, Element};
use log::{debug, info};
use ndarray::ArrayD;
use parking_lot::RwLock;
use std::ops::Range;
use std::sync::Arc;
use zarrs::array::{Array, ArraySubset};
use zarrs::filesystem::FilesystemStore;
use zarrs::group::Group;
use zarrs::storage::{ListableStorageTraits, ReadableStorageTraits, StoreKey, StorePrefix, WritableStorageTraits};

/// Run synchronous `zarrs` work off the async executor
async fn blocking<R, F>(work: F) -> Result<R>
where
    R: Send + 'static,
    F: FnOnce() -> Result<R> + Send + 'static,
{
    tokio::task::spawn_blocking(work).await?
}

/// `zarrs` node path for a `/`-separated store path; the empty path is the root group
fn node_path(path: &str) -> String {
    format!("/{}", path.trim_matches('/'))
}

/// A Zarr hierarchy on local storage
pub struct ChunkedStore {
    location: String,
    storage: Arc<FilesystemStore>,
    strategy: Arc<dyn FormatStrategy>,
    attributes: RwLock<Attributes>,
}

impl ChunkedStore {
    /// Create a fresh store at `url`, destroying anything already there.
    ///
    /// The schema revision is negotiated once, here, for every array the store will hold.
    pub async fn create(
        url: impl Into<String>,
        preference: FormatPreference,
        codec: &ChunkCodec,
        data_type: DataType,
    ) -> Result<Self> {
        let location = url.into();
        let strategy: Arc<dyn FormatStrategy> = Arc::from(negotiate(preference, codec, data_type)?);
        let root = store_root(&location)?;
        let storage = open_filesystem_store(&root)?;

        if tokio::fs::try_exists(&root).await? {
            info!("Replacing existing store at {}", location);
            let wipe = Arc::clone(&storage);
            blocking(move || Ok(wipe.erase_prefix(&StorePrefix::root())?)).await?;
        }

        let store = Self {
            location,
            storage,
            strategy,
            attributes: RwLock::new(Attributes::new()),
        };
        store.write_group("", &Attributes::new()).await?;
        info!("Created {} store at {}", store.format(), store.location);
        Ok(store)
    }

    /// Open an existing store, detecting its schema revision
    pub async fn open(url: impl Into<String>) -> Result<Self> {
        let location = url.into();
        let root = store_root(&location)?;
        let missing = || ConvertError::NotFound(format!("no Zarr group at {}", location));
        if !tokio::fs::try_exists(&root).await? {
            return Err(missing());
        }

        let storage = open_filesystem_store(&root)?;
        let format = detect_format(storage.as_ref())?.ok_or_else(missing)?;
        let group_storage = Arc::clone(&storage);
        let attributes = blocking(move || Ok(Group::open(group_storage, "/")?.attributes().clone())).await?;

        Ok(Self {
            location,
            storage,
            strategy: Arc::from(strategy_for(format)),
            attributes: RwLock::new(attributes),
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn format(&self) -> ZarrFormat {
        self.strategy.format()
    }

    /// Root group attributes
    pub fn attributes(&self) -> Attributes {
        self.attributes.read().clone()
    }

    /// Replace the root group attributes in a single write
    pub async fn set_attributes(&self, attributes: Attributes) -> Result<()> {
        self.write_group("", &attributes).await?;
        *self.attributes.write() = attributes;
        Ok(())
    }

    /// Create an empty group
    pub async fn create_group(&self, path: &str) -> Result<()> {
        self.write_group(path, &Attributes::new()).await
    }

    /// Create an array and return a handle for writing it
    pub async fn create_array(&self, path: &str, metadata: ArrayMetadata) -> Result<ArrayHandle> {
        self.strategy
            .check_codec(&metadata.codec, metadata.layout.data_type)?;
        let zarr_metadata = self.strategy.array_metadata(&metadata)?;

        let storage = Arc::clone(&self.storage);
        let node = node_path(path);
        let array = blocking(move || {
            let array = Array::new_with_metadata(storage, &node, zarr_metadata)?;
            array.store_metadata()?;
            Ok(array)
        })
        .await?;
        debug!(
            "Created array '{}': {}, {}",
            path,
            metadata.layout.summary(),
            metadata.codec.summary()
        );
        Ok(ArrayHandle::new(path, metadata, array))
    }

    /// Open an existing array
    pub async fn open_array(&self, path: &str) -> Result<ArrayHandle> {
        let storage = Arc::clone(&self.storage);
        let node = node_path(path);
        let array = blocking(move || Ok(Array::open(storage, &node)?)).await?;
        let metadata = describe_array(array.metadata())?;
        Ok(ArrayHandle::new(path, metadata, array))
    }

    /// Names of the arrays directly inside the group at `path`
    pub async fn array_names(&self, path: &str) -> Result<Vec<String>> {
        let storage = Arc::clone(&self.storage);
        let format = self.format();
        let path = path.trim_matches('/').to_string();
        blocking(move || {
            let prefix = if path.is_empty() {
                StorePrefix::root()
            } else {
                StorePrefix::new(format!("{}/", path))?
            };
            let mut names = Vec::new();
            for child in storage.list_dir(&prefix)?.prefixes() {
                if is_array(storage.as_ref(), format, child.as_str())? {
                    let name = child.as_str().trim_end_matches('/');
                    names.push(name.rsplit('/').next().unwrap_or(name).to_string());
                }
            }
            names.sort();
            Ok(names)
        })
        .await
    }

    async fn write_group(&self, path: &str, attributes: &Attributes) -> Result<()> {
        let metadata = self.strategy.group_metadata(attributes);
        let storage = Arc::clone(&self.storage);
        let node = node_path(path);
        blocking(move || {
            Group::new_with_metadata(storage, &node, metadata)?.store_metadata()?;
            Ok(())
        })
        .await
    }
}

/// Which revision, if any, a store root holds
pub fn detect_format<S: ReadableStorageTraits + ?Sized>(storage: &S) -> Result<Option<ZarrFormat>> {
    if storage.size_key(&StoreKey::new("zarr.json")?)?.is_some() {
        Ok(Some(ZarrFormat::V3))
    } else if storage.size_key(&StoreKey::new(".zgroup")?)?.is_some() {
        Ok(Some(ZarrFormat::V2))
    } else {
        Ok(None)
    }
}

/// Whether the node under `prefix` (ending in `/`) is an array
fn is_array<S: ReadableStorageTraits + ?Sized>(storage: &S, format: ZarrFormat, prefix: &str) -> Result<bool> {
    match format {
        ZarrFormat::V2 => Ok(storage
            .size_key(&StoreKey::new(format!("{}.zarray", prefix))?)?
            .is_some()),
        ZarrFormat::V3 => match storage.get(&StoreKey::new(format!("{}zarr.json", prefix))?)? {
            Some(doc) => {
                let doc: serde_json::Value = serde_json::from_slice(&doc)?;
                Ok(doc["node_type"] == "array")
            }
            None => Ok(false),
        },
    }
}

/// One block: everything under a leading index prefix, as `rows` runs of `len` elements
struct Block {
    base: Vec<u64>,
    rank: usize,
    rows: usize,
    len: usize,
    chunk_len: usize,
}

impl Block {
    /// The block's elements whose last-axis index falls in `range`
    fn subset(&self, shape: &[usize], range: Range<usize>) -> ArraySubset {
        let last = shape.len() - 1;
        let ranges: Vec<Range<u64>> = (0..shape.len())
            .map(|axis| {
                if axis < self.rank {
                    self.base[axis]..self.base[axis] + 1
                } else if axis == last {
                    range.start as u64..range.end as u64
                } else {
                    0..shape[axis] as u64
                }
            })
            .collect();
        ArraySubset::new_with_ranges(&ranges)
    }

    fn chunk_coords(&self, j: usize) -> Vec<u64> {
        let mut coords = self.base.clone();
        if let Some(last) = coords.last_mut() {
            *last = j as u64;
        }
        coords
    }

    fn chunks(&self) -> usize {
        self.len.div_ceil(self.chunk_len)
    }
}

/// Handle to one array of a [`ChunkedStore`].
///
/// Blocks under different prefixes map to disjoint chunks, so handles may be cloned
/// and written from concurrent tasks.
#[derive(Clone)]
pub struct ArrayHandle {
    path: String,
    metadata: Arc<ArrayMetadata>,
    array: Arc<Array<FilesystemStore>>,
}

impl ArrayHandle {
    fn new(path: &str, metadata: ArrayMetadata, array: Array<FilesystemStore>) -> Self {
        Self {
            path: path.trim_matches('/').to_string(),
            metadata: Arc::new(metadata),
            array: Arc::new(array),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn metadata(&self) -> &ArrayMetadata {
        &self.metadata
    }

    pub fn layout(&self) -> &ArrayLayout {
        &self.metadata.layout
    }

    pub fn shape(&self) -> &[usize] {
        &self.metadata.layout.shape
    }

    /// Write the whole block under `prefix` (e.g. one sample vector of `raw`).
    ///
    /// `data` is row-major over the trailing axes. Returns the number of stored bytes.
    /// Chunks holding only the fill value are not stored.
    pub async fn write_block<T: Element>(&self, prefix: &[usize], data: &[T]) -> Result<usize> {
        self.check_type::<T>()?;
        let block = self.block(prefix)?;
        if data.len() != block.rows * block.len {
            return Err(ConvertError::InvalidDimensions(format!(
                "block under {:?} of '{}' holds {} elements, got {}",
                prefix,
                self.path,
                block.rows * block.len,
                data.len()
            )));
        }

        let subset = block.subset(self.shape(), 0..block.len);
        let array = Arc::clone(&self.array);
        let data = data.to_vec();
        blocking(move || {
            array.store_array_subset(&subset, data)?;
            let storage = array.storage();
            let mut stored = 0;
            for j in 0..block.chunks() {
                let key = array.chunk_key(&block.chunk_coords(j));
                stored += storage.size_key(&key)?.unwrap_or(0) as usize;
            }
            Ok(stored)
        })
        .await
    }

    /// Read the whole block under `prefix`
    pub async fn read_block<T: Element>(&self, prefix: &[usize]) -> Result<Vec<T>> {
        let len = self.shape().last().copied().unwrap_or(0);
        self.read_samples(prefix, 0..len).await
    }

    /// Read `range` along the last axis of every row under `prefix`.
    ///
    /// Only the chunks overlapping `range` are fetched. The result is row-major,
    /// `rows x range.len()`.
    pub async fn read_samples<T: Element>(&self, prefix: &[usize], range: Range<usize>) -> Result<Vec<T>> {
        self.check_type::<T>()?;
        let block = self.block(prefix)?;
        if range.start > range.end || range.end > block.len {
            return Err(ConvertError::OutOfBounds(format!(
                "range {:?} outside 0..{} of '{}'",
                range, block.len, self.path
            )));
        }
        if range.is_empty() {
            return Ok(Vec::new());
        }

        let subset = block.subset(self.shape(), range);
        let array = Arc::clone(&self.array);
        blocking(move || Ok(array.retrieve_array_subset::<Vec<T>>(&subset)?)).await
    }

    /// Read the entire array
    pub async fn read_all<T: Element>(&self) -> Result<ArrayD<T>> {
        self.check_type::<T>()?;
        let array = Arc::clone(&self.array);
        blocking(move || Ok(array.retrieve_array_subset::<ArrayD<T>>(&array.subset_all())?)).await
    }

    fn check_type<T: Element>(&self) -> Result<()> {
        if T::DATA_TYPE != self.layout().data_type {
            return Err(ConvertError::InvalidDataType(format!(
                "'{}' stores {}, accessed as {}",
                self.path,
                self.layout().data_type,
                T::DATA_TYPE
            )));
        }
        Ok(())
    }

    fn block(&self, prefix: &[usize]) -> Result<Block> {
        let layout = self.layout();
        let rank = layout.block_rank()?;
        if prefix.len() != rank {
            return Err(ConvertError::InvalidDimensions(format!(
                "'{}' is addressed by {} leading indices, got {:?}",
                self.path, rank, prefix
            )));
        }
        let last = layout.ndim() - 1;
        let mut base = prefix.to_vec();
        base.resize(layout.ndim(), 0);
        if !layout.is_in_bounds(&base) {
            return Err(ConvertError::OutOfBounds(format!(
                "block {:?} outside '{}' of shape {:?}",
                prefix, self.path, layout.shape
            )));
        }
        Ok(Block {
            base: base.into_iter().map(|i| i as u64).collect(),
            rank,
            rows: layout.shape[rank..last].iter().product(),
            len: layout.shape[last],
            chunk_len: layout.chunks.get(last),
        })
    }
}
