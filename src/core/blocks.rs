//! Per-tile bundles of named pixel blocks

use crate::io::metadata::RasterMetadata;
use crate::types::{DataType, WeaveError, WeaveResult};
use ndarray::{concatenate, Array, Array3, ArrayView2, Axis, Dimension, Ix3};
use std::collections::HashMap;
use std::sync::Arc;

/// Default storage type of output blocks
pub const DEFAULT_OUTPUT_TYPE: DataType = DataType::Float32;

/// Pixel values of one raster for one tile, shaped (bands, height, width)
#[derive(Debug, Clone, PartialEq)]
pub struct PixelBlock {
    data: Array3<f64>,
    data_type: DataType,
}

impl PixelBlock {
    pub fn new(data: Array3<f64>, data_type: DataType) -> Self {
        Self { data, data_type }
    }

    pub fn data(&self) -> &Array3<f64> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Array3<f64> {
        &mut self.data
    }

    pub fn into_data(self) -> Array3<f64> {
        self.data
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn bands(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    /// (height, width)
    pub fn shape(&self) -> (usize, usize) {
        let (_, h, w) = self.data.dim();
        (h, w)
    }

    /// One band, 0-based
    pub fn band(&self, index: usize) -> ArrayView2<'_, f64> {
        self.data.index_axis(Axis(0), index)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    key: String,
    block: PixelBlock,
    metadata: Arc<RasterMetadata>,
}

/// Ordered mapping from logical name to (block, metadata)
#[derive(Debug, Clone, Default)]
pub struct BlockAssociations {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl BlockAssociations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or overwrite a block stored as `Float32`
    pub fn add_block<D: Dimension>(
        &mut self,
        key: &str,
        array: Array<f64, D>,
        metadata: RasterMetadata,
    ) -> WeaveResult<()> {
        self.add_typed_block(key, array, DEFAULT_OUTPUT_TYPE, metadata)
    }

    /// Register or overwrite a block with an explicit storage type
    pub fn add_typed_block<D: Dimension>(
        &mut self,
        key: &str,
        array: Array<f64, D>,
        data_type: DataType,
        mut metadata: RasterMetadata,
    ) -> WeaveResult<()> {
        if array.ndim() != 3 {
            return Err(WeaveError::InvalidBlock(format!(
                "block '{}' has {} dimensions, expected 3 (bands, height, width)",
                key,
                array.ndim()
            )));
        }
        let data = array
            .into_dimensionality::<Ix3>()
            .map_err(|e| WeaveError::InvalidBlock(format!("block '{}': {}", key, e)))?;
        metadata.set_band_count(data.len_of(Axis(0)));
        self.insert(key, PixelBlock::new(data, data_type), Arc::new(metadata));
        Ok(())
    }

    pub(crate) fn insert(&mut self, key: &str, block: PixelBlock, metadata: Arc<RasterMetadata>) {
        match self.index.get(key) {
            Some(&position) => {
                let entry = &mut self.entries[position];
                entry.block = block;
                entry.metadata = metadata;
            }
            None => {
                self.index.insert(key.to_string(), self.entries.len());
                self.entries.push(Entry {
                    key: key.to_string(),
                    block,
                    metadata,
                });
            }
        }
    }

    pub fn get(&self, key: &str) -> WeaveResult<(&PixelBlock, &RasterMetadata)> {
        self.index
            .get(key)
            .map(|&i| (&self.entries[i].block, self.entries[i].metadata.as_ref()))
            .ok_or_else(|| WeaveError::MissingBlock(key.to_string()))
    }

    /// Shorthand for the pixel array of a block
    pub fn array(&self, key: &str) -> WeaveResult<&Array3<f64>> {
        self.get(key).map(|(block, _)| block.data())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys in insertion order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.key.as_str())
    }

    /// (key, block, metadata) in insertion order
    pub fn items(&self) -> impl Iterator<Item = (&str, &PixelBlock, &RasterMetadata)> {
        self.entries
            .iter()
            .map(|e| (e.key.as_str(), &e.block, e.metadata.as_ref()))
    }

    /// Members of a collection declared under `prefix`, keyed by the remainder of their name
    pub fn group<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a PixelBlock, &'a RasterMetadata)> + 'a {
        self.items().filter_map(move |(key, block, meta)| {
            key.strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix('/'))
                .map(|rest| (rest, block, meta))
        })
    }

    /// Concatenate the bands of the named blocks (all blocks when `keys` is None) in order
    pub fn stack_bands(&self, keys: Option<&[&str]>) -> WeaveResult<Array3<f64>> {
        let views: Vec<_> = match keys {
            Some(keys) => keys
                .iter()
                .map(|k| self.array(k).map(|a| a.view()))
                .collect::<WeaveResult<_>>()?,
            None => self.entries.iter().map(|e| e.block.data().view()).collect(),
        };
        if views.is_empty() {
            return Err(WeaveError::MissingBlock("no blocks to stack".to_string()));
        }
        concatenate(Axis(0), &views)
            .map_err(|e| WeaveError::DataInvariant(format!("blocks cannot be stacked: {}", e)))
    }

    pub(crate) fn into_entries(self) -> impl Iterator<Item = (String, PixelBlock, Arc<RasterMetadata>)> {
        self.entries.into_iter().map(|e| (e.key, e.block, e.metadata))
    }
}
