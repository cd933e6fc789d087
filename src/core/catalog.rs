//! Footprints of archive tiles (e.g. WRS-2 path/row) for area-of-interest filtering

use crate::core::compositing::Observation;
use crate::types::{BoundingBox, WeaveError, WeaveResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Tile id to footprint lookup, constructed once and passed to whoever needs it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TileGeometryCatalog {
    tiles: BTreeMap<String, BoundingBox>,
}

impl TileGeometryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a `{"tiles": {"193023": {"min_x": ..., ...}}}` document
    pub fn from_json_file(path: &Path) -> WeaveResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| WeaveError::io(path, e))?;
        let catalog: Self = serde_json::from_str(&text)?;
        if let Some((id, _)) = catalog
            .tiles
            .iter()
            .find(|(_, b)| !(b.min_x <= b.max_x && b.min_y <= b.max_y))
        {
            return Err(WeaveError::Configuration(format!(
                "tile '{}' in {} has an inverted footprint",
                id,
                path.display()
            )));
        }
        log::debug!("Loaded {} tile footprints from {}", catalog.len(), path.display());
        Ok(catalog)
    }

    pub fn insert(&mut self, id: &str, footprint: BoundingBox) {
        self.tiles.insert(id.to_string(), footprint);
    }

    pub fn footprint(&self, id: &str) -> Option<&BoundingBox> {
        self.tiles.get(id)
    }

    /// Ids of tiles whose footprint intersects `area`, in id order
    pub fn tiles_intersecting(&self, area: &BoundingBox) -> Vec<&str> {
        self.tiles
            .iter()
            .filter(|(_, footprint)| footprint.intersects(area))
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Observations whose tile footprint intersects `area`. Tiles missing from the catalog are dropped.
    pub fn filter_observations<'a>(&self, observations: &'a [Observation], area: &BoundingBox) -> Vec<&'a Observation> {
        observations
            .iter()
            .filter(|o| match self.footprint(&o.tile_id()) {
                Some(footprint) => footprint.intersects(area),
                None => {
                    log::warn!("Observation '{}': tile {} not in catalog", o.id, o.tile_id());
                    false
                }
            })
            .collect()
    }
}
