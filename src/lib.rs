//! rasterweave: tiled multi-file raster processing
//!
//! The [`core::Applier`] runs a user function block by block over any number
//! of co-registered rasters and writes the blocks it produces to new rasters.
//! On top of it, [`core::CompositingEngine`] builds best-observation
//! composites from a Landsat-style time series and [`core::nanpercentiles`]
//! computes NaN-tolerant temporal statistics.

pub mod types;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use crate::types::{BoundingBox, DataType, GeoTransform, PixelGrid, WeaveError, WeaveResult};

pub use crate::io::{RasterHandle, RasterMetadata};
pub use crate::core::{Applier, ApplierOptions, BlockAssociations, CompositingEngine, TileScheduler, TileWindow};
