//! Raster I/O: handles, formats and metadata

pub mod envi;
pub mod metadata;
pub mod raster;

#[cfg(feature = "gdal")]
pub mod gdal_raster;

pub use envi::{EnviDataset, EnviHeader};
pub use metadata::{MetaValue, RasterMetadata, DEFAULT_DOMAIN};
pub use raster::{ColorEntry, RasterDataset, RasterFormat, RasterHandle};
