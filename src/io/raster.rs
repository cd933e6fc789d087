//! Raster handles and the capability set every backing format provides

use crate::core::tiling::TileWindow;
use crate::io::envi::EnviDataset;
use crate::types::{DataType, PixelGrid, WeaveError, WeaveResult};
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One color table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorEntry {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

/// On-disk encoding of a raster
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RasterFormat {
    /// Band-sequential binary with a `.hdr` sidecar
    #[default]
    Envi,
    /// Any GDAL driver, by short name (e.g. "GTiff")
    #[cfg(feature = "gdal")]
    Gdal { driver: String },
}

impl RasterFormat {
    /// File extension used when naming new outputs
    pub fn extension(&self) -> String {
        match self {
            RasterFormat::Envi => "bsq".to_string(),
            #[cfg(feature = "gdal")]
            RasterFormat::Gdal { driver } => match driver.as_str() {
                "GTiff" | "COG" => "tif".to_string(),
                other => other.to_ascii_lowercase(),
            },
        }
    }
}

/// Identifies a persisted raster
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RasterHandle {
    path: PathBuf,
    #[serde(default)]
    format: RasterFormat,
}

impl RasterHandle {
    pub fn new(path: impl Into<PathBuf>, format: RasterFormat) -> Self {
        Self { path: path.into(), format }
    }

    /// Handle for a native band-sequential raster
    pub fn envi(path: impl Into<PathBuf>) -> Self {
        Self::new(path, RasterFormat::Envi)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> &RasterFormat {
        &self.format
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Open read-only
    pub fn open(&self) -> WeaveResult<Box<dyn RasterDataset>> {
        match &self.format {
            RasterFormat::Envi => Ok(Box::new(EnviDataset::open(&self.path)?)),
            #[cfg(feature = "gdal")]
            RasterFormat::Gdal { .. } => Ok(Box::new(crate::io::gdal_raster::GdalDataset::open(&self.path)?)),
        }
    }

    /// Open an existing raster for update
    pub fn open_update(&self) -> WeaveResult<Box<dyn RasterDataset>> {
        match &self.format {
            RasterFormat::Envi => Ok(Box::new(EnviDataset::open_update(&self.path)?)),
            #[cfg(feature = "gdal")]
            RasterFormat::Gdal { .. } => Ok(Box::new(crate::io::gdal_raster::GdalDataset::open_update(&self.path)?)),
        }
    }

    /// Create (or overwrite) a raster, creating parent directories
    pub fn create(&self, grid: &PixelGrid, bands: usize, data_type: DataType) -> WeaveResult<Box<dyn RasterDataset>> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| WeaveError::io(parent, e))?;
        }
        log::debug!(
            "Creating {} raster {} ({}x{}x{} {})",
            match self.format {
                RasterFormat::Envi => "ENVI",
                #[cfg(feature = "gdal")]
                RasterFormat::Gdal { .. } => "GDAL",
            },
            self.path.display(),
            grid.width,
            grid.height,
            bands,
            data_type
        );
        match &self.format {
            RasterFormat::Envi => Ok(Box::new(EnviDataset::create(&self.path, grid, bands, data_type)?)),
            #[cfg(feature = "gdal")]
            RasterFormat::Gdal { driver } => Ok(Box::new(crate::io::gdal_raster::GdalDataset::create(
                &self.path, driver, grid, bands, data_type,
            )?)),
        }
    }
}

/// Operations the engine needs from a raster backend. Bands are 1-based.
pub trait RasterDataset {
    fn grid(&self) -> &PixelGrid;

    fn band_count(&self) -> usize;

    fn data_type(&self) -> DataType;

    /// Read one band of a window as (height, width)
    fn read_window(&mut self, band: usize, window: &TileWindow) -> WeaveResult<Array2<f64>>;

    /// Write one band of a window; values are cast to the storage type
    fn write_window(&mut self, band: usize, window: &TileWindow, data: ArrayView2<f64>) -> WeaveResult<()>;

    fn metadata_domains(&self) -> Vec<String>;

    /// Raw key/value pairs of one metadata domain
    fn metadata_domain(&self, domain: &str) -> BTreeMap<String, String>;

    /// Replace the content of one metadata domain
    fn set_metadata_domain(&mut self, domain: &str, items: &BTreeMap<String, String>) -> WeaveResult<()>;

    fn no_data_value(&self, band: usize) -> Option<f64>;

    fn set_no_data_value(&mut self, band: usize, value: Option<f64>) -> WeaveResult<()>;

    fn band_description(&self, band: usize) -> Option<String>;

    fn set_band_description(&mut self, band: usize, description: &str) -> WeaveResult<()>;

    fn set_color_table(&mut self, band: usize, entries: &[ColorEntry]) -> WeaveResult<()>;

    fn set_category_names(&mut self, band: usize, names: &[String]) -> WeaveResult<()>;

    /// Persist pending metadata changes
    fn flush(&mut self) -> WeaveResult<()>;

    /// Read all bands of a window as (bands, height, width)
    fn read_block(&mut self, window: &TileWindow) -> WeaveResult<Array3<f64>> {
        let bands = self.band_count();
        let mut block = Array3::zeros((bands, window.height, window.width));
        for band in 1..=bands {
            let data = self.read_window(band, window)?;
            block.index_axis_mut(Axis(0), band - 1).assign(&data);
        }
        Ok(block)
    }

    /// Write all bands of a (bands, height, width) block
    fn write_block(&mut self, window: &TileWindow, block: ArrayView3<f64>) -> WeaveResult<()> {
        if block.len_of(Axis(0)) != self.band_count() {
            return Err(WeaveError::DataInvariant(format!(
                "block has {} bands, raster has {}",
                block.len_of(Axis(0)),
                self.band_count()
            )));
        }
        for (index, plane) in block.axis_iter(Axis(0)).enumerate() {
            self.write_window(index + 1, window, plane)?;
        }
        Ok(())
    }
}

pub(crate) fn check_window(grid: &PixelGrid, band: usize, bands: usize, window: &TileWindow, path: &Path) -> WeaveResult<()> {
    if band == 0 || band > bands {
        return Err(WeaveError::InvalidFormat(format!(
            "band {} out of range 1..={} in {}",
            band,
            bands,
            path.display()
        )));
    }
    if !window.fits(grid.width, grid.height) {
        return Err(WeaveError::Configuration(format!(
            "{} exceeds the {}x{} grid of {}",
            window,
            grid.width,
            grid.height,
            path.display()
        )));
    }
    Ok(())
}
