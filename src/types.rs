use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::core::tiling::TileWindow;

/// Tolerance used when comparing grid origins and resolutions
const GRID_EPSILON: f64 = 1e-9;

/// Geospatial transformation parameters (GDAL ordering)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform with square-or-rectangular pixels
    pub fn north_up(top_left_x: f64, top_left_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            top_left_x,
            pixel_width,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height: -pixel_height.abs(),
        }
    }

    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }
}

impl Default for GeoTransform {
    fn default() -> Self {
        Self::north_up(0.0, 0.0, 1.0, 1.0)
    }
}

/// Geospatial bounding box in the grid's coordinate system
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_x < other.max_x
            && other.min_x < self.max_x
            && self.min_y < other.max_y
            && other.min_y < self.max_y
    }
}

/// Pixel grid: where every pixel of a raster sits in space
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PixelGrid {
    pub width: usize,
    pub height: usize,
    pub geo_transform: GeoTransform,
    /// Projection as WKT or an authority string, if known
    pub crs: Option<String>,
}

impl PixelGrid {
    pub fn new(width: usize, height: usize, geo_transform: GeoTransform, crs: Option<String>) -> Self {
        Self { width, height, geo_transform, crs }
    }

    /// Pixel size as (x, y), both positive
    pub fn resolution(&self) -> (f64, f64) {
        (
            self.geo_transform.pixel_width.abs(),
            self.geo_transform.pixel_height.abs(),
        )
    }

    pub fn bounding_box(&self) -> BoundingBox {
        let gt = &self.geo_transform;
        let x0 = gt.top_left_x;
        let x1 = gt.top_left_x + gt.pixel_width * self.width as f64;
        let y0 = gt.top_left_y;
        let y1 = gt.top_left_y + gt.pixel_height * self.height as f64;
        BoundingBox {
            min_x: x0.min(x1),
            max_x: x0.max(x1),
            min_y: y0.min(y1),
            max_y: y0.max(y1),
        }
    }

    /// Describe why `other` cannot be processed pixel-for-pixel with `self`
    pub fn incompatibility(&self, other: &PixelGrid) -> Option<String> {
        let (rx, ry) = self.resolution();
        let (ox, oy) = other.resolution();
        if (rx - ox).abs() > GRID_EPSILON || (ry - oy).abs() > GRID_EPSILON {
            return Some(format!("resolution {}x{} differs from {}x{}", ox, oy, rx, ry));
        }
        if normalized_crs(&self.crs) != normalized_crs(&other.crs) {
            return Some("coordinate reference system differs".to_string());
        }
        if (self.width, self.height) != (other.width, other.height) {
            return Some(format!(
                "size {}x{} differs from {}x{}",
                other.width, other.height, self.width, self.height
            ));
        }
        let a = &self.geo_transform;
        let b = &other.geo_transform;
        if (a.top_left_x - b.top_left_x).abs() > GRID_EPSILON
            || (a.top_left_y - b.top_left_y).abs() > GRID_EPSILON
        {
            return Some(format!(
                "origin ({}, {}) differs from ({}, {})",
                b.top_left_x, b.top_left_y, a.top_left_x, a.top_left_y
            ));
        }
        None
    }
}

fn normalized_crs(crs: &Option<String>) -> Option<String> {
    crs.as_ref()
        .map(|c| c.split_whitespace().collect::<String>())
        .filter(|c| !c.is_empty())
}

/// Storage type of raster pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float32,
    Float64,
}

impl DataType {
    pub fn size_bytes(&self) -> usize {
        match self {
            DataType::UInt8 => 1,
            DataType::Int16 | DataType::UInt16 => 2,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 4,
            DataType::Float64 => 8,
        }
    }

    pub fn is_integer(&self) -> bool {
        !matches!(self, DataType::Float32 | DataType::Float64)
    }

    /// ENVI header `data type` code
    pub fn envi_code(&self) -> u8 {
        match self {
            DataType::UInt8 => 1,
            DataType::Int16 => 2,
            DataType::Int32 => 3,
            DataType::Float32 => 4,
            DataType::Float64 => 5,
            DataType::UInt16 => 12,
            DataType::UInt32 => 13,
        }
    }

    pub fn from_envi_code(code: u8) -> WeaveResult<Self> {
        match code {
            1 => Ok(DataType::UInt8),
            2 => Ok(DataType::Int16),
            3 => Ok(DataType::Int32),
            4 => Ok(DataType::Float32),
            5 => Ok(DataType::Float64),
            12 => Ok(DataType::UInt16),
            13 => Ok(DataType::UInt32),
            other => Err(WeaveError::InvalidFormat(format!(
                "Unsupported ENVI data type code: {}",
                other
            ))),
        }
    }

    /// Cast an in-memory value to what this type can store (rounding, saturating)
    pub fn coerce(&self, value: f64) -> f64 {
        let bounds = match self {
            DataType::UInt8 => (u8::MIN as f64, u8::MAX as f64),
            DataType::Int16 => (i16::MIN as f64, i16::MAX as f64),
            DataType::UInt16 => (u16::MIN as f64, u16::MAX as f64),
            DataType::Int32 => (i32::MIN as f64, i32::MAX as f64),
            DataType::UInt32 => (u32::MIN as f64, u32::MAX as f64),
            DataType::Float32 => return value as f32 as f64,
            DataType::Float64 => return value,
        };
        if value.is_nan() {
            return 0.0;
        }
        value.round().clamp(bounds.0, bounds.1)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::UInt8 => "UInt8",
            DataType::Int16 => "Int16",
            DataType::UInt16 => "UInt16",
            DataType::Int32 => "Int32",
            DataType::UInt32 => "UInt32",
            DataType::Float32 => "Float32",
            DataType::Float64 => "Float64",
        };
        write!(f, "{}", name)
    }
}

/// Error types for raster processing
#[derive(Debug, thiserror::Error)]
pub enum WeaveError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Data invariant violated: {0}")]
    DataInvariant(String),

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("No block named '{0}'")]
    MissingBlock(String),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Processing failed at {tile}: {source}")]
    TileProcessing {
        tile: TileWindow,
        #[source]
        source: Box<WeaveError>,
    },

    #[error("Run cancelled after {completed} of {total} tiles")]
    Cancelled { completed: usize, total: usize },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "gdal")]
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),
}

impl WeaveError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        WeaveError::Io { path: path.into(), source }
    }
}

/// Result type for raster operations
pub type WeaveResult<T> = Result<T, WeaveError>;
