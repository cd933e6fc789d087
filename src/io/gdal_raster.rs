//! GDAL-backed rasters (GeoTIFF and any other GDAL driver)

use crate::core::tiling::TileWindow;
use crate::io::raster::{check_window, ColorEntry, RasterDataset};
use crate::types::{DataType, GeoTransform, PixelGrid, WeaveError, WeaveResult};
use gdal::raster::Buffer;
use gdal::{Dataset, DatasetOptions, DriverManager, GdalOpenFlags, Metadata};
use ndarray::{Array2, ArrayView2};
use std::collections::BTreeMap;
use std::ffi::CString;
use std::os::raw::c_char;
use std::path::{Path, PathBuf};

pub struct GdalDataset {
    path: PathBuf,
    dataset: Dataset,
    grid: PixelGrid,
    band_count: usize,
    data_type: DataType,
}

fn data_type_of(code: gdal_sys::GDALDataType::Type) -> WeaveResult<DataType> {
    use gdal_sys::GDALDataType::*;
    match code {
        GDT_Byte => Ok(DataType::UInt8),
        GDT_Int16 => Ok(DataType::Int16),
        GDT_UInt16 => Ok(DataType::UInt16),
        GDT_Int32 => Ok(DataType::Int32),
        GDT_UInt32 => Ok(DataType::UInt32),
        GDT_Float32 => Ok(DataType::Float32),
        GDT_Float64 => Ok(DataType::Float64),
        other => Err(WeaveError::InvalidFormat(format!("Unsupported GDAL data type: {}", other))),
    }
}

impl GdalDataset {
    pub fn open(path: &Path) -> WeaveResult<Self> {
        Self::wrap(path, Dataset::open(path)?)
    }

    pub fn open_update(path: &Path) -> WeaveResult<Self> {
        let options = DatasetOptions {
            open_flags: GdalOpenFlags::GDAL_OF_UPDATE | GdalOpenFlags::GDAL_OF_RASTER,
            ..Default::default()
        };
        Self::wrap(path, Dataset::open_ex(path, options)?)
    }

    pub fn create(path: &Path, driver: &str, grid: &PixelGrid, bands: usize, data_type: DataType) -> WeaveResult<Self> {
        let driver = DriverManager::get_driver_by_name(driver)?;
        let (w, h, b) = (grid.width as isize, grid.height as isize, bands as isize);
        let mut dataset = match data_type {
            DataType::UInt8 => driver.create_with_band_type::<u8, _>(path, w, h, b)?,
            DataType::Int16 => driver.create_with_band_type::<i16, _>(path, w, h, b)?,
            DataType::UInt16 => driver.create_with_band_type::<u16, _>(path, w, h, b)?,
            DataType::Int32 => driver.create_with_band_type::<i32, _>(path, w, h, b)?,
            DataType::UInt32 => driver.create_with_band_type::<u32, _>(path, w, h, b)?,
            DataType::Float32 => driver.create_with_band_type::<f32, _>(path, w, h, b)?,
            DataType::Float64 => driver.create_with_band_type::<f64, _>(path, w, h, b)?,
        };
        dataset.set_geo_transform(&grid.geo_transform.to_gdal())?;
        if let Some(crs) = &grid.crs {
            dataset.set_projection(crs)?;
        }
        Self::wrap(path, dataset)
    }

    fn wrap(path: &Path, dataset: Dataset) -> WeaveResult<Self> {
        let (width, height) = dataset.raster_size();
        let geo_transform = dataset
            .geo_transform()
            .map(GeoTransform::from_gdal)
            .unwrap_or_default();
        let projection = dataset.projection();
        let crs = if projection.is_empty() { None } else { Some(projection) };
        let band_count = dataset.raster_count().max(0) as usize;
        let data_type = if band_count > 0 {
            data_type_of(dataset.rasterband(1)?.band_type())?
        } else {
            DataType::Float32
        };
        Ok(Self {
            path: path.to_path_buf(),
            grid: PixelGrid::new(width, height, geo_transform, crs),
            dataset,
            band_count,
            data_type,
        })
    }
}

impl RasterDataset for GdalDataset {
    fn grid(&self) -> &PixelGrid {
        &self.grid
    }

    fn band_count(&self) -> usize {
        self.band_count
    }

    fn data_type(&self) -> DataType {
        self.data_type
    }

    fn read_window(&mut self, band: usize, window: &TileWindow) -> WeaveResult<Array2<f64>> {
        check_window(&self.grid, band, self.band_count, window, &self.path)?;
        let rasterband = self.dataset.rasterband(band as isize)?;
        let size = (window.width, window.height);
        let buffer = rasterband.read_as::<f64>(
            (window.x_offset as isize, window.y_offset as isize),
            size,
            size,
            None,
        )?;
        Array2::from_shape_vec((window.height, window.width), buffer.data)
            .map_err(|e| WeaveError::InvalidFormat(format!("Failed to reshape window: {}", e)))
    }

    fn write_window(&mut self, band: usize, window: &TileWindow, data: ArrayView2<f64>) -> WeaveResult<()> {
        check_window(&self.grid, band, self.band_count, window, &self.path)?;
        let data_type = self.data_type;
        let buffer = Buffer {
            size: (window.width, window.height),
            data: data.iter().map(|&v| data_type.coerce(v)).collect(),
        };
        let mut rasterband = self.dataset.rasterband(band as isize)?;
        rasterband.write(
            (window.x_offset as isize, window.y_offset as isize),
            (window.width, window.height),
            &buffer,
        )?;
        Ok(())
    }

    fn metadata_domains(&self) -> Vec<String> {
        self.dataset.metadata_domains()
    }

    fn metadata_domain(&self, domain: &str) -> BTreeMap<String, String> {
        self.dataset
            .metadata_domain(domain)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|item| {
                item.split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect()
    }

    fn set_metadata_domain(&mut self, domain: &str, items: &BTreeMap<String, String>) -> WeaveResult<()> {
        for (key, value) in items {
            self.dataset.set_metadata_item(key, value, domain)?;
        }
        Ok(())
    }

    fn no_data_value(&self, band: usize) -> Option<f64> {
        self.dataset.rasterband(band as isize).ok()?.no_data_value()
    }

    fn set_no_data_value(&mut self, band: usize, value: Option<f64>) -> WeaveResult<()> {
        let mut rasterband = self.dataset.rasterband(band as isize)?;
        rasterband.set_no_data_value(value)?;
        Ok(())
    }

    fn band_description(&self, band: usize) -> Option<String> {
        self.dataset.rasterband(band as isize).ok()?.description().ok()
    }

    fn set_band_description(&mut self, band: usize, description: &str) -> WeaveResult<()> {
        let mut rasterband = self.dataset.rasterband(band as isize)?;
        rasterband.set_description(description)?;
        Ok(())
    }

    fn set_color_table(&mut self, band: usize, entries: &[ColorEntry]) -> WeaveResult<()> {
        let rasterband = self.dataset.rasterband(band as isize)?;
        unsafe {
            let table = gdal_sys::GDALCreateColorTable(gdal_sys::GDALPaletteInterp::GPI_RGB);
            for (index, entry) in entries.iter().enumerate() {
                let color = gdal_sys::GDALColorEntry {
                    c1: entry.r as i16,
                    c2: entry.g as i16,
                    c3: entry.b as i16,
                    c4: entry.a as i16,
                };
                gdal_sys::GDALSetColorEntry(table, index as i32, &color);
            }
            let status = gdal_sys::GDALSetRasterColorTable(rasterband.c_rasterband(), table);
            gdal_sys::GDALDestroyColorTable(table);
            if status != gdal_sys::CPLErr::CE_None {
                return Err(WeaveError::InvalidFormat(format!(
                    "Failed to set color table on {}",
                    self.path.display()
                )));
            }
        }
        Ok(())
    }

    fn set_category_names(&mut self, band: usize, names: &[String]) -> WeaveResult<()> {
        let rasterband = self.dataset.rasterband(band as isize)?;
        let owned = names
            .iter()
            .map(|n| CString::new(n.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| WeaveError::InvalidFormat(format!("Invalid category name: {}", e)))?;
        let mut pointers: Vec<*mut c_char> = owned.iter().map(|c| c.as_ptr() as *mut c_char).collect();
        pointers.push(std::ptr::null_mut());
        let status = unsafe {
            gdal_sys::GDALSetRasterCategoryNames(rasterband.c_rasterband(), pointers.as_mut_ptr())
        };
        if status != gdal_sys::CPLErr::CE_None {
            return Err(WeaveError::InvalidFormat(format!(
                "Failed to set category names on {}",
                self.path.display()
            )));
        }
        Ok(())
    }

    fn flush(&mut self) -> WeaveResult<()> {
        self.dataset.flush_cache();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::TempDir;

    fn grid() -> PixelGrid {
        PixelGrid::new(4, 3, GeoTransform::north_up(500000.0, 4000000.0, 30.0, 30.0), None)
    }

    #[test]
    fn test_geotiff_window_and_metadata_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scene.tif");
        let window = TileWindow { x_offset: 1, y_offset: 1, width: 2, height: 2, index_x: 0, index_y: 0, tiles_x: 1, tiles_y: 1 };
        {
            let mut dataset = GdalDataset::create(&path, "GTiff", &grid(), 2, DataType::Int16).unwrap();
            dataset.write_window(2, &window, array![[1.0, -2.0], [40000.0, 3.6]].view()).unwrap();
            dataset.set_no_data_value(1, Some(-9999.0)).unwrap();
            dataset.set_band_description(2, "nir").unwrap();
            let items = BTreeMap::from([("sensor".to_string(), "LC8".to_string())]);
            dataset.set_metadata_domain("landsat", &items).unwrap();
            dataset.flush().unwrap();
        }

        let mut reopened = GdalDataset::open(&path).unwrap();
        assert_eq!(reopened.band_count(), 2);
        assert_eq!(reopened.data_type(), DataType::Int16);
        assert_eq!(reopened.grid().geo_transform, grid().geo_transform);
        assert_eq!(reopened.read_window(2, &window).unwrap(), array![[1.0, -2.0], [32767.0, 4.0]]);
        assert_eq!(reopened.no_data_value(1), Some(-9999.0));
        assert_eq!(reopened.band_description(2).as_deref(), Some("nir"));
        assert_eq!(reopened.metadata_domain("landsat").get("sensor").map(String::as_str), Some("LC8"));
        assert!(reopened.read_window(3, &window).is_err());
    }

    #[test]
    fn test_geotiff_classification_tables() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("classes.tif");
        let mut dataset = GdalDataset::create(&path, "GTiff", &grid(), 1, DataType::UInt8).unwrap();
        let colors = [
            ColorEntry { r: 0, g: 0, b: 0, a: 255 },
            ColorEntry { r: 34, g: 139, b: 34, a: 255 },
        ];
        dataset.set_color_table(1, &colors).unwrap();
        dataset.set_category_names(1, &["unclassified".to_string(), "forest".to_string()]).unwrap();
        assert!(dataset.set_category_names(1, &["bad\0name".to_string()]).is_err());
        dataset.flush().unwrap();
    }
}
