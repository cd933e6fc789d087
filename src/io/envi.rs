//! Native band-sequential raster format with an ENVI `.hdr` sidecar
//!
//! Pixel data is stored as raw band-sequential samples; everything else
//! (size, data type, georeferencing, band names, class tables) lives in a
//! plain-text header of `key = value` lines whose values may be
//! `{comma, separated, lists}` spanning several lines. Metadata domains other
//! than `ENVI` are persisted as `domain::key = value` lines.

use crate::core::tiling::TileWindow;
use crate::io::metadata::{normalize_key, MetaValue, DEFAULT_DOMAIN};
use crate::io::raster::{check_window, ColorEntry, RasterDataset};
use crate::types::{DataType, GeoTransform, PixelGrid, WeaveError, WeaveResult};
use ndarray::{Array2, ArrayView2};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Keys derived from the dataset structure, never taken from metadata
const STRUCTURAL_KEYS: &[&str] = &[
    "samples",
    "lines",
    "bands",
    "header_offset",
    "data_type",
    "interleave",
    "byte_order",
    "map_info",
    "coordinate_system_string",
];

const DOMAIN_SEPARATOR: &str = "::";

/// Locate the sidecar header of a data file: `x.bsq` -> `x.hdr`, falling back to `x.bsq.hdr`
pub fn header_path(data_path: &Path) -> PathBuf {
    let replaced = data_path.with_extension("hdr");
    if replaced.exists() || data_path.extension().is_none() {
        return replaced;
    }
    let mut appended = data_path.as_os_str().to_os_string();
    appended.push(".hdr");
    let appended = PathBuf::from(appended);
    if appended.exists() {
        appended
    } else {
        replaced
    }
}

/// Parsed sidecar header
#[derive(Debug, Clone, PartialEq)]
pub struct EnviHeader {
    pub samples: usize,
    pub lines: usize,
    pub bands: usize,
    pub header_offset: u64,
    pub data_type: DataType,
    pub big_endian: bool,
    pub geo_transform: Option<GeoTransform>,
    pub crs: Option<String>,
    /// `ENVI` domain, normalized keys, raw values
    pub fields: BTreeMap<String, String>,
    /// Any other metadata domain
    pub domains: BTreeMap<String, BTreeMap<String, String>>,
}

impl EnviHeader {
    pub fn new(grid: &PixelGrid, bands: usize, data_type: DataType) -> Self {
        Self {
            samples: grid.width,
            lines: grid.height,
            bands,
            header_offset: 0,
            data_type,
            big_endian: false,
            geo_transform: Some(grid.geo_transform),
            crs: grid.crs.clone(),
            fields: BTreeMap::new(),
            domains: BTreeMap::new(),
        }
    }

    pub fn parse(text: &str) -> WeaveResult<Self> {
        let mut lines = text.lines();
        match lines.by_ref().map(str::trim).find(|l| !l.is_empty()) {
            Some(first) if first.starts_with("ENVI") => {}
            _ => {
                return Err(WeaveError::InvalidFormat(
                    "header does not start with 'ENVI'".to_string(),
                ))
            }
        }

        let mut raw: BTreeMap<String, String> = BTreeMap::new();
        let mut domains: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut pending: Option<(String, String)> = None;

        for line in lines {
            if let Some((key, mut value)) = pending.take() {
                value.push(' ');
                value.push_str(line.trim());
                if value.contains('}') {
                    store_entry(&mut raw, &mut domains, &key, &value);
                } else {
                    pending = Some((key, value));
                }
                continue;
            }

            let line = line.trim();
            if line.is_empty() || line.starts_with(';') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(WeaveError::InvalidFormat(format!(
                    "header line without '=': {}",
                    line
                )));
            };
            let value = value.trim().to_string();
            if value.starts_with('{') && !value.contains('}') {
                pending = Some((key.trim().to_string(), value));
            } else {
                store_entry(&mut raw, &mut domains, key.trim(), &value);
            }
        }
        if let Some((key, _)) = pending {
            return Err(WeaveError::InvalidFormat(format!(
                "unterminated '{{' in header value of '{}'",
                key
            )));
        }

        let required = |key: &str| -> WeaveResult<usize> {
            raw.get(key)
                .ok_or_else(|| WeaveError::InvalidFormat(format!("header lacks '{}'", key)))?
                .trim()
                .parse::<usize>()
                .map_err(|_| WeaveError::InvalidFormat(format!("header '{}' is not an integer", key)))
        };
        let samples = required("samples")?;
        let lines = required("lines")?;
        let bands = required("bands")?;
        let data_type = DataType::from_envi_code(required("data_type")? as u8)?;
        let header_offset = raw
            .get("header_offset")
            .map(|v| v.trim().parse::<u64>())
            .transpose()
            .map_err(|_| WeaveError::InvalidFormat("header offset is not an integer".to_string()))?
            .unwrap_or(0);
        let big_endian = raw.get("byte_order").map(|v| v.trim() == "1").unwrap_or(false);

        if let Some(interleave) = raw.get("interleave") {
            if !interleave.trim().eq_ignore_ascii_case("bsq") {
                return Err(WeaveError::InvalidFormat(format!(
                    "unsupported interleave '{}', only bsq is supported",
                    interleave.trim()
                )));
            }
        }

        let geo_transform = raw.get("map_info").map(|v| parse_map_info(v)).transpose()?;
        let crs = raw
            .get("coordinate_system_string")
            .map(|v| strip_braces(v).to_string())
            .filter(|v| !v.is_empty());

        let fields = raw
            .into_iter()
            .filter(|(k, _)| !STRUCTURAL_KEYS.contains(&k.as_str()))
            .collect();

        Ok(Self {
            samples,
            lines,
            bands,
            header_offset,
            data_type,
            big_endian,
            geo_transform,
            crs,
            fields,
            domains,
        })
    }

    pub fn render(&self) -> String {
        let mut out = String::from("ENVI\n");
        let mut line = |key: &str, value: &str| {
            out.push_str(key);
            out.push_str(" = ");
            out.push_str(value);
            out.push('\n');
        };
        line("samples", &self.samples.to_string());
        line("lines", &self.lines.to_string());
        line("bands", &self.bands.to_string());
        line("header offset", &self.header_offset.to_string());
        line("data type", &self.data_type.envi_code().to_string());
        line("interleave", "bsq");
        line("byte order", if self.big_endian { "1" } else { "0" });
        if let Some(gt) = &self.geo_transform {
            line(
                "map info",
                &format!(
                    "{{Arbitrary, 1, 1, {}, {}, {}, {}}}",
                    gt.top_left_x,
                    gt.top_left_y,
                    gt.pixel_width,
                    gt.pixel_height.abs()
                ),
            );
        }
        if let Some(crs) = &self.crs {
            line("coordinate system string", &format!("{{{}}}", crs));
        }
        for (key, value) in &self.fields {
            line(&key.replace('_', " "), value);
        }
        for (domain, items) in &self.domains {
            for (key, value) in items {
                line(&format!("{}{}{}", domain, DOMAIN_SEPARATOR, key), value);
            }
        }
        out
    }

    pub fn grid(&self) -> PixelGrid {
        PixelGrid::new(
            self.samples,
            self.lines,
            self.geo_transform.unwrap_or_default(),
            self.crs.clone(),
        )
    }

    fn band_names(&self) -> Vec<String> {
        let listed: Vec<String> = self
            .fields
            .get("band_names")
            .map(|v| split_list(v))
            .unwrap_or_default();
        (1..=self.bands)
            .map(|b| listed.get(b - 1).cloned().unwrap_or_else(|| format!("Band {}", b)))
            .collect()
    }
}

fn store_entry(
    raw: &mut BTreeMap<String, String>,
    domains: &mut BTreeMap<String, BTreeMap<String, String>>,
    key: &str,
    value: &str,
) {
    if let Some((domain, key)) = key.split_once(DOMAIN_SEPARATOR) {
        domains
            .entry(domain.trim().to_string())
            .or_default()
            .insert(normalize_key(key), value.trim().to_string());
    } else {
        raw.insert(normalize_key(key), value.trim().to_string());
    }
}

fn strip_braces(value: &str) -> &str {
    let v = value.trim();
    v.strip_prefix('{')
        .and_then(|v| v.strip_suffix('}'))
        .unwrap_or(v)
        .trim()
}

fn split_list(value: &str) -> Vec<String> {
    let inner = strip_braces(value);
    if inner.is_empty() {
        return Vec::new();
    }
    inner.split(',').map(|s| s.trim().to_string()).collect()
}

fn parse_map_info(value: &str) -> WeaveResult<GeoTransform> {
    let items = split_list(value);
    if items.len() < 7 {
        return Err(WeaveError::InvalidFormat(format!("map info too short: {}", value)));
    }
    let number = |i: usize| -> WeaveResult<f64> {
        items[i]
            .parse::<f64>()
            .map_err(|_| WeaveError::InvalidFormat(format!("map info entry {} is not numeric: {}", i, items[i])))
    };
    let (ref_x, ref_y) = (number(1)?, number(2)?);
    let (easting, northing) = (number(3)?, number(4)?);
    let (res_x, res_y) = (number(5)?, number(6)?);
    Ok(GeoTransform::north_up(
        easting - (ref_x - 1.0) * res_x,
        northing + (ref_y - 1.0) * res_y,
        res_x,
        res_y,
    ))
}

fn decode(bytes: &[u8], data_type: DataType, big_endian: bool) -> Vec<f64> {
    macro_rules! decode_as {
        ($t:ty) => {{
            const N: usize = std::mem::size_of::<$t>();
            bytes
                .chunks_exact(N)
                .map(|c| {
                    let mut buf = [0u8; N];
                    buf.copy_from_slice(c);
                    if big_endian {
                        <$t>::from_be_bytes(buf) as f64
                    } else {
                        <$t>::from_le_bytes(buf) as f64
                    }
                })
                .collect()
        }};
    }
    match data_type {
        DataType::UInt8 => bytes.iter().map(|&b| b as f64).collect(),
        DataType::Int16 => decode_as!(i16),
        DataType::UInt16 => decode_as!(u16),
        DataType::Int32 => decode_as!(i32),
        DataType::UInt32 => decode_as!(u32),
        DataType::Float32 => decode_as!(f32),
        DataType::Float64 => decode_as!(f64),
    }
}

fn encode(values: impl Iterator<Item = f64>, data_type: DataType, big_endian: bool, out: &mut Vec<u8>) {
    macro_rules! encode_as {
        ($t:ty) => {
            for v in values {
                let v = data_type.coerce(v) as $t;
                if big_endian {
                    out.extend_from_slice(&v.to_be_bytes());
                } else {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
        };
    }
    match data_type {
        DataType::UInt8 => encode_as!(u8),
        DataType::Int16 => encode_as!(i16),
        DataType::UInt16 => encode_as!(u16),
        DataType::Int32 => encode_as!(i32),
        DataType::UInt32 => encode_as!(u32),
        DataType::Float32 => encode_as!(f32),
        DataType::Float64 => encode_as!(f64),
    }
}

/// Open band-sequential raster
pub struct EnviDataset {
    data_path: PathBuf,
    header_path: PathBuf,
    header: EnviHeader,
    grid: PixelGrid,
    file: File,
    dirty: bool,
}

impl EnviDataset {
    pub fn open(path: &Path) -> WeaveResult<Self> {
        Self::open_with(path, false)
    }

    pub fn open_update(path: &Path) -> WeaveResult<Self> {
        Self::open_with(path, true)
    }

    fn open_with(path: &Path, update: bool) -> WeaveResult<Self> {
        let header_path = header_path(path);
        let text = std::fs::read_to_string(&header_path).map_err(|e| WeaveError::io(&header_path, e))?;
        let header = EnviHeader::parse(&text).map_err(|e| match e {
            WeaveError::InvalidFormat(msg) => {
                WeaveError::InvalidFormat(format!("{}: {}", header_path.display(), msg))
            }
            other => other,
        })?;
        let file = OpenOptions::new()
            .read(true)
            .write(update)
            .open(path)
            .map_err(|e| WeaveError::io(path, e))?;

        let expected = header.header_offset
            + (header.samples * header.lines * header.bands * header.data_type.size_bytes()) as u64;
        let actual = file.metadata().map_err(|e| WeaveError::io(path, e))?.len();
        if actual < expected {
            return Err(WeaveError::InvalidFormat(format!(
                "{} holds {} bytes, header requires {}",
                path.display(),
                actual,
                expected
            )));
        }

        Ok(Self {
            data_path: path.to_path_buf(),
            header_path,
            grid: header.grid(),
            header,
            file,
            dirty: false,
        })
    }

    pub fn create(path: &Path, grid: &PixelGrid, bands: usize, data_type: DataType) -> WeaveResult<Self> {
        let header = EnviHeader::new(grid, bands, data_type);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| WeaveError::io(path, e))?;
        let size = (grid.width * grid.height * bands * data_type.size_bytes()) as u64;
        file.set_len(size).map_err(|e| WeaveError::io(path, e))?;

        let mut dataset = Self {
            data_path: path.to_path_buf(),
            header_path: path.with_extension("hdr"),
            grid: header.grid(),
            header,
            file,
            dirty: true,
        };
        dataset.flush()?;
        Ok(dataset)
    }

    pub fn header(&self) -> &EnviHeader {
        &self.header
    }

    fn row_offset(&self, band: usize, row: usize, col: usize) -> u64 {
        let h = &self.header;
        let index = ((band - 1) * h.lines + row) * h.samples + col;
        h.header_offset + (index * h.data_type.size_bytes()) as u64
    }

    fn set_list_field(&mut self, key: &str, values: Vec<String>) {
        self.header
            .fields
            .insert(key.to_string(), format!("{{{}}}", values.join(", ")));
        self.dirty = true;
    }
}

impl RasterDataset for EnviDataset {
    fn grid(&self) -> &PixelGrid {
        &self.grid
    }

    fn band_count(&self) -> usize {
        self.header.bands
    }

    fn data_type(&self) -> DataType {
        self.header.data_type
    }

    fn read_window(&mut self, band: usize, window: &TileWindow) -> WeaveResult<Array2<f64>> {
        check_window(&self.grid, band, self.header.bands, window, &self.data_path)?;
        let row_bytes = window.width * self.header.data_type.size_bytes();
        let mut buffer = vec![0u8; row_bytes];
        let mut values = Vec::with_capacity(window.pixel_count());
        for row in window.y_offset..window.y_offset + window.height {
            let offset = self.row_offset(band, row, window.x_offset);
            self.file
                .seek(SeekFrom::Start(offset))
                .and_then(|_| self.file.read_exact(&mut buffer))
                .map_err(|e| WeaveError::io(&self.data_path, e))?;
            values.extend(decode(&buffer, self.header.data_type, self.header.big_endian));
        }
        Array2::from_shape_vec((window.height, window.width), values)
            .map_err(|e| WeaveError::InvalidFormat(format!("Failed to reshape window: {}", e)))
    }

    fn write_window(&mut self, band: usize, window: &TileWindow, data: ArrayView2<f64>) -> WeaveResult<()> {
        check_window(&self.grid, band, self.header.bands, window, &self.data_path)?;
        if data.dim() != (window.height, window.width) {
            return Err(WeaveError::DataInvariant(format!(
                "data of shape {:?} does not match {}",
                data.dim(),
                window
            )));
        }
        let mut buffer = Vec::with_capacity(window.width * self.header.data_type.size_bytes());
        for (local_row, values) in data.outer_iter().enumerate() {
            buffer.clear();
            encode(values.iter().copied(), self.header.data_type, self.header.big_endian, &mut buffer);
            let offset = self.row_offset(band, window.y_offset + local_row, window.x_offset);
            self.file
                .seek(SeekFrom::Start(offset))
                .and_then(|_| self.file.write_all(&buffer))
                .map_err(|e| WeaveError::io(&self.data_path, e))?;
        }
        Ok(())
    }

    fn metadata_domains(&self) -> Vec<String> {
        let mut domains = vec![DEFAULT_DOMAIN.to_string()];
        domains.extend(self.header.domains.keys().cloned());
        domains
    }

    fn metadata_domain(&self, domain: &str) -> BTreeMap<String, String> {
        if domain == DEFAULT_DOMAIN {
            self.header.fields.clone()
        } else {
            self.header.domains.get(domain).cloned().unwrap_or_default()
        }
    }

    fn set_metadata_domain(&mut self, domain: &str, items: &BTreeMap<String, String>) -> WeaveResult<()> {
        let normalized: BTreeMap<String, String> = items
            .iter()
            .map(|(k, v)| (normalize_key(k), v.clone()))
            .filter(|(k, _)| !(domain == DEFAULT_DOMAIN && STRUCTURAL_KEYS.contains(&k.as_str())))
            .collect();
        if domain == DEFAULT_DOMAIN {
            self.header.fields = normalized;
        } else if domain.contains(DOMAIN_SEPARATOR) || domain.contains('=') {
            return Err(WeaveError::Configuration(format!(
                "metadata domain '{}' cannot be stored in a header",
                domain
            )));
        } else if normalized.is_empty() {
            self.header.domains.remove(domain);
        } else {
            self.header.domains.insert(domain.to_string(), normalized);
        }
        self.dirty = true;
        Ok(())
    }

    fn no_data_value(&self, _band: usize) -> Option<f64> {
        self.header
            .fields
            .get("data_ignore_value")
            .and_then(|v| v.trim().parse().ok())
    }

    fn set_no_data_value(&mut self, _band: usize, value: Option<f64>) -> WeaveResult<()> {
        match value {
            Some(v) => {
                self.header
                    .fields
                    .insert("data_ignore_value".to_string(), MetaValue::Number(v).to_string());
            }
            None => {
                self.header.fields.remove("data_ignore_value");
            }
        }
        self.dirty = true;
        Ok(())
    }

    fn band_description(&self, band: usize) -> Option<String> {
        self.header.band_names().get(band.checked_sub(1)?).cloned()
    }

    fn set_band_description(&mut self, band: usize, description: &str) -> WeaveResult<()> {
        if band == 0 || band > self.header.bands {
            return Err(WeaveError::InvalidFormat(format!("band {} out of range", band)));
        }
        let mut names = self.header.band_names();
        if names[band - 1] != description {
            names[band - 1] = description.to_string();
            self.set_list_field("band_names", names);
        }
        Ok(())
    }

    fn set_color_table(&mut self, _band: usize, entries: &[ColorEntry]) -> WeaveResult<()> {
        let lookup = entries
            .iter()
            .flat_map(|c| [c.r, c.g, c.b])
            .map(|v| v.to_string())
            .collect();
        self.set_list_field("class_lookup", lookup);
        Ok(())
    }

    fn set_category_names(&mut self, _band: usize, names: &[String]) -> WeaveResult<()> {
        self.set_list_field("class_names", names.to_vec());
        Ok(())
    }

    fn flush(&mut self) -> WeaveResult<()> {
        if !self.dirty {
            return Ok(());
        }
        let mut tmp = self.header_path.as_os_str().to_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, self.header.render()).map_err(|e| WeaveError::io(&tmp, e))?;
        std::fs::rename(&tmp, &self.header_path).map_err(|e| WeaveError::io(&self.header_path, e))?;
        self.file.flush().map_err(|e| WeaveError::io(&self.data_path, e))?;
        self.dirty = false;
        Ok(())
    }
}
