//! Domain-keyed raster metadata

use crate::io::raster::{ColorEntry, RasterHandle};
use crate::types::{WeaveError, WeaveResult};
use std::collections::BTreeMap;
use std::fmt;

/// Domain used when callers do not name one
pub const DEFAULT_DOMAIN: &str = "ENVI";

/// Keys whose list values hold one entry per band
const BAND_INDEXED_KEYS: &[&str] = &[
    "band_names",
    "wavelength",
    "fwhm",
    "data_gain_values",
    "data_offset_values",
];

/// A single metadata value
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    Text(String),
    Number(f64),
    List(Vec<String>),
}

impl MetaValue {
    /// Parse the textual form used by sidecar headers and metadata domains
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.starts_with('{') && trimmed.ends_with('}') && trimmed.len() >= 2 {
            let inner = trimmed[1..trimmed.len() - 1].trim();
            if inner.is_empty() {
                return MetaValue::List(Vec::new());
            }
            return MetaValue::List(inner.split(',').map(|s| s.trim().to_string()).collect());
        }
        MetaValue::Text(trimmed.to_string())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetaValue::Number(v) => Some(*v),
            MetaValue::Text(s) => s.trim().parse().ok(),
            MetaValue::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Vec<String> {
        match self {
            MetaValue::List(items) => items.clone(),
            MetaValue::Text(s) => vec![s.clone()],
            MetaValue::Number(v) => vec![format_number(*v)],
        }
    }

    pub fn len(&self) -> usize {
        match self {
            MetaValue::List(items) => items.len(),
            _ => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::Text(s) => write!(f, "{}", s),
            MetaValue::Number(v) => write!(f, "{}", format_number(*v)),
            MetaValue::List(items) => write!(f, "{{{}}}", items.join(", ")),
        }
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        MetaValue::Text(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        MetaValue::Text(value)
    }
}

impl From<f64> for MetaValue {
    fn from(value: f64) -> Self {
        MetaValue::Number(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        MetaValue::Number(value as f64)
    }
}

impl From<Vec<String>> for MetaValue {
    fn from(value: Vec<String>) -> Self {
        MetaValue::List(value)
    }
}

impl From<Vec<&str>> for MetaValue {
    fn from(value: Vec<&str>) -> Self {
        MetaValue::List(value.into_iter().map(str::to_string).collect())
    }
}

fn format_number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

/// Keys are case-insensitive and treat spaces as underscores
pub fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase().replace(' ', "_")
}

/// In-memory metadata of one raster
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RasterMetadata {
    band_count: usize,
    domains: BTreeMap<String, BTreeMap<String, MetaValue>>,
}

impl RasterMetadata {
    pub fn new(band_count: usize) -> Self {
        Self {
            band_count,
            domains: BTreeMap::new(),
        }
    }

    /// Read all metadata domains of a raster
    pub fn read(handle: &RasterHandle) -> WeaveResult<Self> {
        log::debug!("Reading metadata from: {}", handle.path().display());
        let dataset = handle.open()?;
        let mut meta = RasterMetadata::new(dataset.band_count());

        for domain in dataset.metadata_domains() {
            for (key, raw) in dataset.metadata_domain(&domain) {
                meta.set(&key, Some(MetaValue::parse(&raw)), &domain);
            }
        }

        if meta.get("data_ignore_value", DEFAULT_DOMAIN).is_none() {
            if let Some(no_data) = dataset.no_data_value(1) {
                meta.set("data_ignore_value", Some(MetaValue::Number(no_data)), DEFAULT_DOMAIN);
            }
        }

        if meta.get("band_names", DEFAULT_DOMAIN).is_none() {
            let names: Vec<String> = (1..=meta.band_count)
                .map(|band| {
                    dataset
                        .band_description(band)
                        .filter(|d| !d.is_empty())
                        .unwrap_or_else(|| format!("Band {}", band))
                })
                .collect();
            meta.set("band_names", Some(MetaValue::List(names)), DEFAULT_DOMAIN);
        }

        Ok(meta)
    }

    pub fn band_count(&self) -> usize {
        self.band_count
    }

    pub fn set_band_count(&mut self, band_count: usize) {
        self.band_count = band_count;
    }

    pub fn get(&self, key: &str, domain: &str) -> Option<&MetaValue> {
        self.domains.get(domain)?.get(&normalize_key(key))
    }

    /// Lookup falling back to `default` when the key is absent
    pub fn get_or(&self, key: &str, domain: &str, default: MetaValue) -> MetaValue {
        self.get(key, domain).cloned().unwrap_or(default)
    }

    pub fn get_text(&self, key: &str, domain: &str) -> Option<String> {
        self.get(key, domain).map(|v| v.to_string())
    }

    pub fn get_f64(&self, key: &str, domain: &str) -> Option<f64> {
        self.get(key, domain).and_then(MetaValue::as_f64)
    }

    pub fn get_list(&self, key: &str, domain: &str) -> Option<Vec<String>> {
        self.get(key, domain).map(MetaValue::as_list)
    }

    /// Set a key; `None` removes it
    pub fn set(&mut self, key: &str, value: Option<MetaValue>, domain: &str) {
        let key = normalize_key(key);
        match value {
            Some(value) => {
                self.domains
                    .entry(domain.to_string())
                    .or_default()
                    .insert(key, value);
            }
            None => {
                if let Some(items) = self.domains.get_mut(domain) {
                    items.remove(&key);
                    if items.is_empty() {
                        self.domains.remove(domain);
                    }
                }
            }
        }
    }

    pub fn insert(&mut self, key: &str, value: impl Into<MetaValue>, domain: &str) {
        self.set(key, Some(value.into()), domain);
    }

    pub fn domain_names(&self) -> impl Iterator<Item = &str> {
        self.domains.keys().map(String::as_str)
    }

    /// All keys of one domain
    pub fn metadata_dict(&self, domain: &str) -> BTreeMap<String, MetaValue> {
        self.domains.get(domain).cloned().unwrap_or_default()
    }

    pub fn band_names(&self) -> Vec<String> {
        self.get_list("band_names", DEFAULT_DOMAIN)
            .unwrap_or_else(|| (1..=self.band_count).map(|b| format!("Band {}", b)).collect())
    }

    pub fn set_band_names(&mut self, names: Vec<String>) {
        self.set("band_names", Some(MetaValue::List(names)), DEFAULT_DOMAIN);
    }

    pub fn is_classification(&self) -> bool {
        self.get_text("file_type", DEFAULT_DOMAIN)
            .map(|t| t.trim().eq_ignore_ascii_case("classification"))
            .unwrap_or(false)
    }

    /// No-data value; classification rasters always report 0
    pub fn no_data_value(&self) -> Option<f64> {
        if self.is_classification() {
            return Some(0.0);
        }
        self.get_f64("data_ignore_value", DEFAULT_DOMAIN)
    }

    pub fn set_no_data_value(&mut self, value: Option<f64>) {
        self.set("data_ignore_value", value.map(MetaValue::Number), DEFAULT_DOMAIN);
    }

    /// Store a validated class table and mark the raster as a classification
    pub fn set_classification(
        &mut self,
        class_names: Vec<String>,
        class_lookup: Vec<u8>,
    ) -> WeaveResult<()> {
        let classes = class_names.len();
        check_class_lookup(classes, class_lookup.len())?;
        self.insert("file_type", "classification", DEFAULT_DOMAIN);
        self.insert("classes", classes as i64, DEFAULT_DOMAIN);
        self.set("class_names", Some(MetaValue::List(class_names)), DEFAULT_DOMAIN);
        self.set(
            "class_lookup",
            Some(MetaValue::List(class_lookup.iter().map(|v| v.to_string()).collect())),
            DEFAULT_DOMAIN,
        );
        Ok(())
    }

    /// Check the invariants an on-disk header must satisfy
    pub fn validate(&self) -> WeaveResult<()> {
        for key in BAND_INDEXED_KEYS {
            if let Some(value) = self.get(key, DEFAULT_DOMAIN) {
                if value.len() != self.band_count {
                    return Err(WeaveError::DataInvariant(format!(
                        "'{}' has {} entries but the raster has {} bands",
                        key,
                        value.len(),
                        self.band_count
                    )));
                }
            }
        }
        if self.is_classification() {
            self.color_table()?;
        }
        Ok(())
    }

    /// Color table and category names derived from the class table
    fn color_table(&self) -> WeaveResult<(Vec<ColorEntry>, Vec<String>)> {
        let classes = self
            .get_f64("classes", DEFAULT_DOMAIN)
            .ok_or_else(|| WeaveError::DataInvariant("classification without 'classes'".to_string()))?
            as usize;
        let names = self.get_list("class_names", DEFAULT_DOMAIN).unwrap_or_default();
        let lookup = self.get_list("class_lookup", DEFAULT_DOMAIN).unwrap_or_default();
        check_class_lookup(classes, lookup.len())?;
        if names.len() != classes {
            return Err(WeaveError::DataInvariant(format!(
                "'class_names' has {} entries but 'classes' is {}",
                names.len(),
                classes
            )));
        }

        let values = lookup
            .iter()
            .map(|v| {
                v.trim().parse::<u8>().map_err(|_| {
                    WeaveError::DataInvariant(format!("invalid 'class_lookup' entry '{}'", v))
                })
            })
            .collect::<WeaveResult<Vec<u8>>>()?;
        let colors = values
            .chunks(3)
            .map(|rgb| ColorEntry { r: rgb[0], g: rgb[1], b: rgb[2], a: 255 })
            .collect();
        Ok((colors, names))
    }

    /// Flush all domains to an existing raster
    pub fn write(&self, handle: &RasterHandle) -> WeaveResult<()> {
        log::debug!("Writing metadata to: {}", handle.path().display());
        self.validate()?;

        let mut dataset = handle.open_update()?;
        if dataset.band_count() != self.band_count {
            return Err(WeaveError::DataInvariant(format!(
                "metadata describes {} bands but {} has {}",
                self.band_count,
                handle.path().display(),
                dataset.band_count()
            )));
        }

        for stale in dataset.metadata_domains() {
            if !self.domains.contains_key(&stale) {
                dataset.set_metadata_domain(&stale, &BTreeMap::new())?;
            }
        }
        for (domain, items) in &self.domains {
            let rendered: BTreeMap<String, String> =
                items.iter().map(|(k, v)| (k.clone(), v.to_string())).collect();
            dataset.set_metadata_domain(domain, &rendered)?;
        }

        let no_data = self.no_data_value();
        let names = self.band_names();
        for band in 1..=self.band_count {
            dataset.set_no_data_value(band, no_data)?;
            if let Some(name) = names.get(band - 1) {
                dataset.set_band_description(band, name)?;
            }
        }

        if self.is_classification() && self.band_count == 1 {
            let (colors, categories) = self.color_table()?;
            dataset.set_color_table(1, &colors)?;
            dataset.set_category_names(1, &categories)?;
        }

        dataset.flush()
    }
}

fn check_class_lookup(classes: usize, lookup_len: usize) -> WeaveResult<()> {
    if lookup_len != 3 * classes {
        return Err(WeaveError::DataInvariant(format!(
            "'class_lookup' has {} entries, expected 3 * {} classes",
            lookup_len, classes
        )));
    }
    Ok(())
}
