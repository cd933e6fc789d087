//! Best-observation compositing over a time series of Landsat-style scenes
//!
//! For a target date the engine collects the archive observations that fall
//! inside the day/year buffer, scores every candidate per pixel with the
//! configured ensemble and assembles the best-scoring observation's bands
//! plus a flags raster describing where each pixel came from. The same
//! candidate window also feeds per-band temporal statistics.

use crate::core::applier::{Applier, ApplierOptions, CancellationToken, NoProgress, ProgressSink, RasterSource, RunReport};
use crate::core::blocks::BlockAssociations;
use crate::core::percentiles::{nanmean, nanpercentiles, nanstd};
use crate::core::scoring::{ScoringConfig, ScoringContext};
use crate::core::tiling::TileWindow;
use crate::io::metadata::{MetaValue, RasterMetadata, DEFAULT_DOMAIN};
use crate::io::raster::{RasterFormat, RasterHandle};
use crate::types::{DataType, PixelGrid, WeaveError, WeaveResult};
use chrono::{Datelike, NaiveDate};
use ndarray::{Array2, Array3, ArrayView2, Axis, Zip};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Sentinel written to every band of pixels without a valid observation
pub const DEFAULT_NO_DATA: f64 = -9999.0;

/// Band order of the flags raster
pub const FLAG_BANDS: [&str; 5] = ["doy", "sensor", "path", "row", "score"];

const ARCHIVE_KEY: &str = "archive";
const COMPOSITE_KEY: &str = "composite";
const FLAGS_KEY: &str = "flags";
const STATISTICS_KEY: &str = "statistics";
const NO_SELECTION: usize = usize::MAX;

/// Numeric sensor code stored in the flags raster
pub fn sensor_code(sensor: &str) -> u8 {
    match sensor.to_ascii_uppercase().as_str() {
        "LT4" => 4,
        "LT5" => 5,
        "LE7" => 7,
        "LC8" | "LO8" => 8,
        "LC9" | "LO9" => 9,
        _ => 0,
    }
}

/// Sensor, WRS-2 location and date encoded in a Landsat product identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneId {
    pub sensor: String,
    pub path: u32,
    pub row: u32,
    pub date: NaiveDate,
}

impl SceneId {
    /// Parse `LC81930232015084LGN00` or `LC08_L1TP_193023_20150325_...` identifiers
    pub fn parse(id: &str) -> WeaveResult<Self> {
        let invalid = |reason: &str| WeaveError::Metadata(format!("'{}' is not a Landsat scene id: {}", id, reason));
        let build_regex = |pattern: &str| Regex::new(pattern).map_err(|e| invalid(&e.to_string()));

        let collection = build_regex(r"^(L[CTEMO])(\d{2})_[A-Z0-9]{4}_(\d{3})(\d{3})_(\d{4})(\d{2})(\d{2})")?;
        if let Some(caps) = collection.captures(id) {
            let number: u32 = caps[2].parse().map_err(|_| invalid("sensor number"))?;
            let date = NaiveDate::from_ymd_opt(
                caps[5].parse().map_err(|_| invalid("year"))?,
                caps[6].parse().map_err(|_| invalid("month"))?,
                caps[7].parse().map_err(|_| invalid("day"))?,
            )
            .ok_or_else(|| invalid("acquisition date out of range"))?;
            return Ok(Self {
                sensor: format!("{}{}", &caps[1], number),
                path: caps[3].parse().map_err(|_| invalid("path"))?,
                row: caps[4].parse().map_err(|_| invalid("row"))?,
                date,
            });
        }

        let pre_collection = build_regex(r"^(L[CTEMO]\d)(\d{3})(\d{3})(\d{4})(\d{3})[A-Z]{3}\d{2}$")?;
        let caps = pre_collection
            .captures(id)
            .ok_or_else(|| invalid("unrecognized layout"))?;
        let date = NaiveDate::from_yo_opt(
            caps[4].parse().map_err(|_| invalid("year"))?,
            caps[5].parse().map_err(|_| invalid("day of year"))?,
        )
        .ok_or_else(|| invalid("day of year out of range"))?;
        Ok(Self {
            sensor: caps[1].to_string(),
            path: caps[2].parse().map_err(|_| invalid("path"))?,
            row: caps[3].parse().map_err(|_| invalid("row"))?,
            date,
        })
    }
}

/// One acquisition available to the compositor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: String,
    pub date: NaiveDate,
    pub sensor: String,
    pub path: u32,
    pub row: u32,
    /// Named single-band rasters, e.g. ("red", ...), ("qa", ...)
    pub bands: Vec<(String, RasterHandle)>,
    #[serde(default)]
    pub cloud_cover: Option<f64>,
    #[serde(default)]
    pub sun_elevation: Option<f64>,
}

impl Observation {
    /// Acquisition attributes decoded from the scene identifier
    pub fn from_scene_id(id: &str, bands: Vec<(String, RasterHandle)>) -> WeaveResult<Self> {
        let scene = SceneId::parse(id)?;
        Ok(Self {
            id: id.to_string(),
            date: scene.date,
            sensor: scene.sensor,
            path: scene.path,
            row: scene.row,
            bands,
            cloud_cover: None,
            sun_elevation: None,
        })
    }

    /// Acquisition attributes read from the metadata of the first band
    pub fn from_metadata(id: &str, bands: Vec<(String, RasterHandle)>) -> WeaveResult<Self> {
        let (_, first) = bands
            .first()
            .ok_or_else(|| WeaveError::Metadata(format!("observation '{}' has no bands", id)))?;
        let meta = RasterMetadata::read(first)?;
        let missing = |key: &str| WeaveError::Metadata(format!("observation '{}': missing or malformed '{}'", id, key));

        let date_text = meta
            .get_text("acquisition_date", DEFAULT_DOMAIN)
            .ok_or_else(|| missing("acquisition_date"))?;
        let date = NaiveDate::parse_from_str(date_text.trim(), "%Y-%m-%d").map_err(|_| missing("acquisition_date"))?;
        let sensor = meta
            .get_text("sensor", DEFAULT_DOMAIN)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| missing("sensor"))?;
        let wrs = |key: &str| -> WeaveResult<u32> {
            meta.get_f64(key, DEFAULT_DOMAIN)
                .filter(|v| *v >= 0.0 && v.fract() == 0.0)
                .map(|v| v as u32)
                .ok_or_else(|| missing(key))
        };

        Ok(Self {
            id: id.to_string(),
            date,
            sensor,
            path: wrs("path")?,
            row: wrs("row")?,
            cloud_cover: meta.get_f64("cloud_cover", DEFAULT_DOMAIN),
            sun_elevation: meta.get_f64("sun_elevation", DEFAULT_DOMAIN),
            bands,
        })
    }

    pub fn band(&self, name: &str) -> Option<&RasterHandle> {
        self.bands.iter().find(|(n, _)| n == name).map(|(_, h)| h)
    }

    pub fn doy(&self) -> u32 {
        self.date.ordinal()
    }

    pub fn year(&self) -> i32 {
        self.date.year()
    }

    /// WRS-2 tile id, e.g. "193023"
    pub fn tile_id(&self) -> String {
        format!("{:03}{:03}", self.path, self.row)
    }
}

/// `target` moved to `year`; Feb 29 becomes Feb 28 in non-leap years
fn shift_year(target: NaiveDate, year: i32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, target.month(), target.day())
        .or_else(|| NaiveDate::from_ymd_opt(year, target.month(), 28))
}

/// Whether `date` falls within `buffer_days` of the target in any year of the year buffer
pub fn in_window(date: NaiveDate, target: NaiveDate, buffer_days: i64, buffer_years: i32) -> bool {
    (target.year() - buffer_years..=target.year() + buffer_years)
        .filter_map(|year| shift_year(target, year))
        .any(|center| (date - center).num_days().abs() <= buffer_days)
}

/// Compositing parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositingConfig {
    /// Bands copied from the selected observation, in output order
    pub bands: Vec<String>,
    /// Band holding the pixel quality mask, if any
    pub mask_band: Option<String>,
    /// Mask values that mark a usable pixel
    pub valid_mask_values: Vec<f64>,
    /// Converts stored values to surface reflectance
    pub reflectance_scale: f64,
    pub no_data: f64,
    pub buffer_days: i64,
    pub buffer_years: i32,
    pub scoring: ScoringConfig,
    pub composite_type: DataType,
    pub flags_type: DataType,
}

impl Default for CompositingConfig {
    fn default() -> Self {
        Self {
            bands: ["blue", "green", "red", "nir", "swir1", "swir2"]
                .iter()
                .map(|b| b.to_string())
                .collect(),
            mask_band: None,
            // cfmask clear land and clear water
            valid_mask_values: vec![0.0, 1.0],
            reflectance_scale: 0.0001,
            no_data: DEFAULT_NO_DATA,
            buffer_days: 45,
            buffer_years: 0,
            scoring: ScoringConfig::default(),
            composite_type: DataType::Int16,
            flags_type: DataType::Int16,
        }
    }
}

impl CompositingConfig {
    pub fn from_json_file(path: &Path) -> WeaveResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| WeaveError::io(path, e))?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> WeaveResult<()> {
        if self.bands.is_empty() {
            return Err(WeaveError::Configuration("no composite bands configured".to_string()));
        }
        if self.buffer_days < 0 || self.buffer_years < 0 {
            return Err(WeaveError::Configuration(format!(
                "buffers must be non-negative (days {}, years {})",
                self.buffer_days, self.buffer_years
            )));
        }
        if !self.reflectance_scale.is_finite() || self.reflectance_scale <= 0.0 {
            return Err(WeaveError::Configuration(format!(
                "invalid reflectance scale {}",
                self.reflectance_scale
            )));
        }
        for (what, data_type) in [("composite", self.composite_type), ("flags", self.flags_type)] {
            if data_type.coerce(self.no_data) != self.no_data {
                return Err(WeaveError::Configuration(format!(
                    "{} type {} cannot store no-data value {}",
                    what, data_type, self.no_data
                )));
            }
        }
        self.scoring.validate()
    }

    /// Every band an observation must provide, in first-use order
    pub fn required_bands(&self) -> Vec<String> {
        let mut required = self.bands.clone();
        let extra = self.mask_band.iter().cloned().chain(self.scoring.required_bands());
        for band in extra {
            if !required.contains(&band) {
                required.push(band);
            }
        }
        required
    }
}

/// Where one composite is written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeTarget {
    pub date: NaiveDate,
    pub composite: RasterHandle,
    #[serde(default)]
    pub flags: Option<RasterHandle>,
}

impl CompositeTarget {
    /// `composite_<date>.bsq` and `flags_<date>.bsq` under `dir`
    pub fn in_directory(date: NaiveDate, dir: &Path) -> Self {
        Self::in_directory_as(date, dir, &RasterFormat::Envi)
    }

    /// Same naming as [`in_directory`](Self::in_directory) with the extension of `format`
    pub fn in_directory_as(date: NaiveDate, dir: &Path, format: &RasterFormat) -> Self {
        let name = |kind: &str| dir.join(format!("{}_{}.{}", kind, date, format.extension()));
        Self {
            date,
            composite: RasterHandle::new(name("composite"), format.clone()),
            flags: Some(RasterHandle::new(name("flags"), format.clone())),
        }
    }
}

/// Stages of one composite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeState {
    CollectingObservations,
    Scoring,
    Selecting,
    Assembling,
    Done,
}

impl fmt::Display for CompositeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompositeState::CollectingObservations => "collecting observations",
            CompositeState::Scoring => "scoring",
            CompositeState::Selecting => "selecting",
            CompositeState::Assembling => "assembling",
            CompositeState::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct CompositeReport {
    pub date: NaiveDate,
    /// Ids of the candidate observations, in scoring order
    pub candidates: Vec<String>,
    /// Stages passed through, in order
    pub states: Vec<CompositeState>,
    pub run: RunReport,
}

/// One candidate's bands within one tile
struct TileCandidate<'a> {
    bands: BTreeMap<&'a str, ArrayView2<'a, f64>>,
    valid: Array2<bool>,
}

fn member_key(index: usize, band: &str) -> String {
    format!("{}/{}/{}", ARCHIVE_KEY, index, band)
}

fn percentile_label(p: f64) -> String {
    if p.fract() == 0.0 {
        format!("p{}", p as i64)
    } else {
        format!("p{}", p)
    }
}

/// Best-observation compositor
pub struct CompositingEngine {
    config: CompositingConfig,
    options: ApplierOptions,
    progress: Arc<dyn ProgressSink>,
    cancellation: CancellationToken,
}

impl CompositingEngine {
    pub fn new(config: CompositingConfig, options: ApplierOptions) -> WeaveResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            options,
            progress: Arc::new(NoProgress),
            cancellation: CancellationToken::new(),
        })
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn config(&self) -> &CompositingConfig {
        &self.config
    }

    /// Archive observations inside the target's buffer window, ordered by date then id
    pub fn select<'a>(&self, archive: &'a [Observation], target: NaiveDate) -> Vec<&'a Observation> {
        let mut selected: Vec<&Observation> = archive
            .iter()
            .filter(|o| in_window(o.date, target, self.config.buffer_days, self.config.buffer_years))
            .collect();
        selected.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
        selected
    }

    /// Candidates for `target`, checked for every band the run will read
    fn collect<'a>(&self, archive: &'a [Observation], target: NaiveDate) -> WeaveResult<Vec<&'a Observation>> {
        let required = self.config.required_bands();
        let candidates = self.select(archive, target);
        for observation in &candidates {
            if let Some(band) = required.iter().find(|b| observation.band(b).is_none()) {
                return Err(WeaveError::Metadata(format!(
                    "observation '{}' has no '{}' band",
                    observation.id, band
                )));
            }
            self.config.scoring.check_observation(observation)?;
        }
        log::info!(
            "{}: {} of {} observations within {} days / {} years",
            target,
            candidates.len(),
            archive.len(),
            self.config.buffer_days,
            self.config.buffer_years
        );
        Ok(candidates)
    }

    fn applier(&self, archive: &[Observation], candidates: &[&Observation]) -> WeaveResult<Applier> {
        let mut applier = Applier::new(self.options.clone())
            .with_progress(self.progress.clone())
            .with_cancellation(self.cancellation.clone());
        if candidates.is_empty() {
            applier = applier.with_grid(reference_grid(archive)?);
        } else {
            let required = self.config.required_bands();
            let groups: Vec<Vec<(String, RasterHandle)>> = candidates
                .iter()
                .map(|observation| {
                    required
                        .iter()
                        .filter_map(|band| observation.band(band).map(|h| (band.clone(), h.clone())))
                        .collect()
                })
                .collect();
            applier.declare_input(ARCHIVE_KEY, RasterSource::GroupList(groups));
        }
        Ok(applier)
    }

    fn read_candidates<'a>(
        &self,
        inputs: &'a BlockAssociations,
        count: usize,
        required: &'a [String],
        shape: (usize, usize),
    ) -> WeaveResult<Vec<TileCandidate<'a>>> {
        (0..count)
            .map(|index| {
                let mut bands = BTreeMap::new();
                let mut valid = Array2::from_elem(shape, true);
                for name in required {
                    let (block, meta) = inputs.get(&member_key(index, name))?;
                    let view = block.band(0);
                    if self.config.bands.contains(name) {
                        let no_data = meta.no_data_value();
                        Zip::from(&mut valid).and(&view).for_each(|ok, &v| {
                            if v.is_nan() || Some(v) == no_data {
                                *ok = false;
                            }
                        });
                    }
                    bands.insert(name.as_str(), view);
                }
                if let Some(mask) = self.config.mask_band.as_deref() {
                    let mask_view = bands.get(mask).ok_or_else(|| WeaveError::MissingBlock(member_key(index, mask)))?;
                    let accepted = &self.config.valid_mask_values;
                    Zip::from(&mut valid).and(mask_view).for_each(|ok, m| {
                        if !accepted.contains(m) {
                            *ok = false;
                        }
                    });
                }
                Ok(TileCandidate { bands, valid })
            })
            .collect()
    }

    /// Per pixel, the index of the best-scoring valid candidate and its score
    fn best_observation<'a>(
        &self,
        tile_candidates: &[TileCandidate<'a>],
        candidates: &[&'a Observation],
        target: NaiveDate,
        max_year_distance: i32,
        shape: (usize, usize),
    ) -> WeaveResult<(Array2<usize>, Array2<f64>)> {
        let mut best_index = Array2::from_elem(shape, NO_SELECTION);
        let mut best_score = Array2::from_elem(shape, f64::NEG_INFINITY);
        for (index, (blocks, &observation)) in tile_candidates.iter().zip(candidates).enumerate() {
            let context = ScoringContext {
                observation,
                target,
                max_year_distance,
                reflectance_scale: self.config.reflectance_scale,
                shape,
                bands: blocks.bands.clone(),
            };
            let mut scores = self.config.scoring.score(&context)?;
            Zip::from(&mut scores).and(&blocks.valid).for_each(|s, &ok| {
                if !ok {
                    *s = f64::NEG_INFINITY;
                }
            });
            // Strictly greater: ties keep the earlier candidate.
            Zip::from(&mut best_index)
                .and(&mut best_score)
                .and(&scores)
                .for_each(|bi, bs, &s| {
                    if s > *bs {
                        *bs = s;
                        *bi = index;
                    }
                });
        }
        Ok((best_index, best_score))
    }

    /// Build the composite (and flags raster) for one target date
    ///
    /// An empty candidate window yields an all-no-data composite on the grid of the first archive
    /// raster. An archive without any band raster has no grid to tile and fails with
    /// `WeaveError::Configuration`.
    pub fn composite(&self, archive: &[Observation], target: &CompositeTarget) -> WeaveResult<CompositeReport> {
        let mut states = vec![CompositeState::CollectingObservations];
        log::info!("Compositing {} ({})", target.date, CompositeState::CollectingObservations);
        let candidates = self.collect(archive, target.date)?;
        if candidates.is_empty() {
            log::warn!("No observations within the window of {}; writing an empty composite", target.date);
            states.push(CompositeState::Assembling);
        } else {
            states.extend([CompositeState::Scoring, CompositeState::Selecting, CompositeState::Assembling]);
        }

        let mut applier = self.applier(archive, &candidates)?;
        applier.declare_output(COMPOSITE_KEY, target.composite.clone());
        if let Some(flags) = &target.flags {
            applier.declare_output(FLAGS_KEY, flags.clone());
        }

        let required = self.config.required_bands();
        let max_year_distance = candidates
            .iter()
            .map(|o| (o.year() - target.date.year()).abs())
            .max()
            .unwrap_or(0);
        let no_data = self.config.no_data;
        let band_count = self.config.bands.len();
        let write_flags = target.flags.is_some();

        let tile_fn = |tile: &TileWindow, inputs: &BlockAssociations, outputs: &mut BlockAssociations| -> WeaveResult<()> {
            let shape = (tile.height, tile.width);
            let tile_candidates = self.read_candidates(inputs, candidates.len(), &required, shape)?;
            let (best_index, best_score) =
                self.best_observation(&tile_candidates, &candidates, target.date, max_year_distance, shape)?;

            let mut composite = Array3::from_elem((band_count, shape.0, shape.1), no_data);
            for (b, name) in self.config.bands.iter().enumerate() {
                let planes: Vec<&ArrayView2<'_, f64>> = tile_candidates
                    .iter()
                    .map(|c| c.bands.get(name.as_str()))
                    .collect::<Option<_>>()
                    .ok_or_else(|| WeaveError::MissingBlock(name.clone()))?;
                Zip::indexed(composite.index_axis_mut(Axis(0), b))
                    .and(&best_index)
                    .for_each(|(y, x), value, &i| {
                        if i != NO_SELECTION {
                            *value = planes[i][[y, x]];
                        }
                    });
            }
            outputs.add_typed_block(COMPOSITE_KEY, composite, self.config.composite_type, RasterMetadata::new(band_count))?;

            if write_flags {
                let mut flags = Array3::from_elem((FLAG_BANDS.len(), shape.0, shape.1), no_data);
                Zip::indexed(&best_index).and(&best_score).for_each(|(y, x), &i, &score| {
                    if i != NO_SELECTION {
                        let observation = candidates[i];
                        flags[[0, y, x]] = observation.doy() as f64;
                        flags[[1, y, x]] = sensor_code(&observation.sensor) as f64;
                        flags[[2, y, x]] = observation.path as f64;
                        flags[[3, y, x]] = observation.row as f64;
                        flags[[4, y, x]] = (score * 10000.0).round();
                    }
                });
                outputs.add_typed_block(FLAGS_KEY, flags, self.config.flags_type, RasterMetadata::new(FLAG_BANDS.len()))?;
            }
            Ok(())
        };

        let candidate_ids: Vec<String> = candidates.iter().map(|o| o.id.clone()).collect();
        let metadata_fn = |_: &BTreeMap<String, RasterMetadata>, outputs: &mut BTreeMap<String, RasterMetadata>| -> WeaveResult<()> {
            if let Some(meta) = outputs.get_mut(COMPOSITE_KEY) {
                meta.set_band_names(self.config.bands.clone());
                self.describe(meta, target.date, &candidate_ids);
            }
            if let Some(meta) = outputs.get_mut(FLAGS_KEY) {
                meta.set_band_names(FLAG_BANDS.iter().map(|b| b.to_string()).collect());
                self.describe(meta, target.date, &candidate_ids);
            }
            Ok(())
        };

        let run = applier.run(tile_fn, metadata_fn)?;
        states.push(CompositeState::Done);
        log::info!("Composite {} written to {}", target.date, target.composite.path().display());
        Ok(CompositeReport {
            date: target.date,
            candidates: candidate_ids,
            states,
            run,
        })
    }

    /// Independent composites for several targets, in order
    pub fn composite_all(&self, archive: &[Observation], targets: &[CompositeTarget]) -> WeaveResult<Vec<CompositeReport>> {
        targets.iter().map(|target| self.composite(archive, target)).collect()
    }

    /// Per-band percentiles, mean and standard deviation over the valid candidates.
    ///
    /// Bands are ordered band-major: for each composite band, the requested
    /// percentiles followed by mean and standard deviation.
    pub fn statistics(
        &self,
        archive: &[Observation],
        date: NaiveDate,
        percentiles: &[f64],
        output: &RasterHandle,
    ) -> WeaveResult<CompositeReport> {
        if let Some(p) = percentiles.iter().find(|p| !(0.0..=100.0).contains(*p)) {
            return Err(WeaveError::Configuration(format!("percentile {} outside [0, 100]", p)));
        }
        let mut states = vec![CompositeState::CollectingObservations];
        let candidates = self.collect(archive, date)?;
        states.push(CompositeState::Assembling);

        let mut applier = self.applier(archive, &candidates)?;
        applier.declare_output(STATISTICS_KEY, output.clone());

        let required = self.config.required_bands();
        let no_data = self.config.no_data;
        let per_band = percentiles.len() + 2;
        let band_count = self.config.bands.len() * per_band;

        let tile_fn = |tile: &TileWindow, inputs: &BlockAssociations, outputs: &mut BlockAssociations| -> WeaveResult<()> {
            let shape = (tile.height, tile.width);
            let tile_candidates = self.read_candidates(inputs, candidates.len(), &required, shape)?;
            let mut result = Array3::from_elem((band_count, shape.0, shape.1), no_data);
            for (b, name) in self.config.bands.iter().enumerate() {
                let mut stack = Array3::from_elem((tile_candidates.len(), shape.0, shape.1), f64::NAN);
                for (i, candidate) in tile_candidates.iter().enumerate() {
                    let plane = candidate
                        .bands
                        .get(name.as_str())
                        .ok_or_else(|| WeaveError::MissingBlock(name.clone()))?;
                    Zip::from(stack.index_axis_mut(Axis(0), i))
                        .and(plane)
                        .and(&candidate.valid)
                        .for_each(|s, &v, &ok| {
                            if ok {
                                *s = v;
                            }
                        });
                }
                let start = b * per_band;
                for (offset, values) in nanpercentiles(stack.view(), percentiles, no_data)?.into_iter().enumerate() {
                    result.index_axis_mut(Axis(0), start + offset).assign(&values);
                }
                result
                    .index_axis_mut(Axis(0), start + percentiles.len())
                    .assign(&nanmean(stack.view(), no_data));
                result
                    .index_axis_mut(Axis(0), start + percentiles.len() + 1)
                    .assign(&nanstd(stack.view(), no_data));
            }
            outputs.add_typed_block(STATISTICS_KEY, result, DataType::Float32, RasterMetadata::new(band_count))
        };

        let candidate_ids: Vec<String> = candidates.iter().map(|o| o.id.clone()).collect();
        let metadata_fn = |_: &BTreeMap<String, RasterMetadata>, outputs: &mut BTreeMap<String, RasterMetadata>| -> WeaveResult<()> {
            if let Some(meta) = outputs.get_mut(STATISTICS_KEY) {
                let names: Vec<String> = self
                    .config
                    .bands
                    .iter()
                    .flat_map(|band| {
                        percentiles
                            .iter()
                            .map(|p| percentile_label(*p))
                            .chain(["mean".to_string(), "std".to_string()])
                            .map(move |stat| format!("{}_{}", band, stat))
                    })
                    .collect();
                meta.set_band_names(names);
                self.describe(meta, date, &candidate_ids);
            }
            Ok(())
        };

        let run = applier.run(tile_fn, metadata_fn)?;
        states.push(CompositeState::Done);
        Ok(CompositeReport {
            date,
            candidates: candidate_ids,
            states,
            run,
        })
    }

    fn describe(&self, meta: &mut RasterMetadata, date: NaiveDate, candidates: &[String]) {
        meta.set_no_data_value(Some(self.config.no_data));
        meta.insert("composite_date", date.to_string(), DEFAULT_DOMAIN);
        meta.set("observations", Some(MetaValue::List(candidates.to_vec())), DEFAULT_DOMAIN);
    }
}

/// Grid of the first band of the first archive observation
fn reference_grid(archive: &[Observation]) -> WeaveResult<PixelGrid> {
    let handle = archive
        .iter()
        .find_map(|o| o.bands.first().map(|(_, h)| h))
        .ok_or_else(|| WeaveError::Configuration("archive has no rasters to take a grid from".to_string()))?;
    Ok(handle.open()?.grid().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn observation(id: &str, date: NaiveDate) -> Observation {
        Observation {
            id: id.to_string(),
            date,
            sensor: "LC8".to_string(),
            path: 193,
            row: 23,
            bands: Vec::new(),
            cloud_cover: None,
            sun_elevation: None,
        }
    }

    #[test]
    fn test_parse_pre_collection_id() {
        let scene = SceneId::parse("LC81930232015084LGN00").unwrap();
        assert_eq!(scene.sensor, "LC8");
        assert_eq!((scene.path, scene.row), (193, 23));
        assert_eq!(scene.date, day(2015, 3, 25));
    }

    #[test]
    fn test_parse_collection_id() {
        let scene = SceneId::parse("LE07_L1TP_193023_20030620_20161208_01_T1").unwrap();
        assert_eq!(scene.sensor, "LE7");
        assert_eq!((scene.path, scene.row), (193, 23));
        assert_eq!(scene.date, day(2003, 6, 20));
        assert!(matches!(SceneId::parse("not_a_scene"), Err(WeaveError::Metadata(_))));
        assert!(SceneId::parse("LC81930232015400LGN00").is_err());
    }

    #[test]
    fn test_sensor_codes() {
        assert_eq!(sensor_code("LT5"), 5);
        assert_eq!(sensor_code("le7"), 7);
        assert_eq!(sensor_code("LC9"), 9);
        assert_eq!(sensor_code("S2A"), 0);
    }

    #[test]
    fn test_window_spans_year_buffer() {
        let target = day(2020, 7, 1);
        assert!(in_window(day(2020, 8, 10), target, 40, 0));
        assert!(!in_window(day(2020, 8, 11), target, 40, 0));
        assert!(!in_window(day(2019, 7, 1), target, 40, 0));
        assert!(in_window(day(2019, 7, 20), target, 40, 1));
        assert!(!in_window(day(2019, 12, 1), target, 40, 1));
    }

    #[test]
    fn test_leap_day_target() {
        let target = day(2020, 2, 29);
        assert!(in_window(day(2019, 2, 28), target, 0, 1));
        assert!(in_window(day(2021, 3, 1), target, 1, 1));
    }

    #[test]
    fn test_select_orders_by_date() {
        let archive = vec![
            observation("c", day(2020, 7, 20)),
            observation("a", day(2020, 6, 1)),
            observation("far", day(2020, 1, 1)),
            observation("b", day(2020, 6, 1)),
        ];
        let mut config = CompositingConfig::default();
        config.buffer_days = 40;
        let engine = CompositingEngine::new(config, ApplierOptions::default()).unwrap();
        let ids: Vec<_> = engine.select(&archive, day(2020, 7, 1)).iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_missing_band_names_observation() {
        let archive = vec![observation("LC81930232020183LGN00", day(2020, 7, 1))];
        let engine = CompositingEngine::new(CompositingConfig::default(), ApplierOptions::default()).unwrap();
        let err = engine.collect(&archive, day(2020, 7, 1)).unwrap_err();
        match err {
            WeaveError::Metadata(message) => assert!(message.contains("LC81930232020183LGN00")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_config_rejects_unstorable_no_data() {
        let mut config = CompositingConfig::default();
        config.composite_type = DataType::UInt16;
        assert!(matches!(config.validate(), Err(WeaveError::Configuration(_))));
    }

    #[test]
    fn test_required_bands_include_mask_and_scoring() {
        let mut config = CompositingConfig::default();
        config.bands = vec!["red".to_string()];
        config.mask_band = Some("qa".to_string());
        config.scoring = ScoringConfig::single(crate::core::scoring::ScoringFunction::ndvi());
        assert_eq!(config.required_bands(), vec!["red", "qa", "nir"]);
    }

    #[test]
    fn test_percentile_labels() {
        assert_eq!(percentile_label(25.0), "p25");
        assert_eq!(percentile_label(12.5), "p12.5");
    }

    #[test]
    fn test_target_names_follow_format() {
        let date = day(2020, 7, 1);
        let target = CompositeTarget::in_directory(date, Path::new("out"));
        assert_eq!(target.composite.path(), Path::new("out/composite_2020-07-01.bsq"));
        assert_eq!(target.flags.unwrap().format(), &RasterFormat::Envi);

        #[cfg(feature = "gdal")]
        {
            let format = RasterFormat::Gdal { driver: "GTiff".to_string() };
            let target = CompositeTarget::in_directory_as(date, Path::new("out"), &format);
            assert_eq!(target.composite.path(), Path::new("out/composite_2020-07-01.tif"));
            assert_eq!(target.composite.format(), &format);
        }
    }
}
