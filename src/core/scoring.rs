//! Per-pixel observation scoring for best-observation compositing
//!
//! Each [`ScoringFunction`] maps one quality indicator of an observation to
//! `[0, 1]`; a [`ScoringConfig`] combines them into a weighted ensemble. The
//! anchors below are empirically tuned defaults, all overridable from JSON.

use crate::core::compositing::Observation;
use crate::types::{WeaveError, WeaveResult};
use chrono::{Datelike, NaiveDate};
use ndarray::{Array2, ArrayView2, Zip};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maps a raw indicator value to a score in `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScoreTransform {
    /// `min` scores 0, `max` scores 1, clamped outside; `min > max` inverts
    Linear { min: f64, max: f64 },
    /// Gaussian centred on `(min + max) / 2` with sigma `(max - min) / 4`
    Rbf { min: f64, max: f64 },
}

impl ScoreTransform {
    pub fn apply(&self, value: f64) -> f64 {
        if value.is_nan() {
            return f64::NAN;
        }
        match *self {
            ScoreTransform::Linear { min, max } => {
                if max == min {
                    return if value >= min { 1.0 } else { 0.0 };
                }
                ((value - min) / (max - min)).clamp(0.0, 1.0)
            }
            ScoreTransform::Rbf { min, max } => {
                let center = (min + max) / 2.0;
                let sigma = ((max - min) / 4.0).abs();
                if sigma == 0.0 {
                    return if value == center { 1.0 } else { 0.0 };
                }
                let z = (value - center) / sigma;
                (-0.5 * z * z).exp()
            }
        }
    }
}

fn doy_transform() -> ScoreTransform {
    ScoreTransform::Rbf { min: -45.0, max: 45.0 }
}

fn hot_transform() -> ScoreTransform {
    ScoreTransform::Linear { min: 0.1, max: -0.1 }
}

fn ndvi_transform() -> ScoreTransform {
    ScoreTransform::Linear { min: 0.0, max: 1.0 }
}

fn thermal_transform() -> ScoreTransform {
    ScoreTransform::Linear { min: 2600.0, max: 3100.0 }
}

fn aot_transform() -> ScoreTransform {
    ScoreTransform::Linear { min: 1000.0, max: 0.0 }
}

fn cloud_transform() -> ScoreTransform {
    ScoreTransform::Linear { min: 100.0, max: 0.0 }
}

fn illumination_transform() -> ScoreTransform {
    ScoreTransform::Linear { min: 0.0, max: 1.0 }
}

fn default_penalized_sensor() -> String {
    "LE7".to_string()
}

/// ETM+ scan line corrector failure
fn default_penalty_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2003, 5, 31).unwrap_or_default()
}

fn default_penalty() -> f64 {
    0.3
}

fn blue() -> String {
    "blue".to_string()
}

fn red() -> String {
    "red".to_string()
}

fn nir() -> String {
    "nir".to_string()
}

fn tir() -> String {
    "tir".to_string()
}

fn aot() -> String {
    "aot".to_string()
}

/// One scoring term. Band-based terms name the observation bands they read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "snake_case")]
pub enum ScoringFunction {
    /// Circular day-of-year distance to the target
    TargetDoy {
        #[serde(default = "doy_transform")]
        transform: ScoreTransform,
    },
    /// Year distance to the target; the most distant candidate scores 0
    TargetYear,
    /// `penalty` for `sensor` acquisitions after `after`, 1 otherwise
    SensorPenalty {
        #[serde(default = "default_penalized_sensor")]
        sensor: String,
        #[serde(default = "default_penalty_date")]
        after: NaiveDate,
        #[serde(default = "default_penalty")]
        penalty: f64,
    },
    /// Haze optimized transform, `blue - 0.5 * red` in reflectance
    Hot {
        #[serde(default = "hot_transform")]
        transform: ScoreTransform,
        #[serde(default = "blue")]
        blue: String,
        #[serde(default = "red")]
        red: String,
    },
    Ndvi {
        #[serde(default = "ndvi_transform")]
        transform: ScoreTransform,
        #[serde(default = "red")]
        red: String,
        #[serde(default = "nir")]
        nir: String,
    },
    /// Brightness temperature as stored (Kelvin x 10)
    Thermal {
        #[serde(default = "thermal_transform")]
        transform: ScoreTransform,
        #[serde(default = "tir")]
        band: String,
    },
    /// Aerosol optical thickness as stored
    Aot {
        #[serde(default = "aot_transform")]
        transform: ScoreTransform,
        #[serde(default = "aot")]
        band: String,
    },
    /// Scene cloud cover in percent
    CloudFraction {
        #[serde(default = "cloud_transform")]
        transform: ScoreTransform,
    },
    /// Cosine of the solar zenith angle
    Illumination {
        #[serde(default = "illumination_transform")]
        transform: ScoreTransform,
    },
}

impl ScoringFunction {
    pub fn target_doy() -> Self {
        ScoringFunction::TargetDoy { transform: doy_transform() }
    }

    pub fn sensor_penalty() -> Self {
        ScoringFunction::SensorPenalty {
            sensor: default_penalized_sensor(),
            after: default_penalty_date(),
            penalty: default_penalty(),
        }
    }

    pub fn hot() -> Self {
        ScoringFunction::Hot { transform: hot_transform(), blue: blue(), red: red() }
    }

    pub fn ndvi() -> Self {
        ScoringFunction::Ndvi { transform: ndvi_transform(), red: red(), nir: nir() }
    }

    pub fn thermal() -> Self {
        ScoringFunction::Thermal { transform: thermal_transform(), band: tir() }
    }

    pub fn aot() -> Self {
        ScoringFunction::Aot { transform: aot_transform(), band: aot() }
    }

    pub fn cloud_fraction() -> Self {
        ScoringFunction::CloudFraction { transform: cloud_transform() }
    }

    pub fn illumination() -> Self {
        ScoringFunction::Illumination { transform: illumination_transform() }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScoringFunction::TargetDoy { .. } => "target_doy",
            ScoringFunction::TargetYear => "target_year",
            ScoringFunction::SensorPenalty { .. } => "sensor_penalty",
            ScoringFunction::Hot { .. } => "hot",
            ScoringFunction::Ndvi { .. } => "ndvi",
            ScoringFunction::Thermal { .. } => "thermal",
            ScoringFunction::Aot { .. } => "aot",
            ScoringFunction::CloudFraction { .. } => "cloud_fraction",
            ScoringFunction::Illumination { .. } => "illumination",
        }
    }

    /// Observation bands this term reads
    pub fn required_bands(&self) -> Vec<&str> {
        match self {
            ScoringFunction::Hot { blue, red, .. } => vec![blue.as_str(), red.as_str()],
            ScoringFunction::Ndvi { red, nir, .. } => vec![red.as_str(), nir.as_str()],
            ScoringFunction::Thermal { band, .. } | ScoringFunction::Aot { band, .. } => vec![band.as_str()],
            _ => Vec::new(),
        }
    }

    /// Scores in `[0, 1]`, NaN where the indicator is undefined
    pub fn evaluate(&self, context: &ScoringContext<'_>) -> WeaveResult<Array2<f64>> {
        let observation = context.observation;
        let scene = |value: f64| -> WeaveResult<Array2<f64>> { Ok(Array2::from_elem(context.shape, value)) };
        match self {
            ScoringFunction::TargetDoy { transform } => {
                scene(transform.apply(doy_distance(observation.date, context.target) as f64))
            }
            ScoringFunction::TargetYear => {
                let distance = (observation.date.year() - context.target.year()).abs();
                let score = if context.max_year_distance == 0 {
                    1.0
                } else {
                    ScoreTransform::Linear { min: context.max_year_distance as f64, max: 0.0 }.apply(distance as f64)
                };
                scene(score)
            }
            ScoringFunction::SensorPenalty { sensor, after, penalty } => {
                if observation.sensor.eq_ignore_ascii_case(sensor) && observation.date > *after {
                    scene(*penalty)
                } else {
                    scene(1.0)
                }
            }
            ScoringFunction::Hot { transform, blue, red } => {
                let scale = context.reflectance_scale;
                context.combine(blue, red, |b, r| transform.apply(b * scale - 0.5 * r * scale))
            }
            ScoringFunction::Ndvi { transform, red, nir } => context.combine(red, nir, |r, n| {
                let sum = n + r;
                if sum == 0.0 {
                    f64::NAN
                } else {
                    transform.apply((n - r) / sum)
                }
            }),
            ScoringFunction::Thermal { transform, band } | ScoringFunction::Aot { transform, band } => {
                Ok(context.band(band)?.mapv(|v| transform.apply(v)))
            }
            ScoringFunction::CloudFraction { transform } => {
                let cover = scene_attribute(observation, "cloud_cover", observation.cloud_cover)?;
                scene(transform.apply(cover))
            }
            ScoringFunction::Illumination { transform } => {
                let elevation = scene_attribute(observation, "sun_elevation", observation.sun_elevation)?;
                scene(transform.apply(elevation.to_radians().sin()))
            }
        }
    }

    /// Fails when `observation` lacks a scene attribute this term scores
    pub fn check_observation(&self, observation: &Observation) -> WeaveResult<()> {
        match self {
            ScoringFunction::CloudFraction { .. } => {
                scene_attribute(observation, "cloud_cover", observation.cloud_cover).map(|_| ())
            }
            ScoringFunction::Illumination { .. } => {
                scene_attribute(observation, "sun_elevation", observation.sun_elevation).map(|_| ())
            }
            _ => Ok(()),
        }
    }
}

fn scene_attribute(observation: &Observation, key: &str, value: Option<f64>) -> WeaveResult<f64> {
    value.ok_or_else(|| {
        WeaveError::Metadata(format!(
            "observation '{}' has no '{}' required for scoring",
            observation.id, key
        ))
    })
}

/// Smallest day-of-year distance between two dates, wrapping at the year boundary
pub fn doy_distance(date: NaiveDate, target: NaiveDate) -> i32 {
    let d = date.ordinal() as i32 - target.ordinal() as i32;
    d.abs().min((d + 365).abs()).min((d - 365).abs())
}

/// What a scoring term sees of one observation within one tile
pub struct ScoringContext<'a> {
    pub observation: &'a Observation,
    pub target: NaiveDate,
    /// Largest year distance among the candidate observations
    pub max_year_distance: i32,
    pub reflectance_scale: f64,
    /// (height, width) of the tile
    pub shape: (usize, usize),
    pub bands: BTreeMap<&'a str, ArrayView2<'a, f64>>,
}

impl<'a> ScoringContext<'a> {
    fn band(&self, name: &str) -> WeaveResult<&ArrayView2<'a, f64>> {
        self.bands.get(name).ok_or_else(|| {
            WeaveError::Metadata(format!(
                "observation '{}' has no band '{}' required for scoring",
                self.observation.id, name
            ))
        })
    }

    fn combine(&self, a: &str, b: &str, f: impl Fn(f64, f64) -> f64) -> WeaveResult<Array2<f64>> {
        let mut out = Array2::zeros(self.shape);
        Zip::from(&mut out)
            .and(self.band(a)?)
            .and(self.band(b)?)
            .for_each(|o, &x, &y| *o = f(x, y));
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedScore {
    #[serde(flatten)]
    pub function: ScoringFunction,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

/// Weighted ensemble of scoring terms
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub terms: Vec<WeightedScore>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            terms: vec![
                WeightedScore { function: ScoringFunction::target_doy(), weight: 1.0 },
                WeightedScore { function: ScoringFunction::TargetYear, weight: 1.0 },
                WeightedScore { function: ScoringFunction::sensor_penalty(), weight: 1.0 },
            ],
        }
    }
}

impl ScoringConfig {
    /// Single-term ensemble
    pub fn single(function: ScoringFunction) -> Self {
        Self {
            terms: vec![WeightedScore { function, weight: 1.0 }],
        }
    }

    pub fn validate(&self) -> WeaveResult<()> {
        self.normalized_weights().map(|_| ())
    }

    /// Weights scaled to sum to 1
    pub fn normalized_weights(&self) -> WeaveResult<Vec<f64>> {
        if let Some(bad) = self.terms.iter().find(|t| !t.weight.is_finite() || t.weight < 0.0) {
            return Err(WeaveError::Configuration(format!(
                "scoring term '{}' has invalid weight {}",
                bad.function.name(),
                bad.weight
            )));
        }
        let total: f64 = self.terms.iter().map(|t| t.weight).sum();
        if total <= 0.0 {
            return Err(WeaveError::Configuration(
                "scoring weights must sum to a positive value".to_string(),
            ));
        }
        Ok(self.terms.iter().map(|t| t.weight / total).collect())
    }

    /// Distinct observation bands any term reads
    pub fn required_bands(&self) -> Vec<String> {
        let mut bands: Vec<String> = Vec::new();
        for band in self.terms.iter().flat_map(|t| t.function.required_bands()) {
            if !bands.iter().any(|b| b == band) {
                bands.push(band.to_string());
            }
        }
        bands
    }

    /// Every term's scene attributes are present on `observation`
    pub fn check_observation(&self, observation: &Observation) -> WeaveResult<()> {
        self.terms
            .iter()
            .try_for_each(|t| t.function.check_observation(observation))
    }

    /// Weighted ensemble score; terms undefined at a pixel contribute 0
    pub fn score(&self, context: &ScoringContext<'_>) -> WeaveResult<Array2<f64>> {
        let weights = self.normalized_weights()?;
        let mut total = Array2::zeros(context.shape);
        for (term, weight) in self.terms.iter().zip(weights) {
            let scores = term.function.evaluate(context)?;
            Zip::from(&mut total).and(&scores).for_each(|t, &s| {
                if !s.is_nan() {
                    *t += weight * s;
                }
            });
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn observation(date: NaiveDate, sensor: &str) -> Observation {
        Observation {
            id: "test".to_string(),
            date,
            sensor: sensor.to_string(),
            path: 193,
            row: 23,
            bands: Vec::new(),
            cloud_cover: Some(20.0),
            sun_elevation: Some(30.0),
        }
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn context<'a>(obs: &'a Observation, target: NaiveDate) -> ScoringContext<'a> {
        ScoringContext {
            observation: obs,
            target,
            max_year_distance: 0,
            reflectance_scale: 0.0001,
            shape: (1, 2),
            bands: BTreeMap::new(),
        }
    }

    #[test]
    fn test_linear_transform_inverts_and_clamps() {
        let t = ScoreTransform::Linear { min: 100.0, max: 0.0 };
        assert_abs_diff_eq!(t.apply(100.0), 0.0);
        assert_abs_diff_eq!(t.apply(25.0), 0.75);
        assert_abs_diff_eq!(t.apply(-10.0), 1.0);
        assert!(t.apply(f64::NAN).is_nan());
    }

    #[test]
    fn test_rbf_transform() {
        let t = doy_transform();
        assert_abs_diff_eq!(t.apply(0.0), 1.0);
        assert_abs_diff_eq!(t.apply(22.5), (-0.5f64).exp(), epsilon = 1e-12);
        assert!(t.apply(17.0) > t.apply(33.0));
    }

    #[test]
    fn test_doy_distance_wraps() {
        assert_eq!(doy_distance(day(2020, 1, 3), day(2020, 12, 30)), 3);
        assert_eq!(doy_distance(day(2021, 1, 3), day(2021, 12, 30)), 4);
        assert_eq!(doy_distance(day(2021, 12, 30), day(2021, 1, 3)), 4);
        assert_eq!(doy_distance(day(2020, 7, 18), day(2020, 7, 1)), 17);
    }

    #[test]
    fn test_sensor_penalty_after_slc_off() {
        let penalty = ScoringFunction::sensor_penalty();
        let before = observation(day(2002, 7, 1), "LE7");
        let after = observation(day(2010, 7, 1), "LE7");
        let other = observation(day(2010, 7, 1), "LT5");
        let target = day(2010, 7, 1);
        assert_eq!(penalty.evaluate(&context(&before, target)).unwrap()[[0, 0]], 1.0);
        assert_abs_diff_eq!(penalty.evaluate(&context(&after, target)).unwrap()[[0, 1]], 0.3);
        assert_eq!(penalty.evaluate(&context(&other, target)).unwrap()[[0, 0]], 1.0);
    }

    #[test]
    fn test_year_distance_relative_to_worst() {
        let obs = observation(day(2018, 7, 1), "LC8");
        let mut ctx = context(&obs, day(2020, 7, 1));
        ctx.max_year_distance = 4;
        let score = ScoringFunction::TargetYear.evaluate(&ctx).unwrap();
        assert_abs_diff_eq!(score[[0, 0]], 0.5);
    }

    #[test]
    fn test_ndvi_reads_bands() {
        let obs = observation(day(2020, 7, 1), "LC8");
        let red = ndarray::arr2(&[[1000.0, 0.0]]);
        let nir = ndarray::arr2(&[[3000.0, 0.0]]);
        let mut ctx = context(&obs, day(2020, 7, 1));
        ctx.bands.insert("red", red.view());
        ctx.bands.insert("nir", nir.view());
        let score = ScoringFunction::ndvi().evaluate(&ctx).unwrap();
        assert_abs_diff_eq!(score[[0, 0]], 0.5);
        assert!(score[[0, 1]].is_nan());

        let missing = ScoringFunction::thermal().evaluate(&ctx);
        assert!(matches!(missing, Err(WeaveError::Metadata(_))));
    }

    #[test]
    fn test_weights_are_normalized() {
        let config = ScoringConfig {
            terms: vec![
                WeightedScore { function: ScoringFunction::target_doy(), weight: 3.0 },
                WeightedScore { function: ScoringFunction::cloud_fraction(), weight: 1.0 },
            ],
        };
        let obs = observation(day(2020, 7, 1), "LC8");
        let score = config.score(&context(&obs, day(2020, 7, 1))).unwrap();
        assert_abs_diff_eq!(score[[0, 0]], 0.75 + 0.25 * 0.8, epsilon = 1e-12);

        let zero = ScoringConfig {
            terms: vec![WeightedScore { function: ScoringFunction::TargetYear, weight: 0.0 }],
        };
        assert!(matches!(zero.validate(), Err(WeaveError::Configuration(_))));
    }

    #[test]
    fn test_missing_scene_attribute_is_an_error() {
        let mut obs = observation(day(2020, 7, 1), "LC8");
        obs.cloud_cover = None;
        let config = ScoringConfig {
            terms: vec![
                WeightedScore { function: ScoringFunction::target_doy(), weight: 1.0 },
                WeightedScore { function: ScoringFunction::cloud_fraction(), weight: 1.0 },
            ],
        };
        assert!(matches!(config.check_observation(&obs), Err(WeaveError::Metadata(m)) if m.contains("cloud_cover")));
        assert!(matches!(
            config.score(&context(&obs, day(2020, 7, 1))),
            Err(WeaveError::Metadata(_))
        ));

        obs.sun_elevation = None;
        let illumination = ScoringConfig::single(ScoringFunction::illumination());
        assert!(matches!(illumination.check_observation(&obs), Err(WeaveError::Metadata(m)) if m.contains("sun_elevation")));
        assert!(ScoringConfig::default().check_observation(&obs).is_ok());
    }

    #[test]
    fn test_undefined_pixel_scores_zero() {
        let obs = observation(day(2020, 7, 1), "LC8");
        let red = ndarray::arr2(&[[0.0, 1000.0]]);
        let nir = ndarray::arr2(&[[0.0, 3000.0]]);
        let mut ctx = context(&obs, day(2020, 7, 1));
        ctx.bands.insert("red", red.view());
        ctx.bands.insert("nir", nir.view());
        let config = ScoringConfig {
            terms: vec![
                WeightedScore { function: ScoringFunction::target_doy(), weight: 1.0 },
                WeightedScore { function: ScoringFunction::ndvi(), weight: 1.0 },
            ],
        };
        let score = config.score(&ctx).unwrap();
        assert_abs_diff_eq!(score[[0, 0]], 0.5);
        assert_abs_diff_eq!(score[[0, 1]], 0.75);
    }

    #[test]
    fn test_config_from_json_uses_defaults() {
        let json = r#"{"terms": [
            {"id": "target_doy", "weight": 2.0},
            {"id": "target_year"},
            {"id": "ndvi", "nir": "b5", "transform": {"kind": "linear", "min": 0.2, "max": 0.9}}
        ]}"#;
        let config: ScoringConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.terms.len(), 3);
        assert_eq!(config.terms[0].function, ScoringFunction::target_doy());
        assert_eq!(config.terms[1].weight, 1.0);
        assert_eq!(config.required_bands(), vec!["red", "b5"]);
    }
}
