use approx::assert_abs_diff_eq;
use chrono::NaiveDate;
use ndarray::{Array2, Array3, Axis};
use rasterweave::core::compositing::sensor_code;
use rasterweave::core::scoring::doy_distance;
use rasterweave::core::{
    ApplierOptions, CompositeState, CompositeTarget, CompositingConfig, CompositingEngine, Observation,
    ScoreTransform, ScoringConfig, ScoringFunction, WeightedScore, DEFAULT_NO_DATA,
};
use rasterweave::io::{RasterDataset, DEFAULT_DOMAIN};
use rasterweave::{DataType, GeoTransform, PixelGrid, RasterHandle, RasterMetadata, TileWindow, WeaveError};
use std::path::Path;
use tempfile::TempDir;

const WIDTH: usize = 6;
const HEIGHT: usize = 5;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn grid() -> PixelGrid {
    PixelGrid::new(
        WIDTH,
        HEIGHT,
        GeoTransform::north_up(600000.0, 5300000.0, 30.0, 30.0),
        Some("EPSG:32633".to_string()),
    )
}

fn write_band(path: &Path, values: &Array2<f64>, no_data: Option<f64>) -> RasterHandle {
    let handle = RasterHandle::envi(path);
    let mut dataset = handle.create(&grid(), 1, DataType::Int16).unwrap();
    dataset
        .write_block(&TileWindow::full(WIDTH, HEIGHT), values.view().insert_axis(Axis(0)))
        .unwrap();
    dataset.flush().unwrap();
    if no_data.is_some() {
        let mut meta = RasterMetadata::read(&handle).unwrap();
        meta.set_no_data_value(no_data);
        meta.write(&handle).unwrap();
    }
    handle
}

fn doy_2020(doy: u32) -> NaiveDate {
    NaiveDate::from_yo_opt(2020, doy).unwrap()
}

fn observation(dir: &Path, id: &str, date: NaiveDate, value: f64) -> Observation {
    let band = write_band(&dir.join(format!("{}_value.bsq", id)), &Array2::from_elem((HEIGHT, WIDTH), value), None);
    Observation {
        id: id.to_string(),
        date,
        sensor: "LC8".to_string(),
        path: 193,
        row: 23,
        bands: vec![("value".to_string(), band)],
        cloud_cover: None,
        sun_elevation: None,
    }
}

fn doy_config(buffer_days: i64) -> CompositingConfig {
    CompositingConfig {
        bands: vec!["value".to_string()],
        buffer_days,
        buffer_years: 0,
        scoring: ScoringConfig::single(ScoringFunction::target_doy()),
        ..Default::default()
    }
}

fn read_all(handle: &RasterHandle) -> Array3<f64> {
    let mut dataset = handle.open().unwrap();
    dataset.read_block(&TileWindow::full(WIDTH, HEIGHT)).unwrap()
}

fn small_tiles() -> ApplierOptions {
    ApplierOptions {
        tile_width: 4,
        tile_height: 2,
        ..Default::default()
    }
}

#[test]
fn test_end_to_end_doy_scenario() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let archive = vec![
        observation(dir.path(), "doy100", doy_2020(100), 10.0),
        observation(dir.path(), "doy150", doy_2020(150), 20.0),
        observation(dir.path(), "doy200", doy_2020(200), 30.0),
    ];
    let target = CompositeTarget::in_directory(NaiveDate::from_ymd_opt(2020, 7, 1).unwrap(), &dir.path().join("out"));
    let engine = CompositingEngine::new(doy_config(40), small_tiles()).unwrap();

    let report = engine.composite(&archive, &target).unwrap();
    assert_eq!(report.candidates, vec!["doy150", "doy200"]);
    assert_eq!(
        report.states,
        vec![
            CompositeState::CollectingObservations,
            CompositeState::Scoring,
            CompositeState::Selecting,
            CompositeState::Assembling,
            CompositeState::Done,
        ]
    );

    let composite = read_all(&target.composite);
    assert_eq!(composite.dim(), (1, HEIGHT, WIDTH));
    assert!(composite.iter().all(|&v| v == 30.0));

    let flags = read_all(target.flags.as_ref().unwrap());
    let expected_score = ScoreTransform::Rbf { min: -45.0, max: 45.0 }.apply(17.0);
    assert_eq!(flags[[0, 0, 0]], 200.0);
    assert_eq!(flags[[1, 2, 3]], sensor_code("LC8") as f64);
    assert_eq!(flags[[2, 4, 5]], 193.0);
    assert_eq!(flags[[3, 4, 5]], 23.0);
    assert_eq!(flags[[4, 1, 1]], (expected_score * 10000.0).round());

    let meta = RasterMetadata::read(&target.composite).unwrap();
    assert_eq!(meta.band_names(), vec!["value"]);
    assert_eq!(meta.no_data_value(), Some(DEFAULT_NO_DATA));
    assert_eq!(meta.get_text("composite_date", DEFAULT_DOMAIN).as_deref(), Some("2020-07-01"));
    let flag_meta = RasterMetadata::read(target.flags.as_ref().unwrap()).unwrap();
    assert_eq!(flag_meta.band_names(), vec!["doy", "sensor", "path", "row", "score"]);
}

#[test]
fn test_closer_observation_scores_higher() {
    let target = NaiveDate::from_ymd_opt(2020, 7, 1).unwrap();
    let rbf = ScoreTransform::Rbf { min: -45.0, max: 45.0 };
    let near = doy_distance(doy_2020(200), target);
    let far = doy_distance(doy_2020(150), target);
    assert_eq!((near, far), (17, 33));
    assert!(rbf.apply(near as f64) > rbf.apply(far as f64));
}

#[test]
fn test_invalid_pixels_are_never_selected() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let target_date = NaiveDate::from_ymd_opt(2020, 7, 1).unwrap();

    // Closest acquisition, but cloudy in the top row and fill at (4, 5)
    let mut near_values = Array2::from_elem((HEIGHT, WIDTH), 30.0);
    near_values[[4, 5]] = -9999.0;
    let near_value = write_band(&dir.path().join("near_value.bsq"), &near_values, Some(-9999.0));
    let mut near_qa = Array2::zeros((HEIGHT, WIDTH));
    near_qa.row_mut(0).fill(4.0);
    let near_qa = write_band(&dir.path().join("near_qa.bsq"), &near_qa, None);

    // Farther acquisition, valid except at (0, 0)
    let far_value = write_band(&dir.path().join("far_value.bsq"), &Array2::from_elem((HEIGHT, WIDTH), 20.0), None);
    let mut far_qa = Array2::zeros((HEIGHT, WIDTH));
    far_qa[[0, 0]] = 2.0;
    let far_qa = write_band(&dir.path().join("far_qa.bsq"), &far_qa, None);

    let mut near = Observation::from_scene_id(
        "LC81930232020185LGN00",
        vec![("value".to_string(), near_value), ("qa".to_string(), near_qa)],
    )
    .unwrap();
    near.cloud_cover = Some(10.0);
    let far = Observation::from_scene_id(
        "LE71930232020160NSG00",
        vec![("value".to_string(), far_value), ("qa".to_string(), far_qa)],
    )
    .unwrap();

    let config = CompositingConfig {
        mask_band: Some("qa".to_string()),
        valid_mask_values: vec![0.0],
        ..doy_config(30)
    };
    let engine = CompositingEngine::new(config, small_tiles()).unwrap();
    let target = CompositeTarget::in_directory(target_date, dir.path());
    engine.composite(&[near, far], &target).unwrap();

    let composite = read_all(&target.composite);
    let flags = read_all(target.flags.as_ref().unwrap());
    // Both invalid
    assert_eq!(composite[[0, 0, 0]], DEFAULT_NO_DATA);
    assert!((0..5).all(|b| flags[[b, 0, 0]] == DEFAULT_NO_DATA));
    // Near is cloudy: far wins
    assert_eq!(composite[[0, 0, 3]], 20.0);
    assert_eq!(flags[[1, 0, 3]], 7.0);
    // Near is fill: far wins
    assert_eq!(composite[[0, 4, 5]], 20.0);
    // Near is valid and closest
    assert_eq!(composite[[0, 2, 2]], 30.0);
    assert_eq!(flags[[0, 2, 2]], 185.0);
}

#[test]
fn test_empty_window_gives_no_data_composite() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let archive = vec![
        observation(dir.path(), "spring", doy_2020(100), 10.0),
        observation(dir.path(), "summer", doy_2020(180), 20.0),
    ];
    let target = CompositeTarget::in_directory(NaiveDate::from_ymd_opt(2020, 12, 20).unwrap(), &dir.path().join("out"));
    let engine = CompositingEngine::new(doy_config(10), small_tiles()).unwrap();

    let report = engine.composite(&archive, &target).unwrap();
    assert!(report.candidates.is_empty());
    assert_eq!(
        report.states,
        vec![CompositeState::CollectingObservations, CompositeState::Assembling, CompositeState::Done]
    );
    assert_eq!(report.run.tiles_total, 6);

    let composite = read_all(&target.composite);
    assert_eq!(composite.dim(), (1, HEIGHT, WIDTH));
    assert!(composite.iter().all(|&v| v == DEFAULT_NO_DATA));
    let flags = read_all(target.flags.as_ref().unwrap());
    assert_eq!(flags.dim(), (5, HEIGHT, WIDTH));
    assert!(flags.iter().all(|&v| v == DEFAULT_NO_DATA));
}

#[test]
fn test_missing_cloud_cover_fails_composite() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let mut clear = observation(dir.path(), "clear", doy_2020(180), 10.0);
    clear.cloud_cover = Some(5.0);
    let archive = vec![clear, observation(dir.path(), "unknown_cover", doy_2020(185), 20.0)];
    let config = CompositingConfig {
        scoring: ScoringConfig {
            terms: vec![
                WeightedScore { function: ScoringFunction::target_doy(), weight: 1.0 },
                WeightedScore { function: ScoringFunction::cloud_fraction(), weight: 1.0 },
            ],
        },
        ..doy_config(40)
    };
    let target = CompositeTarget::in_directory(NaiveDate::from_ymd_opt(2020, 7, 1).unwrap(), &dir.path().join("out"));
    let engine = CompositingEngine::new(config, small_tiles()).unwrap();

    match engine.composite(&archive, &target) {
        Err(WeaveError::Metadata(message)) => {
            assert!(message.contains("unknown_cover"));
            assert!(message.contains("cloud_cover"));
        }
        other => panic!("expected a metadata error, got {:?}", other.map(|r| r.candidates)),
    }
    assert!(!target.composite.path().exists());
}

#[test]
fn test_empty_archive_has_no_grid() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let target = CompositeTarget::in_directory(NaiveDate::from_ymd_opt(2020, 7, 1).unwrap(), dir.path());
    let engine = CompositingEngine::new(doy_config(40), small_tiles()).unwrap();
    assert!(matches!(engine.composite(&[], &target), Err(WeaveError::Configuration(_))));
}

#[test]
fn test_composite_all_runs_each_target() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let archive = vec![
        observation(dir.path(), "spring", doy_2020(100), 10.0),
        observation(dir.path(), "summer", doy_2020(180), 20.0),
    ];
    let targets = vec![
        CompositeTarget::in_directory(doy_2020(105), &dir.path().join("out")),
        CompositeTarget::in_directory(doy_2020(175), &dir.path().join("out")),
    ];
    let engine = CompositingEngine::new(doy_config(20), ApplierOptions::default()).unwrap();
    let reports = engine.composite_all(&archive, &targets).unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(read_all(&targets[0].composite)[[0, 0, 0]], 10.0);
    assert_eq!(read_all(&targets[1].composite)[[0, 0, 0]], 20.0);
}

#[test]
fn test_temporal_statistics() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let archive = vec![
        observation(dir.path(), "a", doy_2020(170), 10.0),
        observation(dir.path(), "b", doy_2020(180), 40.0),
        observation(dir.path(), "c", doy_2020(190), 20.0),
        observation(dir.path(), "out_of_window", doy_2020(300), 1000.0),
    ];
    let engine = CompositingEngine::new(doy_config(30), small_tiles()).unwrap();
    let output = RasterHandle::envi(dir.path().join("stats.bsq"));
    let report = engine
        .statistics(&archive, doy_2020(180), &[0.0, 50.0, 75.0], &output)
        .unwrap();
    assert_eq!(report.candidates, vec!["a", "b", "c"]);

    let stats = read_all(&output);
    assert_eq!(stats.dim(), (5, HEIGHT, WIDTH));
    assert_abs_diff_eq!(stats[[0, 0, 0]], 10.0);
    assert_abs_diff_eq!(stats[[1, 0, 0]], 20.0);
    assert_abs_diff_eq!(stats[[2, 3, 3]], 30.0);
    assert_abs_diff_eq!(stats[[3, 4, 5]], 70.0 / 3.0, epsilon = 1e-4);
    assert_abs_diff_eq!(stats[[4, 4, 5]], (1400.0f64 / 9.0).sqrt(), epsilon = 1e-3);

    let meta = RasterMetadata::read(&output).unwrap();
    assert_eq!(meta.band_names(), vec!["value_p0", "value_p50", "value_p75", "value_mean", "value_std"]);

    let empty = RasterHandle::envi(dir.path().join("empty_stats.bsq"));
    engine.statistics(&archive, doy_2020(60), &[50.0], &empty).unwrap();
    assert!(read_all(&empty).iter().all(|&v| v == DEFAULT_NO_DATA));
}

#[test]
fn test_observation_from_metadata() {
    let dir = TempDir::new().unwrap();
    let band = write_band(&dir.path().join("scene_red.bsq"), &Array2::zeros((HEIGHT, WIDTH)), None);
    let mut meta = RasterMetadata::read(&band).unwrap();
    meta.insert("acquisition_date", "2019-08-14", DEFAULT_DOMAIN);
    meta.insert("sensor", "LC8", DEFAULT_DOMAIN);
    meta.insert("path", 193i64, DEFAULT_DOMAIN);
    meta.insert("row", 23i64, DEFAULT_DOMAIN);
    meta.insert("cloud_cover", 3.5, DEFAULT_DOMAIN);
    meta.write(&band).unwrap();

    let observation = Observation::from_metadata("scene", vec![("red".to_string(), band.clone())]).unwrap();
    assert_eq!(observation.date, NaiveDate::from_ymd_opt(2019, 8, 14).unwrap());
    assert_eq!(observation.tile_id(), "193023");
    assert_eq!(observation.cloud_cover, Some(3.5));

    let mut meta = RasterMetadata::read(&band).unwrap();
    meta.insert("acquisition_date", "14/08/2019", DEFAULT_DOMAIN);
    meta.write(&band).unwrap();
    match Observation::from_metadata("scene", vec![("red".to_string(), band)]) {
        Err(WeaveError::Metadata(message)) => {
            assert!(message.contains("scene"));
            assert!(message.contains("acquisition_date"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
}
