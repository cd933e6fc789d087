//! Command line front end: best-observation composites and temporal statistics from a JSON job file

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use env_logger::{Builder, Env};
use log::{info, warn};
use rasterweave::core::{
    ApplierOptions, CompositeTarget, CompositingConfig, CompositingEngine, LogProgress, Observation, SceneId,
    TileGeometryCatalog,
};
use rasterweave::io::RasterFormat;
use rasterweave::{BoundingBox, RasterHandle};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "rasterweave")]
#[command(about = "Tiled raster compositing over Landsat-style archives")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Worker threads (overrides the job file)
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Best-observation composite for every target date
    Composite {
        #[arg(short, long)]
        job: PathBuf,
    },
    /// Per-band percentiles, mean and standard deviation for every target date
    Statistics {
        #[arg(short, long)]
        job: PathBuf,
    },
}

#[derive(Debug, Deserialize)]
struct ObservationEntry {
    /// Scene id; attributes come from band metadata when it is not a Landsat id
    id: String,
    bands: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Deserialize)]
struct Job {
    #[serde(default)]
    config: CompositingConfig,
    #[serde(default)]
    options: ApplierOptions,
    observations: Vec<ObservationEntry>,
    targets: Vec<NaiveDate>,
    output_dir: PathBuf,
    #[serde(default = "default_percentiles")]
    percentiles: Vec<f64>,
    /// Tile footprints used with `area` to drop observations outside the area of interest
    #[serde(default)]
    catalog: Option<PathBuf>,
    #[serde(default)]
    area: Option<BoundingBox>,
    /// Format of the archive rasters
    #[serde(default)]
    input_format: RasterFormat,
    /// Format of composites and statistics
    #[serde(default)]
    output_format: RasterFormat,
}

fn default_percentiles() -> Vec<f64> {
    vec![10.0, 25.0, 50.0, 75.0, 90.0]
}

impl Job {
    fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading job file {}", path.display()))?;
        let mut job: Job = serde_json::from_str(&text).with_context(|| format!("parsing job file {}", path.display()))?;
        // Relative raster paths are resolved against the job file's directory
        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
        for entry in &mut job.observations {
            for band in entry.bands.values_mut() {
                if band.is_relative() {
                    *band = base.join(&*band);
                }
            }
        }
        if job.output_dir.is_relative() {
            job.output_dir = base.join(&job.output_dir);
        }
        if let Some(catalog) = job.catalog.as_mut().filter(|c| c.is_relative()) {
            *catalog = base.join(&*catalog);
        }
        Ok(job)
    }

    fn archive(&self) -> Result<Vec<Observation>> {
        let mut archive = Vec::with_capacity(self.observations.len());
        for entry in &self.observations {
            let bands: Vec<(String, RasterHandle)> = entry
                .bands
                .iter()
                .map(|(name, path)| (name.clone(), RasterHandle::new(path, self.input_format.clone())))
                .collect();
            let observation = if SceneId::parse(&entry.id).is_ok() {
                Observation::from_scene_id(&entry.id, bands)?
            } else {
                Observation::from_metadata(&entry.id, bands)?
            };
            archive.push(observation);
        }

        match (&self.catalog, &self.area) {
            (Some(path), Some(area)) => {
                let catalog = TileGeometryCatalog::from_json_file(path)?;
                let kept: Vec<Observation> = catalog.filter_observations(&archive, area).into_iter().cloned().collect();
                info!("{} of {} observations intersect the area of interest", kept.len(), archive.len());
                Ok(kept)
            }
            (Some(_), None) | (None, Some(_)) => {
                warn!("Both 'catalog' and 'area' are needed for footprint filtering; using all observations");
                Ok(archive)
            }
            (None, None) => Ok(archive),
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut builder = Builder::from_env(Env::default().default_filter_or(args.log_level.as_str()));
    builder.format_timestamp_secs();
    builder.init();

    let job_path = match &args.command {
        Command::Composite { job } | Command::Statistics { job } => job.clone(),
    };
    let mut job = Job::load(&job_path)?;
    if let Some(workers) = args.workers {
        job.options.workers = workers;
    }
    if job.targets.is_empty() {
        return Err(anyhow!("job {} lists no target dates", job_path.display()));
    }

    let archive = job.archive()?;
    info!("Archive: {} observations, {} target date(s)", archive.len(), job.targets.len());

    let engine = CompositingEngine::new(job.config.clone(), job.options.clone())?
        .with_progress(Arc::new(LogProgress::default()));

    match args.command {
        Command::Composite { .. } => {
            let targets: Vec<CompositeTarget> = job
                .targets
                .iter()
                .map(|date| CompositeTarget::in_directory_as(*date, &job.output_dir, &job.output_format))
                .collect();
            for report in engine.composite_all(&archive, &targets)? {
                info!(
                    "{}: {} candidate(s), {} tiles in {:?}",
                    report.date,
                    report.candidates.len(),
                    report.run.tiles_processed,
                    report.run.elapsed
                );
            }
        }
        Command::Statistics { .. } => {
            for date in &job.targets {
                let output = RasterHandle::new(
                    job.output_dir.join(format!("statistics_{}.{}", date, job.output_format.extension())),
                    job.output_format.clone(),
                );
                let report = engine.statistics(&archive, *date, &job.percentiles, &output)?;
                info!(
                    "{}: statistics over {} candidate(s) written to {}",
                    date,
                    report.candidates.len(),
                    output.path().display()
                );
            }
        }
    }

    Ok(())
}
