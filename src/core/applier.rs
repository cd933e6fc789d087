//! Block-wise raster-to-raster processing over many files
//!
//! An [`Applier`] owns named input and output declarations. A run reads every
//! declared input, tiles the reference grid, hands each tile's blocks to a
//! user function, writes the blocks it produces to new rasters and finally
//! lets a metadata function finalize the output headers once all tiles are on
//! disk.

use crate::core::blocks::{BlockAssociations, PixelBlock};
use crate::core::tiling::{TileScheduler, TileWindow, DEFAULT_TILE_SIZE};
use crate::io::metadata::RasterMetadata;
use crate::io::raster::RasterHandle;
use crate::types::{DataType, PixelGrid, WeaveError, WeaveResult};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// What a declared key refers to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RasterSource {
    /// One raster; block key is the declared key
    Single(RasterHandle),
    /// Named rasters; block keys are `key/name`
    Group(Vec<(String, RasterHandle)>),
    /// A list of named groups; block keys are `key/index/name`
    GroupList(Vec<Vec<(String, RasterHandle)>>),
}

impl RasterSource {
    /// (block key, handle) for every constituent raster, in declaration order
    pub fn members(&self, key: &str) -> Vec<(String, RasterHandle)> {
        match self {
            RasterSource::Single(handle) => vec![(key.to_string(), handle.clone())],
            RasterSource::Group(named) => named
                .iter()
                .map(|(name, handle)| (format!("{}/{}", key, name), handle.clone()))
                .collect(),
            RasterSource::GroupList(groups) => groups
                .iter()
                .enumerate()
                .flat_map(|(index, named)| {
                    named
                        .iter()
                        .map(move |(name, handle)| (format!("{}/{}/{}", key, index, name), handle.clone()))
                })
                .collect(),
        }
    }
}

impl From<RasterHandle> for RasterSource {
    fn from(handle: RasterHandle) -> Self {
        RasterSource::Single(handle)
    }
}

/// Runtime options of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplierOptions {
    pub tile_width: usize,
    pub tile_height: usize,
    /// Worker threads; 1 processes tiles sequentially in row-major order
    pub workers: usize,
    /// Record failing tiles and keep going instead of failing the run
    pub continue_on_error: bool,
}

impl Default for ApplierOptions {
    fn default() -> Self {
        Self {
            tile_width: DEFAULT_TILE_SIZE,
            tile_height: DEFAULT_TILE_SIZE,
            workers: 1,
            continue_on_error: false,
        }
    }
}

/// Progress reporting sink
pub trait ProgressSink: Send + Sync {
    fn set_text(&self, text: &str);
    fn set_percentage(&self, percentage: f64);
}

/// Discards all progress
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn set_text(&self, _text: &str) {}
    fn set_percentage(&self, _percentage: f64) {}
}

/// Reports progress through the `log` facade in 10% steps
#[derive(Debug, Default)]
pub struct LogProgress {
    last_decile: AtomicUsize,
}

impl ProgressSink for LogProgress {
    fn set_text(&self, text: &str) {
        self.last_decile.store(0, Ordering::Relaxed);
        log::info!("{}", text);
    }

    fn set_percentage(&self, percentage: f64) {
        let decile = (percentage / 10.0).floor().clamp(0.0, 10.0) as usize;
        if self.last_decile.fetch_max(decile, Ordering::Relaxed) < decile {
            log::info!("{:.0}%", percentage);
        }
    }
}

/// Cooperative cancellation flag, checked between tile dispatches
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Summary of a finished run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub tiles_total: usize,
    pub tiles_processed: usize,
    /// Only populated with `continue_on_error`
    pub failed_tiles: Vec<TileWindow>,
    pub outputs: Vec<PathBuf>,
    pub elapsed: Duration,
}

struct InputMember {
    key: String,
    handle: RasterHandle,
    grid: PixelGrid,
    data_type: DataType,
    metadata: Arc<RasterMetadata>,
}

struct OutputState {
    handle: RasterHandle,
    bands: usize,
    data_type: DataType,
    /// Metadata of the lowest-ordinal tile that produced this output
    seed: (usize, Arc<RasterMetadata>),
}

/// Outputs created so far, keyed by block key
struct OutputRegistry<'a> {
    grid: &'a PixelGrid,
    declared: HashMap<String, RasterHandle>,
    created: Mutex<BTreeMap<String, OutputState>>,
}

impl OutputRegistry<'_> {
    fn write(&self, tile: &TileWindow, key: &str, block: &PixelBlock, metadata: Arc<RasterMetadata>) -> WeaveResult<()> {
        let handle = self.declared.get(key).ok_or_else(|| {
            WeaveError::Configuration(format!("block '{}' does not match any declared output", key))
        })?;
        if block.shape() != (tile.height, tile.width) {
            return Err(WeaveError::DataInvariant(format!(
                "output '{}' block is {:?}, tile is {}x{}",
                key,
                block.shape(),
                tile.height,
                tile.width
            )));
        }

        {
            let mut created = self.created.lock().unwrap_or_else(|p| p.into_inner());
            match created.get_mut(key) {
                Some(state) => {
                    if state.bands != block.bands() || state.data_type != block.data_type() {
                        return Err(WeaveError::DataInvariant(format!(
                            "output '{}' was created with {} {} bands, tile produced {} {} bands",
                            key,
                            state.bands,
                            state.data_type,
                            block.bands(),
                            block.data_type()
                        )));
                    }
                    if tile.ordinal() < state.seed.0 {
                        state.seed = (tile.ordinal(), metadata);
                    }
                }
                None => {
                    handle.create(self.grid, block.bands(), block.data_type())?;
                    created.insert(
                        key.to_string(),
                        OutputState {
                            handle: handle.clone(),
                            bands: block.bands(),
                            data_type: block.data_type(),
                            seed: (tile.ordinal(), metadata),
                        },
                    );
                }
            }
        }

        let mut dataset = handle.open_update()?;
        dataset.write_block(tile, block.data().view())
    }
}

/// Orchestrates one raster-to-raster transformation
pub struct Applier {
    inputs: Vec<(String, RasterSource)>,
    outputs: Vec<(String, RasterSource)>,
    grid: Option<PixelGrid>,
    options: ApplierOptions,
    progress: Arc<dyn ProgressSink>,
    cancellation: CancellationToken,
}

impl Applier {
    pub fn new(options: ApplierOptions) -> Self {
        Self {
            inputs: Vec::new(),
            outputs: Vec::new(),
            grid: None,
            options,
            progress: Arc::new(NoProgress),
            cancellation: CancellationToken::new(),
        }
    }

    /// Tile this grid instead of the first input's
    pub fn with_grid(mut self, grid: PixelGrid) -> Self {
        self.grid = Some(grid);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn options(&self) -> &ApplierOptions {
        &self.options
    }

    pub fn declare_input(&mut self, key: &str, source: impl Into<RasterSource>) {
        declare(&mut self.inputs, key, source.into());
    }

    pub fn declare_output(&mut self, key: &str, source: impl Into<RasterSource>) {
        declare(&mut self.outputs, key, source.into());
    }

    /// Run `tile_fn` for every tile, then `metadata_fn` once before output headers are written
    pub fn run<F, M>(&self, tile_fn: F, metadata_fn: M) -> WeaveResult<RunReport>
    where
        F: Fn(&TileWindow, &BlockAssociations, &mut BlockAssociations) -> WeaveResult<()> + Sync,
        M: FnOnce(&BTreeMap<String, RasterMetadata>, &mut BTreeMap<String, RasterMetadata>) -> WeaveResult<()>,
    {
        let start = Instant::now();
        let inputs = self.open_inputs()?;
        let grid = self.reference_grid(&inputs)?;
        let declared = self.declared_outputs(&inputs)?;
        let scheduler = TileScheduler::new(grid.width, grid.height, self.options.tile_width, self.options.tile_height)?;
        let total = scheduler.tile_count();

        log::info!(
            "Applier run: {} inputs, {} outputs, {}x{} grid, {} tiles of {}x{}, {} worker(s)",
            inputs.len(),
            declared.len(),
            grid.width,
            grid.height,
            total,
            self.options.tile_width,
            self.options.tile_height,
            self.options.workers.max(1)
        );
        self.progress.set_text(&format!("Processing {} tiles", total));

        let registry = OutputRegistry {
            grid: &grid,
            declared,
            created: Mutex::new(BTreeMap::new()),
        };
        let completed = AtomicUsize::new(0);
        let failures: Mutex<Vec<TileWindow>> = Mutex::new(Vec::new());

        let process = |tile: TileWindow| -> WeaveResult<()> {
            if self.cancellation.is_cancelled() {
                return Err(WeaveError::Cancelled {
                    completed: completed.load(Ordering::SeqCst),
                    total,
                });
            }
            log::debug!("Processing {}", tile);
            let outcome = process_tile(&tile, &inputs, &registry, &tile_fn).map_err(|e| WeaveError::TileProcessing {
                tile,
                source: Box::new(e),
            });
            if let Err(e) = outcome {
                if !self.options.continue_on_error {
                    return Err(e);
                }
                log::error!("{}", e);
                failures.lock().unwrap_or_else(|p| p.into_inner()).push(tile);
            }
            let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
            self.progress.set_percentage(100.0 * done as f64 / total.max(1) as f64);
            Ok(())
        };

        if self.options.workers <= 1 {
            scheduler.tiles().try_for_each(process)?;
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.options.workers)
                .build()
                .map_err(|e| WeaveError::Configuration(format!("Failed to build worker pool: {}", e)))?;
            pool.install(|| scheduler.tiles().par_bridge().try_for_each(process))?;
        }

        // Every tile write has returned; headers may now be finalized.
        let created = registry.created.into_inner().unwrap_or_else(|p| p.into_inner());
        let input_metadata: BTreeMap<String, RasterMetadata> = inputs
            .iter()
            .map(|m| (m.key.clone(), m.metadata.as_ref().clone()))
            .collect();
        let mut output_metadata: BTreeMap<String, RasterMetadata> = created
            .iter()
            .map(|(key, state)| {
                let mut meta = state.seed.1.as_ref().clone();
                meta.set_band_count(state.bands);
                (key.clone(), meta)
            })
            .collect();
        for key in registry.declared.keys() {
            if !created.contains_key(key) {
                log::warn!("Output '{}' was never produced by the tile function", key);
            }
        }

        metadata_fn(&input_metadata, &mut output_metadata)?;

        let mut outputs = Vec::new();
        for (key, state) in &created {
            if let Some(meta) = output_metadata.get(key) {
                meta.write(&state.handle)?;
            }
            outputs.push(state.handle.path().to_path_buf());
        }

        let failed_tiles = failures.into_inner().unwrap_or_else(|p| p.into_inner());
        let report = RunReport {
            tiles_total: total,
            tiles_processed: completed.into_inner(),
            failed_tiles,
            outputs,
            elapsed: start.elapsed(),
        };
        log::info!(
            "Applier run finished: {} tiles in {:?}, {} output raster(s), {} failed tile(s)",
            report.tiles_processed,
            report.elapsed,
            report.outputs.len(),
            report.failed_tiles.len()
        );
        Ok(report)
    }

    fn open_inputs(&self) -> WeaveResult<Vec<InputMember>> {
        let mut members = Vec::new();
        for (key, source) in &self.inputs {
            for (block_key, handle) in source.members(key) {
                let dataset = handle.open()?;
                let metadata = RasterMetadata::read(&handle)?;
                members.push(InputMember {
                    key: block_key,
                    grid: dataset.grid().clone(),
                    data_type: dataset.data_type(),
                    handle,
                    metadata: Arc::new(metadata),
                });
            }
        }
        Ok(members)
    }

    fn reference_grid(&self, inputs: &[InputMember]) -> WeaveResult<PixelGrid> {
        let reference = match (&self.grid, inputs.first()) {
            (Some(grid), _) => grid.clone(),
            (None, Some(first)) => first.grid.clone(),
            (None, None) => {
                return Err(WeaveError::Configuration(
                    "no inputs declared and no reference grid given".to_string(),
                ))
            }
        };
        for member in inputs {
            if let Some(reason) = reference.incompatibility(&member.grid) {
                return Err(WeaveError::Configuration(format!(
                    "input '{}' ({}) does not share the reference pixel grid: {}",
                    member.key,
                    member.handle.path().display(),
                    reason
                )));
            }
        }
        Ok(reference)
    }

    fn declared_outputs(&self, inputs: &[InputMember]) -> WeaveResult<HashMap<String, RasterHandle>> {
        let input_paths: HashSet<_> = inputs.iter().map(|m| m.handle.path().to_path_buf()).collect();
        let mut seen_paths = HashSet::new();
        let mut declared = HashMap::new();
        for (key, source) in &self.outputs {
            for (block_key, handle) in source.members(key) {
                if input_paths.contains(handle.path()) {
                    return Err(WeaveError::Configuration(format!(
                        "output '{}' would overwrite input {}",
                        block_key,
                        handle.path().display()
                    )));
                }
                if !seen_paths.insert(handle.path().to_path_buf()) {
                    return Err(WeaveError::Configuration(format!(
                        "output path {} is declared twice",
                        handle.path().display()
                    )));
                }
                declared.insert(block_key, handle);
            }
        }
        Ok(declared)
    }
}

fn declare(slot: &mut Vec<(String, RasterSource)>, key: &str, source: RasterSource) {
    match slot.iter_mut().find(|(k, _)| k == key) {
        Some(existing) => existing.1 = source,
        None => slot.push((key.to_string(), source)),
    }
}

fn process_tile<F>(tile: &TileWindow, inputs: &[InputMember], registry: &OutputRegistry<'_>, tile_fn: &F) -> WeaveResult<()>
where
    F: Fn(&TileWindow, &BlockAssociations, &mut BlockAssociations) -> WeaveResult<()>,
{
    let mut input_blocks = BlockAssociations::new();
    for member in inputs {
        let mut dataset = member.handle.open()?;
        let data = dataset.read_block(tile)?;
        input_blocks.insert(&member.key, PixelBlock::new(data, member.data_type), member.metadata.clone());
    }

    let mut output_blocks = BlockAssociations::new();
    tile_fn(tile, &input_blocks, &mut output_blocks)?;
    drop(input_blocks);

    for (key, block, metadata) in output_blocks.into_entries() {
        registry.write(tile, &key, &block, metadata)?;
    }
    Ok(())
}
