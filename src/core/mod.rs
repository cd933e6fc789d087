//! Core raster processing modules

pub mod tiling;
pub mod blocks;
pub mod applier;
pub mod percentiles;
pub mod scoring;
pub mod compositing;
pub mod catalog;

// Re-export main types
pub use tiling::{TileScheduler, TileWindow, DEFAULT_TILE_SIZE};
pub use blocks::{BlockAssociations, PixelBlock};
pub use applier::{
    Applier, ApplierOptions, CancellationToken, LogProgress, NoProgress, ProgressSink, RasterSource, RunReport,
};
pub use percentiles::{nanmean, nanpercentiles, nanstd};
pub use scoring::{ScoreTransform, ScoringConfig, ScoringContext, ScoringFunction, WeightedScore};
pub use compositing::{
    CompositeReport, CompositeState, CompositeTarget, CompositingConfig, CompositingEngine, Observation, SceneId,
    DEFAULT_NO_DATA, FLAG_BANDS,
};
pub use catalog::TileGeometryCatalog;
