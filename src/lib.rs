//! terratrend: multi-year per-pixel trend maps from optical satellite scenes
//!
//! Scenes for a recurring seasonal window are acquired into an on-disk tile
//! cache, cloud-masked tile by tile, composited into one mosaic per year,
//! reduced to a spectral index and regressed over the years. Every stage
//! reads its predecessor's cached output, so any stage can be re-run alone.

pub mod core;
pub mod io;
pub mod types;

mod maybe_rayon;

// Re-export main types and functions for easier access
pub use types::{
    Band, BoundingBox, GeoTransform, GridSpec, IndexRaster, Mask, MaskClass, MaskedScene, Mosaic, PipelineError,
    PipelineResult, RawRaster, Scene, SceneMetadata, TrendQuality, TrendRaster, TrendRecord,
};

pub use crate::core::{Pipeline, PipelineConfig, RunContext, RunManifest};
pub use io::{LocalCatalog, SceneCatalog, TileCache};
