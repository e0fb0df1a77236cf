//! Run-scoped state handed to every stage

use crate::io::TileCache;
use crate::types::{BoundingBox, GridSpec, PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation shared by clones of a `RunContext`
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
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

/// Per-stage tally reported by every stage driver
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    /// Units computed and written by this run
    pub produced: usize,
    /// Units already in the cache
    pub cached: usize,
    pub failed: usize,
    /// Units with no usable input (e.g. a year without scenes)
    pub empty: usize,
    /// Sub-units replaced by nodata inside produced units (masking tiles)
    pub degraded: usize,
}

impl StageCounts {
    /// Outputs the next stage can consume
    pub fn available(&self) -> usize {
        self.produced + self.cached
    }
}

/// Shared reference grid, cache location and cancellation for one run
#[derive(Debug, Clone)]
pub struct RunContext {
    pub cache: TileCache,
    /// Grid every mosaic, index and trend raster is produced on
    pub reference_grid: GridSpec,
    /// Region of interest in lon/lat, compared against scene footprints
    pub area_of_interest: BoundingBox,
    pub cancel: CancelFlag,
}

impl RunContext {
    pub fn new(cache: TileCache, reference_grid: GridSpec, area_of_interest: BoundingBox) -> Self {
        Self {
            cache,
            reference_grid,
            area_of_interest,
            cancel: CancelFlag::new(),
        }
    }

    /// Stage-boundary checkpoint
    pub fn check_cancelled(&self) -> PipelineResult<()> {
        if self.cancel.is_cancelled() {
            log::warn!("Run cancelled at a stage boundary");
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }
}
