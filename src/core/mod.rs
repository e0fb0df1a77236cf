//! Processing stages and the run driver

pub mod acquisition;
pub mod composite;
pub mod context;
pub mod index;
pub mod masking;
pub mod pipeline;
mod stats;
pub mod tiling;
pub mod trend;

// Re-export main types
pub use acquisition::{AcquisitionConfig, AcquisitionManifest, AcquisitionOrchestrator, DateWindow, FailedScene, MonthDay, YearRange};
pub use composite::{CompositeConfig, Compositor, SelectionPolicy};
pub use context::{CancelFlag, RunContext, StageCounts};
pub use index::{IndexCalculator, IndexConfig, IndexFormula, TasseledCapComponent};
pub use masking::{verify_device_equivalence, CloudClassifier, Device, DeviceProfile, MaskingConfig, MaskingPipeline, MaskingStats};
pub use pipeline::{Pipeline, PipelineConfig, RunManifest};
pub use tiling::{plan_tiles, TileWindow};
pub use trend::{RegressionMethod, TrendConfig, TrendEstimator, TrendOutcome, TrendSummary};
