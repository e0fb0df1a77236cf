//! Run driver: chains acquisition, masking, compositing, index and trend

use crate::core::acquisition::{AcquisitionConfig, AcquisitionManifest, AcquisitionOrchestrator};
use crate::core::composite::{CompositeConfig, Compositor};
use crate::core::context::{RunContext, StageCounts};
use crate::core::index::{IndexCalculator, IndexConfig};
use crate::core::masking::{CloudClassifier, MaskingConfig, MaskingPipeline};
use crate::core::trend::{TrendConfig, TrendEstimator, TrendSummary};
use crate::io::cache::Stage;
use crate::io::catalog::{LocalCatalog, SceneCatalog};
use crate::io::TileCache;
use crate::types::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const MANIFEST_FILE: &str = "run_manifest.json";

/// Complete run configuration, loadable from JSON
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub acquisition: AcquisitionConfig,
    pub masking: MaskingConfig,
    pub composite: CompositeConfig,
    pub index: IndexConfig,
    pub trend: TrendConfig,
    /// Directory scanned by `LocalCatalog`
    pub input_dir: Option<PathBuf>,
    /// Receives the run manifest and, with `gdal`, GeoTIFF exports
    pub output_dir: Option<PathBuf>,
    /// Tile cache root; defaults to the platform cache directory
    pub cache_dir: Option<PathBuf>,
}

impl PipelineConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        let path = path.as_ref();
        log::info!("Loading configuration from {}", path.display());
        let bytes = std::fs::read(path)?;
        let config: Self = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        self.acquisition.validate()?;
        self.masking.validate()?;
        self.trend.validate()?;
        Ok(())
    }

    pub fn cache_root(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(TileCache::default_root)
    }

    pub fn open_cache(&self) -> PipelineResult<TileCache> {
        TileCache::open(self.cache_root())
    }

    /// Catalog over `input_dir`
    pub fn local_catalog(&self) -> PipelineResult<LocalCatalog> {
        let dir = self
            .input_dir
            .as_ref()
            .ok_or_else(|| PipelineError::InvalidConfig("input_dir is not set".to_string()))?;
        LocalCatalog::scan(dir)
    }
}

/// Outcome of a full run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub acquisition: AcquisitionManifest,
    pub masking: StageCounts,
    pub composite: StageCounts,
    pub index: StageCounts,
    pub trend: Option<TrendSummary>,
    /// Trend loaded from the cache instead of fitted
    pub trend_cached: bool,
    /// Stage that produced no outputs; later stages did not run
    pub aborted_at: Option<Stage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exported: Vec<PathBuf>,
}

impl RunManifest {
    /// Process exit status: 0 on a complete run, 2 when a stage came up empty
    pub fn exit_code(&self) -> i32 {
        if self.aborted_at.is_some() {
            2
        } else {
            0
        }
    }

    pub fn is_complete(&self) -> bool {
        self.aborted_at.is_none() && self.trend.is_some()
    }

    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> PipelineResult<()> {
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> PipelineResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run every stage in order.
    ///
    /// A stage with no available outputs stops the run and is recorded in
    /// `aborted_at`. Only an unreachable catalog or cancellation is an error;
    /// whatever completed before either stays valid in the cache.
    pub fn run<C, M>(&self, ctx: &RunContext, catalog: Arc<C>, classifier: M) -> PipelineResult<RunManifest>
    where
        C: SceneCatalog + 'static,
        M: CloudClassifier,
    {
        let config = &self.config;
        let years = config.acquisition.years;
        let window = config.acquisition.window;
        let mut manifest = RunManifest::default();

        log::info!(
            "Starting run for {}..={} on a {}x{} grid (EPSG:{}), cache at {}",
            years.start,
            years.end,
            ctx.reference_grid.width,
            ctx.reference_grid.height,
            ctx.reference_grid.epsg,
            ctx.cache.root().display()
        );

        let orchestrator = AcquisitionOrchestrator::new(catalog, config.acquisition.clone())?;
        manifest.acquisition = orchestrator.run(ctx)?;
        ctx.check_cancelled()?;
        if manifest.acquisition.cancelled {
            return Err(PipelineError::Cancelled);
        }
        if manifest.acquisition.available() == 0 {
            return self.finish(abort(manifest, Stage::Raw));
        }

        let masking = MaskingPipeline::new(classifier, config.masking.clone())?;
        manifest.masking = masking.run(ctx)?;
        ctx.check_cancelled()?;
        if manifest.masking.available() == 0 {
            return self.finish(abort(manifest, Stage::Masked));
        }

        let compositor = Compositor::new(config.composite.clone());
        manifest.composite = compositor.run(ctx, &years, &window)?;
        ctx.check_cancelled()?;
        if manifest.composite.available() == 0 {
            return self.finish(abort(manifest, Stage::Mosaic));
        }

        let calculator = IndexCalculator::new(config.index.clone());
        manifest.index = calculator.run(ctx, &years)?;
        ctx.check_cancelled()?;
        if manifest.index.available() == 0 {
            return self.finish(abort(manifest, Stage::Index));
        }

        let estimator = TrendEstimator::new(config.trend.clone())?;
        let Some(outcome) = estimator.run(ctx, &years)? else {
            return self.finish(abort(manifest, Stage::Trend));
        };
        manifest.trend = Some(outcome.summary);
        manifest.trend_cached = outcome.cached;

        if let Some(dir) = &config.output_dir {
            manifest.exported = export(ctx, dir, &calculator, &outcome.raster)?;
        }
        log::info!("Run complete: {} trend pixels", outcome.summary.pixels);
        self.finish(manifest)
    }

    fn finish(&self, manifest: RunManifest) -> PipelineResult<RunManifest> {
        if let Some(dir) = &self.config.output_dir {
            std::fs::create_dir_all(dir)?;
            manifest.write_json(dir.join(MANIFEST_FILE))?;
        }
        Ok(manifest)
    }
}

fn abort(mut manifest: RunManifest, stage: Stage) -> RunManifest {
    log::error!("Stage {} produced no outputs, stopping the run", stage);
    manifest.aborted_at = Some(stage);
    manifest
}

#[cfg(feature = "gdal")]
fn export(
    ctx: &RunContext,
    dir: &Path,
    calculator: &IndexCalculator,
    trend: &crate::types::TrendRaster,
) -> PipelineResult<Vec<PathBuf>> {
    use crate::io::geotiff;

    std::fs::create_dir_all(dir)?;
    let mut written = Vec::new();
    for year in &trend.years {
        let mosaic_path = dir.join(format!("mosaic_{}.tif", year));
        geotiff::write_mosaic(&mosaic_path, &ctx.cache.load_mosaic(*year)?)?;
        written.push(mosaic_path);

        let index_path = dir.join(format!("{}_{}.tif", calculator.formula().name().to_lowercase(), year));
        geotiff::write_index(&index_path, &ctx.cache.load_index(*year)?)?;
        written.push(index_path);
    }
    if let (Some(first), Some(last)) = (trend.years.first(), trend.years.last()) {
        let trend_path = dir.join(format!("trend_{}_{}.tif", first, last));
        geotiff::write_trend(&trend_path, trend)?;
        written.push(trend_path);
    }
    Ok(written)
}

#[cfg(not(feature = "gdal"))]
fn export(
    _ctx: &RunContext,
    dir: &Path,
    _calculator: &IndexCalculator,
    _trend: &crate::types::TrendRaster,
) -> PipelineResult<Vec<PathBuf>> {
    log::warn!("GeoTIFF export to {} skipped: built without the `gdal` feature", dir.display());
    Ok(Vec::new())
}
