//! Cloud and shadow masking over overlapping tiles.
//!
//! Each scene is cut into tiles that carry `overlap` pixels of context on
//! every side. Tiles are classified in batches on a dedicated rayon pool and
//! only the core of every prediction is written into a mask pre-filled with
//! `NoData`, so a failed tile simply leaves its core as nodata.

use crate::core::context::{RunContext, StageCounts};
use crate::core::tiling::{plan_tiles, TileWindow};
use crate::io::cache::{CacheKey, Stage, WriteOutcome};
use crate::maybe_rayon::*;
use crate::types::{Band, Mask, MaskClass, MaskedScene, PipelineError, PipelineResult, Scene};
use ndarray::{s, Array2, Array3, ArrayView3, Axis, Zip};
use serde::{Deserialize, Serialize};

/// Where the classifier runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    /// Accelerator by ordinal
    Accelerator(u32),
}

impl Device {
    pub fn profile(&self) -> DeviceProfile {
        match self {
            Device::Cpu => DeviceProfile { batch_size: 4, tile_size: 512 },
            Device::Accelerator(_) => DeviceProfile { batch_size: 16, tile_size: 1024 },
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Accelerator(n) => write!(f, "accelerator:{}", n),
        }
    }
}

/// Throughput defaults for a device class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProfile {
    pub batch_size: usize,
    pub tile_size: usize,
}

/// Cloud/shadow classification model.
///
/// Implementations must be deterministic for a given device class and must
/// return a mask with the tile's (rows, cols) shape. Results may not differ
/// between devices beyond what `verify_device_equivalence` tolerates.
pub trait CloudClassifier: Send + Sync {
    /// Pixels of context needed on each side of a prediction
    fn receptive_field(&self) -> usize;

    /// Classify one tile laid out as (band, row, col)
    fn classify(&self, tile: ArrayView3<'_, f32>, device: Device) -> anyhow::Result<Array2<MaskClass>>;
}

/// Masking parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskingConfig {
    pub device: Device,
    pub workers: usize,
    /// Tiles per batch; defaults to the device profile
    pub batch_size: Option<usize>,
    /// Tile side in pixels; defaults to the device profile
    pub tile_size: Option<usize>,
    /// Context pixels per side; never less than the classifier's receptive field
    pub overlap: Option<usize>,
    /// Bands handed to the classifier, in order
    pub classifier_bands: Vec<Band>,
}

impl Default for MaskingConfig {
    fn default() -> Self {
        Self {
            device: Device::Cpu,
            workers: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            batch_size: None,
            tile_size: None,
            overlap: None,
            classifier_bands: vec![Band::Red, Band::Green, Band::Nir],
        }
    }
}

impl MaskingConfig {
    pub fn validate(&self) -> PipelineResult<()> {
        if self.workers == 0 {
            return Err(PipelineError::InvalidConfig("masking needs at least one worker".to_string()));
        }
        if self.batch_size == Some(0) {
            return Err(PipelineError::InvalidConfig("batch_size must be positive".to_string()));
        }
        if self.classifier_bands.is_empty() {
            return Err(PipelineError::InvalidConfig("no classifier bands configured".to_string()));
        }
        Ok(())
    }
}

/// Per-scene masking outcome
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaskingStats {
    pub tiles: usize,
    /// Tiles whose core was left as nodata
    pub failed_tiles: usize,
    pub valid_pixels: usize,
}

pub struct MaskingPipeline<M: CloudClassifier> {
    classifier: M,
    config: MaskingConfig,
    batch_size: usize,
    tile_size: usize,
    overlap: usize,
    pool: rayon::ThreadPool,
}

impl<M: CloudClassifier> MaskingPipeline<M> {
    pub fn new(classifier: M, config: MaskingConfig) -> PipelineResult<Self> {
        config.validate()?;
        let profile = config.device.profile();
        let receptive_field = classifier.receptive_field();
        let overlap = config.overlap.unwrap_or(receptive_field);
        if overlap < receptive_field {
            log::warn!(
                "Configured overlap {} is below the classifier receptive field {}, using {}",
                overlap,
                receptive_field,
                receptive_field
            );
        }
        let overlap = overlap.max(receptive_field);
        let tile_size = config.tile_size.unwrap_or(profile.tile_size);
        let batch_size = config.batch_size.unwrap_or(profile.batch_size);
        if tile_size <= 2 * overlap {
            return Err(PipelineError::InvalidConfig(format!(
                "tile size {} too small for overlap {}",
                tile_size, overlap
            )));
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|i| format!("terratrend-mask-{}", i))
            .build()
            .map_err(|e| PipelineError::Processing(format!("failed to build masking pool: {}", e)))?;

        log::debug!(
            "Masking on {} with {} workers: tile {} px, overlap {} px, batch {}",
            config.device,
            config.workers,
            tile_size,
            overlap,
            batch_size
        );
        Ok(Self { classifier, config, batch_size, tile_size, overlap, pool })
    }

    pub fn config(&self) -> &MaskingConfig {
        &self.config
    }

    /// Classify one scene; the scene itself is left untouched
    pub fn mask_scene(&self, scene: &Scene) -> PipelineResult<(MaskedScene, MaskingStats)> {
        let (n_bands, rows, cols) = scene.bands.dim();
        let indices: Vec<usize> = self.config.classifier_bands.iter().map(|b| b.index()).collect();
        if let Some(missing) = indices.iter().find(|i| **i >= n_bands) {
            return Err(PipelineError::InvalidFormat(format!(
                "scene {} has no band {} for the classifier",
                scene.id(),
                missing
            )));
        }
        let input = scene.bands.select(Axis(0), &indices);

        let tiles = plan_tiles(rows, cols, self.tile_size, self.overlap)?;
        let mut classes = Array2::from_elem((rows, cols), MaskClass::NoData);
        let mut stats = MaskingStats { tiles: tiles.len(), ..Default::default() };

        for batch in tiles.chunks(self.batch_size) {
            let predictions: Vec<(TileWindow, PipelineResult<Array2<MaskClass>>)> = self.pool.install(|| {
                batch
                    .into_par_iter()
                    .map(|tile| (*tile, self.classify_tile(&input, tile)))
                    .collect()
            });

            for (tile, prediction) in predictions {
                match prediction {
                    Ok(prediction) => {
                        let (r, c) = tile.core_in_tile();
                        classes
                            .slice_mut(s![
                                tile.core_row..tile.core_row + tile.core_rows,
                                tile.core_col..tile.core_col + tile.core_cols
                            ])
                            .assign(&prediction.slice(s![r..r + tile.core_rows, c..c + tile.core_cols]));
                    }
                    Err(e) => {
                        log::warn!(
                            "Scene {}: tile at ({}, {}) left as nodata: {}",
                            scene.id(),
                            tile.core_row,
                            tile.core_col,
                            e
                        );
                        stats.failed_tiles += 1;
                    }
                }
            }
        }

        Zip::from(&mut classes)
            .and(&scene.source_nodata())
            .for_each(|class, nodata| {
                if *nodata {
                    *class = MaskClass::NoData;
                }
            });

        stats.valid_pixels = classes.iter().filter(|c| c.is_valid()).count();
        let mask = Mask { grid: scene.grid, classes };
        Ok((MaskedScene::new(scene.clone(), mask)?, stats))
    }

    fn classify_tile(&self, input: &Array3<f32>, tile: &TileWindow) -> PipelineResult<Array2<MaskClass>> {
        let view = input.slice(s![
            ..,
            tile.row_offset..tile.row_offset + tile.rows,
            tile.col_offset..tile.col_offset + tile.cols
        ]);
        let prediction = self
            .classifier
            .classify(view, self.config.device)
            .map_err(|e| PipelineError::Classification(format!("{:#}", e)))?;
        if prediction.dim() != (tile.rows, tile.cols) {
            return Err(PipelineError::Classification(format!(
                "prediction shape {:?} does not match tile {}x{}",
                prediction.dim(),
                tile.rows,
                tile.cols
            )));
        }
        Ok(prediction)
    }

    /// Mask every cached raw scene that has no masked entry yet
    pub fn run(&self, ctx: &RunContext) -> PipelineResult<StageCounts> {
        let subjects = ctx.cache.list_subjects(Stage::Raw)?;
        log::info!("Masking {} cached scenes", subjects.len());
        let mut counts = StageCounts::default();

        for subject in subjects {
            ctx.check_cancelled()?;
            if ctx.cache.contains(&CacheKey::scene(Stage::Masked, &subject)) {
                counts.cached += 1;
                continue;
            }

            let scene = match ctx.cache.load_scene(&subject) {
                Ok(scene) => scene,
                Err(e) => {
                    log::warn!("Cannot load raw scene {}: {}", subject, e);
                    counts.failed += 1;
                    continue;
                }
            };

            match self.mask_scene(&scene) {
                Ok((masked, stats)) => {
                    counts.degraded += stats.failed_tiles;
                    match ctx.cache.put_masked(&masked) {
                        Ok(WriteOutcome::Written | WriteOutcome::Replaced) => counts.produced += 1,
                        Ok(WriteOutcome::AlreadyPresent) => counts.cached += 1,
                        Err(e) => {
                            log::warn!("Masked scene {} not stored: {}", scene.id(), e);
                            counts.failed += 1;
                            continue;
                        }
                    }
                    log::debug!(
                        "Scene {} masked: {} of {} pixels valid, {} failed tiles",
                        scene.id(),
                        stats.valid_pixels,
                        scene.grid.pixel_count(),
                        stats.failed_tiles
                    );
                }
                Err(e) => {
                    log::warn!("Masking scene {} failed: {}", scene.id(), e);
                    counts.failed += 1;
                }
            }
        }

        log::info!(
            "Masking finished: {} masked, {} cached, {} failed, {} nodata tiles",
            counts.produced,
            counts.cached,
            counts.failed,
            counts.degraded
        );
        Ok(counts)
    }
}

/// Run `tile` on every device and compare each result with the first.
///
/// Returns the largest fraction of disagreeing pixels, or a
/// `Classification` error when it exceeds `tolerance`.
pub fn verify_device_equivalence<M: CloudClassifier>(
    classifier: &M,
    tile: ArrayView3<'_, f32>,
    devices: &[Device],
    tolerance: f64,
) -> PipelineResult<f64> {
    let Some((reference_device, others)) = devices.split_first() else {
        return Ok(0.0);
    };
    let classify = |device: Device| {
        classifier
            .classify(tile.view(), device)
            .map_err(|e| PipelineError::Classification(format!("{} failed: {:#}", device, e)))
    };

    let reference = classify(*reference_device)?;
    let mut worst = 0.0f64;
    for device in others {
        let other = classify(*device)?;
        if other.dim() != reference.dim() {
            return Err(PipelineError::Classification(format!(
                "{} returned shape {:?}, {} returned {:?}",
                device,
                other.dim(),
                reference_device,
                reference.dim()
            )));
        }
        let differing = Zip::from(&reference).and(&other).fold(0usize, |n, a, b| n + (a != b) as usize);
        let fraction = differing as f64 / reference.len().max(1) as f64;
        log::debug!("{} vs {}: {:.4} of pixels differ", device, reference_device, fraction);
        worst = worst.max(fraction);
    }

    if worst > tolerance {
        return Err(PipelineError::Classification(format!(
            "device outputs differ on {:.2}% of pixels (tolerance {:.2}%)",
            worst * 100.0,
            tolerance * 100.0
        )));
    }
    Ok(worst)
}
