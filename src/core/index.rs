//! Spectral indices over yearly mosaics

use crate::core::acquisition::YearRange;
use crate::core::context::{RunContext, StageCounts};
use crate::io::cache::{input_tag, CacheKey, Stage, WriteOutcome};
use crate::maybe_rayon::*;
use crate::types::{Band, IndexRaster, Mosaic, PipelineError, PipelineResult, BAND_COUNT, REFLECTANCE_SCALE};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Denominators closer to zero than this are nodata
const DENOMINATOR_EPSILON: f32 = 1e-10;

/// Sentinel-2 tasseled cap components
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TasseledCapComponent {
    Brightness,
    Greenness,
    Wetness,
}

impl TasseledCapComponent {
    /// Weights in `Band::ALL` order, applied to unit reflectance
    pub fn coefficients(self) -> [f32; BAND_COUNT] {
        match self {
            TasseledCapComponent::Brightness => [0.3037, 0.2793, 0.4743, 0.5585, 0.5082, 0.1863],
            TasseledCapComponent::Greenness => [-0.2848, -0.2435, -0.5436, 0.7243, 0.0840, -0.1800],
            TasseledCapComponent::Wetness => [0.1509, 0.1973, 0.3279, 0.3406, -0.7112, -0.4572],
        }
    }
}

/// Per-pixel formula over the six mosaic bands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexFormula {
    /// `(a - b) / (a + b)`
    NormalizedDifference { a: Band, b: Band },
    TasseledCap(TasseledCapComponent),
}

impl IndexFormula {
    pub fn ndvi() -> Self {
        IndexFormula::NormalizedDifference { a: Band::Nir, b: Band::Red }
    }

    pub fn name(&self) -> String {
        match self {
            IndexFormula::NormalizedDifference { a: Band::Nir, b: Band::Red } => "NDVI".to_string(),
            IndexFormula::NormalizedDifference { a, b } => format!("ND({},{})", a, b),
            IndexFormula::TasseledCap(TasseledCapComponent::Brightness) => "TCB".to_string(),
            IndexFormula::TasseledCap(TasseledCapComponent::Greenness) => "TCG".to_string(),
            IndexFormula::TasseledCap(TasseledCapComponent::Wetness) => "TCW".to_string(),
        }
    }

    /// Evaluate for one pixel; `None` is nodata
    pub fn evaluate(&self, px: &[f32; BAND_COUNT]) -> Option<f32> {
        if px.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let value = match self {
            IndexFormula::NormalizedDifference { a, b } => {
                let (a, b) = (px[a.index()], px[b.index()]);
                let sum = a + b;
                if sum.abs() < DENOMINATOR_EPSILON {
                    return None;
                }
                (a - b) / sum
            }
            IndexFormula::TasseledCap(component) => {
                // A zero band is an unfilled pixel in the L2A product
                if px.iter().any(|v| *v == 0.0) {
                    return None;
                }
                component
                    .coefficients()
                    .iter()
                    .zip(px.iter())
                    .map(|(w, v)| w * (v / REFLECTANCE_SCALE))
                    .sum()
            }
        };
        value.is_finite().then_some(value)
    }
}

impl Default for IndexFormula {
    fn default() -> Self {
        Self::ndvi()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub formula: IndexFormula,
}

pub struct IndexCalculator {
    config: IndexConfig,
}

impl IndexCalculator {
    pub fn new(config: IndexConfig) -> Self {
        Self { config }
    }

    pub fn formula(&self) -> IndexFormula {
        self.config.formula
    }

    /// Index raster on the mosaic's grid; nodata mosaic pixels stay nodata
    pub fn compute(&self, mosaic: &Mosaic) -> PipelineResult<IndexRaster> {
        let (n_bands, rows, cols) = mosaic.bands.dim();
        if n_bands != BAND_COUNT || (rows, cols) != mosaic.grid.shape() || mosaic.contributors.dim() != (rows, cols) {
            return Err(PipelineError::GridMismatch(format!(
                "mosaic {} has shape {:?}, grid is {:?}",
                mosaic.year,
                mosaic.bands.dim(),
                mosaic.grid.shape()
            )));
        }

        let formula = self.config.formula;
        let values: Vec<Option<f32>> = (0..rows)
            .into_par_iter()
            .flat_map(|r| {
                let mut out = vec![None; cols];
                let mut px = [0.0f32; BAND_COUNT];
                for (c, slot) in out.iter_mut().enumerate() {
                    if mosaic.is_nodata(r, c) {
                        continue;
                    }
                    for (b, v) in px.iter_mut().enumerate() {
                        *v = mosaic.bands[[b, r, c]];
                    }
                    *slot = formula.evaluate(&px);
                }
                out
            })
            .collect();

        let values = Array2::from_shape_vec((rows, cols), values)
            .map_err(|e| PipelineError::Processing(format!("Shape error: {}", e)))?;
        Ok(IndexRaster { year: mosaic.year, grid: mosaic.grid, values })
    }

    /// Compute the index for every cached mosaic in `years`.
    ///
    /// An index raster is recomputed when its mosaic was rebuilt, and dropped
    /// when the year no longer has a mosaic.
    pub fn run(&self, ctx: &RunContext, years: &YearRange) -> PipelineResult<StageCounts> {
        log::info!("Computing {} for {}..={}", self.config.formula.name(), years.start, years.end);
        let mut counts = StageCounts::default();

        for year in years.iter() {
            ctx.check_cancelled()?;
            let key = CacheKey::year(Stage::Index, year);
            let mosaic_key = CacheKey::year(Stage::Mosaic, year);
            if !ctx.cache.contains(&mosaic_key) {
                if ctx.cache.remove(&key)? {
                    log::info!("Year {}: dropped index of a mosaic that no longer exists", year);
                }
                counts.empty += 1;
                continue;
            }
            let inputs = match ctx.cache.read_record(&mosaic_key) {
                Ok(record) => vec![input_tag(&mosaic_key.subject, &record)],
                Err(e) => {
                    log::warn!("Year {}: unreadable mosaic entry: {}", year, e);
                    counts.failed += 1;
                    continue;
                }
            };
            if ctx.cache.is_current(&key, &inputs) {
                counts.cached += 1;
                continue;
            }

            let index = match ctx.cache.load_mosaic(year).and_then(|m| self.compute(&m)) {
                Ok(index) => index,
                Err(e) => {
                    log::warn!("Year {}: index not computed: {}", year, e);
                    counts.failed += 1;
                    continue;
                }
            };
            log::debug!("Year {}: {} valid index pixels", year, index.valid_pixels());
            match ctx.cache.put_index(&index, inputs) {
                Ok(WriteOutcome::Written | WriteOutcome::Replaced) => counts.produced += 1,
                Ok(WriteOutcome::AlreadyPresent) => counts.cached += 1,
                Err(e) => {
                    log::warn!("Year {}: index not stored: {}", year, e);
                    counts.failed += 1;
                }
            }
        }
        Ok(counts)
    }
}
