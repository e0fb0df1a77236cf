//! Per-pixel linear trend of an index over years

use crate::core::acquisition::YearRange;
use crate::core::context::RunContext;
use crate::core::stats::median;
use crate::io::cache::{input_tag, CacheKey, Stage, WriteOutcome};
use crate::maybe_rayon::*;
use crate::types::{IndexRaster, PipelineError, PipelineResult, TrendQuality, TrendRaster, TrendRecord};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Line-fitting method
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegressionMethod {
    /// Median of pairwise slopes; robust to single outlier years
    #[default]
    TheilSen,
    OrdinaryLeastSquares,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendConfig {
    pub method: RegressionMethod,
    /// Valid years needed before a slope is reported (at least 2)
    pub min_valid_years: usize,
    /// Residual standard deviation above which a fit is `PoorFit`
    pub max_residual_std: Option<f32>,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            method: RegressionMethod::TheilSen,
            min_valid_years: 3,
            max_residual_std: None,
        }
    }
}

impl TrendConfig {
    pub fn validate(&self) -> PipelineResult<()> {
        if self.min_valid_years < 2 {
            return Err(PipelineError::InvalidConfig(format!(
                "min_valid_years must be at least 2, got {}",
                self.min_valid_years
            )));
        }
        if let Some(t) = self.max_residual_std {
            if !t.is_finite() || t < 0.0 {
                return Err(PipelineError::InvalidConfig(format!("invalid max_residual_std {}", t)));
            }
        }
        Ok(())
    }
}

/// (slope, intercept at x = 0, residual standard deviation)
fn fit_line(method: RegressionMethod, x: &[f64], y: &[f64]) -> Option<(f64, f64, f64)> {
    let n = x.len();
    if n < 2 || n != y.len() {
        return None;
    }

    let (slope, intercept) = match method {
        RegressionMethod::OrdinaryLeastSquares => {
            let mean_x = x.iter().sum::<f64>() / n as f64;
            let mean_y = y.iter().sum::<f64>() / n as f64;
            let mut sxx = 0.0;
            let mut sxy = 0.0;
            for (xi, yi) in x.iter().zip(y) {
                sxx += (xi - mean_x) * (xi - mean_x);
                sxy += (xi - mean_x) * (yi - mean_y);
            }
            if sxx == 0.0 {
                return None;
            }
            let slope = sxy / sxx;
            (slope, mean_y - slope * mean_x)
        }
        RegressionMethod::TheilSen => {
            let mut slopes = Vec::with_capacity(n * (n - 1) / 2);
            for i in 0..n {
                for j in i + 1..n {
                    if x[j] != x[i] {
                        slopes.push((y[j] - y[i]) / (x[j] - x[i]));
                    }
                }
            }
            let slope = median(&mut slopes)?;
            let mut offsets: Vec<f64> = x.iter().zip(y).map(|(xi, yi)| yi - slope * xi).collect();
            (slope, median(&mut offsets)?)
        }
    };

    let ss: f64 = x
        .iter()
        .zip(y)
        .map(|(xi, yi)| {
            let r = yi - (intercept + slope * xi);
            r * r
        })
        .sum();
    let dof = n.saturating_sub(2).max(1) as f64;
    Some((slope, intercept, (ss / dof).sqrt()))
}

/// Counts over a trend raster
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendSummary {
    pub pixels: usize,
    pub insufficient: usize,
    pub poor_fit: usize,
    pub insufficient_fraction: f64,
    /// Median slope over pixels with a fit
    pub median_slope: Option<f32>,
}

impl TrendSummary {
    pub fn from_raster(raster: &TrendRaster) -> Self {
        let pixels = raster.records.len();
        let mut insufficient = 0;
        let mut poor_fit = 0;
        let mut slopes = Vec::new();
        for record in raster.records.iter() {
            match record.quality {
                TrendQuality::InsufficientData => insufficient += 1,
                TrendQuality::PoorFit => poor_fit += 1,
                TrendQuality::Good => {}
            }
            slopes.extend(record.slope);
        }
        Self {
            pixels,
            insufficient,
            poor_fit,
            insufficient_fraction: if pixels == 0 { 0.0 } else { insufficient as f64 / pixels as f64 },
            median_slope: median(&mut slopes),
        }
    }
}

/// Trend raster and where it came from
#[derive(Debug, Clone)]
pub struct TrendOutcome {
    pub raster: TrendRaster,
    pub summary: TrendSummary,
    /// Loaded from the cache rather than fitted by this run
    pub cached: bool,
}

pub struct TrendEstimator {
    config: TrendConfig,
}

impl TrendEstimator {
    pub fn new(config: TrendConfig) -> PipelineResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &TrendConfig {
        &self.config
    }

    /// Fit one pixel's series; `years` are offsets from the base year
    pub fn fit_pixel(&self, years: &[f64], values: &[f64]) -> TrendRecord {
        let n_valid = u16::try_from(values.len()).unwrap_or(u16::MAX);
        if values.len() < self.config.min_valid_years {
            return TrendRecord::insufficient(n_valid);
        }
        let Some((slope, intercept, residual_std)) = fit_line(self.config.method, years, values) else {
            return TrendRecord::insufficient(n_valid);
        };
        let residual_std = residual_std as f32;
        let quality = match self.config.max_residual_std {
            Some(limit) if residual_std > limit => TrendQuality::PoorFit,
            _ => TrendQuality::Good,
        };
        TrendRecord {
            slope: Some(slope as f32),
            intercept: Some(intercept as f32),
            n_valid_years: n_valid,
            residual_std: Some(residual_std),
            quality,
        }
    }

    /// Fit every pixel of a series of yearly index rasters.
    ///
    /// Years must be strictly ascending and grids identical. Intercepts are
    /// the fitted values at the first year.
    pub fn estimate(&self, series: &[IndexRaster]) -> PipelineResult<TrendRaster> {
        let first = series
            .first()
            .ok_or_else(|| PipelineError::Processing("no index rasters to fit".to_string()))?;
        for pair in series.windows(2) {
            if pair[1].year <= pair[0].year {
                return Err(PipelineError::InvalidFormat(format!(
                    "index years not strictly ascending: {} then {}",
                    pair[0].year, pair[1].year
                )));
            }
        }
        if let Some(other) = series
            .iter()
            .find(|i| i.grid != first.grid || i.values.dim() != first.grid.shape())
        {
            return Err(PipelineError::GridMismatch(format!(
                "index raster {} is not on the grid of {}",
                other.year, first.year
            )));
        }

        let base_year = first.year;
        let (rows, cols) = first.grid.shape();
        log::info!(
            "Fitting {:?} trends over {} years ({}..={}) for {} pixels",
            self.config.method,
            series.len(),
            base_year,
            series[series.len() - 1].year,
            rows * cols
        );

        let records: Vec<TrendRecord> = (0..rows)
            .into_par_iter()
            .flat_map(|r| {
                let mut xs = Vec::with_capacity(series.len());
                let mut ys = Vec::with_capacity(series.len());
                let mut out = Vec::with_capacity(cols);
                for c in 0..cols {
                    xs.clear();
                    ys.clear();
                    for raster in series {
                        if let Some(v) = raster.values[[r, c]] {
                            xs.push(f64::from(raster.year - base_year));
                            ys.push(f64::from(v));
                        }
                    }
                    out.push(self.fit_pixel(&xs, &ys));
                }
                out
            })
            .collect();

        let records = Array2::from_shape_vec((rows, cols), records)
            .map_err(|e| PipelineError::Processing(format!("Shape error: {}", e)))?;
        Ok(TrendRaster {
            grid: first.grid,
            base_year,
            years: series.iter().map(|i| i.year).collect(),
            records,
        })
    }

    /// Fit the trend over every cached index raster in `years`.
    ///
    /// A cached trend is reused only while it was fitted on exactly the
    /// index entries now in the cache. Returns `None` when no index raster
    /// exists.
    pub fn run(&self, ctx: &RunContext, years: &YearRange) -> PipelineResult<Option<TrendOutcome>> {
        ctx.check_cancelled()?;
        let available: Vec<i32> = ctx
            .cache
            .list_years(Stage::Index)?
            .into_iter()
            .filter(|y| years.contains(*y))
            .collect();
        let (Some(&first), Some(&last)) = (available.first(), available.last()) else {
            log::warn!("No index rasters in {}..={}, no trend fitted", years.start, years.end);
            return Ok(None);
        };

        let key = CacheKey::trend(first, last);
        let inputs = available
            .iter()
            .map(|year| -> PipelineResult<String> {
                let index_key = CacheKey::year(Stage::Index, *year);
                Ok(input_tag(&index_key.subject, &ctx.cache.read_record(&index_key)?))
            })
            .collect::<PipelineResult<Vec<_>>>()?;

        if ctx.cache.is_current(&key, &inputs) {
            match ctx.cache.load_trend(first, last) {
                Ok(raster) => {
                    let summary = TrendSummary::from_raster(&raster);
                    return Ok(Some(TrendOutcome { raster, summary, cached: true }));
                }
                Err(e) => {
                    log::warn!("Cached trend {}-{} unreadable ({}), refitting", first, last, e);
                    ctx.cache.remove(&key)?;
                }
            }
        } else if ctx.cache.contains(&key) {
            log::info!("Index rasters for {}-{} changed, refitting", first, last);
        }

        let series = available
            .iter()
            .map(|y| ctx.cache.load_index(*y))
            .collect::<PipelineResult<Vec<_>>>()?;
        let raster = self.estimate(&series)?;
        let summary = TrendSummary::from_raster(&raster);
        log::info!(
            "Trend fitted: {} pixels, {} insufficient ({:.1}%), {} poor fits",
            summary.pixels,
            summary.insufficient,
            summary.insufficient_fraction * 100.0,
            summary.poor_fit
        );
        if ctx.cache.put_trend(&raster, inputs)? == WriteOutcome::AlreadyPresent {
            log::debug!("Trend {}-{} was written concurrently", first, last);
        }
        Ok(Some(TrendOutcome { raster, summary, cached: false }))
    }
}
