//! Per-year best-pixel compositing onto the reference grid

use crate::core::acquisition::{DateWindow, YearRange};
use crate::core::context::{RunContext, StageCounts};
use crate::core::stats::median;
use crate::io::cache::{input_tag, CacheKey, Stage, WriteOutcome};
use crate::maybe_rayon::*;
use crate::types::{GridSpec, MaskedScene, Mosaic, PipelineResult, BAND_COUNT};
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// How a pixel value is chosen among the valid observations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionPolicy {
    /// Least cloudy scene, then most recent, then scene id
    #[default]
    LowestCloudCover,
    /// Most recent scene, then least cloudy, then scene id
    MostRecent,
    /// Per-band median of every valid observation
    Median,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositeConfig {
    pub policy: SelectionPolicy,
}

/// Scene resampled onto the reference grid by nearest neighbour
struct Sampler<'a> {
    scene: &'a MaskedScene,
    /// Scene row for every reference row, if inside the scene
    rows: Vec<Option<usize>>,
    cols: Vec<Option<usize>>,
}

impl<'a> Sampler<'a> {
    fn new(scene: &'a MaskedScene, grid: &GridSpec) -> Self {
        let src = &scene.scene.grid;
        let (sgt, rgt) = (&src.geo_transform, &grid.geo_transform);
        Self {
            scene,
            rows: axis_map(grid.height, rgt.top_left_y, rgt.pixel_height, sgt.top_left_y, sgt.pixel_height, src.height),
            cols: axis_map(grid.width, rgt.top_left_x, rgt.pixel_width, sgt.top_left_x, sgt.pixel_width, src.width),
        }
    }

    /// Band values at a reference pixel, if the scene has a valid observation there
    fn sample(&self, row: usize, col: usize, out: &mut [f32; BAND_COUNT]) -> bool {
        let (Some(r), Some(c)) = (self.rows[row], self.cols[col]) else {
            return false;
        };
        if !self.scene.is_valid(r, c) {
            return false;
        }
        for (b, v) in out.iter_mut().enumerate() {
            *v = self.scene.scene.bands[[b, r, c]];
        }
        out.iter().all(|v| v.is_finite())
    }
}

/// Source index of every target pixel centre along one axis
fn axis_map(
    target_len: usize,
    target_origin: f64,
    target_step: f64,
    source_origin: f64,
    source_step: f64,
    source_len: usize,
) -> Vec<Option<usize>> {
    (0..target_len)
        .map(|i| {
            let coord = target_origin + (i as f64 + 0.5) * target_step;
            let idx = ((coord - source_origin) / source_step).floor();
            (idx >= 0.0 && idx < source_len as f64).then_some(idx as usize)
        })
        .collect()
}

pub struct Compositor {
    config: CompositeConfig,
}

impl Compositor {
    pub fn new(config: CompositeConfig) -> Self {
        Self { config }
    }

    /// Priority order between two scenes; a total order for every policy
    fn priority(&self, a: &MaskedScene, b: &MaskedScene) -> Ordering {
        let (ma, mb) = (&a.scene.metadata, &b.scene.metadata);
        let cloud = ma.cloud_cover.total_cmp(&mb.cloud_cover);
        let recency = mb.acquisition_date.cmp(&ma.acquisition_date);
        let primary = match self.config.policy {
            SelectionPolicy::MostRecent => recency.then(cloud),
            SelectionPolicy::LowestCloudCover | SelectionPolicy::Median => cloud.then(recency),
        };
        primary.then_with(|| ma.scene_id.cmp(&mb.scene_id))
    }

    /// Composite one season year.
    ///
    /// Returns `None` when no scene overlaps the grid. Pixels without a valid
    /// observation carry NaN bands and a zero contributor count.
    pub fn composite(&self, year: i32, scenes: &[MaskedScene], grid: &GridSpec) -> Option<Mosaic> {
        let grid_bounds = grid.bounds();
        let mut usable: Vec<&MaskedScene> = scenes
            .iter()
            .filter(|s| {
                let sg = &s.scene.grid;
                if sg.epsg != grid.epsg {
                    log::warn!(
                        "Scene {} is in EPSG:{}, reference grid is EPSG:{}; skipped",
                        s.scene.id(),
                        sg.epsg,
                        grid.epsg
                    );
                    return false;
                }
                if !sg.geo_transform.is_axis_aligned() {
                    log::warn!("Scene {} has a rotated geotransform; skipped", s.scene.id());
                    return false;
                }
                if s.scene.bands.dim().0 != BAND_COUNT {
                    log::warn!("Scene {} does not carry {} bands; skipped", s.scene.id(), BAND_COUNT);
                    return false;
                }
                sg.bounds().intersects(&grid_bounds)
            })
            .collect();

        if usable.is_empty() {
            log::info!("Year {}: no scenes overlap the reference grid", year);
            return None;
        }
        usable.sort_by(|a, b| self.priority(a, b));
        usable.dedup_by(|a, b| a.scene.id() == b.scene.id());

        let samplers: Vec<Sampler<'_>> = usable.iter().map(|s| Sampler::new(s, grid)).collect();
        let (rows, cols) = grid.shape();
        log::debug!("Year {}: compositing {} scenes onto {}x{} ({:?})", year, samplers.len(), cols, rows, self.config.policy);

        let row_results: Vec<(Vec<f32>, Vec<u16>)> = (0..rows)
            .into_par_iter()
            .map(|r| self.composite_row(&samplers, r, cols))
            .collect();

        let mut bands = Array3::from_elem((BAND_COUNT, rows, cols), f32::NAN);
        let mut contributors = Array2::zeros((rows, cols));
        for (r, (values, counts)) in row_results.into_iter().enumerate() {
            for c in 0..cols {
                contributors[[r, c]] = counts[c];
                for b in 0..BAND_COUNT {
                    bands[[b, r, c]] = values[b * cols + c];
                }
            }
        }

        Some(Mosaic { year, grid: *grid, bands, contributors })
    }

    /// One output row laid out band-major, plus per-pixel contributor counts
    fn composite_row(&self, samplers: &[Sampler<'_>], row: usize, cols: usize) -> (Vec<f32>, Vec<u16>) {
        let mut values = vec![f32::NAN; BAND_COUNT * cols];
        let mut counts = vec![0u16; cols];
        let mut px = [0.0f32; BAND_COUNT];
        let mut stack: Vec<[f32; BAND_COUNT]> = Vec::with_capacity(samplers.len());

        for c in 0..cols {
            stack.clear();
            for sampler in samplers {
                if sampler.sample(row, c, &mut px) {
                    stack.push(px);
                }
            }
            counts[c] = u16::try_from(stack.len()).unwrap_or(u16::MAX);

            if self.config.policy == SelectionPolicy::Median {
                let mut band_values = Vec::with_capacity(stack.len());
                for b in 0..BAND_COUNT {
                    band_values.clear();
                    band_values.extend(stack.iter().map(|p| p[b]));
                    if let Some(m) = median(&mut band_values) {
                        values[b * cols + c] = m;
                    }
                }
            } else if let Some(best) = stack.first() {
                // Samplers are in priority order
                for b in 0..BAND_COUNT {
                    values[b * cols + c] = best[b];
                }
            }
        }
        (values, counts)
    }

    /// Composite every year in `years` from the masked scenes in the cache.
    ///
    /// A cached mosaic is reused only while the masked entries grouped into
    /// its year are exactly the ones it was built from.
    pub fn run(&self, ctx: &RunContext, years: &YearRange, window: &DateWindow) -> PipelineResult<StageCounts> {
        let mut by_year: BTreeMap<i32, Vec<(String, String)>> = BTreeMap::new();
        for subject in ctx.cache.list_subjects(Stage::Masked)? {
            let record = match ctx.cache.read_record(&CacheKey::scene(Stage::Masked, &subject)) {
                Ok(record) => record,
                Err(e) => {
                    log::warn!("Unreadable masked entry {}: {}", subject, e);
                    continue;
                }
            };
            let Some(metadata) = &record.scene else {
                continue;
            };
            if let Some(year) = window.season_year(metadata.acquisition_date) {
                let tag = input_tag(&subject, &record);
                by_year.entry(year).or_default().push((subject, tag));
            }
        }

        let mut counts = StageCounts::default();
        for year in years.iter() {
            ctx.check_cancelled()?;
            let key = CacheKey::year(Stage::Mosaic, year);
            let group = by_year.get(&year).map(Vec::as_slice).unwrap_or_default();
            let expected: Vec<String> = group.iter().map(|(_, tag)| tag.clone()).collect();
            if ctx.cache.is_current(&key, &expected) {
                counts.cached += 1;
                continue;
            }
            if ctx.cache.contains(&key) {
                log::info!("Year {}: masked scenes changed, recompositing", year);
            }

            let mut scenes = Vec::new();
            let mut inputs = Vec::new();
            for (subject, tag) in group {
                match ctx.cache.load_masked(subject) {
                    Ok(scene) => {
                        scenes.push(scene);
                        inputs.push(tag.clone());
                    }
                    Err(e) => {
                        log::warn!("Cannot load masked scene {}: {}", subject, e);
                        counts.failed += 1;
                    }
                }
            }

            let mosaic = match self.composite(year, &scenes, &ctx.reference_grid) {
                Some(m) if m.valid_pixels() > 0 => m,
                _ => {
                    log::warn!("Year {}: no valid observations, no mosaic produced", year);
                    if ctx.cache.remove(&key)? {
                        log::info!("Year {}: dropped mosaic built from scenes no longer present", year);
                    }
                    counts.empty += 1;
                    continue;
                }
            };
            log::info!(
                "Year {}: mosaic from {} scenes, {} of {} pixels valid",
                year,
                scenes.len(),
                mosaic.valid_pixels(),
                ctx.reference_grid.pixel_count()
            );
            match ctx.cache.put_mosaic(&mosaic, inputs) {
                Ok(WriteOutcome::Written | WriteOutcome::Replaced) => counts.produced += 1,
                Ok(WriteOutcome::AlreadyPresent) => counts.cached += 1,
                Err(e) => {
                    log::warn!("Year {}: mosaic not stored: {}", year, e);
                    counts.failed += 1;
                }
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, GeoTransform, Mask, MaskClass, Scene, SceneMetadata};
    use chrono::NaiveDate;

    fn grid() -> GridSpec {
        GridSpec::new(4, 3, GeoTransform::north_up(600_000.0, 7_900_000.0, 10.0), 32605)
    }

    fn masked(id: &str, day: u32, cloud: f32, value: f32, valid: MaskClass) -> MaskedScene {
        let g = grid();
        let scene = Scene {
            metadata: SceneMetadata {
                scene_id: id.to_string(),
                acquisition_date: NaiveDate::from_ymd_opt(2020, 8, day).unwrap(),
                footprint: BoundingBox::new(-150.0, 70.0, -149.0, 71.0),
                cloud_cover: cloud,
            },
            grid: g,
            bands: Array3::from_elem((BAND_COUNT, g.height, g.width), value),
        };
        let mask = Mask { grid: g, classes: Array2::from_elem(g.shape(), valid) };
        MaskedScene::new(scene, mask).unwrap()
    }

    #[test]
    fn test_lowest_cloud_cover_wins() {
        let scenes = vec![
            masked("a", 5, 30.0, 100.0, MaskClass::Valid),
            masked("b", 6, 10.0, 200.0, MaskClass::Valid),
            masked("c", 7, 1.0, 300.0, MaskClass::Cloud),
        ];
        let m = Compositor::new(CompositeConfig::default()).composite(2020, &scenes, &grid()).unwrap();
        assert!(m.bands.iter().all(|v| *v == 200.0));
        assert!(m.contributors.iter().all(|n| *n == 2));
    }

    #[test]
    fn test_ties_break_on_recency_then_id() {
        let scenes = vec![
            masked("b", 5, 10.0, 1.0, MaskClass::Valid),
            masked("c", 9, 10.0, 2.0, MaskClass::Valid),
            masked("a", 9, 10.0, 3.0, MaskClass::Valid),
        ];
        let m = Compositor::new(CompositeConfig::default()).composite(2020, &scenes, &grid()).unwrap();
        assert_eq!(m.bands[[0, 0, 0]], 3.0);
    }

    #[test]
    fn test_order_independent() {
        let mut scenes = vec![
            masked("x", 3, 12.0, 10.0, MaskClass::Valid),
            masked("y", 4, 12.0, 20.0, MaskClass::Valid),
            masked("z", 4, 5.0, 30.0, MaskClass::Shadow),
        ];
        let compositor = Compositor::new(CompositeConfig::default());
        let first = compositor.composite(2020, &scenes, &grid()).unwrap();
        scenes.reverse();
        let second = compositor.composite(2020, &scenes, &grid()).unwrap();
        assert_eq!(
            first.bands.iter().map(|v| v.to_bits()).collect::<Vec<_>>(),
            second.bands.iter().map(|v| v.to_bits()).collect::<Vec<_>>()
        );
        assert_eq!(first.contributors, second.contributors);
    }

    #[test]
    fn test_no_valid_scene_is_nodata_not_zero() {
        let scenes = vec![masked("a", 5, 1.0, 100.0, MaskClass::Cloud)];
        let m = Compositor::new(CompositeConfig::default()).composite(2020, &scenes, &grid()).unwrap();
        assert_eq!(m.valid_pixels(), 0);
        assert!(m.is_nodata(1, 1));
        assert!(m.bands.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_median_policy() {
        let scenes = vec![
            masked("a", 5, 1.0, 100.0, MaskClass::Valid),
            masked("b", 6, 2.0, 400.0, MaskClass::Valid),
            masked("c", 7, 3.0, 200.0, MaskClass::Valid),
            masked("d", 8, 4.0, 300.0, MaskClass::Valid),
        ];
        let config = CompositeConfig { policy: SelectionPolicy::Median };
        let m = Compositor::new(config).composite(2020, &scenes, &grid()).unwrap();
        assert_eq!(m.bands[[3, 2, 1]], 250.0);
        assert_eq!(m.contributors[[2, 1]], 4);
    }

    #[test]
    fn test_offset_scene_is_resampled() {
        // Scene shifted one pixel east: reference column 0 falls outside it
        let mut s = masked("a", 5, 1.0, 100.0, MaskClass::Valid);
        s.scene.grid.geo_transform.top_left_x += 10.0;
        s.mask.grid = s.scene.grid;
        let m = Compositor::new(CompositeConfig::default()).composite(2020, &[s], &grid()).unwrap();
        assert!(m.is_nodata(0, 0));
        assert_eq!(m.bands[[0, 0, 1]], 100.0);
        assert_eq!(m.valid_pixels(), 9);
    }

    #[test]
    fn test_foreign_crs_is_skipped() {
        let mut s = masked("a", 5, 1.0, 100.0, MaskClass::Valid);
        s.scene.grid.epsg = 4326;
        s.mask.grid = s.scene.grid;
        assert!(Compositor::new(CompositeConfig::default()).composite(2020, &[s], &grid()).is_none());
    }

    #[test]
    fn test_run_counts_unstored_mosaic_as_failed() {
        use crate::io::TileCache;

        let dir = tempfile::TempDir::new().unwrap();
        let cache = TileCache::open(dir.path()).unwrap();
        cache.put_masked(&masked("a", 5, 10.0, 800.0, MaskClass::Valid)).unwrap();
        std::fs::remove_dir_all(dir.path().join("mosaic")).unwrap();
        std::fs::write(dir.path().join("mosaic"), b"").unwrap();

        let ctx = RunContext::new(cache, grid(), BoundingBox::new(-150.0, 70.0, -149.0, 71.0));
        let years = YearRange::new(2020, 2020).unwrap();
        let counts = Compositor::new(CompositeConfig::default())
            .run(&ctx, &years, &DateWindow::default())
            .unwrap();
        assert_eq!((counts.produced, counts.failed), (0, 1));
    }

    #[test]
    fn test_run_recomposites_when_a_scene_arrives() {
        use crate::io::TileCache;

        let dir = tempfile::TempDir::new().unwrap();
        let cache = TileCache::open(dir.path()).unwrap();
        cache.put_masked(&masked("late", 20, 30.0, 800.0, MaskClass::Valid)).unwrap();
        let ctx = RunContext::new(cache, grid(), BoundingBox::new(-150.0, 70.0, -149.0, 71.0));
        let years = YearRange::new(2020, 2020).unwrap();
        let window = DateWindow::default();
        let compositor = Compositor::new(CompositeConfig::default());

        assert_eq!(compositor.run(&ctx, &years, &window).unwrap().produced, 1);
        assert_eq!(compositor.run(&ctx, &years, &window).unwrap().cached, 1);

        ctx.cache.put_masked(&masked("clearer", 4, 2.0, 1200.0, MaskClass::Valid)).unwrap();
        let counts = compositor.run(&ctx, &years, &window).unwrap();
        assert_eq!((counts.produced, counts.cached), (1, 0));
        let mosaic = ctx.cache.load_mosaic(2020).unwrap();
        assert_eq!(mosaic.bands[[0, 0, 0]], 1200.0);
        assert!(mosaic.contributors.iter().all(|n| *n == 2));
    }
}
