//! Fakes shared by the integration tests
#![allow(dead_code)]

use chrono::NaiveDate;
use ndarray::{Array2, Array3, ArrayView3, Axis};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use terratrend::core::{CloudClassifier, Device};
use terratrend::types::{BAND_COUNT, Band};
use terratrend::{BoundingBox, GeoTransform, GridSpec, MaskClass, PipelineError, PipelineResult, RawRaster, SceneCatalog, SceneMetadata};

pub const EPSG: u32 = 32605;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn reference_grid() -> GridSpec {
    GridSpec::new(4, 3, GeoTransform::north_up(600_000.0, 7_900_000.0, 10.0), EPSG)
}

pub fn area_of_interest() -> BoundingBox {
    BoundingBox::new(-150.0, 70.0, -149.0, 71.0)
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn metadata(id: &str, acquired: NaiveDate, cloud_cover: f32) -> SceneMetadata {
    SceneMetadata {
        scene_id: id.to_string(),
        acquisition_date: acquired,
        footprint: area_of_interest(),
        cloud_cover,
    }
}

/// Uniform raster whose NDVI is `ndvi`; `green` drives the fake classifier
pub fn raster_with_ndvi(ndvi: f32, green: f32) -> RawRaster {
    let grid = reference_grid();
    let red = 1000.0f32;
    let nir = red * (1.0 + ndvi) / (1.0 - ndvi);
    let mut bands = Array3::from_elem((BAND_COUNT, grid.height, grid.width), 600.0f32);
    bands.index_axis_mut(Axis(0), Band::Red.index()).fill(red);
    bands.index_axis_mut(Axis(0), Band::Nir.index()).fill(nir);
    bands.index_axis_mut(Axis(0), Band::Green.index()).fill(green);
    RawRaster { grid, bands }
}

/// Cloud wherever Green (second classifier band) is bright
pub struct BrightGreenIsCloud;

impl CloudClassifier for BrightGreenIsCloud {
    fn receptive_field(&self) -> usize {
        1
    }

    fn classify(&self, tile: ArrayView3<'_, f32>, _device: Device) -> anyhow::Result<Array2<MaskClass>> {
        Ok(tile
            .index_axis(Axis(0), 1)
            .mapv(|g| if g > 5000.0 { MaskClass::Cloud } else { MaskClass::Valid }))
    }
}

/// In-memory catalog with scripted failures
#[derive(Default)]
pub struct FakeCatalog {
    pub scenes: HashMap<String, (SceneMetadata, RawRaster)>,
    /// Extra copies returned by every search, to exercise deduplication
    pub duplicated: Vec<SceneMetadata>,
    /// Scene id -> transient failures before a fetch succeeds
    pub flaky: HashMap<String, usize>,
    pub permanent: HashSet<String>,
    /// Years whose search always fails transiently
    pub failing_years: HashSet<i32>,
    pub fetch_delay: Duration,
    pub attempts: Mutex<HashMap<String, usize>>,
    pub searches: AtomicUsize,
    pub in_progress: AtomicUsize,
    pub max_in_progress: AtomicUsize,
}

impl FakeCatalog {
    pub fn add(&mut self, metadata: SceneMetadata, raster: RawRaster) {
        self.scenes.insert(metadata.scene_id.clone(), (metadata, raster));
    }

    pub fn attempts(&self, id: &str) -> usize {
        self.attempts.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.attempts.lock().unwrap().values().sum()
    }
}

impl SceneCatalog for FakeCatalog {
    fn search(&self, footprint: &BoundingBox, start: NaiveDate, end: NaiveDate) -> PipelineResult<Vec<SceneMetadata>> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        if self.failing_years.contains(&chrono::Datelike::year(&start)) {
            return Err(PipelineError::TransientFetch("search timed out".to_string()));
        }
        let mut found: Vec<SceneMetadata> = self
            .scenes
            .values()
            .map(|(m, _)| m.clone())
            .chain(self.duplicated.iter().cloned())
            .filter(|m| m.acquisition_date >= start && m.acquisition_date <= end)
            .filter(|m| m.footprint.intersects(footprint))
            .collect();
        found.sort_by(|a, b| a.scene_id.cmp(&b.scene_id));
        Ok(found)
    }

    fn fetch(&self, scene_id: &str) -> PipelineResult<RawRaster> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let n = attempts.entry(scene_id.to_string()).or_insert(0);
            *n += 1;
            *n
        };

        let now = self.in_progress.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_progress.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(self.fetch_delay);
        self.in_progress.fetch_sub(1, Ordering::SeqCst);

        if self.permanent.contains(scene_id) {
            return Err(PipelineError::PermanentFetch(format!("{} is not an L2A product", scene_id)));
        }
        if attempt <= self.flaky.get(scene_id).copied().unwrap_or(0) {
            return Err(PipelineError::TransientFetch(format!("connection reset fetching {}", scene_id)));
        }
        self.scenes
            .get(scene_id)
            .map(|(_, raster)| raster.clone())
            .ok_or_else(|| PipelineError::PermanentFetch(format!("unknown scene {}", scene_id)))
    }
}
