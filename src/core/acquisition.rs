use crate::core::context::RunContext;
use crate::io::cache::{CacheKey, Stage, WriteOutcome};
use crate::io::catalog::SceneCatalog;
use crate::io::TileCache;
use crate::types::{BoundingBox, GridSpec, PipelineError, PipelineResult, Scene, SceneMetadata};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Calendar month and day, written `MM-DD`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MonthDay {
    pub month: u32,
    pub day: u32,
}

impl MonthDay {
    pub fn new(month: u32, day: u32) -> PipelineResult<Self> {
        // 2000 is a leap year, so 02-29 is accepted here
        NaiveDate::from_ymd_opt(2000, month, day)
            .map(|_| Self { month, day })
            .ok_or_else(|| PipelineError::InvalidConfig(format!("invalid month-day {:02}-{:02}", month, day)))
    }

    /// Date in `year`; 02-29 falls back to 02-28 outside leap years
    pub fn in_year(&self, year: i32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(year, self.month, self.day).or_else(|| NaiveDate::from_ymd_opt(year, 2, 28))
    }
}

impl std::str::FromStr for MonthDay {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PipelineError::InvalidConfig(format!("expected MM-DD, got '{}'", s));
        let (m, d) = s.trim().split_once('-').ok_or_else(invalid)?;
        let month = m.parse().map_err(|_| invalid())?;
        let day = d.parse().map_err(|_| invalid())?;
        Self::new(month, day)
    }
}

impl TryFrom<String> for MonthDay {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MonthDay> for String {
    fn from(value: MonthDay) -> Self {
        value.to_string()
    }
}

impl std::fmt::Display for MonthDay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}-{:02}", self.month, self.day)
    }
}

/// Recurring seasonal window.
///
/// A window whose end precedes its start (e.g. `12-01`..`02-28`) wraps into
/// the following calendar year and belongs to the year it starts in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: MonthDay,
    pub end: MonthDay,
}

impl DateWindow {
    pub fn parse(start: &str, end: &str) -> PipelineResult<Self> {
        Ok(Self { start: start.parse()?, end: end.parse()? })
    }

    pub fn wraps_year(&self) -> bool {
        self.end < self.start
    }

    /// Inclusive date range of the window starting in `year`
    pub fn for_year(&self, year: i32) -> Option<(NaiveDate, NaiveDate)> {
        let end_year = if self.wraps_year() { year.checked_add(1)? } else { year };
        Some((self.start.in_year(year)?, self.end.in_year(end_year)?))
    }

    /// Season year a date belongs to, if it falls inside any window
    pub fn season_year(&self, date: NaiveDate) -> Option<i32> {
        [date.year(), date.year() - 1].into_iter().find(|year| {
            self.for_year(*year)
                .map(|(start, end)| date >= start && date <= end)
                .unwrap_or(false)
        })
    }
}

impl Default for DateWindow {
    fn default() -> Self {
        Self {
            start: MonthDay { month: 8, day: 1 },
            end: MonthDay { month: 8, day: 31 },
        }
    }
}

/// Inclusive range of season years
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearRange {
    pub start: i32,
    pub end: i32,
}

impl YearRange {
    pub fn new(start: i32, end: i32) -> PipelineResult<Self> {
        let range = Self { start, end };
        range.validate()?;
        Ok(range)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.start > self.end {
            return Err(PipelineError::InvalidConfig(format!(
                "year range {}..={} is empty",
                self.start, self.end
            )));
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = i32> {
        self.start..=self.end
    }

    pub fn contains(&self, year: i32) -> bool {
        (self.start..=self.end).contains(&year)
    }
}

impl Default for YearRange {
    fn default() -> Self {
        Self { start: 2017, end: 2025 }
    }
}

/// Acquisition parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub window: DateWindow,
    pub years: YearRange,
    /// Concurrent fetches
    pub workers: usize,
    /// Attempts per request, including the first
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on every further attempt
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Scenes above this cloud cover (percent) are rejected before download
    pub max_cloud_cover: f32,
    /// Minimum fraction of the area of interest a footprint must cover
    pub min_aoi_coverage: f64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            window: DateWindow::default(),
            years: YearRange::default(),
            workers: 4,
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            max_cloud_cover: 70.0,
            min_aoi_coverage: 0.4,
        }
    }
}

impl AcquisitionConfig {
    pub fn validate(&self) -> PipelineResult<()> {
        self.years.validate()?;
        if self.workers == 0 {
            return Err(PipelineError::InvalidConfig("acquisition needs at least one worker".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(PipelineError::InvalidConfig("max_attempts must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.min_aoi_coverage) {
            return Err(PipelineError::InvalidConfig(format!(
                "min_aoi_coverage {} outside 0..=1",
                self.min_aoi_coverage
            )));
        }
        Ok(())
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base: Duration::from_millis(self.backoff_base_ms),
            max: Duration::from_millis(self.backoff_max_ms),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_attempts: u32,
    base: Duration,
    max: Duration,
}

impl RetryPolicy {
    /// Backoff before attempt `attempt + 1`
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Scene that could not be acquired
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedScene {
    pub scene_id: String,
    pub attempts: u32,
    pub reason: String,
}

/// Outcome of one acquisition run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionManifest {
    /// Downloaded and cached by this run
    pub fetched: Vec<String>,
    /// Already cached (or being fetched by another run)
    pub skipped: Vec<String>,
    /// Filtered by cloud cover, area-of-interest coverage or date
    pub rejected: Vec<String>,
    pub failed: Vec<FailedScene>,
    /// Season years whose catalog search failed
    pub failed_windows: Vec<i32>,
    pub cancelled: bool,
}

impl AcquisitionManifest {
    /// Scenes present in the cache after the run
    pub fn available(&self) -> usize {
        self.fetched.len() + self.skipped.len()
    }

    fn finalize(&mut self) {
        self.fetched.sort();
        self.skipped.sort();
        self.rejected.sort();
        self.failed.sort_by(|a, b| a.scene_id.cmp(&b.scene_id));
        self.failed_windows.sort_unstable();
    }
}

/// Scene ids currently being fetched
#[derive(Debug, Default)]
struct InFlight {
    ids: Mutex<HashSet<String>>,
}

impl InFlight {
    fn claim(self: &Arc<Self>, scene_id: &str) -> Option<InFlightClaim> {
        let mut ids = self.ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        ids.insert(scene_id.to_string()).then(|| InFlightClaim {
            registry: Arc::clone(self),
            scene_id: scene_id.to_string(),
        })
    }
}

/// Released when the fetch task finishes
struct InFlightClaim {
    registry: Arc<InFlight>,
    scene_id: String,
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        let mut ids = self.registry.ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        ids.remove(&self.scene_id);
    }
}

enum FetchOutcome {
    Fetched(String),
    AlreadyCached(String),
    Failed(FailedScene),
    Cancelled(String),
}

/// Downloads raw scenes for every season year into the tile cache
pub struct AcquisitionOrchestrator<C: SceneCatalog + 'static> {
    catalog: Arc<C>,
    config: AcquisitionConfig,
    in_flight: Arc<InFlight>,
}

impl<C: SceneCatalog + 'static> AcquisitionOrchestrator<C> {
    pub fn new(catalog: Arc<C>, config: AcquisitionConfig) -> PipelineResult<Self> {
        config.validate()?;
        Ok(Self {
            catalog,
            config,
            in_flight: Arc::new(InFlight::default()),
        })
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    /// Search every season window and fetch what the cache is missing.
    ///
    /// Per-scene failures land in the manifest. Only a catalog that fails
    /// every window search is an error.
    pub fn run(&self, ctx: &RunContext) -> PipelineResult<AcquisitionManifest> {
        log::info!(
            "Acquiring scenes for {}..{} in {}..={} with {} workers",
            self.config.window.start,
            self.config.window.end,
            self.config.years.start,
            self.config.years.end,
            self.config.workers
        );

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.config.workers)
            .max_blocking_threads(self.config.workers)
            .thread_name("terratrend-fetch")
            .enable_time()
            .build()?;

        let mut manifest = runtime.block_on(self.run_async(ctx))?;
        manifest.finalize();

        log::info!(
            "Acquisition finished: {} fetched, {} skipped, {} rejected, {} failed",
            manifest.fetched.len(),
            manifest.skipped.len(),
            manifest.rejected.len(),
            manifest.failed.len()
        );
        Ok(manifest)
    }

    async fn run_async(&self, ctx: &RunContext) -> PipelineResult<AcquisitionManifest> {
        let mut manifest = AcquisitionManifest::default();
        let candidates = self.collect_candidates(ctx, &mut manifest).await?;

        let semaphore = Arc::new(Semaphore::new(self.config.workers));
        let mut tasks = JoinSet::new();

        for (scene_id, metadata) in candidates {
            if ctx.cache.contains(&CacheKey::scene(Stage::Raw, &scene_id)) {
                log::debug!("Scene {} already cached, skipping", scene_id);
                manifest.skipped.push(scene_id);
                continue;
            }
            let Some(claim) = self.in_flight.claim(&scene_id) else {
                log::debug!("Scene {} is already being fetched", scene_id);
                manifest.skipped.push(scene_id);
                continue;
            };

            let catalog = Arc::clone(&self.catalog);
            let semaphore = Arc::clone(&semaphore);
            let policy = self.config.retry_policy();
            let ctx = ctx.clone();
            tasks.spawn(async move {
                let _claim = claim;
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return FetchOutcome::Cancelled(metadata.scene_id);
                };
                if ctx.cancel.is_cancelled() {
                    return FetchOutcome::Cancelled(metadata.scene_id);
                }
                fetch_and_store(catalog, ctx.cache, ctx.reference_grid, metadata, policy).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(FetchOutcome::Fetched(id)) => manifest.fetched.push(id),
                Ok(FetchOutcome::AlreadyCached(id)) => manifest.skipped.push(id),
                Ok(FetchOutcome::Failed(failure)) => manifest.failed.push(failure),
                Ok(FetchOutcome::Cancelled(id)) => {
                    log::debug!("Fetch of {} not started: run cancelled", id);
                    manifest.cancelled = true;
                }
                Err(e) => log::error!("Fetch task aborted: {}", e),
            }
        }

        Ok(manifest)
    }

    /// Search each window and screen the results; scene ids are deduplicated
    async fn collect_candidates(
        &self,
        ctx: &RunContext,
        manifest: &mut AcquisitionManifest,
    ) -> PipelineResult<BTreeMap<String, SceneMetadata>> {
        let mut candidates = BTreeMap::new();
        let mut searched = 0usize;
        let mut last_error = None;

        for year in self.config.years.iter() {
            let Some((start, end)) = self.config.window.for_year(year) else {
                log::warn!("Window {}..{} has no dates in {}", self.config.window.start, self.config.window.end, year);
                manifest.failed_windows.push(year);
                continue;
            };

            match self.search_with_retry(ctx.area_of_interest, start, end).await {
                Ok(found) => {
                    searched += 1;
                    log::info!("Year {}: {} candidate scenes ({} to {})", year, found.len(), start, end);
                    for metadata in found {
                        self.screen(year, metadata, &ctx.area_of_interest, manifest, &mut candidates);
                    }
                }
                Err(e) => {
                    log::warn!("Catalog search for {} failed: {}", year, e);
                    manifest.failed_windows.push(year);
                    last_error = Some(e);
                }
            }
        }

        if searched == 0 {
            let reason = last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no searchable windows".to_string());
            return Err(PipelineError::CatalogUnavailable(reason));
        }
        Ok(candidates)
    }

    fn screen(
        &self,
        year: i32,
        metadata: SceneMetadata,
        area_of_interest: &BoundingBox,
        manifest: &mut AcquisitionManifest,
        candidates: &mut BTreeMap<String, SceneMetadata>,
    ) {
        // Each id is screened once, whichever window returned it first
        let id = &metadata.scene_id;
        if candidates.contains_key(id) || manifest.rejected.contains(id) || manifest.failed.iter().any(|f| &f.scene_id == id) {
            return;
        }
        if let Err(e) = metadata.validate() {
            log::warn!("Skipping malformed catalog record: {}", e);
            manifest.failed.push(FailedScene {
                scene_id: metadata.scene_id,
                attempts: 0,
                reason: e.to_string(),
            });
            return;
        }
        match self.config.window.season_year(metadata.acquisition_date) {
            // Accepted whichever year's search returned it
            Some(season) if self.config.years.contains(season) => {}
            _ => {
                log::debug!(
                    "Scene {} dated {} is outside the {} window",
                    metadata.scene_id,
                    metadata.acquisition_date,
                    year
                );
                manifest.rejected.push(metadata.scene_id);
                return;
            }
        }
        if metadata.cloud_cover > self.config.max_cloud_cover {
            log::debug!("Scene {} rejected: cloud cover {:.1}%", metadata.scene_id, metadata.cloud_cover);
            manifest.rejected.push(metadata.scene_id);
            return;
        }
        let coverage = metadata.footprint.coverage_of(area_of_interest);
        if coverage < self.config.min_aoi_coverage {
            log::debug!("Scene {} rejected: covers {:.1}% of the area of interest", metadata.scene_id, coverage * 100.0);
            manifest.rejected.push(metadata.scene_id);
            return;
        }
        candidates.insert(metadata.scene_id.clone(), metadata);
    }

    async fn search_with_retry(
        &self,
        footprint: BoundingBox,
        start: NaiveDate,
        end: NaiveDate,
    ) -> PipelineResult<Vec<SceneMetadata>> {
        let policy = self.config.retry_policy();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let catalog = Arc::clone(&self.catalog);
            let result = tokio::task::spawn_blocking(move || catalog.search(&footprint, start, end))
                .await
                .unwrap_or_else(|e| Err(PipelineError::Processing(format!("search worker failed: {}", e))));
            match result {
                Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                    let delay = policy.delay(attempt);
                    log::warn!("Search attempt {} failed ({}), retrying in {:?}", attempt, e, delay);
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

async fn fetch_and_store<C: SceneCatalog + 'static>(
    catalog: Arc<C>,
    cache: TileCache,
    reference: GridSpec,
    metadata: SceneMetadata,
    policy: RetryPolicy,
) -> FetchOutcome {
    let scene_id = metadata.scene_id.clone();
    let mut attempt = 0;
    loop {
        attempt += 1;
        let worker_catalog = Arc::clone(&catalog);
        let id = scene_id.clone();
        let fetched = tokio::task::spawn_blocking(move || worker_catalog.fetch(&id))
            .await
            .unwrap_or_else(|e| Err(PipelineError::Processing(format!("fetch worker failed: {}", e))));

        match fetched {
            Ok(raster) => {
                let stored = tokio::task::spawn_blocking(move || {
                    let scene = Scene::from_raw(metadata, raster, &reference)?;
                    cache.put_scene(&scene)
                })
                .await
                .unwrap_or_else(|e| Err(PipelineError::Processing(format!("cache worker failed: {}", e))));

                return match stored {
                    Ok(WriteOutcome::Written | WriteOutcome::Replaced) => {
                        log::info!("Fetched scene {} (attempt {})", scene_id, attempt);
                        FetchOutcome::Fetched(scene_id)
                    }
                    Ok(WriteOutcome::AlreadyPresent) => FetchOutcome::AlreadyCached(scene_id),
                    Err(e) => {
                        log::warn!("Scene {} not stored: {}", scene_id, e);
                        FetchOutcome::Failed(FailedScene { scene_id, attempts: attempt, reason: e.to_string() })
                    }
                };
            }
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay(attempt);
                log::warn!("Fetch of {} failed on attempt {} ({}), retrying in {:?}", scene_id, attempt, e, delay);
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                log::warn!("Giving up on scene {} after {} attempt(s): {}", scene_id, attempt, e);
                return FetchOutcome::Failed(FailedScene { scene_id, attempts: attempt, reason: e.to_string() });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_month_day_parsing() {
        let md: MonthDay = "08-01".parse().unwrap();
        assert_eq!(md, MonthDay { month: 8, day: 1 });
        assert_eq!(md.to_string(), "08-01");
        assert!("13-01".parse::<MonthDay>().is_err());
        assert!("0801".parse::<MonthDay>().is_err());
        assert!("02-30".parse::<MonthDay>().is_err());
    }

    #[test]
    fn test_leap_day_clamps_outside_leap_years() {
        let window = DateWindow::parse("02-01", "02-29").unwrap();
        let (_, end) = window.for_year(2021).unwrap();
        assert_eq!(end, NaiveDate::from_ymd_opt(2021, 2, 28).unwrap());
        let (_, end) = window.for_year(2020).unwrap();
        assert_eq!(end, NaiveDate::from_ymd_opt(2020, 2, 29).unwrap());
    }

    #[test]
    fn test_wrapping_window_belongs_to_start_year() {
        let window = DateWindow::parse("12-01", "02-28").unwrap();
        assert!(window.wraps_year());
        let (start, end) = window.for_year(2019).unwrap();
        assert_eq!(start, NaiveDate::from_ymd_opt(2019, 12, 1).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2020, 2, 28).unwrap());

        assert_eq!(window.season_year(NaiveDate::from_ymd_opt(2020, 1, 15).unwrap()), Some(2019));
        assert_eq!(window.season_year(NaiveDate::from_ymd_opt(2020, 12, 2).unwrap()), Some(2020));
        assert_eq!(window.season_year(NaiveDate::from_ymd_opt(2020, 6, 1).unwrap()), None);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base: Duration::from_millis(100),
            max: Duration::from_millis(350),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(350));
    }

    #[test]
    fn test_in_flight_claims_are_exclusive() {
        let registry = Arc::new(InFlight::default());
        let claim = registry.claim("S2A_1").unwrap();
        assert!(registry.claim("S2A_1").is_none());
        assert!(registry.claim("S2A_2").is_some());
        drop(claim);
        assert!(registry.claim("S2A_1").is_some());
    }

    #[test]
    fn test_config_rejects_zero_workers() {
        let config = AcquisitionConfig { workers: 0, ..Default::default() };
        assert!(matches!(config.validate(), Err(PipelineError::InvalidConfig(_))));
    }
}
