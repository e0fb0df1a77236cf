mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use terratrend::core::{AcquisitionConfig, AcquisitionOrchestrator, DateWindow, YearRange};
use terratrend::io::Stage;
use terratrend::{BoundingBox, PipelineError, RunContext, TileCache};

fn config(start: i32, end: i32) -> AcquisitionConfig {
    AcquisitionConfig {
        window: DateWindow::parse("08-01", "08-31").unwrap(),
        years: YearRange::new(start, end).unwrap(),
        workers: 3,
        max_attempts: 3,
        backoff_base_ms: 1,
        backoff_max_ms: 4,
        ..Default::default()
    }
}

fn context(dir: &TempDir) -> RunContext {
    let cache = TileCache::open(dir.path()).unwrap();
    RunContext::new(cache, reference_grid(), area_of_interest())
}

#[test]
fn test_transient_failures_are_retried() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir);

    let mut catalog = FakeCatalog::default();
    catalog.add(metadata("flaky", date(2020, 8, 3), 10.0), raster_with_ndvi(0.4, 700.0));
    catalog.add(metadata("down", date(2020, 8, 9), 10.0), raster_with_ndvi(0.4, 700.0));
    catalog.flaky.insert("flaky".to_string(), 2);
    catalog.flaky.insert("down".to_string(), usize::MAX);
    let catalog = Arc::new(catalog);

    let orchestrator = AcquisitionOrchestrator::new(Arc::clone(&catalog), config(2020, 2020)).unwrap();
    let manifest = orchestrator.run(&ctx).unwrap();

    assert_eq!(manifest.fetched, vec!["flaky".to_string()]);
    assert_eq!(catalog.attempts("flaky"), 3);
    assert_eq!(manifest.failed.len(), 1);
    assert_eq!(manifest.failed[0].scene_id, "down");
    assert_eq!(manifest.failed[0].attempts, 3);
    assert_eq!(catalog.attempts("down"), 3);
    assert!(ctx.cache.load_scene("flaky").is_ok());
}

#[test]
fn test_permanent_failures_and_filters() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir);

    let mut catalog = FakeCatalog::default();
    catalog.add(metadata("good", date(2021, 8, 3), 10.0), raster_with_ndvi(0.4, 700.0));
    catalog.add(metadata("broken", date(2021, 8, 4), 10.0), raster_with_ndvi(0.4, 700.0));
    catalog.add(metadata("overcast", date(2021, 8, 5), 95.0), raster_with_ndvi(0.4, 700.0));
    catalog.add(metadata("malformed", date(2021, 8, 6), 140.0), raster_with_ndvi(0.4, 700.0));
    let mut sliver = metadata("sliver", date(2021, 8, 7), 5.0);
    sliver.footprint = BoundingBox::new(-150.0, 70.0, -149.9, 71.0);
    catalog.add(sliver, raster_with_ndvi(0.4, 700.0));
    catalog.permanent.insert("broken".to_string());
    let catalog = Arc::new(catalog);

    let manifest = AcquisitionOrchestrator::new(Arc::clone(&catalog), config(2021, 2021))
        .unwrap()
        .run(&ctx)
        .unwrap();

    assert_eq!(manifest.fetched, vec!["good".to_string()]);
    assert_eq!(manifest.rejected, vec!["overcast".to_string(), "sliver".to_string()]);
    let failed: Vec<(&str, u32)> = manifest.failed.iter().map(|f| (f.scene_id.as_str(), f.attempts)).collect();
    assert_eq!(failed, vec![("broken", 1), ("malformed", 0)]);
    assert_eq!(catalog.attempts("overcast"), 0);
    assert_eq!(catalog.attempts("malformed"), 0);
}

#[test]
fn test_wrong_band_count_is_unsupported_product() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir);

    let mut raster = raster_with_ndvi(0.4, 700.0);
    raster.bands = raster.bands.slice_move(ndarray::s![0..4, .., ..]);
    let mut catalog = FakeCatalog::default();
    catalog.add(metadata("four_band", date(2020, 8, 3), 10.0), raster);

    let manifest = AcquisitionOrchestrator::new(Arc::new(catalog), config(2020, 2020))
        .unwrap()
        .run(&ctx)
        .unwrap();
    assert!(manifest.fetched.is_empty());
    assert_eq!(manifest.failed[0].attempts, 1);
    assert!(ctx.cache.list_subjects(Stage::Raw).unwrap().is_empty());
}

#[test]
fn test_concurrency_is_bounded_and_ids_fetched_once() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir);

    let mut catalog = FakeCatalog { fetch_delay: Duration::from_millis(20), ..Default::default() };
    for i in 0..12 {
        catalog.add(metadata(&format!("S2_{:02}", i), date(2019, 8, 1 + i), 10.0), raster_with_ndvi(0.3, 700.0));
    }
    catalog.duplicated = vec![metadata("S2_03", date(2019, 8, 4), 10.0)];
    let catalog = Arc::new(catalog);

    let manifest = AcquisitionOrchestrator::new(Arc::clone(&catalog), config(2019, 2019))
        .unwrap()
        .run(&ctx)
        .unwrap();

    assert_eq!(manifest.fetched.len(), 12);
    assert_eq!(catalog.total_fetches(), 12);
    assert_eq!(catalog.attempts("S2_03"), 1);
    let peak = catalog.max_in_progress.load(std::sync::atomic::Ordering::SeqCst);
    println!("Peak concurrent fetches: {}", peak);
    assert!(peak <= 3, "peak {} exceeds the worker bound", peak);
}

#[test]
fn test_rerun_against_populated_cache_fetches_nothing() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir);

    let mut catalog = FakeCatalog::default();
    for (i, year) in [2018, 2019, 2020].iter().enumerate() {
        catalog.add(metadata(&format!("S2_{}", i), date(*year, 8, 10), 10.0), raster_with_ndvi(0.3, 700.0));
    }
    let catalog = Arc::new(catalog);
    let orchestrator = AcquisitionOrchestrator::new(Arc::clone(&catalog), config(2018, 2020)).unwrap();

    let first = orchestrator.run(&ctx).unwrap();
    assert_eq!(first.fetched.len(), 3);
    assert!(first.skipped.is_empty());

    let second = orchestrator.run(&ctx).unwrap();
    assert!(second.fetched.is_empty());
    assert_eq!(second.skipped, first.fetched);
    assert_eq!(catalog.total_fetches(), 3);

    let third = orchestrator.run(&ctx).unwrap();
    assert_eq!(third, second);
}

#[test]
fn test_failed_windows_and_total_unavailability() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir);

    let mut catalog = FakeCatalog::default();
    catalog.add(metadata("a", date(2020, 8, 10), 10.0), raster_with_ndvi(0.3, 700.0));
    catalog.failing_years.insert(2019);
    let catalog = Arc::new(catalog);

    let manifest = AcquisitionOrchestrator::new(Arc::clone(&catalog), config(2019, 2020))
        .unwrap()
        .run(&ctx)
        .unwrap();
    assert_eq!(manifest.failed_windows, vec![2019]);
    assert_eq!(manifest.fetched, vec!["a".to_string()]);

    let mut down = FakeCatalog::default();
    down.failing_years.extend([2019, 2020]);
    let down = Arc::new(down);
    let err = AcquisitionOrchestrator::new(Arc::clone(&down), config(2019, 2020))
        .unwrap()
        .run(&ctx)
        .unwrap_err();
    assert!(matches!(err, PipelineError::CatalogUnavailable(_)));
    // Every window retried up to max_attempts
    assert_eq!(down.searches.load(std::sync::atomic::Ordering::SeqCst), 6);
}

#[test]
fn test_cancelled_run_starts_no_fetch() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir);
    ctx.cancel.cancel();

    let mut catalog = FakeCatalog::default();
    catalog.add(metadata("a", date(2020, 8, 10), 10.0), raster_with_ndvi(0.3, 700.0));
    let catalog = Arc::new(catalog);

    let manifest = AcquisitionOrchestrator::new(Arc::clone(&catalog), config(2020, 2020))
        .unwrap()
        .run(&ctx)
        .unwrap();
    assert!(manifest.cancelled);
    assert!(manifest.fetched.is_empty());
    assert_eq!(catalog.total_fetches(), 0);
}

#[test]
fn test_repeated_catalog_records_are_reported_once() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir);

    let mut catalog = FakeCatalog::default();
    catalog.add(metadata("good", date(2021, 8, 3), 10.0), raster_with_ndvi(0.4, 700.0));
    catalog.add(metadata("overcast", date(2021, 8, 5), 95.0), raster_with_ndvi(0.4, 700.0));
    catalog.add(metadata("malformed", date(2021, 8, 6), 140.0), raster_with_ndvi(0.4, 700.0));
    catalog.duplicated = vec![
        metadata("overcast", date(2021, 8, 5), 95.0),
        metadata("malformed", date(2021, 8, 6), 140.0),
        metadata("good", date(2021, 8, 3), 10.0),
    ];
    let catalog = Arc::new(catalog);

    let manifest = AcquisitionOrchestrator::new(Arc::clone(&catalog), config(2021, 2021))
        .unwrap()
        .run(&ctx)
        .unwrap();

    assert_eq!(manifest.fetched, vec!["good".to_string()]);
    assert_eq!(manifest.rejected, vec!["overcast".to_string()]);
    let failed: Vec<&str> = manifest.failed.iter().map(|f| f.scene_id.as_str()).collect();
    assert_eq!(failed, vec!["malformed"]);
    assert_eq!(catalog.attempts("good"), 1);
}
