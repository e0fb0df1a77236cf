//! Persistence and external data sources

pub mod cache;
pub mod catalog;
pub mod codec;
#[cfg(feature = "gdal")]
pub mod geotiff;

pub use cache::{CacheKey, EntryRecord, Stage, TileCache, WriteOutcome};
pub use catalog::{LocalCatalog, SceneCatalog};
