//! Scene catalog interface and a local-directory implementation

use crate::types::{BoundingBox, PipelineError, PipelineResult, RawRaster, SceneMetadata};
use chrono::NaiveDate;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Remote (or local) source of scenes.
///
/// Implementations classify failures as `PipelineError::TransientFetch`
/// (network, timeout: retried) or `PipelineError::PermanentFetch`
/// (malformed metadata, unsupported product: skipped). Any other error
/// is treated as permanent.
pub trait SceneCatalog: Send + Sync {
    /// Scenes whose footprint intersects `footprint` and whose acquisition date is in `start..=end`
    fn search(&self, footprint: &BoundingBox, start: NaiveDate, end: NaiveDate) -> PipelineResult<Vec<SceneMetadata>>;

    /// Download the bands of one scene
    fn fetch(&self, scene_id: &str) -> PipelineResult<RawRaster>;
}

/// Catalog over a directory of `<scene_id>_<YYYY-MM-DD>.tif` rasters.
///
/// Each raster needs a `<stem>.json` sidecar holding its `SceneMetadata`.
/// Reading the rasters requires the `gdal` feature; searching does not.
#[derive(Debug, Clone)]
pub struct LocalCatalog {
    root: PathBuf,
    entries: BTreeMap<String, (SceneMetadata, PathBuf)>,
}

impl LocalCatalog {
    /// Index every raster with a well-formed name and sidecar under `root`
    pub fn scan<P: AsRef<Path>>(root: P) -> PipelineResult<Self> {
        let root = root.as_ref().to_path_buf();
        log::info!("Scanning scene directory: {}", root.display());

        let name_pattern = Regex::new(r"^(?P<id>.+)_(?P<date>\d{4}-\d{2}-\d{2})\.tif$")
            .map_err(|e| PipelineError::Processing(format!("Regex error: {}", e)))?;

        let mut entries = BTreeMap::new();
        for entry in fs::read_dir(&root)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(caps) = name_pattern.captures(name) else {
                continue;
            };

            let sidecar = path.with_extension("json");
            let metadata: SceneMetadata = match fs::read(&sidecar) {
                Ok(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(m) => m,
                    Err(e) => {
                        log::warn!("Skipping {}: malformed sidecar {}: {}", name, sidecar.display(), e);
                        continue;
                    }
                },
                Err(_) => {
                    log::warn!("Skipping {}: no metadata sidecar", name);
                    continue;
                }
            };

            let date_matches = metadata.acquisition_date.format("%Y-%m-%d").to_string() == caps["date"];
            if metadata.scene_id != caps["id"] || !date_matches {
                log::warn!(
                    "Skipping {}: sidecar describes {} ({})",
                    name,
                    metadata.scene_id,
                    metadata.acquisition_date
                );
                continue;
            }
            entries.insert(metadata.scene_id.clone(), (metadata, path));
        }

        log::info!("Found {} scenes in {}", entries.len(), root.display());
        Ok(Self { root, entries })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl SceneCatalog for LocalCatalog {
    fn search(&self, footprint: &BoundingBox, start: NaiveDate, end: NaiveDate) -> PipelineResult<Vec<SceneMetadata>> {
        if !self.root.is_dir() {
            return Err(PipelineError::TransientFetch(format!(
                "scene directory {} is not reachable",
                self.root.display()
            )));
        }
        let mut found: Vec<SceneMetadata> = self
            .entries
            .values()
            .filter(|(m, _)| m.acquisition_date >= start && m.acquisition_date <= end)
            .filter(|(m, _)| m.footprint.intersects(footprint))
            .map(|(m, _)| m.clone())
            .collect();
        found.sort_by(|a, b| a.acquisition_date.cmp(&b.acquisition_date).then_with(|| a.scene_id.cmp(&b.scene_id)));
        Ok(found)
    }

    fn fetch(&self, scene_id: &str) -> PipelineResult<RawRaster> {
        let (_, path) = self
            .entries
            .get(scene_id)
            .ok_or_else(|| PipelineError::PermanentFetch(format!("unknown scene {}", scene_id)))?;
        read_scene_raster(path)
    }
}

#[cfg(feature = "gdal")]
fn read_scene_raster(path: &Path) -> PipelineResult<RawRaster> {
    crate::io::geotiff::read_raster(path).map_err(|e| match e {
        PipelineError::Io(io) => PipelineError::TransientFetch(format!("{}: {}", path.display(), io)),
        other => PipelineError::PermanentFetch(format!("{}: {}", path.display(), other)),
    })
}

#[cfg(not(feature = "gdal"))]
fn read_scene_raster(path: &Path) -> PipelineResult<RawRaster> {
    Err(PipelineError::PermanentFetch(format!(
        "cannot read {}: GeoTIFF support requires the `gdal` feature",
        path.display()
    )))
}
