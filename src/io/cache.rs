//! On-disk tile cache shared by every stage.
//!
//! Entries live at `<root>/<stage>/<subject>/` and hold a JSON record plus a
//! gzip-compressed payload. An entry only becomes visible through an atomic
//! directory rename, so a crashed or cancelled writer never leaves a partial
//! entry behind. The first writer of a key wins; later writers are no-ops.
//!
//! Derived entries (mosaics, index rasters, trends) also record the inputs
//! they were computed from. Writing one whose inputs changed swaps the old
//! entry out for the new one instead of keeping it.

use crate::io::codec::{self, PayloadReader, PayloadWriter};
use crate::types::{
    GridSpec, IndexRaster, Mask, MaskClass, MaskedScene, Mosaic, PipelineError, PipelineResult, Scene,
    SceneMetadata, TrendQuality, TrendRaster, TrendRecord,
};
use chrono::{DateTime, Utc};
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const RECORD_FILE: &str = "record.json";
const PAYLOAD_FILE: &str = "payload.bin.gz";
const SUBJECT_HASH_LEN: usize = 8;

/// Processing stage an entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Raw,
    Masked,
    Mosaic,
    Index,
    Trend,
}

impl Stage {
    pub const ALL: [Stage; 5] = [Stage::Raw, Stage::Masked, Stage::Mosaic, Stage::Index, Stage::Trend];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Raw => "raw",
            Stage::Masked => "masked",
            Stage::Mosaic => "mosaic",
            Stage::Index => "index",
            Stage::Trend => "trend",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub stage: Stage,
    pub subject: String,
}

impl CacheKey {
    pub fn scene(stage: Stage, scene_id: &str) -> Self {
        Self { stage, subject: sanitize_subject(scene_id) }
    }

    pub fn year(stage: Stage, year: i32) -> Self {
        Self { stage, subject: year.to_string() }
    }

    /// Trend entries are keyed by the span of years they were fitted on
    pub fn trend(first_year: i32, last_year: i32) -> Self {
        Self { stage: Stage::Trend, subject: format!("{}-{}", first_year, last_year) }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.stage, self.subject)
    }
}

fn sanitize_subject(subject: &str) -> String {
    let mut cleaned: String = subject
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect();
    // Dot-prefixed names are reserved for staging directories
    if cleaned.is_empty() || cleaned.starts_with('.') {
        cleaned.insert(0, '_');
    }
    // Rewritten ids carry a hash of the raw id so distinct ids stay distinct
    if cleaned != subject {
        cleaned.push('-');
        cleaned.push_str(&codec::digest(subject.as_bytes())[..SUBJECT_HASH_LEN]);
    }
    cleaned
}

/// Small metadata record stored next to every payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub stage: Stage,
    pub grid: GridSpec,
    #[serde(default)]
    pub bands: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene: Option<SceneMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub years: Vec<i32>,
    /// Upstream entries this one was computed from, as `<subject>@<digest>`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
    pub payload_len: u64,
    pub digest: String,
    pub written_at: DateTime<Utc>,
}

impl EntryRecord {
    fn new(stage: Stage, grid: GridSpec) -> Self {
        Self {
            stage,
            grid,
            bands: 0,
            scene: None,
            year: None,
            years: Vec::new(),
            inputs: Vec::new(),
            payload_len: 0,
            digest: String::new(),
            written_at: Utc::now(),
        }
    }
}

/// Result of a cache write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// Key already held an entry (or a concurrent writer won); nothing was written
    AlreadyPresent,
    /// An entry computed from different inputs was swapped out
    Replaced,
}

/// Content store keyed by (subject, stage)
#[derive(Debug, Clone)]
pub struct TileCache {
    root: PathBuf,
}

impl TileCache {
    /// Open (and create if needed) a cache rooted at `root`
    pub fn open<P: AsRef<Path>>(root: P) -> PipelineResult<Self> {
        let root = root.as_ref().to_path_buf();
        for stage in Stage::ALL {
            fs::create_dir_all(root.join(stage.as_str()))?;
        }
        log::debug!("Tile cache opened at {}", root.display());
        Ok(Self { root })
    }

    /// Platform cache directory, falling back to the temp dir
    pub fn default_root() -> PathBuf {
        dirs::cache_dir().unwrap_or_else(std::env::temp_dir).join("terratrend")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.stage.as_str()).join(&key.subject)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entry_dir(key).join(RECORD_FILE).is_file()
    }

    /// Write an entry atomically; a key that already exists is left untouched
    pub fn put(&self, key: &CacheKey, record: EntryRecord, payload: &[u8]) -> PipelineResult<WriteOutcome> {
        if self.contains(key) {
            log::debug!("Cache entry {} already present, skipping write", key);
            return Ok(WriteOutcome::AlreadyPresent);
        }
        let staging = self.stage_entry(key, record, payload)?;
        self.publish(key, staging)
    }

    /// Swap in a new entry for `key`.
    ///
    /// The old entry is moved aside before the new one is renamed into place,
    /// so readers see either a complete entry or none at all.
    pub fn replace(&self, key: &CacheKey, record: EntryRecord, payload: &[u8]) -> PipelineResult<WriteOutcome> {
        let staging = self.stage_entry(key, record, payload)?;
        let retired = tempfile::Builder::new()
            .prefix(".retired-")
            .tempdir_in(self.root.join(key.stage.as_str()))?;
        match fs::rename(self.entry_dir(key), retired.path().join("entry")) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(PipelineError::Io(e)),
        }
        Ok(match self.publish(key, staging)? {
            WriteOutcome::Written => {
                log::debug!("Cache entry {} replaced", key);
                WriteOutcome::Replaced
            }
            other => other,
        })
    }

    /// Write a derived entry, replacing a stored one whose inputs differ
    fn put_derived(&self, key: &CacheKey, record: EntryRecord, payload: &[u8]) -> PipelineResult<WriteOutcome> {
        match self.read_record(key) {
            Ok(existing) if existing.inputs == record.inputs => {
                log::debug!("Cache entry {} is current, skipping write", key);
                Ok(WriteOutcome::AlreadyPresent)
            }
            Err(_) if !self.contains(key) => self.put(key, record, payload),
            _ => self.replace(key, record, payload),
        }
    }

    /// True when `key` holds an entry computed from exactly `inputs`
    pub fn is_current(&self, key: &CacheKey, inputs: &[String]) -> bool {
        self.read_record(key).map(|r| r.inputs == inputs).unwrap_or(false)
    }

    fn stage_entry(&self, key: &CacheKey, mut record: EntryRecord, payload: &[u8]) -> PipelineResult<tempfile::TempDir> {
        let stage_dir = self.root.join(key.stage.as_str());
        fs::create_dir_all(&stage_dir)?;
        let staging = tempfile::Builder::new().prefix(".staging-").tempdir_in(&stage_dir)?;

        record.payload_len = payload.len() as u64;
        record.digest = codec::digest(payload);
        fs::write(staging.path().join(PAYLOAD_FILE), codec::compress(payload)?)?;
        fs::write(staging.path().join(RECORD_FILE), serde_json::to_vec_pretty(&record)?)?;
        Ok(staging)
    }

    fn publish(&self, key: &CacheKey, staging: tempfile::TempDir) -> PipelineResult<WriteOutcome> {
        let target = self.entry_dir(key);
        match fs::rename(staging.path(), &target) {
            Ok(()) => {
                log::debug!("Cache entry {} written", key);
                Ok(WriteOutcome::Written)
            }
            Err(e) if target.join(RECORD_FILE).is_file() => {
                // Lost the race to another writer; the staging dir is dropped with `staging`
                log::debug!("Cache entry {} written concurrently ({}), keeping first", key, e);
                Ok(WriteOutcome::AlreadyPresent)
            }
            Err(e) => Err(PipelineError::Io(e)),
        }
    }

    pub fn read_record(&self, key: &CacheKey) -> PipelineResult<EntryRecord> {
        let bytes = fs::read(self.entry_dir(key).join(RECORD_FILE))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Read an entry, verifying payload length and digest
    pub fn get(&self, key: &CacheKey) -> PipelineResult<(EntryRecord, Vec<u8>)> {
        let record = self.read_record(key)?;
        if record.stage != key.stage {
            return Err(PipelineError::InvalidFormat(format!(
                "entry {} records stage {}",
                key, record.stage
            )));
        }
        let compressed = fs::read(self.entry_dir(key).join(PAYLOAD_FILE))?;
        let payload = codec::decompress(&compressed)?;
        if payload.len() as u64 != record.payload_len || codec::digest(&payload) != record.digest {
            return Err(PipelineError::InvalidFormat(format!("cache entry {} is corrupted", key)));
        }
        Ok((record, payload))
    }

    /// Subjects with a complete entry for `stage`, sorted
    pub fn list_subjects(&self, stage: Stage) -> PipelineResult<Vec<String>> {
        let stage_dir = self.root.join(stage.as_str());
        if !stage_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut subjects = Vec::new();
        for entry in fs::read_dir(&stage_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.path().join(RECORD_FILE).is_file() {
                continue;
            }
            subjects.push(name);
        }
        subjects.sort();
        Ok(subjects)
    }

    /// Years with a complete entry for a per-year stage, ascending
    pub fn list_years(&self, stage: Stage) -> PipelineResult<Vec<i32>> {
        let mut years: Vec<i32> = self
            .list_subjects(stage)?
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        years.sort_unstable();
        Ok(years)
    }

    /// Drop an entry so the stage recomputes it on the next run
    pub fn remove(&self, key: &CacheKey) -> PipelineResult<bool> {
        let dir = self.entry_dir(key);
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(dir)?;
        Ok(true)
    }

    pub fn put_scene(&self, scene: &Scene) -> PipelineResult<WriteOutcome> {
        let mut record = EntryRecord::new(Stage::Raw, scene.grid);
        record.bands = scene.bands.dim().0;
        record.scene = Some(scene.metadata.clone());
        let mut w = PayloadWriter::new();
        w.put_f32(scene.bands.iter().copied());
        self.put(&CacheKey::scene(Stage::Raw, scene.id()), record, &w.finish())
    }

    pub fn load_scene(&self, scene_id: &str) -> PipelineResult<Scene> {
        let (record, payload) = self.get(&CacheKey::scene(Stage::Raw, scene_id))?;
        let metadata = scene_metadata(&record)?;
        let mut r = PayloadReader::new(&payload);
        let bands = read_bands(&mut r, &record)?;
        r.finish()?;
        Ok(Scene { metadata, grid: record.grid, bands })
    }

    pub fn put_masked(&self, masked: &MaskedScene) -> PipelineResult<WriteOutcome> {
        let scene = &masked.scene;
        let mut record = EntryRecord::new(Stage::Masked, scene.grid);
        record.bands = scene.bands.dim().0;
        record.scene = Some(scene.metadata.clone());
        let mut w = PayloadWriter::new();
        w.put_f32(scene.bands.iter().copied());
        w.put_u8(masked.mask.classes.iter().map(|c| *c as u8));
        self.put(&CacheKey::scene(Stage::Masked, scene.id()), record, &w.finish())
    }

    pub fn load_masked(&self, scene_id: &str) -> PipelineResult<MaskedScene> {
        let (record, payload) = self.get(&CacheKey::scene(Stage::Masked, scene_id))?;
        let metadata = scene_metadata(&record)?;
        let mut r = PayloadReader::new(&payload);
        let bands = read_bands(&mut r, &record)?;
        let classes = r
            .u8_plane(record.grid.pixel_count())?
            .into_iter()
            .map(|v| {
                MaskClass::from_u8(v)
                    .ok_or_else(|| PipelineError::InvalidFormat(format!("unknown mask class {}", v)))
            })
            .collect::<PipelineResult<Vec<_>>>()?;
        r.finish()?;
        let scene = Scene { metadata, grid: record.grid, bands };
        let mask = Mask { grid: record.grid, classes: plane(classes, &record.grid)? };
        MaskedScene::new(scene, mask)
    }

    /// Store a mosaic computed from the masked entries named in `inputs`
    pub fn put_mosaic(&self, mosaic: &Mosaic, inputs: Vec<String>) -> PipelineResult<WriteOutcome> {
        let mut record = EntryRecord::new(Stage::Mosaic, mosaic.grid);
        record.bands = mosaic.bands.dim().0;
        record.year = Some(mosaic.year);
        record.inputs = inputs;
        let mut w = PayloadWriter::new();
        w.put_f32(mosaic.bands.iter().copied());
        w.put_u16(mosaic.contributors.iter().copied());
        self.put_derived(&CacheKey::year(Stage::Mosaic, mosaic.year), record, &w.finish())
    }

    pub fn load_mosaic(&self, year: i32) -> PipelineResult<Mosaic> {
        let (record, payload) = self.get(&CacheKey::year(Stage::Mosaic, year))?;
        let mut r = PayloadReader::new(&payload);
        let bands = read_bands(&mut r, &record)?;
        let contributors = plane(r.u16_plane(record.grid.pixel_count())?, &record.grid)?;
        r.finish()?;
        Ok(Mosaic { year, grid: record.grid, bands, contributors })
    }

    pub fn put_index(&self, index: &IndexRaster, inputs: Vec<String>) -> PipelineResult<WriteOutcome> {
        let mut record = EntryRecord::new(Stage::Index, index.grid);
        record.year = Some(index.year);
        record.inputs = inputs;
        let mut w = PayloadWriter::new();
        w.put_f32(index.values.iter().map(|v| v.unwrap_or(0.0)));
        w.put_u8(index.values.iter().map(|v| v.is_some() as u8));
        self.put_derived(&CacheKey::year(Stage::Index, index.year), record, &w.finish())
    }

    pub fn load_index(&self, year: i32) -> PipelineResult<IndexRaster> {
        let (record, payload) = self.get(&CacheKey::year(Stage::Index, year))?;
        let n = record.grid.pixel_count();
        let mut r = PayloadReader::new(&payload);
        let values = r.f32_plane(n)?;
        let valid = r.u8_plane(n)?;
        r.finish()?;
        let merged: Vec<Option<f32>> = values
            .into_iter()
            .zip(valid)
            .map(|(v, ok)| (ok != 0).then_some(v))
            .collect();
        Ok(IndexRaster { year, grid: record.grid, values: plane(merged, &record.grid)? })
    }

    pub fn put_trend(&self, trend: &TrendRaster, inputs: Vec<String>) -> PipelineResult<WriteOutcome> {
        let (first, last) = match (trend.years.first(), trend.years.last()) {
            (Some(f), Some(l)) => (*f, *l),
            _ => return Err(PipelineError::Processing("trend raster has no years".to_string())),
        };
        let mut record = EntryRecord::new(Stage::Trend, trend.grid);
        record.year = Some(trend.base_year);
        record.years = trend.years.clone();
        record.inputs = inputs;
        let mut w = PayloadWriter::new();
        w.put_f32(trend.records.iter().map(|t| t.slope.unwrap_or(0.0)));
        w.put_f32(trend.records.iter().map(|t| t.intercept.unwrap_or(0.0)));
        w.put_f32(trend.records.iter().map(|t| t.residual_std.unwrap_or(0.0)));
        w.put_u16(trend.records.iter().map(|t| t.n_valid_years));
        w.put_u8(trend.records.iter().map(|t| t.quality as u8));
        self.put_derived(&CacheKey::trend(first, last), record, &w.finish())
    }

    pub fn load_trend(&self, first_year: i32, last_year: i32) -> PipelineResult<TrendRaster> {
        let (record, payload) = self.get(&CacheKey::trend(first_year, last_year))?;
        let n = record.grid.pixel_count();
        let mut r = PayloadReader::new(&payload);
        let slope = r.f32_plane(n)?;
        let intercept = r.f32_plane(n)?;
        let residual = r.f32_plane(n)?;
        let n_valid = r.u16_plane(n)?;
        let quality = r.u8_plane(n)?;
        r.finish()?;

        let mut records = Vec::with_capacity(n);
        for i in 0..n {
            let q = TrendQuality::from_u8(quality[i])
                .ok_or_else(|| PipelineError::InvalidFormat(format!("unknown trend quality {}", quality[i])))?;
            records.push(if q == TrendQuality::InsufficientData {
                TrendRecord::insufficient(n_valid[i])
            } else {
                TrendRecord {
                    slope: Some(slope[i]),
                    intercept: Some(intercept[i]),
                    n_valid_years: n_valid[i],
                    residual_std: Some(residual[i]),
                    quality: q,
                }
            });
        }
        let base_year = record
            .year
            .ok_or_else(|| PipelineError::InvalidFormat("trend entry has no base year".to_string()))?;
        Ok(TrendRaster {
            grid: record.grid,
            base_year,
            years: record.years,
            records: plane(records, &record.grid)?,
        })
    }
}

/// `<subject>@<digest>` tag identifying one stored entry as an input
pub fn input_tag(subject: &str, record: &EntryRecord) -> String {
    format!("{}@{}", subject, record.digest)
}

fn scene_metadata(record: &EntryRecord) -> PipelineResult<SceneMetadata> {
    record
        .scene
        .clone()
        .ok_or_else(|| PipelineError::InvalidFormat(format!("{} entry has no scene metadata", record.stage)))
}

fn read_bands(r: &mut PayloadReader<'_>, record: &EntryRecord) -> PipelineResult<Array3<f32>> {
    let (rows, cols) = record.grid.shape();
    let values = r.f32_plane(record.bands * rows * cols)?;
    Array3::from_shape_vec((record.bands, rows, cols), values)
        .map_err(|e| PipelineError::InvalidFormat(format!("failed to reshape bands: {}", e)))
}

fn plane<T>(values: Vec<T>, grid: &GridSpec) -> PipelineResult<Array2<T>> {
    Array2::from_shape_vec(grid.shape(), values)
        .map_err(|e| PipelineError::InvalidFormat(format!("failed to reshape plane: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, GeoTransform, BAND_COUNT};
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn grid() -> GridSpec {
        GridSpec::new(3, 2, GeoTransform::north_up(0.0, 20.0, 10.0), 32605)
    }

    fn scene(id: &str) -> Scene {
        Scene {
            metadata: SceneMetadata {
                scene_id: id.to_string(),
                acquisition_date: NaiveDate::from_ymd_opt(2021, 8, 3).unwrap(),
                footprint: BoundingBox::new(-153.5, 70.5, -153.0, 71.0),
                cloud_cover: 4.0,
            },
            grid: grid(),
            bands: Array3::from_shape_fn((BAND_COUNT, 2, 3), |(b, r, c)| (b * 100 + r * 10 + c) as f32),
        }
    }

    #[test]
    fn test_scene_entry_survives_reload() {
        let dir = TempDir::new().unwrap();
        let cache = TileCache::open(dir.path()).unwrap();
        let s = scene("S2B_MSIL2A_20210803");

        assert_eq!(cache.put_scene(&s).unwrap(), WriteOutcome::Written);
        let loaded = cache.load_scene(s.id()).unwrap();
        assert_eq!(loaded.metadata, s.metadata);
        assert_eq!(loaded.grid, s.grid);
        assert_eq!(loaded.bands, s.bands);
    }

    #[test]
    fn test_second_writer_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let cache = TileCache::open(dir.path()).unwrap();
        let first = scene("dup");
        let mut second = scene("dup");
        second.bands.fill(1.0);

        assert_eq!(cache.put_scene(&first).unwrap(), WriteOutcome::Written);
        assert_eq!(cache.put_scene(&second).unwrap(), WriteOutcome::AlreadyPresent);
        assert_eq!(cache.load_scene("dup").unwrap().bands, first.bands);
        assert_eq!(cache.list_subjects(Stage::Raw).unwrap(), vec!["dup".to_string()]);
    }

    #[test]
    fn test_corrupted_payload_is_detected() {
        let dir = TempDir::new().unwrap();
        let cache = TileCache::open(dir.path()).unwrap();
        cache.put_scene(&scene("a")).unwrap();

        let payload_path = dir.path().join("raw").join("a").join(PAYLOAD_FILE);
        let other = codec::compress(&[0u8; 16]).unwrap();
        fs::write(payload_path, other).unwrap();

        assert!(matches!(cache.load_scene("a"), Err(PipelineError::InvalidFormat(_))));
    }

    #[test]
    fn test_concurrent_writers_keep_first() {
        let dir = TempDir::new().unwrap();
        let cache = TileCache::open(dir.path()).unwrap();
        let outcomes: Vec<PipelineResult<WriteOutcome>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..16)
                .map(|i| {
                    let cache = &cache;
                    s.spawn(move || {
                        let mut contested = scene("contested");
                        contested.bands.fill(i as f32);
                        cache.put_scene(&contested)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let written = outcomes.iter().filter(|o| matches!(o, Ok(WriteOutcome::Written))).count();
        let errors: Vec<_> = outcomes.iter().filter_map(|o| o.as_ref().err()).collect();
        println!("written={} errors={:?}", written, errors);
        assert_eq!(written, 1);
        assert!(errors.is_empty());

        let stored = cache.load_scene("contested").unwrap();
        let first = stored.bands[[0, 0, 0]];
        assert!(stored.bands.iter().all(|v| *v == first));
        assert_eq!(cache.list_subjects(Stage::Raw).unwrap(), vec!["contested".to_string()]);
    }

    #[test]
    fn test_derived_entry_replaced_when_inputs_change() {
        let dir = TempDir::new().unwrap();
        let cache = TileCache::open(dir.path()).unwrap();
        let key = CacheKey::year(Stage::Index, 2020);
        let values = Array2::from_elem((2, 3), Some(0.25f32));
        let old = IndexRaster { year: 2020, grid: grid(), values };
        let mut new = old.clone();
        new.values.fill(Some(0.75));
        let inputs = |tag: &str| vec![tag.to_string()];

        assert_eq!(cache.put_index(&old, inputs("mosaic@a")).unwrap(), WriteOutcome::Written);
        assert_eq!(cache.put_index(&new, inputs("mosaic@a")).unwrap(), WriteOutcome::AlreadyPresent);
        assert_eq!(cache.load_index(2020).unwrap(), old);
        assert!(cache.is_current(&key, &inputs("mosaic@a")));
        assert!(!cache.is_current(&key, &inputs("mosaic@b")));

        assert_eq!(cache.put_index(&new, inputs("mosaic@b")).unwrap(), WriteOutcome::Replaced);
        assert_eq!(cache.load_index(2020).unwrap(), new);
        assert!(cache.is_current(&key, &inputs("mosaic@b")));
        // Nothing but the live entry is left in the stage directory
        assert_eq!(fs::read_dir(dir.path().join("index")).unwrap().count(), 1);
    }

    #[test]
    fn test_subjects_are_sanitized() {
        let cleaned = sanitize_subject("S2A/../x y");
        assert!(cleaned.starts_with("S2A_.._x_y-"), "{}", cleaned);
        assert_eq!(sanitize_subject(&cleaned), cleaned);
        assert!(sanitize_subject("..").starts_with("_..-"));
        assert_eq!(sanitize_subject("S2A_MSIL2A_20210803"), "S2A_MSIL2A_20210803");
        assert_ne!(sanitize_subject("a/b"), sanitize_subject("a_b"));
        assert_ne!(sanitize_subject("a/b"), sanitize_subject("a:b"));
        assert_eq!(CacheKey::year(Stage::Mosaic, 2019).to_string(), "mosaic/2019");
        assert_eq!(CacheKey::trend(2017, 2025).subject, "2017-2025");
    }

    #[test]
    fn test_ids_that_sanitize_alike_do_not_collide() {
        let dir = TempDir::new().unwrap();
        let cache = TileCache::open(dir.path()).unwrap();
        assert_eq!(cache.put_scene(&scene("a/b")).unwrap(), WriteOutcome::Written);
        assert!(!cache.contains(&CacheKey::scene(Stage::Raw, "a_b")));
        assert_eq!(cache.put_scene(&scene("a_b")).unwrap(), WriteOutcome::Written);
        assert_eq!(cache.load_scene("a/b").unwrap().metadata.scene_id, "a/b");
        assert_eq!(cache.list_subjects(Stage::Raw).unwrap().len(), 2);
    }

    #[test]
    fn test_index_nodata_survives_reload() {
        let dir = TempDir::new().unwrap();
        let cache = TileCache::open(dir.path()).unwrap();
        let values = Array2::from_shape_vec((2, 3), vec![Some(0.5), None, Some(0.0), None, Some(-0.25), None]).unwrap();
        let index = IndexRaster { year: 2020, grid: grid(), values };
        cache.put_index(&index, Vec::new()).unwrap();

        assert_eq!(cache.load_index(2020).unwrap(), index);
        assert_eq!(cache.list_years(Stage::Index).unwrap(), vec![2020]);
        assert!(cache.remove(&CacheKey::year(Stage::Index, 2020)).unwrap());
        assert!(!cache.contains(&CacheKey::year(Stage::Index, 2020)));
    }
}
