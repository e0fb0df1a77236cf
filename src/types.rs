use chrono::NaiveDate;
use ndarray::{s, Array2, Array3};
use serde::{Deserialize, Serialize};

/// Number of reflectance bands carried by every scene and mosaic
pub const BAND_COUNT: usize = 6;

/// Digital numbers per unit reflectance (Sentinel-2 L2A scaling)
pub const REFLECTANCE_SCALE: f32 = 10_000.0;

/// Reflectance bands in storage order (B02, B03, B04, B08, B11, B12)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Band {
    Blue,
    Green,
    Red,
    Nir,
    Swir1,
    Swir2,
}

impl Band {
    pub const ALL: [Band; BAND_COUNT] = [
        Band::Blue,
        Band::Green,
        Band::Red,
        Band::Nir,
        Band::Swir1,
        Band::Swir2,
    ];

    /// Position of the band along the band axis
    pub fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for Band {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Band::Blue => write!(f, "Blue"),
            Band::Green => write!(f, "Green"),
            Band::Red => write!(f, "Red"),
            Band::Nir => write!(f, "NIR"),
            Band::Swir1 => write!(f, "SWIR1"),
            Band::Swir2 => write!(f, "SWIR2"),
        }
    }
}

/// Geospatial bounding box
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self { min_lon, max_lon, min_lat, max_lat }
    }

    /// Finite and with positive extent on both axes
    pub fn is_valid(&self) -> bool {
        [self.min_lon, self.max_lon, self.min_lat, self.max_lat]
            .iter()
            .all(|v| v.is_finite())
            && self.max_lon > self.min_lon
            && self.max_lat > self.min_lat
    }

    pub fn area(&self) -> f64 {
        (self.max_lon - self.min_lon).max(0.0) * (self.max_lat - self.min_lat).max(0.0)
    }

    pub fn intersection(&self, other: &BoundingBox) -> Option<BoundingBox> {
        let b = BoundingBox {
            min_lon: self.min_lon.max(other.min_lon),
            max_lon: self.max_lon.min(other.max_lon),
            min_lat: self.min_lat.max(other.min_lat),
            max_lat: self.max_lat.min(other.max_lat),
        };
        (b.max_lon > b.min_lon && b.max_lat > b.min_lat).then_some(b)
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.intersection(other).is_some()
    }

    /// Fraction of `area_of_interest` covered by this box (0.0 to 1.0)
    pub fn coverage_of(&self, area_of_interest: &BoundingBox) -> f64 {
        let aoi_area = area_of_interest.area();
        if aoi_area <= 0.0 {
            return 0.0;
        }
        self.intersection(area_of_interest)
            .map(|i| i.area() / aoi_area)
            .unwrap_or(0.0)
    }
}

/// Geospatial transformation parameters (GDAL ordering)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform without rotation terms
    pub fn north_up(top_left_x: f64, top_left_y: f64, pixel_size: f64) -> Self {
        Self {
            top_left_x,
            pixel_width: pixel_size,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height: -pixel_size,
        }
    }

    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    pub fn is_axis_aligned(&self) -> bool {
        self.rotation_x == 0.0 && self.rotation_y == 0.0 && self.pixel_width != 0.0 && self.pixel_height != 0.0
    }

    /// Map coordinates of a pixel centre
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        let c = col as f64 + 0.5;
        let r = row as f64 + 0.5;
        (
            self.top_left_x + c * self.pixel_width + r * self.rotation_x,
            self.top_left_y + c * self.rotation_y + r * self.pixel_height,
        )
    }
}

/// Raster grid: dimensions, placement and CRS
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub width: usize,
    pub height: usize,
    pub geo_transform: GeoTransform,
    pub epsg: u32,
}

impl GridSpec {
    pub fn new(width: usize, height: usize, geo_transform: GeoTransform, epsg: u32) -> Self {
        Self { width, height, geo_transform, epsg }
    }

    /// (rows, cols), the ndarray shape of a single plane
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    /// Extent in grid CRS units, assuming an axis-aligned transform
    pub fn bounds(&self) -> BoundingBox {
        let gt = &self.geo_transform;
        let x0 = gt.top_left_x;
        let x1 = gt.top_left_x + self.width as f64 * gt.pixel_width;
        let y0 = gt.top_left_y;
        let y1 = gt.top_left_y + self.height as f64 * gt.pixel_height;
        BoundingBox::new(x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1))
    }
}

/// Catalog metadata for one overpass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneMetadata {
    pub scene_id: String,
    pub acquisition_date: NaiveDate,
    /// Footprint in lon/lat
    pub footprint: BoundingBox,
    /// Scene-wide cloud cover estimate in percent
    pub cloud_cover: f32,
}

impl SceneMetadata {
    /// Reject records the pipeline cannot reason about
    pub fn validate(&self) -> PipelineResult<()> {
        if self.scene_id.trim().is_empty() {
            return Err(PipelineError::PermanentFetch("scene id is empty".to_string()));
        }
        if !(0.0..=100.0).contains(&self.cloud_cover) {
            return Err(PipelineError::PermanentFetch(format!(
                "scene {} has cloud cover {} outside 0..=100",
                self.scene_id, self.cloud_cover
            )));
        }
        if !self.footprint.is_valid() {
            return Err(PipelineError::PermanentFetch(format!(
                "scene {} has a degenerate footprint {:?}",
                self.scene_id, self.footprint
            )));
        }
        Ok(())
    }
}

/// Multi-band raster as delivered by the catalog client
#[derive(Debug, Clone)]
pub struct RawRaster {
    pub grid: GridSpec,
    /// (band, row, col)
    pub bands: Array3<f32>,
}

/// Raw scene: catalog metadata plus its reflectance bands
#[derive(Debug, Clone)]
pub struct Scene {
    pub metadata: SceneMetadata,
    pub grid: GridSpec,
    /// (band, row, col) in `Band::ALL` order
    pub bands: Array3<f32>,
}

impl Scene {
    /// Build a scene from a fetched raster, rejecting products the pipeline cannot use
    pub fn from_raw(metadata: SceneMetadata, raster: RawRaster, reference: &GridSpec) -> PipelineResult<Self> {
        let (n_bands, rows, cols) = raster.bands.dim();
        if n_bands != BAND_COUNT {
            return Err(PipelineError::PermanentFetch(format!(
                "scene {} has {} bands, expected {}",
                metadata.scene_id, n_bands, BAND_COUNT
            )));
        }
        if rows == 0 || cols == 0 {
            return Err(PipelineError::PermanentFetch(format!(
                "scene {} has an empty raster",
                metadata.scene_id
            )));
        }
        if (rows, cols) != raster.grid.shape() {
            return Err(PipelineError::PermanentFetch(format!(
                "scene {} raster is {}x{} but its grid declares {}x{}",
                metadata.scene_id, cols, rows, raster.grid.width, raster.grid.height
            )));
        }
        if raster.grid.epsg != reference.epsg {
            return Err(PipelineError::PermanentFetch(format!(
                "scene {} is in EPSG:{}, reference grid is EPSG:{}",
                metadata.scene_id, raster.grid.epsg, reference.epsg
            )));
        }
        Ok(Self {
            metadata,
            grid: raster.grid,
            bands: raster.bands,
        })
    }

    pub fn id(&self) -> &str {
        &self.metadata.scene_id
    }

    /// Pixels with no observation in the source product: any band non-finite, or all bands zero
    pub fn source_nodata(&self) -> Array2<bool> {
        let (_, rows, cols) = self.bands.dim();
        Array2::from_shape_fn((rows, cols), |(r, c)| {
            let px = self.bands.slice(s![.., r, c]);
            px.iter().any(|v| !v.is_finite()) || px.iter().all(|v| *v == 0.0)
        })
    }
}

/// Per-pixel validity class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MaskClass {
    Valid = 0,
    Cloud = 1,
    Shadow = 2,
    NoData = 3,
}

impl MaskClass {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MaskClass::Valid),
            1 => Some(MaskClass::Cloud),
            2 => Some(MaskClass::Shadow),
            3 => Some(MaskClass::NoData),
            _ => None,
        }
    }

    pub fn is_valid(self) -> bool {
        self == MaskClass::Valid
    }
}

/// Validity mask aligned pixel-for-pixel with its scene
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    pub grid: GridSpec,
    pub classes: Array2<MaskClass>,
}

impl Mask {
    pub fn count(&self, class: MaskClass) -> usize {
        self.classes.iter().filter(|c| **c == class).count()
    }
}

/// Scene paired with its mask; input to compositing
#[derive(Debug, Clone)]
pub struct MaskedScene {
    pub scene: Scene,
    pub mask: Mask,
}

impl MaskedScene {
    pub fn new(scene: Scene, mask: Mask) -> PipelineResult<Self> {
        if mask.grid != scene.grid || mask.classes.dim() != scene.grid.shape() {
            return Err(PipelineError::GridMismatch(format!(
                "mask for scene {} does not match the scene grid",
                scene.id()
            )));
        }
        Ok(Self { scene, mask })
    }

    pub fn is_valid(&self, row: usize, col: usize) -> bool {
        self.mask.classes[[row, col]].is_valid()
    }
}

/// One composite per season year, on the reference grid
#[derive(Debug, Clone, PartialEq)]
pub struct Mosaic {
    pub year: i32,
    pub grid: GridSpec,
    /// (band, row, col); NaN where `contributors` is zero
    pub bands: Array3<f32>,
    /// Number of scenes with a valid observation at each pixel
    pub contributors: Array2<u16>,
}

impl Mosaic {
    pub fn is_nodata(&self, row: usize, col: usize) -> bool {
        self.contributors[[row, col]] == 0
    }

    pub fn valid_pixels(&self) -> usize {
        self.contributors.iter().filter(|n| **n > 0).count()
    }
}

/// Derived index for one year; `None` is nodata
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRaster {
    pub year: i32,
    pub grid: GridSpec,
    pub values: Array2<Option<f32>>,
}

impl IndexRaster {
    pub fn valid_pixels(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }
}

/// Fit adequacy of a per-pixel trend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TrendQuality {
    Good = 0,
    /// Residual dispersion above the configured threshold
    PoorFit = 1,
    /// Fewer valid years than the configured minimum
    InsufficientData = 2,
}

impl TrendQuality {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TrendQuality::Good),
            1 => Some(TrendQuality::PoorFit),
            2 => Some(TrendQuality::InsufficientData),
            _ => None,
        }
    }
}

/// Per-pixel trend record
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendRecord {
    /// Index units per year
    pub slope: Option<f32>,
    /// Fitted value at the raster's `base_year`
    pub intercept: Option<f32>,
    pub n_valid_years: u16,
    pub residual_std: Option<f32>,
    pub quality: TrendQuality,
}

impl TrendRecord {
    pub fn insufficient(n_valid_years: u16) -> Self {
        Self {
            slope: None,
            intercept: None,
            n_valid_years,
            residual_std: None,
            quality: TrendQuality::InsufficientData,
        }
    }
}

/// Trend over a full year series
#[derive(Debug, Clone, PartialEq)]
pub struct TrendRaster {
    pub grid: GridSpec,
    /// x-origin of the intercepts
    pub base_year: i32,
    /// Years of the input series, ascending
    pub years: Vec<i32>,
    pub records: Array2<TrendRecord>,
}

/// Error types for the trend pipeline
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Grid mismatch: {0}")]
    GridMismatch(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Transient fetch failure: {0}")]
    TransientFetch(String),

    #[error("Permanent fetch failure: {0}")]
    PermanentFetch(String),

    #[error("Classification failed: {0}")]
    Classification(String),

    #[error("Scene catalog unavailable: {0}")]
    CatalogUnavailable(String),

    #[error("Run cancelled")]
    Cancelled,

    #[cfg(feature = "gdal")]
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),
}

impl PipelineError {
    /// Worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::TransientFetch(_))
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;
