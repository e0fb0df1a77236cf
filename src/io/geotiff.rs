//! GeoTIFF reading and export through GDAL

use crate::types::{
    GeoTransform, GridSpec, IndexRaster, Mosaic, PipelineError, PipelineResult, RawRaster, TrendRaster,
    REFLECTANCE_SCALE,
};
use gdal::raster::{Buffer, GdalType};
use gdal::spatial_ref::SpatialRef;
use gdal::{Dataset, DriverManager};
use ndarray::{s, Array3};
use std::path::Path;

/// Read every band of a scene raster as f32
pub fn read_raster<P: AsRef<Path>>(path: P) -> PipelineResult<RawRaster> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(PipelineError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} not found", path.display()),
        )));
    }
    log::debug!("Reading raster {}", path.display());

    let dataset = Dataset::open(path)?;
    let geo_transform = GeoTransform::from_gdal(dataset.geo_transform()?);
    let (width, height) = dataset.raster_size();
    let epsg = dataset
        .spatial_ref()
        .and_then(|srs| srs.auth_code())
        .map_err(|e| PipelineError::InvalidFormat(format!("{} has no EPSG code: {}", path.display(), e)))?;
    let epsg = u32::try_from(epsg)
        .map_err(|_| PipelineError::InvalidFormat(format!("{} has EPSG code {}", path.display(), epsg)))?;

    let count = dataset.raster_count();
    let mut bands = Array3::zeros((count as usize, height, width));
    for b in 1..=count {
        let band = dataset.rasterband(b)?;
        let buffer = band.read_as::<f32>((0, 0), (width, height), (width, height), None)?;
        let plane = ndarray::Array2::from_shape_vec((height, width), buffer.data)
            .map_err(|e| PipelineError::InvalidFormat(format!("Failed to reshape band {}: {}", b, e)))?;
        bands.slice_mut(s![(b - 1) as usize, .., ..]).assign(&plane);
    }

    Ok(RawRaster {
        grid: GridSpec::new(width, height, geo_transform, epsg),
        bands,
    })
}

fn write_planes<T: GdalType + Copy>(
    path: &Path,
    grid: &GridSpec,
    planes: Vec<Vec<T>>,
    nodata: Option<f64>,
) -> PipelineResult<()> {
    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let mut dataset = driver.create_with_band_type::<T, _>(
        path,
        grid.width as isize,
        grid.height as isize,
        planes.len() as isize,
    )?;
    dataset.set_geo_transform(&grid.geo_transform.to_gdal())?;
    let srs = SpatialRef::from_epsg(grid.epsg)?;
    dataset.set_projection(&srs.to_wkt()?)?;

    for (i, data) in planes.into_iter().enumerate() {
        let mut band = dataset.rasterband((i + 1) as isize)?;
        band.set_no_data_value(nodata)?;
        let buffer = Buffer::new((grid.width, grid.height), data);
        band.write((0, 0), (grid.width, grid.height), &buffer)?;
    }
    log::info!("Wrote {}", path.display());
    Ok(())
}

/// Six-band uint16 reflectance (0..=10000); 0 is nodata
pub fn write_mosaic<P: AsRef<Path>>(path: P, mosaic: &Mosaic) -> PipelineResult<()> {
    let (n_bands, _, _) = mosaic.bands.dim();
    let planes = (0..n_bands)
        .map(|b| {
            mosaic
                .bands
                .index_axis(ndarray::Axis(0), b)
                .indexed_iter()
                .map(|((r, c), v)| {
                    if mosaic.is_nodata(r, c) || !v.is_finite() {
                        0
                    } else {
                        v.round().clamp(0.0, REFLECTANCE_SCALE) as u16
                    }
                })
                .collect()
        })
        .collect();
    write_planes::<u16>(path.as_ref(), &mosaic.grid, planes, Some(0.0))
}

/// Single-band float32 index; NaN is nodata
pub fn write_index<P: AsRef<Path>>(path: P, index: &IndexRaster) -> PipelineResult<()> {
    let plane = index.values.iter().map(|v| v.unwrap_or(f32::NAN)).collect();
    write_planes::<f32>(path.as_ref(), &index.grid, vec![plane], Some(f64::NAN))
}

/// Bands: slope, intercept, residual std, valid years, quality code; NaN is nodata
pub fn write_trend<P: AsRef<Path>>(path: P, trend: &TrendRaster) -> PipelineResult<()> {
    let r = &trend.records;
    let planes = vec![
        r.iter().map(|t| t.slope.unwrap_or(f32::NAN)).collect(),
        r.iter().map(|t| t.intercept.unwrap_or(f32::NAN)).collect(),
        r.iter().map(|t| t.residual_std.unwrap_or(f32::NAN)).collect(),
        r.iter().map(|t| f32::from(t.n_valid_years)).collect(),
        r.iter().map(|t| f32::from(t.quality as u8)).collect(),
    ];
    write_planes::<f32>(path.as_ref(), &trend.grid, planes, Some(f64::NAN))
}
