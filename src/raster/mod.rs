//! Gridded reference layers.
//!
//! A [`Raster`] is a north-up grid of `f64` pixel values (one grid per band)
//! georeferenced by a [`GeoTransform`]. Rasters are decoded from raw bytes by
//! [`decode_raster`] / [`load_raster`], which accept exactly three encodings
//! (Arc/Info ASCII grid, GeoTIFF and NetCDF classic) and reject anything else
//! before decoding. Large rasters are cut into tiles by
//! [`TileIndexer`](tile::TileIndexer).
//!
//! Pixel membership is upper-left inclusive, lower-right exclusive: a pixel
//! owns its west and north edges, its east and south edges belong to the
//! neighbouring pixels.

mod ascii;
mod format;
#[cfg(feature = "raster-geotiff")]
mod geotiff;
mod netcdf;
pub mod tile;

pub use format::{RasterFormat, RasterLayerSpec, decode_raster, load_raster};
pub use tile::{RasterTile, TileCache, TileGrid, TileIndexer, TileKey};

use crate::crs::Crs;
use crate::error::{EnrichError, Result};
use geo::{Rect, coord};
use serde::{Deserialize, Serialize};

/// Absorbs floating point error when a coordinate sits on a pixel edge,
/// in fractions of a pixel.
const PIXEL_TOLERANCE: f64 = 1e-6;

/// Affine georeferencing of a north-up grid.
///
/// `origin_x`/`origin_y` is the outer upper-left corner of pixel (0, 0).
/// `y_pixel_size` is negative for north-up grids, as in GDAL.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub origin_y: f64,
    pub x_pixel_size: f64,
    pub y_pixel_size: f64,
}

impl GeoTransform {
    pub fn new(origin_x: f64, origin_y: f64, x_pixel_size: f64, y_pixel_size: f64) -> Self {
        Self {
            origin_x,
            origin_y,
            x_pixel_size,
            y_pixel_size,
        }
    }

    /// North-up transform with square pixels of `resolution` units.
    pub fn north_up(origin_x: f64, origin_y: f64, resolution: f64) -> Self {
        Self::new(origin_x, origin_y, resolution, -resolution)
    }

    /// Grid index `(col, row)` of the pixel owning `(x, y)`. May lie outside
    /// the grid; callers bound-check against their own dimensions. Non-finite
    /// coordinates own no pixel.
    ///
    /// ```
    /// use geobeam::raster::GeoTransform;
    ///
    /// let gt = GeoTransform::north_up(-74.25125, 40.90792, 0.00833);
    /// assert_eq!(gt.pixel_index(-74.25125, 40.90792), Some((0, 0)));
    /// assert_eq!(gt.pixel_index(-74.25125 + 0.00833, 40.90792 - 0.00833), Some((1, 1)));
    /// assert_eq!(gt.pixel_index(f64::NAN, 40.90792), None);
    /// ```
    pub fn pixel_index(&self, x: f64, y: f64) -> Option<(i64, i64)> {
        if !(x.is_finite() && y.is_finite()) {
            return None;
        }
        let col = ((x - self.origin_x) / self.x_pixel_size + PIXEL_TOLERANCE).floor();
        let row = ((y - self.origin_y) / self.y_pixel_size + PIXEL_TOLERANCE).floor();
        Some((col as i64, row as i64))
    }

    /// Upper-left corner of pixel `(col, row)`.
    pub fn pixel_corner(&self, col: i64, row: i64) -> (f64, f64) {
        (
            self.origin_x + col as f64 * self.x_pixel_size,
            self.origin_y + row as f64 * self.y_pixel_size,
        )
    }

    /// Centre of pixel `(col, row)`.
    pub fn pixel_center(&self, col: i64, row: i64) -> (f64, f64) {
        let (x, y) = self.pixel_corner(col, row);
        (x + self.x_pixel_size / 2.0, y + self.y_pixel_size / 2.0)
    }

    /// Transform of the sub-grid whose pixel (0, 0) is `(col, row)` here.
    pub fn shifted(&self, col: usize, row: usize) -> Self {
        let (origin_x, origin_y) = self.pixel_corner(col as i64, row as i64);
        Self { origin_x, origin_y, ..*self }
    }

    /// Bounding box of a `width` x `height` grid.
    pub fn bounds(&self, width: usize, height: usize) -> Rect<f64> {
        let (x0, y0) = self.pixel_corner(0, 0);
        let (x1, y1) = self.pixel_corner(width as i64, height as i64);
        Rect::new(coord! { x: x0, y: y0 }, coord! { x: x1, y: y1 })
    }

    fn validate(&self) -> Result<()> {
        let ok = [self.origin_x, self.origin_y, self.x_pixel_size, self.y_pixel_size]
            .iter()
            .all(|v| v.is_finite())
            && self.x_pixel_size > 0.0
            && self.y_pixel_size < 0.0;
        if ok {
            Ok(())
        } else {
            Err(EnrichError::raster_format(format!(
                "invalid georeferencing {self:?}; expected a north-up grid"
            )))
        }
    }
}

/// A decoded raster: `bands` grids of `width * height` row-major pixels.
#[derive(Clone, Debug, PartialEq)]
pub struct Raster {
    width: usize,
    height: usize,
    transform: GeoTransform,
    bands: Vec<Vec<f64>>,
    nodata: Option<f64>,
    crs: Crs,
}

impl Raster {
    /// Build a raster in the working CRS. Every band must hold exactly
    /// `width * height` values.
    pub fn new(
        width: usize,
        height: usize,
        transform: GeoTransform,
        bands: Vec<Vec<f64>>,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(EnrichError::raster_format(format!(
                "raster has no pixels ({width}x{height})"
            )));
        }
        if bands.is_empty() {
            return Err(EnrichError::raster_format("raster has no bands"));
        }
        let pixels = width.checked_mul(height).ok_or_else(|| {
            EnrichError::raster_format(format!("raster {width}x{height} is too large"))
        })?;
        if let Some((i, b)) = bands.iter().enumerate().find(|(_, b)| b.len() != pixels) {
            return Err(EnrichError::raster_format(format!(
                "band {} holds {} values, expected {width}x{height}",
                i + 1,
                b.len()
            )));
        }
        transform.validate()?;
        Ok(Self {
            width,
            height,
            transform,
            bands,
            nodata: None,
            crs: Crs::WGS84,
        })
    }

    #[must_use]
    pub fn with_nodata(mut self, nodata: Option<f64>) -> Self {
        self.nodata = nodata;
        self
    }

    /// Tag the raster of `layer` with its source CRS. Only geographic CRSs
    /// can be sampled with working-CRS coordinates; projected ones fail to load.
    pub fn with_crs(mut self, layer: &str, crs: Crs) -> Result<Self> {
        if !crs.is_geographic() {
            return Err(EnrichError::reference_load(
                layer,
                format!("raster is in projected {crs}; reproject it to {} before loading", Crs::WGS84),
            ));
        }
        if crs != Crs::WGS84 {
            log::debug!("raster in {crs} sampled with {} coordinates", Crs::WGS84);
        }
        self.crs = crs;
        Ok(self)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    pub fn transform(&self) -> &GeoTransform {
        &self.transform
    }

    pub fn nodata(&self) -> Option<f64> {
        self.nodata
    }

    pub fn crs(&self) -> Crs {
        self.crs
    }

    pub fn bounds(&self) -> Rect<f64> {
        self.transform.bounds(self.width, self.height)
    }

    /// Raw band grid, row-major.
    pub fn band(&self, band: usize) -> Option<&[f64]> {
        self.bands.get(band).map(Vec::as_slice)
    }

    /// Pixel `(col, row)` owning `(x, y)`, or `None` outside the raster.
    pub fn pixel_at(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let (col, row) = self.transform.pixel_index(x, y)?;
        let col = usize::try_from(col).ok().filter(|c| *c < self.width)?;
        let row = usize::try_from(row).ok().filter(|r| *r < self.height)?;
        Some((col, row))
    }

    /// Value of `band` at pixel `(col, row)`. Nodata and NaN read as `None`.
    pub fn value(&self, band: usize, col: usize, row: usize) -> Option<f64> {
        if col >= self.width || row >= self.height {
            return None;
        }
        let v = *self.bands.get(band)?.get(row * self.width + col)?;
        self.is_valid(v).then_some(v)
    }

    /// Nearest-pixel sample of `band` at `(x, y)`.
    pub fn sample(&self, band: usize, x: f64, y: f64) -> Option<f64> {
        let (col, row) = self.pixel_at(x, y)?;
        self.value(band, col, row)
    }

    pub(crate) fn is_valid(&self, v: f64) -> bool {
        !v.is_nan() && self.nodata.is_none_or(|nd| v != nd)
    }

    /// Copy a `width` x `height` pixel block starting at `(col, row)`.
    pub(crate) fn block(&self, col: usize, row: usize, width: usize, height: usize) -> Vec<Vec<f64>> {
        self.bands
            .iter()
            .map(|band| {
                (row..row + height)
                    .flat_map(|r| band[r * self.width + col..r * self.width + col + width].iter().copied())
                    .collect()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nyc_grid() -> GeoTransform {
        GeoTransform::north_up(-74.25125, 40.90792, 0.00833)
    }

    #[test]
    fn upper_left_corner_is_pixel_zero() {
        let raster = Raster::new(66, 49, nyc_grid(), vec![vec![1.0; 66 * 49]]).unwrap();
        assert_eq!(raster.pixel_at(-74.25125, 40.90792), Some((0, 0)));
        assert_eq!(
            raster.pixel_at(-74.25125 + 0.00833, 40.90792 - 0.00833),
            Some((1, 1))
        );
    }

    #[test]
    fn edges_belong_to_the_east_and_south_neighbour() {
        let gt = nyc_grid();
        let (x, y) = gt.pixel_corner(3, 2);
        assert_eq!(gt.pixel_index(x, y), Some((3, 2)));
        // A hair inside pixel (2, 1).
        assert_eq!(gt.pixel_index(x - 1e-4, y + 1e-4), Some((2, 1)));
    }

    #[test]
    fn outside_and_far_edges_are_not_in_the_raster() {
        let raster = Raster::new(66, 49, nyc_grid(), vec![vec![1.0; 66 * 49]]).unwrap();
        let b = raster.bounds();
        assert_eq!(raster.pixel_at(b.max().x, 40.9), None);
        assert_eq!(raster.pixel_at(-74.2, b.min().y), None);
        assert_eq!(raster.pixel_at(-74.3, 40.9), None);
        assert!(raster.pixel_at(b.max().x - 1e-4, b.min().y + 1e-4).is_some());
    }

    #[test]
    fn nodata_samples_as_none() {
        let raster = Raster::new(2, 1, GeoTransform::north_up(0.0, 1.0, 1.0), vec![vec![5.0, -9999.0]])
            .unwrap()
            .with_nodata(Some(-9999.0));
        assert_eq!(raster.sample(0, 0.5, 0.5), Some(5.0));
        assert_eq!(raster.sample(0, 1.5, 0.5), None);
    }

    #[test]
    fn rejects_band_size_mismatch_and_projected_crs() {
        let gt = GeoTransform::north_up(0.0, 1.0, 1.0);
        assert!(Raster::new(2, 2, gt, vec![vec![0.0; 3]]).is_err());
        let raster = Raster::new(1, 1, gt, vec![vec![0.0]]).unwrap();
        let err = raster.with_crs("dem", Crs::from_epsg(3857).unwrap()).unwrap_err();
        assert!(matches!(err, EnrichError::ReferenceLoad { .. }));
    }

    #[test]
    fn block_copies_pixels_unchanged() {
        let data: Vec<f64> = (0..12).map(f64::from).collect();
        let raster = Raster::new(4, 3, GeoTransform::north_up(0.0, 3.0, 1.0), vec![data]).unwrap();
        assert_eq!(raster.block(1, 1, 2, 2), vec![vec![5.0, 6.0, 9.0, 10.0]]);
    }
}
