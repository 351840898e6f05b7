//! Tile decomposition of rasters.
//!
//! [`TileIndexer`] cuts a [`Raster`] into fixed-size pixel blocks. Tiles are
//! produced lazily, carry their own bounds and transform, and never alter
//! pixel values. When the raster size is not a multiple of the tile size the
//! last column/row of tiles is narrower/shorter; those edge tiles are kept
//! as they are.
//!
//! Point-to-tile assignment always goes through the source raster's
//! [`GeoTransform`], so a point on a shared tile edge lands in exactly one
//! tile (the one to its east/south) whatever the tile size.

use super::{GeoTransform, Raster};
use crate::config::EngineConfig;
use crate::crs::Crs;
use crate::error::{EnrichError, Result};
use geo::Rect;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::ops::Range;
use std::sync::Arc;

/// Tile coordinate `(x, y)`: tile column and tile row, from the upper left.
pub type TileKey = (u32, u32);

/// Tile layout of one raster. Small and immutable, so it is broadcast to
/// every partition while tiles themselves are not.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TileGrid {
    raster_width: usize,
    raster_height: usize,
    tile_width: usize,
    tile_height: usize,
    transform: GeoTransform,
    band_count: usize,
}

impl TileGrid {
    pub fn new(raster: &Raster, tile_width: usize, tile_height: usize) -> Result<Self> {
        if tile_width == 0 || tile_height == 0 {
            return Err(EnrichError::Config(format!(
                "tile size must be positive, got {tile_width}x{tile_height}"
            )));
        }
        Ok(Self {
            raster_width: raster.width(),
            raster_height: raster.height(),
            tile_width,
            tile_height,
            transform: *raster.transform(),
            band_count: raster.band_count(),
        })
    }

    pub fn tiles_x(&self) -> usize {
        self.raster_width.div_ceil(self.tile_width)
    }

    pub fn tiles_y(&self) -> usize {
        self.raster_height.div_ceil(self.tile_height)
    }

    /// Total number of tiles, skipped or not.
    pub fn len(&self) -> usize {
        self.tiles_x() * self.tiles_y()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn band_count(&self) -> usize {
        self.band_count
    }

    /// Every tile key in row-major order.
    pub fn keys(&self) -> impl Iterator<Item = TileKey> + '_ {
        (0..self.tiles_y()).flat_map(move |y| (0..self.tiles_x()).map(move |x| (x as u32, y as u32)))
    }

    /// Source-raster pixel of `(x, y)`, or `None` outside the raster.
    pub fn pixel_at(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let (col, row) = self.transform.pixel_index(x, y)?;
        let col = usize::try_from(col).ok().filter(|c| *c < self.raster_width)?;
        let row = usize::try_from(row).ok().filter(|r| *r < self.raster_height)?;
        Some((col, row))
    }

    /// Key of the tile containing `(x, y)`, or `None` outside the raster.
    pub fn tile_for(&self, x: f64, y: f64) -> Option<TileKey> {
        let (col, row) = self.pixel_at(x, y)?;
        Some(((col / self.tile_width) as u32, (row / self.tile_height) as u32))
    }

    /// Source pixel ranges `(cols, rows)` covered by tile `key`.
    pub fn extent(&self, key: TileKey) -> Option<(Range<usize>, Range<usize>)> {
        let (tx, ty) = (key.0 as usize, key.1 as usize);
        if tx >= self.tiles_x() || ty >= self.tiles_y() {
            return None;
        }
        let col = tx * self.tile_width;
        let row = ty * self.tile_height;
        Some((
            col..(col + self.tile_width).min(self.raster_width),
            row..(row + self.tile_height).min(self.raster_height),
        ))
    }
}

/// A rectangular pixel block of a raster.
#[derive(Clone, Debug, PartialEq)]
pub struct RasterTile {
    key: TileKey,
    cols: Range<usize>,
    rows: Range<usize>,
    source: GeoTransform,
    crs: Crs,
    nodata: Option<f64>,
    bands: Vec<Vec<f64>>,
}

impl RasterTile {
    pub fn key(&self) -> TileKey {
        self.key
    }

    /// Source raster columns covered by this tile.
    pub fn col_range(&self) -> Range<usize> {
        self.cols.clone()
    }

    /// Source raster rows covered by this tile.
    pub fn row_range(&self) -> Range<usize> {
        self.rows.clone()
    }

    pub fn width(&self) -> usize {
        self.cols.len()
    }

    pub fn height(&self) -> usize {
        self.rows.len()
    }

    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    pub fn crs(&self) -> Crs {
        self.crs
    }

    /// Transform of the tile's own pixel grid.
    pub fn transform(&self) -> GeoTransform {
        self.source.shifted(self.cols.start, self.rows.start)
    }

    /// Pixel resolution `(x, y)` in CRS units.
    pub fn resolution(&self) -> (f64, f64) {
        (self.source.x_pixel_size, self.source.y_pixel_size.abs())
    }

    pub fn bounds(&self) -> Rect<f64> {
        self.transform().bounds(self.width(), self.height())
    }

    /// Tile-local pixel `(col, row)` of `(x, y)`, or `None` when the point
    /// belongs to another tile.
    pub fn pixel_at(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let (col, row) = self.source.pixel_index(x, y)?;
        let col = usize::try_from(col).ok().filter(|c| self.cols.contains(c))?;
        let row = usize::try_from(row).ok().filter(|r| self.rows.contains(r))?;
        Some((col - self.cols.start, row - self.rows.start))
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        self.pixel_at(x, y).is_some()
    }

    /// Value of `band` at tile-local pixel `(col, row)`; nodata reads as `None`.
    pub fn value(&self, band: usize, col: usize, row: usize) -> Option<f64> {
        if col >= self.width() || row >= self.height() {
            return None;
        }
        let v = *self.bands.get(band)?.get(row * self.width() + col)?;
        self.is_valid(v).then_some(v)
    }

    /// Nearest-pixel value of `band` at `(x, y)`.
    pub fn sample(&self, band: usize, x: f64, y: f64) -> Option<f64> {
        let (col, row) = self.pixel_at(x, y)?;
        self.value(band, col, row)
    }

    /// Every band's value at `(x, y)`, or `None` when the point is elsewhere.
    pub fn sample_bands(&self, x: f64, y: f64) -> Option<Vec<Option<f64>>> {
        let (col, row) = self.pixel_at(x, y)?;
        Some((0..self.band_count()).map(|b| self.value(b, col, row)).collect())
    }

    /// Whether every pixel of every band is nodata.
    pub fn is_empty(&self) -> bool {
        self.bands.iter().flatten().all(|v| !self.is_valid(*v))
    }

    fn is_valid(&self, v: f64) -> bool {
        !v.is_nan() && self.nodata.is_none_or(|nd| v != nd)
    }
}

/// Lazily decomposes a raster into [`RasterTile`]s.
pub struct TileIndexer<'a> {
    raster: &'a Raster,
    grid: TileGrid,
    skip_empty: bool,
}

impl<'a> TileIndexer<'a> {
    pub fn new(raster: &'a Raster, tile_width: usize, tile_height: usize) -> Result<Self> {
        Ok(Self {
            raster,
            grid: TileGrid::new(raster, tile_width, tile_height)?,
            skip_empty: false,
        })
    }

    /// Indexer using the configured tile size and empty-tile policy.
    pub fn from_config(raster: &'a Raster, config: &EngineConfig) -> Result<Self> {
        Ok(Self::new(raster, config.tile_width, config.tile_height)?
            .skip_empty_tiles(config.skip_empty_tiles))
    }

    /// Drop tiles whose pixels are all nodata.
    #[must_use]
    pub fn skip_empty_tiles(mut self, skip: bool) -> Self {
        self.skip_empty = skip;
        self
    }

    pub fn grid(&self) -> &TileGrid {
        &self.grid
    }

    /// Materialize one tile. `None` for keys outside the grid and for
    /// skipped empty tiles.
    pub fn tile(&self, key: TileKey) -> Option<RasterTile> {
        let (cols, rows) = self.grid.extent(key)?;
        let tile = RasterTile {
            key,
            bands: self.raster.block(cols.start, rows.start, cols.len(), rows.len()),
            cols,
            rows,
            source: *self.raster.transform(),
            crs: self.raster.crs(),
            nodata: self.raster.nodata(),
        };
        if self.skip_empty && tile.is_empty() {
            return None;
        }
        Some(tile)
    }

    /// Lazy iterator over tiles in row-major order.
    pub fn tiles(&self) -> Tiles<'_, 'a> {
        Tiles { indexer: self, next: 0 }
    }
}

/// Iterator returned by [`TileIndexer::tiles`].
pub struct Tiles<'i, 'a> {
    indexer: &'i TileIndexer<'a>,
    next: usize,
}

impl Iterator for Tiles<'_, '_> {
    type Item = RasterTile;

    fn next(&mut self) -> Option<RasterTile> {
        let grid = &self.indexer.grid;
        while self.next < grid.len() {
            let i = self.next;
            self.next += 1;
            let key = ((i % grid.tiles_x()) as u32, (i / grid.tiles_x()) as u32);
            if let Some(tile) = self.indexer.tile(key) {
                return Some(tile);
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.indexer.grid.len() - self.next))
    }
}

/// Bounded per-partition cache of materialized tiles, evicting the least
/// recently used tile. Absent (skipped) tiles are cached too.
pub struct TileCache {
    capacity: usize,
    order: VecDeque<TileKey>,
    tiles: HashMap<TileKey, Option<Arc<RasterTile>>>,
    loads: usize,
}

impl TileCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            tiles: HashMap::new(),
            loads: 0,
        }
    }

    /// Cached tile for `key`, materializing it with `load` on a miss.
    pub fn get_or_load(
        &mut self,
        key: TileKey,
        load: impl FnOnce(TileKey) -> Option<RasterTile>,
    ) -> Option<Arc<RasterTile>> {
        if let Some(tile) = self.tiles.get(&key).cloned() {
            if let Some(pos) = self.order.iter().position(|k| *k == key) {
                self.order.remove(pos);
            }
            self.order.push_back(key);
            return tile;
        }
        if self.tiles.len() >= self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.tiles.remove(&old);
            }
        }
        self.loads += 1;
        let tile = load(key).map(Arc::new);
        self.tiles.insert(key, tile.clone());
        self.order.push_back(key);
        tile
    }

    /// Tiles materialized so far, counting reloads after eviction.
    pub fn loads(&self) -> usize {
        self.loads
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }
}
