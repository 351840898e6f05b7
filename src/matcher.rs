//! Point matching against polygon and raster reference layers.
//!
//! Both variants are pure functions of the point and an immutable reference
//! set, so they run on disjoint partitions without coordination. Misses are
//! not errors: they produce null attributes and are counted in
//! [`MatchStats`].

use crate::raster::{RasterTile, TileKey};
use crate::records::{AttrValue, Attributes};
use crate::regions::{RegionLayer, RegionPolygon};
use geo::Coord;
use geo::coordinate_position::{CoordPos, CoordinatePosition};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Result of matching one point against a polygon layer.
#[derive(Clone, Copy, Debug)]
pub struct RegionMatch<'a> {
    /// Lowest-id region containing the point.
    pub region: Option<&'a RegionPolygon>,
    /// How many regions contain the point. More than one means the layer has
    /// overlapping regions.
    pub containing: usize,
}

/// Match `(x, y)` against `layer`. Boundary points count as contained. When
/// regions overlap, the one with the lowest id wins. Non-finite coordinates
/// match nothing.
pub fn match_region(layer: &RegionLayer, x: f64, y: f64) -> RegionMatch<'_> {
    if !(x.is_finite() && y.is_finite()) {
        return RegionMatch { region: None, containing: 0 };
    }
    let c = Coord { x, y };
    let mut hits = layer
        .candidates(x, y)
        .into_iter()
        .filter(|r| r.geometry.coordinate_position(&c) != CoordPos::Outside);
    let region = hits.next();
    let containing = usize::from(region.is_some()) + hits.count();
    RegionMatch { region, containing }
}

/// The region containing `(x, y)`, if any.
pub fn locate_region(layer: &RegionLayer, x: f64, y: f64) -> Option<&RegionPolygon> {
    match_region(layer, x, y).region
}

/// Output attributes for a match, named as in [`RegionLayer::output_columns`].
/// Every column is present; a miss yields all nulls.
pub fn region_attributes(layer: &RegionLayer, region: Option<&RegionPolygon>) -> Attributes {
    let mut out = Attributes::new();
    out.insert(
        layer.column_name("key"),
        region.map(|r| AttrValue::Text(r.key.clone())),
    );
    out.insert(
        layer.column_name("name"),
        region.and_then(|r| r.name.clone()).map(AttrValue::Text),
    );
    for col in layer.attribute_columns() {
        let v = region.and_then(|r| r.attributes.get(&col.name).cloned().flatten());
        out.insert(layer.column_name(&col.name), v);
    }
    out
}

/// One nearest-pixel sample.
#[derive(Clone, Debug, PartialEq)]
pub struct PixelSample {
    pub tile: TileKey,
    /// Tile-local `(col, row)`.
    pub pixel: (usize, usize),
    /// One value per band; nodata is `None`.
    pub values: Vec<Option<f64>>,
}

impl PixelSample {
    pub fn value(&self, band: usize) -> Option<f64> {
        self.values.get(band).copied().flatten()
    }
}

/// Sample `(x, y)` from the first candidate tile containing it. `None` when
/// no candidate contains the point.
pub fn sample_tiles<'t>(
    tiles: impl IntoIterator<Item = &'t RasterTile>,
    x: f64,
    y: f64,
) -> Option<PixelSample> {
    tiles.into_iter().find_map(|tile| {
        let pixel = tile.pixel_at(x, y)?;
        Some(PixelSample {
            tile: tile.key(),
            pixel,
            values: (0..tile.band_count())
                .map(|b| tile.value(b, pixel.0, pixel.1))
                .collect(),
        })
    })
}

#[derive(Default)]
struct Counters {
    matched: AtomicU64,
    missed: AtomicU64,
    ambiguous: AtomicU64,
    unknown_class: AtomicU64,
}

/// Data-quality counters shared by every partition of one matching stage.
#[derive(Clone, Default)]
pub struct MatchStats {
    inner: Arc<Counters>,
}

/// Point-in-time copy of [`MatchStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MatchSummary {
    /// Points that found a region or a valid pixel.
    pub matched: u64,
    /// Points outside every reference geometry, or on nodata.
    pub missed: u64,
    /// Points contained by more than one region.
    pub ambiguous: u64,
    /// Sampled values absent from the classification table.
    pub unknown_class: u64,
}

impl MatchSummary {
    pub fn total(&self) -> u64 {
        self.matched + self.missed
    }
}

impl MatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_match(&self) {
        self.inner.matched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.inner.missed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ambiguous(&self) {
        self.inner.ambiguous.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unknown_class(&self) {
        self.inner.unknown_class.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> MatchSummary {
        MatchSummary {
            matched: self.inner.matched.load(Ordering::Relaxed),
            missed: self.inner.missed.load(Ordering::Relaxed),
            ambiguous: self.inner.ambiguous.load(Ordering::Relaxed),
            unknown_class: self.inner.unknown_class.load(Ordering::Relaxed),
        }
    }

    /// Log the counters for `layer`; `warn` when anything was missed.
    pub fn log_summary(&self, layer: &str) {
        let s = self.summary();
        let report = serde_json::json!({ "layer": layer, "points": s.total(), "stats": s });
        if s.missed > 0 || s.ambiguous > 0 || s.unknown_class > 0 {
            log::warn!("match quality: {report}");
        } else {
            log::info!("match quality: {report}");
        }
    }
}
