//! Enrichment stages over point datasets.
//!
//! Points enter as a [`Dataset<EnrichedPointRecord>`] partitioned by trip id
//! and pass through one stage per [`ReferenceLayer`]:
//!
//! * polygon layers are broadcast and matched with a partition-local map;
//! * raster layers are joined by containment: points are keyed by the tile
//!   that holds them, shuffled by tile key, and each partition materializes
//!   only the tiles its points need (through a bounded [`TileCache`]). The
//!   raster itself is never shipped to partitions as a whole.
//!
//! After each stage the points are back in trip-id partitions, so the merge
//! joins run partition-local.

use crate::broadcast::Broadcast;
use crate::classify::ClassificationTable;
use crate::context::ExecutionContext;
use crate::dataset::Dataset;
use crate::error::{EnrichError, Result};
use crate::matcher::{self, MatchStats, MatchSummary, PixelSample};
use crate::partition::Partitioner;
use crate::raster::{self, Raster, RasterLayerSpec, TileCache, TileGrid, TileIndexer, TileKey};
use crate::records::{AttrKind, AttrValue, Attributes, ColumnSpec, EnrichedPointRecord, PointRecord};
use crate::regions::{self, RegionLayer, VectorLayerSpec};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A reference layer as declared in configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayerSpec {
    Vector(VectorLayerSpec),
    Raster(RasterLayerSpec),
}

impl LayerSpec {
    pub fn name(&self) -> &str {
        match self {
            Self::Vector(v) => &v.name,
            Self::Raster(r) => &r.name,
        }
    }
}

/// A raster layer ready for matching.
pub struct RasterReference {
    name: String,
    raster: Arc<Raster>,
    classification: Option<Broadcast<ClassificationTable>>,
}

impl RasterReference {
    pub fn new(name: impl Into<String>, raster: Raster) -> Self {
        Self {
            name: name.into(),
            raster: Arc::new(raster),
            classification: None,
        }
    }

    /// Classify band 1 through `table`. The raw value is kept as a working
    /// column and dropped by the merge.
    #[must_use]
    pub fn with_classification(mut self, table: ClassificationTable) -> Self {
        self.classification = Some(Broadcast::new(&format!("{}:classes", self.name), table));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn raster(&self) -> &Raster {
        &self.raster
    }

    fn value_column(&self, band: usize) -> String {
        if self.raster.band_count() == 1 {
            self.name.clone()
        } else {
            format!("{}_b{}", self.name, band + 1)
        }
    }

    fn raw_column(&self) -> String {
        format!("{}_raw", self.name)
    }

    fn tile_column(&self) -> String {
        format!("{}_tile", self.name)
    }

    pub fn output_columns(&self) -> Vec<ColumnSpec> {
        (0..self.raster.band_count())
            .map(|b| {
                let kind = if b == 0 && self.classification.is_some() {
                    AttrKind::Text
                } else {
                    AttrKind::Float
                };
                ColumnSpec::new(self.value_column(b), kind)
            })
            .collect()
    }

    /// Output and working attributes for one sample.
    fn attributes(&self, sample: Option<&PixelSample>, stats: &MatchStats) -> (Attributes, Attributes) {
        let mut out = Attributes::new();
        let mut working = Attributes::new();
        let first = sample.and_then(|s| s.value(0));
        if first.is_some() {
            stats.record_match();
        } else {
            stats.record_miss();
        }
        for b in 0..self.raster.band_count() {
            let v = sample.and_then(|s| s.value(b));
            let value = match (&self.classification, b) {
                (Some(table), 0) => {
                    let label = table.classify(v);
                    if label.as_deref() == Some(table.default_label()) {
                        stats.record_unknown_class();
                    }
                    label.map(AttrValue::Text)
                }
                _ => v.map(AttrValue::Float),
            };
            out.insert(self.value_column(b), value);
        }
        if self.classification.is_some() {
            working.insert(self.raw_column(), first.map(AttrValue::Float));
        }
        working.insert(
            self.tile_column(),
            sample.map(|s| AttrValue::Text(format!("{}/{}", s.tile.0, s.tile.1))),
        );
        (out, working)
    }
}

/// A loaded reference layer.
pub enum ReferenceLayer {
    Regions(Broadcast<RegionLayer>),
    Raster(RasterReference),
}

impl ReferenceLayer {
    /// Load and normalize a layer into the working CRS.
    pub fn load(spec: &LayerSpec) -> Result<Self> {
        match spec {
            LayerSpec::Vector(v) => {
                let layer = regions::load_vector_layer(v)?;
                Ok(Self::Regions(Broadcast::new(&v.name, layer)))
            }
            LayerSpec::Raster(r) => {
                let mut reference = RasterReference::new(&r.name, raster::load_raster(r)?);
                if let Some(c) = &r.classification {
                    reference = reference.with_classification(c.build(&r.name)?);
                }
                Ok(Self::Raster(reference))
            }
        }
    }

    pub fn regions(layer: RegionLayer) -> Self {
        let name = layer.name().to_string();
        Self::Regions(Broadcast::new(&name, layer))
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Regions(l) => l.name(),
            Self::Raster(r) => r.name(),
        }
    }

    pub fn output_columns(&self) -> Vec<ColumnSpec> {
        match self {
            Self::Regions(l) => l.output_columns(),
            Self::Raster(r) => r.output_columns(),
        }
    }
}

/// Turn raw points into an enrichable dataset partitioned by trip id.
pub fn point_dataset(
    ctx: &ExecutionContext,
    points: Vec<PointRecord>,
    partitioner: &Partitioner,
) -> Dataset<EnrichedPointRecord> {
    Dataset::from_vec(ctx, points)
        .map(|p| EnrichedPointRecord::from(p.clone()))
        .partition_by(partitioner, EnrichedPointRecord::trip_id)
        .label("points")
}

/// Attach a polygon layer's attributes to every point.
pub fn enrich_regions(
    points: &Dataset<EnrichedPointRecord>,
    layer: &Broadcast<RegionLayer>,
    stats: &MatchStats,
) -> Dataset<EnrichedPointRecord> {
    let stats = stats.clone();
    points
        .map_with_broadcast(layer, move |rec, layer| {
            let (x, y) = rec.point.xy();
            let m = matcher::match_region(layer, x, y);
            match m.containing {
                0 => stats.record_miss(),
                1 => stats.record_match(),
                _ => {
                    stats.record_match();
                    stats.record_ambiguous();
                }
            }
            let mut out = rec.clone();
            out.attributes.extend(matcher::region_attributes(layer, m.region));
            out
        })
        .label(&format!("match:{}", layer.label()))
}

/// Attach raster samples (or labels) to every point by a tile containment join.
pub fn enrich_raster(
    points: &Dataset<EnrichedPointRecord>,
    reference: &RasterReference,
    stats: &MatchStats,
) -> Result<Dataset<EnrichedPointRecord>> {
    let ctx = points.context();
    let config = ctx.config().clone();
    let grid = Broadcast::new(
        &format!("{}:grid", reference.name),
        TileGrid::new(&reference.raster, config.tile_width, config.tile_height)?,
    );
    log::debug!(
        "raster `{}`: {} tiles of {}x{}",
        reference.name,
        grid.len(),
        config.tile_width,
        config.tile_height
    );

    let by_trip = points
        .partitioner()
        .cloned()
        .unwrap_or_else(|| Partitioner::hash(ctx.partitions()));
    let by_tile = Partitioner::hash(ctx.partitions());

    let keyed: Dataset<(Option<TileKey>, EnrichedPointRecord)> = points
        .map_with_broadcast(&grid, |rec, grid| {
            let (x, y) = rec.point.xy();
            (grid.tile_for(x, y), rec.clone())
        })
        .partition_by(&by_tile, |(key, _)| key.unwrap_or((u32::MAX, u32::MAX)))
        .label(&format!("tile-keyed:{}", reference.name));

    let matched = keyed.try_map_partitions(|rows| {
        let indexer = TileIndexer::from_config(&reference.raster, &config)?;
        let mut cache = TileCache::new(config.tile_cache_capacity());
        // Visit rows tile by tile so each tile is cut once per partition.
        let mut order: Vec<&(Option<TileKey>, EnrichedPointRecord)> = rows.iter().collect();
        order.sort_by_key(|(key, _)| *key);
        let mut out = Vec::with_capacity(rows.len());
        for (key, rec) in order {
            let (x, y) = rec.point.xy();
            let tile = key.and_then(|k| cache.get_or_load(k, |k| indexer.tile(k)));
            let sample = tile.as_deref().and_then(|t| matcher::sample_tiles([t], x, y));
            let (attrs, working) = reference.attributes(sample.as_ref(), stats);
            let mut rec = rec.clone();
            rec.attributes.extend(attrs);
            rec.working.extend(working);
            out.push(rec);
        }
        log::trace!("partition cut {} tiles for {} points", cache.loads(), rows.len());
        Ok(out)
    })?;

    Ok(matched
        .partition_by(&by_trip, EnrichedPointRecord::trip_id)
        .label(&format!("match:{}", reference.name)))
}

/// Applies every reference layer to a point dataset, in order.
pub struct Enricher {
    layers: Vec<ReferenceLayer>,
}

impl Enricher {
    pub fn new(layers: Vec<ReferenceLayer>) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        for layer in &layers {
            if !seen.insert(layer.name()) {
                return Err(EnrichError::Config(format!(
                    "reference layer `{}` declared twice",
                    layer.name()
                )));
            }
        }
        Ok(Self { layers })
    }

    /// Load every layer in `specs`.
    pub fn load(specs: &[LayerSpec]) -> Result<Self> {
        Self::new(specs.iter().map(ReferenceLayer::load).collect::<Result<_>>()?)
    }

    pub fn layers(&self) -> &[ReferenceLayer] {
        &self.layers
    }

    /// Enrichment columns of all layers, in layer order.
    pub fn output_columns(&self) -> Vec<ColumnSpec> {
        self.layers.iter().flat_map(ReferenceLayer::output_columns).collect()
    }

    /// Run every layer stage over `points`. Match quality is logged per layer.
    pub fn enrich(&self, points: &Dataset<EnrichedPointRecord>) -> Result<Dataset<EnrichedPointRecord>> {
        self.enrich_with_stats(points).map(|(out, _)| out)
    }

    /// Like [`enrich`](Self::enrich), also returning each layer's match counters.
    pub fn enrich_with_stats(
        &self,
        points: &Dataset<EnrichedPointRecord>,
    ) -> Result<(Dataset<EnrichedPointRecord>, Vec<(String, MatchSummary)>)> {
        let mut current = points.clone();
        let mut summaries = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let stats = MatchStats::new();
            current = match layer {
                ReferenceLayer::Regions(l) => enrich_regions(&current, l, &stats),
                ReferenceLayer::Raster(r) => enrich_raster(&current, r, &stats)?,
            };
            stats.log_summary(layer.name());
            summaries.push((layer.name().to_string(), stats.summary()));
        }
        Ok((current, summaries))
    }
}
