//! # Geobeam
//!
//! A **batch geospatial enrichment engine**. Geobeam takes trip records that
//! carry a pickup and a dropoff coordinate, matches each endpoint against
//! polygon layers (neighborhoods, tracts, zones) and raster layers (land cover,
//! elevation, climate grids), and writes one enriched row per trip with
//! `pickup_*` / `dropoff_*` columns.
//!
//! ## Key Features
//!
//! - **Polygon matching** - R-tree candidates plus exact containment, boundary inclusive
//! - **Raster matching as a join** - points meet raster tiles by tile key, never the whole raster
//! - **Classification tables** - discrete raster values to labels, `"Unknown"` for the rest
//! - **Reference loading** - GeoJSON directories with CSV attribute tables; ASCII grid,
//!   GeoTIFF and NetCDF classic rasters, gzipped or not
//! - **Windowed batches** - disjoint trip-id windows, retries, and a resume ledger
//! - **Parquet snapshots** - range reads pruned by row-group statistics, atomic window parts
//!
//! ## Quick Start
//!
//! ```ignore
//! use geobeam::*;
//!
//! let config = EngineConfig::from_file("geobeam.toml")?;
//! let layers = vec![
//!     LayerSpec::Vector(VectorLayerSpec {
//!         name: "nbhd".into(),
//!         dir: "ref/neighborhoods".into(),
//!         key_property: "ntacode".into(),
//!         name_property: Some("ntaname".into()),
//!         carry_properties: vec!["boro_name".into()],
//!         crs: None,
//!         attributes: None,
//!     }),
//!     LayerSpec::Raster(RasterLayerSpec {
//!         name: "landcover".into(),
//!         path: "ref/nlcd.tif".into(),
//!         crs: None,
//!         variable: None,
//!         classification: Some(ClassificationSpec::Builtin("nlcd".into())),
//!     }),
//! ];
//! let engine = BatchEnricher::new(config, &layers)?.with_ledger("out/ledger.json");
//!
//! let trips = SnapshotStore::open("data/trips")?;
//! let out = SnapshotStore::open("out/enriched")?;
//! let report = engine.run::<TaxiTrip>(&trips, &out)?;
//! println!("{} rows", report.rows_written());
//! ```
//!
//! ## Core Concepts
//!
//! ### Execution context
//!
//! An [`ExecutionContext`] owns a dedicated worker pool and the stage graph of
//! a run. It is acquired from an immutable [`EngineConfig`] and released when
//! dropped; [`ExecutionContext::scope`] releases it on every exit path.
//!
//! ### Datasets
//!
//! A [`Dataset<T>`] is a partitioned, materialized collection. Every transform
//! runs partition-wise on the context's pool and registers a stage in the
//! [`Pipeline`]:
//! - [`map`](Dataset::map), [`flat_map`](Dataset::flat_map), [`filter`](Dataset::filter)
//! - [`key_by`](Dataset::key_by), [`partition_by`](Dataset::partition_by)
//! - [`join_left`](Dataset::join_left) - partition-local when both sides share a [`Partitioner`]
//! - [`map_with_broadcast`](Dataset::map_with_broadcast) - read a [`Broadcast`] reference value
//!
//! ### Reference layers
//!
//! [`RegionLayer`]s are small and broadcast to every partition. Rasters are
//! cut into tiles by a [`TileIndexer`]; partitions cut only the tiles their
//! points fall in.
//!
//! ### Errors
//!
//! Per-point misses are not errors: they become nulls and are counted in
//! [`MatchStats`](matcher::MatchStats). Reference load and raster decode
//! failures abort the run. Orchestrated runs report the failing stage and
//! window through [`EnrichError::Stage`].
//!
//! ## Feature Flags
//!
//! - `io-parquet` - Parquet snapshot store and columnar rendering of merged rows
//! - `io-csv` - CSV attribute tables for vector layers
//! - `raster-geotiff` - GeoTIFF decoding
//! - `compression-gzip` - transparent gunzip of reference rasters
//!
//! ## Module Overview
//!
//! - [`config`] - Engine configuration
//! - [`context`] - Scoped execution context
//! - [`dataset`], [`join`], [`broadcast`], [`partition`] - Partitioned runtime
//! - [`regions`], [`raster`], [`crs`] - Reference loading
//! - [`matcher`], [`classify`], [`enrich`] - Matching
//! - [`merge`], [`store`], [`orchestrator`] - Output
//! - [`testing`] - Failure injection for retry tests

pub mod broadcast;
pub mod classify;
pub mod config;
pub mod context;
pub mod crs;
pub mod dataset;
pub mod enrich;
pub mod error;
pub mod join;
pub mod matcher;
pub mod merge;
pub mod orchestrator;
pub mod partition;
pub mod pipeline;
pub mod raster;
pub mod records;
pub mod regions;
pub mod store;
pub mod testing;
pub mod window;

// General re-exports
pub use broadcast::Broadcast;
pub use classify::{ClassificationSpec, ClassificationTable};
pub use config::{EngineConfig, WriteStrategy};
pub use context::ExecutionContext;
pub use crs::Crs;
pub use dataset::{Dataset, Element};
pub use enrich::{Enricher, LayerSpec, ReferenceLayer};
pub use error::{EnrichError, Result, Stage};
pub use orchestrator::{BatchEnricher, RunReport};
pub use partition::Partitioner;
pub use pipeline::Pipeline;
pub use raster::{Raster, RasterLayerSpec, TileIndexer};
pub use records::{AttrValue, MergedTripRecord, PointRecord, Role, TaxiTrip, Trip};
pub use regions::{RegionLayer, RegionPolygon, VectorLayerSpec};
pub use store::{MemorySink, ResultSink, TripSource, VecSource, WriteMode};
pub use window::{KeyRange, TripId};

// Gated re-exports
#[cfg(feature = "io-parquet")]
pub use store::SnapshotStore;
