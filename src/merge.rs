//! Result merger: points back into trips.
//!
//! A trip is split into two role-tagged points by [`split_endpoints`]. After
//! enrichment, [`merge_trips`] reassembles them with two sequential left joins
//! on trip id (trips ⟕ pickups, then ⟕ dropoffs), prefixes every enrichment
//! column with `pickup_` / `dropoff_`, and drops working columns. A trip
//! without a matching point still comes out once, with nulls.
//!
//! More than one point per (trip, role) would fan a trip out into several
//! rows; the merger refuses such input instead.

use crate::dataset::Dataset;
use crate::error::{EnrichError, Result};
use crate::partition::Partitioner;
use crate::records::{Attributes, ColumnSpec, EnrichedPointRecord, MergedTripRecord, PointRecord, Role, Trip};
use crate::window::TripId;
use std::collections::HashSet;

/// Split every trip into its pickup and dropoff points.
pub fn split_endpoints<T: Trip>(trips: &Dataset<T>) -> Dataset<PointRecord> {
    trips.flat_map(T::endpoints).label("split_endpoints")
}

/// Column name of `column` for `role` in merged output.
pub fn prefixed(role: Role, column: &str) -> String {
    format!("{}{column}", role.prefix())
}

/// Enrichment columns of merged output: every column once per role,
/// pickup columns first.
pub fn merged_columns(columns: &[ColumnSpec]) -> Vec<ColumnSpec> {
    [Role::Pickup, Role::Dropoff]
        .into_iter()
        .flat_map(|role| {
            columns
                .iter()
                .map(move |c| ColumnSpec::new(prefixed(role, &c.name), c.kind))
        })
        .collect()
}

/// Merge enriched points back into trips.
///
/// `columns` are the enrichment columns to carry over; anything else on the
/// points (coordinates, role flag, working columns) is dropped.
pub fn merge_trips<T: Trip>(
    trips: &Dataset<T>,
    enriched: &Dataset<EnrichedPointRecord>,
    columns: &[ColumnSpec],
) -> Result<Dataset<MergedTripRecord<T>>> {
    let partitioner = enriched
        .partitioner()
        .cloned()
        .unwrap_or_else(|| Partitioner::hash(trips.context().partitions()));

    let pickups = role_side(enriched, Role::Pickup, &partitioner)?;
    let dropoffs = role_side(enriched, Role::Dropoff, &partitioner)?;
    let keyed = trips
        .key_by(T::trip_id)
        .partition_by_key(&partitioner)
        .label("trips_by_id");

    let with_pickup = keyed.join_left(&pickups).label("join:pickup");
    let with_both = with_pickup.join_left(&dropoffs).label("join:dropoff");

    let columns = columns.to_vec();
    Ok(with_both
        .map(move |(_, ((trip, pickup), dropoff))| MergedTripRecord {
            trip: trip.clone(),
            columns: merge_columns(pickup.as_ref(), dropoff.as_ref(), &columns),
        })
        .label("merged_trips"))
}

/// One role's points keyed by trip id, with at most one point per trip.
fn role_side(
    enriched: &Dataset<EnrichedPointRecord>,
    role: Role,
    partitioner: &Partitioner,
) -> Result<Dataset<(TripId, EnrichedPointRecord)>> {
    enriched
        .filter(move |r| r.point.role() == role)
        .key_by(EnrichedPointRecord::trip_id)
        .partition_by_key(partitioner)
        .try_map_partitions(|rows| {
            let mut seen = HashSet::with_capacity(rows.len());
            for (trip_id, _) in rows {
                if !seen.insert(*trip_id) {
                    return Err(EnrichError::Other(anyhow::anyhow!(
                        "trip {trip_id} has more than one {} point",
                        role.prefix().trim_end_matches('_')
                    )));
                }
            }
            Ok(rows.to_vec())
        })
}

fn merge_columns(
    pickup: Option<&EnrichedPointRecord>,
    dropoff: Option<&EnrichedPointRecord>,
    columns: &[ColumnSpec],
) -> Attributes {
    let mut out = Attributes::new();
    for (role, point) in [(Role::Pickup, pickup), (Role::Dropoff, dropoff)] {
        for c in columns {
            let v = point.and_then(|p| p.attributes.get(&c.name).cloned().flatten());
            out.insert(prefixed(role, &c.name), v);
        }
    }
    out
}

#[cfg(feature = "io-parquet")]
pub use columnar::merged_record_batch;

#[cfg(feature = "io-parquet")]
mod columnar {
    use super::merged_columns;
    use crate::records::{AttrKind, AttrValue, ColumnSpec, MergedTripRecord, Trip};
    use anyhow::{Context, Result};
    use arrow::array::{ArrayRef, Float64Builder, Int64Builder, StringBuilder};
    use arrow::datatypes::{DataType, Field, FieldRef, Schema};
    use arrow::record_batch::RecordBatch;
    use serde_arrow::schema::{SchemaLike, TracingOptions};
    use serde_arrow::to_record_batch;
    use std::sync::Arc;

    /// Render merged trips as one Arrow batch: the trip's own columns (minus
    /// its raw coordinate columns) followed by the prefixed enrichment columns.
    pub fn merged_record_batch<T: Trip>(
        rows: &[MergedTripRecord<T>],
        columns: &[ColumnSpec],
    ) -> Result<RecordBatch> {
        let trip_fields: Vec<FieldRef> = Vec::<FieldRef>::from_type::<T>(TracingOptions::default())
            .context("infer Arrow schema from trip type")?;
        let trips: Vec<&T> = rows.iter().map(|r| &r.trip).collect();
        let trip_batch = to_record_batch(&trip_fields, &trips).context("convert trips to RecordBatch")?;

        let spatial = T::spatial_columns();
        let mut fields: Vec<FieldRef> = Vec::new();
        let mut arrays: Vec<ArrayRef> = Vec::new();
        for (field, array) in trip_batch.schema().fields().iter().zip(trip_batch.columns()) {
            if !spatial.contains(&field.name().as_str()) {
                fields.push(Arc::clone(field));
                arrays.push(Arc::clone(array));
            }
        }

        for col in merged_columns(columns) {
            let values = rows.iter().map(|r| r.columns.get(&col.name).and_then(Option::as_ref));
            let (data_type, array): (DataType, ArrayRef) = match col.kind {
                AttrKind::Int => {
                    let mut b = Int64Builder::with_capacity(rows.len());
                    for v in values {
                        b.append_option(match v {
                            Some(AttrValue::Int(i)) => Some(*i),
                            _ => None,
                        });
                    }
                    (DataType::Int64, Arc::new(b.finish()))
                }
                AttrKind::Float => {
                    let mut b = Float64Builder::with_capacity(rows.len());
                    for v in values {
                        b.append_option(v.and_then(AttrValue::as_f64));
                    }
                    (DataType::Float64, Arc::new(b.finish()))
                }
                AttrKind::Text => {
                    let mut b = StringBuilder::with_capacity(rows.len(), rows.len() * 16);
                    for v in values {
                        b.append_option(v.map(ToString::to_string));
                    }
                    (DataType::Utf8, Arc::new(b.finish()))
                }
            };
            fields.push(Arc::new(Field::new(&col.name, data_type, true)));
            arrays.push(array);
        }

        RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).context("assemble merged RecordBatch")
    }
}
