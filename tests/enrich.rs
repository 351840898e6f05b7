mod common;

use anyhow::Result;
use common::{config, reference_layers, trip, trips};
use geobeam::context::ExecutionContext;
use geobeam::dataset::Dataset;
use geobeam::enrich::{Enricher, RasterReference, ReferenceLayer, point_dataset};
use geobeam::matcher::MatchSummary;
use geobeam::merge::{merge_trips, split_endpoints};
use geobeam::partition::Partitioner;
use geobeam::raster::{GeoTransform, Raster};
use geobeam::records::{AttrKind, AttrValue, ColumnSpec, MergedTripRecord, PointRecord, Role, TaxiTrip};
use geobeam::{BatchEnricher, EngineConfig};
use std::collections::BTreeSet;

fn build_engine(cfg: EngineConfig) -> Result<(tempfile::TempDir, BatchEnricher)> {
    let tmp = tempfile::tempdir()?;
    let layers = reference_layers(tmp.path())?;
    let engine = BatchEnricher::new(cfg, &layers)?;
    Ok((tmp, engine))
}

fn text(row: &MergedTripRecord<TaxiTrip>, column: &str) -> Option<String> {
    row.get(column).and_then(AttrValue::as_str).map(str::to_string)
}

#[test]
fn every_trip_comes_back_once_with_its_fields_unchanged() -> Result<()> {
    let (_tmp, engine) = build_engine(config(4))?;
    let input = trips(0..40);
    let rows = engine.enrich_all(input.clone())?;

    assert_eq!(rows.len(), input.len());
    let ids: Vec<i64> = rows.iter().map(MergedTripRecord::trip_id).collect();
    assert_eq!(ids, (0..40).collect::<Vec<_>>());
    for (row, original) in rows.iter().zip(&input) {
        assert_eq!(&row.trip, original);
    }
    Ok(())
}

#[test]
fn endpoints_are_enriched_under_role_prefixes() -> Result<()> {
    let (_tmp, engine) = build_engine(config(3))?;
    let rows = engine.enrich_all(trips(0..20))?;

    let expected: BTreeSet<String> = [
        "pickup_nbhd_key",
        "pickup_nbhd_name",
        "pickup_nbhd_population",
        "pickup_landcover",
        "dropoff_nbhd_key",
        "dropoff_nbhd_name",
        "dropoff_nbhd_population",
        "dropoff_landcover",
    ]
    .into_iter()
    .map(String::from)
    .collect();
    let declared: BTreeSet<String> = engine.merged_columns().into_iter().map(|c| c.name).collect();
    assert_eq!(declared, expected);

    for row in &rows {
        let keys: BTreeSet<String> = row.columns.keys().cloned().collect();
        assert_eq!(keys, expected, "trip {} has unexpected columns", row.trip_id());

        let i = row.trip_id();
        if i % 2 == 0 {
            assert_eq!(text(row, "pickup_nbhd_key").as_deref(), Some("A"));
            assert_eq!(text(row, "pickup_nbhd_name").as_deref(), Some("Alpha"));
            assert_eq!(text(row, "pickup_landcover").as_deref(), Some("Open Water"));
        } else {
            assert_eq!(text(row, "pickup_nbhd_key").as_deref(), Some("B"));
            assert_eq!(text(row, "pickup_landcover").as_deref(), Some("Developed, Low Intensity"));
        }
        assert_eq!(row.get("pickup_nbhd_population"), Some(&AttrValue::Int(1000)));

        if i % 5 == 0 {
            assert_eq!(row.get("dropoff_nbhd_key"), None);
            assert_eq!(row.get("dropoff_landcover"), None);
            assert_eq!(row.columns.get("dropoff_landcover"), Some(&None));
        } else {
            assert_eq!(text(row, "dropoff_nbhd_key").as_deref(), Some("A"));
            assert_eq!(text(row, "dropoff_landcover").as_deref(), Some("Evergreen Forest"));
        }
    }
    Ok(())
}

#[test]
fn working_columns_never_reach_merged_rows() -> Result<()> {
    let (_tmp, engine) = build_engine(config(2))?;
    let rows = engine.enrich_all(trips(1..5))?;
    for row in &rows {
        for name in row.columns.keys() {
            assert!(!name.ends_with("_raw"), "{name}");
            assert!(!name.ends_with("_tile"), "{name}");
        }
    }
    Ok(())
}

#[test]
fn results_do_not_depend_on_partitions_or_tile_size() -> Result<()> {
    let input = trips(0..60);
    let (_tmp, reference) = build_engine(EngineConfig {
        partitions: 1,
        tile_width: 64,
        tile_height: 64,
        ..config(1)
    })?;
    let expected = reference.enrich_all(input.clone())?;

    for (partitions, tw, th) in [(2, 1, 1), (5, 3, 1), (8, 2, 2), (13, 4, 2)] {
        let (_tmp, engine) = build_engine(EngineConfig {
            tile_width: tw,
            tile_height: th,
            ..config(partitions)
        })?;
        assert_eq!(
            engine.enrich_all(input.clone())?,
            expected,
            "{partitions} partitions, {tw}x{th} tiles"
        );
    }
    Ok(())
}

#[test]
fn match_counters_report_hits_and_misses() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let enricher = Enricher::load(&reference_layers(tmp.path())?)?;
    let ctx = ExecutionContext::acquire(&config(4))?;

    let p = Partitioner::hash(ctx.partitions());
    let points: Vec<PointRecord> = trips(0..40).iter().flat_map(geobeam::Trip::endpoints).collect();
    let points = point_dataset(&ctx, points, &p);
    let (enriched, summaries) = enricher.enrich_with_stats(&points)?;

    assert_eq!(enriched.len(), 80);
    let names: Vec<&str> = summaries.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["nbhd", "landcover"]);
    // Eight of the forty dropoffs are far outside every layer.
    let expected = MatchSummary {
        matched: 72,
        missed: 8,
        ambiguous: 0,
        unknown_class: 0,
    };
    assert_eq!(summaries[0].1, expected);
    assert_eq!(summaries[1].1, expected);

    // Raster working columns are present before the merge.
    let sample = enriched.collect().into_iter().find(|r| r.trip_id() == 1).expect("trip 1");
    assert!(sample.working.contains_key("landcover_raw"));
    assert!(sample.working.contains_key("landcover_tile"));
    Ok(())
}

#[test]
fn unknown_classes_are_labelled_and_counted() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let enricher = Enricher::load(&reference_layers(tmp.path())?)?;
    let ctx = ExecutionContext::acquire(&config(2))?;
    // 99 is not an NLCD class.
    let points = vec![PointRecord::new(1, Role::Pickup, 40.775, -73.81)];
    let points = point_dataset(&ctx, points, &Partitioner::hash(2));
    let (enriched, summaries) = enricher.enrich_with_stats(&points)?;
    let rec = &enriched.collect()[0];
    assert_eq!(rec.get("landcover"), Some(&AttrValue::Text("Unknown".into())));
    assert_eq!(rec.working.get("landcover_raw"), Some(&Some(AttrValue::Float(99.0))));
    assert_eq!(summaries[1].1.unknown_class, 1);
    assert_eq!(summaries[1].1.matched, 1);
    Ok(())
}

#[test]
fn multi_band_rasters_produce_one_column_per_band() -> Result<()> {
    let raster = Raster::new(
        2,
        1,
        GeoTransform::north_up(0.0, 1.0, 1.0),
        vec![vec![1.0, 2.0], vec![10.0, 20.0], vec![100.0, 200.0]],
    )?;
    let enricher = Enricher::new(vec![ReferenceLayer::Raster(RasterReference::new("rgb", raster))])?;
    assert_eq!(
        enricher.output_columns(),
        vec![
            ColumnSpec::new("rgb_b1", AttrKind::Float),
            ColumnSpec::new("rgb_b2", AttrKind::Float),
            ColumnSpec::new("rgb_b3", AttrKind::Float),
        ]
    );

    let engine = BatchEnricher::with_enricher(config(2), enricher);
    let mut t = trip(3);
    (t.pickup_longitude, t.pickup_latitude) = (1.5, 0.5);
    (t.dropoff_longitude, t.dropoff_latitude) = (5.0, 5.0);
    let rows = engine.enrich_all(vec![t])?;
    assert_eq!(rows[0].get("pickup_rgb_b2"), Some(&AttrValue::Float(20.0)));
    assert_eq!(rows[0].get("pickup_rgb_b3"), Some(&AttrValue::Float(200.0)));
    assert_eq!(rows[0].columns.get("dropoff_rgb_b1"), Some(&None));
    Ok(())
}

#[test]
fn nan_endpoints_get_null_attributes_from_every_layer() -> Result<()> {
    let (_tmp, engine) = build_engine(config(3))?;
    let mut broken = trip(1);
    (broken.dropoff_longitude, broken.dropoff_latitude) = (f64::NAN, f64::NAN);
    let mut half = trip(3);
    half.pickup_latitude = f64::NAN;

    let rows = engine.enrich_all(vec![broken, half, trip(2)])?;
    assert_eq!(rows.len(), 3);
    let row = |id: i64| rows.iter().find(|r| r.trip_id() == id).expect("trip present");

    for column in ["dropoff_nbhd_key", "dropoff_landcover"] {
        assert_eq!(row(1).columns.get(column), Some(&None), "{column}");
    }
    assert_eq!(text(row(1), "pickup_landcover").as_deref(), Some("Developed, Low Intensity"));
    for column in ["pickup_nbhd_key", "pickup_landcover"] {
        assert_eq!(row(3).columns.get(column), Some(&None), "{column}");
    }
    assert_eq!(text(row(3), "dropoff_landcover").as_deref(), Some("Evergreen Forest"));
    assert_eq!(text(row(2), "pickup_landcover").as_deref(), Some("Open Water"));
    Ok(())
}

#[test]
fn duplicate_layer_names_are_rejected() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut layers = reference_layers(tmp.path())?;
    layers.push(layers[0].clone());
    let err = Enricher::load(&layers).err().expect("duplicate layer");
    assert!(matches!(err, geobeam::EnrichError::Config(_)), "{err}");
    Ok(())
}

#[test]
fn merge_rejects_two_points_for_one_role() -> Result<()> {
    let ctx = ExecutionContext::acquire(&config(3))?;
    let p = Partitioner::hash(3);
    let trip_ds = Dataset::from_vec(&ctx, vec![trip(1), trip(2)]);
    let points = vec![
        PointRecord::new(1, Role::Pickup, 40.7, -73.9),
        PointRecord::new(1, Role::Pickup, 40.8, -73.8),
        PointRecord::new(2, Role::Dropoff, 40.8, -73.8),
    ];
    let enriched = point_dataset(&ctx, points, &p);
    assert!(merge_trips(&trip_ds, &enriched, &[]).is_err());
    Ok(())
}

#[test]
fn merge_keeps_trips_without_points() -> Result<()> {
    let ctx = ExecutionContext::acquire(&config(3))?;
    let trip_ds = Dataset::from_vec(&ctx, trips(0..6));
    assert_eq!(split_endpoints(&trip_ds).len(), 12);

    // Only trip 4 has an enriched pickup.
    let mut pickup = geobeam::records::EnrichedPointRecord::from(PointRecord::new(4, Role::Pickup, 0.0, 0.0));
    pickup.attributes.insert("zone".into(), Some(AttrValue::Text("Z".into())));
    let enriched = Dataset::from_vec(&ctx, vec![pickup]);
    let columns = [ColumnSpec::new("zone", AttrKind::Text)];

    let merged = merge_trips(&trip_ds, &enriched, &columns)?.collect_sorted_by_key(MergedTripRecord::trip_id);
    assert_eq!(merged.len(), 6);
    assert_eq!(merged[4].get("pickup_zone"), Some(&AttrValue::Text("Z".into())));
    assert_eq!(merged[4].columns.get("dropoff_zone"), Some(&None));
    assert_eq!(merged[0].columns.get("pickup_zone"), Some(&None));

    let pipeline = ctx.pipeline();
    assert!(pipeline.find("join:pickup").is_some());
    assert!(pipeline.find("join:dropoff").is_some());
    Ok(())
}
