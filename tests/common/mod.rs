#![allow(dead_code)]

use anyhow::Result;
use geobeam::classify::ClassificationSpec;
use geobeam::config::{EngineConfig, WriteStrategy};
use geobeam::enrich::LayerSpec;
use geobeam::raster::RasterLayerSpec;
use geobeam::records::TaxiTrip;
use geobeam::regions::VectorLayerSpec;
use serde_json::json;
use std::path::{Path, PathBuf};

/// Small, deterministic engine configuration.
pub fn config(partitions: usize) -> EngineConfig {
    EngineConfig {
        threads: Some(2),
        partitions,
        tile_width: 2,
        tile_height: 2,
        window_size: 10,
        ..Default::default()
    }
}

pub fn config_with(partitions: usize, window_size: i64, strategy: WriteStrategy) -> EngineConfig {
    EngineConfig {
        window_size,
        write_strategy: strategy,
        ..config(partitions)
    }
}

/// GeoJSON polygon feature for the axis-aligned box `[x0, x1] x [y0, y1]`.
pub fn box_feature(key: &str, name: &str, x0: f64, y0: f64, x1: f64, y1: f64) -> serde_json::Value {
    json!({
        "type": "Feature",
        "properties": { "code": key, "label": name, "population": 1000 },
        "geometry": {
            "type": "Polygon",
            "coordinates": [[[x0, y0], [x1, y0], [x1, y1], [x0, y1], [x0, y0]]]
        }
    })
}

pub fn write_feature_collection(path: &Path, features: Vec<serde_json::Value>, crs: Option<&str>) -> Result<()> {
    let mut fc = json!({ "type": "FeatureCollection", "features": features });
    if let Some(name) = crs {
        fc["crs"] = json!({ "type": "name", "properties": { "name": name } });
    }
    std::fs::write(path, serde_json::to_string_pretty(&fc)?)?;
    Ok(())
}

/// Two neighbourhoods sharing the edge at longitude -73.9:
/// `A` = [-74.0, -73.9] x [40.7, 40.8], `B` = [-73.9, -73.8] x [40.7, 40.8].
pub fn write_neighborhoods(dir: &Path) -> Result<PathBuf> {
    let layer_dir = dir.join("nbhd");
    std::fs::create_dir_all(&layer_dir)?;
    write_feature_collection(
        &layer_dir.join("neighborhoods.geojson"),
        vec![
            box_feature("A", "Alpha", -74.0, 40.7, -73.9, 40.8),
            box_feature("B", "Bravo", -73.9, 40.7, -73.8, 40.8),
        ],
        None,
    )?;
    Ok(layer_dir)
}

pub fn neighborhoods_spec(dir: &Path) -> VectorLayerSpec {
    VectorLayerSpec {
        name: "nbhd".into(),
        dir: dir.to_path_buf(),
        key_property: "code".into(),
        name_property: Some("label".into()),
        carry_properties: vec!["population".into()],
        crs: None,
        attributes: None,
    }
}

/// ASCII grid over [-74.0, -73.8] x [40.7, 40.8] at 0.05 degrees (4 x 2):
///
/// ```text
/// 11  21  22  99
/// 41  42  nd  82
/// ```
pub const LANDCOVER_GRID: &str = "ncols 4
nrows 2
xllcorner -74.0
yllcorner 40.7
cellsize 0.05
NODATA_value -9999
11 21 22 99
41 42 -9999 82
";

pub fn write_landcover(dir: &Path) -> Result<PathBuf> {
    let path = dir.join("landcover.asc");
    std::fs::write(&path, LANDCOVER_GRID)?;
    Ok(path)
}

pub fn landcover_spec(path: &Path) -> RasterLayerSpec {
    RasterLayerSpec {
        name: "landcover".into(),
        path: path.to_path_buf(),
        crs: None,
        variable: None,
        classification: Some(ClassificationSpec::Builtin("nlcd".into())),
    }
}

/// Both reference layers, written under `dir`.
pub fn reference_layers(dir: &Path) -> Result<Vec<LayerSpec>> {
    let nbhd = write_neighborhoods(dir)?;
    let landcover = write_landcover(dir)?;
    Ok(vec![
        LayerSpec::Vector(neighborhoods_spec(&nbhd)),
        LayerSpec::Raster(landcover_spec(&landcover)),
    ])
}

/// Trip `i` picks up in `A` (even) or `B` (odd) and drops off in `A`,
/// except every fifth trip, which drops off far outside every layer.
pub fn trip(i: i64) -> TaxiTrip {
    let offset = (i % 10) as f64 * 0.001;
    let (dlon, dlat) = if i % 5 == 0 { (-70.0, 42.0) } else { (-73.91, 40.72) };
    TaxiTrip {
        trip_id: i,
        vendor_id: 1 + i % 2,
        pickup_datetime: format!("2016-01-01 00:{:02}:00", i % 60),
        dropoff_datetime: format!("2016-01-01 01:{:02}:00", i % 60),
        passenger_count: 1 + i % 3,
        trip_distance: 1.5 + offset,
        fare_amount: 7.0 + i as f64,
        pickup_longitude: if i % 2 == 0 { -73.96 } else { -73.86 },
        pickup_latitude: 40.775 - offset,
        dropoff_longitude: dlon,
        dropoff_latitude: dlat,
    }
}

pub fn trips(ids: std::ops::Range<i64>) -> Vec<TaxiTrip> {
    ids.map(trip).collect()
}

/// Minimal NetCDF classic (CDF-1) file with one `float data(lat, lon)`
/// variable. `lats` may run south-up or north-up; `values` are row-major in
/// `lats` order.
pub fn netcdf_classic(lats: &[f64], lons: &[f64], values: &[f32], fill: Option<f32>) -> Vec<u8> {
    const NC_DIMENSION: u32 = 0x0A;
    const NC_VARIABLE: u32 = 0x0B;
    const NC_ATTRIBUTE: u32 = 0x0C;
    const NC_CHAR: u32 = 2;
    const NC_FLOAT: u32 = 5;
    const NC_DOUBLE: u32 = 6;

    fn u32be(out: &mut Vec<u8>, v: u32) {
        out.extend_from_slice(&v.to_be_bytes());
    }
    fn name(out: &mut Vec<u8>, s: &str) {
        u32be(out, s.len() as u32);
        out.extend_from_slice(s.as_bytes());
        while out.len() % 4 != 0 {
            out.push(0);
        }
    }

    // (name, dim ids, type, attrs, data)
    let mut data_attrs = Vec::new();
    if let Some(f) = fill {
        name(&mut data_attrs, "_FillValue");
        u32be(&mut data_attrs, NC_FLOAT);
        u32be(&mut data_attrs, 1);
        data_attrs.extend_from_slice(&f.to_be_bytes());
    }
    let lat_bytes: Vec<u8> = lats.iter().flat_map(|v| v.to_be_bytes()).collect();
    let lon_bytes: Vec<u8> = lons.iter().flat_map(|v| v.to_be_bytes()).collect();
    let data_bytes: Vec<u8> = values.iter().flat_map(|v| v.to_be_bytes()).collect();
    let vars: Vec<(&str, Vec<u32>, u32, u32, Vec<u8>)> = vec![
        ("lat", vec![0], NC_DOUBLE, 0, lat_bytes),
        ("lon", vec![1], NC_DOUBLE, 0, lon_bytes),
        ("data", vec![0, 1], NC_FLOAT, u32::from(fill.is_some()), data_bytes),
    ];

    let header = |begins: &[u32]| {
        let mut h = Vec::new();
        h.extend_from_slice(b"CDF\x01");
        u32be(&mut h, 0); // numrecs
        u32be(&mut h, NC_DIMENSION);
        u32be(&mut h, 2);
        name(&mut h, "lat");
        u32be(&mut h, lats.len() as u32);
        name(&mut h, "lon");
        u32be(&mut h, lons.len() as u32);
        // One global text attribute; its length needs padding.
        u32be(&mut h, NC_ATTRIBUTE);
        u32be(&mut h, 1);
        name(&mut h, "title");
        u32be(&mut h, NC_CHAR);
        name(&mut h, "landcover");
        u32be(&mut h, NC_VARIABLE);
        u32be(&mut h, vars.len() as u32);
        for (i, (n, dims, ty, nattrs, data)) in vars.iter().enumerate() {
            name(&mut h, n);
            u32be(&mut h, dims.len() as u32);
            for d in dims {
                u32be(&mut h, *d);
            }
            if *nattrs > 0 {
                u32be(&mut h, NC_ATTRIBUTE);
                u32be(&mut h, *nattrs);
                h.extend_from_slice(&data_attrs);
            } else {
                u32be(&mut h, 0);
                u32be(&mut h, 0);
            }
            u32be(&mut h, *ty);
            u32be(&mut h, data.len().next_multiple_of(4) as u32);
            u32be(&mut h, begins[i]);
        }
        h
    };

    let header_len = header(&[0, 0, 0]).len() as u32;
    let mut begins = Vec::new();
    let mut at = header_len;
    for (.., data) in &vars {
        begins.push(at);
        at += data.len().next_multiple_of(4) as u32;
    }
    let mut out = header(&begins);
    for (.., data) in &vars {
        out.extend_from_slice(data);
        while out.len() % 4 != 0 {
            out.push(0);
        }
    }
    out
}
