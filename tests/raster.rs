mod common;

use anyhow::Result;
use common::{LANDCOVER_GRID, config, netcdf_classic};
use geobeam::enrich::LayerSpec;
use geobeam::{BatchEnricher, EnrichError, Stage};
use geobeam::classify::{ClassificationSpec, ClassificationTable};
use geobeam::matcher::sample_tiles;
use geobeam::raster::{
    GeoTransform, Raster, RasterFormat, RasterLayerSpec, TileIndexer, decode_raster, load_raster,
};
use std::collections::HashSet;
use std::path::Path;

fn nyc_raster() -> Result<Raster> {
    let (w, h) = (66, 49);
    let data = (0..w * h).map(|i| (i % 97) as f64).collect();
    Ok(Raster::new(w, h, GeoTransform::north_up(-74.25125, 40.90792, 0.00833), vec![data])?)
}

#[test]
fn ascii_grid_decodes_north_first_with_nodata() -> Result<()> {
    let r = decode_raster(LANDCOVER_GRID.as_bytes(), Path::new("landcover.asc"), None)?;
    assert_eq!((r.width(), r.height(), r.band_count()), (4, 2, 1));
    assert_eq!(r.nodata(), Some(-9999.0));
    assert_eq!(r.value(0, 0, 0), Some(11.0));
    assert_eq!(r.value(0, 3, 0), Some(99.0));
    assert_eq!(r.value(0, 0, 1), Some(41.0));
    assert_eq!(r.value(0, 2, 1), None);

    assert_eq!(r.sample(0, -73.96, 40.775), Some(11.0));
    assert_eq!(r.sample(0, -73.91, 40.72), Some(42.0));
    assert_eq!(r.sample(0, -73.5, 40.75), None, "east of the grid");
    Ok(())
}

#[test]
fn upper_left_corner_resolves_to_pixel_zero_of_its_tile() -> Result<()> {
    let raster = nyc_raster()?;
    let indexer = TileIndexer::new(&raster, 16, 16)?;
    let (x0, y0) = (-74.25125, 40.90792);
    let key = indexer.grid().tile_for(x0, y0).expect("inside the grid");
    assert_eq!(key, (0, 0));
    let tile = indexer.tile(key).expect("tile exists");
    assert_eq!(tile.pixel_at(x0, y0), Some((0, 0)));
    assert_eq!(tile.pixel_at(x0 + 0.00833, y0 - 0.00833), Some((1, 1)));

    // East and south edges belong to the neighbouring pixel.
    assert_eq!(raster.pixel_at(x0 + 0.00833, y0), Some((1, 0)));
    assert_eq!(raster.pixel_at(x0, y0 - 0.00833), Some((0, 1)));
    // The outer east edge is outside the raster.
    assert_eq!(raster.pixel_at(x0 + 66.0 * 0.00833, y0), None);
    Ok(())
}

#[test]
fn non_finite_coordinates_own_no_pixel() -> Result<()> {
    let raster = Raster::new(2, 2, GeoTransform::north_up(0.0, 2.0, 1.0), vec![vec![7.0, 8.0, 9.0, 10.0]])?;
    let indexer = TileIndexer::new(&raster, 1, 1)?;
    assert_eq!(raster.sample(0, 0.5, 1.5), Some(7.0));
    for (x, y) in [
        (f64::NAN, f64::NAN),
        (f64::NAN, 1.5),
        (0.5, f64::NAN),
        (f64::INFINITY, 1.5),
        (0.5, f64::NEG_INFINITY),
    ] {
        assert_eq!(raster.pixel_at(x, y), None, "({x}, {y})");
        assert_eq!(raster.sample(0, x, y), None, "({x}, {y})");
        assert_eq!(indexer.grid().tile_for(x, y), None, "({x}, {y})");
        assert!(indexer.tiles().all(|t| t.pixel_at(x, y).is_none()), "({x}, {y})");
    }
    Ok(())
}

#[test]
fn tiles_partition_the_raster() -> Result<()> {
    let raster = nyc_raster()?;
    for (tw, th) in [(1, 1), (3, 2), (16, 16), (66, 49), (100, 7)] {
        let indexer = TileIndexer::new(&raster, tw, th)?;
        let mut seen = HashSet::new();
        for tile in indexer.tiles() {
            for row in tile.row_range() {
                for col in tile.col_range() {
                    assert!(seen.insert((col, row)), "pixel ({col}, {row}) in two tiles at {tw}x{th}");
                }
            }
        }
        assert_eq!(seen.len(), 66 * 49, "tiles {tw}x{th} do not cover the raster");
        assert_eq!(indexer.grid().len(), 66usize.div_ceil(tw) * 49usize.div_ceil(th));
    }
    Ok(())
}

#[test]
fn sampling_does_not_depend_on_tile_size() -> Result<()> {
    let raster = nyc_raster()?;
    let points: Vec<(f64, f64)> = (0..400)
        .map(|i| {
            let fx = (i * 37 % 400) as f64 / 400.0;
            let fy = (i * 91 % 400) as f64 / 400.0;
            // Extend a little beyond the raster on every side.
            (-74.26 + fx * 0.58, 40.50 + fy * 0.42)
        })
        .chain([(-74.25125, 40.90792), (-74.25125 + 0.00833 * 16.0, 40.90792 - 0.00833 * 16.0)])
        .collect();

    for (tw, th) in [(1, 1), (5, 3), (16, 16), (256, 256)] {
        let indexer = TileIndexer::new(&raster, tw, th)?;
        for &(x, y) in &points {
            let tile = indexer.grid().tile_for(x, y).and_then(|k| indexer.tile(k));
            let via_tiles = tile.as_ref().and_then(|t| sample_tiles([t], x, y)).and_then(|s| s.value(0));
            assert_eq!(via_tiles, raster.sample(0, x, y), "({x}, {y}) at {tw}x{th}");
        }
    }
    Ok(())
}

#[test]
fn empty_tiles_can_be_skipped() -> Result<()> {
    let mut data = vec![-1.0; 4 * 4];
    data[15] = 5.0; // only the south-east tile has data
    let raster = Raster::new(4, 4, GeoTransform::north_up(0.0, 4.0, 1.0), vec![data])?.with_nodata(Some(-1.0));

    let all = TileIndexer::new(&raster, 2, 2)?;
    assert_eq!(all.tiles().count(), 4);
    let sparse = TileIndexer::new(&raster, 2, 2)?.skip_empty_tiles(true);
    let kept: Vec<_> = sparse.tiles().map(|t| t.key()).collect();
    assert_eq!(kept, vec![(1, 1)]);
    assert!(sparse.tile((0, 0)).is_none());
    assert_eq!(sparse.tile((1, 1)).and_then(|t| t.sample(0, 3.5, 0.5)), Some(5.0));
    Ok(())
}

#[test]
fn multi_band_values_are_kept_per_band() -> Result<()> {
    let t = GeoTransform::north_up(0.0, 2.0, 1.0);
    let raster = Raster::new(2, 2, t, vec![vec![1.0, 2.0, 3.0, 4.0], vec![10.0, 20.0, 30.0, f64::NAN]])?;
    let indexer = TileIndexer::new(&raster, 1, 1)?;
    let tile = indexer.tile((1, 1)).expect("tile");
    assert_eq!(tile.sample_bands(1.5, 0.5), Some(vec![Some(4.0), None]));
    Ok(())
}

#[test]
fn netcdf_classic_south_up_grid_is_flipped() -> Result<()> {
    let lats = [40.725, 40.775];
    let lons = [-73.975, -73.925, -73.875, -73.825];
    let values = [41.0, 42.0, -9999.0, 82.0, 11.0, 21.0, 22.0, 99.0];
    let bytes = netcdf_classic(&lats, &lons, &values, Some(-9999.0));

    assert_eq!(RasterFormat::detect(&bytes, Path::new("lc.bin"))?, RasterFormat::NetCdf);
    let r = decode_raster(&bytes, Path::new("landcover.nc"), None)?;
    assert_eq!((r.width(), r.height()), (4, 2));
    let t = r.transform();
    assert!((t.origin_x - -74.0).abs() < 1e-9);
    assert!((t.origin_y - 40.8).abs() < 1e-9);
    assert!((t.x_pixel_size - 0.05).abs() < 1e-9);
    assert_eq!(r.value(0, 0, 0), Some(11.0));
    assert_eq!(r.value(0, 3, 0), Some(99.0));
    assert_eq!(r.value(0, 0, 1), Some(41.0));
    assert_eq!(r.value(0, 2, 1), None, "fill value reads as nodata");
    assert_eq!(r.sample(0, -73.91, 40.72), Some(42.0));

    let err = decode_raster(&bytes, Path::new("landcover.nc"), Some("temperature")).unwrap_err();
    assert!(err.to_string().contains("temperature"), "{err}");
    Ok(())
}

#[test]
fn unsupported_encodings_are_rejected_by_name() {
    let hdf5 = b"\x89HDF\r\n\x1a\n\0\0\0\0".to_vec();
    let cdf5 = b"CDF\x05\0\0\0\0".to_vec();
    let png = b"\x89PNG\r\n\x1a\n\0\0".to_vec();
    for (bytes, name) in [(hdf5, "modern.nc"), (cdf5, "big.nc"), (png, "image.png")] {
        let err = decode_raster(&bytes, Path::new(name), None).unwrap_err();
        assert!(matches!(err, EnrichError::RasterFormat { .. }), "{name}: {err}");
        assert!(err.to_string().contains("unsupported raster format"), "{name}: {err}");
    }
}

#[test]
fn corrupt_ascii_grid_is_a_format_error() {
    let truncated = "ncols 4\nnrows 2\nxllcorner 0\nyllcorner 0\ncellsize 1\n1 2 3\n";
    let err = decode_raster(truncated.as_bytes(), Path::new("bad.asc"), None).unwrap_err();
    assert!(matches!(err, EnrichError::RasterFormat { .. }), "{err}");
}

#[test]
fn oversized_ascii_header_is_a_format_error() {
    for text in [
        "ncols 4000000000\nnrows 4000000000\nxllcorner 0\nyllcorner 0\ncellsize 1\n1 2 3\n",
        "ncols 1e300\nnrows 1e300\nxllcorner 0\nyllcorner 0\ncellsize 1\n1\n",
    ] {
        let err = decode_raster(text.as_bytes(), Path::new("huge.asc"), None).unwrap_err();
        assert!(matches!(err, EnrichError::RasterFormat { .. }), "{err}");
    }
}

#[test]
fn inflated_netcdf_counts_are_format_errors() {
    let mut var_count = b"CDF\x01".to_vec();
    for word in [0u32, 0, 0, 0, 0, 0x0B, u32::MAX] {
        var_count.extend_from_slice(&word.to_be_bytes());
    }
    let mut name_len = b"CDF\x01".to_vec();
    for word in [0u32, 0x0A, 1, 0xFFFF_FFF0, 0] {
        name_len.extend_from_slice(&word.to_be_bytes());
    }
    for (label, bytes) in [("variable count", var_count), ("name length", name_len)] {
        let err = decode_raster(&bytes, Path::new("bad.nc"), None).unwrap_err();
        assert!(matches!(err, EnrichError::RasterFormat { .. }), "{label}: {err}");
        assert!(err.to_string().contains("truncated header"), "{label}: {err}");
    }
}

#[test]
fn truncated_netcdf_files_are_format_errors() -> Result<()> {
    let bytes = netcdf_classic(&[40.725, 40.775], &[-73.975, -73.925], &[1.0, 2.0, 3.0, 4.0], None);
    decode_raster(&bytes, Path::new("ok.nc"), None)?;
    for cut in (0..bytes.len()).step_by(3) {
        let err = decode_raster(&bytes[..cut], Path::new("cut.nc"), None).unwrap_err();
        assert!(matches!(err, EnrichError::RasterFormat { .. }), "cut at {cut}: {err}");
    }
    Ok(())
}

#[test]
fn missing_raster_file_is_a_load_error() {
    let spec = RasterLayerSpec {
        name: "dem".into(),
        path: "/nonexistent/dem.tif".into(),
        crs: None,
        variable: None,
        classification: None,
    };
    let err = load_raster(&spec).unwrap_err();
    assert!(matches!(err, EnrichError::ReferenceLoad { .. }), "{err}");
}

#[test]
fn projected_rasters_are_rejected() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("landcover.asc");
    std::fs::write(&path, LANDCOVER_GRID)?;
    let spec = RasterLayerSpec {
        name: "landcover".into(),
        path,
        crs: Some(geobeam::crs::Crs::parse("EPSG:2263")?),
        variable: None,
        classification: None,
    };
    let err = load_raster(&spec).unwrap_err();
    assert!(matches!(&err, EnrichError::ReferenceLoad { layer, .. } if layer == "landcover"), "{err}");

    let err = BatchEnricher::new(config(2), &[LayerSpec::Raster(spec)]).err().expect("projected raster");
    assert_eq!(err.stage(), Some(Stage::Load));
    Ok(())
}

#[cfg(feature = "compression-gzip")]
#[test]
fn gzipped_rasters_are_unwrapped() -> Result<()> {
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(LANDCOVER_GRID.as_bytes())?;
    let gz = enc.finish()?;

    let by_ext = decode_raster(&gz, Path::new("landcover.asc.gz"), None)?;
    let by_magic = decode_raster(&gz, Path::new("landcover.bin"), None)?;
    let plain = decode_raster(LANDCOVER_GRID.as_bytes(), Path::new("landcover.asc"), None)?;
    assert_eq!(by_ext, plain);
    assert_eq!(by_magic, plain);
    Ok(())
}

#[cfg(feature = "raster-geotiff")]
fn geotiff(width: u32, height: u32, data: &[f32], geo_keys: &[u16]) -> Result<Vec<u8>> {
    use std::io::Cursor;
    use tiff::encoder::{TiffEncoder, colortype};
    use tiff::tags::Tag;

    let mut buf = Cursor::new(Vec::new());
    {
        let mut enc = TiffEncoder::new(&mut buf)?;
        let mut image = enc.new_image::<colortype::Gray32Float>(width, height)?;
        image.encoder().write_tag(Tag::ModelPixelScaleTag, &[0.5f64, 0.25, 0.0][..])?;
        image
            .encoder()
            .write_tag(Tag::ModelTiepointTag, &[0.0f64, 0.0, 0.0, -74.0, 40.8, 0.0][..])?;
        image.encoder().write_tag(Tag::GeoKeyDirectoryTag, geo_keys)?;
        image.write_data(data)?;
    }
    Ok(buf.into_inner())
}

#[cfg(feature = "raster-geotiff")]
#[test]
fn geotiff_georeferencing_comes_from_model_tags() -> Result<()> {
    // GeoKey directory: version 1.1.0, two keys; raster type = area,
    // geographic type = EPSG:4326.
    let keys = [1u16, 1, 0, 2, 1025, 0, 1, 1, 2048, 0, 1, 4326];
    let data = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
    let bytes = geotiff(3, 2, &data, &keys)?;

    assert_eq!(RasterFormat::detect(&bytes, Path::new("x"))?, RasterFormat::GeoTiff);
    let r = decode_raster(&bytes, Path::new("elevation.tif"), None)?;
    assert_eq!((r.width(), r.height()), (3, 2));
    assert_eq!(r.crs(), geobeam::crs::Crs::WGS84);
    assert_eq!(*r.transform(), GeoTransform::new(-74.0, 40.8, 0.5, -0.25));
    assert_eq!(r.sample(0, -73.25, 40.675), Some(2.0));
    assert_eq!(r.sample(0, -72.75, 40.55), Some(6.0));
    Ok(())
}

#[cfg(feature = "raster-geotiff")]
#[test]
fn geotiff_in_projected_crs_is_rejected() -> Result<()> {
    let keys = [1u16, 1, 0, 1, 3072, 0, 1, 32618];
    let bytes = geotiff(2, 1, &[1.0, 2.0], &keys)?;
    let err = decode_raster(&bytes, Path::new("utm.tif"), None).unwrap_err();
    assert!(matches!(err, EnrichError::ReferenceLoad { .. }), "{err}");

    // EPSG:32633 is outside the supported set.
    let keys = [1u16, 1, 0, 1, 3072, 0, 1, 32633];
    let bytes = geotiff(2, 1, &[1.0, 2.0], &keys)?;
    let err = decode_raster(&bytes, Path::new("utm33.tif"), None).unwrap_err();
    assert!(matches!(err, EnrichError::ReferenceLoad { .. }), "{err}");
    assert!(err.to_string().contains("32633"), "{err}");
    Ok(())
}

#[test]
fn classification_is_total_and_deterministic() {
    let nlcd = ClassificationTable::nlcd();
    for v in -5..300 {
        let first = nlcd.classify(Some(f64::from(v)));
        assert!(first.is_some());
        assert_eq!(first, nlcd.classify(Some(f64::from(v))));
    }
    assert_eq!(nlcd.classify(Some(42.0)).as_deref(), Some("Evergreen Forest"));
    assert_eq!(nlcd.classify(Some(42.5)).as_deref(), Some("Unknown"));
    assert_eq!(nlcd.classify(Some(f64::NAN)).as_deref(), Some("Unknown"));
    assert_eq!(nlcd.classify(None), None);
}

#[test]
fn classification_specs_build_tables() -> anyhow::Result<()> {
    let spec: ClassificationSpec = serde_json::from_str(
        r#"{ "entries": [[1, "Water"], [2, "Land"]], "default_label": "Other" }"#,
    )?;
    let table = spec.build("mask")?;
    assert_eq!(table.label(1), "Water");
    assert_eq!(table.label(3), "Other");

    let builtin: ClassificationSpec = serde_json::from_str(r#""nlcd""#)?;
    assert_eq!(builtin.build("landcover")?.label(11), "Open Water");

    assert!(ClassificationSpec::Builtin("modis".into()).build("lc").is_err());
    let dup = ClassificationTable::new("dup", [(1, "a".to_string()), (1, "b".to_string())], "?");
    assert!(matches!(dup, Err(EnrichError::Config(_))));
    Ok(())
}
