//! GeoTIFF decoder on top of the `tiff` crate.
//!
//! Georeferencing comes from ModelPixelScale + ModelTiepoint; the CRS and
//! raster type from the GeoKey directory. Chunky multi-sample images become
//! one band per sample.

use super::format::Decoded;
use super::{GeoTransform, Raster};
use crate::error::{EnrichError, Result};
use std::io::Cursor;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::tags::Tag;

const GT_RASTER_TYPE_KEY: u16 = 1025;
const GEOGRAPHIC_TYPE_KEY: u16 = 2048;
const PROJECTED_CS_TYPE_KEY: u16 = 3072;
const RASTER_PIXEL_IS_POINT: u16 = 2;

fn tiff_err(e: impl std::fmt::Display) -> EnrichError {
    EnrichError::raster_format(format!("GeoTIFF: {e}"))
}

pub(super) fn decode(bytes: &[u8]) -> Result<Decoded> {
    let mut decoder = Decoder::new(Cursor::new(bytes)).map_err(tiff_err)?;
    let (width, height) = decoder.dimensions().map_err(tiff_err)?;
    let (width, height) = (width as usize, height as usize);

    let scale = decoder
        .find_tag(Tag::ModelPixelScaleTag)
        .map_err(tiff_err)?
        .ok_or_else(|| tiff_err("missing ModelPixelScale tag"))?
        .into_f64_vec()
        .map_err(tiff_err)?;
    let tiepoint = decoder
        .find_tag(Tag::ModelTiepointTag)
        .map_err(tiff_err)?
        .ok_or_else(|| tiff_err("missing ModelTiepoint tag"))?
        .into_f64_vec()
        .map_err(tiff_err)?;
    if scale.len() < 2 || tiepoint.len() < 6 {
        return Err(tiff_err("malformed georeferencing tags"));
    }
    let keys = match decoder.find_tag(Tag::GeoKeyDirectoryTag).map_err(tiff_err)? {
        Some(v) => v.into_u32_vec().map_err(tiff_err)?,
        None => Vec::new(),
    };
    let nodata = match decoder.find_tag(Tag::GdalNodata).map_err(tiff_err)? {
        Some(v) => v.into_string().ok().and_then(|s| s.trim_matches(char::from(0)).trim().parse().ok()),
        None => None,
    };

    let (sx, sy) = (scale[0], scale[1]);
    let (i, j, x, y) = (tiepoint[0], tiepoint[1], tiepoint[3], tiepoint[4]);
    let mut origin_x = x - i * sx;
    let mut origin_y = y + j * sy;
    if geo_key(&keys, GT_RASTER_TYPE_KEY) == Some(RASTER_PIXEL_IS_POINT) {
        origin_x -= sx / 2.0;
        origin_y += sy / 2.0;
    }

    let samples = match decoder.read_image().map_err(tiff_err)? {
        DecodingResult::U8(v) => v.into_iter().map(f64::from).collect::<Vec<_>>(),
        DecodingResult::U16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::F32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::F64(v) => v,
        _ => return Err(tiff_err("unsupported sample type")),
    };
    let pixels = width * height;
    if pixels == 0 || samples.len() % pixels != 0 {
        return Err(tiff_err(format!(
            "{} samples do not fill a {width}x{height} image",
            samples.len()
        )));
    }
    let band_count = samples.len() / pixels;
    let bands = (0..band_count)
        .map(|b| samples.iter().skip(b).step_by(band_count).copied().collect())
        .collect();

    let epsg = geo_key(&keys, PROJECTED_CS_TYPE_KEY).or_else(|| geo_key(&keys, GEOGRAPHIC_TYPE_KEY));

    let transform = GeoTransform::new(origin_x, origin_y, sx, -sy);
    Ok(Decoded {
        raster: Raster::new(width, height, transform, bands)?.with_nodata(nodata),
        epsg,
    })
}

/// Inline value of `key` in a GeoKey directory (header + 4-short entries).
fn geo_key(dir: &[u32], key: u16) -> Option<u16> {
    let count = *dir.get(3)? as usize;
    dir.get(4..4 + 4 * count)?
        .chunks_exact(4)
        .find(|e| e[0] == u32::from(key) && e[1] == 0)
        .and_then(|e| u16::try_from(e[3]).ok())
}
