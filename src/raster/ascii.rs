//! Arc/Info ASCII grid decoder.
//!
//! Header keys (case-insensitive): `ncols`, `nrows`, `xllcorner`|`xllcenter`,
//! `yllcorner`|`yllcenter`, `cellsize` (or `dx`/`dy`), optional
//! `nodata_value`. Values follow row by row from the north.

use super::format::Decoded;
use super::{GeoTransform, Raster};
use crate::error::{EnrichError, Result};
use std::collections::HashMap;

pub(super) fn decode(bytes: &[u8]) -> Result<Decoded> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| EnrichError::raster_format(format!("ASCII grid is not UTF-8: {e}")))?;

    let mut tokens = text.split_ascii_whitespace().peekable();
    let mut header: HashMap<String, f64> = HashMap::new();
    while let Some(tok) = tokens.peek() {
        if !tok.starts_with(|c: char| c.is_ascii_alphabetic()) {
            break;
        }
        let key = tok.to_ascii_lowercase();
        tokens.next();
        let value = tokens
            .next()
            .and_then(|v| v.parse::<f64>().ok())
            .ok_or_else(|| EnrichError::raster_format(format!("ASCII grid header `{key}` has no numeric value")))?;
        header.insert(key, value);
    }

    let get = |k: &str| header.get(k).copied();
    let required = |k: &str| {
        get(k).ok_or_else(|| EnrichError::raster_format(format!("ASCII grid header is missing `{k}`")))
    };
    let ncols = dimension(required("ncols")?, "ncols")?;
    let nrows = dimension(required("nrows")?, "nrows")?;
    let (dx, dy) = match (get("cellsize"), get("dx"), get("dy")) {
        (Some(cs), _, _) => (cs, cs),
        (None, Some(dx), Some(dy)) => (dx, dy),
        _ => return Err(EnrichError::raster_format("ASCII grid header is missing `cellsize`")),
    };
    let west = match (get("xllcorner"), get("xllcenter")) {
        (Some(x), _) => x,
        (None, Some(x)) => x - dx / 2.0,
        _ => return Err(EnrichError::raster_format("ASCII grid header is missing `xllcorner`")),
    };
    let south = match (get("yllcorner"), get("yllcenter")) {
        (Some(y), _) => y,
        (None, Some(y)) => y - dy / 2.0,
        _ => return Err(EnrichError::raster_format("ASCII grid header is missing `yllcorner`")),
    };
    let nodata = get("nodata_value");

    let expected = ncols
        .checked_mul(nrows)
        .ok_or_else(|| EnrichError::raster_format(format!("ASCII grid {ncols}x{nrows} is too large")))?;
    let values = tokens
        .map(|tok| {
            tok.parse::<f64>()
                .map_err(|_| EnrichError::raster_format(format!("bad ASCII grid value `{tok}`")))
        })
        .collect::<Result<Vec<_>>>()?;
    if values.len() != expected {
        return Err(EnrichError::raster_format(format!(
            "ASCII grid holds {} values, header declares {ncols}x{nrows}",
            values.len()
        )));
    }

    let north = south + nrows as f64 * dy;
    let transform = GeoTransform::new(west, north, dx, -dy);
    Ok(Decoded {
        raster: Raster::new(ncols, nrows, transform, vec![values])?.with_nodata(nodata),
        epsg: None,
    })
}

fn dimension(v: f64, key: &str) -> Result<usize> {
    if v >= 1.0 && v.fract() == 0.0 {
        Ok(v as usize)
    } else {
        Err(EnrichError::raster_format(format!("ASCII grid `{key}` must be a positive integer, got {v}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_corner_registered_grid() {
        let text = "ncols 3\nnrows 2\nxllcorner -74.0\nyllcorner 40.0\ncellsize 0.5\nNODATA_value -9999\n\
                    1 2 3\n4 -9999 6\n";
        let raster = decode(text.as_bytes()).unwrap().raster;
        assert_eq!((raster.width(), raster.height()), (3, 2));
        assert_eq!(raster.transform().origin_y, 41.0);
        assert_eq!(raster.sample(0, -73.9, 40.9), Some(1.0));
        assert_eq!(raster.sample(0, -73.4, 40.4), None);
        assert_eq!(raster.sample(0, -72.6, 40.1), Some(6.0));
    }

    #[test]
    fn center_registration_shifts_origin_by_half_a_cell() {
        let text = "ncols 1\nnrows 1\nxllcenter 0.5\nyllcenter 0.5\ncellsize 1\n7\n";
        let raster = decode(text.as_bytes()).unwrap().raster;
        assert_eq!(raster.transform().origin_x, 0.0);
        assert_eq!(raster.transform().origin_y, 1.0);
    }

    #[test]
    fn value_count_must_match_header() {
        let text = "ncols 2\nnrows 2\nxllcorner 0\nyllcorner 0\ncellsize 1\n1 2 3\n";
        let err = decode(text.as_bytes()).err().unwrap();
        assert!(err.to_string().contains("3 values"));
    }
}
