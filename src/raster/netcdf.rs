//! NetCDF classic (CDF-1 / CDF-2) decoder.
//!
//! Reads one gridded variable whose two innermost dimensions are latitude and
//! longitude coordinate variables. Leading dimensions (including the record
//! dimension) become bands. Coordinates are pixel centres on a regular grid;
//! south-up grids are flipped to north-up. `_FillValue` / `missing_value` and
//! the NetCDF default fill read as nodata, and `scale_factor` / `add_offset`
//! are applied.

use super::format::Decoded;
use super::{GeoTransform, Raster};
use crate::error::{EnrichError, Result};
use byteorder::{BigEndian, ReadBytesExt};
use std::io::{Cursor, Read};

const NC_DIMENSION: u32 = 0x0A;
const NC_VARIABLE: u32 = 0x0B;
const NC_ATTRIBUTE: u32 = 0x0C;

const NC_BYTE: u32 = 1;
const NC_CHAR: u32 = 2;
const NC_SHORT: u32 = 3;
const NC_INT: u32 = 4;
const NC_FLOAT: u32 = 5;
const NC_DOUBLE: u32 = 6;

// Smallest encodings of one header entry, used to bound declared counts.
const MIN_DIM_BYTES: u64 = 8;
const MIN_ATTR_BYTES: u64 = 12;
const MIN_VAR_BYTES: u64 = 28;

const LAT_NAMES: &[&str] = &["lat", "latitude", "y"];
const LON_NAMES: &[&str] = &["lon", "longitude", "x"];

fn nc_err(msg: impl Into<String>) -> EnrichError {
    EnrichError::raster_format(format!("NetCDF: {}", msg.into()))
}

fn io_err(e: std::io::Error) -> EnrichError {
    nc_err(format!("truncated header ({e})"))
}

struct Dim {
    name: String,
    len: usize,
}

/// Character attributes are skipped; only numeric ones are consulted.
enum AttrData {
    Text,
    Numbers(Vec<f64>),
}

struct Var {
    name: String,
    dims: Vec<usize>,
    attrs: Vec<(String, AttrData)>,
    nc_type: u32,
    vsize: u64,
    begin: u64,
}

impl Var {
    fn number_attr(&self, name: &str) -> Option<f64> {
        self.attrs.iter().find_map(|(n, a)| match a {
            AttrData::Numbers(v) if n == name => v.first().copied(),
            _ => None,
        })
    }
}

struct Header {
    numrecs: usize,
    dims: Vec<Dim>,
    vars: Vec<Var>,
}

impl Header {
    fn is_record(&self, var: &Var) -> bool {
        var.dims.first().is_some_and(|d| self.dims[*d].len == 0)
    }

    fn dim_len(&self, dim: usize) -> usize {
        match self.dims[dim].len {
            0 => self.numrecs,
            n => n,
        }
    }

    /// Bytes between consecutive records.
    fn record_size(&self) -> u64 {
        let rec: Vec<&Var> = self.vars.iter().filter(|v| self.is_record(v)).collect();
        match rec.as_slice() {
            [only] => self.slice_len(only).saturating_mul(type_size(only.nc_type)),
            _ => rec.iter().fold(0u64, |acc, v| acc.saturating_add(v.vsize)),
        }
    }

    /// Values in one record of a record variable, or all values otherwise.
    fn slice_len(&self, var: &Var) -> u64 {
        let skip = usize::from(self.is_record(var));
        var.dims[skip..]
            .iter()
            .fold(1u64, |acc, d| acc.saturating_mul(self.dims[*d].len as u64))
    }

    fn coordinate(&self, dim: usize) -> Option<&Var> {
        let name = &self.dims[dim].name;
        self.vars
            .iter()
            .find(|v| &v.name == name && v.dims.len() == 1 && v.dims[0] == dim)
    }
}

fn type_size(nc_type: u32) -> u64 {
    match nc_type {
        NC_BYTE | NC_CHAR => 1,
        NC_SHORT => 2,
        NC_INT | NC_FLOAT => 4,
        _ => 8,
    }
}

fn default_fill(nc_type: u32) -> f64 {
    match nc_type {
        NC_BYTE => -127.0,
        NC_SHORT => -32767.0,
        NC_INT => -2_147_483_647.0,
        _ => 9.969_209_968_386_869e36,
    }
}

struct HeaderReader<'a> {
    cur: Cursor<&'a [u8]>,
    offset64: bool,
}

impl HeaderReader<'_> {
    fn u32(&mut self) -> Result<u32> {
        self.cur.read_u32::<BigEndian>().map_err(io_err)
    }

    fn len(&mut self) -> Result<usize> {
        Ok(self.u32()? as usize)
    }

    fn remaining(&self) -> u64 {
        (self.cur.get_ref().len() as u64).saturating_sub(self.cur.position())
    }

    /// `count` entries of at least `item_bytes` each must fit in the rest of
    /// the file.
    fn bounded(&self, count: usize, item_bytes: u64) -> Result<usize> {
        match (count as u64).checked_mul(item_bytes) {
            Some(need) if need <= self.remaining() => Ok(count),
            _ => Err(nc_err(format!(
                "truncated header: {count} entries declared with {} bytes left",
                self.remaining()
            ))),
        }
    }

    fn skip_padding(&mut self, n: usize) {
        let pad = (4 - n % 4) % 4;
        self.cur.set_position(self.cur.position() + pad as u64);
    }

    fn name(&mut self) -> Result<String> {
        let n = self.len()?;
        let n = self.bounded(n, 1)?;
        let mut buf = vec![0u8; n];
        self.cur.read_exact(&mut buf).map_err(io_err)?;
        self.skip_padding(n);
        String::from_utf8(buf).map_err(|_| nc_err("name is not UTF-8"))
    }

    /// `(tag, nelems)`; `ABSENT` reads as `nelems == 0`.
    fn list(&mut self, expected: u32, item_bytes: u64) -> Result<usize> {
        let tag = self.u32()?;
        let n = self.len()?;
        if tag != expected && !(tag == 0 && n == 0) {
            return Err(nc_err(format!("expected list tag {expected:#x}, found {tag:#x}")));
        }
        self.bounded(n, item_bytes)
    }

    fn attrs(&mut self) -> Result<Vec<(String, AttrData)>> {
        let n = self.list(NC_ATTRIBUTE, MIN_ATTR_BYTES)?;
        (0..n)
            .map(|_| {
                let name = self.name()?;
                let nc_type = self.u32()?;
                let nelems = self.len()?;
                let nelems = self.bounded(nelems, type_size(nc_type))?;
                let data = if nc_type == NC_CHAR {
                    self.cur.set_position(self.cur.position() + nelems as u64);
                    AttrData::Text
                } else {
                    AttrData::Numbers(
                        (0..nelems)
                            .map(|_| read_value(&mut self.cur, nc_type))
                            .collect::<Result<_>>()?,
                    )
                };
                self.skip_padding(nelems * type_size(nc_type) as usize);
                Ok((name, data))
            })
            .collect()
    }

    fn header(&mut self) -> Result<Header> {
        let numrecs = self.u32()?;
        if numrecs == u32::MAX {
            return Err(nc_err("streaming record count is not supported"));
        }
        let ndims = self.list(NC_DIMENSION, MIN_DIM_BYTES)?;
        let dims = (0..ndims)
            .map(|_| Ok(Dim { name: self.name()?, len: self.len()? }))
            .collect::<Result<Vec<_>>>()?;
        let _global = self.attrs()?;
        let nvars = self.list(NC_VARIABLE, MIN_VAR_BYTES)?;
        let mut vars = Vec::with_capacity(nvars);
        for _ in 0..nvars {
            let name = self.name()?;
            let rank = self.len()?;
            let rank = self.bounded(rank, 4)?;
            let var_dims = (0..rank).map(|_| self.len()).collect::<Result<Vec<_>>>()?;
            if let Some(d) = var_dims.iter().find(|d| **d >= dims.len()) {
                return Err(nc_err(format!("variable `{name}` references unknown dimension {d}")));
            }
            let attrs = self.attrs()?;
            let nc_type = self.u32()?;
            if !(NC_BYTE..=NC_DOUBLE).contains(&nc_type) {
                return Err(nc_err(format!("variable `{name}` has unsupported type {nc_type}")));
            }
            let vsize = u64::from(self.u32()?);
            let begin = if self.offset64 {
                self.cur.read_u64::<BigEndian>().map_err(io_err)?
            } else {
                u64::from(self.u32()?)
            };
            vars.push(Var { name, dims: var_dims, attrs, nc_type, vsize, begin });
        }
        Ok(Header { numrecs: numrecs as usize, dims, vars })
    }
}

fn read_value(cur: &mut Cursor<&[u8]>, nc_type: u32) -> Result<f64> {
    let v = match nc_type {
        NC_BYTE => f64::from(cur.read_i8().map_err(io_err)?),
        NC_SHORT => f64::from(cur.read_i16::<BigEndian>().map_err(io_err)?),
        NC_INT => f64::from(cur.read_i32::<BigEndian>().map_err(io_err)?),
        NC_FLOAT => f64::from(cur.read_f32::<BigEndian>().map_err(io_err)?),
        NC_DOUBLE => cur.read_f64::<BigEndian>().map_err(io_err)?,
        other => return Err(nc_err(format!("cannot read numeric type {other}"))),
    };
    Ok(v)
}

fn read_block(bytes: &[u8], offset: u64, count: usize, nc_type: u32) -> Result<Vec<f64>> {
    let end = (count as u64)
        .checked_mul(type_size(nc_type))
        .and_then(|n| n.checked_add(offset))
        .filter(|end| *end <= bytes.len() as u64)
        .ok_or_else(|| nc_err(format!("data block of {count} values at {offset} runs past end of file")))?;
    log::trace!("NetCDF block {offset}..{end}");
    let mut cur = Cursor::new(bytes);
    cur.set_position(offset);
    (0..count).map(|_| read_value(&mut cur, nc_type)).collect()
}

pub(super) fn decode(bytes: &[u8], variable: Option<&str>) -> Result<Decoded> {
    let offset64 = match bytes.get(..4) {
        Some(b"CDF\x01") => false,
        Some(b"CDF\x02") => true,
        _ => return Err(nc_err("not a classic NetCDF file")),
    };
    let mut reader = HeaderReader { cur: Cursor::new(bytes), offset64 };
    reader.cur.set_position(4);
    let header = reader.header()?;

    let is_lat = |d: usize| LAT_NAMES.contains(&header.dims[d].name.to_ascii_lowercase().as_str());
    let is_lon = |d: usize| LON_NAMES.contains(&header.dims[d].name.to_ascii_lowercase().as_str());
    let gridded = |v: &Var| {
        let n = v.dims.len();
        n >= 2 && is_lat(v.dims[n - 2]) && is_lon(v.dims[n - 1])
    };
    let var = match variable {
        Some(name) => header
            .vars
            .iter()
            .find(|v| v.name == name)
            .ok_or_else(|| nc_err(format!("no variable `{name}`")))?,
        None => header
            .vars
            .iter()
            .find(|v| gridded(v))
            .ok_or_else(|| nc_err("no variable on a (lat, lon) grid"))?,
    };
    if !gridded(var) {
        return Err(nc_err(format!("variable `{}` is not on a (lat, lon) grid", var.name)));
    }
    if var.nc_type == NC_CHAR {
        return Err(nc_err(format!("variable `{}` holds characters", var.name)));
    }

    let rank = var.dims.len();
    let (lat_dim, lon_dim) = (var.dims[rank - 2], var.dims[rank - 1]);
    let coord = |dim: usize| -> Result<Vec<f64>> {
        let c = header
            .coordinate(dim)
            .ok_or_else(|| nc_err(format!("missing coordinate variable `{}`", header.dims[dim].name)))?;
        read_block(bytes, c.begin, header.dim_len(dim), c.nc_type)
    };
    let lats = coord(lat_dim)?;
    let lons = coord(lon_dim)?;
    let dx = spacing(&lons, "longitude")?;
    let dy = spacing(&lats, "latitude")?;
    if dx <= 0.0 {
        return Err(nc_err("longitude must increase along the grid"));
    }
    let (nx, ny) = (lons.len(), lats.len());
    let south_up = dy > 0.0;

    let pixels = nx
        .checked_mul(ny)
        .ok_or_else(|| nc_err(format!("{nx}x{ny} grid is too large")))?;
    let band_count = var.dims[..rank - 2]
        .iter()
        .try_fold(1usize, |acc, d| acc.checked_mul(header.dim_len(*d)))
        .ok_or_else(|| nc_err(format!("variable `{}` has too many bands", var.name)))?;
    let band_bytes = (pixels as u64).saturating_mul(type_size(var.nc_type));
    if (band_count as u64).checked_mul(band_bytes).is_none_or(|n| n > bytes.len() as u64) {
        return Err(nc_err(format!(
            "variable `{}` declares {band_count} band(s) of {nx}x{ny}, more than the file holds",
            var.name
        )));
    }
    let per_record = if header.is_record(var) {
        band_count / header.numrecs.max(1)
    } else {
        band_count
    };
    let record_size = header.record_size();
    let fill = var
        .number_attr("_FillValue")
        .or_else(|| var.number_attr("missing_value"))
        .unwrap_or_else(|| default_fill(var.nc_type));
    let scale = var.number_attr("scale_factor").unwrap_or(1.0);
    let add = var.number_attr("add_offset").unwrap_or(0.0);
    // Float fills are defined in single precision.
    let is_fill = |v: f64| {
        if var.nc_type == NC_FLOAT {
            v as f32 == fill as f32
        } else {
            v == fill
        }
    };
    let mut bands = Vec::with_capacity(band_count);
    for b in 0..band_count {
        // Out-of-range offsets saturate and fail the block read.
        let offset = if header.is_record(var) {
            var.begin
                .saturating_add(((b / per_record) as u64).saturating_mul(record_size))
                .saturating_add(((b % per_record) as u64).saturating_mul(band_bytes))
        } else {
            var.begin.saturating_add((b as u64).saturating_mul(band_bytes))
        };
        let raw = read_block(bytes, offset, pixels, var.nc_type)?;
        let mut band: Vec<f64> = raw
            .into_iter()
            .map(|v| if is_fill(v) { f64::NAN } else { v * scale + add })
            .collect();
        if south_up {
            band = band.chunks_exact(nx).rev().flatten().copied().collect();
        }
        bands.push(band);
    }
    if bands.is_empty() {
        return Err(nc_err(format!("variable `{}` has no records", var.name)));
    }

    let north = lats.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let transform = GeoTransform::new(lons[0] - dx / 2.0, north + dy.abs() / 2.0, dx, -dy.abs());
    log::debug!(
        "NetCDF variable `{}`: {nx}x{ny}, {band_count} band(s){}",
        var.name,
        if south_up { ", flipped to north-up" } else { "" }
    );
    Ok(Decoded {
        raster: Raster::new(nx, ny, transform, bands)?,
        epsg: None,
    })
}

/// Constant step of a coordinate axis.
fn spacing(values: &[f64], axis: &str) -> Result<f64> {
    if values.len() < 2 {
        return Err(nc_err(format!("{axis} axis needs at least two coordinates")));
    }
    let step = (values[values.len() - 1] - values[0]) / (values.len() - 1) as f64;
    let tolerance = step.abs() * 1e-3;
    let regular = step != 0.0
        && values
            .windows(2)
            .all(|w| ((w[1] - w[0]) - step).abs() <= tolerance);
    if regular {
        Ok(step)
    } else {
        Err(nc_err(format!("{axis} axis is not regularly spaced")))
    }
}
