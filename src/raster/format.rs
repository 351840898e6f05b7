//! Raster encoding detection and decoding.
//!
//! Encoding is detected from magic bytes first and the file extension second;
//! gzip-wrapped input is unwrapped transparently. Only the encodings listed in
//! [`RasterFormat`] are decoded. Everything else, including NetCDF-4 (HDF5)
//! and 64-bit-data CDF-5 files, fails with an "unsupported raster format"
//! error before any decoding is attempted.

use super::Raster;
use crate::classify::ClassificationSpec;
use crate::crs::Crs;
use crate::error::{EnrichError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const HDF5_MAGIC: &[u8] = b"\x89HDF\r\n\x1a\n";

/// Raster encodings the engine decodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RasterFormat {
    AsciiGrid,
    GeoTiff,
    NetCdf,
}

impl RasterFormat {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AsciiGrid => "ASCII grid",
            Self::GeoTiff => "GeoTIFF",
            Self::NetCdf => "NetCDF",
        }
    }

    fn extensions(&self) -> &'static [&'static str] {
        match self {
            Self::AsciiGrid => &[".asc", ".grd"],
            Self::GeoTiff => &[".tif", ".tiff"],
            Self::NetCdf => &[".nc", ".nc3", ".cdf"],
        }
    }

    fn matches_magic(&self, bytes: &[u8]) -> bool {
        match self {
            Self::AsciiGrid => looks_like_ascii_grid(bytes),
            Self::GeoTiff => [b"II*\0", b"MM\0*", b"II+\0", b"MM\0+"]
                .iter()
                .any(|m| bytes.starts_with(&m[..])),
            Self::NetCdf => bytes.starts_with(b"CDF\x01") || bytes.starts_with(b"CDF\x02"),
        }
    }

    /// Detect the encoding of `bytes`, using `path_hint`'s extension only when
    /// no magic bytes match.
    pub fn detect(bytes: &[u8], path_hint: &Path) -> Result<Self> {
        const ALL: [RasterFormat; 3] = [
            RasterFormat::GeoTiff,
            RasterFormat::NetCdf,
            RasterFormat::AsciiGrid,
        ];
        if let Some(f) = ALL.iter().find(|f| f.matches_magic(bytes)) {
            return Ok(*f);
        }
        if bytes.starts_with(HDF5_MAGIC) {
            return Err(unsupported(path_hint, "NetCDF-4/HDF5 containers are not accepted"));
        }
        if bytes.starts_with(b"CDF\x05") {
            return Err(unsupported(path_hint, "CDF-5 (64-bit data) is not accepted"));
        }
        let name = path_hint.to_string_lossy().to_lowercase();
        ALL.iter()
            .find(|f| f.extensions().iter().any(|ext| name.ends_with(ext)))
            .copied()
            .ok_or_else(|| unsupported(path_hint, "expected ASCII grid, GeoTIFF or NetCDF"))
    }
}

impl fmt::Display for RasterFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn unsupported(path: &Path, detail: &str) -> EnrichError {
    EnrichError::raster_format(format!(
        "unsupported raster format: {} ({detail})",
        path.display()
    ))
}

fn looks_like_ascii_grid(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(64)];
    let Ok(head) = std::str::from_utf8(head) else {
        return false;
    };
    let head = head.trim_start().to_ascii_lowercase();
    ["ncols", "nrows", "xllcorner", "xllcenter"]
        .iter()
        .any(|k| head.starts_with(k))
}

/// Where to read a raster layer from.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RasterLayerSpec {
    /// Layer name; prefixes every output column.
    pub name: String,
    /// Single raster file, optionally gzipped.
    pub path: PathBuf,
    /// Declared CRS; overrides whatever the file carries.
    #[serde(default)]
    pub crs: Option<Crs>,
    /// NetCDF variable to read. Defaults to the first gridded variable.
    #[serde(default)]
    pub variable: Option<String>,
    /// Turns band 1 into categorical labels.
    #[serde(default)]
    pub classification: Option<ClassificationSpec>,
}

/// Decoder output before CRS resolution.
pub(super) struct Decoded {
    pub raster: Raster,
    /// EPSG code carried by the file, if it carries one.
    pub epsg: Option<u16>,
}

/// Read and decode a raster layer, resolving its CRS as declared, then as
/// carried by the file, then WGS84.
pub fn load_raster(spec: &RasterLayerSpec) -> Result<Raster> {
    let bytes = std::fs::read(&spec.path).map_err(|e| {
        EnrichError::reference_load(&spec.name, format!("read {}: {e}", spec.path.display()))
    })?;
    let raster = decode_with(&bytes, &spec.path, spec.variable.as_deref(), spec.crs, &spec.name)?;
    log::info!(
        "loaded raster `{}`: {}x{} pixels, {} band(s), {}",
        spec.name,
        raster.width(),
        raster.height(),
        raster.band_count(),
        raster.crs()
    );
    Ok(raster)
}

/// Decode raster bytes. `path_hint` is used for extension-based detection and
/// error messages only.
pub fn decode_raster(bytes: &[u8], path_hint: &Path, variable: Option<&str>) -> Result<Raster> {
    decode_with(bytes, path_hint, variable, None, &path_hint.display().to_string())
}

/// Decoding failures are `RasterFormat`; an unusable CRS is a `ReferenceLoad`
/// of `layer`.
fn decode_with(
    bytes: &[u8],
    path_hint: &Path,
    variable: Option<&str>,
    declared: Option<Crs>,
    layer: &str,
) -> Result<Raster> {
    let (bytes, hint) = unwrap_gzip(bytes, path_hint)?;
    let format = RasterFormat::detect(&bytes, &hint)?;
    log::debug!("decoding {} as {format}", path_hint.display());
    let decoded = match format {
        RasterFormat::AsciiGrid => super::ascii::decode(&bytes)?,
        RasterFormat::GeoTiff => decode_geotiff(&bytes)?,
        RasterFormat::NetCdf => super::netcdf::decode(&bytes, variable)?,
    };
    let crs = match (declared, decoded.epsg) {
        (Some(crs), _) => crs,
        (None, Some(code)) => Crs::from_epsg(code).map_err(|_| {
            EnrichError::reference_load(layer, format!("raster CRS EPSG:{code} is not supported"))
        })?,
        (None, None) => Crs::WGS84,
    };
    decoded.raster.with_crs(layer, crs)
}

#[cfg(feature = "raster-geotiff")]
fn decode_geotiff(bytes: &[u8]) -> Result<Decoded> {
    super::geotiff::decode(bytes)
}

#[cfg(not(feature = "raster-geotiff"))]
fn decode_geotiff(_bytes: &[u8]) -> Result<Decoded> {
    Err(EnrichError::raster_format(
        "GeoTIFF decoding requires the `raster-geotiff` feature",
    ))
}

/// Strip a gzip wrapper (by magic or `.gz` extension) and the `.gz` suffix of
/// the path hint.
fn unwrap_gzip<'a>(
    bytes: &'a [u8],
    path_hint: &Path,
) -> Result<(std::borrow::Cow<'a, [u8]>, PathBuf)> {
    use std::borrow::Cow;

    let name = path_hint.to_string_lossy();
    let by_ext = name.to_lowercase().ends_with(".gz");
    if !bytes.starts_with(GZIP_MAGIC) && !by_ext {
        return Ok((Cow::Borrowed(bytes), path_hint.to_path_buf()));
    }
    let hint = if by_ext {
        PathBuf::from(&name[..name.len() - 3])
    } else {
        path_hint.to_path_buf()
    };
    Ok((Cow::Owned(gunzip(bytes, path_hint)?), hint))
}

#[cfg(feature = "compression-gzip")]
fn gunzip(bytes: &[u8], path_hint: &Path) -> Result<Vec<u8>> {
    use flate2::read::GzDecoder;
    use std::io::Read;

    let mut out = Vec::new();
    GzDecoder::new(bytes).read_to_end(&mut out).map_err(|e| {
        EnrichError::raster_format(format!("corrupt gzip stream in {}: {e}", path_hint.display()))
    })?;
    Ok(out)
}

#[cfg(not(feature = "compression-gzip"))]
fn gunzip(_bytes: &[u8], path_hint: &Path) -> Result<Vec<u8>> {
    Err(EnrichError::raster_format(format!(
        "{} is gzipped; enable the `compression-gzip` feature",
        path_hint.display()
    )))
}
