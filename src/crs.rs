//! Coordinate reference systems and load-time reprojection.
//!
//! All matching happens in one working CRS, geographic WGS84 (EPSG:4326) with
//! `x = longitude`, `y = latitude`. Reference layers are reprojected once when
//! they are loaded, through a [`Reprojector`] built on `proj4rs`; points are
//! never reprojected.

use crate::error::{EnrichError, Result};
use geo::{Coord, MapCoords, MultiPolygon};
use proj4rs::proj::Proj;
use proj4rs::transform::transform;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

/// EPSG codes the engine can reproject from, with their proj definitions.
const SUPPORTED: &[(u16, bool, &str)] = &[
    (4326, true, "+proj=longlat +datum=WGS84 +no_defs"),
    (4269, true, "+proj=longlat +datum=NAD83 +no_defs"),
    (
        3857,
        false,
        "+proj=merc +a=6378137 +b=6378137 +lat_ts=0 +lon_0=0 +x_0=0 +y_0=0 +k=1 +units=m +no_defs",
    ),
    (
        2263,
        false,
        "+proj=lcc +lat_0=40.1666666666667 +lon_0=-74 +lat_1=41.0333333333333 +lat_2=40.6666666666667 +x_0=300000 +y_0=0 +datum=NAD83 +units=us-ft +no_defs",
    ),
    (32618, false, "+proj=utm +zone=18 +datum=WGS84 +units=m +no_defs"),
];

static EPSG_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)EPSG:{1,2}(?:[\d.]*:)?(\d+)\s*$").expect("valid EPSG regex"));

/// A supported coordinate reference system, identified by EPSG code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Crs {
    epsg: u16,
}

impl Crs {
    /// Geographic WGS84, the working CRS.
    pub const WGS84: Crs = Crs { epsg: 4326 };

    /// A CRS by EPSG code. Fails for codes the engine cannot reproject.
    pub fn from_epsg(epsg: u16) -> Result<Self> {
        if SUPPORTED.iter().any(|(c, ..)| *c == epsg) {
            Ok(Self { epsg })
        } else {
            Err(EnrichError::reference_load(
                format!("EPSG:{epsg}"),
                "unsupported coordinate reference system",
            ))
        }
    }

    /// Parse `EPSG:2263`, `urn:ogc:def:crs:EPSG::2263`, a bare code, or the
    /// OGC `CRS84` alias of WGS84.
    pub fn parse(s: &str) -> Result<Self> {
        let t = s.trim();
        if t.to_ascii_uppercase().ends_with("CRS84") {
            return Ok(Self::WGS84);
        }
        let code = match EPSG_PATTERN.captures(t) {
            Some(c) => c[1].parse::<u16>().ok(),
            None => t.parse::<u16>().ok(),
        };
        match code {
            Some(code) => Self::from_epsg(code),
            None => Err(EnrichError::reference_load(t, "unrecognized CRS identifier")),
        }
    }

    pub fn epsg(&self) -> u16 {
        self.epsg
    }

    /// Whether coordinates are in degrees.
    pub fn is_geographic(&self) -> bool {
        self.entry().1
    }

    fn entry(&self) -> &'static (u16, bool, &'static str) {
        // Construction guarantees membership.
        SUPPORTED
            .iter()
            .find(|(c, ..)| *c == self.epsg)
            .unwrap_or(&SUPPORTED[0])
    }

    fn proj(&self) -> Result<Proj> {
        Proj::from_proj_string(self.entry().2).map_err(|e| {
            EnrichError::reference_load(self.to_string(), format!("invalid projection: {e:?}"))
        })
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.epsg)
    }
}

impl TryFrom<String> for Crs {
    type Error = EnrichError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Crs> for String {
    fn from(c: Crs) -> String {
        c.to_string()
    }
}

/// Converts coordinates from a source CRS into the working CRS.
pub struct Reprojector {
    source: Crs,
    projs: Option<(Proj, Proj)>,
}

impl fmt::Debug for Reprojector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reprojector")
            .field("source", &self.source)
            .field("identity", &self.projs.is_none())
            .finish()
    }
}

impl Reprojector {
    /// Reprojector from `source` into the working CRS.
    pub fn to_working(source: Crs) -> Result<Self> {
        let projs = if source == Crs::WGS84 {
            None
        } else {
            Some((source.proj()?, Crs::WGS84.proj()?))
        };
        Ok(Self { source, projs })
    }

    pub fn source(&self) -> Crs {
        self.source
    }

    pub fn is_identity(&self) -> bool {
        self.projs.is_none()
    }

    /// Transform one coordinate into `(longitude, latitude)` degrees.
    pub fn transform(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        let Some((src, dst)) = &self.projs else {
            return Ok((x, y));
        };
        let (in_x, in_y) = if self.source.is_geographic() {
            (x.to_radians(), y.to_radians())
        } else {
            (x, y)
        };
        let mut point = (in_x, in_y, 0.0);
        transform(src, dst, &mut point).map_err(|e| {
            EnrichError::reference_load(
                self.source.to_string(),
                format!("cannot reproject ({x}, {y}): {e:?}"),
            )
        })?;
        Ok((point.0.to_degrees(), point.1.to_degrees()))
    }

    /// Reproject every vertex of a polygon set.
    pub fn transform_multipolygon(&self, mp: &MultiPolygon<f64>) -> Result<MultiPolygon<f64>> {
        if self.is_identity() {
            return Ok(mp.clone());
        }
        mp.try_map_coords(|c: Coord<f64>| {
            self.transform(c.x, c.y).map(|(x, y)| Coord { x, y })
        })
    }
}
