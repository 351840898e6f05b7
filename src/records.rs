//! Record types flowing through the engine.

use crate::dataset::Element;
use crate::window::TripId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Which end of a trip a point is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    Pickup,
    Dropoff,
}

impl Role {
    /// Column prefix used when merging this role's enrichment back into a trip.
    pub fn prefix(self) -> &'static str {
        match self {
            Role::Pickup => "pickup_",
            Role::Dropoff => "dropoff_",
        }
    }
}

/// One trip endpoint, as stored in the snapshot store:
/// `{trip_id, latitude, longitude, is_pickup}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PointRecord {
    pub trip_id: TripId,
    pub latitude: f64,
    pub longitude: f64,
    pub is_pickup: u8,
}

impl PointRecord {
    pub fn new(trip_id: TripId, role: Role, latitude: f64, longitude: f64) -> Self {
        Self {
            trip_id,
            latitude,
            longitude,
            is_pickup: u8::from(role == Role::Pickup),
        }
    }

    pub fn role(&self) -> Role {
        if self.is_pickup == 1 { Role::Pickup } else { Role::Dropoff }
    }

    /// `(x, y)` = `(longitude, latitude)` in the working CRS.
    pub fn xy(&self) -> (f64, f64) {
        (self.longitude, self.latitude)
    }
}

/// Type of an enrichment column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrKind {
    Int,
    Float,
    Text,
}

/// A non-null attribute value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl AttrValue {
    /// Parse a tabular cell: integer, then float, then text. Empty cells are null.
    pub fn parse_cell(raw: &str) -> Option<Self> {
        let s = raw.trim();
        if s.is_empty() {
            return None;
        }
        if let Ok(i) = s.parse::<i64>() {
            return Some(Self::Int(i));
        }
        if let Ok(f) = s.parse::<f64>() {
            return Some(Self::Float(f));
        }
        Some(Self::Text(s.to_string()))
    }

    pub fn kind(&self) -> AttrKind {
        match self {
            Self::Int(_) => AttrKind::Int,
            Self::Float(_) => AttrKind::Float,
            Self::Text(_) => AttrKind::Text,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Named attributes; `None` is an explicit null.
pub type Attributes = BTreeMap<String, Option<AttrValue>>;

/// Declared output column of an enrichment layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: AttrKind,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, kind: AttrKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// A point plus the attributes attached by the layers applied so far.
#[derive(Clone, Debug, PartialEq)]
pub struct EnrichedPointRecord {
    pub point: PointRecord,
    /// Output attributes, kept through the merge.
    pub attributes: Attributes,
    /// Intermediates (raw raster classes, tile coordinates); dropped by the merge.
    pub working: Attributes,
}

impl EnrichedPointRecord {
    pub fn trip_id(&self) -> TripId {
        self.point.trip_id
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.attributes.get(name).and_then(Option::as_ref)
    }
}

impl From<PointRecord> for EnrichedPointRecord {
    fn from(point: PointRecord) -> Self {
        Self {
            point,
            attributes: Attributes::new(),
            working: Attributes::new(),
        }
    }
}

/// A trip as produced upstream. Only the id and the two endpoints matter to the
/// engine; every other field is carried through unchanged.
pub trait Trip: Element + Serialize + DeserializeOwned {
    fn trip_id(&self) -> TripId;

    /// `(latitude, longitude)` of the pickup.
    fn pickup(&self) -> (f64, f64);

    /// `(latitude, longitude)` of the dropoff.
    fn dropoff(&self) -> (f64, f64);

    /// Raw coordinate columns, dropped from merged output.
    fn spatial_columns() -> &'static [&'static str] {
        &[]
    }

    /// Split into the two role-tagged endpoint rows.
    fn endpoints(&self) -> [PointRecord; 2] {
        let (plat, plon) = self.pickup();
        let (dlat, dlon) = self.dropoff();
        [
            PointRecord::new(self.trip_id(), Role::Pickup, plat, plon),
            PointRecord::new(self.trip_id(), Role::Dropoff, dlat, dlon),
        ]
    }
}

/// A taxi trip in the shape of the public NYC trip records.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaxiTrip {
    pub trip_id: TripId,
    pub vendor_id: i64,
    pub pickup_datetime: String,
    pub dropoff_datetime: String,
    pub passenger_count: i64,
    pub trip_distance: f64,
    pub fare_amount: f64,
    pub pickup_longitude: f64,
    pub pickup_latitude: f64,
    pub dropoff_longitude: f64,
    pub dropoff_latitude: f64,
}

impl Trip for TaxiTrip {
    fn trip_id(&self) -> TripId {
        self.trip_id
    }

    fn pickup(&self) -> (f64, f64) {
        (self.pickup_latitude, self.pickup_longitude)
    }

    fn dropoff(&self) -> (f64, f64) {
        (self.dropoff_latitude, self.dropoff_longitude)
    }

    fn spatial_columns() -> &'static [&'static str] {
        &[
            "pickup_longitude",
            "pickup_latitude",
            "dropoff_longitude",
            "dropoff_latitude",
        ]
    }
}

/// Final trip-level record: the original trip plus role-prefixed enrichment
/// columns (`pickup_*`, `dropoff_*`).
#[derive(Clone, Debug, PartialEq)]
pub struct MergedTripRecord<T> {
    pub trip: T,
    pub columns: Attributes,
}

impl<T: Trip> MergedTripRecord<T> {
    pub fn trip_id(&self) -> TripId {
        self.trip.trip_id()
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.columns.get(name).and_then(Option::as_ref)
    }
}
