//! Polygon reference layers.
//!
//! A [`RegionLayer`] holds a set of [`RegionPolygon`]s in the working CRS
//! behind an R-tree of their bounding boxes. Layers are built once per run by
//! [`load_vector_layer`] (or [`RegionLayer::new`] for in-memory data), are
//! immutable afterwards, and are shared with every partition through a
//! [`Broadcast`](crate::broadcast::Broadcast).

use crate::crs::{Crs, Reprojector};
use crate::error::{EnrichError, Result};
use crate::records::{AttrKind, AttrValue, Attributes, ColumnSpec};
use geo::{BoundingRect, MultiPolygon};
use geojson::{Feature, GeoJson};
use rstar::{AABB, RTree, RTreeObject};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// One named region of a polygon layer.
#[derive(Clone, Debug, PartialEq)]
pub struct RegionPolygon {
    /// Load ordinal; ties between overlapping regions go to the lowest id.
    pub id: u32,
    /// Shared identifier used to join attribute tables.
    pub key: String,
    pub name: Option<String>,
    pub attributes: Attributes,
    /// Boundary in the working CRS.
    pub geometry: MultiPolygon<f64>,
    /// CRS the boundary was loaded from.
    pub source_crs: Crs,
}

impl RegionPolygon {
    pub fn new(id: u32, key: impl Into<String>, geometry: MultiPolygon<f64>) -> Self {
        Self {
            id,
            key: key.into(),
            name: None,
            attributes: Attributes::new(),
            geometry,
            source_crs: Crs::WGS84,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, name: &str, value: Option<AttrValue>) -> Self {
        self.attributes.insert(name.to_string(), value);
        self
    }
}

/// R-tree entry pointing back into the layer's region list.
#[derive(Debug)]
struct RegionEntry {
    index: usize,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for RegionEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// An immutable, spatially indexed polygon layer.
#[derive(Debug)]
pub struct RegionLayer {
    name: String,
    regions: Vec<RegionPolygon>,
    tree: RTree<RegionEntry>,
    attribute_columns: Vec<ColumnSpec>,
}

impl RegionLayer {
    /// Build a layer from regions already in the working CRS. Regions are
    /// kept sorted by id. `attribute_columns` declares the attribute set
    /// every region carries (missing values are null).
    pub fn new(
        name: impl Into<String>,
        mut regions: Vec<RegionPolygon>,
        attribute_columns: Vec<ColumnSpec>,
    ) -> Self {
        regions.sort_by_key(|r| r.id);
        let entries = regions
            .iter()
            .enumerate()
            .filter_map(|(index, r)| {
                let rect = r.geometry.bounding_rect()?;
                Some(RegionEntry {
                    index,
                    envelope: AABB::from_corners(
                        [rect.min().x, rect.min().y],
                        [rect.max().x, rect.max().y],
                    ),
                })
            })
            .collect();
        Self {
            name: name.into(),
            regions,
            tree: RTree::bulk_load(entries),
            attribute_columns,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn regions(&self) -> &[RegionPolygon] {
        &self.regions
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn attribute_columns(&self) -> &[ColumnSpec] {
        &self.attribute_columns
    }

    /// Regions whose bounding box contains `(x, y)`, in ascending id order.
    pub fn candidates(&self, x: f64, y: f64) -> Vec<&RegionPolygon> {
        let mut idx: Vec<usize> = self
            .tree
            .locate_in_envelope_intersecting(&AABB::from_point([x, y]))
            .map(|e| e.index)
            .collect();
        idx.sort_unstable();
        idx.into_iter().map(|i| &self.regions[i]).collect()
    }

    /// Output column name for `field` of this layer (`<layer>_<field>`).
    pub fn column_name(&self, field: &str) -> String {
        format!("{}_{}", self.name, field)
    }

    /// Columns this layer contributes to each enriched point.
    pub fn output_columns(&self) -> Vec<ColumnSpec> {
        let mut cols = vec![
            ColumnSpec::new(self.column_name("key"), AttrKind::Text),
            ColumnSpec::new(self.column_name("name"), AttrKind::Text),
        ];
        cols.extend(
            self.attribute_columns
                .iter()
                .map(|c| ColumnSpec::new(self.column_name(&c.name), c.kind)),
        );
        cols
    }
}

/// Where and how to load a polygon layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VectorLayerSpec {
    /// Layer name; prefixes every output column.
    pub name: String,
    /// Directory holding `*.geojson` / `*.json` files.
    pub dir: PathBuf,
    /// Feature property holding the region identifier.
    pub key_property: String,
    /// Feature property holding the region's display name.
    #[serde(default)]
    pub name_property: Option<String>,
    /// Feature properties copied onto every region as attributes.
    #[serde(default)]
    pub carry_properties: Vec<String>,
    /// Declared source CRS. When absent the CRS is probed from the files.
    #[serde(default)]
    pub crs: Option<Crs>,
    /// Auxiliary attribute table left-joined onto the polygons.
    #[serde(default)]
    pub attributes: Option<AttributeTableSpec>,
}

/// A CSV attribute table joined onto polygons by a shared identifier.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttributeTableSpec {
    pub path: PathBuf,
    /// Column holding the region identifier.
    pub key_column: String,
}

/// Load a polygon layer from a directory of GeoJSON files, reproject it into
/// the working CRS and left-join its attribute table.
///
/// Files are read in sorted path order and features in file order, which fixes
/// region ids. Non-polygonal features are skipped with a warning. Every
/// polygon is kept whether or not the attribute table covers it.
pub fn load_vector_layer(spec: &VectorLayerSpec) -> Result<RegionLayer> {
    let files = layer_files(&spec.dir)
        .map_err(|e| EnrichError::reference_load(&spec.name, format!("{e:#}")))?;

    let mut regions = Vec::new();
    let mut skipped = 0usize;
    for path in &files {
        let text = std::fs::read_to_string(path).map_err(|e| {
            EnrichError::reference_load(&spec.name, format!("read {}: {e}", path.display()))
        })?;
        let geojson: GeoJson = text.parse().map_err(|e| {
            EnrichError::reference_load(&spec.name, format!("parse {}: {e}", path.display()))
        })?;
        let (features, probed) = match geojson {
            GeoJson::FeatureCollection(fc) => {
                let probed = probe_crs(fc.foreign_members.as_ref());
                (fc.features, probed)
            }
            GeoJson::Feature(f) => (vec![f], None),
            GeoJson::Geometry(_) => {
                return Err(EnrichError::reference_load(
                    &spec.name,
                    format!("{} holds a bare geometry, expected features", path.display()),
                ));
            }
        };
        let crs = resolve_crs(spec, path, probed)?;
        let reprojector = Reprojector::to_working(crs)?;

        for feature in &features {
            let Some(geometry) = feature_multipolygon(feature, &spec.name, path)? else {
                skipped += 1;
                continue;
            };
            let key = property_string(feature, &spec.key_property).ok_or_else(|| {
                EnrichError::reference_load(
                    &spec.name,
                    format!(
                        "feature in {} has no `{}` property",
                        path.display(),
                        spec.key_property
                    ),
                )
            })?;
            let mut region = RegionPolygon::new(
                regions.len() as u32,
                key,
                reprojector.transform_multipolygon(&geometry)?,
            );
            region.source_crs = crs;
            region.name = spec
                .name_property
                .as_deref()
                .and_then(|p| property_string(feature, p));
            for prop in &spec.carry_properties {
                let value = feature.property(prop).and_then(json_to_attr);
                region.attributes.insert(prop.clone(), value);
            }
            regions.push(region);
        }
    }
    if skipped > 0 {
        log::warn!("layer `{}`: skipped {skipped} non-polygonal features", spec.name);
    }

    let mut columns: Vec<ColumnSpec> = spec
        .carry_properties
        .iter()
        .map(|p| ColumnSpec::new(p, infer_kind(regions.iter().filter_map(|r| r.attributes.get(p)?.as_ref()))))
        .collect();
    normalize_columns(&mut regions, &columns);

    if let Some(table_spec) = &spec.attributes {
        let table = read_attribute_table(table_spec)
            .map_err(|e| EnrichError::reference_load(&spec.name, format!("{e:#}")))?;
        let matched = table.left_join(&mut regions);
        log::info!(
            "layer `{}`: attribute table matched {matched} of {} regions",
            spec.name,
            regions.len()
        );
        columns.extend(table.columns);
    }

    log::info!(
        "loaded layer `{}`: {} regions from {} files",
        spec.name,
        regions.len(),
        files.len()
    );
    Ok(RegionLayer::new(&spec.name, regions, columns))
}

fn layer_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    use anyhow::{Context, bail};
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }
    let mut files = Vec::new();
    for ext in ["geojson", "json"] {
        let pattern = dir.join(format!("*.{ext}"));
        let pattern = pattern.to_string_lossy();
        for entry in glob::glob(&pattern).with_context(|| format!("invalid glob pattern: {pattern}"))? {
            let path = entry.with_context(|| format!("error reading glob entry for pattern: {pattern}"))?;
            if path.is_file() {
                files.push(path);
            }
        }
    }
    files.sort();
    if files.is_empty() {
        bail!("no GeoJSON files found in {}", dir.display());
    }
    Ok(files)
}

/// Legacy GeoJSON `"crs": {"type": "name", "properties": {"name": "..."}}`.
fn probe_crs(foreign: Option<&geojson::JsonObject>) -> Option<String> {
    foreign?
        .get("crs")?
        .get("properties")?
        .get("name")?
        .as_str()
        .map(str::to_string)
}

fn resolve_crs(spec: &VectorLayerSpec, path: &Path, probed: Option<String>) -> Result<Crs> {
    let probed = probed.map(|s| Crs::parse(&s)).transpose()?;
    match (spec.crs, probed) {
        (Some(declared), Some(found)) if declared != found => {
            log::warn!(
                "layer `{}`: {} declares {found}, using configured {declared}",
                spec.name,
                path.display()
            );
            Ok(declared)
        }
        (Some(declared), _) => Ok(declared),
        (None, Some(found)) => Ok(found),
        // RFC 7946: GeoJSON without a crs member is WGS84.
        (None, None) => Ok(Crs::WGS84),
    }
}

fn feature_multipolygon(
    feature: &Feature,
    layer: &str,
    path: &Path,
) -> Result<Option<MultiPolygon<f64>>> {
    let Some(geometry) = feature.geometry.clone() else {
        return Ok(None);
    };
    let geometry: geo::Geometry<f64> = geometry.try_into().map_err(|e| {
        EnrichError::reference_load(layer, format!("bad geometry in {}: {e}", path.display()))
    })?;
    Ok(match geometry {
        geo::Geometry::MultiPolygon(mp) => Some(mp),
        geo::Geometry::Polygon(p) => Some(MultiPolygon(vec![p])),
        _ => None,
    })
}

fn property_string(feature: &Feature, name: &str) -> Option<String> {
    match feature.property(name)? {
        serde_json::Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_to_attr(v: &serde_json::Value) -> Option<AttrValue> {
    match v {
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(AttrValue::Int)
            .or_else(|| n.as_f64().map(AttrValue::Float)),
        serde_json::Value::String(s) => AttrValue::parse_cell(s),
        serde_json::Value::Bool(b) => Some(AttrValue::Int(i64::from(*b))),
        _ => None,
    }
}

/// Narrowest kind holding every value: all ints → Int, numbers → Float, else Text.
fn infer_kind<'a>(values: impl Iterator<Item = &'a AttrValue>) -> AttrKind {
    values.fold(AttrKind::Int, |acc, v| match (acc, v.kind()) {
        (AttrKind::Text, _) | (_, AttrKind::Text) => AttrKind::Text,
        (AttrKind::Float, _) | (_, AttrKind::Float) => AttrKind::Float,
        _ => AttrKind::Int,
    })
}

fn coerce(value: AttrValue, kind: AttrKind) -> AttrValue {
    match (kind, value) {
        (AttrKind::Float, AttrValue::Int(i)) => AttrValue::Float(i as f64),
        (AttrKind::Text, v @ (AttrValue::Int(_) | AttrValue::Float(_))) => {
            AttrValue::Text(v.to_string())
        }
        (_, v) => v,
    }
}

fn normalize_columns(regions: &mut [RegionPolygon], columns: &[ColumnSpec]) {
    for r in regions {
        for c in columns {
            let v = r.attributes.remove(&c.name).flatten();
            r.attributes.insert(c.name.clone(), v.map(|v| coerce(v, c.kind)));
        }
    }
}

/// Attribute rows keyed by region identifier.
struct AttributeTable {
    columns: Vec<ColumnSpec>,
    rows: HashMap<String, Attributes>,
}

impl AttributeTable {
    /// Attach attributes to every region; regions without a row get nulls.
    /// Returns the number of regions that found a row.
    fn left_join(&self, regions: &mut [RegionPolygon]) -> usize {
        let mut matched = 0;
        for r in regions.iter_mut() {
            let row = self.rows.get(&r.key);
            matched += usize::from(row.is_some());
            for c in &self.columns {
                let v = row.and_then(|row| row.get(&c.name).cloned().flatten());
                r.attributes.insert(c.name.clone(), v);
            }
        }
        matched
    }
}

#[cfg(feature = "io-csv")]
fn read_attribute_table(spec: &AttributeTableSpec) -> anyhow::Result<AttributeTable> {
    use anyhow::{Context, bail};

    let path = &spec.path;
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("open {}", path.display()))?;
    let headers = rdr
        .headers()
        .with_context(|| format!("read header of {}", path.display()))?
        .clone();
    let Some(key_idx) = headers.iter().position(|h| h == spec.key_column) else {
        bail!("{} has no `{}` column", path.display(), spec.key_column);
    };

    let mut rows: HashMap<String, Attributes> = HashMap::new();
    let mut raw: BTreeMap<String, Vec<AttrValue>> = BTreeMap::new();
    for (i, rec) in rdr.records().enumerate() {
        let rec = rec.with_context(|| format!("parse CSV record #{}", i + 1))?;
        let key = rec.get(key_idx).unwrap_or_default().trim().to_string();
        if key.is_empty() {
            continue;
        }
        if rows.contains_key(&key) {
            log::warn!("{}: duplicate key `{key}`, keeping first row", path.display());
            continue;
        }
        let mut attrs = Attributes::new();
        for (j, h) in headers.iter().enumerate() {
            if j == key_idx {
                continue;
            }
            let v = rec.get(j).and_then(AttrValue::parse_cell);
            if let Some(v) = &v {
                raw.entry(h.to_string()).or_default().push(v.clone());
            }
            attrs.insert(h.to_string(), v);
        }
        rows.insert(key, attrs);
    }

    let columns: Vec<ColumnSpec> = headers
        .iter()
        .enumerate()
        .filter(|(j, _)| *j != key_idx)
        .map(|(_, h)| {
            let kind = raw.get(h).map_or(AttrKind::Text, |vs| infer_kind(vs.iter()));
            ColumnSpec::new(h, kind)
        })
        .collect();
    for attrs in rows.values_mut() {
        for c in &columns {
            if let Some(slot) = attrs.get_mut(&c.name) {
                *slot = slot.take().map(|v| coerce(v, c.kind));
            }
        }
    }
    Ok(AttributeTable { columns, rows })
}

#[cfg(not(feature = "io-csv"))]
fn read_attribute_table(_spec: &AttributeTableSpec) -> anyhow::Result<AttributeTable> {
    anyhow::bail!("attribute tables require the `io-csv` feature")
}
