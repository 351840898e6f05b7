//! Value-to-label classification of discrete raster values.
//!
//! A [`ClassificationTable`] is an ordered list of `(value, label)` pairs with
//! one default label. Lookup is exact on integer values. Anything that is not
//! in the table (including non-integral values produced by resampling or
//! noise) gets the default label, never null: null stays reserved for "no
//! value was sampled".
//!
//! ```
//! use geobeam::classify::ClassificationTable;
//!
//! let nlcd = ClassificationTable::nlcd();
//! assert_eq!(nlcd.classify(Some(41.0)).as_deref(), Some("Deciduous Forest"));
//! assert_eq!(nlcd.classify(Some(7.0)).as_deref(), Some("Unknown"));
//! assert_eq!(nlcd.classify(None), None);
//! ```

use crate::error::{EnrichError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Label for values outside a table.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// NLCD land cover legend.
const NLCD_CLASSES: &[(i64, &str)] = &[
    (11, "Open Water"),
    (12, "Perennial Ice/Snow"),
    (21, "Developed, Open Space"),
    (22, "Developed, Low Intensity"),
    (23, "Developed, Medium Intensity"),
    (24, "Developed, High Intensity"),
    (31, "Barren Land"),
    (41, "Deciduous Forest"),
    (42, "Evergreen Forest"),
    (43, "Mixed Forest"),
    (52, "Shrub/Scrub"),
    (71, "Grassland/Herbaceous"),
    (81, "Pasture/Hay"),
    (82, "Cultivated Crops"),
    (90, "Woody Wetlands"),
    (95, "Emergent Herbaceous Wetlands"),
];

/// Ordered, immutable value→label table.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassificationTable {
    name: String,
    entries: Vec<(i64, String)>,
    index: HashMap<i64, usize>,
    default_label: String,
}

impl ClassificationTable {
    /// Build a table. Values must be unique.
    pub fn new(
        name: impl Into<String>,
        entries: impl IntoIterator<Item = (i64, String)>,
        default_label: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        let entries: Vec<(i64, String)> = entries.into_iter().collect();
        let mut index = HashMap::with_capacity(entries.len());
        for (i, (value, _)) in entries.iter().enumerate() {
            if index.insert(*value, i).is_some() {
                return Err(EnrichError::Config(format!(
                    "classification `{name}` maps value {value} twice"
                )));
            }
        }
        Ok(Self {
            name,
            entries,
            index,
            default_label: default_label.into(),
        })
    }

    /// The National Land Cover Database legend.
    pub fn nlcd() -> Self {
        let entries = NLCD_CLASSES.iter().map(|(v, l)| (*v, (*l).to_string()));
        Self {
            name: "nlcd".into(),
            index: NLCD_CLASSES.iter().enumerate().map(|(i, (v, _))| (*v, i)).collect(),
            entries: entries.collect(),
            default_label: UNKNOWN_LABEL.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entries in declaration order.
    pub fn entries(&self) -> &[(i64, String)] {
        &self.entries
    }

    pub fn default_label(&self) -> &str {
        &self.default_label
    }

    /// Label for an integer class value.
    pub fn label(&self, value: i64) -> &str {
        self.index
            .get(&value)
            .map_or(self.default_label.as_str(), |i| self.entries[*i].1.as_str())
    }

    /// Label for a raw sample; `None` (nothing sampled) stays `None`.
    pub fn classify(&self, raw: Option<f64>) -> Option<String> {
        let raw = raw?;
        let label = if raw.fract() == 0.0 && raw >= i64::MIN as f64 && raw <= i64::MAX as f64 {
            self.label(raw as i64)
        } else {
            self.default_label.as_str()
        };
        Some(label.to_string())
    }
}

/// Classification declared in configuration: a built-in legend by name, or
/// explicit entries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClassificationSpec {
    Builtin(String),
    Table {
        entries: Vec<(i64, String)>,
        #[serde(default)]
        default_label: Option<String>,
    },
}

impl ClassificationSpec {
    pub fn build(&self, layer: &str) -> Result<ClassificationTable> {
        match self {
            Self::Builtin(name) if name.eq_ignore_ascii_case("nlcd") => Ok(ClassificationTable::nlcd()),
            Self::Builtin(name) => Err(EnrichError::Config(format!(
                "layer `{layer}`: unknown classification `{name}`"
            ))),
            Self::Table {
                entries,
                default_label,
            } => ClassificationTable::new(
                layer,
                entries.iter().cloned(),
                default_label.as_deref().unwrap_or(UNKNOWN_LABEL),
            ),
        }
    }
}
