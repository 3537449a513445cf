//! Teaching-point store.
//!
//! Named per-axis coordinates persisted as one JSON document:
//!
//! ```json
//! {
//!   "data_type": "CELL.POS",
//!   "version": "1.00",
//!   "timestamp": "2026/01/07 12:00:00",
//!   "points": [
//!     { "name": "P001", "coordinate": "absolute", "axes": { "x": 10.0, "z": 5.0 },
//!       "protected": false, "comment": "pick" }
//!   ]
//! }
//! ```
//!
//! Only set axes are written; an absent axis means "leave this axis alone".
//! The legacy `[Point]` table (`ItemN=no,abs,x,y,z,u,s1,s2,a,b,protected,comment`)
//! can be imported with [`parse_legacy`].

use cell_common::axis::AxisId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::PointError;

const DATA_TYPE: &str = "CELL.POS";
const VERSION: &str = "1.00";
const TIMESTAMP_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// How a point's coordinates are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Coordinate {
    #[default]
    Absolute,
    /// Offsets from the position at the time of the move.
    Relative,
}

/// One teaching point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub name: String,

    #[serde(default)]
    pub coordinate: Coordinate,

    /// Set axes only.
    #[serde(default)]
    pub axes: BTreeMap<AxisId, f64>,

    #[serde(default)]
    pub protected: bool,

    #[serde(default)]
    pub comment: String,
}

impl Position {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            coordinate: Coordinate::Absolute,
            axes: BTreeMap::new(),
            protected: false,
            comment: String::new(),
        }
    }

    pub fn with_axis(mut self, axis: AxisId, value: f64) -> Self {
        self.axes.insert(axis, value);
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    #[inline]
    pub fn get(&self, axis: AxisId) -> Option<f64> {
        self.axes.get(&axis).copied()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PointFile {
    #[serde(default = "default_data_type")]
    data_type: String,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    points: Vec<Position>,
}

fn default_data_type() -> String {
    DATA_TYPE.to_string()
}
fn default_version() -> String {
    VERSION.to_string()
}

fn check_name(name: &str) -> Result<(), PointError> {
    if name.trim().is_empty() || name.trim() != name {
        return Err(PointError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// JSON has no NaN or infinity; such a value would not survive a save.
fn check_coordinates(point: &Position) -> Result<(), PointError> {
    match point.axes.iter().find(|(_, value)| !value.is_finite()) {
        Some((axis, value)) => Err(PointError::InvalidCoordinate {
            name: point.name.clone(),
            axis: *axis,
            value: *value,
        }),
        None => Ok(()),
    }
}

/// Keyed collection of teaching points bound to one file.
#[derive(Debug, Clone)]
pub struct PositionStore {
    path: PathBuf,
    points: BTreeMap<String, Position>,
    timestamp: String,
    modified: bool,
}

impl PositionStore {
    /// Empty store that will save to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            points: BTreeMap::new(),
            timestamp: String::new(),
            modified: false,
        }
    }

    /// Load the store. A missing file yields an empty store.
    ///
    /// # Errors
    ///
    /// `Io` when the file cannot be read, `Parse` on malformed JSON or a
    /// document holding the same name twice.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, PointError> {
        let mut store = Self::new(path);
        if !store.path.exists() {
            info!(path = %store.path.display(), "no point file, starting empty");
            return Ok(store);
        }
        let text = fs::read_to_string(&store.path)?;
        let file: PointFile = serde_json::from_str(&text)?;
        if file.data_type != DATA_TYPE {
            warn!(data_type = %file.data_type, "unexpected point file type");
        }
        for point in file.points {
            let name = point.name.clone();
            if store.points.insert(name.clone(), point).is_some() {
                return Err(PointError::Parse(format!("duplicate point {name}")));
            }
        }
        store.timestamp = file.timestamp;
        info!(path = %store.path.display(), points = store.points.len(), "point file loaded");
        Ok(store)
    }

    /// Write the store through a temporary file and a rename.
    pub fn save(&mut self) -> Result<(), PointError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        self.timestamp = chrono::Local::now().format(TIMESTAMP_FORMAT).to_string();
        let file = PointFile {
            data_type: default_data_type(),
            version: default_version(),
            timestamp: self.timestamp.clone(),
            points: self.points.values().cloned().collect(),
        };
        let text = serde_json::to_string_pretty(&file)?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &self.path)?;
        self.modified = false;
        debug!(path = %self.path.display(), points = self.points.len(), "point file saved");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    /// Unsaved changes pending.
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Position> {
        self.points.get(name)
    }

    /// All points sorted by name.
    pub fn list(&self) -> Vec<Position> {
        self.points.values().cloned().collect()
    }

    pub fn add(&mut self, point: Position) -> Result<(), PointError> {
        check_name(&point.name)?;
        check_coordinates(&point)?;
        if self.points.contains_key(&point.name) {
            return Err(PointError::Duplicate(point.name));
        }
        info!(name = %point.name, "point added");
        self.points.insert(point.name.clone(), point);
        self.modified = true;
        Ok(())
    }

    pub fn update(&mut self, point: Position) -> Result<(), PointError> {
        check_coordinates(&point)?;
        let existing = self
            .points
            .get_mut(&point.name)
            .ok_or_else(|| PointError::NotFound(point.name.clone()))?;
        if existing.protected {
            return Err(PointError::Protected(point.name));
        }
        info!(name = %point.name, "point updated");
        *existing = point;
        self.modified = true;
        Ok(())
    }

    /// Add, or update when the name exists.
    pub fn upsert(&mut self, point: Position) -> Result<(), PointError> {
        if self.points.contains_key(&point.name) {
            self.update(point)
        } else {
            self.add(point)
        }
    }

    pub fn delete(&mut self, name: &str) -> Result<Position, PointError> {
        match self.points.get(name) {
            None => Err(PointError::NotFound(name.to_string())),
            Some(point) if point.protected => Err(PointError::Protected(name.to_string())),
            Some(_) => {
                self.modified = true;
                info!(name, "point deleted");
                self.points
                    .remove(name)
                    .ok_or_else(|| PointError::NotFound(name.to_string()))
            }
        }
    }

    /// Duplicate `from` under the new name `to` (unprotected).
    pub fn copy(&mut self, from: &str, to: &str) -> Result<(), PointError> {
        let source = self
            .points
            .get(from)
            .ok_or_else(|| PointError::NotFound(from.to_string()))?;
        let copy = Position {
            name: to.to_string(),
            protected: false,
            comment: format!("Copy from {from}"),
            ..source.clone()
        };
        self.add(copy)
    }

    /// Merge legacy points into the store, replacing unprotected namesakes.
    ///
    /// Returns the number of points imported.
    pub fn import_legacy(&mut self, text: &str) -> Result<usize, PointError> {
        let points = parse_legacy(text)?;
        let count = points.len();
        for point in points {
            self.upsert(point)?;
        }
        info!(count, "legacy points imported");
        Ok(count)
    }
}

// ─── Legacy import ──────────────────────────────────────────────────

/// Legacy field order after the point number and the abs flag.
const LEGACY_AXES: [AxisId; 8] = [
    AxisId::X,
    AxisId::Y,
    AxisId::Z,
    AxisId::U,
    AxisId::S1,
    AxisId::S2,
    AxisId::A,
    AxisId::B,
];

/// Parse the `[Point]` section of a legacy position file.
///
/// Points are named `P%03d` from their number. An empty coordinate field
/// leaves that axis unset. Abs flag `0` is absolute, anything else relative.
pub fn parse_legacy(text: &str) -> Result<Vec<Position>, PointError> {
    let mut points = Vec::new();
    let mut in_points = false;

    for (index, raw) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = raw.trim();
        if line.starts_with('[') {
            in_points = line == "[Point]";
            continue;
        }
        if !in_points || !line.starts_with("Item") {
            continue;
        }
        let Some((_, values)) = line.split_once('=') else {
            continue;
        };
        let fields: Vec<&str> = values.split(',').collect();
        if fields.len() < 11 {
            return Err(PointError::Legacy {
                line: line_no,
                reason: format!("expected at least 11 fields, got {}", fields.len()),
            });
        }

        let number: u32 = fields[0].trim().parse().map_err(|_| PointError::Legacy {
            line: line_no,
            reason: format!("bad point number {:?}", fields[0]),
        })?;
        let mut point = Position::new(format!("P{number:03}"));
        if fields[1].trim() != "0" {
            point.coordinate = Coordinate::Relative;
        }
        for (axis, field) in LEGACY_AXES.iter().zip(&fields[2..10]) {
            let field = field.trim();
            if field.is_empty() {
                continue;
            }
            let value = field
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite())
                .ok_or_else(|| PointError::Legacy {
                    line: line_no,
                    reason: format!("bad {axis} coordinate {field:?}"),
                })?;
            point.axes.insert(*axis, value);
        }
        point.protected = fields[10].trim() == "1";
        // Comments may themselves contain commas.
        if fields.len() > 11 {
            point.comment = fields[11..].join(",");
        }
        points.push(point);
    }
    Ok(points)
}
