//! Core data types for the sync pipeline
//! Pure data structures with no behavior

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// A coordinate pair in the dataset CRS (x = longitude, y = latitude for EPSG:4326)
pub type Coord = (f64, f64);

/// Geometry of a single record
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point(Coord),
    Line(Vec<Coord>),
    /// Outer ring first, holes after; rings are closed
    Polygon(Vec<Vec<Coord>>),
}

impl Geometry {
    pub fn type_name(&self) -> &'static str {
        match self {
            Geometry::Point(_) => "Point",
            Geometry::Line(_) => "LineString",
            Geometry::Polygon(_) => "Polygon",
        }
    }
}

/// Scalar attribute value; missing values are an explicit Null, never field absence
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// One dataset record: attribute fields in source order plus exactly one geometry
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub fields: Vec<(String, Value)>,
    pub geometry: Geometry,
}

impl Record {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Field names in source order
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }
}

/// One fetched, in-memory copy of the dataset at a point in time.
/// Owned by the current run; never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Coordinate reference system, e.g. "EPSG:4326"
    pub crs: String,
    pub records: Vec<Record>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// Content digest of a Canonical Form, used as a cheap equality proxy.
/// Carries the algorithm name so that changing the digest algorithm can
/// never collide with a stored fingerprint from the old one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub const ALGORITHM: &'static str = "sha256";

    pub fn from_hex_digest(hex: String) -> Self {
        Fingerprint(format!("{}:{}", Self::ALGORITHM, hex))
    }

    /// Parse a stored fingerprint string; None if it is not a well-formed
    /// digest for the current algorithm
    pub fn parse(s: &str) -> Option<Self> {
        let hex = s.strip_prefix(Self::ALGORITHM)?.strip_prefix(':')?;
        if hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Fingerprint(s.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Persisted state linking a dataset to its last published fingerprint
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub dataset_id: String,
    pub fingerprint: Fingerprint,
    pub updated_at: DateTime<Utc>,
}

/// Change Gate verdict for one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// No previous fingerprint exists; publish to bootstrap the store
    FirstRun,
    /// Fingerprints differ; publish
    Changed,
    /// Fingerprints are bit-identical; halt before export
    Unchanged,
}

impl GateDecision {
    pub fn should_publish(&self) -> bool {
        !matches!(self, GateDecision::Unchanged)
    }
}

impl fmt::Display for GateDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateDecision::FirstRun => write!(f, "first run"),
            GateDecision::Changed => write!(f, "changed"),
            GateDecision::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// Target export formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// Human-diffable structured text
    GeoJson,
    /// Compact binary container
    Geopackage,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::GeoJson => "geojson",
            ExportFormat::Geopackage => "gpkg",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::GeoJson => write!(f, "GeoJSON"),
            ExportFormat::Geopackage => write!(f, "GPKG"),
        }
    }
}

/// Per-format export results; sibling formats are attempted independently
#[derive(Debug, Default)]
pub struct ExportReport {
    pub written: Vec<(ExportFormat, PathBuf)>,
    pub failures: Vec<(ExportFormat, PipelineError)>,
}

impl ExportReport {
    pub fn is_partial_failure(&self) -> bool {
        !self.failures.is_empty()
    }
}

impl fmt::Display for ExportReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "written: {}, failed: {}",
            self.written.len(),
            self.failures.len()
        )
    }
}

/// Pipeline error taxonomy. Retrieval and schema errors are fatal to the
/// run; export errors are reported per format without aborting siblings;
/// a corrupt change record is never an error (the store falls back to
/// "absent" so the gate treats the run as a first run).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("retrieval failed: {0}")]
    Retrieval(#[from] reqwest::Error),

    #[error("retrieval failed: endpoint returned {0}")]
    RetrievalStatus(reqwest::StatusCode),

    #[error("retrieval failed: {0}")]
    Payload(String),

    #[error("schema error at record {index}: {reason}")]
    Schema { index: usize, reason: String },

    #[error("{format} export failed: {reason}")]
    Export { format: ExportFormat, reason: String },

    #[error("change record store: {0}")]
    Store(#[from] std::io::Error),
}
