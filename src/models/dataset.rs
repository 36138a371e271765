//! Dataset, record and chunk types.
//!
//! A `Dataset` is an ordered collection of records sharing one schema
//! (geometry field name + CRS). Chunks are contiguous sub-sequences that
//! carry an owned *copy* of the schema, so a worker can never mutate the
//! source dataset through its chunk.

use crate::models::{GeobatchError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tracing::info;

/// Schema shared by every record in a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSchema {
    /// Name of the geometry field (e.g. "geometry")
    pub geometry_field: String,

    /// Coordinate reference system identifier (e.g. "EPSG:4326")
    pub crs: String,
}

impl DatasetSchema {
    pub fn new(geometry_field: impl Into<String>, crs: impl Into<String>) -> Self {
        Self {
            geometry_field: geometry_field.into(),
            crs: crs.into(),
        }
    }

    /// A schema is geometry-bearing when both the geometry field name and
    /// the CRS are declared.
    pub fn is_geometry_bearing(&self) -> bool {
        !self.geometry_field.is_empty() && !self.crs.is_empty()
    }
}

/// Kind of geometry a record may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeometryKind {
    Point,
    LineString,
    Polygon,
}

impl std::fmt::Display for GeometryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Point => write!(f, "point"),
            Self::LineString => write!(f, "linestring"),
            Self::Polygon => write!(f, "polygon"),
        }
    }
}

/// Geometry attached to a record.
///
/// Polygons carry their exterior ring only; the ring must be explicitly
/// closed (first coordinate repeated at the end).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    Point([f64; 2]),
    LineString(Vec<[f64; 2]>),
    Polygon(Vec<[f64; 2]>),
}

impl Geometry {
    pub fn kind(&self) -> GeometryKind {
        match self {
            Self::Point(_) => GeometryKind::Point,
            Self::LineString(_) => GeometryKind::LineString,
            Self::Polygon(_) => GeometryKind::Polygon,
        }
    }

    /// Validity predicate used by the pre-flight validator.
    ///
    /// - All coordinates must be finite.
    /// - A line string needs at least two points.
    /// - A polygon ring needs at least four points, must be closed, and its
    ///   exterior ring must not self-intersect.
    pub fn is_valid(&self) -> bool {
        match self {
            Self::Point(p) => coords_finite(std::slice::from_ref(p)),
            Self::LineString(pts) => pts.len() >= 2 && coords_finite(pts),
            Self::Polygon(ring) => {
                ring.len() >= 4
                    && coords_finite(ring)
                    && ring.first() == ring.last()
                    && !ring_self_intersects(ring)
            }
        }
    }
}

fn coords_finite(pts: &[[f64; 2]]) -> bool {
    pts.iter().all(|p| p[0].is_finite() && p[1].is_finite())
}

/// Orientation of the ordered triple (a, b, c).
fn orientation(a: [f64; 2], b: [f64; 2], c: [f64; 2]) -> f64 {
    (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0])
}

/// Proper crossing test for two segments (shared endpoints do not count).
fn segments_cross(p1: [f64; 2], p2: [f64; 2], q1: [f64; 2], q2: [f64; 2]) -> bool {
    let d1 = orientation(q1, q2, p1);
    let d2 = orientation(q1, q2, p2);
    let d3 = orientation(p1, p2, q1);
    let d4 = orientation(p1, p2, q2);
    ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
}

/// O(n^2) self-intersection test over non-adjacent ring segments.
///
/// Rings are small in practice (parcel boundaries), so the quadratic scan is
/// not a bottleneck in the pre-flight gate.
fn ring_self_intersects(ring: &[[f64; 2]]) -> bool {
    let n = ring.len() - 1; // number of segments in a closed ring
    for i in 0..n {
        for j in (i + 2)..n {
            // Skip the wrap-around pair: segment 0 and segment n-1 share the
            // closing vertex.
            if i == 0 && j == n - 1 {
                continue;
            }
            if segments_cross(ring[i], ring[i + 1], ring[j], ring[j + 1]) {
                return true;
            }
        }
    }
    false
}

/// A single record: named attributes plus an optional geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Named attribute values
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,

    /// Geometry, if present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Geometry>,
}

impl Record {
    pub fn new(
        attributes: serde_json::Map<String, serde_json::Value>,
        geometry: Option<Geometry>,
    ) -> Self {
        Self {
            attributes,
            geometry,
        }
    }
}

/// Ordered, geometry-bearing record collection sharing one schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub schema: DatasetSchema,
    pub records: Vec<Record>,
}

impl Dataset {
    pub fn new(schema: DatasetSchema, records: Vec<Record>) -> Self {
        Self { schema, records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Load a dataset from a JSONL file.
    ///
    /// The first non-empty line is the schema object; every following line
    /// is one record.
    pub fn load_jsonl(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| GeobatchError::io("opening dataset file", e))?;
        let reader = BufReader::new(file);

        let mut schema: Option<DatasetSchema> = None;
        let mut records = Vec::new();

        for (line_num, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| GeobatchError::io("reading dataset file", e))?;
            if line.trim().is_empty() {
                continue;
            }
            if schema.is_none() {
                let parsed: DatasetSchema = serde_json::from_str(&line).map_err(|e| {
                    GeobatchError::ParseError(format!("Line {}: invalid schema: {}", line_num + 1, e))
                })?;
                schema = Some(parsed);
                continue;
            }
            let record: Record = serde_json::from_str(&line).map_err(|e| {
                GeobatchError::ParseError(format!("Line {}: {}", line_num + 1, e))
            })?;
            records.push(record);
        }

        let schema = schema.ok_or_else(|| {
            GeobatchError::ParseError("Dataset file is empty (missing schema line)".to_string())
        })?;

        info!(count = records.len(), crs = %schema.crs, "Loaded dataset");
        Ok(Self { schema, records })
    }

    /// Write a dataset as JSONL: schema line first, then one record per line.
    pub fn save_jsonl(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| GeobatchError::io("creating output file", e))?;
        let mut writer = BufWriter::new(file);

        let schema_line = serde_json::to_string(&self.schema)
            .map_err(|e| GeobatchError::Internal(format!("Serializing schema: {e}")))?;
        writeln!(writer, "{schema_line}").map_err(|e| GeobatchError::io("writing output", e))?;

        for record in &self.records {
            let line = serde_json::to_string(record)
                .map_err(|e| GeobatchError::Internal(format!("Serializing record: {e}")))?;
            writeln!(writer, "{line}").map_err(|e| GeobatchError::io("writing output", e))?;
        }
        writer.flush().map_err(|e| GeobatchError::io("flushing output", e))?;
        Ok(())
    }
}

/// Contiguous sub-sequence of a dataset, processed independently.
///
/// The schema is an owned copy of the parent dataset's schema: workers only
/// ever see values they own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Sequential chunk identifier, starting at 0
    pub chunk_id: usize,

    /// Owned copy of the parent schema
    pub schema: DatasetSchema,

    /// Records in this chunk, in original dataset order
    pub records: Vec<Record>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_ring() -> Vec<[f64; 2]> {
        vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0], [0.0, 0.0]]
    }

    #[test]
    fn valid_polygon_passes() {
        assert!(Geometry::Polygon(square_ring()).is_valid());
    }

    #[test]
    fn bowtie_polygon_is_invalid() {
        // Crossing diagonals form a self-intersecting ring.
        let bowtie = vec![[0.0, 0.0], [1.0, 1.0], [1.0, 0.0], [0.0, 1.0], [0.0, 0.0]];
        assert!(!Geometry::Polygon(bowtie).is_valid());
    }

    #[test]
    fn open_ring_is_invalid() {
        let open = vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];
        assert!(!Geometry::Polygon(open).is_valid());
    }

    #[test]
    fn non_finite_point_is_invalid() {
        assert!(!Geometry::Point([f64::NAN, 0.0]).is_valid());
        assert!(Geometry::Point([3.5, -2.0]).is_valid());
    }

    #[test]
    fn short_linestring_is_invalid() {
        assert!(!Geometry::LineString(vec![[0.0, 0.0]]).is_valid());
        assert!(Geometry::LineString(vec![[0.0, 0.0], [1.0, 1.0]]).is_valid());
    }

    #[test]
    fn geometry_serde_roundtrip_uses_geojson_tags() {
        let json = serde_json::to_string(&Geometry::Point([1.0, 2.0])).unwrap();
        assert!(json.contains(r#""type":"Point""#));
        assert!(json.contains(r#""coordinates":[1.0,2.0]"#));
    }
}
