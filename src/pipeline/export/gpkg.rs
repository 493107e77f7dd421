//! GeoPackage export - the compact binary container format
//!
//! Writes a minimal standard-conforming GeoPackage: the three required
//! metadata tables plus one feature table whose geometry column holds
//! standard GeoPackage geometry blobs (header + little-endian WKB).
//! A feature table declares exactly one geometry type, so a snapshot
//! mixing geometry types is unsupported here (GeoJSON still takes it).

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use rusqlite::{types::ToSqlOutput, Connection, ToSql};

use crate::pipeline::types::{Geometry, Record, Snapshot, Value};

const GPKG_APPLICATION_ID: i32 = 0x4750_4B47; // "GPKG"
const GPKG_USER_VERSION: i32 = 10300; // 1.3.0

pub fn write_gpkg(snapshot: &Snapshot, dataset_id: &str, path: &Path) -> Result<()> {
    let geometry_type = layer_geometry_type(snapshot)?;
    let srs_id = srs_id_from_crs(&snapshot.crs)?;
    let columns = column_definitions(snapshot);

    if path.exists() {
        fs::remove_file(path).with_context(|| format!("removing stale {:?}", path))?;
    }

    let mut conn = Connection::open(path)?;
    conn.pragma_update(None, "application_id", GPKG_APPLICATION_ID)?;
    conn.pragma_update(None, "user_version", GPKG_USER_VERSION)?;

    let tx = conn.transaction()?;
    create_metadata_tables(&tx, srs_id)?;
    create_feature_table(&tx, dataset_id, &columns, geometry_type, srs_id)?;
    insert_records(&tx, dataset_id, &columns, snapshot, srs_id)?;
    tx.commit()?;

    Ok(())
}

/// Re-read an exported GeoPackage into a Snapshot. Booleans come back as
/// integers (SQLite has no boolean storage class).
pub fn read_gpkg(path: &Path) -> Result<Snapshot> {
    let conn = Connection::open(path)?;

    let (table, srs_id): (String, i32) = conn.query_row(
        "SELECT table_name, srs_id FROM gpkg_geometry_columns",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let mut stmt = conn.prepare(&format!(
        "SELECT * FROM {} ORDER BY fid",
        quote_identifier(&table)
    ))?;
    let column_names: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();

    let mut records = Vec::new();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let mut fields = Vec::new();
        let mut geometry = None;

        for (i, name) in column_names.iter().enumerate() {
            if name == "fid" {
                continue;
            }
            if name == "geom" {
                let blob: Vec<u8> = row.get(i)?;
                geometry = Some(decode_gpkg_blob(&blob)?);
                continue;
            }
            let value = match row.get_ref(i)? {
                rusqlite::types::ValueRef::Null => Value::Null,
                rusqlite::types::ValueRef::Integer(v) => Value::Int(v),
                rusqlite::types::ValueRef::Real(v) => Value::Float(v),
                rusqlite::types::ValueRef::Text(t) => {
                    Value::Text(String::from_utf8_lossy(t).into_owned())
                }
                rusqlite::types::ValueRef::Blob(_) => {
                    bail!("unexpected blob in attribute column {:?}", name)
                }
            };
            fields.push((name.clone(), value));
        }

        records.push(Record {
            fields,
            geometry: geometry.context("feature row without geometry")?,
        });
    }

    Ok(Snapshot {
        crs: format!("EPSG:{}", srs_id),
        records,
    })
}

fn create_metadata_tables(conn: &Connection, srs_id: i32) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE gpkg_spatial_ref_sys (
            srs_name TEXT NOT NULL,
            srs_id INTEGER PRIMARY KEY,
            organization TEXT NOT NULL,
            organization_coordsys_id INTEGER NOT NULL,
            definition TEXT NOT NULL,
            description TEXT
        );
        CREATE TABLE gpkg_contents (
            table_name TEXT PRIMARY KEY,
            data_type TEXT NOT NULL,
            identifier TEXT UNIQUE,
            description TEXT DEFAULT '',
            last_change DATETIME DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
            min_x DOUBLE, min_y DOUBLE, max_x DOUBLE, max_y DOUBLE,
            srs_id INTEGER
        );
        CREATE TABLE gpkg_geometry_columns (
            table_name TEXT PRIMARY KEY,
            column_name TEXT NOT NULL,
            geometry_type_name TEXT NOT NULL,
            srs_id INTEGER NOT NULL,
            z TINYINT NOT NULL,
            m TINYINT NOT NULL
        );",
    )?;

    // required baseline rows for undefined cartesian/geographic systems
    conn.execute(
        "INSERT INTO gpkg_spatial_ref_sys VALUES
            ('Undefined cartesian SRS', -1, 'NONE', -1, 'undefined', NULL),
            ('Undefined geographic SRS', 0, 'NONE', 0, 'undefined', NULL)",
        [],
    )?;

    let (name, definition) = if srs_id == 4326 {
        (
            "WGS 84 geodetic",
            "GEOGCS[\"WGS 84\",DATUM[\"WGS_1984\",SPHEROID[\"WGS 84\",6378137,298.257223563]],\
             PRIMEM[\"Greenwich\",0],UNIT[\"degree\",0.0174532925199433],AUTHORITY[\"EPSG\",\"4326\"]]",
        )
    } else {
        ("unnamed", "undefined")
    };
    conn.execute(
        "INSERT INTO gpkg_spatial_ref_sys VALUES (?1, ?2, 'EPSG', ?2, ?3, NULL)",
        rusqlite::params![name, srs_id, definition],
    )?;

    Ok(())
}

fn create_feature_table(
    conn: &Connection,
    dataset_id: &str,
    columns: &[(String, &'static str)],
    geometry_type: &str,
    srs_id: i32,
) -> Result<()> {
    let mut ddl = format!(
        "CREATE TABLE {} (fid INTEGER PRIMARY KEY AUTOINCREMENT, geom BLOB",
        quote_identifier(dataset_id)
    );
    for (name, affinity) in columns {
        ddl.push_str(&format!(", {} {}", quote_identifier(name), affinity));
    }
    ddl.push(')');
    conn.execute(&ddl, [])?;

    conn.execute(
        "INSERT INTO gpkg_contents (table_name, data_type, identifier, srs_id)
         VALUES (?1, 'features', ?1, ?2)",
        rusqlite::params![dataset_id, srs_id],
    )?;
    conn.execute(
        "INSERT INTO gpkg_geometry_columns VALUES (?1, 'geom', ?2, ?3, 0, 0)",
        rusqlite::params![dataset_id, geometry_type, srs_id],
    )?;

    Ok(())
}

fn insert_records(
    conn: &Connection,
    dataset_id: &str,
    columns: &[(String, &'static str)],
    snapshot: &Snapshot,
    srs_id: i32,
) -> Result<()> {
    let column_sql: Vec<String> = columns
        .iter()
        .map(|(name, _)| quote_identifier(name))
        .collect();
    let placeholders: Vec<String> = (2..columns.len() + 2).map(|i| format!("?{}", i)).collect();
    let sql = format!(
        "INSERT INTO {} (geom{}{}) VALUES (?1{}{})",
        quote_identifier(dataset_id),
        if columns.is_empty() { "" } else { ", " },
        column_sql.join(", "),
        if columns.is_empty() { "" } else { ", " },
        placeholders.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;

    for record in &snapshot.records {
        let blob = encode_gpkg_blob(&record.geometry, srs_id);
        let mut params: Vec<&dyn ToSql> = vec![&blob];
        let values: Vec<SqlValue> = columns
            .iter()
            .map(|(name, _)| SqlValue(record.field(name).cloned().unwrap_or(Value::Null)))
            .collect();
        for value in &values {
            params.push(value);
        }
        stmt.execute(params.as_slice())?;
    }

    Ok(())
}

struct SqlValue(Value);

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match &self.0 {
            Value::Null => ToSqlOutput::from(rusqlite::types::Null),
            Value::Bool(b) => ToSqlOutput::from(*b as i64),
            Value::Int(i) => ToSqlOutput::from(*i),
            Value::Float(f) => ToSqlOutput::from(*f),
            Value::Text(s) => ToSqlOutput::from(s.as_str()),
        })
    }
}

/// One geometry type per feature table; mixed snapshots are unsupported
fn layer_geometry_type(snapshot: &Snapshot) -> Result<&'static str> {
    let mut layer_type = None;
    for record in &snapshot.records {
        let this = match record.geometry {
            Geometry::Point(_) => "POINT",
            Geometry::Line(_) => "LINESTRING",
            Geometry::Polygon(_) => "POLYGON",
        };
        match layer_type {
            None => layer_type = Some(this),
            Some(existing) if existing != this => {
                bail!(
                    "mixed geometry types ({} and {}) cannot share a feature table",
                    existing,
                    this
                );
            }
            Some(_) => {}
        }
    }
    Ok(layer_type.unwrap_or("GEOMETRY"))
}

fn srs_id_from_crs(crs: &str) -> Result<i32> {
    let code = crs
        .strip_prefix("EPSG:")
        .and_then(|c| c.parse::<i32>().ok());
    match code {
        Some(code) => Ok(code),
        None => bail!("invalid CRS {:?}, expected EPSG:<code>", crs),
    }
}

/// Column storage affinity per field, widened over all records: any Float
/// makes a column REAL, text dominates everything, all-null stays TEXT
fn column_definitions(snapshot: &Snapshot) -> Vec<(String, &'static str)> {
    let Some(first) = snapshot.records.first() else {
        return Vec::new();
    };

    first
        .field_names()
        .map(|name| {
            let mut affinity = None;
            for record in &snapshot.records {
                let this = match record.field(name) {
                    Some(Value::Null) | None => continue,
                    Some(Value::Bool(_)) | Some(Value::Int(_)) => "INTEGER",
                    Some(Value::Float(_)) => "REAL",
                    Some(Value::Text(_)) => "TEXT",
                };
                affinity = Some(match (affinity, this) {
                    (None, t) => t,
                    (Some("INTEGER"), "REAL") | (Some("REAL"), "INTEGER") => "REAL",
                    (Some(a), t) if a == t => a,
                    _ => "TEXT",
                });
            }
            (name.to_string(), affinity.unwrap_or("TEXT"))
        })
        .collect()
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

// --- GeoPackage geometry blobs ------------------------------------------
// Header: magic "GP", version 0, flags (little-endian, no envelope),
// srs_id, then a little-endian WKB geometry.

const WKB_POINT: u32 = 1;
const WKB_LINESTRING: u32 = 2;
const WKB_POLYGON: u32 = 3;

fn encode_gpkg_blob(geometry: &Geometry, srs_id: i32) -> Vec<u8> {
    let mut blob = vec![b'G', b'P', 0x00, 0x01];
    blob.extend_from_slice(&srs_id.to_le_bytes());
    encode_wkb(geometry, &mut blob);
    blob
}

fn encode_wkb(geometry: &Geometry, out: &mut Vec<u8>) {
    out.push(0x01); // little endian
    let push_coord = |out: &mut Vec<u8>, (x, y): (f64, f64)| {
        out.extend_from_slice(&x.to_le_bytes());
        out.extend_from_slice(&y.to_le_bytes());
    };

    match geometry {
        Geometry::Point(p) => {
            out.extend_from_slice(&WKB_POINT.to_le_bytes());
            push_coord(out, *p);
        }
        Geometry::Line(line) => {
            out.extend_from_slice(&WKB_LINESTRING.to_le_bytes());
            out.extend_from_slice(&(line.len() as u32).to_le_bytes());
            for &p in line {
                push_coord(out, p);
            }
        }
        Geometry::Polygon(rings) => {
            out.extend_from_slice(&WKB_POLYGON.to_le_bytes());
            out.extend_from_slice(&(rings.len() as u32).to_le_bytes());
            for ring in rings {
                out.extend_from_slice(&(ring.len() as u32).to_le_bytes());
                for &p in ring {
                    push_coord(out, p);
                }
            }
        }
    }
}

fn decode_gpkg_blob(blob: &[u8]) -> Result<Geometry> {
    if blob.len() < 8 || blob[0] != b'G' || blob[1] != b'P' {
        bail!("not a GeoPackage geometry blob");
    }
    let flags = blob[3];
    let envelope_len = match (flags >> 1) & 0x07 {
        0 => 0,
        1 => 32,
        2 | 3 => 48,
        4 => 64,
        other => bail!("invalid envelope indicator {}", other),
    };
    decode_wkb(&blob[8 + envelope_len..])
}

fn decode_wkb(wkb: &[u8]) -> Result<Geometry> {
    let mut cursor = WkbCursor::new(wkb)?;
    let geometry_type = cursor.read_u32()?;

    match geometry_type {
        WKB_POINT => Ok(Geometry::Point(cursor.read_coord()?)),
        WKB_LINESTRING => {
            let n = cursor.read_u32()? as usize;
            let mut line = Vec::with_capacity(n);
            for _ in 0..n {
                line.push(cursor.read_coord()?);
            }
            Ok(Geometry::Line(line))
        }
        WKB_POLYGON => {
            let rings_n = cursor.read_u32()? as usize;
            let mut rings = Vec::with_capacity(rings_n);
            for _ in 0..rings_n {
                let n = cursor.read_u32()? as usize;
                let mut ring = Vec::with_capacity(n);
                for _ in 0..n {
                    ring.push(cursor.read_coord()?);
                }
                rings.push(ring);
            }
            Ok(Geometry::Polygon(rings))
        }
        other => bail!("unsupported WKB geometry type {}", other),
    }
}

struct WkbCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    little_endian: bool,
}

impl<'a> WkbCursor<'a> {
    fn new(bytes: &'a [u8]) -> Result<Self> {
        let byte_order = *bytes.first().context("empty WKB")?;
        Ok(WkbCursor {
            bytes,
            pos: 1,
            little_endian: byte_order == 0x01,
        })
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        if end > self.bytes.len() {
            bail!("truncated WKB");
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let raw: [u8; 4] = self.take(4)?.try_into().unwrap();
        Ok(if self.little_endian {
            u32::from_le_bytes(raw)
        } else {
            u32::from_be_bytes(raw)
        })
    }

    fn read_f64(&mut self) -> Result<f64> {
        let raw: [u8; 8] = self.take(8)?.try_into().unwrap();
        Ok(if self.little_endian {
            f64::from_le_bytes(raw)
        } else {
            f64::from_be_bytes(raw)
        })
    }

    fn read_coord(&mut self) -> Result<(f64, f64)> {
        Ok((self.read_f64()?, self.read_f64()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Snapshot {
        Snapshot {
            crs: "EPSG:4326".to_string(),
            records: vec![
                Record {
                    fields: vec![
                        ("Name".to_string(), Value::Text("WEA 1".to_string())),
                        ("Status".to_string(), Value::Text("Operating".to_string())),
                        ("Leistung".to_string(), Value::Float(3.2)),
                        ("UID".to_string(), Value::Int(101)),
                        ("Zusatz".to_string(), Value::Null),
                    ],
                    geometry: Geometry::Point((15.6234567, 48.2123456)),
                },
                Record {
                    fields: vec![
                        ("Name".to_string(), Value::Text("WEA 2".to_string())),
                        ("Status".to_string(), Value::Text("Plan".to_string())),
                        ("Leistung".to_string(), Value::Null),
                        ("UID".to_string(), Value::Int(102)),
                        ("Zusatz".to_string(), Value::Text("Repowering".to_string())),
                    ],
                    geometry: Geometry::Point((15.63, 48.22)),
                },
            ],
        }
    }

    #[test]
    fn test_roundtrip_preserves_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ds.gpkg");

        let original = sample();
        write_gpkg(&original, "windkraftanlagen", &path).unwrap();
        let reread = read_gpkg(&path).unwrap();

        assert_eq!(reread.crs, "EPSG:4326");
        assert_eq!(reread, original);
    }

    #[test]
    fn test_line_and_polygon_wkb_roundtrip() {
        let line = Geometry::Line(vec![(15.62, 48.21), (15.63, 48.22), (15.64, 48.23)]);
        let polygon = Geometry::Polygon(vec![
            vec![(15.0, 48.0), (15.1, 48.0), (15.1, 48.1), (15.0, 48.0)],
            vec![(15.02, 48.02), (15.08, 48.02), (15.08, 48.08), (15.02, 48.02)],
        ]);

        for geometry in [line, polygon] {
            let blob = encode_gpkg_blob(&geometry, 4326);
            assert_eq!(decode_gpkg_blob(&blob).unwrap(), geometry);
        }
    }

    #[test]
    fn test_mixed_geometry_types_are_rejected() {
        let dir = tempdir().unwrap();
        let snapshot = Snapshot {
            crs: "EPSG:4326".to_string(),
            records: vec![
                Record {
                    fields: vec![],
                    geometry: Geometry::Point((15.0, 48.0)),
                },
                Record {
                    fields: vec![],
                    geometry: Geometry::Line(vec![(15.0, 48.0), (15.1, 48.1)]),
                },
            ],
        };

        let err = write_gpkg(&snapshot, "ds", &dir.path().join("ds.gpkg")).unwrap_err();
        assert!(err.to_string().contains("mixed geometry types"));
    }

    #[test]
    fn test_invalid_crs_is_rejected() {
        let dir = tempdir().unwrap();
        let snapshot = Snapshot {
            crs: "not-a-crs".to_string(),
            records: vec![],
        };

        let err = write_gpkg(&snapshot, "ds", &dir.path().join("ds.gpkg")).unwrap_err();
        assert!(err.to_string().contains("invalid CRS"));
    }

    #[test]
    fn test_container_metadata_is_wellformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ds.gpkg");
        write_gpkg(&sample(), "windkraftanlagen", &path).unwrap();

        let conn = Connection::open(&path).unwrap();
        let app_id: i32 = conn
            .query_row("PRAGMA application_id", [], |row| row.get(0))
            .unwrap();
        assert_eq!(app_id, GPKG_APPLICATION_ID);

        let (table, gtype): (String, String) = conn
            .query_row(
                "SELECT table_name, geometry_type_name FROM gpkg_geometry_columns",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(table, "windkraftanlagen");
        assert_eq!(gtype, "POINT");
    }

    #[test]
    fn test_quoted_identifiers_handle_awkward_names() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ds.gpkg");
        let snapshot = Snapshot {
            crs: "EPSG:4326".to_string(),
            records: vec![Record {
                fields: vec![(
                    "Leistung der WKA [MW]".to_string(),
                    Value::Float(3.2),
                )],
                geometry: Geometry::Point((15.62, 48.21)),
            }],
        };

        write_gpkg(&snapshot, "ds", &path).unwrap();
        let reread = read_gpkg(&path).unwrap();
        assert_eq!(
            reread.records[0].field("Leistung der WKA [MW]"),
            Some(&Value::Float(3.2))
        );
    }
}
