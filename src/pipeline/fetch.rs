//! Fetch functions - retrieve a dataset snapshot from a remote endpoint

use std::collections::BTreeSet;

use geojson::GeoJson;
use tracing::info;

use crate::pipeline::types::{Geometry, PipelineError, Record, Snapshot, Value};

/// Portal search metadata injected by the source; never part of the dataset
const PORTAL_METADATA_FIELDS: &[&str] = &["_fulltext", "_title", "_zoomscale"];

/// GeoJSON carries WGS 84 coordinates unless stated otherwise
const DEFAULT_CRS: &str = "EPSG:4326";

/// Fetch a GeoJSON dataset and validate it into a Snapshot.
/// A single network failure is fatal to the run; retries belong to the
/// external scheduler.
pub async fn fetch_geojson(url: &str) -> Result<Snapshot, PipelineError> {
    info!("Fetching dataset from {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(300)) // 5 min timeout
        .build()?;

    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(PipelineError::RetrievalStatus(status));
    }

    let payload: serde_json::Value = response.json().await?;
    let snapshot = snapshot_from_geojson(payload)?;
    info!("Fetched {} records", snapshot.len());

    Ok(snapshot)
}

/// Validate an untrusted GeoJSON payload into a Snapshot.
/// Every feature must carry the same attribute field set as the first
/// feature and a point/line/polygon geometry.
pub fn snapshot_from_geojson(payload: serde_json::Value) -> Result<Snapshot, PipelineError> {
    let geojson = GeoJson::from_json_value(payload)
        .map_err(|e| PipelineError::Payload(format!("invalid GeoJSON: {}", e)))?;

    let collection = match geojson {
        GeoJson::FeatureCollection(fc) => fc,
        other => {
            return Err(PipelineError::Payload(format!(
                "expected a FeatureCollection, got {}",
                geojson_kind(&other)
            )))
        }
    };

    let crs = named_crs(&collection).unwrap_or(DEFAULT_CRS).to_string();

    let mut records = Vec::with_capacity(collection.features.len());
    let mut schema: Option<BTreeSet<String>> = None;

    for (index, feature) in collection.features.into_iter().enumerate() {
        let geometry = feature
            .geometry
            .ok_or_else(|| PipelineError::Schema {
                index,
                reason: "feature has no geometry".to_string(),
            })
            .and_then(|g| convert_geometry(g.value, index))?;

        let mut fields = Vec::new();
        if let Some(properties) = feature.properties {
            for (name, value) in properties {
                if PORTAL_METADATA_FIELDS.contains(&name.as_str()) {
                    continue;
                }
                fields.push((name, convert_value(value, index)?));
            }
        }

        let names: BTreeSet<String> = fields.iter().map(|(n, _)| n.clone()).collect();
        match &schema {
            None => schema = Some(names),
            Some(expected) if *expected != names => {
                return Err(PipelineError::Schema {
                    index,
                    reason: schema_mismatch(expected, &names),
                });
            }
            Some(_) => {}
        }

        records.push(Record { fields, geometry });
    }

    Ok(Snapshot { crs, records })
}

/// Legacy named-CRS member, as written by our own exporter and by servers
/// predating RFC 7946; absent means the GeoJSON default applies
fn named_crs(collection: &geojson::FeatureCollection) -> Option<&str> {
    collection
        .foreign_members
        .as_ref()?
        .get("crs")?
        .get("properties")?
        .get("name")?
        .as_str()
}

/// Convert decimal-comma text in the named fields to Float values.
/// The source publishes numeric columns as localized strings ("3,2");
/// re-encoding them as numbers keeps canonical rounding meaningful.
pub fn coerce_numeric_fields(
    snapshot: Snapshot,
    numeric_fields: &[&str],
) -> Result<Snapshot, PipelineError> {
    let mut records = Vec::with_capacity(snapshot.records.len());

    for (index, record) in snapshot.records.into_iter().enumerate() {
        let mut fields = Vec::with_capacity(record.fields.len());
        for (name, value) in record.fields {
            let value = if numeric_fields.contains(&name.as_str()) {
                coerce_numeric(value).map_err(|reason| PipelineError::Schema {
                    index,
                    reason: format!("field {:?}: {}", name, reason),
                })?
            } else {
                value
            };
            fields.push((name, value));
        }
        records.push(Record {
            fields,
            geometry: record.geometry,
        });
    }

    Ok(Snapshot {
        crs: snapshot.crs,
        records,
    })
}

fn coerce_numeric(value: Value) -> Result<Value, String> {
    match value {
        Value::Null | Value::Int(_) | Value::Float(_) => Ok(value),
        Value::Text(s) => {
            let normalized = s.trim().replace(',', ".");
            normalized
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| format!("not a number: {:?}", s))
        }
        Value::Bool(_) => Err("expected a number, got a boolean".to_string()),
    }
}

fn convert_geometry(value: geojson::Value, index: usize) -> Result<Geometry, PipelineError> {
    let unsupported = |kind: &str| PipelineError::Schema {
        index,
        reason: format!("unsupported geometry type {}", kind),
    };

    match value {
        geojson::Value::Point(pos) => Ok(Geometry::Point(position(&pos, index)?)),
        geojson::Value::LineString(line) => Ok(Geometry::Line(
            line.iter()
                .map(|p| position(p, index))
                .collect::<Result<_, _>>()?,
        )),
        geojson::Value::Polygon(rings) => Ok(Geometry::Polygon(
            rings
                .iter()
                .map(|ring| {
                    ring.iter()
                        .map(|p| position(p, index))
                        .collect::<Result<Vec<_>, _>>()
                })
                .collect::<Result<_, _>>()?,
        )),
        geojson::Value::MultiPoint(_) => Err(unsupported("MultiPoint")),
        geojson::Value::MultiLineString(_) => Err(unsupported("MultiLineString")),
        geojson::Value::MultiPolygon(_) => Err(unsupported("MultiPolygon")),
        geojson::Value::GeometryCollection(_) => Err(unsupported("GeometryCollection")),
    }
}

/// The data model is strictly 2D; a third ordinate would be silently lost
/// downstream, so it is rejected here instead
fn position(pos: &[f64], index: usize) -> Result<(f64, f64), PipelineError> {
    match pos {
        [x, y] => Ok((*x, *y)),
        _ => Err(PipelineError::Schema {
            index,
            reason: format!("expected a 2D coordinate, got {} ordinates", pos.len()),
        }),
    }
}

fn convert_value(value: serde_json::Value, index: usize) -> Result<Value, PipelineError> {
    match value {
        serde_json::Value::Null => Ok(Value::Null),
        serde_json::Value::Bool(b) => Ok(Value::Bool(b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Value::Float(f))
            } else {
                Err(PipelineError::Schema {
                    index,
                    reason: format!("unrepresentable number {}", n),
                })
            }
        }
        serde_json::Value::String(s) => Ok(Value::Text(s)),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
            Err(PipelineError::Schema {
                index,
                reason: "nested value in attribute field".to_string(),
            })
        }
    }
}

fn schema_mismatch(expected: &BTreeSet<String>, got: &BTreeSet<String>) -> String {
    let missing: Vec<_> = expected.difference(got).cloned().collect();
    let extra: Vec<_> = got.difference(expected).cloned().collect();
    format!(
        "field set differs from first record (missing: {:?}, extra: {:?})",
        missing, extra
    )
}

fn geojson_kind(geojson: &GeoJson) -> &'static str {
    match geojson {
        GeoJson::Geometry(_) => "a bare geometry",
        GeoJson::Feature(_) => "a single feature",
        GeoJson::FeatureCollection(_) => "a FeatureCollection",
    }
}
