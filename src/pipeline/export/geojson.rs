//! GeoJSON export - the human-diffable structured-text format

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use geojson::{Feature, FeatureCollection, JsonObject};

use crate::pipeline::fetch::snapshot_from_geojson;
use crate::pipeline::types::{Geometry, Record, Snapshot, Value};

/// Write the snapshot as a pretty-printed FeatureCollection. Field order
/// and numeric precision are the source's own; nothing is rounded or
/// reordered here.
pub fn write_geojson(snapshot: &Snapshot, path: &Path) -> Result<()> {
    let features = snapshot
        .records
        .iter()
        .map(feature_from_record)
        .collect::<Result<Vec<_>>>()?;

    let collection = FeatureCollection {
        bbox: None,
        features,
        foreign_members: Some(crs_member(&snapshot.crs)),
    };

    let text = serde_json::to_string_pretty(&collection)?;
    fs::write(path, text).with_context(|| format!("writing {:?}", path))?;
    Ok(())
}

/// Re-read an exported file through the same validation as a fetch
pub fn read_geojson(path: &Path) -> Result<Snapshot> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    let payload: serde_json::Value = serde_json::from_str(&text)?;
    Ok(snapshot_from_geojson(payload)?)
}

fn feature_from_record(record: &Record) -> Result<Feature> {
    let mut properties = JsonObject::new();
    for (name, value) in &record.fields {
        properties.insert(name.clone(), json_value(name, value)?);
    }

    Ok(Feature {
        bbox: None,
        geometry: Some(geojson::Geometry::new(geojson_value(&record.geometry))),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    })
}

fn json_value(name: &str, value: &Value) -> Result<serde_json::Value> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Float(f) => match serde_json::Number::from_f64(*f) {
            Some(n) => serde_json::Value::Number(n),
            // JSON cannot carry NaN/inf; dropping the value silently is
            // worse than failing the format
            None => bail!("field {:?}: {} is not representable in JSON", name, f),
        },
        Value::Text(s) => serde_json::Value::String(s.clone()),
    })
}

fn geojson_value(geometry: &Geometry) -> geojson::Value {
    let pos = |&(x, y): &(f64, f64)| vec![x, y];
    match geometry {
        Geometry::Point(p) => geojson::Value::Point(pos(p)),
        Geometry::Line(line) => geojson::Value::LineString(line.iter().map(pos).collect()),
        Geometry::Polygon(rings) => geojson::Value::Polygon(
            rings
                .iter()
                .map(|ring| ring.iter().map(pos).collect())
                .collect(),
        ),
    }
}

/// Legacy named-CRS member; readers that only speak RFC 7946 ignore it
fn crs_member(crs: &str) -> JsonObject {
    let mut member = JsonObject::new();
    member.insert(
        "crs".to_string(),
        serde_json::json!({
            "type": "name",
            "properties": { "name": crs }
        }),
    );
    member
}
