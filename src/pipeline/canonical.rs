//! Canonicalizer - deterministic, order-independent form of a Snapshot
//!
//! Two snapshots with identical content must canonicalize to identical
//! bytes regardless of record order, per-record field order, or
//! floating-point noise from re-encoding. The fingerprint over these
//! bytes is only as trustworthy as this normalization.

use std::collections::BTreeSet;

use crate::pipeline::types::{Geometry, PipelineError, Record, Snapshot, Value};

/// Per-dataset normalization knobs. Which fields are volatile and how much
/// precision the source is good for is dataset-specific; it must be stated
/// explicitly here, never inferred from serialization defaults.
#[derive(Debug, Clone)]
pub struct CanonicalConfig {
    /// Known-volatile fields (server timestamps, request ids) dropped
    /// before hashing
    pub excluded_fields: BTreeSet<String>,
    /// Decimal digits kept on every numeric value, coordinates included
    pub decimal_precision: usize,
    /// Natural key for record ordering; falls back to the full serialized
    /// record when empty or absent from the schema
    pub sort_key_fields: Vec<String>,
}

impl Default for CanonicalConfig {
    fn default() -> Self {
        CanonicalConfig {
            excluded_fields: BTreeSet::new(),
            decimal_precision: 6,
            sort_key_fields: Vec::new(),
        }
    }
}

/// Deterministic byte serialization of a normalized Snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalForm {
    bytes: Vec<u8>,
}

impl CanonicalForm {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Canonicalize a snapshot: drop excluded fields, round numerics, fix the
/// field order, fix the record order, serialize. Pure function of content.
pub fn canonicalize(
    snapshot: &Snapshot,
    config: &CanonicalConfig,
) -> Result<CanonicalForm, PipelineError> {
    let records = canonical_records(snapshot, config)?;

    let field_names: Vec<&str> = records
        .first()
        .map(|r| r.field_names().collect())
        .unwrap_or_default();

    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"canonical v1\n");
    bytes.extend_from_slice(format!("crs={}\n", snapshot.crs).as_bytes());
    bytes.extend_from_slice(format!("fields={}\n", field_names.join(",")).as_bytes());

    for record in &records {
        bytes.extend_from_slice(serialize_record(record, config.decimal_precision).as_bytes());
        bytes.push(b'\n');
    }

    Ok(CanonicalForm { bytes })
}

/// The normalized records behind a canonical form: excluded fields dropped,
/// numerics rounded, fields in lexicographic order, records in key order.
/// Canonicalizing a snapshot built from these records reproduces the same
/// bytes (idempotence).
pub fn canonical_records(
    snapshot: &Snapshot,
    config: &CanonicalConfig,
) -> Result<Vec<Record>, PipelineError> {
    let mut schema: Option<BTreeSet<String>> = None;
    let mut normalized = Vec::with_capacity(snapshot.records.len());

    for (index, record) in snapshot.records.iter().enumerate() {
        let mut fields: Vec<(String, Value)> = record
            .fields
            .iter()
            .filter(|(name, _)| !config.excluded_fields.contains(name))
            .map(|(name, value)| (name.clone(), round_value(value, config.decimal_precision)))
            .collect();
        fields.sort_by(|(a, _), (b, _)| a.cmp(b));

        let names: BTreeSet<String> = fields.iter().map(|(n, _)| n.clone()).collect();
        match &schema {
            None => schema = Some(names),
            Some(expected) if *expected != names => {
                return Err(PipelineError::Schema {
                    index,
                    reason: "record field set differs from first record".to_string(),
                });
            }
            Some(_) => {}
        }

        normalized.push(Record {
            fields,
            geometry: round_geometry(&record.geometry, config.decimal_precision),
        });
    }

    sort_records(&mut normalized, config);

    Ok(normalized)
}

/// Order records by the configured key tuple; ties and keyless datasets
/// fall back to the full serialized record so the order is always total
fn sort_records(records: &mut [Record], config: &CanonicalConfig) {
    let precision = config.decimal_precision;
    let keyed: Vec<String> = records
        .iter()
        .map(|record| {
            let mut key = String::new();
            for field in &config.sort_key_fields {
                if let Some(value) = record.field(field) {
                    key.push_str(&value_token(value, precision));
                    key.push('\u{1f}');
                }
            }
            key.push_str(&serialize_record(record, precision));
            key
        })
        .collect();

    let mut order: Vec<usize> = (0..records.len()).collect();
    order.sort_by(|&a, &b| keyed[a].cmp(&keyed[b]));

    let reordered: Vec<Record> = order.iter().map(|&i| records[i].clone()).collect();
    records.clone_from_slice(&reordered);
}

fn serialize_record(record: &Record, precision: usize) -> String {
    let mut parts: Vec<String> = record
        .fields
        .iter()
        .map(|(name, value)| format!("{}={}", escape(name), value_token(value, precision)))
        .collect();
    parts.push(format!("geometry={}", geometry_token(&record.geometry, precision)));
    parts.join("|")
}

/// Type-tagged scalar token. Integers are emitted through the same
/// fixed-precision float path so a source flipping between "3" and "3.0"
/// never reads as a content change. Text is trimmed: the source pads
/// categorical values inconsistently between publishes, and that padding
/// is churn, not content. Exports still carry the untrimmed value.
fn value_token(value: &Value, precision: usize) -> String {
    match value {
        Value::Null => "n:".to_string(),
        Value::Bool(b) => format!("b:{}", b),
        Value::Int(i) => format!("f:{}", format_number(*i as f64, precision)),
        Value::Float(f) => format!("f:{}", format_number(*f, precision)),
        Value::Text(s) => format!("t:{}", escape(s.trim())),
    }
}

fn geometry_token(geometry: &Geometry, precision: usize) -> String {
    let coord = |&(x, y): &(f64, f64)| {
        format!(
            "{} {}",
            format_number(x, precision),
            format_number(y, precision)
        )
    };
    match geometry {
        Geometry::Point(p) => format!("g:Point({})", coord(p)),
        Geometry::Line(line) => format!(
            "g:LineString({})",
            line.iter().map(coord).collect::<Vec<_>>().join(",")
        ),
        Geometry::Polygon(rings) => format!(
            "g:Polygon({})",
            rings
                .iter()
                .map(|ring| format!(
                    "({})",
                    ring.iter().map(coord).collect::<Vec<_>>().join(",")
                ))
                .collect::<Vec<_>>()
                .join(",")
        ),
    }
}

/// Fixed-point, locale-independent rendering of a rounded number.
/// "-0" is folded into "0" so the sign of a rounding artifact cannot
/// change the fingerprint.
fn format_number(value: f64, precision: usize) -> String {
    let rounded = round_f64(value, precision);
    let rounded = if rounded == 0.0 { 0.0 } else { rounded };
    format!("{:.*}", precision, rounded)
}

fn round_f64(value: f64, precision: usize) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}

fn round_value(value: &Value, precision: usize) -> Value {
    match value {
        Value::Int(i) => Value::Float(round_f64(*i as f64, precision)),
        Value::Float(f) => Value::Float(round_f64(*f, precision)),
        other => other.clone(),
    }
}

fn round_geometry(geometry: &Geometry, precision: usize) -> Geometry {
    let round = |&(x, y): &(f64, f64)| (round_f64(x, precision), round_f64(y, precision));
    match geometry {
        Geometry::Point(p) => Geometry::Point(round(p)),
        Geometry::Line(line) => Geometry::Line(line.iter().map(round).collect()),
        Geometry::Polygon(rings) => {
            Geometry::Polygon(rings.iter().map(|r| r.iter().map(round).collect()).collect())
        }
    }
}

/// Escape the structural characters of the serialization so field names
/// and text values cannot forge record boundaries
fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '|' => out.push_str("\\p"),
            '=' => out.push_str("\\e"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(fields: Vec<(&str, Value)>, point: (f64, f64)) -> Record {
        Record {
            fields: fields
                .into_iter()
                .map(|(n, v)| (n.to_string(), v))
                .collect(),
            geometry: Geometry::Point(point),
        }
    }

    fn turbine(name: &str, status: &str, power: f64, point: (f64, f64)) -> Record {
        record(
            vec![
                ("Name", Value::Text(name.to_string())),
                ("Status", Value::Text(status.to_string())),
                ("Leistung", Value::Float(power)),
            ],
            point,
        )
    }

    fn snapshot(records: Vec<Record>) -> Snapshot {
        Snapshot {
            crs: "EPSG:4326".to_string(),
            records,
        }
    }

    fn config() -> CanonicalConfig {
        CanonicalConfig {
            sort_key_fields: vec!["Name".to_string()],
            ..CanonicalConfig::default()
        }
    }

    #[test]
    fn test_record_order_independence() {
        let a = snapshot(vec![
            turbine("WEA 1", "Operating", 3.2, (15.62, 48.21)),
            turbine("WEA 2", "Plan", 4.2, (15.63, 48.22)),
        ]);
        let b = snapshot(vec![
            turbine("WEA 2", "Plan", 4.2, (15.63, 48.22)),
            turbine("WEA 1", "Operating", 3.2, (15.62, 48.21)),
        ]);

        let cfg = config();
        assert_eq!(canonicalize(&a, &cfg).unwrap(), canonicalize(&b, &cfg).unwrap());
    }

    #[test]
    fn test_field_order_independence() {
        let a = snapshot(vec![record(
            vec![
                ("Name", Value::Text("WEA 1".to_string())),
                ("Status", Value::Text("Operating".to_string())),
            ],
            (15.62, 48.21),
        )]);
        let b = snapshot(vec![record(
            vec![
                ("Status", Value::Text("Operating".to_string())),
                ("Name", Value::Text("WEA 1".to_string())),
            ],
            (15.62, 48.21),
        )]);

        let cfg = config();
        assert_eq!(canonicalize(&a, &cfg).unwrap(), canonicalize(&b, &cfg).unwrap());
    }

    #[test]
    fn test_idempotence() {
        let cfg = config();
        let original = snapshot(vec![
            turbine("WEA 2", "Plan", 4.2000000301, (15.63, 48.22)),
            turbine("WEA 1", "Operating", 3.2, (15.6200004, 48.21)),
        ]);

        let first = canonicalize(&original, &cfg).unwrap();
        let reparsed = snapshot(canonical_records(&original, &cfg).unwrap());
        let second = canonicalize(&reparsed, &cfg).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_excluded_fields_do_not_affect_form() {
        let mut cfg = config();
        cfg.excluded_fields.insert("FetchedAt".to_string());

        let base = turbine("WEA 1", "Operating", 3.2, (15.62, 48.21));
        let mut stamped = base.clone();
        stamped.fields.push((
            "FetchedAt".to_string(),
            Value::Text("2026-08-30T06:00:00Z".to_string()),
        ));
        let mut restamped = base.clone();
        restamped.fields.push((
            "FetchedAt".to_string(),
            Value::Text("2026-08-30T07:00:00Z".to_string()),
        ));

        assert_eq!(
            canonicalize(&snapshot(vec![stamped]), &cfg).unwrap(),
            canonicalize(&snapshot(vec![restamped]), &cfg).unwrap()
        );
    }

    #[test]
    fn test_rounding_absorbs_noise_but_not_changes() {
        let cfg = config();

        let exact = snapshot(vec![turbine("WEA 1", "Operating", 3.2, (15.62, 48.21))]);
        let noisy = snapshot(vec![turbine(
            "WEA 1",
            "Operating",
            3.2000000001,
            (15.6200000004, 48.2099999996),
        )]);
        let moved = snapshot(vec![turbine("WEA 1", "Operating", 3.2, (15.62001, 48.21))]);

        let exact_form = canonicalize(&exact, &cfg).unwrap();
        assert_eq!(exact_form, canonicalize(&noisy, &cfg).unwrap());
        assert_ne!(exact_form, canonicalize(&moved, &cfg).unwrap());
    }

    #[test]
    fn test_int_and_float_encodings_agree() {
        let cfg = config();
        let as_int = snapshot(vec![record(
            vec![("Name", Value::Text("WEA 1".to_string())), ("KG", Value::Int(3))],
            (15.62, 48.21),
        )]);
        let as_float = snapshot(vec![record(
            vec![("Name", Value::Text("WEA 1".to_string())), ("KG", Value::Float(3.0))],
            (15.62, 48.21),
        )]);

        assert_eq!(
            canonicalize(&as_int, &cfg).unwrap(),
            canonicalize(&as_float, &cfg).unwrap()
        );
    }

    #[test]
    fn test_text_padding_is_not_a_change() {
        let cfg = config();
        let padded = snapshot(vec![turbine("WEA 1", "Plan ", 3.2, (15.62, 48.21))]);
        let clean = snapshot(vec![turbine("WEA 1", "Plan", 3.2, (15.62, 48.21))]);
        let renamed = snapshot(vec![turbine("WEA 1", "Plan B", 3.2, (15.62, 48.21))]);

        let clean_form = canonicalize(&clean, &cfg).unwrap();
        assert_eq!(clean_form, canonicalize(&padded, &cfg).unwrap());
        assert_ne!(clean_form, canonicalize(&renamed, &cfg).unwrap());
    }

    #[test]
    fn test_empty_snapshot_is_well_defined() {
        let cfg = config();
        let form = canonicalize(&snapshot(vec![]), &cfg).unwrap();
        let text = String::from_utf8(form.as_bytes().to_vec()).unwrap();
        assert_eq!(text, "canonical v1\ncrs=EPSG:4326\nfields=\n");
    }

    #[test]
    fn test_fallback_sort_without_key_fields() {
        let cfg = CanonicalConfig::default();
        let a = snapshot(vec![
            turbine("WEA 1", "Operating", 3.2, (15.62, 48.21)),
            turbine("WEA 2", "Plan", 4.2, (15.63, 48.22)),
        ]);
        let b = snapshot(vec![
            turbine("WEA 2", "Plan", 4.2, (15.63, 48.22)),
            turbine("WEA 1", "Operating", 3.2, (15.62, 48.21)),
        ]);

        assert_eq!(canonicalize(&a, &cfg).unwrap(), canonicalize(&b, &cfg).unwrap());
    }

    #[test]
    fn test_non_uniform_schema_is_rejected() {
        let cfg = config();
        let bad = snapshot(vec![
            turbine("WEA 1", "Operating", 3.2, (15.62, 48.21)),
            record(vec![("Name", Value::Text("WEA 2".to_string()))], (15.63, 48.22)),
        ]);

        let err = canonicalize(&bad, &cfg).unwrap_err();
        assert!(matches!(err, PipelineError::Schema { index: 1, .. }));
    }

    #[test]
    fn test_negative_zero_coordinates_fold() {
        let cfg = config();
        let pos = snapshot(vec![turbine("WEA 1", "Operating", 3.2, (0.0000000001, 48.21))]);
        let neg = snapshot(vec![turbine("WEA 1", "Operating", 3.2, (-0.0000000001, 48.21))]);

        assert_eq!(canonicalize(&pos, &cfg).unwrap(), canonicalize(&neg, &cfg).unwrap());
    }

    #[test]
    fn test_escaping_prevents_forged_boundaries() {
        let cfg = CanonicalConfig::default();
        // a text value containing the delimiter must not collide with a
        // record that genuinely has these parts
        let tricky = snapshot(vec![record(
            vec![("Name", Value::Text("a|b=c".to_string()))],
            (15.0, 48.0),
        )]);
        let plain = snapshot(vec![record(
            vec![("Name", Value::Text("a".to_string()))],
            (15.0, 48.0),
        )]);

        assert_ne!(
            canonicalize(&tricky, &cfg).unwrap(),
            canonicalize(&plain, &cfg).unwrap()
        );
    }
}
