//! Exporter - serialize an accepted Snapshot into each target format
//!
//! Exports take the Snapshot, not the canonical form: downstream consumers
//! get the source's field order and full precision. Formats are attempted
//! independently; one failure never blocks a sibling, but any failure makes
//! the run partially failed.

pub mod geojson;
pub mod gpkg;

use std::fs;
use std::path::Path;

use tracing::{info, warn};

use crate::pipeline::types::{ExportFormat, ExportReport, PipelineError, Snapshot};

/// Export the snapshot to every requested format under `out_dir`. File
/// names are stable per dataset id; files are written to a temp path and
/// renamed into place so readers never see a half-written export.
pub fn export_all(
    snapshot: &Snapshot,
    formats: &[ExportFormat],
    dataset_id: &str,
    out_dir: &Path,
) -> ExportReport {
    let mut report = ExportReport::default();

    for &format in formats {
        let path = out_dir.join(format!("{}.{}", dataset_id, format.extension()));
        match export_one(snapshot, format, dataset_id, &path) {
            Ok(()) => {
                info!("Saved {} file: {:?}", format, path);
                report.written.push((format, path));
            }
            Err(e) => {
                warn!("{} export failed: {}", format, e);
                report.failures.push((
                    format,
                    PipelineError::Export {
                        format,
                        reason: e.to_string(),
                    },
                ));
            }
        }
    }

    report
}

fn export_one(
    snapshot: &Snapshot,
    format: ExportFormat,
    dataset_id: &str,
    path: &Path,
) -> anyhow::Result<()> {
    let tmp = path.with_extension(format!("{}.tmp", format.extension()));
    let result = match format {
        ExportFormat::GeoJson => geojson::write_geojson(snapshot, &tmp),
        ExportFormat::Geopackage => gpkg::write_gpkg(snapshot, dataset_id, &tmp),
    };

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{Geometry, Record, Value};
    use tempfile::tempdir;

    fn point_record(name: &str, point: (f64, f64)) -> Record {
        Record {
            fields: vec![("Name".to_string(), Value::Text(name.to_string()))],
            geometry: Geometry::Point(point),
        }
    }

    fn snapshot(records: Vec<Record>) -> Snapshot {
        Snapshot {
            crs: "EPSG:4326".to_string(),
            records,
        }
    }

    #[test]
    fn test_export_all_writes_both_formats() {
        let dir = tempdir().unwrap();
        let snap = snapshot(vec![point_record("WEA 1", (15.62, 48.21))]);

        let report = export_all(
            &snap,
            &[ExportFormat::GeoJson, ExportFormat::Geopackage],
            "windkraftanlagen",
            dir.path(),
        );

        assert!(!report.is_partial_failure());
        assert_eq!(report.written.len(), 2);
        assert!(dir.path().join("windkraftanlagen.geojson").exists());
        assert!(dir.path().join("windkraftanlagen.gpkg").exists());
    }

    #[test]
    fn test_one_format_failing_does_not_block_the_other() {
        let dir = tempdir().unwrap();
        // mixed geometry types: fine for GeoJSON, unsupported in a single
        // GeoPackage feature table
        let snap = snapshot(vec![
            point_record("WEA 1", (15.62, 48.21)),
            Record {
                fields: vec![("Name".to_string(), Value::Text("Zone".to_string()))],
                geometry: Geometry::Polygon(vec![vec![
                    (15.0, 48.0),
                    (15.1, 48.0),
                    (15.1, 48.1),
                    (15.0, 48.0),
                ]]),
            },
        ]);

        let report = export_all(
            &snap,
            &[ExportFormat::GeoJson, ExportFormat::Geopackage],
            "mixed",
            dir.path(),
        );

        assert!(report.is_partial_failure());
        assert_eq!(report.written.len(), 1);
        assert_eq!(report.written[0].0, ExportFormat::GeoJson);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, ExportFormat::Geopackage);
        assert!(dir.path().join("mixed.geojson").exists());
        assert!(!dir.path().join("mixed.gpkg").exists());
    }

    #[test]
    fn test_stable_paths_are_overwritten_in_place() {
        let dir = tempdir().unwrap();
        let first = snapshot(vec![point_record("WEA 1", (15.62, 48.21))]);
        let second = snapshot(vec![point_record("WEA 2", (15.63, 48.22))]);

        export_all(&first, &[ExportFormat::GeoJson], "ds", dir.path());
        export_all(&second, &[ExportFormat::GeoJson], "ds", dir.path());

        let reread = geojson::read_geojson(&dir.path().join("ds.geojson")).unwrap();
        assert_eq!(
            reread.records[0].field("Name"),
            Some(&Value::Text("WEA 2".to_string()))
        );
    }
}
