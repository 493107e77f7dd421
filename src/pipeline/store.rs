//! Change Record persistence - the only state carried between runs
//!
//! A small text file next to the exported data: fingerprint, dataset id,
//! last-updated timestamp. Read once at run start; rewritten only after a
//! publish fully succeeds, so a crash mid-run never leaves the stored
//! fingerprint pointing at content that was never published.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::pipeline::types::{ChangeRecord, Fingerprint, PipelineError};

/// Read the stored change record. Missing or corrupt files return None:
/// republishing on a bad record is wasteful, silently skipping a real
/// change is not, so the gate must see "absent" rather than an error.
pub fn read_change_record(path: &Path) -> Option<ChangeRecord> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No change record at {:?} (first run)", path);
            return None;
        }
        Err(e) => {
            warn!("Change record {:?} unreadable ({}), treating as first run", path, e);
            return None;
        }
    };

    match parse_change_record(&contents) {
        Some(record) => {
            info!(
                "Loaded change record for {} (updated {})",
                record.dataset_id, record.updated_at
            );
            Some(record)
        }
        None => {
            warn!("Change record {:?} corrupt, treating as first run", path);
            None
        }
    }
}

/// Persist the new change record. Written via a temp file and rename so a
/// partial write can never be mistaken for a valid record.
pub fn write_change_record(path: &Path, record: &ChangeRecord) -> Result<(), PipelineError> {
    let contents = format!(
        "{}\n{}\n{}\n",
        record.fingerprint,
        record.dataset_id,
        record.updated_at.to_rfc3339()
    );

    let tmp = path.with_extension("hash.tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;

    info!("Wrote change record to {:?}", path);
    Ok(())
}

fn parse_change_record(contents: &str) -> Option<ChangeRecord> {
    let mut lines = contents.lines();
    let fingerprint = Fingerprint::parse(lines.next()?.trim())?;
    let dataset_id = lines.next()?.trim().to_string();
    if dataset_id.is_empty() {
        return None;
    }
    let updated_at = DateTime::parse_from_rfc3339(lines.next()?.trim())
        .ok()?
        .with_timezone(&Utc);

    Some(ChangeRecord {
        dataset_id,
        fingerprint,
        updated_at,
    })
}
