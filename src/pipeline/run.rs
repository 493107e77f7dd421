//! Run orchestration - fetch-to-publish wiring for one dataset
//!
//! The pipeline itself is stateless between invocations; the only carried
//! state is the change record file owned by the store. The fingerprint is
//! persisted strictly after all exports succeed, so an aborted run can
//! never record content that was not actually published.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{info, warn};

use crate::pipeline::canonical::{canonicalize, CanonicalConfig};
use crate::pipeline::export::export_all;
use crate::pipeline::fingerprint::fingerprint;
use crate::pipeline::gate::evaluate;
use crate::pipeline::store::{read_change_record, write_change_record};
use crate::pipeline::types::{
    ChangeRecord, ExportFormat, ExportReport, GateDecision, PipelineError, Snapshot,
};

/// Everything one dataset run needs besides the snapshot itself
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub dataset_id: String,
    pub canonical: CanonicalConfig,
    pub formats: Vec<ExportFormat>,
    pub out_dir: PathBuf,
}

impl RunConfig {
    pub fn change_record_path(&self) -> PathBuf {
        self.out_dir.join(format!("{}.hash", self.dataset_id))
    }
}

/// What one run amounted to; the binary maps this onto its exit signal
/// for the external commit step
#[derive(Debug)]
pub enum RunOutcome {
    /// Content identical to the stored version; nothing touched
    Unchanged,
    /// All formats exported and the new fingerprint persisted
    Published {
        decision: GateDecision,
        report: ExportReport,
    },
    /// At least one format failed; the fingerprint was left untouched so
    /// the next run re-detects the change
    PartialFailure { report: ExportReport },
}

/// Canonicalize, fingerprint, gate, and (only on change) export and
/// persist. Export files and the change record live under `out_dir`.
pub fn publish_if_changed(
    snapshot: &Snapshot,
    config: &RunConfig,
) -> Result<RunOutcome, PipelineError> {
    let form = canonicalize(snapshot, &config.canonical)?;
    let new_fingerprint = fingerprint(&form);

    let record_path = config.change_record_path();
    let previous = read_change_record(&record_path);
    let previous = validate_previous(previous, &config.dataset_id, &record_path);

    let decision = evaluate(&new_fingerprint, previous.as_ref().map(|r| &r.fingerprint));
    if !decision.should_publish() {
        info!("No changes detected, leaving published files untouched");
        return Ok(RunOutcome::Unchanged);
    }

    let report = export_all(snapshot, &config.formats, &config.dataset_id, &config.out_dir);
    if report.is_partial_failure() {
        warn!(
            "Export partially failed ({}), keeping previous change record",
            report
        );
        return Ok(RunOutcome::PartialFailure { report });
    }

    write_change_record(
        &record_path,
        &ChangeRecord {
            dataset_id: config.dataset_id.clone(),
            fingerprint: new_fingerprint,
            updated_at: Utc::now(),
        },
    )?;

    info!("Published {} records ({})", snapshot.len(), decision);
    Ok(RunOutcome::Published { decision, report })
}

/// A stored record for a different dataset means the store was miswired;
/// trust the conservative path and republish
fn validate_previous(
    previous: Option<ChangeRecord>,
    dataset_id: &str,
    path: &Path,
) -> Option<ChangeRecord> {
    match previous {
        Some(record) if record.dataset_id != dataset_id => {
            warn!(
                "Change record {:?} belongs to dataset {:?}, ignoring it",
                path, record.dataset_id
            );
            None
        }
        other => other,
    }
}
