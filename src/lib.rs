// Library module for testable functions

pub mod pipeline;

pub use pipeline::canonical::{CanonicalConfig, CanonicalForm};
pub use pipeline::run::{publish_if_changed, RunConfig, RunOutcome};
pub use pipeline::types::{
    ChangeRecord, ExportFormat, ExportReport, Fingerprint, GateDecision, Geometry, PipelineError,
    Record, Snapshot, Value,
};
