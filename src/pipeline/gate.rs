//! Change Gate - decides whether new content warrants republication
//!
//! The correctness boundary of the whole pipeline: a false `Unchanged`
//! silently publishes stale data, so `Unchanged` is only ever returned on
//! bit-identical fingerprints. A false `Changed` merely wastes a publish.

use tracing::info;

use crate::pipeline::types::{Fingerprint, GateDecision};

/// Compare the freshly computed fingerprint against the stored one.
/// `previous` is None on the first run and when the stored change record
/// was missing or unreadable (the store's conservative fallback).
pub fn evaluate(new: &Fingerprint, previous: Option<&Fingerprint>) -> GateDecision {
    let decision = match previous {
        None => GateDecision::FirstRun,
        Some(prev) if prev == new => GateDecision::Unchanged,
        Some(_) => GateDecision::Changed,
    };

    info!("Change gate: {} ({})", decision, new);
    decision
}
