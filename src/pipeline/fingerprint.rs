//! Fingerprinter - content digest over a canonical form

use sha2::{Digest, Sha256};

use crate::pipeline::canonical::CanonicalForm;
use crate::pipeline::types::Fingerprint;

/// Digest the canonical bytes. Deterministic across runs; the algorithm
/// name travels inside the Fingerprint, so swapping the digest invalidates
/// every stored fingerprint and forces republication on the next run.
pub fn fingerprint(form: &CanonicalForm) -> Fingerprint {
    let digest = Sha256::digest(form.as_bytes());
    Fingerprint::from_hex_digest(hex::encode(digest))
}
