//! Change-detection pipeline - fetch, canonicalize, fingerprint, gate, export

pub mod canonical;
pub mod export;
pub mod fetch;
pub mod fingerprint;
pub mod gate;
pub mod run;
pub mod store;
pub mod types;

pub use types::*;
