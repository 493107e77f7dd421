//! Dataset sync orchestrator - runs fetch, canonicalize, gate, export
//!
//! Exit codes signal the run outcome to the external commit step:
//! 0 published, 10 unchanged (no-op), 2 partial export failure,
//! 1 retrieval/schema/store failure. Diagnostics go to the log only.

use std::collections::BTreeSet;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use gis_asset_sync::pipeline::canonical::CanonicalConfig;
use gis_asset_sync::pipeline::fetch::{coerce_numeric_fields, fetch_geojson};
use gis_asset_sync::pipeline::run::{publish_if_changed, RunConfig, RunOutcome};
use gis_asset_sync::pipeline::types::ExportFormat;
use tracing::{error, info};

const EXIT_PUBLISHED: u8 = 0;
const EXIT_FAILED: u8 = 1;
const EXIT_PARTIAL: u8 = 2;
const EXIT_UNCHANGED: u8 = 10;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .init();

    info!("Starting dataset sync pipeline");

    let config = Config::from_env();

    match run(&config).await {
        Ok(RunOutcome::Published { decision, report }) => {
            info!("✓ {} published ({}, {})", config.dataset_id, decision, report);
            ExitCode::from(EXIT_PUBLISHED)
        }
        Ok(RunOutcome::Unchanged) => {
            info!("✓ {} unchanged, exiting without saving files", config.dataset_id);
            ExitCode::from(EXIT_UNCHANGED)
        }
        Ok(RunOutcome::PartialFailure { report }) => {
            for (format, err) in &report.failures {
                error!("✗ {} export failed: {}", format, err);
            }
            ExitCode::from(EXIT_PARTIAL)
        }
        Err(e) => {
            error!("✗ {} failed: {}", config.dataset_id, e);
            ExitCode::from(EXIT_FAILED)
        }
    }
}

async fn run(config: &Config) -> Result<RunOutcome> {
    std::fs::create_dir_all(&config.output_dir)?;

    // Step 1: Fetch and validate the snapshot
    info!("Step 1/3: Fetching data...");
    let snapshot = fetch_geojson(&config.dataset_url).await?;
    let numeric: Vec<&str> = config.numeric_fields.iter().map(String::as_str).collect();
    let snapshot = coerce_numeric_fields(snapshot, &numeric)?;
    info!("✓ Fetched {} records", snapshot.len());

    // Step 2+3: Gate on content, export and persist only on change
    info!("Step 2/3: Comparing against stored fingerprint...");
    let run_config = RunConfig {
        dataset_id: config.dataset_id.clone(),
        canonical: CanonicalConfig {
            excluded_fields: config.excluded_fields.clone(),
            decimal_precision: config.decimal_precision,
            sort_key_fields: config.sort_key_fields.clone(),
        },
        formats: vec![ExportFormat::GeoJson, ExportFormat::Geopackage],
        out_dir: config.output_dir.clone(),
    };

    info!("Step 3/3: Publishing if changed...");
    let outcome = publish_if_changed(&snapshot, &run_config)?;

    Ok(outcome)
}

/// Configuration loaded from environment variables. Defaults target the
/// NÖ wind turbine register; the exclusion list and rounding precision
/// are deliberately explicit per dataset, never inferred.
#[derive(Debug, Clone)]
struct Config {
    dataset_id: String,
    dataset_url: String,
    output_dir: PathBuf,
    decimal_precision: usize,
    excluded_fields: BTreeSet<String>,
    sort_key_fields: Vec<String>,
    numeric_fields: Vec<String>,
}

impl Config {
    fn from_env() -> Self {
        Config {
            dataset_id: env::var("DATASET_ID")
                .unwrap_or_else(|_| "windkraftanlagen".to_string()),

            dataset_url: env::var("DATASET_URL").unwrap_or_else(|_| {
                "https://sdi.noe.gv.at/at.gv.noe.geoserver/OGD/wfs?service=WFS&version=2.0.0&request=GetFeature&typeNames=OGD:Windkraftanlagen&outputFormat=application/json".to_string()
            }),

            output_dir: env::var("OUTPUT_DIR")
                .unwrap_or_else(|_| "data".to_string())
                .into(),

            decimal_precision: env::var("DECIMAL_PRECISION")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(6),

            excluded_fields: csv_list(
                &env::var("EXCLUDED_FIELDS").unwrap_or_else(|_| "Stand".to_string()),
            )
            .into_iter()
            .collect(),

            sort_key_fields: csv_list(
                &env::var("SORT_KEY_FIELDS")
                    .unwrap_or_else(|_| "Vorhaben,Name der WKA".to_string()),
            ),

            numeric_fields: csv_list(&env::var("NUMERIC_FIELDS").unwrap_or_else(|_| {
                "Leistung der WKA [MW],Gesamtleistung [MW],Gesamthöhe der WKA [m]".to_string()
            })),
        }
    }
}

fn csv_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
