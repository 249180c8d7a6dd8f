use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use form_layout_learner::model::FinalValues;
use form_layout_learner::observability;
use form_layout_learner::{
    CorrectionOutcome, InMemoryStore, LearningConfig, LearningEngine, LearningError,
    ScanObservation,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "form-layout-learner")]
#[command(about = "Learn issuer form layouts from corrections and apply them to new scans", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Find the best stored layout for a scan and print the suggestion
    Match {
        /// Store snapshot file
        snapshot: PathBuf,

        /// Scan observation (JSON)
        scan: PathBuf,
    },

    /// Record a finalized document and re-aggregate its issuer layout
    Learn {
        /// Store snapshot file, rewritten after learning
        snapshot: PathBuf,

        /// Scan plus final values (JSON)
        correction: PathBuf,
    },
}

/// A finalized document: the scan as extracted plus the values the user kept
#[derive(Debug, Deserialize)]
struct CorrectionInput {
    scan: ScanObservation,
    final_values: FinalValues,
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn run_match(engine: &LearningEngine, scan_path: &Path) -> Result<()> {
    let scan: ScanObservation = read_json(scan_path)?;
    match engine.suggest(&scan)? {
        Some(suggestion) => {
            println!(
                "layout {} v{} score {:.3} ({})",
                suggestion.issuer_key,
                suggestion.layout_version,
                suggestion.score,
                suggestion.decision.as_str()
            );
            println!(
                "offset dx={:.4} dy={:.4}",
                suggestion.alignment.offset.dx, suggestion.alignment.offset.dy
            );
            for (field, value) in &suggestion.fields {
                println!("  {}: {}", field, value);
            }
            for (field, rect) in &suggestion.regions {
                println!("  [{}] {}", field, rect);
            }
            println!(
                "  line items: {} in row region, {} matched",
                suggestion.line_item_rows.len(),
                suggestion.product_matches.len()
            );
        }
        None => println!("no matching layout"),
    }
    Ok(())
}

fn run_learn(engine: &LearningEngine, input_path: &Path) -> Result<()> {
    let input: CorrectionInput = read_json(input_path)?;
    match engine.record_correction_if_any(&input.scan, &input.final_values)? {
        CorrectionOutcome::Recorded { record, layout } => {
            println!(
                "recorded correction {} for {}",
                record.id.map(|id| id.0).unwrap_or_default(),
                record.key
            );
            match layout {
                Some(layout) => println!(
                    "layout v{} with {} fields",
                    layout.version,
                    layout.fields.len()
                ),
                None => println!(
                    "not enough records yet (need {})",
                    engine.config().aggregation.min_records
                ),
            }
        }
        CorrectionOutcome::NoCorrection => println!("no correction, nothing learned"),
        CorrectionOutcome::EmptyIssuerKey => {
            return Err(LearningError::EmptyIssuerKey(
                "neither tax id nor provider name is usable".to_string(),
            )
            .into());
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = LearningConfig::from_env().context("Failed to load configuration")?;
    observability::init_tracing(&config.observability)?;
    info!("{}", config.summary());

    match cli.command {
        Commands::Match { snapshot, scan } => {
            let store = Arc::new(InMemoryStore::load_snapshot(&snapshot)?);
            let engine = LearningEngine::new(store, config)?;
            run_match(&engine, &scan)?;
        }
        Commands::Learn {
            snapshot,
            correction,
        } => {
            let store = Arc::new(InMemoryStore::load_snapshot(&snapshot)?);
            let engine = LearningEngine::new(store.clone(), config)?;
            run_learn(&engine, &correction)?;
            store.save_snapshot(&snapshot)?;
        }
    }
    Ok(())
}
