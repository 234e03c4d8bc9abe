//! atomdb binary - composition root.
//!
//! 1. Parse CLI arguments and load configuration from TOML
//! 2. Initialize tracing
//! 3. Open the engine over the SQLite database in the data directory
//! 4. Run one producer, consumer or administrative command and print JSON

mod cli;

use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use clap::Parser;

use atomdb_core::budget::Budget;
use atomdb_core::config::AtomConfig;
use atomdb_core::types::{AtomId, ModelVersion};
use atomdb_spatial::{AtomEngine, KnnQuery, LandmarkSet, LandmarkSource};

use cli::{CliArgs, Command, LandmarkCommand};

type AppResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Parse a JSON value given inline or as `@path`.
fn read_json<T: serde::de::DeserializeOwned>(arg: &str) -> AppResult<T> {
    let text = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)?,
        None => arg.to_string(),
    };
    Ok(serde_json::from_str(&text)?)
}

fn read_content(path: &Path) -> AppResult<Vec<u8>> {
    if path == Path::new("-") {
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf)?;
        return Ok(buf);
    }
    Ok(std::fs::read(path)?)
}

fn landmark_summary(set: &LandmarkSet) -> serde_json::Value {
    serde_json::json!({
        "version": set.version(),
        "dimension": set.dimension(),
        "landmark_count": set.len(),
        "max_overlap": set.max_overlap(),
        "valid_from": set.valid_from(),
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> AppResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(engine: &AtomEngine, command: Command) -> AppResult<()> {
    match command {
        Command::Put {
            paths,
            modality,
            vector,
            model,
        } => {
            let mut atoms = Vec::with_capacity(paths.len());
            match (vector, model) {
                (Some(vector), Some(model)) => {
                    let [path] = paths.as_slice() else {
                        return Err("--vector takes exactly one path".into());
                    };
                    let vector: Vec<f32> = read_json(&vector)?;
                    let content = read_content(path)?;
                    atoms.push(engine.put_with_vector(&content, modality, &ModelVersion::new(model), &vector)?);
                }
                _ => {
                    for path in &paths {
                        atoms.push(engine.put(&read_content(path)?, modality)?);
                    }
                }
            }
            print_json(&atoms)
        }
        Command::Get { id, out } => {
            let content = engine.get(AtomId(id))?;
            match out {
                Some(path) => std::fs::write(path, content)?,
                None => std::io::stdout().write_all(&content)?,
            }
            Ok(())
        }
        Command::Release { id } => {
            let remaining = engine.release(AtomId(id))?;
            print_json(&serde_json::json!({ "atom_id": id, "refcount": remaining }))
        }
        Command::Knn {
            vector,
            model,
            k,
            radius,
        } => {
            let vector: Vec<f32> = read_json(&vector)?;
            let k = k.unwrap_or(engine.config().query.default_k);
            let mut query = KnnQuery::new(vector, k, model);
            if let Some(radius) = radius {
                query = query.with_radius(radius);
            }
            print_json(&engine.k_nearest(&query)?)
        }
        Command::Landmarks {
            action: LandmarkCommand::Show,
        } => match engine.landmarks() {
            Some(set) => print_json(&landmark_summary(&set)),
            None => Err("no landmark set published yet".into()),
        },
        Command::Landmarks {
            action: LandmarkCommand::Publish { random, sample, file },
        } => {
            let source = match (random, sample, file) {
                (Some(dimension), _, _) => LandmarkSource::Random { dimension },
                (_, Some(model), _) => LandmarkSource::Sample {
                    model: ModelVersion::new(model),
                },
                (_, _, Some(path)) => LandmarkSource::Vectors(read_json(&format!("@{}", path.display()))?),
                (None, None, None) => return Err("a landmark source is required".into()),
            };
            let set = engine.publish_landmarks(source)?;
            print_json(&landmark_summary(&set))
        }
        Command::Rebuild { model, timeout_ms } => {
            let mut budget = Budget::unlimited();
            if let Some(ms) = timeout_ms {
                budget = budget.with_timeout(Duration::from_millis(ms));
            }
            let report = engine
                .rebuild_index_async(&ModelVersion::new(model), budget)
                .await?;
            print_json(&report)
        }
        Command::Gc => {
            let report = engine.collect_garbage(&Budget::unlimited())?;
            print_json(&serde_json::json!({
                "collected": report.collected.len(),
                "blobs_deleted": report.blobs_deleted,
                "bytes_reclaimed": report.bytes_reclaimed,
            }))
        }
        Command::Retire { model } => {
            let deleted = engine.retire_model(&ModelVersion::new(model))?;
            print_json(&serde_json::json!({ "vectors_deleted": deleted }))
        }
        Command::Stats => print_json(&engine.stats()?),
        Command::InitConfig => Err("init-config runs without opening the engine".into()),
    }
}

#[tokio::main]
async fn main() -> AppResult<()> {
    let args = CliArgs::parse();

    // Config.
    let config_file = args.resolve_config_path();
    let mut config = AtomConfig::load_or_default(&config_file);
    if let Some(data_dir) = args.resolve_data_dir() {
        config.general.data_dir = data_dir;
    }
    let log_level = args.resolve_log_level(&config.general.log_level);

    // Tracing, on stderr so command output stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!("Starting atomdb v{}", env!("CARGO_PKG_VERSION"));

    if let Command::InitConfig = args.command {
        config.save(&config_file)?;
        tracing::info!(path = %config_file.display(), "Configuration written");
        return Ok(());
    }

    let engine = AtomEngine::open(config)?;
    tracing::debug!(
        data_dir = %engine.config().general.resolved_data_dir().display(),
        "Engine opened"
    );

    if let Err(e) = run(&engine, args.command).await {
        tracing::error!(error = %e, "Command failed");
        return Err(e);
    }
    Ok(())
}
