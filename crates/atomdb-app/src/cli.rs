//! CLI argument definitions for the atomdb binary.
//!
//! Uses `clap` with derive macros for ergonomic argument parsing.
//! Priority resolution: CLI args > env vars > config file > defaults.

use std::path::PathBuf;

use clap::{ArgGroup, Parser, Subcommand};

use atomdb_core::types::Modality;

/// atomdb - content-addressed atom store with a landmark-projected spatial index.
#[derive(Parser, Debug)]
#[command(name = "atomdb", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding the SQLite database.
    #[arg(short = 'd', long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Store each file (or stdin with `-`) as one atom.
    Put {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        #[arg(short = 'm', long, default_value = "binary")]
        modality: Modality,
        /// Embedding as a JSON array, or `@file` holding one. Only with a
        /// single path.
        #[arg(long, requires = "model")]
        vector: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
    /// Write an atom's bytes to stdout or a file.
    Get {
        id: i64,
        #[arg(short = 'o', long)]
        out: Option<PathBuf>,
    },
    /// Drop one reference to an atom.
    Release { id: i64 },
    /// Approximate k nearest neighbors of a vector.
    Knn {
        /// Query vector as a JSON array, or `@file` holding one.
        vector: String,
        #[arg(long)]
        model: String,
        #[arg(short = 'k', long)]
        k: Option<usize>,
        /// Starting search radius in key space.
        #[arg(long)]
        radius: Option<f64>,
    },
    /// Inspect or publish landmark sets.
    Landmarks {
        #[command(subcommand)]
        action: LandmarkCommand,
    },
    /// Rebuild a model's partitions and spatial index.
    Rebuild {
        model: String,
        /// Abort the rebuild after this many milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Delete atoms released longer ago than the retention window.
    Gc,
    /// Drop every vector and the index of a model version.
    Retire { model: String },
    /// Print engine statistics as JSON.
    Stats,
    /// Write the effective configuration to the config path.
    InitConfig,
}

#[derive(Subcommand, Debug)]
pub enum LandmarkCommand {
    /// Publish a new landmark set version.
    #[command(group(ArgGroup::new("source").required(true)))]
    Publish {
        /// Seeded random orthonormal landmarks of this dimension.
        #[arg(long, group = "source")]
        random: Option<usize>,
        /// Principal directions of a model's stored vectors.
        #[arg(long, group = "source")]
        sample: Option<String>,
        /// Explicit landmarks from a JSON file holding an array of arrays.
        #[arg(long, group = "source")]
        file: Option<PathBuf>,
    },
    /// Show the latest published set.
    Show,
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > ATOMDB_CONFIG env var > platform default (~/.atomdb/config.toml).
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("ATOMDB_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Resolve the data directory path.
    ///
    /// Priority: --data-dir flag > ATOMDB_DATA_DIR env var > config file value.
    /// Returns `None` if neither is overridden (use config value).
    pub fn resolve_data_dir(&self) -> Option<String> {
        if let Some(ref p) = self.data_dir {
            return Some(p.to_string_lossy().to_string());
        }
        std::env::var("ATOMDB_DATA_DIR").ok()
    }

    /// Resolve the log level.
    ///
    /// Priority: --log-level flag > config file value.
    pub fn resolve_log_level(&self, config_level: &str) -> String {
        self.log_level
            .clone()
            .unwrap_or_else(|| config_level.to_string())
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".atomdb").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".atomdb").join("config.toml");
    }
    PathBuf::from("config.toml")
}
