//! Configuration system for the llamactl CLI.
//!
//! Supports:
//! - CLI arguments (highest priority)
//! - Environment variables
//! - TOML config file
//! - Defaults (lowest priority)

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command-line arguments for llamactl.
#[derive(Parser, Debug, Clone)]
#[command(name = "llamactl")]
#[command(about = "llamactl - plan, launch and supervise local llama.cpp servers")]
#[command(version)]
pub struct CliArgs {
    /// Configuration file path (defaults to `<data dir>/llamactl.toml`)
    #[arg(long, short = 'c', env = "LLAMACTL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level or full filter directive
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Directory holding backends as `<version>/<backend>/`
    #[arg(long, env = "LLAMACTL_BACKENDS_DIR")]
    pub backends_dir: Option<PathBuf>,

    /// Secret used to derive per-model API keys
    #[arg(long, env = "LLAMACTL_API_SECRET", hide_env_values = true)]
    pub api_secret: Option<String>,

    /// Seconds to wait for a server to report readiness
    #[arg(long, env = "LLAMACTL_STARTUP_TIMEOUT")]
    pub startup_timeout_secs: Option<u64>,

    /// Default memory mode for planning: high, medium, low or cpu
    #[arg(long, env = "LLAMACTL_MEMORY_MODE")]
    pub memory_mode: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// List compute devices as seen by a llama-server binary
    Devices {
        /// Server binary (defaults to the best installed backend)
        #[arg(long)]
        backend: Option<PathBuf>,
    },
    /// Print GGUF header metadata
    Metadata { model: PathBuf },
    /// Estimate the KV cache for a context size
    KvEstimate {
        model: PathBuf,
        #[arg(long)]
        ctx_size: Option<u64>,
    },
    /// Model file size in bytes
    ModelSize { model: PathBuf },
    /// Plan GPU layers, context and batch size for this machine
    Plan(PlanArgs),
    /// RED / YELLOW / GREEN support level for this machine
    Supported {
        model: PathBuf,
        #[arg(long)]
        ctx_size: Option<u64>,
    },
    /// Derive the API key for a model id
    ApiKey { model_id: String },
    /// Installed backends and the one this machine would use
    Backends,
    /// A free port for a new server
    Port,
    /// Launch a server and keep it running until Ctrl-C
    Serve(ServeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct PlanArgs {
    pub model: PathBuf,
    #[arg(long)]
    pub mmproj: Option<PathBuf>,
    #[arg(long)]
    pub ctx_size: Option<u64>,
    /// Overrides the configured memory mode
    #[arg(long)]
    pub memory_mode: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    pub model_id: String,
    pub model: PathBuf,
    /// Server binary (defaults to the best installed backend)
    #[arg(long)]
    pub backend: Option<PathBuf>,
    /// Port to listen on (random free port when omitted)
    #[arg(long, short = 'p')]
    pub port: Option<u16>,
    #[arg(long)]
    pub mmproj: Option<PathBuf>,
    #[arg(long)]
    pub embedding: bool,
    /// JSON file with run settings; loosely typed values are accepted
    #[arg(long)]
    pub settings: Option<PathBuf>,
    /// Extra environment for the server, `KEY=VALUE`
    #[arg(long = "env", value_parser = parse_key_value)]
    pub envs: Vec<(String, String)>,
    /// Let the planner choose GPU layers, context and batch size
    #[arg(long)]
    pub auto_plan: bool,
}

fn parse_key_value(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

/// Full configuration (merged from all sources).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub backends_dir: PathBuf,
    pub api_secret: String,
    pub startup_timeout_secs: u64,
    pub memory_mode: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            backends_dir: common::platform::get_default_backends_dir(),
            api_secret: random_secret(),
            startup_timeout_secs: 600,
            memory_mode: "high".to_string(),
        }
    }
}

fn random_secret() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

impl ServerConfig {
    /// Load configuration from CLI args and optional config file.
    ///
    /// Priority: CLI args > Environment > Config file > Defaults
    pub fn load(args: &CliArgs) -> Result<Self> {
        let path = args.config.clone().unwrap_or_else(default_config_path);

        let mut config = if path.exists() {
            Self::from_file(&path)
                .with_context(|| format!("Failed to load config from {:?}", path))?
        } else {
            Self::default()
        };

        if let Some(ref dir) = args.backends_dir {
            config.backends_dir = dir.clone();
        }
        if let Some(ref secret) = args.api_secret {
            config.api_secret = secret.clone();
        }
        if let Some(secs) = args.startup_timeout_secs {
            config.startup_timeout_secs = secs;
        }
        if let Some(ref mode) = args.memory_mode {
            config.memory_mode = mode.clone();
        }

        Ok(config)
    }

    /// Load configuration from a TOML file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: ServerConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        Ok(config)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

pub fn default_config_path() -> PathBuf {
    common::platform::get_default_data_dir().join("llamactl.toml")
}
