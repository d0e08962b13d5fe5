//! llamactl - command-line front end for planning and supervising local
//! llama.cpp servers.
//!
//! Every command prints JSON on stdout. Logs go to stderr.

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use common::LlamacppConfig;
use gguf_loader::BackendInfo;
use llamactl_server::config::{CliArgs, Command, PlanArgs, ServeArgs, ServerConfig};
use llamactl_server::{apply_plan, LoadRequest, Orchestrator, ResolvedBackend, ServerError};

#[derive(Serialize)]
struct BackendsReport {
    backends_dir: PathBuf,
    installed: Vec<BackendInfo>,
    supported: Vec<String>,
    selected: Option<ResolvedBackend>,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", text);
    Ok(())
}

/// Explicit binary, or the best installed one with its `version/backend`
async fn backend_binary(
    orchestrator: &Orchestrator,
    config: &ServerConfig,
    explicit: Option<PathBuf>,
) -> Result<(PathBuf, Option<String>)> {
    match explicit {
        Some(path) => Ok((path, None)),
        None => {
            let resolved = orchestrator.resolve_backend(&config.backends_dir).await?;
            Ok((resolved.binary_path, Some(resolved.backend.backend_string())))
        }
    }
}

async fn backends_report(orchestrator: &Orchestrator, config: &ServerConfig) -> Result<BackendsReport> {
    let installed = gguf_loader::get_local_installed_backends(&config.backends_dir)?;
    let features = llamactl_server::detect_supported_features().await?;
    let supported = gguf_loader::determine_supported_backends(
        std::env::consts::OS,
        std::env::consts::ARCH,
        &features,
    )
    .unwrap_or_default();
    let selected = orchestrator.resolve_backend(&config.backends_dir).await.ok();

    Ok(BackendsReport {
        backends_dir: config.backends_dir.clone(),
        installed,
        supported,
        selected,
    })
}

async fn plan(orchestrator: &Orchestrator, config: &ServerConfig, args: PlanArgs) -> Result<()> {
    let memory_mode = args.memory_mode.unwrap_or_else(|| config.memory_mode.clone());
    let plan = orchestrator
        .plan_model_load(&args.model, &memory_mode, args.mmproj.as_deref(), args.ctx_size)
        .await?;
    print_json(&plan)
}

async fn serve(orchestrator: &Orchestrator, config: &ServerConfig, args: ServeArgs) -> Result<()> {
    let (backend_path, version_backend) = backend_binary(orchestrator, config, args.backend).await?;

    let raw = match &args.settings {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read settings file: {:?}", path))?;
            serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse settings file: {:?}", path))?
        }
        None => serde_json::Value::Object(Default::default()),
    };
    let mut settings = LlamacppConfig::normalize(&raw);
    if settings.version_backend.is_empty() {
        settings.version_backend = version_backend.unwrap_or_else(|| "local/custom".to_string());
    }

    if args.auto_plan {
        let requested_ctx = u64::try_from(settings.ctx_size).ok().filter(|ctx| *ctx > 0);
        let plan = orchestrator
            .plan_model_load(&args.model, &config.memory_mode, args.mmproj.as_deref(), requested_ctx)
            .await?;
        info!("Applying load plan: {:?}", plan);
        apply_plan(&mut settings, &plan)?;
    }

    let port = match args.port {
        Some(port) => port,
        None => orchestrator.get_random_port().await?,
    };

    let request = LoadRequest {
        backend_path,
        model_id: args.model_id,
        model_path: args.model,
        port,
        config: settings,
        envs: args.envs.into_iter().collect::<HashMap<_, _>>(),
        mmproj_path: args.mmproj,
        is_embedding: args.embedding,
        timeout: config.startup_timeout(),
    };
    let session = orchestrator.load_llama_model(request).await?;
    print_json(&session)?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut liveness = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                signal.context("Failed to listen for Ctrl-C")?;
                info!("Ctrl-C received, stopping llama.cpp servers");
                break;
            }
            _ = liveness.tick() => {
                if !orchestrator.is_process_running(session.pid).await {
                    warn!("llama-server (PID {}) is no longer running", session.pid);
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn run(orchestrator: &Orchestrator, config: &ServerConfig, command: Command) -> Result<()> {
    match command {
        Command::Devices { backend } => {
            let (path, _) = backend_binary(orchestrator, config, backend).await?;
            let devices = orchestrator.get_devices(&path, path.parent()).await?;
            print_json(&devices)
        }
        Command::Metadata { model } => print_json(&orchestrator.read_gguf_metadata(&model).await?),
        Command::KvEstimate { model, ctx_size } => {
            print_json(&orchestrator.estimate_kv_cache_size(&model, ctx_size).await?)
        }
        Command::ModelSize { model } => print_json(&orchestrator.get_model_size(&model).await?),
        Command::Plan(args) => plan(orchestrator, config, args).await,
        Command::Supported { model, ctx_size } => {
            print_json(&orchestrator.is_model_supported(&model, ctx_size).await?)
        }
        Command::ApiKey { model_id } => {
            print_json(&orchestrator.generate_api_key(&model_id, &config.api_secret)?)
        }
        Command::Backends => print_json(&backends_report(orchestrator, config).await?),
        Command::Port => print_json(&orchestrator.get_random_port().await?),
        Command::Serve(args) => serve(orchestrator, config, args).await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Initialize tracing (stdout is reserved for JSON output)
    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("Starting llamactl v{}", env!("CARGO_PKG_VERSION"));
    let config = ServerConfig::load(&args)?;
    let orchestrator = Orchestrator::with_system_probe(config.api_secret.clone());

    let outcome = run(&orchestrator, &config, args.command).await;
    let stopped = orchestrator.cleanup_llama_processes().await;
    if stopped > 0 {
        info!("Stopped {} llama.cpp server(s)", stopped);
    }

    if let Err(err) = outcome {
        if let Some(server_err) = err.downcast_ref::<ServerError>() {
            let body = serde_json::to_string(server_err).unwrap_or_else(|_| server_err.to_string());
            eprintln!("{}", body);
            std::process::exit(1);
        }
        return Err(err);
    }
    Ok(())
}
