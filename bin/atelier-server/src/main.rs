//! atelier-server – entry point.
//!
//! Startup order:
//! 1. Parse CLI arguments and load configuration (defaults, TOML, env).
//! 2. Initialise structured tracing (JSON or human-readable).
//! 3. Build and preload the inference engine.
//! 4. Start the task runner and wrap it in the `Studio` facade.
//! 5. Build the Axum router and serve until SIGINT/SIGTERM.
//! 6. Stop the task runner.

mod config;
mod error;
mod middleware;
mod routes;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use atelier_core::api::{GenerationDefaults, Studio};
use atelier_core::artifact::FsArtifactStore;
use atelier_core::engine::{InferenceEngine, ProceduralConfig, ProceduralEngine};
use atelier_core::{RunnerConfig, TaskRunner};
use clap::Parser;
use tracing::{info, warn};

use crate::config::Config;
use crate::state::AppState;

#[derive(Debug, Parser)]
#[command(version, about = "Image generation task server")]
struct Args {
    /// Path to a TOML config file. Falls back to `ATELIER_CONFIG`.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let args = Args::parse();
    let cfg = Config::load(args.config.as_deref())?;

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: log_level '{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "atelier-server starting");

    // ── 3. Inference engine ────────────────────────────────────────────────────
    let engine = build_engine(&cfg)?;
    let preload = Arc::clone(&engine);
    tokio::task::spawn_blocking(move || preload.load())
        .await
        .context("model preload task panicked")?
        .context("failed to load model")?;
    info!(model_id = %cfg.model.model_id, "model loaded");

    // ── 4. Task runner ─────────────────────────────────────────────────────────
    let artifacts = Arc::new(FsArtifactStore::new(&cfg.model.output_dir));
    let runner = TaskRunner::start(
        engine,
        artifacts,
        RunnerConfig {
            queue_capacity: cfg.runtime.queue_capacity,
            generation_timeout: cfg.generation_timeout(),
        },
    );
    let studio = Studio::new(
        runner,
        GenerationDefaults {
            seed: cfg.runtime.default_seed,
            steps: cfg.model.num_inference_steps,
        },
    );
    info!(
        queue_capacity = cfg.runtime.queue_capacity,
        output_dir = %cfg.model.output_dir.display(),
        "task runner started"
    );

    let state = Arc::new(AppState {
        config: Arc::new(cfg.clone()),
        studio: studio.clone(),
    });

    // ── 5. HTTP server with graceful shutdown ──────────────────────────────────
    let app = routes::build(state);
    let addr: SocketAddr = cfg
        .bind_address()
        .parse()
        .with_context(|| format!("invalid bind address {}", cfg.bind_address()))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // ── 6. Drain the runner ────────────────────────────────────────────────────
    studio.shutdown().await;
    info!("atelier-server stopped");
    Ok(())
}

fn build_engine(cfg: &Config) -> anyhow::Result<Arc<dyn InferenceEngine>> {
    let model = &cfg.model;
    match model.model_id.as_str() {
        "procedural" => {
            if let (true, Some(lora)) = (model.use_lora, &model.lora) {
                warn!(
                    lora_dir = %lora.lora_dir.display(),
                    weight_name = %lora.weight_name,
                    "procedural engine does not apply LoRA weights"
                );
            }
            if !model.use_cpu_offload {
                info!("procedural engine always runs on the CPU");
            }
            let engine: Arc<dyn InferenceEngine> = Arc::new(ProceduralEngine::new(ProceduralConfig {
                width: model.width,
                height: model.height,
                step_delay: Duration::from_millis(model.step_delay_ms),
                ..Default::default()
            }));
            Ok(engine)
        }
        other => anyhow::bail!("unsupported model_id '{other}' (available: procedural)"),
    }
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
