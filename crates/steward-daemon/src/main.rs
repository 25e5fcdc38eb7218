// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use steward_audit::AuditLog;
use steward_bus::AmqpBus;
use steward_core::config::OrchestratorConfig;
use steward_daemon::build_app;
use steward_llm::Gateway;
use steward_planner::PlaybookCatalog;
use steward_service::OrchestratorService;
use steward_store::{PgStore, StateStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "steward-daemon", version, about = "Steward orchestrator daemon")]
struct Args {
    /// Bind address.
    #[arg(long, default_value = "127.0.0.1:8090")]
    bind: String,

    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the playbook catalog JSON (as produced by
    /// discover_playbooks).
    #[arg(long, default_value = "playbooks.json")]
    playbooks: PathBuf,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("steward=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("steward=info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match &args.config {
        Some(path) => OrchestratorConfig::load(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => OrchestratorConfig::default(),
    };

    let store = PgStore::connect(&config.database_url)
        .await
        .context("connect database")?;
    store.ensure_schema().await.context("apply schema")?;

    let bus = AmqpBus::connect(&config.bus_url)
        .await
        .context("connect broker")?;

    let gateway = Gateway::from_config(&config).context("build llm gateway")?;
    let catalog = load_catalog(&args.playbooks)?;
    let audit = AuditLog::new(&config.audit_log_path);

    let service = OrchestratorService::start(
        Arc::new(store) as Arc<dyn StateStore>,
        Arc::new(bus),
        Arc::new(gateway),
        catalog,
        audit,
        config,
    )
    .await
    .context("start orchestrator")?;
    let service = Arc::new(service);

    let app = build_app(Arc::clone(&service));
    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    info!(bind = %args.bind, "steward-daemon listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("serve")?;

    match Arc::try_unwrap(service) {
        Ok(service) => service.shutdown().await,
        Err(_) => info!("open handles at shutdown, background loops aborted with process"),
    }
    Ok(())
}

fn load_catalog(path: &PathBuf) -> Result<PlaybookCatalog> {
    if !path.exists() {
        tracing::warn!(
            path = %path.display(),
            "playbook catalog missing, deploy_service resolution disabled"
        );
        return Ok(PlaybookCatalog::new(Vec::new()));
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read playbook catalog {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("parse playbook catalog {}", path.display()))?;
    PlaybookCatalog::from_json(&value).map_err(|e| anyhow::anyhow!("{e}"))
}
