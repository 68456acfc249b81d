//! Daemon entrypoint: loads configuration, builds the orchestrator, and
//! runs until SIGTERM/SIGINT trigger a graceful, staged shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use gastrolog::config::{Config, ConfigStore, FileConfigStore};
use gastrolog::digest::{LevelDigester, TimestampDigester};
use gastrolog::ingest::fluent::FluentIngester;
use gastrolog::ingest::tail::TailIngester;
use gastrolog::Orchestrator;

fn home_dir() -> PathBuf {
    std::env::var_os("GASTROLOG_HOME")
        .map(PathBuf::from)
        .or_else(|| xdg::BaseDirectories::with_prefix("gastrolog").ok().map(|dirs| dirs.get_data_home()))
        .unwrap_or_else(|| PathBuf::from("/var/lib/gastrolog"))
}

fn register_builtin_ingesters(orchestrator: &Orchestrator, state_dir: PathBuf) {
    orchestrator.register_ingester_factory(
        "fluent",
        Arc::new(|id: &str, params: &std::collections::HashMap<String, String>| {
            let bind = params.get("bind").map(String::as_str).unwrap_or("0.0.0.0:24224");
            Ok(Box::new(FluentIngester { id: id.to_string(), bind: bind.parse()? }) as Box<dyn gastrolog::ingest::Ingester>)
        }),
    );

    orchestrator.register_ingester_factory(
        "tail",
        Arc::new(move |id: &str, params: &std::collections::HashMap<String, String>| {
            let patterns: Vec<String> = params
                .get("paths")
                .map(|raw| serde_json::from_str(raw))
                .transpose()?
                .ok_or_else(|| anyhow::anyhow!("tail ingester '{}' is missing required 'paths' parameter", id))?;
            let poll_interval = params
                .get("poll_interval")
                .map(|raw| humantime_duration(raw))
                .transpose()?
                .filter(|d| !d.is_zero());
            let state_path = Some(state_dir.join("tail").join(format!("{}.json", id)));
            Ok(Box::new(TailIngester { id: id.to_string(), patterns, poll_interval, state_path })
                as Box<dyn gastrolog::ingest::Ingester>)
        }),
    );
}

/// Minimal `"30s"`/`"5m"`/`"0"` duration parser; full-featured duration
/// parsing is out of scope for a single config field.
fn humantime_duration(raw: &str) -> anyhow::Result<std::time::Duration> {
    let raw = raw.trim();
    let (value, unit) = raw.split_at(raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len()));
    let value: u64 = value.parse()?;
    let seconds = match unit {
        "" | "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        other => anyhow::bail!("unrecognized duration unit '{}'", other),
    };
    Ok(std::time::Duration::from_secs(seconds))
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let home = home_dir();
    let store = FileConfigStore::open(home.join("config.json"))?;
    let mut cfg: Config = store.load()?;
    if cfg.index_root.as_os_str().is_empty() {
        cfg.index_root = home.join("stores");
    }
    if cfg.state_dir.as_os_str().is_empty() {
        cfg.state_dir = home.join("state");
    }

    let orchestrator = Arc::new(Orchestrator::new(cfg.max_concurrent_jobs));
    register_builtin_ingesters(&orchestrator, cfg.state_dir.clone());
    orchestrator.register_digester(Box::new(LevelDigester));
    orchestrator.register_digester(Box::new(TimestampDigester));

    let errors = orchestrator.apply_config(&cfg);
    for e in &errors {
        log::error!("config apply error: {}", e);
    }

    orchestrator.start()?;
    log::info!("gastrologd started, home={}", home.display());

    wait_for_shutdown_signal().await;
    log::info!("shutdown signal received, draining pipeline");
    orchestrator.stop().await?;

    Ok(())
}
