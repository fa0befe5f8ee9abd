//! Engine entry point: config, logging, adapters, listener.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use vaani::asr::HttpAsr;
use vaani::config::EngineConfig;
use vaani::intent::{ChatIntentModel, IntentClassifier};
use vaani::language::LanguageResolver;
use vaani::pipeline::DialogDeps;
use vaani::rate_limit::SlidingWindowLimiter;
use vaani::records::{HttpRecordSink, NullRecordSink, RecordSink};
use vaani::server::{AppState, CallRegistry, router};
use vaani::store::{
    ContextStore, CustomerDirectory, HttpContextStore, HttpCustomerDirectory, MemoryContextStore,
};
use vaani::transfer::HttpCallBridge;
use vaani::tts::HttpTts;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(load_config()?);

    let _log_guard = init_tracing(&config);
    info!(version = env!("CARGO_PKG_VERSION"), "starting vaani");

    let deps = build_deps(&config).context("failed to build adapters")?;
    let registry = Arc::new(CallRegistry::new());
    let state = AppState {
        config: Arc::clone(&config),
        deps,
        registry: Arc::clone(&registry),
    };

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_addr))?;
    info!(addr = %config.server.bind_addr, "listening for media streams");

    let shutdown_registry = Arc::clone(&registry);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Cancel live calls now so their handlers can wind down;
            // each follows its orderly exit path: finish the in-flight
            // chunk, write the final record, close.
            shutdown_registry.shutdown_all();
        })
        .await
        .context("server error")?;

    info!("shutdown complete");
    Ok(())
}

fn load_config() -> Result<EngineConfig> {
    let mut args = std::env::args().skip(1);
    let mut path: Option<PathBuf> = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                path = args.next().map(PathBuf::from);
            }
            "--help" | "-h" => {
                println!("usage: vaani [--config <path>]");
                std::process::exit(0);
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    match path {
        Some(path) => {
            EngineConfig::load(&path).with_context(|| format!("loading {}", path.display()))
        }
        None => {
            let default = PathBuf::from("vaani.toml");
            if default.exists() {
                EngineConfig::load(&default).context("loading vaani.toml")
            } else {
                let config = EngineConfig::default();
                config.validate().context("default config invalid")?;
                Ok(config)
            }
        }
    }
}

fn init_tracing(config: &EngineConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match &config.server.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "vaani.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

fn build_deps(config: &EngineConfig) -> Result<DialogDeps> {
    let asr_limiter = Arc::new(Mutex::new(SlidingWindowLimiter::new(
        config.rate.asr_per_min,
        Duration::from_millis(config.rate.asr_min_gap_ms),
    )));

    let asr = Arc::new(HttpAsr::new(config.asr.clone(), asr_limiter)?);
    let tts = Arc::new(HttpTts::new(config.tts.clone())?);
    let intent = Arc::new(IntentClassifier::new(Arc::new(ChatIntentModel::new(
        config.intent.clone(),
    )?)));
    let bridge = Arc::new(HttpCallBridge::new(config.transfer.clone())?);

    let store: Arc<dyn ContextStore> = match &config.store.kv_endpoint {
        Some(endpoint) => Arc::new(HttpContextStore::new(
            endpoint.clone(),
            Duration::from_millis(config.store.resolve_poll_ms.max(500)),
        )?),
        None => Arc::new(MemoryContextStore::new()),
    };
    let directory: Option<Arc<dyn CustomerDirectory>> = match &config.store.directory_endpoint {
        Some(endpoint) => Some(Arc::new(HttpCustomerDirectory::new(
            endpoint.clone(),
            Duration::from_secs(5),
        )?)),
        None => None,
    };
    let records: Arc<dyn RecordSink> = match &config.records.endpoint {
        Some(endpoint) => Arc::new(HttpRecordSink::new(
            endpoint.clone(),
            Duration::from_millis(config.records.timeout_ms),
        )?),
        None => Arc::new(NullRecordSink),
    };

    Ok(DialogDeps {
        asr,
        tts,
        intent,
        bridge,
        store,
        directory,
        records,
        resolver: Arc::new(LanguageResolver::new(&config.language.default_state_map)),
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("shutdown signal received");
}
