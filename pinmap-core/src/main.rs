//! src/main.rs
//! Replays JSON-lines element events from stdin through the action dispatcher

use std::panic::PanicHookInfo;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{debug, error, info, warn};

use pinmap_core::{
    SessionContext,
    config::Config,
    controller::{ActionDispatcher, ElementEvent, memory::InMemorySession},
    logging::LoggerBuilder,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    setup_panic_handler();

    let config = load_config().await;
    let _log_guard = LoggerBuilder::new()
        .with_config(config.logging.clone())
        .build()
        .await
        .context("Failed to initialize logging")?;
    info!(version = %config.build.version, "Starting pinmap");

    let ctx = SessionContext::new(config);
    ctx.start_background_tasks();

    let session = InMemorySession::new();
    session.collaborators().register_all(ctx.registry());

    let dispatcher = ActionDispatcher::wire(&ctx)
        .await
        .context("Failed to wire the action dispatcher")?;

    let result = replay(&dispatcher).await;

    info!(stats = ?dispatcher.stats(), cache = ?ctx.cache().stats(), "Final metrics");
    ctx.shutdown().await;
    result
}

/// `PINMAP_CONFIG` overrides the platform config path
async fn load_config() -> Config {
    let loaded = match std::env::var_os("PINMAP_CONFIG") {
        Some(path) => Config::load_from(&PathBuf::from(path))
            .await
            .map_err(anyhow::Error::from),
        None => Config::load().await,
    };

    loaded.unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {e:#}");
        Config::default()
    })
}

async fn replay(dispatcher: &ActionDispatcher) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let line = tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            line = lines.next_line() => line.context("Failed to read stdin")?,
        };

        let Some(line) = line else {
            debug!("Input exhausted");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let event: ElementEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Skipping malformed event");
                continue;
            }
        };

        let result = dispatcher.dispatch(event).await;
        let mut out = serde_json::to_vec(&result).context("Failed to encode result")?;
        out.push(b'\n');
        stdout.write_all(&out).await.context("Failed to write stdout")?;
        stdout.flush().await?;
    }

    Ok(())
}

fn setup_panic_handler() {
    let original_hook = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |panic_info: &PanicHookInfo<'_>| {
        error!("Application panicked: {}", panic_info);
        original_hook(panic_info);
    }));
}
