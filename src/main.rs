mod api;
mod cli;
mod coordinator;
mod error;
mod locator;
mod model;
mod report;
mod resolver;

use std::sync::Arc;

use clap::Parser;

use api::ApiClient;
use cli::CliArgs;
use coordinator::{Coordinator, QuotaStatus, Trigger};
use error::Result;
use locator::SystemProcessSource;

fn init_tracing(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

fn build_coordinator(args: &CliArgs) -> Result<Arc<Coordinator>> {
    let client = ApiClient::new()?;
    Ok(Coordinator::new(
        Arc::new(SystemProcessSource),
        Arc::new(client),
        args.refresh_interval(),
    ))
}

/// Single probe-and-report run, mirroring a manual refresh: failures surface
/// as a one-line notification and a non-zero exit.
async fn run_once(args: CliArgs) -> Result<()> {
    let coordinator = build_coordinator(&args)?;
    if let Some(label) = &args.model {
        coordinator.select_model(label).await;
    }

    match coordinator.refresh(Trigger::Manual).await {
        Ok(_) => {
            if let Some(snapshot) = coordinator.snapshot().await {
                let selected = coordinator.selected_model().await;
                println!("{}", report::render(&snapshot, selected.as_deref()));
            }
            Ok(())
        }
        Err(error) => Err(anyhow::anyhow!("refresh failed: {error}")),
    }
}

/// Timer-driven watch loop: prints a fresh report on every successful
/// refresh, logs everything else, exits on Ctrl-C.
async fn run_watch(args: CliArgs) -> Result<()> {
    let coordinator = build_coordinator(&args)?;
    if let Some(label) = &args.model {
        coordinator.select_model(label).await;
    }

    let mut status_rx = coordinator.subscribe();
    let loop_handle = coordinator.start();

    // First refresh immediately; like a manual trigger, its failure is
    // surfaced rather than logged silently.
    if let Err(error) = coordinator.refresh(Trigger::Manual).await {
        eprintln!("refresh failed: {error}");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = status_rx.borrow_and_update().clone();
                match status {
                    QuotaStatus::Ok(snapshot) => {
                        let selected = coordinator.selected_model().await;
                        println!("{}", report::render(&snapshot, selected.as_deref()));
                    }
                    QuotaStatus::Connecting => tracing::info!("discovering language_server..."),
                    QuotaStatus::Fetching => tracing::debug!("fetching quota..."),
                    QuotaStatus::NoProcess => {
                        tracing::info!("no language_server process found; will retry")
                    }
                    QuotaStatus::NoPort => tracing::info!("no working API port found; will retry"),
                    QuotaStatus::FetchFailed => {
                        tracing::info!("quota fetch failed; will rediscover")
                    }
                    QuotaStatus::Error(message) => tracing::warn!("{message}"),
                }
            }
        }
    }

    coordinator.stop();
    let _ = loop_handle.await;
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    init_tracing(args.verbose);

    let result = if args.watch {
        run_watch(args).await
    } else {
        run_once(args).await
    };

    if let Err(error) = result {
        tracing::error!("{error:#}");
        std::process::exit(1);
    }
}
