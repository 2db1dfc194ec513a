/*!
 * HOSTWATCH - Entry point of one monitoring run
 *
 * ROLE: Loads the configuration, locks and opens the host store, reconciles
 * it with the configured hosts, probes every host, runs the escalation pass
 * and sends the resulting alarms.
 *
 * USAGE: meant to be started by an external scheduler (cron, systemd timer).
 *   hostwatch                    # probe the configured hosts
 *   hostwatch observations.json  # replay {"host": 0|1} instead of probing
 */

use anyhow::{Context, Result};
use hostwatch_kernel::config::load_config;
use hostwatch_kernel::lock::StoreLock;
use hostwatch_kernel::models::{local_offset, now_timestamp, parse_observations};
use hostwatch_kernel::probe::Prober;
use hostwatch_kernel::{EscalationEngine, HostRecordStore, HttpDispatcher, Runner};
use std::time::Duration;
use time::UtcOffset;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // stored timestamps are local wall-clock time; the zone can only be read
    // before the runtime starts its worker threads
    let offset = local_offset().unwrap_or_else(|| {
        warn!("local time zone unknown, timestamps recorded in UTC");
        UtcOffset::UTC
    });

    tokio::runtime::Runtime::new()
        .context("Failed to start async runtime")?
        .block_on(run(offset))
}

async fn run(offset: UtcOffset) -> Result<()> {
    let cfg = load_config().await.context("Failed to load configuration")?;

    let _lock = StoreLock::acquire(&cfg.store.path, Duration::from_millis(cfg.store.lock_timeout_ms))
        .await
        .context("Failed to lock host store")?;
    let store = HostRecordStore::open(&cfg.store.path).context("Failed to open host store")?;

    let dispatcher = HttpDispatcher::new(cfg.notification.clone())
        .context("Failed to build notification client")?;
    let mut runner = Runner::new(EscalationEngine::new(cfg.thresholds), store, dispatcher)
        .with_dispatch_timeout(Duration::from_secs(cfg.notification.timeout_secs + 5));

    let reconciliation = runner.reconcile(&cfg.hosts).context("Failed to reconcile host store")?;
    if !reconciliation.duplicates.is_empty() {
        warn!(duplicates = ?reconciliation.duplicates, "hosts listed more than once in configuration");
    }

    let observations = match std::env::args().nth(1) {
        Some(path) => {
            let txt = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read observations from {path}"))?;
            parse_observations(&txt).with_context(|| format!("Invalid observations in {path}"))?
        }
        None => Prober::new(cfg.probe.clone()).probe(&cfg.hosts).await,
    };

    let report = runner
        .run_once(&observations, now_timestamp(offset))
        .await
        .context("Monitoring run failed")?;

    info!(
        evaluated = report.outcomes.len(),
        alarms = report.directives().count(),
        skipped = report.skipped.len(),
        dispatch_failures = report.dispatch_failures,
        "run complete"
    );
    Ok(())
}
