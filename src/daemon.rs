//! Daemon lifecycle.
//!
//! Wires the pieces together: connect to Docker, open the forwarding engines,
//! start the trigger tasks and run the reconcile loop until SIGINT or
//! SIGTERM. The loop owns the [`Reconciler`] and closes it after its last
//! pass, so closing never races a pass in flight.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cli::Cli;
use crate::config::{Config, TriggerConfig};
use crate::forwarding::{Forwarder, TcpEngine, UdpEngine};
use crate::reconcile::{
    Reconciler, Trigger, TriggerMode, run_event_watcher, run_heartbeat, trigger_queue,
};
use crate::runtime::{ContainerRuntime, DockerRuntime};
use crate::telemetry::{AuditEvent, AuditLogger};

/// Run the daemon with the given CLI flags and configuration.
pub fn run(cli: &Cli, config: &Config) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    rt.block_on(run_async(cli, config))
}

async fn run_async(cli: &Cli, config: &Config) -> Result<()> {
    let audit = open_audit(config);

    let runtime = DockerRuntime::connect()
        .await
        .context("Failed to connect to the container runtime")?;

    let options = config.forwarding.engine_options()?;
    info!("Forwarded ports bind to {}", options.bind_address);

    let forwarder = Forwarder::open(
        Box::new(TcpEngine::new(options.clone())),
        Box::new(UdpEngine::new(options)),
    )
    .context("Failed to start forwarding engines")?
    .with_audit(Arc::clone(&audit));

    let mut reconciler = Reconciler::new(runtime, forwarder)
        .with_request_timeout(config.runtime.request_timeout())
        .with_audit(Arc::clone(&audit));

    if cli.once {
        let outcome = reconciler.reconcile().await;
        reconciler.close();
        let summary = outcome.context("Reconciliation failed")?;
        info!(
            "Reconciliation succeeded ({} added, {} removed)",
            summary.added, summary.removed
        );
        return Ok(());
    }

    // Install handlers before anything runs so a failure here is fatal.
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => info!("Received SIGINT, shutting down"),
                Err(e) => error!("Failed to listen for SIGINT: {}", e),
            },
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    let mode = config.trigger.mode();
    audit.log(AuditEvent::DaemonStart {
        pid: std::process::id(),
        mode: mode.to_string(),
    });
    info!("portsync started in {} mode", mode);

    let passes = serve(reconciler, &config.trigger, shutdown_rx).await;

    audit.log(AuditEvent::DaemonStop { passes });
    info!("portsync stopped after {} passes", passes);
    Ok(())
}

/// Run the trigger tasks and the reconcile loop until `shutdown` fires, then
/// close the reconciler. Returns the number of passes run.
pub async fn serve<R>(
    mut reconciler: Reconciler<R>,
    trigger: &TriggerConfig,
    shutdown: watch::Receiver<bool>,
) -> u64
where
    R: ContainerRuntime + Clone + 'static,
{
    let (sender, queue) = trigger_queue();
    sender.request(Trigger::Startup);

    let period = trigger.heartbeat_for_mode();
    debug!("Heartbeat every {:?}", period);
    let mut tasks = vec![tokio::spawn(run_heartbeat(
        period,
        sender.clone(),
        shutdown.clone(),
    ))];

    if trigger.mode() == TriggerMode::Events {
        tasks.push(tokio::spawn(run_event_watcher(
            reconciler.runtime().clone(),
            trigger.actions(),
            sender.clone(),
            shutdown.clone(),
            trigger.resubscribe_delay(),
        )));
    }
    drop(sender);

    let passes = reconciler.run(queue, shutdown).await;
    reconciler.close();

    for task in tasks {
        if let Err(e) = task.await {
            warn!("Trigger task failed: {}", e);
        }
    }

    passes
}

fn open_audit(config: &Config) -> Arc<AuditLogger> {
    if !config.telemetry.syslog() {
        return Arc::new(AuditLogger::new_null());
    }

    match AuditLogger::new() {
        Ok(logger) => Arc::new(logger),
        Err(e) => {
            warn!("Audit trail disabled: {}", e);
            Arc::new(AuditLogger::new_null())
        }
    }
}
