//! The reconciliation pass and the loop that drives it.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info};

use super::collector::{CollectorError, collect_desired};
use super::trigger::{TriggerQueue, wait_for_shutdown};
use crate::forwarding::{ApplySummary, Forwarder, StoreError};
use crate::runtime::ContainerRuntime;
use crate::telemetry::{AuditEvent, AuditLogger};

/// Default bound on a single runtime request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a pass failed.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Desired state could not be computed; nothing was applied.
    #[error("Failed to collect desired state: {0}")]
    Collect(#[from] CollectorError),

    /// Applying the desired state failed part way.
    #[error("Failed to apply forwarding rules: {0}")]
    Apply(#[from] StoreError),
}

/// Result type for a pass.
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Keeps a [`Forwarder`] in line with the containers a runtime reports.
pub struct Reconciler<R> {
    runtime: R,
    forwarder: Forwarder,
    request_timeout: Duration,
    audit: Arc<AuditLogger>,
}

impl<R: ContainerRuntime> Reconciler<R> {
    /// Create a reconciler over an open forwarder.
    pub fn new(runtime: R, forwarder: Forwarder) -> Self {
        Self {
            runtime,
            forwarder,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            audit: Arc::new(AuditLogger::new_null()),
        }
    }

    /// Bound every runtime request by `timeout`.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the audit logger for failed passes.
    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    /// The forwarder being reconciled.
    pub fn forwarder(&self) -> &Forwarder {
        &self.forwarder
    }

    /// The container runtime.
    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Run one pass: collect the desired rules, then apply them.
    ///
    /// A collection failure leaves the forwarder untouched. An apply failure
    /// keeps whatever was applied before it; the next pass picks up from the
    /// forwarder's mirrored state.
    pub async fn reconcile(&mut self) -> ReconcileResult<ApplySummary> {
        if self.forwarder.is_closed() {
            return Err(StoreError::Closed.into());
        }

        let desired = collect_desired(&self.runtime, self.request_timeout).await?;
        debug!(
            "Desired state: {} tcp, {} udp",
            desired.tcp.len(),
            desired.udp.len()
        );

        let summary = self.forwarder.apply(&desired.tcp, &desired.udp)?;
        Ok(summary)
    }

    /// Run a pass for every queued request until shutdown or until the queue
    /// closes. Failures are logged and the loop carries on. Returns the
    /// number of passes run.
    pub async fn run(&mut self, mut queue: TriggerQueue, mut shutdown: watch::Receiver<bool>) -> u64 {
        let mut passes = 0u64;

        loop {
            let trigger = tokio::select! {
                trigger = queue.next() => match trigger {
                    Some(trigger) => trigger,
                    None => break,
                },
                _ = wait_for_shutdown(&mut shutdown) => break,
            };

            debug!("Reconciling ({})", trigger);
            passes += 1;
            let outcome = self.reconcile().await;
            self.log_outcome(outcome);
        }

        passes
    }

    /// Log the result of a pass.
    pub fn log_outcome(&self, outcome: ReconcileResult<ApplySummary>) {
        match outcome {
            Ok(summary) if summary.is_noop() => {
                info!("Reconciliation succeeded (no changes)");
            }
            Ok(summary) => {
                info!(
                    "Reconciliation succeeded ({} added, {} removed)",
                    summary.added, summary.removed
                );
            }
            Err(e) => {
                error!("Reconciliation failed: {}", e);
                self.audit.log(AuditEvent::ReconcileFailed {
                    error: e.to_string(),
                });
            }
        }
    }

    /// Close the forwarder, releasing every forwarded port.
    pub fn close(&mut self) {
        self.forwarder.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarding::{ForwardEntry, Protocol};
    use crate::reconcile::trigger::{Trigger, trigger_queue};
    use crate::testing::{EngineCall, EngineLog, MockRuntime, primary, tcp_port};
    use std::io::Write;
    use std::sync::Mutex;

    /// Formatted log output shared with a test subscriber.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn reconciler(runtime: &MockRuntime, log: &EngineLog) -> Reconciler<MockRuntime> {
        let forwarder =
            Forwarder::open(log.engine(Protocol::Tcp), log.engine(Protocol::Udp)).unwrap();
        Reconciler::new(runtime.clone(), forwarder)
    }

    #[tokio::test]
    async fn test_collect_error_applies_nothing() {
        let runtime = MockRuntime::new();
        let log = EngineLog::new();
        let mut reconciler = reconciler(&runtime, &log);
        runtime.set_fail_list(true);

        let err = reconciler.reconcile().await.unwrap_err();
        assert!(matches!(err, ReconcileError::Collect(_)));
        assert!(log.rule_calls().is_empty());
    }

    #[tokio::test]
    async fn test_closed_reconciler_does_not_query_runtime() {
        let runtime = MockRuntime::new();
        let log = EngineLog::new();
        let mut reconciler = reconciler(&runtime, &log);
        reconciler.close();

        let err = reconciler.reconcile().await.unwrap_err();
        assert!(matches!(err, ReconcileError::Apply(StoreError::Closed)));
        assert_eq!(runtime.list_count(), 0);
    }

    #[tokio::test]
    async fn test_run_until_queue_closes() {
        let runtime = MockRuntime::new();
        runtime.add_container("web", vec![tcp_port(8080, 80)], primary("10.0.0.2"));
        let log = EngineLog::new();
        let mut reconciler = reconciler(&runtime, &log);

        let (sender, queue) = trigger_queue();
        let (_stop_tx, stop_rx) = watch::channel(false);
        sender.request(Trigger::Startup);
        drop(sender);

        let passes = reconciler.run(queue, stop_rx).await;
        assert_eq!(passes, 1);
        assert_eq!(
            log.rule_calls(),
            vec![EngineCall::Add {
                protocol: Protocol::Tcp,
                local_port: 8080,
                remote_port: 80,
                remote_address: "10.0.0.2".to_string(),
            }]
        );
        assert!(
            reconciler
                .forwarder()
                .current(Protocol::Tcp)
                .contains(&ForwardEntry::new(8080, "10.0.0.2", 80))
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let runtime = MockRuntime::new();
        let log = EngineLog::new();
        let mut reconciler = reconciler(&runtime, &log);

        let (_sender, queue) = trigger_queue();
        let (stop_tx, stop_rx) = watch::channel(false);
        stop_tx.send(true).unwrap();

        assert_eq!(reconciler.run(queue, stop_rx).await, 0);
    }

    #[tokio::test]
    async fn test_every_pass_reports_at_info() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let runtime = MockRuntime::new();
        runtime.add_container("web", vec![tcp_port(8080, 80)], primary("10.0.0.2"));
        let log = EngineLog::new();
        let mut reconciler = reconciler(&runtime, &log);
        let (_stop_tx, stop_rx) = watch::channel(false);

        for _ in 0..3 {
            let (sender, queue) = trigger_queue();
            sender.request(Trigger::Heartbeat);
            drop(sender);
            assert_eq!(reconciler.run(queue, stop_rx.clone()).await, 1);
        }

        let text = logs.text();
        assert_eq!(text.matches("Reconciliation succeeded").count(), 3);
        assert_eq!(text.matches("Reconciliation succeeded (no changes)").count(), 2);
        assert!(text.contains("Reconciliation succeeded (1 added, 0 removed)"));
    }
}
