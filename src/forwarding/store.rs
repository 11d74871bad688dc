//! The forwarding state store.
//!
//! [`Forwarder`] owns one engine per protocol and mirrors, per protocol, the
//! set of rules it has successfully applied to that engine. The mirror is the
//! "current state" that reconciliation diffs against, so it only changes after
//! the engine has accepted a change.
//!
//! # Example
//!
//! ```ignore
//! use portsync::forwarding::{EngineOptions, Forwarder, TcpEngine, UdpEngine};
//!
//! let opts = EngineOptions::default();
//! let mut forwarder = Forwarder::open(
//!     Box::new(TcpEngine::new(opts.clone())),
//!     Box::new(UdpEngine::new(opts)),
//! )?;
//!
//! forwarder.apply(&desired_tcp, &desired_udp)?;
//! forwarder.close();
//! ```

use std::sync::Arc;

use tracing::{debug, error, info};

use super::engine::ForwardingEngine;
use super::entry::{ForwardEntry, Protocol, RuleSet, entries_diff};
use super::error::{StoreError, StoreResult};
use crate::telemetry::{AuditEvent, AuditLogger};

/// An owned engine handle.
pub type BoxedEngine = Box<dyn ForwardingEngine>;

/// Counts of native operations performed by one [`Forwarder::apply`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    /// Rules added.
    pub added: usize,
    /// Rules removed.
    pub removed: usize,
}

impl ApplySummary {
    /// True when the pass changed nothing.
    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.removed == 0
    }
}

struct Engines {
    tcp: BoxedEngine,
    udp: BoxedEngine,
}

/// Per-protocol forwarding state backed by two engines.
pub struct Forwarder {
    /// `None` once the store has been closed.
    engines: Option<Engines>,
    tcp_entries: RuleSet,
    udp_entries: RuleSet,
    audit: Arc<AuditLogger>,
}

impl Forwarder {
    /// Start both engines and return an empty store.
    ///
    /// If the UDP engine fails to start, the already-started TCP engine is
    /// stopped before the error is returned.
    pub fn open(mut tcp: BoxedEngine, mut udp: BoxedEngine) -> StoreResult<Self> {
        tcp.start().map_err(|source| StoreError::Engine {
            protocol: Protocol::Tcp,
            source,
        })?;

        if let Err(source) = udp.start() {
            tcp.stop();
            return Err(StoreError::Engine {
                protocol: Protocol::Udp,
                source,
            });
        }

        debug!("Forwarding engines started");

        Ok(Self {
            engines: Some(Engines { tcp, udp }),
            tcp_entries: RuleSet::new(),
            udp_entries: RuleSet::new(),
            audit: Arc::new(AuditLogger::new_null()),
        })
    }

    /// Set the audit logger for logging rule changes.
    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.engines.is_none()
    }

    /// Rules currently believed active for `protocol`.
    pub fn current(&self, protocol: Protocol) -> &RuleSet {
        match protocol {
            Protocol::Tcp => &self.tcp_entries,
            Protocol::Udp => &self.udp_entries,
        }
    }

    fn parts(&mut self, protocol: Protocol) -> StoreResult<(&mut BoxedEngine, &mut RuleSet)> {
        let engines = self.engines.as_mut().ok_or(StoreError::Closed)?;
        Ok(match protocol {
            Protocol::Tcp => (&mut engines.tcp, &mut self.tcp_entries),
            Protocol::Udp => (&mut engines.udp, &mut self.udp_entries),
        })
    }

    /// Forward `entry` over `protocol`.
    ///
    /// Succeeds without touching the engine if the rule is already applied.
    pub fn add_entry(&mut self, protocol: Protocol, entry: &ForwardEntry) -> StoreResult<()> {
        let (engine, entries) = self.parts(protocol)?;
        if entries.contains(entry) {
            return Ok(());
        }

        if let Err(source) =
            engine.add_entry(entry.local_port, entry.remote_port, &entry.remote_address)
        {
            error!(
                "Failed to forward {} port {} to {}:{}: {}",
                protocol, entry.local_port, entry.remote_address, entry.remote_port, source
            );
            return Err(StoreError::AddFailed {
                protocol,
                entry: entry.clone(),
                source,
            });
        }

        entries.insert(entry.clone());
        info!(
            "Forwarding {} port {} to {}:{}",
            protocol, entry.local_port, entry.remote_address, entry.remote_port
        );
        self.audit.log(AuditEvent::ForwardAdded {
            protocol,
            local_port: entry.local_port,
            remote_address: entry.remote_address.clone(),
            remote_port: entry.remote_port,
        });
        Ok(())
    }

    /// Stop forwarding `entry` over `protocol`.
    ///
    /// Succeeds without touching the engine if the rule is not applied. The
    /// engine is addressed by local port only.
    pub fn remove_entry(&mut self, protocol: Protocol, entry: &ForwardEntry) -> StoreResult<()> {
        let (engine, entries) = self.parts(protocol)?;
        if !entries.contains(entry) {
            return Ok(());
        }

        if let Err(source) = engine.remove_entry(entry.local_port) {
            error!(
                "Failed to stop forwarding {} port {} to {}:{}: {}",
                protocol, entry.local_port, entry.remote_address, entry.remote_port, source
            );
            return Err(StoreError::RemoveFailed {
                protocol,
                entry: entry.clone(),
                source,
            });
        }

        entries.remove(entry);
        info!(
            "Stopped forwarding {} port {} to {}:{}",
            protocol, entry.local_port, entry.remote_address, entry.remote_port
        );
        self.audit.log(AuditEvent::ForwardRemoved {
            protocol,
            local_port: entry.local_port,
            remote_address: entry.remote_address.clone(),
            remote_port: entry.remote_port,
        });
        Ok(())
    }

    /// Converge both engines onto the desired rule sets.
    ///
    /// Order: TCP removals, UDP removals, TCP additions, UDP additions. Stale
    /// rules go first so a local port moving to a new destination is free
    /// before it is bound again. The first failing operation aborts the pass;
    /// rules applied before it stay applied.
    pub fn apply(&mut self, desired_tcp: &RuleSet, desired_udp: &RuleSet) -> StoreResult<ApplySummary> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }

        let tcp = entries_diff(&self.tcp_entries, desired_tcp);
        let udp = entries_diff(&self.udp_entries, desired_udp);

        if tcp.is_empty() && udp.is_empty() {
            debug!(
                "Forwarding rules up to date ({} tcp, {} udp)",
                self.tcp_entries.len(),
                self.udp_entries.len()
            );
            return Ok(ApplySummary::default());
        }

        let mut summary = ApplySummary::default();

        for entry in &tcp.to_remove {
            self.remove_entry(Protocol::Tcp, entry)?;
            summary.removed += 1;
        }
        for entry in &udp.to_remove {
            self.remove_entry(Protocol::Udp, entry)?;
            summary.removed += 1;
        }
        for entry in &tcp.to_add {
            self.add_entry(Protocol::Tcp, entry)?;
            summary.added += 1;
        }
        for entry in &udp.to_add {
            self.add_entry(Protocol::Udp, entry)?;
            summary.added += 1;
        }

        Ok(summary)
    }

    /// Stop and destroy both engines. Safe to call more than once.
    pub fn close(&mut self) {
        let Some(mut engines) = self.engines.take() else {
            return;
        };

        engines.tcp.stop();
        engines.udp.stop();
        drop(engines);

        self.tcp_entries.clear();
        self.udp_entries.clear();
        info!("Forwarder closed");
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{EngineCall, EngineLog};

    fn open(log: &EngineLog) -> Forwarder {
        Forwarder::open(log.engine(Protocol::Tcp), log.engine(Protocol::Udp)).unwrap()
    }

    fn rules(entries: &[ForwardEntry]) -> RuleSet {
        entries.iter().cloned().collect()
    }

    #[test]
    fn test_open_starts_both_engines() {
        let log = EngineLog::new();
        let forwarder = open(&log);

        assert!(!forwarder.is_closed());
        assert_eq!(
            log.calls(),
            vec![EngineCall::Start(Protocol::Tcp), EngineCall::Start(Protocol::Udp)]
        );
    }

    #[test]
    fn test_open_udp_failure_stops_tcp() {
        let log = EngineLog::new();
        log.fail_start(Protocol::Udp);

        let result = Forwarder::open(log.engine(Protocol::Tcp), log.engine(Protocol::Udp));
        assert!(matches!(
            result,
            Err(StoreError::Engine { protocol: Protocol::Udp, .. })
        ));
        assert!(log.calls().contains(&EngineCall::Stop(Protocol::Tcp)));
    }

    #[test]
    fn test_add_entry_is_idempotent() {
        let log = EngineLog::new();
        let mut forwarder = open(&log);
        let entry = ForwardEntry::new(8080, "10.0.0.2", 80);

        forwarder.add_entry(Protocol::Tcp, &entry).unwrap();
        forwarder.add_entry(Protocol::Tcp, &entry).unwrap();

        assert_eq!(log.rule_calls().len(), 1);
        assert!(forwarder.current(Protocol::Tcp).contains(&entry));
        assert!(forwarder.current(Protocol::Udp).is_empty());
    }

    #[test]
    fn test_add_failure_leaves_mirror_unchanged() {
        let log = EngineLog::new();
        log.fail_add(Protocol::Udp, 53);
        let mut forwarder = open(&log);
        let entry = ForwardEntry::new(53, "10.0.0.53", 53);

        let err = forwarder.add_entry(Protocol::Udp, &entry).unwrap_err();
        match err {
            StoreError::AddFailed { protocol, entry: failed, .. } => {
                assert_eq!(protocol, Protocol::Udp);
                assert_eq!(failed, entry);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(forwarder.current(Protocol::Udp).is_empty());
    }

    #[test]
    fn test_remove_absent_entry_is_noop() {
        let log = EngineLog::new();
        let mut forwarder = open(&log);

        forwarder
            .remove_entry(Protocol::Tcp, &ForwardEntry::new(8080, "10.0.0.2", 80))
            .unwrap();
        assert!(log.rule_calls().is_empty());
    }

    #[test]
    fn test_remove_is_keyed_by_local_port() {
        let log = EngineLog::new();
        let mut forwarder = open(&log);
        let entry = ForwardEntry::new(8080, "10.0.0.2", 80);

        forwarder.add_entry(Protocol::Tcp, &entry).unwrap();
        log.clear();
        forwarder.remove_entry(Protocol::Tcp, &entry).unwrap();

        assert_eq!(
            log.calls(),
            vec![EngineCall::Remove {
                protocol: Protocol::Tcp,
                local_port: 8080
            }]
        );
        assert!(forwarder.current(Protocol::Tcp).is_empty());
    }

    #[test]
    fn test_remove_failure_keeps_entry() {
        let log = EngineLog::new();
        let mut forwarder = open(&log);
        let entry = ForwardEntry::new(8080, "10.0.0.2", 80);
        forwarder.add_entry(Protocol::Tcp, &entry).unwrap();

        log.fail_remove(Protocol::Tcp, 8080);
        let err = forwarder.remove_entry(Protocol::Tcp, &entry).unwrap_err();

        assert!(matches!(err, StoreError::RemoveFailed { .. }));
        assert!(forwarder.current(Protocol::Tcp).contains(&entry));
    }

    #[test]
    fn test_apply_orders_removals_before_additions() {
        let log = EngineLog::new();
        let mut forwarder = open(&log);
        let old_tcp = ForwardEntry::new(8080, "10.0.0.2", 80);
        let old_udp = ForwardEntry::new(5353, "10.0.0.2", 53);
        forwarder
            .apply(&rules(&[old_tcp]), &rules(&[old_udp]))
            .unwrap();
        log.clear();

        let new_tcp = ForwardEntry::new(8080, "10.0.0.3", 80);
        let new_udp = ForwardEntry::new(5353, "10.0.0.3", 53);
        let summary = forwarder
            .apply(&rules(&[new_tcp.clone()]), &rules(&[new_udp.clone()]))
            .unwrap();

        assert_eq!(summary, ApplySummary { added: 2, removed: 2 });
        assert_eq!(
            log.calls(),
            vec![
                EngineCall::Remove { protocol: Protocol::Tcp, local_port: 8080 },
                EngineCall::Remove { protocol: Protocol::Udp, local_port: 5353 },
                EngineCall::Add {
                    protocol: Protocol::Tcp,
                    local_port: 8080,
                    remote_port: 80,
                    remote_address: "10.0.0.3".to_string(),
                },
                EngineCall::Add {
                    protocol: Protocol::Udp,
                    local_port: 5353,
                    remote_port: 53,
                    remote_address: "10.0.0.3".to_string(),
                },
            ]
        );
        assert_eq!(forwarder.current(Protocol::Tcp), &rules(&[new_tcp]));
        assert_eq!(forwarder.current(Protocol::Udp), &rules(&[new_udp]));
    }

    #[test]
    fn test_apply_same_state_twice_is_noop() {
        let log = EngineLog::new();
        let mut forwarder = open(&log);
        let tcp = rules(&[
            ForwardEntry::new(80, "10.0.0.2", 80),
            ForwardEntry::new(443, "10.0.0.2", 443),
        ]);
        let udp = rules(&[ForwardEntry::new(53, "10.0.0.9", 53)]);

        let first = forwarder.apply(&tcp, &udp).unwrap();
        assert_eq!(first.added, 3);

        log.clear();
        let second = forwarder.apply(&tcp, &udp).unwrap();
        assert!(second.is_noop());
        assert!(log.calls().is_empty());
    }

    #[test]
    fn test_apply_stops_at_first_failure() {
        let log = EngineLog::new();
        log.fail_add(Protocol::Tcp, 9000);
        let mut forwarder = open(&log);

        let ok = ForwardEntry::new(8000, "10.0.0.2", 80);
        let bad = ForwardEntry::new(9000, "10.0.0.2", 90);
        let udp = ForwardEntry::new(53, "10.0.0.2", 53);

        let err = forwarder
            .apply(&rules(&[ok.clone(), bad.clone()]), &rules(&[udp]))
            .unwrap_err();

        assert!(matches!(err, StoreError::AddFailed { ref entry, .. } if *entry == bad));
        // Sorted order puts 8000 before 9000, so it was applied and kept.
        assert_eq!(forwarder.current(Protocol::Tcp), &rules(&[ok]));
        // UDP additions come after TCP additions and never ran.
        assert!(forwarder.current(Protocol::Udp).is_empty());
    }

    #[test]
    fn test_close_is_idempotent_and_destroys_once() {
        let log = EngineLog::new();
        let mut forwarder = open(&log);
        forwarder
            .add_entry(Protocol::Tcp, &ForwardEntry::new(8080, "10.0.0.2", 80))
            .unwrap();

        forwarder.close();
        forwarder.close();
        drop(forwarder);

        let calls = log.calls();
        let destroys = calls
            .iter()
            .filter(|c| matches!(c, EngineCall::Destroy(_)))
            .count();
        let stops = calls
            .iter()
            .filter(|c| matches!(c, EngineCall::Stop(_)))
            .count();
        assert_eq!(destroys, 2);
        assert_eq!(stops, 2);
    }

    #[test]
    fn test_closed_store_rejects_everything() {
        let log = EngineLog::new();
        let mut forwarder = open(&log);
        forwarder.close();
        log.clear();

        let entry = ForwardEntry::new(8080, "10.0.0.2", 80);
        assert!(matches!(
            forwarder.add_entry(Protocol::Tcp, &entry),
            Err(StoreError::Closed)
        ));
        assert!(matches!(
            forwarder.remove_entry(Protocol::Udp, &entry),
            Err(StoreError::Closed)
        ));
        assert!(matches!(
            forwarder.apply(&rules(&[entry]), &RuleSet::new()),
            Err(StoreError::Closed)
        ));
        assert!(log.calls().is_empty());
    }
}
