//! Forwarding rule value types and the rule-set diff.

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

/// Transport protocol a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP stream forwarding.
    Tcp,
    /// UDP datagram forwarding.
    Udp,
}

impl Protocol {
    /// Both protocols, in apply order.
    pub const ALL: [Protocol; 2] = [Protocol::Tcp, Protocol::Udp];

    /// Lowercase protocol name.
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One forwarding rule: host `local_port` to `remote_address:remote_port`.
///
/// Two entries with identical fields are the same rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ForwardEntry {
    /// Port on the host.
    pub local_port: u16,
    /// Destination address (IPv4 or IPv6 literal). Ordered before the
    /// remote port so that sorting groups rules by destination.
    pub remote_address: String,
    /// Port on the destination.
    pub remote_port: u16,
}

impl ForwardEntry {
    /// Create a new entry.
    pub fn new(local_port: u16, remote_address: impl Into<String>, remote_port: u16) -> Self {
        Self {
            local_port,
            remote_address: remote_address.into(),
            remote_port,
        }
    }
}

impl fmt::Display for ForwardEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}:{}",
            self.local_port, self.remote_address, self.remote_port
        )
    }
}

/// A set of rules for a single protocol.
pub type RuleSet = HashSet<ForwardEntry>;

/// Result of comparing a current rule set against a desired one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntriesDiff {
    /// Entries in desired but not in current.
    pub to_add: Vec<ForwardEntry>,
    /// Entries in current but not in desired.
    pub to_remove: Vec<ForwardEntry>,
}

impl EntriesDiff {
    /// True when current already matches desired.
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Compute `to_add = desired \ current` and `to_remove = current \ desired`.
///
/// Both lists are sorted so that logs read the same from pass to pass.
pub fn entries_diff(current: &RuleSet, desired: &RuleSet) -> EntriesDiff {
    let mut to_remove: Vec<ForwardEntry> = current.difference(desired).cloned().collect();
    let mut to_add: Vec<ForwardEntry> = desired.difference(current).cloned().collect();
    to_remove.sort();
    to_add.sort();
    EntriesDiff { to_add, to_remove }
}
