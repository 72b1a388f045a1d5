//! Observability surface: a periodically-updated snapshot of consensus state.

use serde::Deserialize;
use serde::Serialize;

use crate::server::Role;

/// A read-only snapshot of a `Server`'s consensus state, broadcast over a
/// `tokio::sync::watch` channel after every event the role loops process.
///
/// Mirrors the teacher's `RaftMetrics`/`tx_metrics`/`rx_metrics` pattern:
/// external callers subscribe to the receiver half rather than polling the
/// server through its event channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RaftMetrics {
    pub name: String,
    pub role: Role,
    pub current_term: u64,
    pub last_log_index: u64,
    pub last_applied: u64,
    pub leader: Option<String>,
}

impl RaftMetrics {
    pub fn new(name: String) -> Self {
        RaftMetrics {
            name,
            role: Role::Stopped,
            current_term: 0,
            last_log_index: 0,
            last_applied: 0,
            leader: None,
        }
    }
}
