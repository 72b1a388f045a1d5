//! Protocol message types (§6): the wire-level field semantics of the three RPCs.
//!
//! These are plain data types; the `Transporter` trait (see `network.rs`) is
//! responsible for actually shipping them between servers.

use serde::Deserialize;
use serde::Serialize;

use crate::log::LogEntry;

/// Sent by the cluster leader to replicate log entries, and as a heartbeat
/// when `entries` is empty (§4.3, §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_name: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub commit_index: u64,
}

/// The response to an `AppendEntriesRequest` (§6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// Spec §4.1 `setCommitIndex`/§6: the responder's `log.commitIndex` at time of reply.
    pub index: u64,
}

/// Sent by a candidate to gather votes (§4.6, §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: u64,
    pub candidate_name: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

/// The response to a `RequestVoteRequest` (§6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

/// Sent by the leader to a follower which has fallen behind the leader's
/// compacted log prefix (§4.10, §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub term: u64,
    pub leader_name: String,
    pub last_index: u64,
    pub last_term: u64,
    pub peers: Vec<String>,
    pub state: Vec<u8>,
}

/// The response to a `SnapshotRequest` (§6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub term: u64,
    pub success: bool,
    pub commit_index: u64,
}
