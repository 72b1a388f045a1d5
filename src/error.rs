//! Error types returned by the Raft core.

use thiserror::Error;

/// The result type used throughout this crate.
pub type RaftResult<T> = Result<T, RaftError>;

/// Errors which can be returned from the public `Server` API.
///
/// Per spec, these fall into two buckets: client-visible errors (returned from
/// `Server::do_command` and friends) and fatal invariant violations, which are
/// never expected to occur and indicate a programming error rather than a
/// recoverable runtime condition.
#[derive(Error, Debug)]
pub enum RaftError {
    /// A command was submitted to a server which is not currently the leader.
    #[error("not leader, current leader is {0:?}")]
    NotLeader(Option<String>),

    /// `AddPeer` was called with a name already present in the peer set.
    #[error("peer '{0}' is already registered")]
    DuplicatePeer(String),

    /// The 1-second default deadline on a client command's commit wait expired.
    ///
    /// The entry may still eventually commit; this error only reflects that the
    /// caller gave up waiting for it.
    #[error("command timed out waiting for commit")]
    CommandTimeout,

    /// The log file contained one or more malformed trailing records.
    #[error("log corruption detected at byte offset {0}, truncated")]
    LogCorruption(u64),

    /// A loaded snapshot failed its CRC-32 check.
    #[error("snapshot checksum mismatch, snapshot refused")]
    SnapshotCorruption,

    /// An error saving, loading, or pruning a `Snapshot`.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// A log operation was attempted with an index outside of the log's range,
    /// or which would violate the log-matching property.
    #[error("log error: {0}")]
    Log(#[from] LogError),

    /// The transport failed to deliver an RPC to a peer.
    ///
    /// This is absorbed internally at the `Peer` boundary and should not
    /// normally reach a client of the `Server` API.
    #[error("transport failure contacting peer: {0}")]
    TransportFailure(String),

    /// An I/O error performing log or snapshot persistence.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// `StartLeader` was called on a server which already has peers configured.
    #[error("start_leader is only valid for single-node bootstrap, peers are configured")]
    NotSingleNode,

    /// The server's event loop has already stopped.
    #[error("server is shutting down")]
    ShuttingDown,

    /// A condition the protocol guarantees can never happen did happen. These
    /// are programmer errors and the process should not continue.
    #[error("fatal invariant violation: {0}")]
    Fatal(String),

    /// The command committed, but the state machine's `apply` returned an
    /// application-level error. Per §9, commit still fires; this is only
    /// ever surfaced to the client that submitted the command.
    #[error("command applied with error: {0}")]
    ApplyFailed(String),
}

/// Errors specific to `Log` operations (§4.1).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    #[error("entry index {given} is not the expected next index {expected}")]
    OutOfOrder { given: u64, expected: u64 },

    #[error("entry term {given} is older than the log's last term {last}")]
    StaleTerm { given: u64, last: u64 },

    #[error("cannot truncate committed history at index {index}, commit_index is {commit_index}")]
    WouldRewriteCommitted { index: u64, commit_index: u64 },

    #[error("truncate index {index} is past the end of the log (last index {last_index})")]
    MissingEntry { index: u64, last_index: u64 },

    #[error("entry at index {index} has term {found}, expected {expected}")]
    TermMismatch { index: u64, found: u64, expected: u64 },
}

/// Errors returned while saving or loading a `Snapshot` (§4.2).
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("snapshot checksum mismatch")]
    BadChecksum,

    #[error("no snapshot found under {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors returned while validating a `Config`.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("election_timeout_min_ms ({min}) must be less than election_timeout_max_ms ({max})")]
    ElectionTimeoutRange { min: u64, max: u64 },

    #[error("heartbeat_interval_ms ({heartbeat}) must be less than election_timeout_min_ms ({min})")]
    HeartbeatTooSlow { heartbeat: u64, min: u64 },
}
