//! A Raft consensus core: a replicated state-machine engine that keeps a
//! durable log in sync across a small cluster of named peers.
//!
//! The network transport, the application state machine, and the command
//! registry are external collaborators, expressed here as traits (see
//! [`network`]). This crate owns the log, the snapshotting scheme, the
//! per-peer replication controller, and the server's role state machine.

pub mod config;
pub mod error;
pub mod log;
pub mod metrics;
pub mod network;
pub mod peer;
pub mod rpc;
pub mod server;
pub mod snapshot;

pub use config::Config;
pub use error::ConfigError;
pub use error::LogError;
pub use error::RaftError;
pub use error::RaftResult;
pub use error::SnapshotError;
pub use log::Log;
pub use log::LogEntry;
pub use metrics::RaftMetrics;
pub use network::Command;
pub use network::CommandRegistry;
pub use network::StateMachine;
pub use network::Transporter;
pub use rpc::AppendEntriesRequest;
pub use rpc::AppendEntriesResponse;
pub use rpc::RequestVoteRequest;
pub use rpc::RequestVoteResponse;
pub use rpc::SnapshotRequest;
pub use rpc::SnapshotResponse;
pub use server::Role;
pub use server::Server;
pub use server::ServerHandle;
pub use snapshot::Snapshot;
