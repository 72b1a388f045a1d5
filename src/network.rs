//! Collaborator interfaces (§6): the network transport, application state
//! machine, and command registry are external to the consensus core and are
//! expressed here purely as traits.

use async_trait::async_trait;

use crate::error::RaftResult;
use crate::rpc::AppendEntriesRequest;
use crate::rpc::AppendEntriesResponse;
use crate::rpc::RequestVoteRequest;
use crate::rpc::RequestVoteResponse;
use crate::rpc::SnapshotRequest;
use crate::rpc::SnapshotResponse;

/// Ships RPCs between cluster members.
///
/// The core treats every method as a blocking call executed off the role
/// loop (see `Peer`); implementations may be backed by a synchronous or
/// asynchronous network stack.
#[async_trait]
pub trait Transporter: Send + Sync + 'static {
    async fn send_append_entries(
        &self,
        peer_name: &str,
        req: AppendEntriesRequest,
    ) -> RaftResult<AppendEntriesResponse>;

    async fn send_vote_request(
        &self,
        peer_name: &str,
        req: RequestVoteRequest,
    ) -> RaftResult<RequestVoteResponse>;

    async fn send_snapshot(&self, peer_name: &str, req: SnapshotRequest) -> RaftResult<SnapshotResponse>;
}

/// The opaque, application-supplied state machine that committed commands
/// are applied to (§6).
#[async_trait]
pub trait StateMachine: Send + Sync + 'static {
    /// Capture the state machine's entire state as bytes, for snapshotting.
    async fn save(&self) -> RaftResult<Vec<u8>>;

    /// Restore the state machine from a previously captured snapshot.
    async fn recovery(&self, state: &[u8]) -> RaftResult<()>;
}

/// A single executable command, resolved from a command name and a
/// serialised payload by a `CommandRegistry` (§6).
#[async_trait]
pub trait Command: Send + Sync {
    /// The name under which this command type is registered; persisted
    /// alongside the command's payload in each `LogEntry`.
    fn command_name(&self) -> &'static str;

    /// Serialise this command for log persistence.
    fn serialize(&self) -> RaftResult<Vec<u8>>;

    /// Apply this command to the state machine, returning the
    /// application-specific result that will be handed back to the
    /// originating client.
    ///
    /// `server_name` identifies the server doing the applying, for commands
    /// whose behavior depends on which node they're running on. The full
    /// `Server` is intentionally not exposed here: `Log` is owned by
    /// `Server` and calls this during commit, so threading `&Server` through
    /// would recreate the cyclic back-reference §9 calls out for `Peer`.
    /// A command that needs more than the state machine should route that
    /// need through the state machine itself.
    async fn apply(&self, server_name: &str, state_machine: &dyn StateMachine) -> RaftResult<Vec<u8>>;
}

/// Resolves a `(commandName, payload)` pair into an executable `Command`.
///
/// An application registers one factory per command name at startup; the
/// `Log`'s apply pipeline uses this to reconstitute commands read back from
/// disk or received over the wire.
pub trait CommandRegistry: Send + Sync + 'static {
    /// Deserialise the named command's payload into an executable `Command`.
    fn resolve(&self, command_name: &str, payload: &[u8]) -> RaftResult<Box<dyn Command>>;
}
