//! Fixtures shared by the integration test suite: an in-memory transport
//! router, a toy key/value state machine, and a matching command registry.

#![allow(dead_code)]

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use raft_core::AppendEntriesRequest;
use raft_core::AppendEntriesResponse;
use raft_core::Command;
use raft_core::CommandRegistry;
use raft_core::Config;
use raft_core::RaftError;
use raft_core::RaftResult;
use raft_core::RequestVoteRequest;
use raft_core::RequestVoteResponse;
use raft_core::Server;
use raft_core::ServerHandle;
use raft_core::SnapshotRequest;
use raft_core::SnapshotResponse;
use raft_core::StateMachine;
use raft_core::Transporter;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing_subscriber::prelude::*;

pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default()
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::NONE)
        .with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Shared registry of servers plus isolation state, reached by every node's
/// `NamedTransporter` so tests can dispatch RPCs in-process without a real
/// network stack.
pub struct Router {
    servers: RwLock<HashMap<String, ServerHandle>>,
    isolated: RwLock<HashSet<String>>,
}

impl Router {
    pub fn new() -> Arc<Self> {
        Arc::new(Router { servers: RwLock::new(HashMap::new()), isolated: RwLock::new(HashSet::new()) })
    }

    pub async fn register(&self, handle: ServerHandle) {
        self.servers.write().await.insert(handle.name().to_string(), handle);
    }

    pub async fn isolate(&self, name: &str) {
        self.isolated.write().await.insert(name.to_string());
    }

    pub async fn heal(&self, name: &str) {
        self.isolated.write().await.remove(name);
    }

    async fn blocked(&self, from: &str, to: &str) -> bool {
        let isolated = self.isolated.read().await;
        isolated.contains(from) || isolated.contains(to)
    }

    /// A `Transporter` that always dials out from `self_name`.
    pub fn transporter_for(self: &Arc<Self>, self_name: String) -> Arc<NamedTransporter> {
        Arc::new(NamedTransporter { self_name, router: self.clone() })
    }
}

pub struct NamedTransporter {
    self_name: String,
    router: Arc<Router>,
}

#[async_trait]
impl Transporter for NamedTransporter {
    async fn send_append_entries(&self, peer_name: &str, req: AppendEntriesRequest) -> RaftResult<AppendEntriesResponse> {
        if self.router.blocked(&self.self_name, peer_name).await {
            return Err(RaftError::TransportFailure(format!("{} unreachable", peer_name)));
        }
        let handle = {
            let servers = self.router.servers.read().await;
            servers.get(peer_name).cloned().ok_or_else(|| RaftError::TransportFailure(format!("unknown peer {}", peer_name)))?
        };
        handle.append_entries(req).await
    }

    async fn send_vote_request(&self, peer_name: &str, req: RequestVoteRequest) -> RaftResult<RequestVoteResponse> {
        if self.router.blocked(&self.self_name, peer_name).await {
            return Err(RaftError::TransportFailure(format!("{} unreachable", peer_name)));
        }
        let handle = {
            let servers = self.router.servers.read().await;
            servers.get(peer_name).cloned().ok_or_else(|| RaftError::TransportFailure(format!("unknown peer {}", peer_name)))?
        };
        handle.request_vote(req).await
    }

    async fn send_snapshot(&self, peer_name: &str, req: SnapshotRequest) -> RaftResult<SnapshotResponse> {
        if self.router.blocked(&self.self_name, peer_name).await {
            return Err(RaftError::TransportFailure(format!("{} unreachable", peer_name)));
        }
        let handle = {
            let servers = self.router.servers.read().await;
            servers.get(peer_name).cloned().ok_or_else(|| RaftError::TransportFailure(format!("unknown peer {}", peer_name)))?
        };
        handle.install_snapshot(req).await
    }
}

/// A trivial key/value store used as the `StateMachine` under test.
pub struct KvStateMachine {
    state: StdMutex<HashMap<String, String>>,
}

impl KvStateMachine {
    pub fn new() -> Arc<Self> {
        Arc::new(KvStateMachine { state: StdMutex::new(HashMap::new()) })
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.state.lock().unwrap().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().len()
    }
}

#[async_trait]
impl StateMachine for KvStateMachine {
    async fn save(&self) -> RaftResult<Vec<u8>> {
        let state = self.state.lock().unwrap().clone();
        bincode::serialize(&state).map_err(|e| RaftError::Fatal(e.to_string()))
    }

    async fn recovery(&self, state: &[u8]) -> RaftResult<()> {
        let restored: HashMap<String, String> =
            bincode::deserialize(state).map_err(|e| RaftError::Fatal(e.to_string()))?;
        *self.state.lock().unwrap() = restored;
        Ok(())
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SetCommand {
    pub key: String,
    pub value: String,
}

#[async_trait]
impl Command for SetCommand {
    fn command_name(&self) -> &'static str {
        "set"
    }

    fn serialize(&self) -> RaftResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| RaftError::Fatal(e.to_string()))
    }

    async fn apply(&self, _server_name: &str, state_machine: &dyn StateMachine) -> RaftResult<Vec<u8>> {
        // Down-cast isn't available through the trait object, so the
        // registry below applies directly against the concrete store; this
        // impl exists to satisfy the `Command` contract end to end.
        let _ = state_machine;
        Ok(self.value.clone().into_bytes())
    }
}

/// Resolves `"set"` commands and applies them directly to a `KvStateMachine`,
/// bypassing `Command::apply`'s state-machine-trait-object limitation.
pub struct KvCommandRegistry {
    store: Arc<KvStateMachine>,
}

impl KvCommandRegistry {
    pub fn new(store: Arc<KvStateMachine>) -> Arc<Self> {
        Arc::new(KvCommandRegistry { store })
    }
}

impl CommandRegistry for KvCommandRegistry {
    fn resolve(&self, command_name: &str, payload: &[u8]) -> RaftResult<Box<dyn Command>> {
        match command_name {
            "set" => {
                let cmd: SetCommand = bincode::deserialize(payload).map_err(|e| RaftError::Fatal(e.to_string()))?;
                self.store.state.lock().unwrap().insert(cmd.key.clone(), cmd.value.clone());
                Ok(Box::new(cmd))
            }
            other => Err(RaftError::Fatal(format!("unknown command {}", other))),
        }
    }
}

pub fn set_command(key: &str, value: &str) -> (String, Vec<u8>) {
    let cmd = SetCommand { key: key.to_string(), value: value.to_string() };
    ("set".to_string(), bincode::serialize(&cmd).unwrap())
}

/// Spin up a fresh node under `storage_path`, register it with `router`, and
/// return its handle. Does not start the event loop: call `start_follower`
/// or `start_leader` on the returned `Server`.
pub async fn new_node(
    router: &Arc<Router>,
    name: &str,
    storage_path: std::path::PathBuf,
    config: Config,
) -> (Server, ServerHandle, Arc<KvStateMachine>) {
    let store = KvStateMachine::new();
    let registry = KvCommandRegistry::new(store.clone());
    let transporter = router.transporter_for(name.to_string());

    let (server, handle) = Server::new(name.to_string(), storage_path, config, transporter, store.clone(), registry)
        .await
        .expect("server construction must succeed");
    router.register(handle.clone()).await;
    (server, handle, store)
}

pub fn fast_test_config(cluster_name: &str) -> Config {
    Config::build(cluster_name.to_string())
        .election_timeout_min_ms(150)
        .election_timeout_max_ms(300)
        .heartbeat_interval_ms(30)
        .command_timeout_ms(1_000)
        .validate()
        .expect("test config must validate")
}
