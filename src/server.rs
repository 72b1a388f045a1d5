//! The consensus actor (§4.4-§4.10): role state, the event loop, and the
//! public handle used to drive it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tokio::time::Duration;
use tokio::time::Instant;

use crate::config::Config;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::log::Log;
use crate::metrics::RaftMetrics;
use crate::network::CommandRegistry;
use crate::network::StateMachine;
use crate::network::Transporter;
use crate::peer::Peer;
use crate::rpc::AppendEntriesRequest;
use crate::rpc::AppendEntriesResponse;
use crate::rpc::RequestVoteRequest;
use crate::rpc::RequestVoteResponse;
use crate::rpc::SnapshotRequest;
use crate::rpc::SnapshotResponse;
use crate::snapshot::Snapshot;

/// The four states a server may occupy (§4.4). `Stopped` is both the
/// initial and terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
    Stopped,
}

/// The tagged variant delivered on a `Server`'s single event channel (§9).
///
/// Every variant that expects a reply carries a one-shot reply channel
/// rather than a handle back into the `Server`, so producers (peers,
/// `ServerHandle` callers, the maintenance ticker) never need anything more
/// than a `Sender<Event>` clone.
pub enum Event {
    Stop,
    Command {
        command_name: String,
        command: Vec<u8>,
        reply: oneshot::Sender<RaftResult<Vec<u8>>>,
    },
    AppendEntriesRequest {
        req: AppendEntriesRequest,
        reply: oneshot::Sender<AppendEntriesResponse>,
    },
    AppendEntriesResponse(AppendEntriesResponse),
    RequestVoteRequest {
        req: RequestVoteRequest,
        reply: oneshot::Sender<RequestVoteResponse>,
    },
    RequestVoteResponse(RequestVoteResponse),
    SnapshotRequest {
        req: SnapshotRequest,
        reply: oneshot::Sender<SnapshotResponse>,
    },
    AddPeer {
        name: String,
        reply: oneshot::Sender<RaftResult<()>>,
    },
    RemovePeer {
        name: String,
        reply: oneshot::Sender<RaftResult<()>>,
    },
    /// Fired by the background snapshot ticker (§5); every role loop checks
    /// whether enough has accumulated since the last snapshot to justify
    /// another `takeSnapshot` attempt.
    MaintenanceTick,
}

/// A cheaply-cloneable entry point into a running `Server`. This is the only
/// thing callers outside the event loop ever hold.
#[derive(Clone)]
pub struct ServerHandle {
    name: String,
    event_tx: mpsc::Sender<Event>,
    metrics_rx: watch::Receiver<RaftMetrics>,
    task: Arc<std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl ServerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submit a client command (§4.8). Resolves once the entry commits (or
    /// the 1-second default deadline expires with `CommandTimeout`) on a
    /// server currently believed to be leader.
    pub async fn do_command(&self, command_name: String, command: Vec<u8>) -> RaftResult<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.event_tx
            .send(Event::Command { command_name, command, reply })
            .await
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    pub async fn append_entries(&self, req: AppendEntriesRequest) -> RaftResult<AppendEntriesResponse> {
        let (reply, rx) = oneshot::channel();
        self.event_tx
            .send(Event::AppendEntriesRequest { req, reply })
            .await
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    pub async fn request_vote(&self, req: RequestVoteRequest) -> RaftResult<RequestVoteResponse> {
        let (reply, rx) = oneshot::channel();
        self.event_tx
            .send(Event::RequestVoteRequest { req, reply })
            .await
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    pub async fn install_snapshot(&self, req: SnapshotRequest) -> RaftResult<SnapshotResponse> {
        let (reply, rx) = oneshot::channel();
        self.event_tx
            .send(Event::SnapshotRequest { req, reply })
            .await
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    pub async fn add_peer(&self, name: String) -> RaftResult<()> {
        let (reply, rx) = oneshot::channel();
        self.event_tx
            .send(Event::AddPeer { name, reply })
            .await
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    pub async fn remove_peer(&self, name: String) -> RaftResult<()> {
        let (reply, rx) = oneshot::channel();
        self.event_tx
            .send(Event::RemovePeer { name, reply })
            .await
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    /// Subscribe to this server's metrics broadcast.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.metrics_rx.clone()
    }

    /// Enqueue the stop sentinel (§5) and wait for the event loop's task to
    /// actually finish, matching the teacher's `Raft::shutdown` awaiting its
    /// `raft_handle`. A no-op if the server was never started.
    pub async fn stop(&self) {
        let _ = self.event_tx.send(Event::Stop).await;
        let handle = self.task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// The consensus actor itself. Consumed by `start_follower`/`start_leader`,
/// which hand it to a dedicated task; from then on it is driven exclusively
/// by its own event loop (the single-writer invariant, §5).
pub struct Server {
    name: String,
    storage_path: PathBuf,
    role: Role,
    current_term: u64,
    voted_for: Option<String>,
    leader: Option<String>,
    log: Arc<RwLock<Log>>,
    peers: HashMap<String, Peer>,
    event_tx: mpsc::Sender<Event>,
    event_rx: mpsc::Receiver<Event>,
    config: Config,
    transporter: Arc<dyn Transporter>,
    state_machine: Arc<dyn StateMachine>,
    command_registry: Arc<dyn CommandRegistry>,
    metrics_tx: watch::Sender<RaftMetrics>,
    snapshot_in_progress: bool,
    last_snapshot: Option<(u64, u64)>,
    maintenance_ticker: Option<tokio::task::JoinHandle<()>>,
    task: Arc<std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl Server {
    /// Open (or create) storage under `storage_path`, restoring from the
    /// latest on-disk snapshot if one exists (§4.10 `loadSnapshot`), and
    /// return the actor plus a handle to it. The actor still needs
    /// `start_follower` or `start_leader` to begin running.
    #[tracing::instrument(level = "info", skip(config, transporter, state_machine, command_registry))]
    pub async fn new(
        name: String,
        storage_path: PathBuf,
        config: Config,
        transporter: Arc<dyn Transporter>,
        state_machine: Arc<dyn StateMachine>,
        command_registry: Arc<dyn CommandRegistry>,
    ) -> RaftResult<(Server, ServerHandle)> {
        std::fs::create_dir_all(&storage_path)?;
        let mut log = Log::open(storage_path.join("log"))?;
        let mut current_term = log.current_term();
        let mut peers = HashMap::new();
        let mut last_snapshot = None;

        if let Some(snapshot) = Snapshot::load_latest(&storage_path)? {
            state_machine.recovery(&snapshot.state).await?;
            log.restore_compaction_point(snapshot.last_index, snapshot.last_term);
            if snapshot.last_term > current_term {
                current_term = snapshot.last_term;
            }
            for peer_name in &snapshot.peers {
                if peer_name != &name {
                    peers.insert(peer_name.clone(), Peer::new(peer_name.clone(), config.heartbeat_interval_ms));
                }
            }
            last_snapshot = Some((snapshot.last_term, snapshot.last_index));
        }

        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity);
        let (metrics_tx, metrics_rx) = watch::channel(RaftMetrics::new(name.clone()));
        let task = Arc::new(std::sync::Mutex::new(None));

        let server = Server {
            name: name.clone(),
            storage_path,
            role: Role::Stopped,
            current_term,
            voted_for: None,
            leader: None,
            log: Arc::new(RwLock::new(log)),
            peers,
            event_tx: event_tx.clone(),
            event_rx,
            config,
            transporter,
            state_machine,
            command_registry,
            metrics_tx,
            snapshot_in_progress: false,
            last_snapshot,
            maintenance_ticker: None,
            task: task.clone(),
        };

        let handle = ServerHandle { name, event_tx, metrics_rx, task };
        Ok((server, handle))
    }

    /// `Stopped → Follower` (§4.4). Spawns the event loop on a dedicated task
    /// and stashes the `JoinHandle` where `ServerHandle::stop` can await it.
    pub fn start_follower(mut self) {
        self.role = Role::Follower;
        let task = self.task.clone();
        let handle = tokio::spawn(async move { self.run().await });
        *task.lock().unwrap() = Some(handle);
    }

    /// `Stopped → Leader`, single-node bootstrap only (§4.4, §9): refuses if
    /// any peer is already configured, since incrementing the term with no
    /// vote round is only safe when there is nobody else to disagree with.
    pub fn start_leader(mut self) -> RaftResult<()> {
        if !self.peers.is_empty() {
            return Err(RaftError::NotSingleNode);
        }
        self.current_term += 1;
        self.role = Role::Leader;
        let task = self.task.clone();
        let handle = tokio::spawn(async move { self.run().await });
        *task.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    async fn run(mut self) {
        let ticker_tx = self.event_tx.clone();
        let interval_secs = self.config.snapshot_interval_secs.max(1);
        self.maintenance_ticker = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                if ticker_tx.send(Event::MaintenanceTick).await.is_err() {
                    break;
                }
            }
        }));

        loop {
            self.publish_metrics().await;
            match self.role {
                Role::Follower => self.run_follower().await,
                Role::Candidate => self.run_candidate().await,
                Role::Leader => self.run_leader().await,
                Role::Stopped => break,
            }
        }
        if let Some(ticker) = self.maintenance_ticker.take() {
            ticker.abort();
        }
        self.publish_metrics().await;
    }

    async fn publish_metrics(&self) {
        let log = self.log.read().await;
        let metrics = RaftMetrics {
            name: self.name.clone(),
            role: self.role,
            current_term: self.current_term,
            last_log_index: log.last_index(),
            last_applied: log.commit_index(),
            leader: self.leader.clone(),
        };
        let _ = self.metrics_tx.send(metrics);
    }

    /// Uniform term-adoption rule used by every RPC handler and role loop (§4.7).
    fn adopt_term(&mut self, term: u64, leader_name: Option<String>, from_append: bool) {
        if term > self.current_term {
            self.role = Role::Follower;
            self.current_term = term;
            self.leader = leader_name;
            self.voted_for = None;
        } else if term == self.current_term && self.role == Role::Candidate && from_append {
            self.role = Role::Follower;
            self.leader = leader_name;
        }
    }

    /// §4.5: returns the response plus whether the caller's election timer
    /// should be re-armed.
    async fn handle_append_entries(&mut self, req: AppendEntriesRequest) -> (AppendEntriesResponse, bool) {
        if req.term < self.current_term {
            let index = self.log.read().await.commit_index();
            return (AppendEntriesResponse { term: self.current_term, success: false, index }, false);
        }

        self.adopt_term(req.term, Some(req.leader_name.clone()), true);

        {
            let mut log = self.log.write().await;
            if log.truncate(req.prev_log_index, req.prev_log_term).is_err() {
                let index = log.commit_index();
                return (AppendEntriesResponse { term: self.current_term, success: false, index }, true);
            }
            if log.append_entries(req.entries).is_err() {
                let index = log.commit_index();
                return (AppendEntriesResponse { term: self.current_term, success: false, index }, true);
            }
        }

        if self.apply_commit_index(req.commit_index).await.is_err() {
            let index = self.log.read().await.commit_index();
            return (AppendEntriesResponse { term: self.current_term, success: false, index }, true);
        }

        let index = self.log.read().await.commit_index();
        (AppendEntriesResponse { term: self.current_term, success: true, index }, true)
    }

    /// §4.6: returns the response plus whether the caller's election timer
    /// should be re-armed.
    async fn handle_vote_request(&mut self, req: RequestVoteRequest) -> (RequestVoteResponse, bool) {
        if req.term < self.current_term {
            return (RequestVoteResponse { term: self.current_term, vote_granted: false }, false);
        }

        self.adopt_term(req.term, None, false);

        if let Some(voted) = &self.voted_for {
            if voted != &req.candidate_name {
                return (RequestVoteResponse { term: self.current_term, vote_granted: false }, false);
            }
        }

        let (last_index, last_term) = self.log.read().await.last_info();
        let candidate_is_stale =
            last_term > req.last_log_term || (last_term == req.last_log_term && last_index > req.last_log_index);
        if candidate_is_stale {
            return (RequestVoteResponse { term: self.current_term, vote_granted: false }, false);
        }

        self.voted_for = Some(req.candidate_name.clone());
        (RequestVoteResponse { term: self.current_term, vote_granted: true }, true)
    }

    /// Runs the committed-entry apply pipeline by resolving each entry's
    /// command through the registry and applying it to the state machine
    /// (§4.1, §4.5 step 5).
    async fn apply_commit_index(&mut self, target: u64) -> RaftResult<()> {
        let state_machine = self.state_machine.clone();
        let registry = self.command_registry.clone();
        let name = self.name.clone();
        let mut log = self.log.write().await;
        log.set_commit_index(target, move |entry| {
            let state_machine = state_machine.clone();
            let registry = registry.clone();
            let name = name.clone();
            let command_name = entry.command_name.clone();
            let payload = entry.command.clone();
            async move {
                let command = registry.resolve(&command_name, &payload)?;
                command.apply(&name, state_machine.as_ref()).await
            }
        })
        .await
    }

    /// §4.8, leader only: append, wait for commit (or time out), reply.
    async fn handle_command(&mut self, command_name: String, command: Vec<u8>, reply: oneshot::Sender<RaftResult<Vec<u8>>>) {
        if self.role != Role::Leader {
            let _ = reply.send(Err(RaftError::NotLeader(self.leader.clone())));
            return;
        }

        let entry = {
            let log = self.log.read().await;
            log.create_entry(self.current_term, command_name, command)
        };
        let commit_signal = entry.commit_signal.clone();
        let index = entry.index;

        {
            let mut log = self.log.write().await;
            if let Err(err) = log.append_entry(entry) {
                let _ = reply.send(Err(err));
                return;
            }
        }

        // The leader implicitly acknowledges its own entries so commit-count
        // accounting treats it as one of the quorum (§4.8 step 3).
        let self_ack = AppendEntriesResponse { term: self.current_term, success: true, index };
        if self.event_tx.try_send(Event::AppendEntriesResponse(self_ack)).is_err() {
            tracing::warn!(name = %self.name, "event channel full, dropping self-ack for index {}", index);
        }

        let log = self.log.clone();
        let deadline_ms = self.config.command_timeout_ms;
        let name = self.name.clone();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(Duration::from_millis(deadline_ms), commit_signal.notified()).await {
                Ok(()) => {
                    let log = log.read().await;
                    match log.get_entry_result(index) {
                        Some(Ok(bytes)) => Ok(bytes.clone()),
                        Some(Err(msg)) => Err(RaftError::ApplyFailed(msg.clone())),
                        None => Err(RaftError::Fatal(format!("{}: missing apply result for committed index {}", name, index))),
                    }
                }
                Err(_) => Err(RaftError::CommandTimeout),
            };
            let _ = reply.send(result);
        });
    }

    /// §4.9, leader only.
    async fn handle_append_entries_response(&mut self, resp: AppendEntriesResponse, commit_count: &mut usize) {
        if resp.term > self.current_term {
            self.adopt_term(resp.term, None, false);
            return;
        }
        if !resp.success {
            return;
        }

        *commit_count += 1;
        let quorum = self.quorum();
        if *commit_count < quorum {
            return;
        }

        let mut indices: Vec<u64> = self.peers.values().map(|p| p.prev_log_index()).collect();
        let (last_index, commit_index) = {
            let log = self.log.read().await;
            (log.last_index(), log.commit_index())
        };
        indices.push(last_index);
        indices.sort_unstable_by(|a, b| b.cmp(a));

        let n = indices[(quorum - 1).min(indices.len() - 1)];
        if n > commit_index {
            if let Err(err) = self.apply_commit_index(n).await {
                tracing::error!(name = %self.name, error = %err, "fatal error applying committed entries");
            }
        }
    }

    /// §4.10 `snapshotRecovery`: installs a leader-sent snapshot on a
    /// follower that has fallen too far behind for normal replication.
    async fn handle_install_snapshot(&mut self, req: SnapshotRequest) -> SnapshotResponse {
        if req.term < self.current_term {
            let commit_index = self.log.read().await.commit_index();
            return SnapshotResponse { term: self.current_term, success: false, commit_index };
        }

        self.adopt_term(req.term, Some(req.leader_name.clone()), true);

        if let Err(err) = self.state_machine.recovery(&req.state).await {
            tracing::warn!(name = %self.name, error = %err, "state machine recovery from installed snapshot failed");
            let commit_index = self.log.read().await.commit_index();
            return SnapshotResponse { term: self.current_term, success: false, commit_index };
        }

        let existing: Vec<String> = self.peers.keys().cloned().collect();
        for peer_name in existing {
            if let Some(mut peer) = self.peers.remove(&peer_name) {
                peer.stop_heartbeat().await;
            }
        }
        for peer_name in &req.peers {
            if peer_name != &self.name {
                self.peers
                    .insert(peer_name.clone(), Peer::new(peer_name.clone(), self.config.heartbeat_interval_ms));
            }
        }

        {
            let mut log = self.log.write().await;
            log.fast_forward_after_snapshot(req.last_index, req.last_term);
        }

        let snapshot = Snapshot::new(req.last_index, req.last_term, req.peers.clone(), req.state.clone());
        match snapshot.save(&self.storage_path) {
            Ok(_) => {
                if let Err(err) = Snapshot::prune_all_but(&self.storage_path, req.last_term, req.last_index) {
                    tracing::warn!(name = %self.name, error = %err, "failed to prune stale snapshots");
                }
                self.last_snapshot = Some((req.last_term, req.last_index));
            }
            Err(err) => tracing::warn!(name = %self.name, error = %err, "failed to persist installed snapshot"),
        }

        SnapshotResponse { term: self.current_term, success: true, commit_index: req.last_index }
    }

    async fn maybe_take_snapshot(&mut self) {
        let commit_index = self.log.read().await.commit_index();
        let last = self.last_snapshot.map(|(_, index)| index).unwrap_or(0);
        if commit_index.saturating_sub(last) < self.config.snapshot_entry_threshold {
            return;
        }
        if let Err(err) = self.take_snapshot().await {
            tracing::warn!(name = %self.name, error = %err, "background snapshot attempt failed");
        }
    }

    /// §4.10 `takeSnapshot`. Refuses (silently, as a no-op) if one is
    /// already running.
    async fn take_snapshot(&mut self) -> RaftResult<()> {
        if self.snapshot_in_progress {
            return Ok(());
        }
        self.snapshot_in_progress = true;
        let result = self.take_snapshot_inner().await;
        self.snapshot_in_progress = false;
        result
    }

    async fn take_snapshot_inner(&mut self) -> RaftResult<()> {
        let (last_index, last_term) = {
            let log = self.log.read().await;
            let last_index = log.commit_index();
            let last_term = log.term_at(last_index).unwrap_or(0);
            (last_index, last_term)
        };
        if last_index == 0 || last_term == 0 {
            return Err(RaftError::Fatal("takeSnapshot requires a non-empty committed log".into()));
        }

        let state = self.state_machine.save().await?;
        let mut peers: Vec<String> = self.peers.keys().cloned().collect();
        peers.push(self.name.clone());

        let snapshot = Snapshot::new(last_index, last_term, peers, state);
        snapshot.save(&self.storage_path)?;

        {
            let mut log = self.log.write().await;
            log.compact(last_index, last_term)?;
        }

        Snapshot::prune_all_but(&self.storage_path, last_term, last_index)?;
        self.last_snapshot = Some((last_term, last_index));
        Ok(())
    }

    async fn handle_add_peer(&mut self, name: String) -> RaftResult<()> {
        if name == self.name || self.peers.contains_key(&name) {
            return Err(RaftError::DuplicatePeer(name));
        }
        let mut peer = Peer::new(name.clone(), self.config.heartbeat_interval_ms);
        if self.role == Role::Leader {
            let last_index = self.log.read().await.last_index();
            peer.set_prev_log_index(last_index);
            peer.start_heartbeat(
                self.current_term,
                self.name.clone(),
                self.log.clone(),
                self.transporter.clone(),
                self.event_tx.clone(),
            );
        }
        self.peers.insert(name, peer);
        Ok(())
    }

    async fn handle_remove_peer(&mut self, name: String) -> RaftResult<()> {
        if let Some(mut peer) = self.peers.remove(&name) {
            peer.stop_heartbeat().await;
        }
        Ok(())
    }

    async fn stop_all_heartbeats(&mut self) {
        for peer in self.peers.values_mut() {
            peer.stop_heartbeat().await;
        }
    }

    /// §4.4 follower loop.
    async fn run_follower(&mut self) {
        tracing::debug!(name = %self.name, term = self.current_term, "entering follower role");
        let mut deadline = Box::pin(sleep(Duration::from_millis(self.config.new_rand_election_timeout())));

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    self.role = Role::Candidate;
                    return;
                }
                event = self.event_rx.recv() => {
                    let event = match event {
                        Some(e) => e,
                        None => { self.role = Role::Stopped; return; }
                    };
                    match event {
                        Event::Stop => { self.role = Role::Stopped; return; }
                        Event::MaintenanceTick => { self.maybe_take_snapshot().await; }
                        Event::AddPeer { name, reply } => { let _ = reply.send(self.handle_add_peer(name).await); }
                        Event::RemovePeer { name, reply } => { let _ = reply.send(self.handle_remove_peer(name).await); }
                        Event::Command { reply, .. } => {
                            let _ = reply.send(Err(RaftError::NotLeader(self.leader.clone())));
                        }
                        Event::AppendEntriesRequest { req, reply } => {
                            let (resp, changed) = self.handle_append_entries(req).await;
                            let _ = reply.send(resp);
                            if changed {
                                deadline.as_mut().reset(Instant::now() + Duration::from_millis(self.config.new_rand_election_timeout()));
                            }
                        }
                        Event::RequestVoteRequest { req, reply } => {
                            let (resp, changed) = self.handle_vote_request(req).await;
                            let _ = reply.send(resp);
                            if changed {
                                deadline.as_mut().reset(Instant::now() + Duration::from_millis(self.config.new_rand_election_timeout()));
                            }
                        }
                        Event::SnapshotRequest { req, reply } => {
                            let resp = self.handle_install_snapshot(req).await;
                            let _ = reply.send(resp);
                            deadline.as_mut().reset(Instant::now() + Duration::from_millis(self.config.new_rand_election_timeout()));
                        }
                        Event::AppendEntriesResponse(_) | Event::RequestVoteResponse(_) => {}
                    }
                }
            }
        }
    }

    /// §4.4 candidate loop.
    async fn run_candidate(&mut self) {
        self.leader = None;

        loop {
            self.current_term += 1;
            self.voted_for = Some(self.name.clone());
            let mut votes_granted: usize = 1;
            let quorum = self.quorum();
            tracing::debug!(name = %self.name, term = self.current_term, "starting election");

            if votes_granted >= quorum {
                self.role = Role::Leader;
                return;
            }

            let (last_index, last_term) = self.log.read().await.last_info();
            for peer in self.peers.values() {
                let req = RequestVoteRequest {
                    term: self.current_term,
                    candidate_name: self.name.clone(),
                    last_log_index: last_index,
                    last_log_term: last_term,
                };
                peer.send_vote_request(req, self.transporter.clone(), self.event_tx.clone());
            }

            let mut deadline = Box::pin(sleep(Duration::from_millis(self.config.new_rand_election_timeout())));
            let mut restart = false;

            loop {
                tokio::select! {
                    _ = &mut deadline => { restart = true; break; }
                    event = self.event_rx.recv() => {
                        let event = match event {
                            Some(e) => e,
                            None => { self.role = Role::Stopped; return; }
                        };
                        match event {
                            Event::Stop => { self.role = Role::Stopped; return; }
                            Event::MaintenanceTick => { self.maybe_take_snapshot().await; }
                            Event::AddPeer { name, reply } => { let _ = reply.send(self.handle_add_peer(name).await); }
                            Event::RemovePeer { name, reply } => { let _ = reply.send(self.handle_remove_peer(name).await); }
                            Event::Command { reply, .. } => {
                                let _ = reply.send(Err(RaftError::NotLeader(None)));
                            }
                            Event::RequestVoteResponse(resp) => {
                                if resp.term > self.current_term {
                                    self.adopt_term(resp.term, None, false);
                                    return;
                                }
                                if resp.vote_granted && resp.term == self.current_term {
                                    votes_granted += 1;
                                    if votes_granted >= quorum {
                                        self.role = Role::Leader;
                                        return;
                                    }
                                }
                            }
                            Event::AppendEntriesRequest { req, reply } => {
                                let (resp, _changed) = self.handle_append_entries(req).await;
                                let _ = reply.send(resp);
                                if self.role != Role::Candidate { return; }
                            }
                            Event::RequestVoteRequest { req, reply } => {
                                let (resp, _changed) = self.handle_vote_request(req).await;
                                let _ = reply.send(resp);
                                if self.role != Role::Candidate { return; }
                            }
                            Event::SnapshotRequest { req, reply } => {
                                let resp = self.handle_install_snapshot(req).await;
                                let _ = reply.send(resp);
                                if self.role != Role::Candidate { return; }
                            }
                            Event::AppendEntriesResponse(_) => {}
                        }
                    }
                }
            }

            if restart {
                continue;
            }
        }
    }

    /// §4.4 leader loop.
    async fn run_leader(&mut self) {
        tracing::info!(name = %self.name, term = self.current_term, "became leader");
        let mut commit_count: usize = 0;

        let last_index = self.log.read().await.last_index();
        let peer_names: Vec<String> = self.peers.keys().cloned().collect();
        for peer_name in &peer_names {
            if let Some(peer) = self.peers.get_mut(peer_name) {
                peer.set_prev_log_index(last_index);
                peer.start_heartbeat(
                    self.current_term,
                    self.name.clone(),
                    self.log.clone(),
                    self.transporter.clone(),
                    self.event_tx.clone(),
                );
            }
        }

        loop {
            let event = match self.event_rx.recv().await {
                Some(e) => e,
                None => {
                    self.stop_all_heartbeats().await;
                    self.role = Role::Stopped;
                    return;
                }
            };
            match event {
                Event::Stop => {
                    self.stop_all_heartbeats().await;
                    self.role = Role::Stopped;
                    return;
                }
                Event::MaintenanceTick => self.maybe_take_snapshot().await,
                Event::AddPeer { name, reply } => {
                    let _ = reply.send(self.handle_add_peer(name).await);
                }
                Event::RemovePeer { name, reply } => {
                    let _ = reply.send(self.handle_remove_peer(name).await);
                }
                Event::Command { command_name, command, reply } => {
                    self.handle_command(command_name, command, reply).await;
                }
                Event::AppendEntriesResponse(resp) => {
                    self.handle_append_entries_response(resp, &mut commit_count).await;
                    if self.role != Role::Leader {
                        self.stop_all_heartbeats().await;
                        return;
                    }
                }
                Event::AppendEntriesRequest { req, reply } => {
                    let (resp, _changed) = self.handle_append_entries(req).await;
                    let _ = reply.send(resp);
                    if self.role != Role::Leader {
                        self.stop_all_heartbeats().await;
                        return;
                    }
                }
                Event::RequestVoteRequest { req, reply } => {
                    let (resp, _changed) = self.handle_vote_request(req).await;
                    let _ = reply.send(resp);
                    if self.role != Role::Leader {
                        self.stop_all_heartbeats().await;
                        return;
                    }
                }
                Event::SnapshotRequest { req, reply } => {
                    let resp = self.handle_install_snapshot(req).await;
                    let _ = reply.send(resp);
                    if self.role != Role::Leader {
                        self.stop_all_heartbeats().await;
                        return;
                    }
                }
                Event::RequestVoteResponse(_) => {}
            }
        }
    }
}
