//! Per-remote-member replication controller: heartbeat + log catch-up (§4.3).

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::log::Log;
use crate::network::Transporter;
use crate::rpc::AppendEntriesRequest;
use crate::rpc::RequestVoteRequest;
use crate::server::Event;

/// A single cluster peer as seen by the leader replicating to it.
///
/// Exclusively owned by its `Server`; the heartbeat task below receives only
/// an inbound-event sender handle and a read-only handle to the `Log` — a
/// capability, not a back-reference to the owning `Server` — so that no
/// cyclic ownership is ever formed (§9).
pub struct Peer {
    name: String,
    /// Highest index believed replicated on this peer. Shared so the
    /// `Server`'s commit-index computation (§4.9) can read it without going
    /// through the heartbeat task.
    prev_log_index: Arc<AtomicU64>,
    heartbeat_interval_ms: Arc<AtomicU64>,
    stop: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl Peer {
    pub fn new(name: String, heartbeat_interval_ms: u64) -> Self {
        Peer {
            name,
            prev_log_index: Arc::new(AtomicU64::new(0)),
            heartbeat_interval_ms: Arc::new(AtomicU64::new(heartbeat_interval_ms)),
            stop: Arc::new(Notify::new()),
            handle: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prev_log_index(&self) -> u64 {
        self.prev_log_index.load(Ordering::SeqCst)
    }

    pub fn set_prev_log_index(&self, index: u64) {
        self.prev_log_index.store(index, Ordering::SeqCst);
    }

    pub fn set_heartbeat_timeout(&self, period_ms: u64) {
        self.heartbeat_interval_ms.store(period_ms, Ordering::SeqCst);
    }

    /// Spawn the heartbeat ticker for this peer under `term`/`leader_name`,
    /// against `log` (read-only) and `transporter` (§4.3, §5).
    #[tracing::instrument(level = "debug", skip(self, log, transporter, event_tx))]
    pub fn start_heartbeat(
        &mut self,
        term: u64,
        leader_name: String,
        log: Arc<RwLock<Log>>,
        transporter: Arc<dyn Transporter>,
        event_tx: mpsc::Sender<Event>,
    ) {
        if self.handle.is_some() {
            return;
        }

        let peer_name = self.name.clone();
        let prev_log_index = self.prev_log_index.clone();
        let heartbeat_interval_ms = self.heartbeat_interval_ms.clone();
        let stop = self.stop.clone();

        let handle = tokio::spawn(async move {
            loop {
                let period = heartbeat_interval_ms.load(Ordering::SeqCst);
                tokio::select! {
                    _ = stop.notified() => break,
                    _ = tokio::time::sleep(Duration::from_millis(period)) => {}
                }

                let prev_index = prev_log_index.load(Ordering::SeqCst);
                let (prev_term, entries, commit_index, start_index) = {
                    let log = log.read().await;
                    let prev_term = log.term_at(prev_index).unwrap_or_else(|| log.start_term());
                    (prev_term, log.entries_after(prev_index), log.commit_index(), log.start_index())
                };
                let sent = entries.len() as u64;

                let req = AppendEntriesRequest {
                    term,
                    leader_name: leader_name.clone(),
                    prev_log_index: prev_index,
                    prev_log_term: prev_term,
                    entries,
                    commit_index,
                };

                match transporter.send_append_entries(&peer_name, req).await {
                    Ok(resp) => {
                        if resp.success {
                            prev_log_index.store(prev_index + sent, Ordering::SeqCst);
                        } else if resp.term <= term {
                            // Genuine log inconsistency, not a stale-term rejection:
                            // retreat by one and let the next tick retry (§4.3). The
                            // retreat is bounded by the compacted prefix: below that
                            // point the log no longer has the entries this peer
                            // needs, and catching it up requires a snapshot transfer
                            // instead of further AppendEntries retries.
                            let retreated = prev_index.saturating_sub(1).max(start_index);
                            prev_log_index.store(retreated, Ordering::SeqCst);
                            if retreated <= start_index {
                                tracing::warn!(
                                    peer = %peer_name,
                                    start_index,
                                    "peer has fallen behind the compacted log prefix; a snapshot transfer is needed to catch it up"
                                );
                            }
                        }
                        if event_tx.try_send(Event::AppendEntriesResponse(resp)).is_err() {
                            tracing::debug!(peer = %peer_name, "event channel full, dropping heartbeat response");
                        }
                    }
                    Err(err) => {
                        tracing::debug!(peer = %peer_name, error = %err, "append entries transport failure");
                    }
                }
            }
        });

        self.handle = Some(handle);
    }

    /// Signal the heartbeat task to exit and wait for it. Idempotent (§4.3, §5).
    pub async fn stop_heartbeat(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.stop.notify_one();
            let _ = handle.await;
        }
    }

    /// Dispatch a `RequestVoteRequest` and forward the response as an event
    /// on `event_tx`. Independent of the heartbeat loop (§4.3).
    pub fn send_vote_request(&self, req: RequestVoteRequest, transporter: Arc<dyn Transporter>, event_tx: mpsc::Sender<Event>) {
        let peer_name = self.name.clone();
        tokio::spawn(async move {
            match transporter.send_vote_request(&peer_name, req).await {
                Ok(resp) => {
                    let _ = event_tx.send(Event::RequestVoteResponse(resp)).await;
                }
                Err(err) => {
                    tracing::debug!(peer = %peer_name, error = %err, "vote request transport failure");
                }
            }
        });
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop.notify_one();
        }
    }
}
