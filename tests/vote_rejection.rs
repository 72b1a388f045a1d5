//! S6: a candidate whose log is behind the receiver's is rejected, even
//! though the receiver still adopts the candidate's higher term.

mod fixtures;

use fixtures::fast_test_config;
use fixtures::new_node;
use fixtures::Router;
use raft_core::log::LogEntry;
use raft_core::AppendEntriesRequest;
use raft_core::RequestVoteRequest;

fn fabricated_entry(index: u64, term: u64) -> LogEntry {
    LogEntry {
        index,
        term,
        command_name: "noop".to_string(),
        command: vec![],
        commit_signal: std::sync::Arc::new(tokio::sync::Notify::new()),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn candidate_with_older_log_term_is_rejected_but_bumps_receiver_term() {
    fixtures::init_tracing();

    let dir = tempfile::tempdir().unwrap();
    let router = Router::new();
    let config = fast_test_config("vote-rejection");
    let (server, handle, _store) = new_node(&router, "receiver", dir.path().join("receiver"), config).await;
    server.start_follower();

    // Seed the receiver's log: 5 entries, last at term 3 (lastLogIndex=5, lastLogTerm=3).
    let seed = AppendEntriesRequest {
        term: 3,
        leader_name: "fake-leader".to_string(),
        prev_log_index: 0,
        prev_log_term: 0,
        entries: vec![
            fabricated_entry(1, 1),
            fabricated_entry(2, 1),
            fabricated_entry(3, 2),
            fabricated_entry(4, 2),
            fabricated_entry(5, 3),
        ],
        commit_index: 0,
    };
    let seed_resp = handle.append_entries(seed).await.unwrap();
    assert!(seed_resp.success);
    assert_eq!(handle.metrics().borrow().current_term, 3);

    // Candidate at a higher term, but a less up-to-date log.
    let vote_req = RequestVoteRequest {
        term: 10,
        candidate_name: "candidate".to_string(),
        last_log_index: 5,
        last_log_term: 2,
    };
    let vote_resp = handle.request_vote(vote_req).await.unwrap();

    assert!(!vote_resp.vote_granted);
    assert_eq!(vote_resp.term, 10);
    assert_eq!(handle.metrics().borrow().current_term, 10);

    handle.stop().await;
}
