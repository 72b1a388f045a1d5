//! The durable, ordered log of commands plus the apply pipeline (§4.1).

use std::fs::File;
use std::fs::OpenOptions;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Notify;

use crate::error::LogError;
use crate::error::RaftResult;

/// An immutable record in the Raft log (§3).
///
/// `(index, term)` is globally unique: if two entries on any two servers
/// share an index and a term, their commands are identical (log-matching).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub command_name: String,
    pub command: Vec<u8>,

    /// A one-shot notifier the originating request waits on for this entry
    /// to commit. Signalled with `notify_one`, which buffers a single permit
    /// for whichever task calls `notified()` next, so the waiter can start
    /// polling strictly after the entry is appended without racing the
    /// commit. Never persisted or sent over the wire: entries replayed from
    /// disk or received from a peer get a fresh, unobserved notifier.
    #[serde(skip, default = "new_commit_signal")]
    pub commit_signal: Arc<Notify>,
}

fn new_commit_signal() -> Arc<Notify> {
    Arc::new(Notify::new())
}

impl PartialEq for LogEntry {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
            && self.term == other.term
            && self.command_name == other.command_name
            && self.command == other.command
    }
}

/// The wire/disk representation of a `LogEntry`: identical fields, minus the
/// transient `commit_signal`.
#[derive(Serialize, Deserialize)]
struct LogEntryRecord {
    index: u64,
    term: u64,
    command_name: String,
    command: Vec<u8>,
}

impl From<&LogEntry> for LogEntryRecord {
    fn from(e: &LogEntry) -> Self {
        LogEntryRecord {
            index: e.index,
            term: e.term,
            command_name: e.command_name.clone(),
            command: e.command.clone(),
        }
    }
}

impl From<LogEntryRecord> for LogEntry {
    fn from(r: LogEntryRecord) -> Self {
        LogEntry {
            index: r.index,
            term: r.term,
            command_name: r.command_name,
            command: r.command,
            commit_signal: new_commit_signal(),
        }
    }
}

/// The result of applying a single committed entry to the state machine.
///
/// Stored as `Result<Vec<u8>, String>` rather than `RaftResult<Vec<u8>>`
/// because apply errors must be retained for later retrieval by
/// `get_entry_result`, and `RaftError` is not required to be `Clone`.
pub type ApplyResult = Result<Vec<u8>, String>;

/// The append-only, term-tagged sequence of entries persisted to a single
/// file, with an in-memory mirror, a commit pointer, and an apply pipeline.
pub struct Log {
    path: PathBuf,
    file: File,

    /// In-memory mirror of every entry with `index > start_index`.
    entries: Vec<LogEntry>,
    /// Byte offset in `file` at which `entries[i]`'s record begins.
    offsets: Vec<u64>,

    /// The index immediately before the first entry in `entries`. Advances
    /// only via `compact`.
    start_index: u64,
    /// The term of the entry at `start_index` (or of the snapshot which
    /// covered it).
    start_term: u64,

    /// Highest index known to be committed.
    commit_index: u64,

    /// Apply results for every entry at or below `commit_index`, keyed by index.
    results: std::collections::HashMap<u64, ApplyResult>,
}

impl Log {
    /// Open or create the log file at `path`, replaying every record to
    /// rebuild the in-memory mirror. A malformed trailing record truncates
    /// the file at the last good offset and is reported as a warning, not
    /// a fatal error (§4.1, §7 `LogCorruption`).
    pub fn open<P: AsRef<Path>>(path: P) -> RaftResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new().create(true).read(true).write(true).open(&path)?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let mut entries = Vec::new();
        let mut offsets = Vec::new();
        let mut cursor = 0usize;
        let mut last_good_offset = 0u64;

        loop {
            if cursor == buf.len() {
                last_good_offset = cursor as u64;
                break;
            }
            if cursor + 4 > buf.len() {
                tracing::warn!(offset = cursor, "log has a truncated length header, discarding tail");
                break;
            }
            let len = u32::from_le_bytes(buf[cursor..cursor + 4].try_into().unwrap()) as usize;
            let body_start = cursor + 4;
            let body_end = body_start + len;
            if body_end > buf.len() {
                tracing::warn!(offset = cursor, "log has a truncated record, discarding tail");
                break;
            }
            match bincode::deserialize::<LogEntryRecord>(&buf[body_start..body_end]) {
                Ok(record) => {
                    offsets.push(cursor as u64);
                    entries.push(LogEntry::from(record));
                    cursor = body_end;
                    last_good_offset = cursor as u64;
                }
                Err(err) => {
                    tracing::warn!(offset = cursor, error = %err, "malformed log record, discarding tail");
                    break;
                }
            }
        }

        if last_good_offset != buf.len() as u64 {
            file.set_len(last_good_offset)?;
        }
        file.seek(SeekFrom::End(0))?;

        let start_index = 0;
        let start_term = 0;

        Ok(Self {
            path,
            file,
            entries,
            offsets,
            start_index,
            start_term,
            commit_index: 0,
            results: std::collections::HashMap::new(),
        })
    }

    /// The index of the most recently appended entry (0 if the log and any
    /// compacted prefix are both empty).
    pub fn last_index(&self) -> u64 {
        self.entries.last().map(|e| e.index).unwrap_or(self.start_index)
    }

    /// The term of the most recently appended entry, or the compacted
    /// prefix's term if the log is currently empty.
    pub fn current_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(self.start_term)
    }

    /// `(lastIndex, lastTerm)`, per §4.6.
    pub fn last_info(&self) -> (u64, u64) {
        (self.last_index(), self.current_term())
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn start_index(&self) -> u64 {
        self.start_index
    }

    pub fn start_term(&self) -> u64 {
        self.start_term
    }

    /// The term of the entry at `index`, falling back to the compacted
    /// prefix's term at `start_index`, or `None` if `index` precedes the
    /// log entirely or is past `last_index`.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.start_index {
            return Some(self.start_term);
        }
        if index < self.start_index || index > self.last_index() {
            return None;
        }
        let pos = (index - self.start_index - 1) as usize;
        self.entries.get(pos).map(|e| e.term)
    }

    fn position_of(&self, index: u64) -> Option<usize> {
        if index <= self.start_index {
            return None;
        }
        let pos = (index - self.start_index - 1) as usize;
        if pos < self.entries.len() {
            Some(pos)
        } else {
            None
        }
    }

    /// Construct a new entry with the next index; does not persist it (§4.1).
    pub fn create_entry(&self, term: u64, command_name: String, command: Vec<u8>) -> LogEntry {
        LogEntry {
            index: self.last_index() + 1,
            term,
            command_name,
            command,
            commit_signal: new_commit_signal(),
        }
    }

    /// Every entry with `index > after`, cloned for replication.
    pub fn entries_after(&self, after: u64) -> Vec<LogEntry> {
        if after < self.start_index {
            // Entries before the compacted prefix no longer exist; callers
            // must fall back to a snapshot transfer (out of scope here).
            return self.entries.clone();
        }
        match self.position_of(after) {
            Some(pos) => self.entries[pos + 1..].to_vec(),
            None if after == self.last_index() => Vec::new(),
            None => self.entries.clone(),
        }
    }

    fn write_record(&mut self, entry: &LogEntry) -> RaftResult<u64> {
        let record = LogEntryRecord::from(entry);
        let body = bincode::serialize(&record).map_err(|e| {
            crate::error::RaftError::Fatal(format!("failed to serialize log entry: {}", e))
        })?;
        let offset = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&(body.len() as u32).to_le_bytes())?;
        self.file.write_all(&body)?;
        self.file.sync_data()?;
        Ok(offset)
    }

    /// Append a single entry. Rejects entries that would violate ordering or
    /// the non-decreasing term invariant (§4.1).
    pub fn append_entry(&mut self, entry: LogEntry) -> RaftResult<()> {
        let expected = self.last_index() + 1;
        if entry.index != expected {
            return Err(LogError::OutOfOrder { given: entry.index, expected }.into());
        }
        if entry.term < self.current_term() {
            return Err(LogError::StaleTerm { given: entry.term, last: self.current_term() }.into());
        }
        let offset = self.write_record(&entry)?;
        self.offsets.push(offset);
        self.entries.push(entry);
        Ok(())
    }

    /// Append a batch of entries. All-or-nothing on the in-memory side: if
    /// any entry in the batch is rejected, earlier entries from this same
    /// call are rolled back from both the file and the in-memory mirror
    /// (§4.1).
    pub fn append_entries(&mut self, entries: Vec<LogEntry>) -> RaftResult<()> {
        let original_len = self.entries.len();
        let original_file_len = self.file.metadata()?.len();

        for entry in entries {
            if let Err(err) = self.append_entry(entry) {
                self.entries.truncate(original_len);
                self.offsets.truncate(original_len);
                self.file.set_len(original_file_len)?;
                self.file.seek(SeekFrom::End(0))?;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Enforce the log-matching rule ahead of appending a leader's entries
    /// (§4.1): reject if the term recorded at `prev_index` doesn't match what
    /// the leader claims it to be, otherwise unconditionally discard
    /// whatever suffix follows `prev_index` so the subsequent `append_entries`
    /// call can append the leader's entries starting right after it.
    pub fn truncate(&mut self, prev_index: u64, prev_term: u64) -> RaftResult<()> {
        if prev_index < self.commit_index {
            return Err(LogError::WouldRewriteCommitted { index: prev_index, commit_index: self.commit_index }.into());
        }
        if prev_index > self.last_index() {
            return Err(LogError::MissingEntry { index: prev_index, last_index: self.last_index() }.into());
        }

        if prev_index == 0 {
            if self.start_index == 0 && !self.entries.is_empty() {
                self.truncate_to_position(0)?;
            }
            return Ok(());
        }

        let found_term = self.term_at(prev_index).expect("prev_index was range-checked above");
        if found_term != prev_term {
            return Err(LogError::TermMismatch { index: prev_index, found: found_term, expected: prev_term }.into());
        }

        let keep = self.position_of(prev_index).map(|p| p + 1).unwrap_or(0);
        self.truncate_to_position(keep)
    }

    fn truncate_to_position(&mut self, keep: usize) -> RaftResult<()> {
        let cut_offset = self.offsets.get(keep).copied().unwrap_or_else(|| self.file.metadata().map(|m| m.len()).unwrap_or(0));
        self.entries.truncate(keep);
        self.offsets.truncate(keep);
        self.file.set_len(cut_offset)?;
        self.file.seek(SeekFrom::End(0))?;
        Ok(())
    }

    /// Clamp `target` to `last_index`; if it advances `commit_index`, apply
    /// every newly-committed entry in order, recording its result and
    /// firing its `commit_signal` via `notify_one` (§4.1), which buffers the
    /// permit regardless of whether the waiter has started polling yet.
    ///
    /// `apply` is run in-line, one entry at a time, rather than handed off to
    /// a background task: it is "synchronous with the event" in the sense
    /// that nothing else touches the log until it resolves, even though the
    /// future may yield cooperatively. `apply` errors do not unwind or block
    /// the commit: per §9's pinned semantics, commit always fires and the
    /// error is surfaced to the client only via `get_entry_result`.
    pub async fn set_commit_index<F, Fut>(&mut self, target: u64, mut apply: F) -> RaftResult<()>
    where
        F: FnMut(&LogEntry) -> Fut,
        Fut: std::future::Future<Output = RaftResult<Vec<u8>>>,
    {
        let target = target.min(self.last_index());
        if target <= self.commit_index {
            return Ok(());
        }

        for index in (self.commit_index + 1)..=target {
            let pos = self.position_of(index).ok_or_else(|| {
                crate::error::RaftError::Fatal(format!("attempted to apply missing index {}", index))
            })?;
            let result = apply(&self.entries[pos]).await.map_err(|e| e.to_string());
            self.results.insert(index, result);
            self.entries[pos].commit_signal.notify_one();
            self.commit_index = index;
        }
        Ok(())
    }

    /// The stored apply result for a committed entry, if any.
    pub fn get_entry_result(&self, index: u64) -> Option<&ApplyResult> {
        self.results.get(&index)
    }

    /// Discard every entry with `index <= last_index`, advancing the
    /// compacted prefix to `(last_index, last_term)`, and rewrite the log
    /// file to contain only the surviving suffix (§4.1).
    pub fn compact(&mut self, last_index: u64, last_term: u64) -> RaftResult<()> {
        if last_index <= self.start_index {
            return Ok(());
        }
        let keep_from = self.position_of(last_index).map(|p| p + 1).unwrap_or(self.entries.len());
        let surviving: Vec<LogEntry> = self.entries.split_off(keep_from.min(self.entries.len()));

        let tmp_path = self.path.with_extension("rewrite");
        {
            let mut tmp = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp_path)?;
            let mut offsets = Vec::with_capacity(surviving.len());
            for entry in &surviving {
                let record = LogEntryRecord::from(entry);
                let body = bincode::serialize(&record)
                    .map_err(|e| crate::error::RaftError::Fatal(format!("failed to serialize log entry: {}", e)))?;
                offsets.push(tmp.stream_position()?);
                tmp.write_all(&(body.len() as u32).to_le_bytes())?;
                tmp.write_all(&body)?;
            }
            tmp.sync_all()?;
            self.offsets = offsets;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        self.file = OpenOptions::new().create(true).read(true).write(true).open(&self.path)?;
        self.file.seek(SeekFrom::End(0))?;

        self.entries = surviving;
        self.start_index = last_index;
        self.start_term = last_term;
        if self.commit_index < last_index {
            self.commit_index = last_index;
        }
        Ok(())
    }

    /// Advance the compacted prefix and commit index directly, without
    /// rewriting the log file, for use by `snapshotRecovery` (§4.10) where
    /// the log is empty and there is nothing on disk to rewrite.
    pub fn fast_forward_after_snapshot(&mut self, last_index: u64, last_term: u64) {
        self.start_index = last_index;
        self.start_term = last_term;
        self.commit_index = last_index;
        self.entries.clear();
        self.offsets.clear();
    }

    /// Restore the compaction point learned from a loaded snapshot at
    /// startup (§4.10 `loadSnapshot`), without touching any entries: the log
    /// file replay already reconstructed whatever suffix survives beyond
    /// `start_index`.
    pub fn restore_compaction_point(&mut self, start_index: u64, start_term: u64) {
        self.start_index = start_index;
        self.start_term = start_term;
        if self.commit_index < start_index {
            self.commit_index = start_index;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, term: u64, name: &str) -> LogEntry {
        LogEntry {
            index,
            term,
            command_name: name.to_string(),
            command: vec![1, 2, 3],
            commit_signal: new_commit_signal(),
        }
    }

    #[test]
    fn append_and_reopen_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        {
            let mut log = Log::open(&path).unwrap();
            log.append_entry(entry(1, 1, "a")).unwrap();
            log.append_entry(entry(2, 1, "b")).unwrap();
            log.append_entry(entry(3, 2, "c")).unwrap();
        }
        let log = Log::open(&path).unwrap();
        assert_eq!(log.last_info(), (3, 2));
        assert_eq!(log.entries_after(0).len(), 3);
    }

    #[test]
    fn append_entry_rejects_out_of_order_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = Log::open(dir.path().join("log")).unwrap();
        log.append_entry(entry(1, 1, "a")).unwrap();
        let err = log.append_entry(entry(3, 1, "b")).unwrap_err();
        assert!(matches!(err, crate::error::RaftError::Log(LogError::OutOfOrder { .. })));
    }

    #[test]
    fn append_entries_rolls_back_on_partial_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = Log::open(dir.path().join("log")).unwrap();
        let bad_batch = vec![entry(1, 1, "a"), entry(3, 1, "bad")];
        let err = log.append_entries(bad_batch).unwrap_err();
        assert!(matches!(err, crate::error::RaftError::Log(LogError::OutOfOrder { .. })));
        assert_eq!(log.last_index(), 0);
    }

    #[test]
    fn truncate_discards_conflicting_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = Log::open(dir.path().join("log")).unwrap();
        log.append_entry(entry(1, 1, "a")).unwrap();
        log.append_entry(entry(2, 1, "b")).unwrap();
        log.append_entry(entry(3, 1, "c")).unwrap();

        // The leader agrees entry 1 is term 1; entries 2 and 3 are about to
        // be replaced by whatever the leader sends next, so they go.
        log.truncate(1, 1).unwrap();
        assert_eq!(log.last_index(), 1);
    }

    #[test]
    fn truncate_rejects_term_mismatch_at_prev_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = Log::open(dir.path().join("log")).unwrap();
        log.append_entry(entry(1, 1, "a")).unwrap();
        log.append_entry(entry(2, 1, "b")).unwrap();

        // The leader believes entry 2 is term 2; this follower has it at
        // term 1, so the consistency check must fail rather than silently
        // truncating as if the claim were true.
        let err = log.truncate(2, 2).unwrap_err();
        assert!(matches!(
            err,
            crate::error::RaftError::Log(LogError::TermMismatch { index: 2, found: 1, expected: 2 })
        ));
        assert_eq!(log.last_index(), 2, "a rejected truncate must not mutate the log");
    }

    #[tokio::test]
    async fn truncate_refuses_to_rewrite_committed_history() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = Log::open(dir.path().join("log")).unwrap();
        log.append_entry(entry(1, 1, "a")).unwrap();
        log.append_entry(entry(2, 1, "b")).unwrap();
        log.set_commit_index(2, |_| futures::future::ready(Ok(vec![]))).await.unwrap();

        let err = log.truncate(0, 0).unwrap_err();
        assert!(matches!(err, crate::error::RaftError::Log(LogError::WouldRewriteCommitted { .. })));
    }

    #[tokio::test]
    async fn set_commit_index_applies_in_order_and_fires_signal_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = Log::open(dir.path().join("log")).unwrap();
        log.append_entry(entry(1, 1, "a")).unwrap();
        log.append_entry(entry(2, 1, "b")).unwrap();
        log.append_entry(entry(3, 1, "c")).unwrap();

        let applied = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let applied2 = applied.clone();
        log.set_commit_index(2, move |e| {
            applied2.lock().unwrap().push(e.index);
            futures::future::ready(Ok(e.command_name.clone().into_bytes()))
        })
        .await
        .unwrap();

        assert_eq!(*applied.lock().unwrap(), vec![1, 2]);
        assert_eq!(log.commit_index(), 2);
        assert_eq!(log.get_entry_result(1).unwrap().as_ref().unwrap(), b"a");
        assert!(log.get_entry_result(3).is_none());
    }

    #[tokio::test]
    async fn commit_fires_even_when_apply_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = Log::open(dir.path().join("log")).unwrap();
        log.append_entry(entry(1, 1, "a")).unwrap();

        log.set_commit_index(1, |_| futures::future::ready(Err(crate::error::RaftError::Fatal("boom".into()))))
            .await
            .unwrap();
        assert_eq!(log.commit_index(), 1);
        assert!(log.get_entry_result(1).unwrap().is_err());
    }

    #[tokio::test]
    async fn compact_rewrites_file_with_surviving_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        {
            let mut log = Log::open(&path).unwrap();
            for i in 1..=5u64 {
                log.append_entry(entry(i, 1, "x")).unwrap();
            }
            log.set_commit_index(5, |_| futures::future::ready(Ok(vec![]))).await.unwrap();
            log.compact(3, 1).unwrap();
            assert_eq!(log.start_index(), 3);
            assert_eq!(log.start_term(), 1);
            assert_eq!(log.entries_after(3).len(), 2);
        }

        // Round-trip (§8 testable property #7): re-opening yields the
        // surviving suffix. Note start_index/start_term are snapshot
        // metadata, not recovered from the log file itself; a full restart
        // restores them via `loadSnapshot` (see snapshot.rs).
        let log = Log::open(&path).unwrap();
        assert_eq!(log.entries_after(0).len(), 2);
    }
}
