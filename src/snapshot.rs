//! Point-in-time state-machine capture used for log compaction (§4.2, §4.10).

use std::fs;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::error::SnapshotError;

/// A captured state-machine snapshot plus the log position it covers.
///
/// Persisted as `<storage_path>/snapshot/<last_term>_<last_index>.ss`, a
/// file whose first line is an 8-hex-digit CRC-32 (IEEE) of the JSON payload
/// that follows it. Loading recomputes the checksum and refuses the
/// snapshot on mismatch (§4.2, §7 `SnapshotCorruption`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_index: u64,
    pub last_term: u64,
    pub peers: Vec<String>,
    pub state: Vec<u8>,
}

impl Snapshot {
    pub fn new(last_index: u64, last_term: u64, peers: Vec<String>, state: Vec<u8>) -> Self {
        Snapshot { last_index, last_term, peers, state }
    }

    fn file_name(last_term: u64, last_index: u64) -> String {
        format!("{}_{}.ss", last_term, last_index)
    }

    fn dir(storage_path: &Path) -> PathBuf {
        storage_path.join("snapshot")
    }

    /// Persist this snapshot under `storage_path`, via a temp-file-then-rename
    /// so a crash mid-write never leaves a partial snapshot at the final path.
    pub fn save(&self, storage_path: &Path) -> Result<PathBuf, SnapshotError> {
        let dir = Self::dir(storage_path);
        fs::create_dir_all(&dir)?;

        let payload = serde_json::to_vec(self)?;
        let checksum = crc32fast::hash(&payload);

        let final_path = dir.join(Self::file_name(self.last_term, self.last_index));
        let tmp_path = dir.join(format!("{}.tmp", Self::file_name(self.last_term, self.last_index)));

        {
            let mut tmp = fs::File::create(&tmp_path)?;
            writeln!(tmp, "{:08x}", checksum)?;
            tmp.write_all(&payload)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &final_path)?;

        Ok(final_path)
    }

    /// Load and checksum-verify the snapshot at `path`.
    pub fn load_from_file(path: &Path) -> Result<Self, SnapshotError> {
        let mut contents = String::new();
        fs::File::open(path)?.read_to_string(&mut contents)?;

        let mut lines = contents.splitn(2, '\n');
        let header = lines.next().unwrap_or("");
        let payload = lines.next().unwrap_or("");

        let expected = u32::from_str_radix(header.trim(), 16).map_err(|_| SnapshotError::BadChecksum)?;
        let actual = crc32fast::hash(payload.as_bytes());
        if actual != expected {
            return Err(SnapshotError::BadChecksum);
        }

        Ok(serde_json::from_str(payload)?)
    }

    /// Select and load the greatest-`(last_term, last_index)` snapshot under
    /// `storage_path`, per §4.10's startup recovery rule. Returns `Ok(None)`
    /// if no snapshot directory or file exists.
    pub fn load_latest(storage_path: &Path) -> Result<Option<Self>, SnapshotError> {
        let dir = Self::dir(storage_path);
        if !dir.exists() {
            return Ok(None);
        }

        let mut best: Option<(u64, u64, PathBuf)> = None;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("ss") {
                continue;
            }
            let stem = match path.file_stem().and_then(|s| s.to_str()) {
                Some(s) => s,
                None => continue,
            };
            let mut parts = stem.splitn(2, '_');
            let (term, index) = match (parts.next(), parts.next()) {
                (Some(t), Some(i)) => match (t.parse::<u64>(), i.parse::<u64>()) {
                    (Ok(t), Ok(i)) => (t, i),
                    _ => continue,
                },
                _ => continue,
            };
            if best.as_ref().map(|(bt, bi, _)| (term, index) > (*bt, *bi)).unwrap_or(true) {
                best = Some((term, index, path));
            }
        }

        match best {
            Some((_, _, path)) => Ok(Some(Self::load_from_file(&path)?)),
            None => Ok(None),
        }
    }

    /// Remove every snapshot file under `storage_path` except the one at
    /// `(last_term, last_index)`, per §4.10's retention rule (keep only the
    /// most recent snapshot on disk).
    pub fn prune_all_but(storage_path: &Path, last_term: u64, last_index: u64) -> Result<(), SnapshotError> {
        let dir = Self::dir(storage_path);
        if !dir.exists() {
            return Ok(());
        }
        let keep = Self::file_name(last_term, last_index);
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.file_name().and_then(|n| n.to_str()) == Some(keep.as_str()) {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) == Some("ss") {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}
