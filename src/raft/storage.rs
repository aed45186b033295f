//! Raft log, stable store, and snapshot persistence.
//!
//! Two profiles exist. Dev mode keeps everything in memory and discards
//! snapshots; it exists for tests and single-process demos. The durable
//! profile writes every appended entry through to a segmented WAL under
//! `<data-dir>/raft/`, persists hard state and configuration to a state
//! file with an atomic rename, and keeps the latest three snapshots in
//! `<data-dir>/raft/snapshots/`. The in-memory store fronts the WAL as a
//! write-through cache holding the most recent entries; reads past the
//! cache fall back to the WAL.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use protobuf::Message as PbMessage;
use raft::eraftpb::{ConfState, Entry, HardState, Snapshot};
use raft::{storage::MemStorage, GetEntriesContext, RaftState, Result, Storage, StorageError};
use serde::{Deserialize, Serialize};

use crate::raft::segment::Segment;
use crate::raft::{RAFT_LOG_CACHE_SIZE, RAFT_SNAPSHOT_RETAIN};

/// Entries per WAL segment before rolling to a new file.
const SEGMENT_SPAN: u64 = 10_000;

const STATE_FILE: &str = "state";
const SNAPSHOT_DIR: &str = "snapshots";

#[derive(Clone, Debug)]
pub enum StorageProfile {
    /// In-memory log and stable store, discard snapshot sink.
    Dev,
    /// Durable log + stable store + file snapshots under `<dir>/raft/`.
    Durable { data_dir: PathBuf },
}

pub struct RaftStorage {
    cache: MemStorage,
    wal: Option<Mutex<Wal>>,
    stable: Option<StableFile>,
    snapshots: Option<SnapshotStore>,
    latest_snapshot: Mutex<Option<Snapshot>>,
    /// First index still available somewhere (WAL or cache); one past
    /// the latest snapshot.
    first_available: Mutex<u64>,
}

impl RaftStorage {
    /// Opens storage for the given profile and reports whether any
    /// pre-existing state was found (which suppresses bootstrap).
    pub fn open(profile: &StorageProfile) -> Result<(Self, bool)> {
        match profile {
            StorageProfile::Dev => Ok((
                RaftStorage {
                    cache: MemStorage::new(),
                    wal: None,
                    stable: None,
                    snapshots: None,
                    latest_snapshot: Mutex::new(None),
                    first_available: Mutex::new(1),
                },
                false,
            )),
            StorageProfile::Durable { data_dir } => {
                let raft_dir = data_dir.join("raft");
                fs::create_dir_all(&raft_dir).map_err(store_err)?;

                let snapshots = SnapshotStore::open(raft_dir.join(SNAPSHOT_DIR))?;
                let stable = StableFile::new(raft_dir.join(STATE_FILE));
                let mut wal = Wal::open(&raft_dir)?;

                let cache = MemStorage::new();
                let mut first_available = 1;
                let mut had_state = false;
                let mut latest_snapshot = None;

                if let Some(snapshot) = snapshots.load_latest()? {
                    first_available = snapshot.get_metadata().index + 1;
                    cache.wl().apply_snapshot(snapshot.clone())?;
                    latest_snapshot = Some(snapshot);
                    had_state = true;
                }

                if let Some(record) = stable.load()? {
                    had_state = true;
                    cache.wl().set_conf_state(record.conf_state());
                    cache.wl().set_hardstate(record.hard_state());
                }

                // Replay WAL entries newer than the snapshot into the cache.
                let replay_from = cache.last_index()? + 1;
                if let Some(last) = wal.last_index() {
                    had_state = had_state || last >= wal.first_index().unwrap_or(1);
                    let mut entries = Vec::new();
                    for index in replay_from..=last {
                        if let Some(bytes) = wal.read(index) {
                            let mut entry = Entry::default();
                            entry.merge_from_bytes(&bytes).map_err(store_err)?;
                            entries.push(entry);
                        }
                    }
                    if !entries.is_empty() {
                        log::info!(
                            "storage: replayed {} log entries from the WAL",
                            entries.len()
                        );
                        cache.wl().append(&entries)?;
                    }
                }

                Ok((
                    RaftStorage {
                        cache,
                        wal: Some(Mutex::new(wal)),
                        stable: Some(stable),
                        snapshots: Some(snapshots),
                        latest_snapshot: Mutex::new(latest_snapshot),
                        first_available: Mutex::new(first_available),
                    },
                    had_state,
                ))
            }
        }
    }

    /// Installs the single-server bootstrap configuration. Only called
    /// when no prior state exists.
    pub fn bootstrap(&self, self_id: u64) -> Result<()> {
        self.bootstrap_with(&[self_id])
    }

    /// Seeds an initial voter set. With bootstrap-expect, every seeding
    /// node must derive the same sorted set so the cluster agrees on
    /// its first configuration without coordination.
    pub fn bootstrap_with(&self, voters: &[u64]) -> Result<()> {
        let mut voters = voters.to_vec();
        voters.sort_unstable();
        voters.dedup();
        let mut snapshot = Snapshot::default();
        snapshot.mut_metadata().index = 1;
        snapshot.mut_metadata().term = 1;
        snapshot.mut_metadata().mut_conf_state().voters = voters;
        self.cache.wl().apply_snapshot(snapshot)?;
        *self.first_available.lock().unwrap() = 2;
        self.persist_stable()
    }

    pub fn append_entries(&self, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.cache.wl().append(entries)?;
        if let Some(wal) = &self.wal {
            let mut wal = wal.lock().unwrap();
            let mut encoded = Vec::with_capacity(entries.len());
            for entry in entries {
                encoded.push((entry.index, entry.write_to_bytes().map_err(store_err)?));
            }
            wal.append(&encoded).map_err(store_err)?;
        }
        Ok(())
    }

    pub fn set_hardstate(&self, hs: HardState) -> Result<()> {
        self.cache.wl().set_hardstate(hs);
        self.persist_stable()
    }

    pub fn set_conf_state(&self, cs: ConfState) -> Result<()> {
        self.cache.wl().set_conf_state(cs);
        self.persist_stable()
    }

    pub fn set_commit(&self, commit: u64) -> Result<()> {
        self.cache.wl().mut_hard_state().set_commit(commit);
        self.persist_stable()
    }

    /// Most recent snapshot with data, if any; used to prime the state
    /// machine before the driver starts.
    pub fn latest_snapshot(&self) -> Option<Snapshot> {
        self.latest_snapshot.lock().unwrap().clone()
    }

    pub fn conf_state(&self) -> ConfState {
        self.cache
            .initial_state()
            .map(|state| state.conf_state)
            .unwrap_or_default()
    }

    /// Builds and persists a snapshot carrying the state machine dump,
    /// then prunes WAL segments it fully covers.
    pub fn save_snapshot(&self, fsm_data: Vec<u8>, applied: u64) -> Result<()> {
        let mut snapshot = self.cache.snapshot(applied, 0)?;
        // The dump covers exactly the applied prefix; pin the metadata
        // to it rather than to the commit index.
        let term = self.term(applied)?;
        snapshot.mut_metadata().index = applied;
        snapshot.mut_metadata().term = term;
        snapshot.set_data(fsm_data.into());
        let index = applied;

        if let Some(store) = &self.snapshots {
            store.save(&snapshot)?;
        }
        *self.latest_snapshot.lock().unwrap() = Some(snapshot);
        *self.first_available.lock().unwrap() = index + 1;

        if let Some(wal) = &self.wal {
            wal.lock().unwrap().prune_through(index).map_err(store_err)?;
        }
        log::info!("storage: saved snapshot at index {index}");
        Ok(())
    }

    /// Installs a snapshot received from the leader.
    pub fn install_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let index = snapshot.get_metadata().index;
        self.cache.wl().apply_snapshot(snapshot.clone())?;
        if let Some(store) = &self.snapshots {
            store.save(snapshot)?;
        }
        *self.latest_snapshot.lock().unwrap() = Some(snapshot.clone());
        *self.first_available.lock().unwrap() = index + 1;
        if let Some(wal) = &self.wal {
            wal.lock().unwrap().prune_through(index).map_err(store_err)?;
        }
        self.persist_stable()
    }

    /// Trims the in-memory cache down to the write-through window. The
    /// WAL keeps serving anything older.
    pub fn compact_cache(&self, applied: u64) {
        if self.wal.is_none() {
            return;
        }
        let target = applied.saturating_sub(RAFT_LOG_CACHE_SIZE);
        let first_available = *self.first_available.lock().unwrap();
        if target <= first_available {
            return;
        }
        let cached_first = match self.cache.first_index() {
            Ok(first) => first,
            Err(_) => return,
        };
        if target > cached_first {
            if let Err(e) = self.cache.wl().compact(target) {
                log::warn!("storage: cache compaction to {target} failed: {e}");
            }
        }
    }

    fn persist_stable(&self) -> Result<()> {
        if let Some(stable) = &self.stable {
            let state = self.cache.initial_state()?;
            stable.save(&state)?;
        }
        Ok(())
    }

    fn wal_read(&self, index: u64) -> Option<Entry> {
        let wal = self.wal.as_ref()?;
        let bytes = wal.lock().unwrap().read(index)?;
        let mut entry = Entry::default();
        entry.merge_from_bytes(&bytes).ok()?;
        Some(entry)
    }
}

impl Storage for RaftStorage {
    fn initial_state(&self) -> Result<RaftState> {
        self.cache.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> Result<Vec<Entry>> {
        let max_size = max_size.into();
        match self.cache.entries(low, high, None, context) {
            Ok(entries) => Ok(limit_entries(entries, max_size)),
            Err(raft::Error::Store(StorageError::Compacted)) if self.wal.is_some() => {
                // The cache window has moved past `low`; stitch the gap
                // from the WAL and the tail from the cache.
                let cached_first = self.cache.first_index()?;
                let mut entries = Vec::new();
                for index in low..high.min(cached_first) {
                    match self.wal_read(index) {
                        Some(entry) => entries.push(entry),
                        None => return Err(raft::Error::Store(StorageError::Compacted)),
                    }
                }
                if high > cached_first {
                    let ctx = GetEntriesContext::empty(false);
                    entries.extend(self.cache.entries(cached_first.max(low), high, None, ctx)?);
                }
                Ok(limit_entries(entries, max_size))
            }
            Err(e) => Err(e),
        }
    }

    fn term(&self, idx: u64) -> Result<u64> {
        match self.cache.term(idx) {
            Ok(term) => Ok(term),
            Err(raft::Error::Store(StorageError::Compacted)) => match self.wal_read(idx) {
                Some(entry) => Ok(entry.term),
                None => Err(raft::Error::Store(StorageError::Compacted)),
            },
            Err(e) => Err(e),
        }
    }

    fn first_index(&self) -> Result<u64> {
        if self.wal.is_some() {
            Ok(*self.first_available.lock().unwrap())
        } else {
            self.cache.first_index()
        }
    }

    fn last_index(&self) -> Result<u64> {
        self.cache.last_index()
    }

    fn snapshot(&self, request_index: u64, to: u64) -> Result<Snapshot> {
        if let Some(snapshot) = self.latest_snapshot.lock().unwrap().as_ref() {
            if snapshot.get_metadata().index >= request_index {
                return Ok(snapshot.clone());
            }
        }
        self.cache.snapshot(request_index, to)
    }
}

fn limit_entries(mut entries: Vec<Entry>, max_size: Option<u64>) -> Vec<Entry> {
    let Some(max_size) = max_size else {
        return entries;
    };
    let mut total = 0u64;
    let mut keep = 0;
    for entry in &entries {
        total += u64::from(entry.compute_size());
        if keep > 0 && total > max_size {
            break;
        }
        keep += 1;
    }
    entries.truncate(keep.max(1).min(entries.len()));
    entries
}

fn store_err<E: std::error::Error + Send + Sync + 'static>(e: E) -> raft::Error {
    raft::Error::Store(StorageError::Other(Box::new(e)))
}

/// Segmented durable log. Segment files are named by their first entry
/// index, so a directory scan fully reconstructs the log.
struct Wal {
    dir: PathBuf,
    segments: BTreeMap<u64, Segment>,
}

impl Wal {
    fn open(dir: &Path) -> Result<Self> {
        let mut segments = BTreeMap::new();
        for dir_entry in fs::read_dir(dir).map_err(store_err)? {
            let path = dir_entry.map_err(store_err)?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(start) = name
                .strip_prefix("segment_")
                .and_then(|rest| rest.strip_suffix(".log"))
                .and_then(|idx| idx.parse::<u64>().ok())
            else {
                continue;
            };
            let segment = Segment::open(&path, start).map_err(store_err)?;
            segments.insert(start, segment);
        }
        Ok(Wal {
            dir: dir.to_path_buf(),
            segments,
        })
    }

    fn append(&mut self, entries: &[(u64, Vec<u8>)]) -> std::io::Result<()> {
        let Some(&(first, _)) = entries.first() else {
            return Ok(());
        };
        // A new leader may overwrite an uncommitted suffix.
        self.truncate_from(first)?;
        for (index, bytes) in entries {
            let segment = self.segment_for_append(*index)?;
            segment.append(std::slice::from_ref(bytes))?;
        }
        Ok(())
    }

    fn segment_for_append(&mut self, index: u64) -> std::io::Result<&mut Segment> {
        let roll = match self.segments.values().next_back() {
            Some(last) => {
                last.next_index() != index
                    || last.next_index() - last.start_index() >= SEGMENT_SPAN
            }
            None => true,
        };
        if roll {
            let path = self.dir.join(format!("segment_{index}.log"));
            let segment = Segment::open(path, index)?;
            self.segments.insert(index, segment);
        }
        Ok(self.segments.values_mut().next_back().unwrap())
    }

    fn truncate_from(&mut self, index: u64) -> std::io::Result<()> {
        let drop_keys: Vec<u64> = self
            .segments
            .range(index..)
            .filter(|(start, _)| **start >= index)
            .map(|(start, _)| *start)
            .collect();
        for key in drop_keys {
            if let Some(segment) = self.segments.remove(&key) {
                segment.remove()?;
            }
        }
        if let Some(segment) = self.segments.values_mut().next_back() {
            segment.truncate_from(index)?;
        }
        Ok(())
    }

    /// Removes segments made obsolete by a snapshot at `index`.
    fn prune_through(&mut self, index: u64) -> std::io::Result<()> {
        let obsolete: Vec<u64> = self
            .segments
            .iter()
            .filter(|(_, segment)| segment.last_index().map(|l| l <= index).unwrap_or(true))
            .map(|(start, _)| *start)
            .collect();
        // Keep the newest segment alive as the append point.
        let last_key = self.segments.keys().next_back().copied();
        for key in obsolete {
            if Some(key) == last_key {
                continue;
            }
            if let Some(segment) = self.segments.remove(&key) {
                segment.remove()?;
            }
        }
        Ok(())
    }

    fn read(&mut self, index: u64) -> Option<Vec<u8>> {
        let (_, segment) = self.segments.range_mut(..=index).next_back()?;
        if segment.last_index().map(|l| index > l).unwrap_or(true) {
            return None;
        }
        segment.read(index).ok()
    }

    fn first_index(&self) -> Option<u64> {
        self.segments.values().find_map(|s| {
            if s.is_empty() {
                None
            } else {
                Some(s.start_index())
            }
        })
    }

    fn last_index(&self) -> Option<u64> {
        self.segments.values().next_back().and_then(|s| s.last_index())
    }
}

#[derive(Serialize, Deserialize)]
struct StableRecord {
    term: u64,
    vote: u64,
    commit: u64,
    voters: Vec<u64>,
    learners: Vec<u64>,
}

impl StableRecord {
    fn hard_state(&self) -> HardState {
        let mut hs = HardState::default();
        hs.term = self.term;
        hs.vote = self.vote;
        hs.commit = self.commit;
        hs
    }

    fn conf_state(&self) -> ConfState {
        let mut cs = ConfState::default();
        cs.voters = self.voters.clone();
        cs.learners = self.learners.clone();
        cs
    }
}

/// Hard state + configuration, persisted with write-to-temp-then-rename.
struct StableFile {
    path: PathBuf,
}

impl StableFile {
    fn new(path: PathBuf) -> Self {
        StableFile { path }
    }

    fn save(&self, state: &RaftState) -> Result<()> {
        let record = StableRecord {
            term: state.hard_state.term,
            vote: state.hard_state.vote,
            commit: state.hard_state.commit,
            voters: state.conf_state.voters.clone(),
            learners: state.conf_state.learners.clone(),
        };
        let bytes = bincode::serialize(&record).map_err(store_err)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(store_err)?;
        fs::rename(&tmp, &self.path).map_err(store_err)?;
        Ok(())
    }

    fn load(&self) -> Result<Option<StableRecord>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path).map_err(store_err)?;
        let record = bincode::deserialize(&bytes).map_err(store_err)?;
        Ok(Some(record))
    }
}

/// File snapshot store retaining the newest [`RAFT_SNAPSHOT_RETAIN`]
/// snapshots.
struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    fn open(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).map_err(store_err)?;
        Ok(SnapshotStore { dir })
    }

    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let meta = snapshot.get_metadata();
        let name = format!("snapshot_{:020}_{:020}.snap", meta.term, meta.index);
        let bytes = snapshot.write_to_bytes().map_err(store_err)?;
        let tmp = self.dir.join("snapshot.tmp");
        fs::write(&tmp, bytes).map_err(store_err)?;
        fs::rename(&tmp, self.dir.join(name)).map_err(store_err)?;
        self.prune()?;
        Ok(())
    }

    fn load_latest(&self) -> Result<Option<Snapshot>> {
        for path in self.sorted_snapshots()? {
            let bytes = fs::read(&path).map_err(store_err)?;
            let mut snapshot = Snapshot::default();
            match snapshot.merge_from_bytes(&bytes) {
                Ok(()) => return Ok(Some(snapshot)),
                Err(e) => {
                    log::warn!(
                        "storage: skipping unreadable snapshot {}: {e}",
                        path.display()
                    );
                }
            }
        }
        Ok(None)
    }

    fn prune(&self) -> Result<()> {
        for stale in self.sorted_snapshots()?.into_iter().skip(RAFT_SNAPSHOT_RETAIN) {
            if let Err(e) = fs::remove_file(&stale) {
                log::warn!("storage: failed to prune snapshot {}: {e}", stale.display());
            }
        }
        Ok(())
    }

    /// Snapshot files, newest first.
    fn sorted_snapshots(&self) -> Result<Vec<PathBuf>> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)
            .map_err(store_err)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("snapshot_") && n.ends_with(".snap"))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();
        paths.reverse();
        Ok(paths)
    }
}
