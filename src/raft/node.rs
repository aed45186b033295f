//! Background driver task around the raft library's `RawNode`.
//!
//! The driver owns the raw node, the storage, and the state machine. It
//! steps inbound peer messages, services handle requests, ticks the
//! logical clock, and walks the Ready cycle in the order the library
//! requires. Submitters get their oneshot answered when their entry is
//! applied (or when leadership is lost first).

#![allow(clippy::field_reassign_with_default)]

use std::collections::VecDeque;
use std::sync::Arc;

use raft::{prelude::*, StateRole, Storage as _};
use slog::{o, Drain};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Duration, Instant};

use crate::command::Command;
use crate::error::{Error, Result};
use crate::metrics;
use crate::raft::handle::{RaftHandle, RaftRequest, RaftRole, RaftServer, RaftStatus};
use crate::raft::storage::RaftStorage;
use crate::raft::StateMachine;
use crate::transport::lookup::{ServerLookup, ServerRecord, VoterMeta};

const TICK_INTERVAL: Duration = Duration::from_millis(100);
const BASE_ELECTION_TICK: usize = 10;
const BASE_HEARTBEAT_TICK: usize = 3;
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(600);
const SNAPSHOT_THRESHOLD: u64 = 8192;
const MAILBOX_SIZE: usize = 4096;
const LOGGER_CHANNEL_SIZE: usize = 4096;

pub struct RaftNodeConfig {
    pub id: u64,
    pub node_name: String,
    /// Voter set to seed when no durable state exists; empty means the
    /// node starts as a follower and waits for the configuration to
    /// replicate to it.
    pub initial_servers: Vec<ServerRecord>,
    /// Multiplies the library's election/heartbeat tick counts.
    pub raft_multiplier: usize,
    pub debug_log: bool,
}

/// Channels the agent wires between the driver and the stream layer.
pub struct RaftMailboxes {
    pub in_tx: mpsc::Sender<Message>,
    pub out_rx: mpsc::Receiver<Message>,
}

struct Pending {
    index: u64,
    reply: oneshot::Sender<Result<()>>,
}

pub struct RaftNode<S: StateMachine> {
    raw: RawNode<RaftStorage>,
    fsm: S,
    requests: mpsc::Receiver<RaftRequest>,
    in_mailbox: mpsc::Receiver<Message>,
    out_mailbox: mpsc::Sender<Message>,
    leader_tx: mpsc::UnboundedSender<bool>,
    lookup: Arc<ServerLookup>,
    shutdown: watch::Receiver<bool>,
    pending: VecDeque<Pending>,
    barriers: VecDeque<(u64, oneshot::Sender<Result<u64>>)>,
    conf: ConfState,
    applied_index: u64,
    was_leader: bool,
    last_snapshot_index: u64,
    last_snapshot_at: Instant,
}

impl<S: StateMachine> RaftNode<S> {
    /// Seeds the initial configuration if asked to, and spawns the
    /// driver over previously opened storage. Returns the handle, the
    /// leadership transition stream, and the message mailboxes for the
    /// stream layer.
    pub fn spawn(
        config: RaftNodeConfig,
        storage: RaftStorage,
        had_state: bool,
        mut fsm: S,
        lookup: Arc<ServerLookup>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(RaftHandle, mpsc::UnboundedReceiver<bool>, RaftMailboxes)> {
        if !config.initial_servers.is_empty() && !had_state {
            let voters: Vec<u64> = config.initial_servers.iter().map(|s| s.id).collect();
            log::info!(
                "raft: bootstrapping cluster as {} with initial voters {:?}",
                config.node_name,
                voters
            );
            for server in &config.initial_servers {
                lookup.insert(server.id, server.name.clone(), server.addr);
            }
            storage.bootstrap_with(&voters)?;
        }

        // Prime the state machine from the durable snapshot; the raft
        // log only replays entries committed after it.
        if let Some(snapshot) = storage.latest_snapshot() {
            if !snapshot.get_data().is_empty() {
                let meta = snapshot.get_metadata();
                fsm.restore(meta.index, meta.term, snapshot.get_data())?;
            }
        }

        let mut cfg = Config::default();
        cfg.id = config.id;
        cfg.election_tick = BASE_ELECTION_TICK * config.raft_multiplier.max(1);
        cfg.heartbeat_tick = BASE_HEARTBEAT_TICK * config.raft_multiplier.max(1);

        // The raft library logs through slog; keep it quiet unless the
        // agent runs at debug level, like the rest of the stack.
        let logger = if config.debug_log {
            let decorator = slog_term::TermDecorator::new().build();
            let drain = slog_term::FullFormat::new(decorator).build().fuse();
            let drain = slog_async::Async::new(drain)
                .chan_size(LOGGER_CHANNEL_SIZE)
                .overflow_strategy(slog_async::OverflowStrategy::Block)
                .build()
                .fuse();
            slog::Logger::root(drain, o!("node" => config.node_name.clone()))
        } else {
            slog::Logger::root(slog::Discard, o!())
        };

        let conf = storage.conf_state();
        let applied_index = conf_applied_floor(&storage);
        let raw = RawNode::new(&cfg, storage, &logger)?;

        let (handle, requests) = RaftHandle::channel();
        let (in_tx, in_rx) = mpsc::channel(MAILBOX_SIZE);
        let (out_tx, out_rx) = mpsc::channel(MAILBOX_SIZE);
        let (leader_tx, leader_rx) = mpsc::unbounded_channel();

        let node = RaftNode {
            raw,
            fsm,
            requests,
            in_mailbox: in_rx,
            out_mailbox: out_tx,
            leader_tx,
            lookup,
            shutdown,
            pending: VecDeque::new(),
            barriers: VecDeque::new(),
            conf,
            applied_index,
            was_leader: false,
            last_snapshot_index: applied_index,
            last_snapshot_at: Instant::now(),
        };
        tokio::spawn(node.run());

        Ok((handle, leader_rx, RaftMailboxes { in_tx, out_rx }))
    }

    async fn run(mut self) {
        let mut last_tick = Instant::now();
        log::info!("raft: driver running");

        loop {
            tokio::select! {
                Some(msg) = self.in_mailbox.recv() => {
                    let _ = self.raw.step(msg);
                    while let Ok(msg) = self.in_mailbox.try_recv() {
                        let _ = self.raw.step(msg);
                    }
                }
                request = self.requests.recv() => {
                    match request {
                        None => break,
                        Some(request) => {
                            if !self.handle_request(request) {
                                break;
                            }
                        }
                    }
                }
                _ = self.shutdown.changed() => break,
                _ = tokio::time::sleep(Duration::from_millis(1)) => {}
            }

            if last_tick.elapsed() >= TICK_INTERVAL {
                self.raw.tick();
                last_tick = Instant::now();
            }

            self.maybe_snapshot();
            self.on_ready();
            self.observe_leadership();
        }

        self.fail_inflight();
        log::info!("raft: driver stopped");
    }

    /// Returns false when the driver should exit.
    fn handle_request(&mut self, request: RaftRequest) -> bool {
        match request {
            RaftRequest::Apply { data, reply } => self.propose_entry(data, reply),
            RaftRequest::Barrier { reply } => self.propose_barrier(reply),
            RaftRequest::AddVoter {
                id,
                name,
                addr,
                reply,
            } => {
                // The directory entry must exist before the transport is
                // asked to reach the new voter.
                self.lookup.insert(id, name.clone(), addr);
                let mut cc = ConfChange::default();
                cc.node_id = id;
                cc.set_change_type(ConfChangeType::AddNode);
                match bincode::serialize(&VoterMeta { name, addr }) {
                    Ok(ctx) => {
                        cc.set_context(ctx.into());
                        self.propose_conf_change(cc, reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                    }
                }
            }
            RaftRequest::RemoveServer { id, reply } => {
                let mut cc = ConfChange::default();
                cc.node_id = id;
                cc.set_change_type(ConfChangeType::RemoveNode);
                self.propose_conf_change(cc, reply);
            }
            RaftRequest::GetConfiguration { reply } => {
                let _ = reply.send(self.configuration());
            }
            RaftRequest::Status { reply } => {
                let _ = reply.send(self.status());
            }
            RaftRequest::Shutdown { reply } => {
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn propose_entry(&mut self, data: Vec<u8>, reply: oneshot::Sender<Result<()>>) {
        if self.raw.raft.state != StateRole::Leader {
            let err = self.not_leader();
            let _ = reply.send(Err(err));
            return;
        }
        let index = self.raw.raft.raft_log.last_index() + 1;
        if let Err(e) = self.raw.propose(vec![], data) {
            let _ = reply.send(Err(e.into()));
            return;
        }
        if self.raw.raft.raft_log.last_index() + 1 == index {
            let _ = reply.send(Err(Error::ProposalDropped));
            return;
        }
        metrics::APPLY_COUNTER.with_label_values(&["propose"]).inc();
        self.pending.push_back(Pending { index, reply });
    }

    fn propose_barrier(&mut self, reply: oneshot::Sender<Result<u64>>) {
        if self.raw.raft.state != StateRole::Leader {
            let err = self.not_leader();
            let _ = reply.send(Err(err));
            return;
        }
        let data = match Command::Noop.encode() {
            Ok(data) => data,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let index = self.raw.raft.raft_log.last_index() + 1;
        if let Err(e) = self.raw.propose(vec![], data) {
            let _ = reply.send(Err(e.into()));
            return;
        }
        if self.raw.raft.raft_log.last_index() + 1 == index {
            let _ = reply.send(Err(Error::ProposalDropped));
            return;
        }
        self.barriers.push_back((index, reply));
    }

    fn propose_conf_change(&mut self, cc: ConfChange, reply: oneshot::Sender<Result<()>>) {
        if self.raw.raft.state != StateRole::Leader {
            let err = self.not_leader();
            let _ = reply.send(Err(err));
            return;
        }
        let index = self.raw.raft.raft_log.last_index() + 1;
        if let Err(e) = self.raw.propose_conf_change(vec![], cc) {
            let _ = reply.send(Err(e.into()));
            return;
        }
        if self.raw.raft.raft_log.last_index() + 1 == index {
            // The library refuses overlapping configuration changes.
            let _ = reply.send(Err(Error::ProposalDropped));
            return;
        }
        self.pending.push_back(Pending { index, reply });
    }

    fn configuration(&self) -> Vec<RaftServer> {
        let mut servers: Vec<RaftServer> = self
            .conf
            .voters
            .iter()
            .map(|&id| {
                let record = self.lookup.get(id);
                RaftServer {
                    id,
                    name: record
                        .as_ref()
                        .map(|r| r.name.clone())
                        .unwrap_or_default(),
                    address: record
                        .map(|r| r.addr.to_string())
                        .unwrap_or_default(),
                }
            })
            .collect();
        servers.sort_by_key(|s| s.id);
        servers
    }

    fn status(&self) -> RaftStatus {
        let role = match self.raw.raft.state {
            StateRole::Leader => RaftRole::Leader,
            StateRole::Candidate | StateRole::PreCandidate => RaftRole::Candidate,
            StateRole::Follower => RaftRole::Follower,
        };
        let leader_id = match self.raw.raft.leader_id {
            0 => None,
            id => Some(id),
        };
        let leader_addr = leader_id
            .and_then(|id| self.lookup.addr_of(id))
            .map(|addr| addr.to_string());
        RaftStatus {
            role,
            leader_id,
            leader_addr,
        }
    }

    fn not_leader(&self) -> Error {
        let leader = match self.raw.raft.leader_id {
            0 => None,
            id => self.lookup.addr_of(id).map(|addr| addr.to_string()),
        };
        Error::NotLeader { leader }
    }

    fn on_ready(&mut self) {
        if !self.raw.has_ready() {
            return;
        }
        let mut ready = self.raw.ready();

        if !ready.messages().is_empty() {
            self.send_messages(ready.take_messages());
        }

        if *ready.snapshot() != Snapshot::default() {
            self.install_snapshot(ready.snapshot().clone());
        }

        let committed = ready.take_committed_entries();
        self.handle_committed(committed);

        if let Err(e) = self.raw.raft.raft_log.store.append_entries(ready.entries()) {
            log::error!("raft: failed to persist log entries: {e}");
        }
        if let Some(hs) = ready.hs() {
            if let Err(e) = self.raw.raft.raft_log.store.set_hardstate(hs.clone()) {
                log::error!("raft: failed to persist hard state: {e}");
            }
        }
        if !ready.persisted_messages().is_empty() {
            self.send_messages(ready.take_persisted_messages());
        }

        let mut light = self.raw.advance(ready);
        if let Some(commit) = light.commit_index() {
            if let Err(e) = self.raw.raft.raft_log.store.set_commit(commit) {
                log::error!("raft: failed to persist commit index: {e}");
            }
        }
        self.send_messages(light.take_messages());
        let committed = light.take_committed_entries();
        self.handle_committed(committed);
        self.raw.advance_apply();

        self.raw.raft.raft_log.store.compact_cache(self.applied_index);
    }

    fn install_snapshot(&mut self, snapshot: Snapshot) {
        let meta = snapshot.get_metadata().clone();
        if let Err(e) = self.raw.raft.raft_log.store.install_snapshot(&snapshot) {
            log::error!("raft: failed to install snapshot at {}: {e}", meta.index);
            return;
        }
        if let Err(e) = self
            .fsm
            .restore(meta.index, meta.term, snapshot.get_data())
        {
            log::error!("raft: state machine restore failed: {e}");
            return;
        }
        self.conf = meta.get_conf_state().clone();
        self.applied_index = meta.index;
        self.last_snapshot_index = meta.index;
    }

    fn handle_committed(&mut self, entries: Vec<Entry>) {
        for entry in entries {
            let index = entry.index;
            if entry.get_entry_type() == EntryType::EntryConfChange {
                self.apply_conf_change_entry(&entry);
            } else if entry.data.is_empty() {
                // The library's own no-op entry at term start.
            } else {
                let result = self.fsm.apply(index, entry.data.as_ref());
                metrics::APPLY_COUNTER.with_label_values(&["apply"]).inc();
                self.resolve_pending(index, result);
            }
            self.applied_index = self.applied_index.max(index);
        }
        self.resolve_barriers();
    }

    fn apply_conf_change_entry(&mut self, entry: &Entry) {
        let index = entry.index;
        let mut cc = ConfChange::default();
        if let Err(e) = protobuf::Message::merge_from_bytes(&mut cc, entry.data.as_ref()) {
            log::error!("raft: undecodable conf change at index {index}: {e}");
            self.resolve_pending(index, Err(Error::ProposalDropped));
            return;
        }
        match self.raw.apply_conf_change(&cc) {
            Ok(cs) => {
                if !cc.get_context().is_empty() {
                    match bincode::deserialize::<VoterMeta>(cc.get_context()) {
                        Ok(meta) => self.lookup.insert(cc.node_id, meta.name, meta.addr),
                        Err(e) => {
                            log::warn!("raft: conf change context unreadable: {e}")
                        }
                    }
                }
                if let Err(e) = self.raw.raft.raft_log.store.set_conf_state(cs.clone()) {
                    log::error!("raft: failed to persist configuration: {e}");
                }
                log::info!(
                    "raft: configuration now has voters {:?} after {:?} of {}",
                    cs.voters,
                    cc.get_change_type(),
                    cc.node_id
                );
                self.conf = cs;
                self.resolve_pending(index, Ok(()));
            }
            Err(e) => {
                log::error!("raft: conf change at index {index} failed: {e}");
                self.resolve_pending(index, Err(e.into()));
            }
        }
    }

    /// Answers the submitter whose entry just applied; anything queued
    /// for an earlier index was overwritten by a newer leader.
    fn resolve_pending(&mut self, index: u64, result: Result<()>) {
        while let Some(front) = self.pending.front() {
            if front.index > index {
                return;
            }
            let front = self.pending.pop_front().unwrap();
            if front.index == index {
                let _ = front.reply.send(result);
                return;
            }
            let _ = front.reply.send(Err(Error::LeadershipLost));
        }
    }

    fn resolve_barriers(&mut self) {
        while let Some((index, _)) = self.barriers.front() {
            if *index > self.applied_index {
                return;
            }
            let (index, reply) = self.barriers.pop_front().unwrap();
            let _ = reply.send(Ok(index));
        }
    }

    fn observe_leadership(&mut self) {
        let is_leader = self.raw.raft.state == StateRole::Leader;
        if is_leader == self.was_leader {
            return;
        }
        self.was_leader = is_leader;
        if is_leader {
            log::info!("raft: leadership acquired");
        } else {
            log::info!("raft: leadership lost");
            self.fail_inflight();
        }
        if self.leader_tx.send(is_leader).is_err() {
            log::debug!("raft: nobody is watching leadership transitions");
        }
    }

    fn maybe_snapshot(&mut self) {
        let applied = self.applied_index;
        if applied <= self.last_snapshot_index {
            return;
        }
        let due_by_count = applied - self.last_snapshot_index >= SNAPSHOT_THRESHOLD;
        let due_by_time = self.last_snapshot_at.elapsed() >= SNAPSHOT_INTERVAL;
        if !due_by_count && !due_by_time {
            return;
        }
        match self.fsm.snapshot() {
            Ok(data) => match self.raw.raft.raft_log.store.save_snapshot(data, applied) {
                Ok(()) => {
                    self.last_snapshot_index = applied;
                    self.last_snapshot_at = Instant::now();
                }
                Err(e) => log::error!("raft: failed to save snapshot: {e}"),
            },
            Err(e) => log::error!("raft: state machine snapshot failed: {e}"),
        }
    }

    fn send_messages(&mut self, messages: Vec<Message>) {
        for msg in messages {
            if let Err(e) = self.out_mailbox.try_send(msg) {
                log::error!("raft: failed to queue outbound message, raft will retry: {e}");
            }
        }
    }

    /// Fails every in-flight future; called on leadership loss and on
    /// shutdown.
    fn fail_inflight(&mut self) {
        for pending in self.pending.drain(..) {
            let _ = pending.reply.send(Err(Error::LeadershipLost));
        }
        for (_, reply) in self.barriers.drain(..) {
            let _ = reply.send(Err(Error::LeadershipLost));
        }
    }
}

/// Applied floor recorded by the storage (the snapshot index); the
/// library starts applying after it.
fn conf_applied_floor(storage: &RaftStorage) -> u64 {
    storage.first_index().map(|f| f.saturating_sub(1)).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::KvFsm;
    use crate::membership::server_id;
    use crate::store::KvStore;
    use tokio::time::timeout;

    fn spawn_node(
        name: &str,
        bootstrap: bool,
    ) -> (
        RaftHandle,
        mpsc::UnboundedReceiver<bool>,
        RaftMailboxes,
        KvStore,
        watch::Sender<bool>,
    ) {
        let store = KvStore::new();
        let fsm = KvFsm::new(store.clone());
        let lookup = Arc::new(ServerLookup::new());
        let self_record = ServerRecord {
            id: server_id(name),
            name: name.to_string(),
            addr: "127.0.0.1:6868".parse().unwrap(),
        };
        lookup.insert(self_record.id, self_record.name.clone(), self_record.addr);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (storage, had_state) =
            RaftStorage::open(&crate::raft::storage::StorageProfile::Dev).unwrap();
        let config = RaftNodeConfig {
            id: server_id(name),
            node_name: name.to_string(),
            initial_servers: if bootstrap { vec![self_record] } else { vec![] },
            raft_multiplier: 1,
            debug_log: false,
        };
        let (handle, leader_rx, mailboxes) =
            RaftNode::spawn(config, storage, had_state, fsm, lookup, shutdown_rx).unwrap();
        (handle, leader_rx, mailboxes, store, shutdown_tx)
    }

    async fn await_leadership(leader_rx: &mut mpsc::UnboundedReceiver<bool>) {
        timeout(Duration::from_secs(10), async {
            loop {
                if leader_rx.recv().await == Some(true) {
                    return;
                }
            }
        })
        .await
        .expect("node never became leader");
    }

    #[tokio::test]
    async fn single_node_elects_applies_and_reads() {
        let (handle, mut leader_rx, _mailboxes, store, _shutdown) =
            spawn_node("solo", true);
        await_leadership(&mut leader_rx).await;

        let cmd = Command::SetPair {
            key: "x".into(),
            value: "1".into(),
        };
        handle
            .apply(cmd.encode().unwrap(), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(store.get("x"), Some("1".to_string()));

        let status = handle.status().await.unwrap();
        assert_eq!(status.role, RaftRole::Leader);
        assert_eq!(status.leader_id, Some(server_id("solo")));

        let servers = handle.configuration().await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].id, server_id("solo"));
        assert_eq!(servers[0].name, "solo");
    }

    #[tokio::test]
    async fn barrier_waits_for_applied_prefix() {
        let (handle, mut leader_rx, _mailboxes, store, _shutdown) =
            spawn_node("barrier-node", true);
        await_leadership(&mut leader_rx).await;

        for i in 0..5u32 {
            let cmd = Command::SetPair {
                key: format!("k{i}"),
                value: i.to_string(),
            };
            handle
                .apply(cmd.encode().unwrap(), Duration::from_secs(10))
                .await
                .unwrap();
        }
        let index = handle.barrier(Duration::from_secs(10)).await.unwrap();
        assert!(index > 5);
        assert_eq!(store.len(), 5);
    }

    #[tokio::test]
    async fn follower_rejects_writes_with_not_leader() {
        let (handle, _leader_rx, _mailboxes, _store, _shutdown) =
            spawn_node("lonely-follower", false);

        let cmd = Command::SetPair {
            key: "x".into(),
            value: "1".into(),
        };
        let err = handle
            .apply(cmd.encode().unwrap(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotLeader { .. }));

        let status = handle.status().await.unwrap();
        assert_ne!(status.role, RaftRole::Leader);
    }

    #[tokio::test]
    async fn shutdown_fails_later_requests() {
        let (handle, mut leader_rx, _mailboxes, _store, _shutdown) =
            spawn_node("short-lived", true);
        await_leadership(&mut leader_rx).await;

        handle.shutdown().await;
        let err = handle
            .apply(
                Command::Noop.encode().unwrap(),
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Shutdown));
    }
}
