//! Leader-only voter reconciliation and the leadership monitor that
//! gates it.
//!
//! The reconciler mirrors gossip membership into the raft voter set:
//! live members with server tags become voters, departed members are
//! removed, stale entries from reused addresses are repaired. At most
//! one reconciler loop exists per node; the monitor starts it on
//! leadership acquisition and joins it on loss.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::error::Result;
use crate::membership::{GossipHandle, Member, MemberStatus, ServerParts};
use crate::metrics;
use crate::raft::handle::RaftHandle;
use crate::raft::{BARRIER_WRITE_TIMEOUT, RAFT_TIMEOUT};

/// Below this many configured servers a leader does not re-add itself;
/// the bootstrap configuration already contains it, and re-adds during a
/// small-cluster bring-up race against the joining peers.
pub const DEFAULT_SELF_JOIN_THRESHOLD: usize = 3;

pub struct Reconciler {
    raft: RaftHandle,
    node_name: String,
    self_join_threshold: usize,
}

impl Reconciler {
    pub fn new(raft: RaftHandle, node_name: String, self_join_threshold: usize) -> Self {
        Reconciler {
            raft,
            node_name,
            self_join_threshold,
        }
    }

    /// Ensures the new leader has applied everything committed before
    /// it starts issuing configuration changes.
    pub async fn barrier(&self) -> Result<u64> {
        self.raft.barrier(BARRIER_WRITE_TIMEOUT).await
    }

    /// Full sweep over the membership list. The first failing member
    /// aborts the sweep; the monitor retries on the next tick.
    pub async fn refresh(&self, members: &[Member]) -> Result<()> {
        let timer = Instant::now();
        for member in members {
            self.refresh_member(member, members).await?;
        }
        metrics::RECONCILE_HISTOGRAM
            .with_label_values(&["refresh"])
            .observe(timer.elapsed().as_secs_f64());
        Ok(())
    }

    /// Reconciles a single member against the raft configuration.
    pub async fn refresh_member(&self, member: &Member, all: &[Member]) -> Result<()> {
        let Some(parts) = ServerParts::from_member(member) else {
            return Ok(());
        };
        let result = match member.status {
            MemberStatus::Alive => self.add_raft_peer(member, &parts, all).await,
            MemberStatus::Left => self.remove_raft_peer(member, &parts).await,
            MemberStatus::Leaving | MemberStatus::Failed => Ok(()),
        };
        if let Err(e) = &result {
            log::error!("reconcile: failed to reconcile member {}: {e}", member.name);
        }
        result
    }

    async fn add_raft_peer(
        &self,
        member: &Member,
        parts: &ServerParts,
        all: &[Member],
    ) -> Result<()> {
        if parts.bootstrap {
            for other in all {
                if other.name == member.name || other.status != MemberStatus::Alive {
                    continue;
                }
                let Some(other_parts) = ServerParts::from_member(other) else {
                    continue;
                };
                if other_parts.bootstrap {
                    // Operator intervention required; skip this member
                    // and keep sweeping the rest of the cluster.
                    log::error!(
                        "reconcile: '{}' and '{}' are both in bootstrap mode, refusing to add either",
                        member.name,
                        other.name
                    );
                    return Ok(());
                }
            }
        }

        let addr = SocketAddr::new(member.addr, parts.port);
        let servers = self.raft.configuration().await?;

        if member.name == self.node_name && servers.len() < self.self_join_threshold {
            log::debug!(
                "reconcile: skipping self-join with {} configured servers",
                servers.len()
            );
            return Ok(());
        }

        let addr_str = addr.to_string();
        for server in &servers {
            if server.id == parts.id && server.address == addr_str {
                return Ok(());
            }
            if server.address == addr_str && server.id != parts.id {
                // A reused host still occupies this address under its
                // old identity; clear it before adding the new voter.
                log::info!(
                    "reconcile: removing stale voter {} at {}",
                    server.id,
                    server.address
                );
                self.raft.remove_server(server.id, RAFT_TIMEOUT).await?;
            }
        }

        log::info!(
            "reconcile: adding voter {} ({}) at {}",
            member.name,
            parts.id,
            addr
        );
        self.raft
            .add_voter(parts.id, member.name.clone(), addr, RAFT_TIMEOUT)
            .await
    }

    async fn remove_raft_peer(&self, member: &Member, parts: &ServerParts) -> Result<()> {
        if member.name == self.node_name {
            // Self-removal must come from whichever node leads after
            // leadership transfers away.
            log::warn!("reconcile: refusing to remove self from the configuration");
            return Ok(());
        }
        let servers = self.raft.configuration().await?;
        if servers.iter().any(|s| s.id == parts.id) {
            log::info!(
                "reconcile: removing departed voter {} ({})",
                member.name,
                parts.id
            );
            self.raft.remove_server(parts.id, RAFT_TIMEOUT).await?;
        }
        Ok(())
    }
}

/// Consumes leadership transitions and keeps exactly zero or one
/// reconciler loop alive accordingly.
pub async fn monitor_leadership(
    mut leader_rx: mpsc::UnboundedReceiver<bool>,
    reconciler: Arc<Reconciler>,
    membership: GossipHandle,
    member_signal: broadcast::Sender<Member>,
    refresh_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut running: Option<(watch::Sender<bool>, JoinHandle<()>)> = None;
    log::info!("reconcile: monitoring leadership");

    loop {
        tokio::select! {
            transition = leader_rx.recv() => match transition {
                None => return,
                Some(true) => {
                    if running.is_some() {
                        log::error!("reconcile: attempted to start the reconciler loop while running");
                        continue;
                    }
                    log::info!("reconcile: cluster leadership acquired");
                    let (stop_tx, stop_rx) = watch::channel(false);
                    let task = tokio::spawn(leader_loop(
                        reconciler.clone(),
                        membership.clone(),
                        member_signal.subscribe(),
                        refresh_interval,
                        stop_rx,
                        shutdown.clone(),
                    ));
                    running = Some((stop_tx, task));
                }
                Some(false) => {
                    let Some((stop_tx, task)) = running.take() else {
                        log::error!("reconcile: attempted to stop the reconciler loop while not running");
                        continue;
                    };
                    let _ = stop_tx.send(true);
                    let _ = task.await;
                    log::info!("reconcile: cluster leadership lost");
                }
            },
            _ = shutdown.changed() => {
                if let Some((stop_tx, task)) = running.take() {
                    let _ = stop_tx.send(true);
                    let _ = task.await;
                }
                return;
            }
        }
    }
}

/// The reconciler loop: a two-phase state machine alternating between a
/// refresh pass (barrier, then full sweep) and a wait phase multiplexing
/// stop, shutdown, the periodic tick, and incremental member signals.
async fn leader_loop(
    reconciler: Arc<Reconciler>,
    membership: GossipHandle,
    mut member_signal: broadcast::Receiver<Member>,
    refresh_interval: Duration,
    mut stop: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    'refresh: loop {
        let tick = sleep(refresh_interval);
        tokio::pin!(tick);

        if *stop.borrow() {
            return;
        }

        let barrier_timer = Instant::now();
        match reconciler.barrier().await {
            Ok(_) => {
                metrics::RECONCILE_HISTOGRAM
                    .with_label_values(&["barrier"])
                    .observe(barrier_timer.elapsed().as_secs_f64());
                match membership.members().await {
                    Ok(members) => {
                        if let Err(e) = reconciler.refresh(&members).await {
                            log::error!("reconcile: sweep failed: {e}");
                        }
                    }
                    Err(e) => log::error!("reconcile: cannot list members: {e}"),
                }
            }
            // Transient coordination errors clear up on the next tick
            // or the next leadership acquisition.
            Err(e) if e.is_transient() => {
                log::warn!("reconcile: barrier not ready: {e}")
            }
            Err(e) => log::error!("reconcile: failed to wait for barrier: {e}"),
        }

        if *stop.borrow() {
            return;
        }

        loop {
            tokio::select! {
                _ = stop.changed() => return,
                _ = shutdown.changed() => return,
                _ = &mut tick => continue 'refresh,
                signal = member_signal.recv() => match signal {
                    Ok(member) => {
                        let all = membership.members().await.unwrap_or_default();
                        if let Err(e) = reconciler.refresh_member(&member, &all).await {
                            // Dropped; the next periodic sweep reconverges.
                            log::error!(
                                "reconcile: failed to refresh member {}: {e}",
                                member.name
                            );
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("reconcile: missed {n} member signals, waiting for the sweep");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::membership::crypto::Keyring;
    use crate::membership::gossip::{Gossip, GossipConfig, Profile};
    use crate::membership::{
        server_id, CLUSTER_ROLE, TAG_BOOTSTRAP, TAG_ID, TAG_PORT, TAG_ROLE, TAG_RPC_ADDR,
    };
    use crate::raft::handle::{RaftRequest, RaftServer};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::timeout;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Op {
        Add(u64),
        Remove(u64),
    }

    #[derive(Default)]
    struct MockState {
        servers: Mutex<Vec<RaftServer>>,
        ops: Mutex<Vec<Op>>,
        barriers: AtomicUsize,
        fail_add_for: Mutex<Option<u64>>,
    }

    fn mock_raft(servers: Vec<RaftServer>) -> (RaftHandle, Arc<MockState>) {
        let state = Arc::new(MockState::default());
        *state.servers.lock().unwrap() = servers;
        let (handle, mut rx) = RaftHandle::channel();
        let task_state = state.clone();
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                match request {
                    RaftRequest::GetConfiguration { reply } => {
                        let _ = reply.send(task_state.servers.lock().unwrap().clone());
                    }
                    RaftRequest::AddVoter {
                        id,
                        name,
                        addr,
                        reply,
                    } => {
                        if *task_state.fail_add_for.lock().unwrap() == Some(id) {
                            let _ = reply.send(Err(Error::LeadershipLost));
                            continue;
                        }
                        task_state.ops.lock().unwrap().push(Op::Add(id));
                        task_state.servers.lock().unwrap().push(RaftServer {
                            id,
                            name,
                            address: addr.to_string(),
                        });
                        let _ = reply.send(Ok(()));
                    }
                    RaftRequest::RemoveServer { id, reply } => {
                        task_state.ops.lock().unwrap().push(Op::Remove(id));
                        task_state.servers.lock().unwrap().retain(|s| s.id != id);
                        let _ = reply.send(Ok(()));
                    }
                    RaftRequest::Barrier { reply } => {
                        task_state.barriers.fetch_add(1, Ordering::SeqCst);
                        let _ = reply.send(Ok(1));
                    }
                    RaftRequest::Apply { reply, .. } => {
                        let _ = reply.send(Ok(()));
                    }
                    RaftRequest::Status { .. } => {}
                    RaftRequest::Shutdown { reply } => {
                        let _ = reply.send(());
                        return;
                    }
                }
            }
        });
        (handle, state)
    }

    fn member(name: &str, status: MemberStatus, bootstrap: bool) -> Member {
        let mut tags = HashMap::new();
        tags.insert(TAG_ROLE.to_string(), CLUSTER_ROLE.to_string());
        tags.insert(TAG_ID.to_string(), server_id(name).to_string());
        tags.insert(TAG_PORT.to_string(), "6868".to_string());
        tags.insert(TAG_RPC_ADDR.to_string(), "127.0.0.1:6868".to_string());
        if bootstrap {
            tags.insert(TAG_BOOTSTRAP.to_string(), "1".to_string());
        }
        Member {
            name: name.to_string(),
            addr: "127.0.0.1".parse().unwrap(),
            port: 8946,
            status,
            tags,
        }
    }

    fn voter(name: &str) -> RaftServer {
        RaftServer {
            id: server_id(name),
            name: name.to_string(),
            address: "127.0.0.1:6868".to_string(),
        }
    }

    fn reconciler(raft: RaftHandle, node_name: &str) -> Reconciler {
        Reconciler::new(raft, node_name.to_string(), DEFAULT_SELF_JOIN_THRESHOLD)
    }

    #[tokio::test]
    async fn alive_member_becomes_voter() {
        let (raft, state) = mock_raft(vec![]);
        let r = reconciler(raft, "me");
        let beta = member("beta", MemberStatus::Alive, false);
        r.refresh_member(&beta, std::slice::from_ref(&beta))
            .await
            .unwrap();
        assert_eq!(*state.ops.lock().unwrap(), vec![Op::Add(server_id("beta"))]);
    }

    #[tokio::test]
    async fn member_without_server_tags_is_ignored() {
        let (raft, state) = mock_raft(vec![]);
        let r = reconciler(raft, "me");
        let mut stranger = member("stranger", MemberStatus::Alive, false);
        stranger.tags.remove(TAG_ROLE);
        r.refresh_member(&stranger, std::slice::from_ref(&stranger))
            .await
            .unwrap();
        assert!(state.ops.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn existing_voter_is_left_alone() {
        let (raft, state) = mock_raft(vec![voter("beta")]);
        let r = reconciler(raft, "me");
        let beta = member("beta", MemberStatus::Alive, false);
        r.refresh_member(&beta, std::slice::from_ref(&beta))
            .await
            .unwrap();
        assert!(state.ops.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_entry_on_reused_address_is_replaced() {
        // The address is occupied by a dead node's id.
        let stale = RaftServer {
            id: server_id("old-ghost"),
            name: "old-ghost".to_string(),
            address: "127.0.0.1:6868".to_string(),
        };
        let (raft, state) = mock_raft(vec![stale]);
        let r = reconciler(raft, "me");
        let beta = member("beta", MemberStatus::Alive, false);
        r.refresh_member(&beta, std::slice::from_ref(&beta))
            .await
            .unwrap();
        assert_eq!(
            *state.ops.lock().unwrap(),
            vec![Op::Remove(server_id("old-ghost")), Op::Add(server_id("beta"))]
        );
    }

    #[tokio::test]
    async fn bootstrap_conflict_skips_pair_but_sweep_continues() {
        let (raft, state) = mock_raft(vec![]);
        let r = reconciler(raft, "me");
        let members = vec![
            member("boot-a", MemberStatus::Alive, true),
            member("boot-b", MemberStatus::Alive, true),
            member("normal", MemberStatus::Alive, false),
        ];
        r.refresh(&members).await.unwrap();
        // Neither bootstrap member is added; the sweep still reaches
        // the third member.
        assert_eq!(
            *state.ops.lock().unwrap(),
            vec![Op::Add(server_id("normal"))]
        );
    }

    #[tokio::test]
    async fn self_join_guard_skips_small_clusters() {
        let (raft, state) = mock_raft(vec![voter("me")]);
        let r = reconciler(raft, "me");
        let me = member("me", MemberStatus::Alive, false);
        r.refresh_member(&me, std::slice::from_ref(&me))
            .await
            .unwrap();
        assert!(state.ops.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn self_join_guard_threshold_is_tunable() {
        let (raft, state) = mock_raft(vec![]);
        let r = Reconciler::new(raft, "me".to_string(), 0);
        let me = member("me", MemberStatus::Alive, false);
        r.refresh_member(&me, std::slice::from_ref(&me))
            .await
            .unwrap();
        assert_eq!(*state.ops.lock().unwrap(), vec![Op::Add(server_id("me"))]);
    }

    #[tokio::test]
    async fn departed_member_is_removed() {
        let (raft, state) = mock_raft(vec![voter("beta"), voter("me")]);
        let r = reconciler(raft, "me");
        let beta = member("beta", MemberStatus::Left, false);
        r.refresh_member(&beta, std::slice::from_ref(&beta))
            .await
            .unwrap();
        assert_eq!(
            *state.ops.lock().unwrap(),
            vec![Op::Remove(server_id("beta"))]
        );
    }

    #[tokio::test]
    async fn leader_never_removes_itself() {
        let (raft, state) = mock_raft(vec![voter("me")]);
        let r = reconciler(raft, "me");
        let me = member("me", MemberStatus::Left, false);
        r.refresh_member(&me, std::slice::from_ref(&me))
            .await
            .unwrap();
        assert!(state.ops.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_member_keeps_its_vote() {
        let (raft, state) = mock_raft(vec![voter("beta")]);
        let r = reconciler(raft, "me");
        let beta = member("beta", MemberStatus::Failed, false);
        r.refresh_member(&beta, std::slice::from_ref(&beta))
            .await
            .unwrap();
        assert!(state.ops.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_aborts_on_first_error() {
        let (raft, state) = mock_raft(vec![]);
        *state.fail_add_for.lock().unwrap() = Some(server_id("flaky"));
        let r = reconciler(raft, "me");
        let members = vec![
            member("flaky", MemberStatus::Alive, false),
            member("later", MemberStatus::Alive, false),
        ];
        assert!(r.refresh(&members).await.is_err());
        // The member after the failure is never attempted.
        assert!(state.ops.lock().unwrap().is_empty());
    }

    async fn wait_for_barriers(state: &MockState, count: usize) {
        timeout(Duration::from_secs(10), async {
            loop {
                if state.barriers.load(Ordering::SeqCst) >= count {
                    return;
                }
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("barrier count never reached");
    }

    #[tokio::test]
    async fn monitor_runs_at_most_one_reconciler_loop() {
        let (raft, state) = mock_raft(vec![]);
        let reconciler = Arc::new(Reconciler::new(
            raft,
            "monitor-node".to_string(),
            DEFAULT_SELF_JOIN_THRESHOLD,
        ));
        let (membership, _events) = Gossip::start(GossipConfig {
            node_name: "monitor-node".to_string(),
            bind_addr: "127.0.0.1:18970".parse().unwrap(),
            advertise_addr: "127.0.0.1:18970".parse().unwrap(),
            keyring: Keyring::plaintext(),
            profile: Profile::Local,
            reconnect_timeout: Duration::from_secs(3600),
            tags: HashMap::new(),
        })
        .await
        .unwrap();

        let (leader_tx, leader_rx) = mpsc::unbounded_channel();
        let (member_signal, _keep) = broadcast::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = tokio::spawn(monitor_leadership(
            leader_rx,
            reconciler,
            membership.clone(),
            member_signal,
            Duration::from_secs(3600),
            shutdown_rx,
        ));

        // First acquisition starts one loop, which issues one barrier.
        leader_tx.send(true).unwrap();
        wait_for_barriers(&state, 1).await;

        // A duplicate acquisition is rejected; no second loop appears.
        leader_tx.send(true).unwrap();
        sleep(Duration::from_millis(200)).await;
        assert_eq!(state.barriers.load(Ordering::SeqCst), 1);

        // Loss stops the loop; the next acquisition starts a fresh one.
        leader_tx.send(false).unwrap();
        leader_tx.send(true).unwrap();
        wait_for_barriers(&state, 2).await;

        let _ = shutdown_tx.send(true);
        timeout(Duration::from_secs(5), monitor)
            .await
            .expect("monitor did not exit on shutdown")
            .unwrap();
        membership.shutdown().await;
    }
}
