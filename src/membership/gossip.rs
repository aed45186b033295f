//! SWIM-style gossip membership over a single UDP socket.
//!
//! One background task owns the peer table and the socket. It probes a
//! random live peer every probe interval, spreads full member state to a
//! small fanout on the sync interval, and resolves conflicting views
//! with per-member incarnation numbers (a node hearing rumors of its own
//! death refutes them with a higher incarnation). All packets are sealed
//! through the cluster [`Keyring`].

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant};

use crate::error::{Error, Result};
use crate::membership::crypto::Keyring;
use crate::membership::{Member, MemberEvent, MemberStatus};

const MAX_PACKET: usize = 64 * 1024;
const EVENT_CHANNEL_SIZE: usize = 4096;
const COMMAND_CHANNEL_SIZE: usize = 64;
const SYNC_FANOUT: usize = 3;

/// Gossip timing profile. Unknown profile names are fatal at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Lan,
    Wan,
    Local,
}

impl Profile {
    pub fn parse(name: &str) -> Result<Profile> {
        match name {
            "lan" => Ok(Profile::Lan),
            "wan" => Ok(Profile::Wan),
            "local" => Ok(Profile::Local),
            other => Err(Error::Config(format!("unknown profile: {other}"))),
        }
    }

    fn probe_interval(self) -> Duration {
        match self {
            Profile::Lan => Duration::from_secs(1),
            Profile::Wan => Duration::from_secs(5),
            Profile::Local => Duration::from_millis(250),
        }
    }

    fn probe_timeout(self) -> Duration {
        match self {
            Profile::Lan => Duration::from_millis(500),
            Profile::Wan => Duration::from_secs(3),
            Profile::Local => Duration::from_millis(200),
        }
    }

    fn sync_interval(self) -> Duration {
        match self {
            Profile::Lan => Duration::from_secs(30),
            Profile::Wan => Duration::from_secs(60),
            Profile::Local => Duration::from_millis(500),
        }
    }

    /// Missed probes tolerated before a peer is declared failed.
    fn suspicion(self) -> u32 {
        match self {
            Profile::Lan => 4,
            Profile::Wan => 6,
            Profile::Local => 2,
        }
    }

    fn join_timeout(self) -> Duration {
        self.probe_timeout() * 4
    }
}

pub struct GossipConfig {
    pub node_name: String,
    pub bind_addr: SocketAddr,
    pub advertise_addr: SocketAddr,
    pub keyring: Keyring,
    pub profile: Profile,
    pub reconnect_timeout: Duration,
    pub tags: HashMap<String, String>,
}

/// Per-member state as it travels on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeState {
    name: String,
    addr: SocketAddr,
    incarnation: u64,
    status: MemberStatus,
    tags: HashMap<String, String>,
}

impl NodeState {
    fn to_member(&self) -> Member {
        Member {
            name: self.name.clone(),
            addr: self.addr.ip(),
            port: self.addr.port(),
            status: self.status,
            tags: self.tags.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum Packet {
    Ping {
        seq: u64,
        from: NodeState,
    },
    Ack {
        seq: u64,
        from: NodeState,
        peers: Vec<NodeState>,
    },
    Sync {
        from: NodeState,
        peers: Vec<NodeState>,
    },
    Leave {
        name: String,
        incarnation: u64,
    },
}

enum Command {
    Join {
        seeds: Vec<SocketAddr>,
        reply: oneshot::Sender<usize>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
    Members {
        reply: oneshot::Sender<Vec<Member>>,
    },
    LocalMember {
        reply: oneshot::Sender<Member>,
    },
    SetTags {
        tags: HashMap<String, String>,
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Cloneable handle to the gossip task.
#[derive(Clone)]
pub struct GossipHandle {
    commands: mpsc::Sender<Command>,
}

impl GossipHandle {
    /// Attempts to contact each seed and returns how many answered.
    /// Unreachable or empty seed lists are not fatal.
    pub async fn join(&self, seeds: &[String]) -> Result<usize> {
        let mut resolved = Vec::new();
        for seed in seeds {
            match tokio::net::lookup_host(seed.as_str()).await {
                Ok(mut addrs) => {
                    if let Some(addr) = addrs.next() {
                        resolved.push(addr);
                    }
                }
                Err(e) => log::warn!("gossip: cannot resolve join address {seed}: {e}"),
            }
        }
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Join {
                seeds: resolved,
                reply,
            })
            .await
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    pub async fn leave(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Leave { reply })
            .await
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// All known members, the local node included.
    pub async fn members(&self) -> Result<Vec<Member>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Members { reply })
            .await
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    pub async fn local_member(&self) -> Result<Member> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::LocalMember { reply })
            .await
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Replaces the local tag set and gossips the change.
    pub async fn set_tags(&self, tags: HashMap<String, String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::SetTags { tags, reply })
            .await
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

pub struct Gossip;

impl Gossip {
    /// Binds the gossip socket and spawns the membership task. A bind
    /// failure is fatal to startup.
    pub async fn start(config: GossipConfig) -> Result<(GossipHandle, mpsc::Receiver<MemberEvent>)> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        log::info!(
            "gossip: listening on {} advertising {}",
            config.bind_addr,
            config.advertise_addr
        );

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);

        let pump = Pump {
            socket,
            local: NodeState {
                name: config.node_name.clone(),
                addr: config.advertise_addr,
                incarnation: 0,
                status: MemberStatus::Alive,
                tags: config.tags.clone(),
            },
            keyring: config.keyring.clone(),
            profile: config.profile,
            reconnect_timeout: config.reconnect_timeout,
            peers: HashMap::new(),
            probes: HashMap::new(),
            join_wait: None,
            seq: 0,
            commands: command_rx,
            events: event_tx,
        };
        tokio::spawn(pump.run());

        Ok((GossipHandle { commands: command_tx }, event_rx))
    }
}

struct PeerEntry {
    state: NodeState,
    misses: u32,
    down_since: Option<Instant>,
}

struct JoinWait {
    awaiting: HashSet<SocketAddr>,
    contacted: usize,
    deadline: Instant,
    reply: Option<oneshot::Sender<usize>>,
}

struct Pump {
    socket: UdpSocket,
    local: NodeState,
    keyring: Keyring,
    profile: Profile,
    reconnect_timeout: Duration,
    peers: HashMap<String, PeerEntry>,
    probes: HashMap<u64, (String, Instant)>,
    join_wait: Option<JoinWait>,
    seq: u64,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<MemberEvent>,
}

impl Pump {
    async fn run(mut self) {
        let mut buf = vec![0u8; MAX_PACKET];
        let mut probe_timer = interval(self.profile.probe_interval());
        let mut sync_timer = interval(self.profile.sync_interval());

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => self.handle_datagram(&buf[..len], from).await,
                        Err(e) => log::warn!("gossip: receive error: {e}"),
                    }
                }
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => {
                            log::info!("gossip: membership task stopping");
                            return;
                        }
                        Some(command) => self.handle_command(command).await,
                    }
                }
                _ = probe_timer.tick() => self.on_probe_tick().await,
                _ = sync_timer.tick() => self.broadcast_sync().await,
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Join { seeds, reply } => {
                if seeds.is_empty() {
                    let _ = reply.send(0);
                    return;
                }
                let packet = Packet::Sync {
                    from: self.local.clone(),
                    peers: self.known_states(),
                };
                let mut awaiting = HashSet::new();
                for seed in &seeds {
                    if *seed == self.local.addr {
                        continue;
                    }
                    self.send(*seed, &packet).await;
                    awaiting.insert(*seed);
                }
                if awaiting.is_empty() {
                    let _ = reply.send(0);
                    return;
                }
                self.join_wait = Some(JoinWait {
                    awaiting,
                    contacted: 0,
                    deadline: Instant::now() + self.profile.join_timeout(),
                    reply: Some(reply),
                });
            }
            Command::Leave { reply } => {
                self.local.incarnation += 1;
                self.local.status = MemberStatus::Left;
                let packet = Packet::Leave {
                    name: self.local.name.clone(),
                    incarnation: self.local.incarnation,
                };
                let targets: Vec<SocketAddr> =
                    self.peers.values().map(|p| p.state.addr).collect();
                for addr in targets {
                    self.send(addr, &packet).await;
                }
                log::info!("gossip: announced graceful leave");
                let _ = reply.send(());
            }
            Command::Members { reply } => {
                let mut members = vec![self.local.to_member()];
                members.extend(self.peers.values().map(|p| p.state.to_member()));
                let _ = reply.send(members);
            }
            Command::LocalMember { reply } => {
                let _ = reply.send(self.local.to_member());
            }
            Command::SetTags { tags, reply } => {
                self.local.tags = tags;
                self.local.incarnation += 1;
                self.broadcast_sync().await;
                let _ = reply.send(());
            }
            Command::Shutdown => unreachable!("handled by the select loop"),
        }
    }

    async fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) {
        let plain = match self.keyring.open(data) {
            Ok(plain) => plain,
            Err(e) => {
                log::warn!("gossip: dropping packet from {from}: {e}");
                return;
            }
        };
        let packet: Packet = match bincode::deserialize(&plain) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("gossip: dropping malformed packet from {from}: {e}");
                return;
            }
        };

        if let Some(wait) = self.join_wait.as_mut() {
            if wait.awaiting.remove(&from) {
                wait.contacted += 1;
            }
        }

        match packet {
            Packet::Ping { seq, from: sender } => {
                self.merge_state(sender.clone()).await;
                let ack = Packet::Ack {
                    seq,
                    from: self.local.clone(),
                    peers: self.known_states(),
                };
                self.send(sender.addr, &ack).await;
            }
            Packet::Ack { seq, from: sender, peers } => {
                if let Some((name, _)) = self.probes.remove(&seq) {
                    if let Some(entry) = self.peers.get_mut(&name) {
                        entry.misses = 0;
                    }
                }
                self.merge_state(sender).await;
                for state in peers {
                    self.merge_state(state).await;
                }
            }
            Packet::Sync { from: sender, peers } => {
                let sender_addr = sender.addr;
                self.merge_state(sender).await;
                for state in peers {
                    self.merge_state(state).await;
                }
                // Answer with our view so a joining node learns the
                // cluster in one round trip.
                let ack = Packet::Ack {
                    seq: 0,
                    from: self.local.clone(),
                    peers: self.known_states(),
                };
                self.send(sender_addr, &ack).await;
            }
            Packet::Leave { name, incarnation } => {
                if name == self.local.name {
                    self.refute(incarnation).await;
                    return;
                }
                if let Some(entry) = self.peers.get_mut(&name) {
                    if incarnation >= entry.state.incarnation
                        && entry.state.status != MemberStatus::Left
                    {
                        entry.state.incarnation = incarnation;
                        entry.state.status = MemberStatus::Left;
                        entry.down_since = Some(Instant::now());
                        let member = entry.state.to_member();
                        self.emit(MemberEvent::Leave(member));
                    }
                }
            }
        }
    }

    async fn on_probe_tick(&mut self) {
        // Settle an expired join attempt.
        if let Some(wait) = self.join_wait.as_mut() {
            if Instant::now() >= wait.deadline || wait.awaiting.is_empty() {
                let contacted = wait.contacted;
                if let Some(reply) = wait.reply.take() {
                    let _ = reply.send(contacted);
                }
                self.join_wait = None;
            }
        }

        // Overdue probes raise the peer's suspicion count.
        let probe_timeout = self.profile.probe_timeout();
        let overdue: Vec<u64> = self
            .probes
            .iter()
            .filter(|(_, (_, sent_at))| sent_at.elapsed() >= probe_timeout)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in overdue {
            let (name, _) = self.probes.remove(&seq).unwrap();
            let suspicion = self.profile.suspicion();
            if let Some(entry) = self.peers.get_mut(&name) {
                entry.misses += 1;
                if entry.misses >= suspicion && entry.state.status == MemberStatus::Alive {
                    entry.state.status = MemberStatus::Failed;
                    entry.down_since = Some(Instant::now());
                    let member = entry.state.to_member();
                    log::warn!("gossip: member {} failed after {} missed probes", name, entry.misses);
                    self.emit(MemberEvent::Failed(member));
                }
            }
        }

        // Reap members that stayed down past the reconnect window.
        let reconnect_timeout = self.reconnect_timeout;
        let reaped: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, entry)| {
                matches!(
                    entry.state.status,
                    MemberStatus::Failed | MemberStatus::Left
                ) && entry
                    .down_since
                    .map(|t| t.elapsed() >= reconnect_timeout)
                    .unwrap_or(false)
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in reaped {
            if let Some(entry) = self.peers.remove(&name) {
                log::info!("gossip: reaping member {name}");
                self.emit(MemberEvent::Reap(entry.state.to_member()));
            }
        }

        // Probe one random live peer.
        let candidates: Vec<(String, SocketAddr)> = self
            .peers
            .values()
            .filter(|p| p.state.status == MemberStatus::Alive)
            .map(|p| (p.state.name.clone(), p.state.addr))
            .collect();
        let chosen = candidates.choose(&mut rand::thread_rng()).cloned();
        if let Some((name, addr)) = chosen {
            self.seq += 1;
            let seq = self.seq;
            self.probes.insert(seq, (name, Instant::now()));
            let ping = Packet::Ping {
                seq,
                from: self.local.clone(),
            };
            self.send(addr, &ping).await;
        }
    }

    /// Pushes the full member view to a random fanout of peers.
    async fn broadcast_sync(&mut self) {
        let packet = Packet::Sync {
            from: self.local.clone(),
            peers: self.known_states(),
        };
        let mut targets: Vec<SocketAddr> = self
            .peers
            .values()
            .filter(|p| p.state.status == MemberStatus::Alive)
            .map(|p| p.state.addr)
            .collect();
        targets.shuffle(&mut rand::thread_rng());
        for addr in targets.into_iter().take(SYNC_FANOUT) {
            self.send(addr, &packet).await;
        }
    }

    /// Folds a remote view of one member into the local table, emitting
    /// the corresponding event when the view actually changes.
    async fn merge_state(&mut self, state: NodeState) {
        if state.name == self.local.name {
            if state.status != MemberStatus::Alive && state.incarnation >= self.local.incarnation {
                self.refute(state.incarnation).await;
            }
            return;
        }

        if !self.peers.contains_key(&state.name) {
            let event = match state.status {
                MemberStatus::Alive | MemberStatus::Leaving => {
                    Some(MemberEvent::Join(state.to_member()))
                }
                // Learning about an already-dead stranger is not news.
                MemberStatus::Left | MemberStatus::Failed => None,
            };
            self.peers.insert(
                state.name.clone(),
                PeerEntry {
                    down_since: match state.status {
                        MemberStatus::Alive | MemberStatus::Leaving => None,
                        _ => Some(Instant::now()),
                    },
                    state,
                    misses: 0,
                },
            );
            if let Some(event) = event {
                self.emit(event);
            }
            return;
        }

        let entry = self.peers.get_mut(&state.name).expect("peer just checked");
        let newer = state.incarnation > entry.state.incarnation
            || (state.incarnation == entry.state.incarnation
                && status_rank(state.status) > status_rank(entry.state.status));
        if !newer {
            return;
        }
        let old_status = entry.state.status;
        let changed_shape = entry.state.tags != state.tags || entry.state.addr != state.addr;
        entry.state = state;
        let event = match (old_status, entry.state.status) {
            (MemberStatus::Alive, MemberStatus::Alive) if changed_shape => {
                entry.misses = 0;
                Some(MemberEvent::Update(entry.state.to_member()))
            }
            (MemberStatus::Alive, MemberStatus::Alive) => None,
            (_, MemberStatus::Alive) => {
                entry.misses = 0;
                entry.down_since = None;
                Some(MemberEvent::Join(entry.state.to_member()))
            }
            (MemberStatus::Alive, MemberStatus::Failed) => {
                entry.down_since = Some(Instant::now());
                Some(MemberEvent::Failed(entry.state.to_member()))
            }
            (_, MemberStatus::Leaving | MemberStatus::Left)
                if old_status != MemberStatus::Left =>
            {
                entry.down_since = Some(Instant::now());
                Some(MemberEvent::Leave(entry.state.to_member()))
            }
            _ => None,
        };
        if let Some(event) = event {
            self.emit(event);
        }
    }

    /// A rumor says we are down; outbid it and spread the correction.
    async fn refute(&mut self, rumor_incarnation: u64) {
        self.local.incarnation = rumor_incarnation + 1;
        log::info!(
            "gossip: refuting death rumor with incarnation {}",
            self.local.incarnation
        );
        self.broadcast_sync().await;
    }

    fn known_states(&self) -> Vec<NodeState> {
        let mut states: Vec<NodeState> = self.peers.values().map(|p| p.state.clone()).collect();
        states.push(self.local.clone());
        states
    }

    fn emit(&self, event: MemberEvent) {
        if let Err(e) = self.events.try_send(event) {
            log::warn!("gossip: dropping member event, consumer is behind: {e}");
        }
    }

    async fn send(&self, to: SocketAddr, packet: &Packet) {
        let plain = match bincode::serialize(packet) {
            Ok(plain) => plain,
            Err(e) => {
                log::error!("gossip: failed to serialize packet: {e}");
                return;
            }
        };
        let sealed = self.keyring.seal(&plain);
        if let Err(e) = self.socket.send_to(&sealed, to).await {
            log::debug!("gossip: send to {to} failed: {e}");
        }
    }
}

fn status_rank(status: MemberStatus) -> u8 {
    match status {
        MemberStatus::Alive => 0,
        MemberStatus::Leaving => 1,
        MemberStatus::Failed => 2,
        MemberStatus::Left => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn config(name: &str, port: u16, reconnect: Duration) -> GossipConfig {
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        GossipConfig {
            node_name: name.to_string(),
            bind_addr: addr,
            advertise_addr: addr,
            keyring: Keyring::plaintext(),
            profile: Profile::Local,
            reconnect_timeout: reconnect,
            tags: HashMap::new(),
        }
    }

    async fn start_node(
        name: &str,
        port: u16,
    ) -> (GossipHandle, mpsc::Receiver<MemberEvent>) {
        Gossip::start(config(name, port, Duration::from_secs(3600)))
            .await
            .unwrap()
    }

    async fn wait_for_event<F>(
        events: &mut mpsc::Receiver<MemberEvent>,
        mut pred: F,
    ) -> MemberEvent
    where
        F: FnMut(&MemberEvent) -> bool,
    {
        timeout(Duration::from_secs(10), async {
            loop {
                let event = events.recv().await.expect("event channel closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for member event")
    }

    #[tokio::test]
    async fn join_with_no_seeds_contacts_nobody() {
        let (handle, _events) = start_node("solo", 18946).await;
        assert_eq!(handle.join(&[]).await.unwrap(), 0);
        let members = handle.members().await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "solo");
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn join_against_unreachable_seed_is_not_fatal() {
        let (handle, _events) = start_node("lonely", 18947).await;
        let contacted = handle
            .join(&["127.0.0.1:1".to_string()])
            .await
            .unwrap();
        assert_eq!(contacted, 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn two_nodes_discover_each_other() {
        let (a, mut a_events) = start_node("alpha", 18948).await;
        let (b, mut b_events) = start_node("beta", 18949).await;

        let contacted = b.join(&["127.0.0.1:18948".to_string()]).await.unwrap();
        assert_eq!(contacted, 1);

        wait_for_event(&mut a_events, |e| {
            matches!(e, MemberEvent::Join(m) if m.name == "beta")
        })
        .await;
        wait_for_event(&mut b_events, |e| {
            matches!(e, MemberEvent::Join(m) if m.name == "alpha")
        })
        .await;

        let members = a.members().await.unwrap();
        assert_eq!(members.len(), 2);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn tag_change_emits_update() {
        let (a, _a_events) = start_node("alpha", 18950).await;
        let (b, mut b_events) = start_node("beta", 18951).await;
        b.join(&["127.0.0.1:18950".to_string()]).await.unwrap();
        wait_for_event(&mut b_events, |e| {
            matches!(e, MemberEvent::Join(m) if m.name == "alpha")
        })
        .await;

        let mut tags = HashMap::new();
        tags.insert("rpc_addr".to_string(), "127.0.0.1:6868".to_string());
        a.set_tags(tags).await.unwrap();

        let event = wait_for_event(&mut b_events, |e| {
            matches!(e, MemberEvent::Update(m) if m.name == "alpha")
        })
        .await;
        assert_eq!(
            event.member().tags.get("rpc_addr").map(String::as_str),
            Some("127.0.0.1:6868")
        );

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn graceful_leave_is_announced() {
        let (a, mut a_events) = start_node("alpha", 18952).await;
        let (b, mut b_events) = start_node("beta", 18953).await;
        b.join(&["127.0.0.1:18952".to_string()]).await.unwrap();
        wait_for_event(&mut a_events, |e| {
            matches!(e, MemberEvent::Join(m) if m.name == "beta")
        })
        .await;
        wait_for_event(&mut b_events, |e| {
            matches!(e, MemberEvent::Join(m) if m.name == "alpha")
        })
        .await;

        b.leave().await.unwrap();

        let event = wait_for_event(&mut a_events, |e| {
            matches!(e, MemberEvent::Leave(m) if m.name == "beta")
        })
        .await;
        assert_eq!(event.member().status, MemberStatus::Left);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn dead_peer_is_failed_then_reaped() {
        let (a, mut a_events) =
            Gossip::start(config("alpha", 18954, Duration::from_millis(500)))
                .await
                .unwrap();
        let (b, mut b_events) = start_node("beta", 18955).await;
        b.join(&["127.0.0.1:18954".to_string()]).await.unwrap();
        wait_for_event(&mut a_events, |e| {
            matches!(e, MemberEvent::Join(m) if m.name == "beta")
        })
        .await;
        wait_for_event(&mut b_events, |e| {
            matches!(e, MemberEvent::Join(m) if m.name == "alpha")
        })
        .await;

        // Kill beta without a leave announcement.
        b.shutdown().await;

        wait_for_event(&mut a_events, |e| {
            matches!(e, MemberEvent::Failed(m) if m.name == "beta")
        })
        .await;
        wait_for_event(&mut a_events, |e| {
            matches!(e, MemberEvent::Reap(m) if m.name == "beta")
        })
        .await;

        let members = a.members().await.unwrap();
        assert_eq!(members.len(), 1);
        a.shutdown().await;
    }
}
