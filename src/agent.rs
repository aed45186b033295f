//! Agent wiring: constructs the membership, replication, transport,
//! and reconciliation components from a [`Config`] and runs their
//! lifecycle.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;

use crate::config::Config;
use crate::error::Result;
use crate::fsm::KvFsm;
use crate::kv_service::KvServiceSVC;
use crate::membership::crypto::Keyring;
use crate::membership::{
    server_id, Gossip, GossipConfig, GossipHandle, Member, MemberEvent, MemberStatus, Profile,
    ServerParts, CLUSTER_ROLE, TAG_BOOTSTRAP, TAG_EXPECT, TAG_ID, TAG_PORT, TAG_ROLE,
    TAG_RPC_ADDR, TAG_VERSION,
};
use crate::metrics;
use crate::raft::handle::RaftHandle;
use crate::raft::node::{RaftNode, RaftNodeConfig};
use crate::raft::storage::{RaftStorage, StorageProfile};
use crate::reconcile::{monitor_leadership, Reconciler};
use crate::store::KvStore;
use crate::transport::lookup::ServerRecord;
use crate::transport::raft_layer::{self, RaftStreamLayer};
use crate::transport::{ServerLookup, StreamMux};

const MEMBER_SIGNAL_SIZE: usize = 256;

pub struct Agent {
    config: Arc<Config>,
    store: KvStore,
    lookup: Arc<ServerLookup>,
    membership: Option<GossipHandle>,
    raft: Option<RaftHandle>,
    member_signal: broadcast::Sender<Member>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Agent {
    pub fn new(config: Config) -> Agent {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (member_signal, _) = broadcast::channel(MEMBER_SIGNAL_SIZE);
        Agent {
            config: Arc::new(config),
            store: KvStore::new(),
            lookup: Arc::new(ServerLookup::new()),
            membership: None,
            raft: None,
            member_signal,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Brings every component up. Any error out of here is fatal and
    /// maps to a non-zero exit.
    pub async fn start(&mut self) -> Result<()> {
        log::info!(
            "agent: taskvault {} starting as {}",
            env!("CARGO_PKG_VERSION"),
            self.config.node_name
        );
        metrics::init_registry();

        let keyring = Keyring::from_base64(&self.config.encrypt_key)?;
        let profile = Profile::parse(&self.config.profile)?;

        let (membership, events) = Gossip::start(GossipConfig {
            node_name: self.config.node_name.clone(),
            bind_addr: self.config.gossip_bind_addr()?,
            advertise_addr: self.config.gossip_advertise_addr()?,
            keyring,
            profile,
            reconnect_timeout: self.config.serf_reconnect_timeout()?,
            tags: self.base_tags(),
        })
        .await?;
        self.membership = Some(membership.clone());

        // Join failures never abort startup; retry-join keeps trying in
        // the background.
        if self.config.retry_join.is_empty() {
            if !self.config.start_join.is_empty() {
                match membership.join(&self.config.start_join).await {
                    Ok(n) => log::info!("agent: joined {n} nodes"),
                    Err(e) => log::warn!(
                        "agent: cannot join {:?}: {e}",
                        self.config.start_join
                    ),
                }
            }
        } else {
            tokio::spawn(retry_join(
                membership.clone(),
                self.config.retry_join.clone(),
                self.config.retry_join_interval()?,
                self.shutdown_rx.clone(),
            ));
        }

        // One listener carries gRPC and the raft stream protocol.
        let listener = TcpListener::bind(self.config.bind_rpc_addr()?).await?;
        let local_rpc = listener.local_addr()?;
        let (mux, listeners) = StreamMux::new(listener, self.shutdown_rx.clone());
        tokio::spawn(mux.serve());

        let id = server_id(&self.config.node_name);
        let advertise_rpc = self.config.advertise_rpc_addr()?;
        self.lookup
            .insert(id, self.config.node_name.clone(), advertise_rpc);

        // Advertise the full server tags before raft comes up so peers
        // (and an expect-based bootstrap) can see how to reach us.
        let mut tags = self.base_tags();
        tags.insert(TAG_RPC_ADDR.to_string(), advertise_rpc.to_string());
        tags.insert(TAG_PORT.to_string(), advertise_rpc.port().to_string());
        membership.set_tags(tags).await?;

        let storage_profile = if self.config.dev_mode {
            StorageProfile::Dev
        } else {
            StorageProfile::Durable {
                data_dir: self.config.data_dir.clone(),
            }
        };
        let (storage, had_state) = RaftStorage::open(&storage_profile)?;

        let self_record = ServerRecord {
            id,
            name: self.config.node_name.clone(),
            addr: advertise_rpc,
        };
        let initial_servers = if had_state {
            Vec::new()
        } else if self.config.should_bootstrap() {
            vec![self_record]
        } else if self.config.bootstrap_expect > 1 {
            self.await_bootstrap_quorum(&membership).await
        } else {
            Vec::new()
        };

        let fsm = KvFsm::new(self.store.clone());
        let (raft, leader_rx, mailboxes) = RaftNode::spawn(
            RaftNodeConfig {
                id,
                node_name: self.config.node_name.clone(),
                initial_servers,
                raft_multiplier: self.config.raft_multiplier,
                debug_log: self.config.log_level == "debug",
            },
            storage,
            had_state,
            fsm,
            self.lookup.clone(),
            self.shutdown_rx.clone(),
        )?;
        self.raft = Some(raft.clone());

        let layer = RaftStreamLayer::new(listeners.raft, local_rpc);
        raft_layer::spawn_acceptor(layer, mailboxes.in_tx, self.shutdown_rx.clone());
        raft_layer::spawn_sender(
            mailboxes.out_rx,
            self.lookup.clone(),
            self.shutdown_rx.clone(),
        );

        let service = KvServiceSVC::new(self.store.clone(), raft.clone(), membership.clone());
        let incoming = ReceiverStream::new(listeners.grpc);
        let mut grpc_shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let served = tonic::transport::Server::builder()
                .add_service(service.into_server())
                .serve_with_incoming_shutdown(incoming, async move {
                    let _ = grpc_shutdown.changed().await;
                })
                .await;
            if let Err(e) = served {
                log::error!("agent: rpc server failed: {e}");
            }
        });
        log::info!("agent: rpc listening on {local_rpc}, advertising {advertise_rpc}");

        tokio::spawn(dispatch_events(
            events,
            self.lookup.clone(),
            self.member_signal.clone(),
            self.shutdown_rx.clone(),
        ));

        let reconciler = Arc::new(Reconciler::new(
            raft,
            self.config.node_name.clone(),
            self.config.self_join_threshold,
        ));
        tokio::spawn(monitor_leadership(
            leader_rx,
            reconciler,
            membership,
            self.member_signal.clone(),
            self.config.refresh_interval()?,
            self.shutdown_rx.clone(),
        ));

        metrics::spawn_exporter(self.config.metrics_addr()?, self.shutdown_rx.clone());
        Ok(())
    }

    /// Ordered teardown: signal every task, stop raft, close the store,
    /// leave the gossip pool, then shut gossip down.
    pub async fn stop(&mut self) -> Result<()> {
        log::info!("agent: stopping");
        let _ = self.shutdown_tx.send(true);
        if let Some(raft) = self.raft.take() {
            raft.shutdown().await;
        }
        self.store.shutdown();
        if let Some(membership) = self.membership.take() {
            membership.leave().await?;
            membership.shutdown().await;
        }
        Ok(())
    }

    /// Waits until bootstrap-expect servers are visible in gossip, then
    /// returns them as the deterministic initial voter set. Every
    /// expecting node computes the same sorted set, so they all seed an
    /// identical first configuration.
    async fn await_bootstrap_quorum(&self, membership: &GossipHandle) -> Vec<ServerRecord> {
        let expect = self.config.bootstrap_expect as usize;
        log::info!("agent: waiting for {expect} servers before bootstrapping");
        let mut shutdown = self.shutdown_rx.clone();
        loop {
            if let Ok(members) = membership.members().await {
                let mut servers: Vec<ServerRecord> = members
                    .iter()
                    .filter(|m| m.status == MemberStatus::Alive)
                    .filter_map(|m| {
                        ServerParts::from_member(m).map(|parts| ServerRecord {
                            id: parts.id,
                            name: m.name.clone(),
                            addr: SocketAddr::new(m.addr, parts.port),
                        })
                    })
                    .collect();
                if servers.len() >= expect {
                    servers.sort_by_key(|s| s.id);
                    log::info!(
                        "agent: bootstrap quorum reached with {:?}",
                        servers.iter().map(|s| s.name.clone()).collect::<Vec<_>>()
                    );
                    return servers;
                }
            }
            tokio::select! {
                _ = shutdown.changed() => return Vec::new(),
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }
    }

    /// Tags every server advertises from the moment it joins gossip.
    fn base_tags(&self) -> HashMap<String, String> {
        let mut tags = self.config.tags.clone();
        tags.insert(TAG_ROLE.to_string(), CLUSTER_ROLE.to_string());
        tags.insert(
            TAG_ID.to_string(),
            server_id(&self.config.node_name).to_string(),
        );
        tags.insert(TAG_VERSION.to_string(), env!("CARGO_PKG_VERSION").to_string());
        if self.config.bootstrap {
            tags.insert(TAG_BOOTSTRAP.to_string(), "1".to_string());
        }
        if self.config.bootstrap_expect != 0 {
            tags.insert(
                TAG_EXPECT.to_string(),
                self.config.bootstrap_expect.to_string(),
            );
        }
        tags
    }
}

/// Classifies member events: the address directory is updated before
/// the reconciler is signaled, so a triggered `AddVoter` always finds a
/// dialable address.
async fn dispatch_events(
    mut events: mpsc::Receiver<MemberEvent>,
    lookup: Arc<ServerLookup>,
    member_signal: broadcast::Sender<Member>,
    mut shutdown: watch::Receiver<bool>,
) {
    log::info!("agent: listening for member events");
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            event = events.recv() => {
                let Some(event) = event else { return };
                metrics::MEMBER_EVENT_COUNTER
                    .with_label_values(&[event.kind()])
                    .inc();
                log::info!(
                    "agent: member {} {}",
                    event.member().name,
                    event.kind()
                );
                match &event {
                    MemberEvent::Join(m) | MemberEvent::Update(m) => {
                        if let Some(parts) = ServerParts::from_member(m) {
                            let addr = SocketAddr::new(m.addr, parts.port);
                            lookup.insert(parts.id, m.name.clone(), addr);
                        }
                        let _ = member_signal.send(m.clone());
                    }
                    MemberEvent::Leave(m) | MemberEvent::Failed(m) => {
                        let _ = member_signal.send(m.clone());
                    }
                    MemberEvent::Reap(m) => {
                        lookup.remove_by_name(&m.name);
                    }
                }
            }
        }
    }
}

/// Keeps trying the seed list until somebody answers.
async fn retry_join(
    membership: GossipHandle,
    seeds: Vec<String>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    log::info!("agent: retry-join of {seeds:?} every {interval:?}");
    loop {
        match membership.join(&seeds).await {
            Ok(n) if n > 0 => {
                log::info!("agent: retry-join contacted {n} nodes");
                return;
            }
            Ok(_) => log::warn!("agent: retry-join could not reach any seed"),
            Err(e) => {
                log::warn!("agent: retry-join failed: {e}");
                return;
            }
        }
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
