//! gRPC surface: key-value CRUD plus the administrative raft calls.
//!
//! Mutating calls must run on the leader; a follower answers with a
//! FAILED_PRECONDITION status naming the leader's advertised address so
//! clients can redial. Reads are served from local state.

use tonic::{Request, Response, Status};

use crate::command::Command;
use crate::error::Error;
use crate::membership::GossipHandle;
use crate::raft::handle::{RaftHandle, RaftRole};
use crate::raft::RAFT_TIMEOUT;
use crate::store::KvStore;

use pb::taskvault_server::{Taskvault, TaskvaultServer};

#[allow(clippy::module_inception)]
pub mod pb {
    tonic::include_proto!("taskvault");
}

pub struct KvServiceSVC {
    store: KvStore,
    raft: RaftHandle,
    membership: GossipHandle,
}

impl KvServiceSVC {
    pub fn new(store: KvStore, raft: RaftHandle, membership: GossipHandle) -> Self {
        KvServiceSVC {
            store,
            raft,
            membership,
        }
    }

    pub fn into_server(self) -> TaskvaultServer<KvServiceSVC> {
        TaskvaultServer::new(self)
    }

    /// Rejects the call when this node is not the leader, naming the
    /// leader's advertised address. Every mutating handler runs this
    /// before any other precondition, so followers answer uniformly.
    async fn ensure_leader(&self) -> Result<(), Status> {
        let status = self.raft.status().await.map_err(to_status)?;
        if status.role != RaftRole::Leader {
            let err = Error::NotLeader {
                leader: status.leader_addr,
            };
            return Err(Status::failed_precondition(err.to_string()));
        }
        Ok(())
    }

    /// Routes a mutation through the replicated log.
    async fn submit(&self, command: Command) -> Result<(), Status> {
        self.ensure_leader().await?;
        let data = command.encode().map_err(to_status)?;
        self.raft.apply(data, RAFT_TIMEOUT).await.map_err(to_status)
    }
}

fn to_status(e: Error) -> Status {
    match e {
        Error::NotLeader { .. } => Status::failed_precondition(e.to_string()),
        Error::Timeout(_) => Status::deadline_exceeded(e.to_string()),
        Error::Shutdown => Status::unavailable(e.to_string()),
        other => Status::internal(other.to_string()),
    }
}

#[tonic::async_trait]
impl Taskvault for KvServiceSVC {
    async fn create_value(
        &self,
        request: Request<pb::KeyValue>,
    ) -> Result<Response<pb::OperationAck>, Status> {
        let kv = request.into_inner();
        self.ensure_leader().await?;
        if self.store.get(&kv.key).is_some() {
            return Err(Status::already_exists(format!(
                "key {:?} already exists",
                kv.key
            )));
        }
        self.submit(Command::SetPair {
            key: kv.key,
            value: kv.value,
        })
        .await?;
        Ok(Response::new(pb::OperationAck { ok: true }))
    }

    async fn get_value(
        &self,
        request: Request<pb::Key>,
    ) -> Result<Response<pb::KeyValue>, Status> {
        let key = request.into_inner().key;
        match self.store.get(&key) {
            Some(value) => Ok(Response::new(pb::KeyValue { key, value })),
            None => Err(Status::not_found(format!("key {key:?} not found"))),
        }
    }

    async fn update_value(
        &self,
        request: Request<pb::KeyValue>,
    ) -> Result<Response<pb::OperationAck>, Status> {
        let kv = request.into_inner();
        self.ensure_leader().await?;
        if self.store.get(&kv.key).is_none() {
            return Err(Status::not_found(format!("key {:?} not found", kv.key)));
        }
        self.submit(Command::SetPair {
            key: kv.key,
            value: kv.value,
        })
        .await?;
        Ok(Response::new(pb::OperationAck { ok: true }))
    }

    async fn delete_value(
        &self,
        request: Request<pb::Key>,
    ) -> Result<Response<pb::OperationAck>, Status> {
        let key = request.into_inner().key;
        // Deleting an absent key replicates as a no-op.
        self.submit(Command::DeletePair { key }).await?;
        Ok(Response::new(pb::OperationAck { ok: true }))
    }

    async fn get_all_pairs(
        &self,
        _request: Request<pb::Empty>,
    ) -> Result<Response<pb::PairList>, Status> {
        let pairs = self
            .store
            .all()
            .into_iter()
            .map(|(key, value)| pb::KeyValue { key, value })
            .collect();
        Ok(Response::new(pb::PairList { pairs }))
    }

    async fn leave(
        &self,
        _request: Request<pb::Empty>,
    ) -> Result<Response<pb::OperationAck>, Status> {
        log::info!("rpc: leave requested, announcing departure to the cluster");
        self.membership
            .leave()
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(pb::OperationAck { ok: true }))
    }

    async fn raft_get_configuration(
        &self,
        _request: Request<pb::Empty>,
    ) -> Result<Response<pb::RaftConfiguration>, Status> {
        let servers = self
            .raft
            .configuration()
            .await
            .map_err(to_status)?
            .into_iter()
            .map(|s| pb::RaftServer {
                id: s.id,
                name: s.name,
                address: s.address,
            })
            .collect();
        Ok(Response::new(pb::RaftConfiguration { servers }))
    }

    async fn raft_remove_peer_by_id(
        &self,
        request: Request<pb::RemovePeerRequest>,
    ) -> Result<Response<pb::OperationAck>, Status> {
        let id = request.into_inner().id;
        log::info!("rpc: operator removal of raft peer {id}");
        self.raft
            .remove_server(id, RAFT_TIMEOUT)
            .await
            .map_err(to_status)?;
        Ok(Response::new(pb::OperationAck { ok: true }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::crypto::Keyring;
    use crate::membership::gossip::{Gossip, GossipConfig, Profile};
    use crate::raft::handle::{RaftRequest, RaftStatus};
    use std::collections::HashMap;
    use std::time::Duration;

    async fn follower_service() -> KvServiceSVC {
        let store = KvStore::new();
        let (raft, mut rx) = RaftHandle::channel();
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                match request {
                    RaftRequest::Status { reply } => {
                        let _ = reply.send(RaftStatus {
                            role: RaftRole::Follower,
                            leader_id: Some(42),
                            leader_addr: Some("10.1.2.3:6868".to_string()),
                        });
                    }
                    RaftRequest::Shutdown { reply } => {
                        let _ = reply.send(());
                        return;
                    }
                    _ => {}
                }
            }
        });
        let (membership, _events) = Gossip::start(GossipConfig {
            node_name: "svc-test".to_string(),
            // Ephemeral port: several tests build this fixture.
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            advertise_addr: "127.0.0.1:0".parse().unwrap(),
            keyring: Keyring::plaintext(),
            profile: Profile::Local,
            reconnect_timeout: Duration::from_secs(3600),
            tags: HashMap::new(),
        })
        .await
        .unwrap();
        KvServiceSVC::new(store, raft, membership)
    }

    #[tokio::test]
    async fn mutations_on_a_follower_name_the_leader() {
        let service = follower_service().await;
        let err = service
            .create_value(Request::new(pb::KeyValue {
                key: "k".into(),
                value: "v".into(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::FailedPrecondition);
        assert!(err.message().contains("10.1.2.3:6868"));
    }

    #[tokio::test]
    async fn follower_rejects_mutations_before_checking_preconditions() {
        let service = follower_service().await;
        service.store.set("taken".into(), "x".into());

        // The key already exists locally, which would trip the
        // AlreadyExists precondition; not-leader must win anyway.
        let err = service
            .create_value(Request::new(pb::KeyValue {
                key: "taken".into(),
                value: "y".into(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::FailedPrecondition);

        // Same for update: both the present and the absent key answer
        // not-leader, never NotFound.
        let err = service
            .update_value(Request::new(pb::KeyValue {
                key: "taken".into(),
                value: "y".into(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::FailedPrecondition);

        let err = service
            .update_value(Request::new(pb::KeyValue {
                key: "absent".into(),
                value: "y".into(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn reads_are_served_locally() {
        let service = follower_service().await;
        service.store.set("present".into(), "here".into());

        let got = service
            .get_value(Request::new(pb::Key {
                key: "present".into(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(got.value, "here");

        let missing = service
            .get_value(Request::new(pb::Key {
                key: "absent".into(),
            }))
            .await
            .unwrap_err();
        assert_eq!(missing.code(), tonic::Code::NotFound);
    }
}
