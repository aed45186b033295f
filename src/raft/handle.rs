//! Async façade over the raft driver task.
//!
//! Every operation is a request on an mpsc channel answered through a
//! oneshot, so callers get future semantics while the driver stays
//! single-threaded. The handle is the only seam the reconciler and the
//! RPC layer see, which also makes both testable against a scripted
//! responder on the other end of the channel.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};

const REQUEST_CHANNEL_SIZE: usize = 256;

/// One voter as reported by `configuration()`. The address comes from
/// the gossip-populated server lookup, not from raft itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftServer {
    pub id: u64,
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Clone)]
pub struct RaftStatus {
    pub role: RaftRole,
    pub leader_id: Option<u64>,
    pub leader_addr: Option<String>,
}

pub enum RaftRequest {
    Apply {
        data: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    Barrier {
        reply: oneshot::Sender<Result<u64>>,
    },
    AddVoter {
        id: u64,
        name: String,
        addr: SocketAddr,
        reply: oneshot::Sender<Result<()>>,
    },
    RemoveServer {
        id: u64,
        reply: oneshot::Sender<Result<()>>,
    },
    GetConfiguration {
        reply: oneshot::Sender<Vec<RaftServer>>,
    },
    Status {
        reply: oneshot::Sender<RaftStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable client side of the driver channel.
#[derive(Clone)]
pub struct RaftHandle {
    requests: mpsc::Sender<RaftRequest>,
}

impl RaftHandle {
    /// Creates the handle and the request receiver the driver (or a
    /// test double) consumes.
    pub fn channel() -> (RaftHandle, mpsc::Receiver<RaftRequest>) {
        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
        (RaftHandle { requests: tx }, rx)
    }

    /// Submits an encoded command to the replicated log and waits until
    /// it is applied locally.
    pub async fn apply(&self, data: Vec<u8>, timeout: Duration) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(RaftRequest::Apply { data, reply }, rx, timeout)
            .await?
    }

    /// Waits until all entries committed before this call are applied.
    /// Returns the barrier's log index.
    pub async fn barrier(&self, timeout: Duration) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.request(RaftRequest::Barrier { reply }, rx, timeout)
            .await?
    }

    pub async fn add_voter(
        &self,
        id: u64,
        name: String,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(
            RaftRequest::AddVoter {
                id,
                name,
                addr,
                reply,
            },
            rx,
            timeout,
        )
        .await?
    }

    pub async fn remove_server(&self, id: u64, timeout: Duration) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(RaftRequest::RemoveServer { id, reply }, rx, timeout)
            .await?
    }

    /// Point-in-time view of the voter set.
    pub async fn configuration(&self) -> Result<Vec<RaftServer>> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(RaftRequest::GetConfiguration { reply })
            .await
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    pub async fn status(&self) -> Result<RaftStatus> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(RaftRequest::Status { reply })
            .await
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Stops the driver; pending operations fail with `Shutdown`.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .requests
            .send(RaftRequest::Shutdown { reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    async fn request<T>(
        &self,
        request: RaftRequest,
        rx: oneshot::Receiver<T>,
        timeout: Duration,
    ) -> Result<T> {
        self.requests
            .send(request)
            .await
            .map_err(|_| Error::Shutdown)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(Error::Shutdown),
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }
}
