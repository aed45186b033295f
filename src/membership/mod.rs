//! Cluster membership: gossip failure detection and member records.

pub mod crypto;
pub mod gossip;

use std::collections::HashMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use gossip::{Gossip, GossipConfig, GossipHandle, Profile};

/// Role tag value that marks a member as a taskvault server.
pub const CLUSTER_ROLE: &str = "taskvault";

pub const TAG_ROLE: &str = "role";
pub const TAG_ID: &str = "id";
pub const TAG_PORT: &str = "port";
pub const TAG_RPC_ADDR: &str = "rpc_addr";
pub const TAG_BOOTSTRAP: &str = "bootstrap";
pub const TAG_EXPECT: &str = "expect";
pub const TAG_VERSION: &str = "version";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    Alive,
    Leaving,
    Left,
    Failed,
}

/// One known peer, as seen by the gossip layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub addr: IpAddr,
    pub port: u16,
    pub status: MemberStatus,
    pub tags: HashMap<String, String>,
}

/// Membership change notifications delivered to the agent's dispatcher.
#[derive(Debug, Clone)]
pub enum MemberEvent {
    Join(Member),
    Update(Member),
    Leave(Member),
    Failed(Member),
    Reap(Member),
}

impl MemberEvent {
    pub fn member(&self) -> &Member {
        match self {
            MemberEvent::Join(m)
            | MemberEvent::Update(m)
            | MemberEvent::Leave(m)
            | MemberEvent::Failed(m)
            | MemberEvent::Reap(m) => m,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MemberEvent::Join(_) => "join",
            MemberEvent::Update(_) => "update",
            MemberEvent::Leave(_) => "leave",
            MemberEvent::Failed(_) => "failed",
            MemberEvent::Reap(_) => "reap",
        }
    }
}

/// Server-identifying fields parsed out of a member's tags.
///
/// Only members advertising the cluster role with a parseable raft id
/// and port count as servers; everything else is invisible to the voter
/// reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerParts {
    pub name: String,
    pub id: u64,
    pub port: u16,
    pub rpc_addr: String,
    pub bootstrap: bool,
    pub expect: u32,
}

impl ServerParts {
    pub fn from_member(member: &Member) -> Option<ServerParts> {
        if member.tags.get(TAG_ROLE).map(String::as_str) != Some(CLUSTER_ROLE) {
            return None;
        }
        let id = member.tags.get(TAG_ID)?.parse::<u64>().ok()?;
        let port = member.tags.get(TAG_PORT)?.parse::<u16>().ok()?;
        let rpc_addr = member.tags.get(TAG_RPC_ADDR)?.clone();
        let bootstrap = member.tags.get(TAG_BOOTSTRAP).map(String::as_str) == Some("1");
        let expect = member
            .tags
            .get(TAG_EXPECT)
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);
        Some(ServerParts {
            name: member.name.clone(),
            id,
            port,
            rpc_addr,
            bootstrap,
            expect,
        })
    }
}

/// Stable numeric raft server id for a node name.
///
/// The raft library identifies servers by u64; the first eight bytes of
/// the name's SHA-256 digest give every node the same answer without
/// coordination. Zero is reserved by the library.
pub fn server_id(name: &str) -> u64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    let id = u64::from_be_bytes(bytes);
    if id == 0 {
        1
    } else {
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_member(name: &str) -> Member {
        let mut tags = HashMap::new();
        tags.insert(TAG_ROLE.to_string(), CLUSTER_ROLE.to_string());
        tags.insert(TAG_ID.to_string(), server_id(name).to_string());
        tags.insert(TAG_PORT.to_string(), "6868".to_string());
        tags.insert(TAG_RPC_ADDR.to_string(), "10.0.0.1:6868".to_string());
        Member {
            name: name.to_string(),
            addr: "10.0.0.1".parse().unwrap(),
            port: 8946,
            status: MemberStatus::Alive,
            tags,
        }
    }

    #[test]
    fn parses_complete_server_tags() {
        let member = server_member("alpha");
        let parts = ServerParts::from_member(&member).unwrap();
        assert_eq!(parts.name, "alpha");
        assert_eq!(parts.id, server_id("alpha"));
        assert_eq!(parts.port, 6868);
        assert!(!parts.bootstrap);
        assert_eq!(parts.expect, 0);
    }

    #[test]
    fn wrong_role_is_not_a_server() {
        let mut member = server_member("alpha");
        member
            .tags
            .insert(TAG_ROLE.to_string(), "something-else".to_string());
        assert!(ServerParts::from_member(&member).is_none());
    }

    #[test]
    fn malformed_id_or_port_is_not_a_server() {
        let mut member = server_member("alpha");
        member.tags.insert(TAG_ID.to_string(), "not-a-number".into());
        assert!(ServerParts::from_member(&member).is_none());

        let mut member = server_member("alpha");
        member.tags.insert(TAG_PORT.to_string(), "99999999".into());
        assert!(ServerParts::from_member(&member).is_none());
    }

    #[test]
    fn bootstrap_and_expect_tags_are_read() {
        let mut member = server_member("alpha");
        member.tags.insert(TAG_BOOTSTRAP.to_string(), "1".into());
        member.tags.insert(TAG_EXPECT.to_string(), "3".into());
        let parts = ServerParts::from_member(&member).unwrap();
        assert!(parts.bootstrap);
        assert_eq!(parts.expect, 3);
    }

    #[test]
    fn server_ids_are_stable_distinct_and_nonzero() {
        assert_eq!(server_id("node-1"), server_id("node-1"));
        assert_ne!(server_id("node-1"), server_id("node-2"));
        assert_ne!(server_id(""), 0);
    }
}
