//! Directory mapping raft server ids to advertised addresses.
//!
//! Voter addresses are never read out of the raft configuration; they
//! resolve through this table, which gossip keeps current on every
//! member join and update. Operators can therefore move a node without
//! touching the replicated configuration.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// Identity of a voter as carried in conf-change contexts, so every
/// replica learns the id→address mapping when the change applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoterMeta {
    pub name: String,
    pub addr: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRecord {
    pub id: u64,
    pub name: String,
    pub addr: SocketAddr,
}

#[derive(Default)]
pub struct ServerLookup {
    servers: RwLock<HashMap<u64, ServerRecord>>,
}

impl ServerLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: u64, name: String, addr: SocketAddr) {
        self.servers
            .write()
            .unwrap()
            .insert(id, ServerRecord { id, name, addr });
    }

    pub fn remove_by_name(&self, name: &str) {
        self.servers.write().unwrap().retain(|_, s| s.name != name);
    }

    pub fn get(&self, id: u64) -> Option<ServerRecord> {
        self.servers.read().unwrap().get(&id).cloned()
    }

    pub fn addr_of(&self, id: u64) -> Option<SocketAddr> {
        self.servers.read().unwrap().get(&id).map(|s| s.addr)
    }

    pub fn name_of(&self, id: u64) -> Option<String> {
        self.servers.read().unwrap().get(&id).map(|s| s.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_and_overwrite() {
        let lookup = ServerLookup::new();
        let addr: SocketAddr = "10.0.0.1:6868".parse().unwrap();
        lookup.insert(7, "alpha".into(), addr);
        assert_eq!(lookup.addr_of(7), Some(addr));
        assert_eq!(lookup.name_of(7), Some("alpha".to_string()));

        let moved: SocketAddr = "10.0.0.2:6868".parse().unwrap();
        lookup.insert(7, "alpha".into(), moved);
        assert_eq!(lookup.addr_of(7), Some(moved));
    }

    #[test]
    fn remove_by_name_drops_all_ids() {
        let lookup = ServerLookup::new();
        lookup.insert(1, "alpha".into(), "10.0.0.1:6868".parse().unwrap());
        lookup.insert(2, "beta".into(), "10.0.0.2:6868".parse().unwrap());
        lookup.remove_by_name("alpha");
        assert_eq!(lookup.get(1), None);
        assert!(lookup.get(2).is_some());
    }

    #[test]
    fn unknown_id_is_none() {
        let lookup = ServerLookup::new();
        assert_eq!(lookup.addr_of(99), None);
    }
}
