//! Error types shared across the agent.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Operation that must run on the leader reached a non-leader node.
    #[error("not the leader{}", match .leader {
        Some(addr) => format!(", leader is {addr}"),
        None => String::new(),
    })]
    NotLeader { leader: Option<String> },

    /// Leadership was lost while the operation was in flight.
    #[error("leadership lost while committing")]
    LeadershipLost,

    /// The proposal was dropped by the raft library (e.g. a conf change
    /// while another one is still pending).
    #[error("proposal dropped")]
    ProposalDropped,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("raft node is shut down")]
    Shutdown,

    #[error("unknown command kind {0:#04x}")]
    UnknownCommand(u8),

    #[error("config: {0}")]
    Config(String),

    #[error("membership: {0}")]
    Membership(String),

    #[error("raft: {0}")]
    Raft(#[from] raft::Error),

    #[error("serialization: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Transient coordination errors clear up on their own once
    /// leadership settles; callers retry on the next tick instead of
    /// tearing anything down.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::NotLeader { .. }
                | Error::LeadershipLost
                | Error::ProposalDropped
                | Error::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_leader_display_includes_hint() {
        let err = Error::NotLeader {
            leader: Some("10.0.0.7:6868".to_string()),
        };
        assert_eq!(err.to_string(), "not the leader, leader is 10.0.0.7:6868");

        let err = Error::NotLeader { leader: None };
        assert_eq!(err.to_string(), "not the leader");
    }

    #[test]
    fn transient_classification() {
        assert!(Error::LeadershipLost.is_transient());
        assert!(Error::Timeout(Duration::from_secs(30)).is_transient());
        assert!(!Error::Shutdown.is_transient());
        assert!(!Error::UnknownCommand(0xff).is_transient());
    }
}
