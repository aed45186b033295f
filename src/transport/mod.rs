//! Single-port transport: the stream multiplexer that splits gRPC from
//! the raft stream protocol, the raft stream layer itself, and the
//! gossip-populated server address directory.

pub mod lookup;
pub mod mux;
pub mod raft_layer;

pub use lookup::{ServerLookup, VoterMeta};
pub use mux::{MuxListeners, RewindStream, StreamMux};
pub use raft_layer::RaftStreamLayer;
