//! Raft stream layer: the framed protocol carried by the mux catch-all.
//!
//! Frames are length-delimited protobuf-encoded `eraftpb::Message`s.
//! Inbound connections come from the multiplexer; outbound connections
//! are dialed against the advertised address found in the server
//! lookup, one writer task per peer. Delivery is best-effort: a failed
//! peer drops its messages and raft retries on its own schedule.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use protobuf::Message as PbMessage;
use raft::eraftpb::Message;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::raft::RAFT_TIMEOUT;
use crate::transport::lookup::ServerLookup;
use crate::transport::mux::RewindStream;

const MAX_FRAME: usize = 64 * 1024 * 1024;
const PEER_CHANNEL_SIZE: usize = 1024;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME)
        .new_codec()
}

/// The listener-shaped interface the raft transport runs on.
pub struct RaftStreamLayer {
    incoming: mpsc::Receiver<RewindStream<TcpStream>>,
    local_addr: SocketAddr,
}

impl RaftStreamLayer {
    pub fn new(incoming: mpsc::Receiver<RewindStream<TcpStream>>, local_addr: SocketAddr) -> Self {
        RaftStreamLayer {
            incoming,
            local_addr,
        }
    }

    /// Next connection handed over by the multiplexer; `None` once the
    /// mux has shut down.
    pub async fn accept(&mut self) -> Option<RewindStream<TcpStream>> {
        self.incoming.recv().await
    }

    /// Plain TCP to a voter's advertised address.
    pub async fn dial(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
        tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("dial {addr} timed out")))?
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn close(mut self) {
        self.incoming.close();
    }
}

/// Pumps inbound raft frames into the driver's mailbox.
pub fn spawn_acceptor(
    mut layer: RaftStreamLayer,
    in_tx: mpsc::Sender<Message>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                conn = layer.accept() => match conn {
                    None => return,
                    Some(stream) => {
                        tokio::spawn(read_stream(stream, in_tx.clone()));
                    }
                },
            }
        }
    })
}

async fn read_stream(stream: RewindStream<TcpStream>, in_tx: mpsc::Sender<Message>) {
    let mut framed = FramedRead::new(stream, codec());
    while let Some(frame) = framed.next().await {
        let bytes = match frame {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("raft-layer: inbound stream error: {e}");
                return;
            }
        };
        match Message::parse_from_bytes(&bytes) {
            Ok(msg) => {
                if in_tx.send(msg).await.is_err() {
                    return;
                }
            }
            Err(e) => log::warn!("raft-layer: dropping unparseable frame: {e}"),
        }
    }
}

/// Fans driver output out to per-peer writer tasks.
pub fn spawn_sender(
    mut out_rx: mpsc::Receiver<Message>,
    lookup: Arc<ServerLookup>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut peers: HashMap<u64, PeerPipe> = HashMap::new();
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                msg = out_rx.recv() => match msg {
                    None => return,
                    Some(msg) => deliver(&mut peers, &lookup, msg),
                },
            }
        }
    })
}

struct PeerPipe {
    tx: mpsc::Sender<Message>,
    broken: Arc<AtomicBool>,
}

impl PeerPipe {
    fn spawn(id: u64, addr: SocketAddr) -> Self {
        let (tx, mut rx) = mpsc::channel::<Message>(PEER_CHANNEL_SIZE);
        let broken = Arc::new(AtomicBool::new(false));
        let flag = broken.clone();
        tokio::spawn(async move {
            match RaftStreamLayer::dial(addr, RAFT_TIMEOUT).await {
                Ok(stream) => {
                    let mut framed = FramedWrite::new(stream, codec());
                    while let Some(msg) = rx.recv().await {
                        let bytes = match msg.write_to_bytes() {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                log::error!("raft-layer: failed to encode message: {e}");
                                continue;
                            }
                        };
                        if let Err(e) = framed.send(Bytes::from(bytes)).await {
                            log::warn!("raft-layer: send to peer {id} at {addr} failed: {e}");
                            break;
                        }
                    }
                }
                Err(e) => log::debug!("raft-layer: dial peer {id} at {addr} failed: {e}"),
            }
            flag.store(true, Ordering::SeqCst);
        });
        PeerPipe { tx, broken }
    }
}

fn deliver(peers: &mut HashMap<u64, PeerPipe>, lookup: &ServerLookup, msg: Message) {
    let to = msg.to;
    if let Some(pipe) = peers.get(&to) {
        if pipe.broken.load(Ordering::SeqCst) {
            peers.remove(&to);
        }
    }
    if !peers.contains_key(&to) {
        let Some(addr) = lookup.addr_of(to) else {
            // Not in the directory yet; gossip will fill it in and raft
            // will retry the message.
            log::debug!("raft-layer: no advertised address for peer {to}, dropping message");
            return;
        };
        peers.insert(to, PeerPipe::spawn(to, addr));
    }
    let pipe = peers.get(&to).expect("peer pipe just ensured");
    if pipe.tx.try_send(msg).is_err() {
        log::debug!("raft-layer: peer {to} queue full or closed, dropping message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_round_trip_through_the_codec() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut writer = FramedWrite::new(a, codec());
        let mut reader = FramedRead::new(b, codec());

        let mut msg = Message::default();
        msg.to = 7;
        msg.from = 3;
        msg.term = 12;
        writer
            .send(Bytes::from(msg.write_to_bytes().unwrap()))
            .await
            .unwrap();

        let frame = reader.next().await.unwrap().unwrap();
        let parsed = Message::parse_from_bytes(&frame).unwrap();
        assert_eq!(parsed.to, 7);
        assert_eq!(parsed.from, 3);
        assert_eq!(parsed.term, 12);
    }

    #[tokio::test]
    async fn back_to_back_frames_stay_separated() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut writer = FramedWrite::new(a, codec());
        let mut reader = FramedRead::new(b, codec());

        for term in 1..=3u64 {
            let mut msg = Message::default();
            msg.term = term;
            writer
                .send(Bytes::from(msg.write_to_bytes().unwrap()))
                .await
                .unwrap();
        }
        for term in 1..=3u64 {
            let frame = reader.next().await.unwrap().unwrap();
            let parsed = Message::parse_from_bytes(&frame).unwrap();
            assert_eq!(parsed.term, term);
        }
    }
}
