//! Content-based demultiplexing of one TCP listener.
//!
//! gRPC clients open every connection with the HTTP/2 preface, while
//! the raft stream layer starts with a length-prefixed frame, so the
//! first bytes decide where a connection belongs. Sniffed bytes are
//! replayed through [`RewindStream`] so the chosen consumer sees the
//! stream from its first byte.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tonic::transport::server::{Connected, TcpConnectInfo};

/// HTTP/2 client connection preface; what every tonic client sends
/// before anything else.
pub const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const SNIFF_TIMEOUT: Duration = Duration::from_secs(10);
const LISTENER_BACKLOG: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamClass {
    Grpc,
    Raft,
}

/// A stream that first replays the bytes consumed while sniffing, then
/// continues with the underlying connection.
pub struct RewindStream<S> {
    prefix: Bytes,
    offset: usize,
    inner: S,
}

impl<S> RewindStream<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        RewindStream {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RewindStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.offset < this.prefix.len() {
            let remaining = &this.prefix[this.offset..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.offset += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RewindStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl Connected for RewindStream<TcpStream> {
    type ConnectInfo = TcpConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.inner.connect_info()
    }
}

/// Reads until the connection either matches the full HTTP/2 preface or
/// diverges from it. `None` means EOF before a decision.
pub async fn classify<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> io::Result<Option<StreamClass>> {
    loop {
        let sniffed = buf.len().min(H2_PREFACE.len());
        if buf[..sniffed] != H2_PREFACE[..sniffed] {
            return Ok(Some(StreamClass::Raft));
        }
        if buf.len() >= H2_PREFACE.len() {
            return Ok(Some(StreamClass::Grpc));
        }
        if stream.read_buf(buf).await? == 0 {
            return Ok(None);
        }
    }
}

pub struct MuxListeners {
    /// Connections speaking gRPC over HTTP/2; feeds tonic's incoming.
    pub grpc: mpsc::Receiver<io::Result<RewindStream<TcpStream>>>,
    /// Everything else; consumed by the raft stream layer.
    pub raft: mpsc::Receiver<RewindStream<TcpStream>>,
}

pub struct StreamMux {
    listener: TcpListener,
    grpc_tx: mpsc::Sender<io::Result<RewindStream<TcpStream>>>,
    raft_tx: mpsc::Sender<RewindStream<TcpStream>>,
    shutdown: watch::Receiver<bool>,
}

impl StreamMux {
    pub fn new(listener: TcpListener, shutdown: watch::Receiver<bool>) -> (Self, MuxListeners) {
        let (grpc_tx, grpc_rx) = mpsc::channel(LISTENER_BACKLOG);
        let (raft_tx, raft_rx) = mpsc::channel(LISTENER_BACKLOG);
        (
            StreamMux {
                listener,
                grpc_tx,
                raft_tx,
                shutdown,
            },
            MuxListeners {
                grpc: grpc_rx,
                raft: raft_rx,
            },
        )
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn serve(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    log::info!("mux: listener closing");
                    return;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let grpc_tx = self.grpc_tx.clone();
                            let raft_tx = self.raft_tx.clone();
                            tokio::spawn(dispatch(stream, peer, grpc_tx, raft_tx));
                        }
                        Err(e) => log::warn!("mux: accept failed: {e}"),
                    }
                }
            }
        }
    }
}

async fn dispatch(
    mut stream: TcpStream,
    peer: SocketAddr,
    grpc_tx: mpsc::Sender<io::Result<RewindStream<TcpStream>>>,
    raft_tx: mpsc::Sender<RewindStream<TcpStream>>,
) {
    let mut buf = BytesMut::with_capacity(H2_PREFACE.len());
    let class = tokio::time::timeout(SNIFF_TIMEOUT, classify(&mut stream, &mut buf)).await;
    match class {
        Ok(Ok(Some(StreamClass::Grpc))) => {
            let rewound = RewindStream::new(buf.freeze(), stream);
            if grpc_tx.send(Ok(rewound)).await.is_err() {
                log::debug!("mux: grpc listener gone, closing connection from {peer}");
            }
        }
        Ok(Ok(Some(StreamClass::Raft))) => {
            let rewound = RewindStream::new(buf.freeze(), stream);
            if raft_tx.send(rewound).await.is_err() {
                log::debug!("mux: raft listener gone, closing connection from {peer}");
            }
        }
        Ok(Ok(None)) => log::debug!("mux: {peer} closed before identifying itself"),
        Ok(Err(e)) => log::debug!("mux: sniff error from {peer}: {e}"),
        Err(_) => log::debug!("mux: {peer} sent nothing identifiable within the sniff window"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn full_preface_classifies_as_grpc() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(H2_PREFACE).await.unwrap();
        client.write_all(b"settings-and-frames").await.unwrap();

        let mut buf = BytesMut::new();
        let class = classify(&mut server, &mut buf).await.unwrap();
        assert_eq!(class, Some(StreamClass::Grpc));
    }

    #[tokio::test]
    async fn length_prefixed_frame_classifies_as_raft() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        // A raft frame starts with a big-endian length, never with 'P'.
        client.write_all(&[0, 0, 0, 12]).await.unwrap();
        client.write_all(b"raft-payload").await.unwrap();

        let mut buf = BytesMut::new();
        let class = classify(&mut server, &mut buf).await.unwrap();
        assert_eq!(class, Some(StreamClass::Raft));
    }

    #[tokio::test]
    async fn partial_preface_then_divergence_is_raft() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(b"PRI * HTTP/1.1\r\n").await.unwrap();

        let mut buf = BytesMut::new();
        let class = classify(&mut server, &mut buf).await.unwrap();
        assert_eq!(class, Some(StreamClass::Raft));
    }

    #[tokio::test]
    async fn eof_before_decision_is_unmatched() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        // A strict prefix of the preface, then hang up.
        client.write_all(&H2_PREFACE[..8]).await.unwrap();
        drop(client);

        let mut buf = BytesMut::new();
        let class = classify(&mut server, &mut buf).await.unwrap();
        assert_eq!(class, None);
    }

    #[tokio::test]
    async fn rewind_stream_replays_sniffed_bytes() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(b"hello taskvault").await.unwrap();
        drop(client);

        let mut buf = BytesMut::new();
        // Sniff a few bytes directly off the stream.
        while buf.len() < 5 {
            server.read_buf(&mut buf).await.unwrap();
        }
        let sniffed = buf.len();

        let mut rewound = RewindStream::new(buf.freeze(), server);
        let mut all = Vec::new();
        rewound.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"hello taskvault");
        assert!(sniffed >= 5);
    }
}
