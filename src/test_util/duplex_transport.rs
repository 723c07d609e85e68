use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use crate::codec::packet_header::{PacketHeader, PacketHeaderCodec};
use crate::transport::{Transport, TransportReader, TransportWriter};


/// An in-memory transport: every `connect` creates a `tokio::io::duplex` pipe, hands one end
///  to the channel and the other end to the test (through the receiver returned by `new`).
///
/// `max_buf_size` limits the number of bytes in flight per direction, so a small value forces
///  reads and writes on both sides to be split into chunks of at most that size.
pub struct DuplexTransport {
    max_buf_size: usize,
    peers: mpsc::UnboundedSender<DuplexStream>,
}

impl DuplexTransport {
    pub fn new(max_buf_size: usize) -> (DuplexTransport, mpsc::UnboundedReceiver<DuplexStream>) {
        let (peers, peer_receiver) = mpsc::unbounded_channel();
        (DuplexTransport { max_buf_size, peers }, peer_receiver)
    }
}

#[async_trait]
impl Transport for DuplexTransport {
    async fn connect(&self, _addr: SocketAddr) -> std::io::Result<(TransportReader, TransportWriter)> {
        let (local, remote) = tokio::io::duplex(self.max_buf_size);
        if self.peers.send(remote).is_err() {
            return Err(std::io::ErrorKind::ConnectionRefused.into());
        }

        let (reader, writer) = tokio::io::split(local);
        Ok((Box::new(reader), Box::new(writer)))
    }
}


/// The far end of a channel's connection, speaking raw frames. `S` is the stream, typically the
///  peer end of a [DuplexTransport] connection.
pub struct TestPeer<S = DuplexStream> {
    pub stream: S,
}

impl TestPeer<DuplexStream> {
    /// waits for the channel to connect, `None` if the transport was dropped
    pub async fn accept(peers: &mut mpsc::UnboundedReceiver<DuplexStream>) -> Option<TestPeer> {
        let stream = peers.recv().await?;
        Some(TestPeer { stream })
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> TestPeer<S> {
    pub fn new(stream: S) -> TestPeer<S> {
        TestPeer { stream }
    }

    pub async fn read_frame(&mut self, header_codec: &dyn PacketHeaderCodec) -> std::io::Result<(PacketHeader, Bytes)> {
        let mut header_buf = vec![0u8; header_codec.header_len()];
        self.stream.read_exact(&mut header_buf).await?;
        let header = header_codec.deser(&header_buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;

        let body_len = header.body_len()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::InvalidData))?;
        let mut body_buf = vec![0u8; body_len as usize];
        self.stream.read_exact(&mut body_buf).await?;
        Ok((header, Bytes::from(body_buf)))
    }

    pub async fn write_raw(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(buf).await?;
        self.stream.flush().await
    }
}
