#![allow(dead_code)]

use std::net::SocketAddr;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BufMut;
use netchannel::channel::channel_config::ChannelConfig;
use netchannel::channel::channel_events::ChannelEvent;
use netchannel::channel::network_channel::NetworkChannel;
use netchannel::codec::packet_header::{DefaultPacketHeaderCodec, PacketHeader, PacketHeaderCodec};
use netchannel::codec::ChannelCodec;
use netchannel::test_util::duplex_transport::{DuplexTransport, TestPeer};
use netchannel::test_util::message::{TestMessage, TestMessageCodec};
use netchannel::transport::{Transport, TransportReader, TransportWriter};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{broadcast, mpsc};
use tracing::Level;


#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn addr() -> SocketAddr {
    SocketAddr::from_str("127.0.0.1:9000").unwrap()
}

pub fn codec() -> ChannelCodec<TestMessage> {
    ChannelCodec::new(Arc::new(TestMessageCodec))
}

/// a channel connected over an in-memory pipe with `max_buf_size` bytes in flight per direction
pub async fn connected_channel(config: ChannelConfig, max_buf_size: usize) -> (NetworkChannel<TestMessage>, TestPeer) {
    connected_channel_with_codec(config, codec(), max_buf_size).await
}

pub async fn connected_channel_with_codec(config: ChannelConfig, codec: ChannelCodec<TestMessage>, max_buf_size: usize) -> (NetworkChannel<TestMessage>, TestPeer) {
    let (transport, mut peers) = DuplexTransport::new(max_buf_size);
    let channel = NetworkChannel::new(config, Arc::new(transport), codec).unwrap();
    channel.connect(addr(), None).await.unwrap();

    let peer = TestPeer::accept(&mut peers).await.unwrap();
    (channel, peer)
}

/// registers a default handler forwarding all inbound messages
pub fn collect_inbound(channel: &NetworkChannel<TestMessage>) -> mpsc::UnboundedReceiver<TestMessage> {
    let (sender, receiver) = mpsc::unbounded_channel();
    channel.handlers().set_default_handler(Some(Arc::new(move |message: TestMessage| {
        let _ = sender.send(message);
    })));
    receiver
}

pub async fn next_inbound(inbound: &mut mpsc::UnboundedReceiver<TestMessage>) -> TestMessage {
    tokio::time::timeout(TIMEOUT, inbound.recv()).await
        .unwrap()
        .unwrap()
}

pub async fn next_event(events: &mut broadcast::Receiver<ChannelEvent>) -> ChannelEvent {
    tokio::time::timeout(TIMEOUT, events.recv()).await
        .unwrap()
        .unwrap()
}

/// a complete frame with the default header layout
pub fn frame(message: &TestMessage, unique_id: u64) -> Vec<u8> {
    codec().encode(message, unique_id).unwrap().to_vec()
}

/// a frame with the default header layout and an empty body
pub fn empty_frame(message_id: i32, unique_id: u64) -> Vec<u8> {
    let header = PacketHeader {
        total_len: DefaultPacketHeaderCodec::SERIALIZED_LEN as u32,
        header_len: DefaultPacketHeaderCodec::SERIALIZED_LEN_U16,
        message_id,
        unique_id,
        compression_flag: PacketHeader::UNCOMPRESSED,
    };
    let mut buf = bytes::BytesMut::new();
    DefaultPacketHeaderCodec.ser(&header, &mut buf).unwrap();
    buf.to_vec()
}

/// reads a frame written by the channel, decoding its body
pub async fn read_message(peer: &mut TestPeer) -> (PacketHeader, TestMessage) {
    let codec = codec();
    let (header, body) = tokio::time::timeout(TIMEOUT, peer.read_frame(codec.header_codec().as_ref())).await
        .unwrap()
        .unwrap();
    let message = codec.decode_body(&header, &body).unwrap();
    (header, message)
}

pub fn payload(n: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.put_u32(n);
    buf
}


/// A transport whose connections fail with the given OS error codes. A reader without an error
///  never returns data, a writer without an error swallows everything.
pub struct FailingTransport {
    pub read_error: Option<i32>,
    pub write_error: Option<i32>,
}

#[async_trait]
impl Transport for FailingTransport {
    async fn connect(&self, _addr: SocketAddr) -> std::io::Result<(TransportReader, TransportWriter)> {
        Ok((Box::new(FailingStream(self.read_error)), Box::new(FailingStream(self.write_error))))
    }
}

struct FailingStream(Option<i32>);

impl AsyncRead for FailingStream {
    fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match self.0 {
            Some(code) => Poll::Ready(Err(std::io::Error::from_raw_os_error(code))),
            None => Poll::Pending,
        }
    }
}

impl AsyncWrite for FailingStream {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.0 {
            Some(code) => Poll::Ready(Err(std::io::Error::from_raw_os_error(code))),
            None => Poll::Ready(Ok(buf.len())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
