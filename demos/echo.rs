use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::{BufMut, BytesMut};
use clap::Parser;
use clap_derive::Parser;
use netchannel::channel::channel_config::ChannelConfig;
use netchannel::channel::heartbeat::HeartbeatHandler;
use netchannel::channel::network_channel::NetworkChannel;
use netchannel::channel::ticker::run_ticker;
use netchannel::codec::packet_body::PacketBodyCodec;
use netchannel::codec::packet_header::{DefaultPacketHeaderCodec, PacketHeader, PacketHeaderCodec};
use netchannel::codec::{ChannelCodec, ChannelMessage};
use netchannel::transport::tcp_transport::TcpTransport;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn, Level};

#[derive(Parser)]
struct Args {
    /// number of echo calls
    #[clap(short, long, default_value_t = 10)]
    count: u32,

    #[clap(long, default_value_t = 200)]
    heartbeat_millis: u64,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}


const HEARTBEAT_ID: i32 = 1;
const CHAT_ID: i32 = 2;
const ECHO_ID: i32 = 3;

#[derive(Debug, Clone)]
enum DemoMessage {
    Heartbeat,
    Chat(String),
    Echo(String),
}

impl ChannelMessage for DemoMessage {
    fn message_id(&self) -> i32 {
        match self {
            DemoMessage::Heartbeat => HEARTBEAT_ID,
            DemoMessage::Chat(_) => CHAT_ID,
            DemoMessage::Echo(_) => ECHO_ID,
        }
    }
}

struct EchoReply(String);

impl TryFrom<DemoMessage> for EchoReply {
    type Error = DemoMessage;

    fn try_from(value: DemoMessage) -> Result<Self, Self::Error> {
        match value {
            DemoMessage::Echo(s) => Ok(EchoReply(s)),
            other => Err(other),
        }
    }
}

struct DemoCodec;

impl PacketBodyCodec<DemoMessage> for DemoCodec {
    fn ser(&self, message: &DemoMessage, buf: &mut BytesMut) -> anyhow::Result<()> {
        match message {
            DemoMessage::Heartbeat => {}
            DemoMessage::Chat(s) | DemoMessage::Echo(s) => buf.put_slice(s.as_bytes()),
        }
        Ok(())
    }

    fn deser(&self, header: &PacketHeader, buf: &[u8]) -> anyhow::Result<DemoMessage> {
        match header.message_id {
            HEARTBEAT_ID => Ok(DemoMessage::Heartbeat),
            CHAT_ID => Ok(DemoMessage::Chat(String::from_utf8(buf.to_vec())?)),
            ECHO_ID => Ok(DemoMessage::Echo(String::from_utf8(buf.to_vec())?)),
            other => Err(anyhow!("unknown message id {}", other)),
        }
    }
}

struct DemoHeartbeat;

impl HeartbeatHandler<DemoMessage> for DemoHeartbeat {
    fn create_heartbeat(&self) -> Option<DemoMessage> {
        Some(DemoMessage::Heartbeat)
    }
}


#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .try_init()
        .ok();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let server_addr = listener.local_addr()?;
    tokio::spawn(run_echo_server(listener));

    let mut config = ChannelConfig::new("echo");
    config.heartbeat_interval = Some(Duration::from_millis(args.heartbeat_millis));
    config.log_suppressed_message_ids.insert(HEARTBEAT_ID);
    config.tick_interval = Duration::from_millis(50);

    let channel = NetworkChannel::new(config, Arc::new(TcpTransport::default()), ChannelCodec::new(Arc::new(DemoCodec)))?;
    channel.set_heartbeat_handler(Some(Arc::new(DemoHeartbeat)));
    channel.handlers().register(CHAT_ID, Arc::new(|message: DemoMessage| info!("chat: {:?}", message)))?;
    channel.handlers().register(HEARTBEAT_ID, Arc::new(|_: DemoMessage| debug!("heartbeat echoed")))?;

    let ticker = tokio::spawn(run_ticker(channel.clone(), channel.config().tick_interval));

    channel.connect(server_addr, None).await?;
    channel.send(&DemoMessage::Chat("hello".to_string()))?;

    let calls = (0..args.count)
        .map(|i| {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel.call::<EchoReply>(&DemoMessage::Echo(format!("echo #{}", i))).await
            })
        })
        .collect::<Vec<_>>();
    for call in calls {
        let reply = call.await??;
        info!("reply: {}", reply.0);
    }

    // give the heartbeat a chance to go back and forth
    tokio::time::sleep(Duration::from_millis(args.heartbeat_millis * 2)).await;
    info!("sent {} packets, received {}", channel.sent_packet_count(), channel.received_packet_count());

    channel.close().await;
    ticker.abort();
    Ok(())
}

async fn run_echo_server(listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, from)) => {
                info!("server: accepted connection from {:?}", from);
                tokio::spawn(async move {
                    if let Err(e) = echo_frames(stream).await {
                        warn!("server: connection failed: {}", e);
                    }
                });
            }
            Err(e) => {
                warn!("server: accept failed: {}", e);
                return;
            }
        }
    }
}

/// writes every frame back unchanged
async fn echo_frames(mut stream: TcpStream) -> anyhow::Result<()> {
    let header_codec = DefaultPacketHeaderCodec;
    let mut header_buf = [0u8; DefaultPacketHeaderCodec::SERIALIZED_LEN];
    loop {
        if stream.read_exact(&mut header_buf).await.is_err() {
            debug!("server: connection closed");
            return Ok(());
        }
        let header = header_codec.deser(&header_buf)?;
        let Some(body_len) = header.body_len() else {
            bail!("invalid header {:?}", header);
        };

        let mut body_buf = vec![0u8; body_len as usize];
        stream.read_exact(&mut body_buf).await?;

        stream.write_all(&header_buf).await?;
        stream.write_all(&body_buf).await?;
    }
}
