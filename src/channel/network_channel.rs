use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, span, trace, warn, Instrument, Level};

use crate::channel::channel_config::ChannelConfig;
use crate::channel::channel_error::ChannelError;
use crate::channel::channel_events::{ChannelEvent, ChannelEventNotifier, ClosedData, ConnectedData, ErrorData, MissHeartbeatData, UserData};
use crate::channel::channel_state::{AtomicChannelState, ChannelCounters, ChannelState};
use crate::channel::heartbeat::{HeartbeatHandler, HeartbeatMonitor};
use crate::channel::packet_handlers::PacketHandlerRegistry;
use crate::channel::receive_pipeline::{receive_loop, FrameDispatcher, ReceiveState, ReceivedFrame};
use crate::channel::rpc::{RpcCall, RpcCorrelator};
use crate::channel::send_pipeline::{write_loop, SendPipeline};
use crate::codec::{ChannelCodec, ChannelMessage};
use crate::transport::{AddressFamily, Transport, TransportReader, TransportWriter};


/// A client side connection to a server, exchanging messages of type `M`.
///
/// The channel is created disconnected, and it can be connected, closed and re-connected any
///  number of times. While it is connected, a read task and a write task run in the background.
///  They hold a reference to the channel's shared state, so a connected channel stays alive until
///  it is closed (by calling `close`, by the remote end, or by a transport failure).
///
/// Cloning a channel is cheap, all clones refer to the same connection.
pub struct NetworkChannel<M: ChannelMessage> {
    inner: Arc<ChannelInner<M>>,
}

impl<M: ChannelMessage> Clone for NetworkChannel<M> {
    fn clone(&self) -> Self {
        NetworkChannel {
            inner: self.inner.clone(),
        }
    }
}

struct ChannelInner<M: ChannelMessage> {
    config: ChannelConfig,
    transport: Arc<dyn Transport>,
    codec: ChannelCodec<M>,

    state: AtomicChannelState,
    /// incremented for every connection attempt, so that a connection's tasks and a pending
    ///  connect can tell whether they were superseded
    epoch: AtomicU64,
    /// serializes all state transitions, and owns the running connection's tasks
    lifecycle: Mutex<Vec<JoinHandle<()>>>,
    remote_addr: parking_lot::Mutex<Option<SocketAddr>>,

    counters: Arc<ChannelCounters>,
    send_pipeline: Arc<SendPipeline>,
    heartbeat: HeartbeatMonitor,
    heartbeat_handler: RwLock<Option<Arc<dyn HeartbeatHandler<M>>>>,
    rpc: Arc<RpcCorrelator<M>>,
    handlers: PacketHandlerRegistry<M>,
    events: ChannelEventNotifier,
}

impl<M: ChannelMessage> NetworkChannel<M> {
    pub fn new(config: ChannelConfig, transport: Arc<dyn Transport>, codec: ChannelCodec<M>) -> anyhow::Result<NetworkChannel<M>> {
        config.validate()?;
        codec.validate()?;

        let counters = Arc::new(ChannelCounters::default());
        Ok(NetworkChannel {
            inner: Arc::new(ChannelInner {
                transport,
                codec,
                state: AtomicChannelState::new(ChannelState::Disconnected),
                epoch: AtomicU64::new(0),
                lifecycle: Default::default(),
                remote_addr: Default::default(),
                counters: counters.clone(),
                send_pipeline: Arc::new(SendPipeline::new(counters)),
                heartbeat: HeartbeatMonitor::new(config.heartbeat_interval),
                heartbeat_handler: Default::default(),
                rpc: Arc::new(RpcCorrelator::new(config.rpc_timeout)),
                handlers: Default::default(),
                events: ChannelEventNotifier::new(config.event_capacity),
                config,
            }),
        })
    }

    /// Connects to `addr`, closing the current connection first if there is one. This is a no-op
    ///  while another connect is in progress.
    ///
    /// `user_data` is handed back in the [ChannelEvent::Connected] event.
    pub async fn connect(&self, addr: SocketAddr, user_data: Option<UserData>) -> Result<(), ChannelError> {
        let epoch = {
            let mut tasks = self.inner.lifecycle.lock().await;
            match self.inner.state.get() {
                ChannelState::Connecting => {
                    debug!("channel {} is already connecting - ignoring connect to {:?}", self.name(), addr);
                    return Ok(());
                }
                ChannelState::Connected | ChannelState::Closing => {
                    info!("channel {} is connected - closing before connecting to {:?}", self.name(), addr);
                    self.inner.tear_down(&mut tasks);
                }
                ChannelState::Disconnected => {}
            }

            *self.inner.remote_addr.lock() = Some(addr);
            self.inner.state.set(ChannelState::Connecting);
            self.inner.epoch.fetch_add(1, Ordering::AcqRel) + 1
        };

        // the lifecycle lock is not held while connecting, so that `close` can interrupt
        info!("channel {}: connecting to {:?}", self.name(), addr);
        let connect_result = self.inner.transport.connect(addr).await;

        let mut tasks = self.inner.lifecycle.lock().await;
        if self.inner.epoch.load(Ordering::Acquire) != epoch || self.inner.state.get() != ChannelState::Connecting {
            debug!("channel {}: connect to {:?} was superseded", self.name(), addr);
            return Err(ChannelError::ChannelClosed);
        }

        let (reader, writer) = match connect_result {
            Ok(halves) => halves,
            Err(e) => {
                let error = ChannelError::connect(&e);
                warn!("channel {}: connecting to {:?} failed: {}", self.name(), addr, e);
                self.inner.state.set(ChannelState::Disconnected);
                self.inner.send_error_event(&error);
                return Err(error);
            }
        };

        self.inner.send_pipeline.open();
        self.inner.counters.reset();
        self.inner.heartbeat.reset();

        // connected before the tasks start, so that a task failing right away reports its error
        //  after the Connected event
        self.inner.state.set(ChannelState::Connected);
        info!("channel {}: connected to {:?}", self.name(), addr);
        self.inner.events.send_event(ChannelEvent::Connected(ConnectedData {
            channel: self.name().to_string(),
            user_data,
        }));

        let span = span!(Level::INFO, "channel", name = %self.name());
        *tasks = vec![
            tokio::spawn(ChannelInner::run_reader(self.inner.clone(), reader, epoch).instrument(span.clone())),
            tokio::spawn(ChannelInner::run_writer(self.inner.clone(), writer, epoch).instrument(span)),
        ];
        Ok(())
    }

    /// Closes the connection: queued packets are discarded rather than flushed, and all pending
    ///  RPC calls fail with [ChannelError::ChannelClosed]. This is a no-op if the channel is not
    ///  connected, and it interrupts a connect that is in progress.
    pub async fn close(&self) {
        self.inner.shut_down(None).await;
    }

    /// Enqueues a message for sending. This fails immediately if the channel is not connected.
    pub fn send(&self, message: &M) -> Result<(), ChannelError> {
        self.inner.enqueue(message, 0)
    }

    /// Sends a message as an RPC request, returning the pending call. Awaiting it yields the
    ///  response converted to `R`.
    pub fn begin_call<R: TryFrom<M>>(&self, message: &M) -> Result<RpcCall<M, R>, ChannelError> {
        // registered before sending, so the response can not overtake the registration
        let call = self.inner.rpc.begin::<R>();
        self.inner.enqueue(message, call.unique_id())?;
        Ok(call)
    }

    pub async fn call<R: TryFrom<M>>(&self, message: &M) -> Result<R, ChannelError> {
        self.begin_call(message)?.await
    }

    /// Fails a pending call with [ChannelError::Cancelled]. Returns `false` if there is no
    ///  pending call with this id.
    pub fn cancel_call(&self, unique_id: u64) -> bool {
        let result = self.inner.rpc.fail(unique_id, ChannelError::Cancelled { unique_id });
        if result {
            debug!("channel {}: cancelled RPC call {}", self.name(), unique_id);
        }
        result
    }

    /// Drives time based behavior, i.e. heartbeats and RPC timeouts. This is meant to be called
    ///  periodically with the time elapsed since the previous call, see
    ///  [crate::channel::ticker::run_ticker].
    pub async fn tick(&self, elapsed: Duration) {
        if !self.is_connected() {
            return;
        }

        let num_expired = self.inner.rpc.expire_overdue(Instant::now());
        if num_expired > 0 {
            debug!("channel {}: {} RPC calls timed out", self.name(), num_expired);
        }

        if !self.inner.heartbeat.on_tick(elapsed) {
            return;
        }
        if self.inner.send_heartbeat() {
            return;
        }

        let miss_count = self.inner.heartbeat.on_heartbeat_failed();
        warn!("channel {}: missed heartbeat ({} in a row)", self.name(), miss_count);
        self.inner.events.send_event(ChannelEvent::MissHeartbeat(MissHeartbeatData {
            channel: self.name().to_string(),
            miss_count,
        }));

        if let Some(max_missed) = self.inner.config.max_missed_heartbeats {
            if miss_count >= max_missed {
                warn!("channel {}: {} missed heartbeats reached the maximum of {} - closing", self.name(), miss_count, max_missed);
                self.close().await;
            }
        }
    }

    pub fn set_heartbeat_handler(&self, handler: Option<Arc<dyn HeartbeatHandler<M>>>) {
        *self.inner.heartbeat_handler.write() = handler;
    }

    pub fn handlers(&self) -> &PacketHandlerRegistry<M> {
        &self.inner.handlers
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    pub fn codec(&self) -> &ChannelCodec<M> {
        &self.inner.codec
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// the address of the current or most recent connection
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.inner.remote_addr.lock()
    }

    pub fn address_family(&self) -> Option<AddressFamily> {
        self.remote_addr().as_ref().map(AddressFamily::from)
    }

    pub fn sent_packet_count(&self) -> u64 {
        self.inner.counters.sent_packets()
    }

    pub fn received_packet_count(&self) -> u64 {
        self.inner.counters.received_packets()
    }

    pub fn pending_send_count(&self) -> usize {
        self.inner.counters.pending_sends()
    }

    pub fn pending_rpc_count(&self) -> usize {
        self.inner.rpc.pending_count()
    }

    pub fn miss_heartbeat_count(&self) -> u32 {
        self.inner.heartbeat.miss_count()
    }

    pub fn heartbeat_elapsed(&self) -> Duration {
        self.inner.heartbeat.elapsed()
    }
}

impl<M: ChannelMessage> ChannelInner<M> {
    fn enqueue(&self, message: &M, unique_id: u64) -> Result<(), ChannelError> {
        let state = self.state.get();
        if state != ChannelState::Connected {
            return Err(ChannelError::NotConnected {
                channel: self.config.name.clone(),
                state,
            });
        }

        let encoded = self.codec.encode(message, unique_id)
            .map_err(|e| ChannelError::serialize(&e))?;
        if encoded.body_buf.len() > self.config.max_packet_len as usize {
            return Err(ChannelError::PacketTooLarge {
                len: encoded.body_buf.len() as u64,
                max: self.config.max_packet_len,
            });
        }

        let message_id = encoded.header.message_id;
        if !self.send_pipeline.enqueue(encoded.into()) {
            // closed concurrently
            return Err(ChannelError::NotConnected {
                channel: self.config.name.clone(),
                state: self.state.get(),
            });
        }

        if self.config.is_logged(message_id) {
            trace!("channel {}: enqueued {:?} (unique id {})", self.config.name, message, unique_id);
        }
        Ok(())
    }

    /// Returns `true` if a heartbeat was enqueued. Without a registered handler there is nothing
    ///  to send, and that does not count as a miss.
    fn send_heartbeat(&self) -> bool {
        let handler = self.heartbeat_handler.read().clone();
        let Some(handler) = handler else {
            trace!("channel {}: no heartbeat handler registered", self.config.name);
            return true;
        };

        let Some(heartbeat) = handler.create_heartbeat() else {
            debug!("channel {}: heartbeat handler did not provide a heartbeat", self.config.name);
            return false;
        };

        match self.enqueue(&heartbeat, 0) {
            Ok(()) => true,
            Err(e) => {
                debug!("channel {}: sending heartbeat failed: {}", self.config.name, e);
                false
            }
        }
    }

    fn send_error_event(&self, error: &ChannelError) {
        self.events.send_event(ChannelEvent::Error(ErrorData::new(&self.config.name, error)));
    }

    /// true if the connection with this epoch is the current one
    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::Acquire) == epoch && self.state.get() == ChannelState::Connected
    }

    async fn run_reader(inner: Arc<Self>, reader: TransportReader, epoch: u64) {
        let state = ReceiveState::new(inner.codec.header_codec().clone(), inner.config.max_packet_len, inner.config.receive_buffer_len);

        match receive_loop(inner.clone(), reader, state).await {
            Ok(()) => info!("channel {}: connection closed by remote end", inner.config.name),
            Err(e) => {
                if inner.is_current(epoch) {
                    warn!("channel {}: receive failed: {}", inner.config.name, e);
                    inner.send_error_event(&e);
                }
            }
        }
        Self::spawn_shut_down(inner, epoch);
    }

    async fn run_writer(inner: Arc<Self>, writer: TransportWriter, epoch: u64) {
        if let Err(e) = write_loop(inner.send_pipeline.clone(), writer).await {
            if inner.is_current(epoch) {
                let error = ChannelError::send(&e);
                warn!("channel {}: send failed: {}", inner.config.name, error);
                inner.send_error_event(&error);
            }
        }
        Self::spawn_shut_down(inner, epoch);
    }

    /// Connection tasks shut down through a separate task: shutting down aborts the connection's
    ///  tasks, and a task must not abort itself while it is still working.
    fn spawn_shut_down(inner: Arc<Self>, epoch: u64) {
        tokio::spawn(async move {
            inner.shut_down(Some(epoch)).await;
        });
    }

    /// `expected_epoch` restricts shutting down to a specific connection
    async fn shut_down(&self, expected_epoch: Option<u64>) {
        let mut tasks = self.lifecycle.lock().await;
        if let Some(expected_epoch) = expected_epoch {
            if self.epoch.load(Ordering::Acquire) != expected_epoch {
                return;
            }
        }

        match self.state.get() {
            ChannelState::Disconnected => {}
            ChannelState::Connecting => {
                info!("channel {}: interrupting connect", self.config.name);
                self.epoch.fetch_add(1, Ordering::AcqRel);
                self.state.set(ChannelState::Disconnected);
            }
            ChannelState::Connected | ChannelState::Closing => {
                self.tear_down(&mut tasks);
            }
        }
    }

    /// requires the lifecycle lock
    fn tear_down(&self, tasks: &mut Vec<JoinHandle<()>>) {
        self.state.set(ChannelState::Closing);

        for task in tasks.drain(..) {
            task.abort();
        }
        let num_discarded = self.send_pipeline.close();
        let num_failed = self.rpc.fail_all(ChannelError::ChannelClosed);

        self.state.set(ChannelState::Disconnected);
        info!("channel {}: closed - discarded {} queued packets, failed {} pending RPC calls", self.config.name, num_discarded, num_failed);
        self.events.send_event(ChannelEvent::Closed(ClosedData {
            channel: self.config.name.clone(),
        }));
    }
}

impl<M: ChannelMessage> FrameDispatcher for ChannelInner<M> {
    fn on_frame(&self, frame: ReceivedFrame) {
        let header = frame.header;

        // any traffic is proof of liveness, even if it can not be decoded
        self.heartbeat.on_packet_received(self.config.reset_heartbeat_elapsed_on_receive, self.config.reset_miss_count_on_receive);

        let message = match self.codec.decode_body(&header, &frame.body) {
            Ok(message) => message,
            Err(e) => {
                let error = ChannelError::serialize(&e);
                warn!("channel {}: dropping malformed packet with message id {}: {}", self.config.name, header.message_id, error);
                if header.is_rpc() {
                    self.rpc.fail(header.unique_id, error.clone());
                }
                self.send_error_event(&error);
                return;
            }
        };
        self.counters.on_received();

        if self.config.is_logged(header.message_id) {
            trace!("channel {}: received {:?} (unique id {})", self.config.name, message, header.unique_id);
        }

        if header.is_rpc() {
            if let Err(message) = self.rpc.resolve(header.unique_id, message) {
                debug!("channel {}: received response for RPC call {} which is not pending (timed out or cancelled?) - ignoring {:?}", self.config.name, header.unique_id, message);
            }
            return;
        }

        self.handlers.dispatch(header.message_id, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::channel_error::ChannelErrorKind;
    use crate::test_util::duplex_transport::DuplexTransport;
    use crate::test_util::message::{TestMessage, TestMessageCodec};
    use crate::transport::MockTransport;
    use async_trait::async_trait;
    use std::str::FromStr;
    use tokio::sync::Notify;

    fn addr() -> SocketAddr {
        SocketAddr::from_str("127.0.0.1:9000").unwrap()
    }

    fn channel(transport: Arc<dyn Transport>) -> NetworkChannel<TestMessage> {
        NetworkChannel::new(ChannelConfig::new("test"), transport, ChannelCodec::new(Arc::new(TestMessageCodec))).unwrap()
    }

    /// a transport whose connect does not complete until it is released
    struct StalledTransport {
        inner: DuplexTransport,
        release: Notify,
    }

    #[async_trait]
    impl Transport for StalledTransport {
        async fn connect(&self, addr: SocketAddr) -> std::io::Result<(TransportReader, TransportWriter)> {
            self.release.notified().await;
            self.inner.connect(addr).await
        }
    }

    #[test]
    fn test_new_validates_config() {
        let mut config = ChannelConfig::new("test");
        config.rpc_timeout = Duration::ZERO;
        let (transport, _peers) = DuplexTransport::new(64);

        assert!(NetworkChannel::new(config, Arc::new(transport), ChannelCodec::new(Arc::new(TestMessageCodec))).is_err());
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let mut transport = MockTransport::new();
        transport.expect_connect()
            .once()
            .returning(|_| Err(std::io::Error::from_raw_os_error(111)));

        let channel = channel(Arc::new(transport));
        let mut events = channel.subscribe();

        let result = channel.connect(addr(), None).await;
        assert_eq!(result.unwrap_err().kind(), ChannelErrorKind::Connect);
        assert_eq!(channel.state(), ChannelState::Disconnected);

        match events.recv().await.unwrap() {
            ChannelEvent::Error(data) => {
                assert_eq!(data.error_code, ChannelErrorKind::Connect);
                assert_eq!(data.socket_error_code, Some(111));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_not_connected() {
        let (transport, _peers) = DuplexTransport::new(64);
        let channel = channel(Arc::new(transport));

        let result = channel.send(&TestMessage::new(1, vec![]));
        assert_eq!(result, Err(ChannelError::NotConnected { channel: "test".to_string(), state: ChannelState::Disconnected }));

        let result = channel.call::<TestMessage>(&TestMessage::new(1, vec![])).await;
        assert_eq!(result.unwrap_err().kind(), ChannelErrorKind::NotConnected);
        assert_eq!(channel.pending_rpc_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_and_close() {
        let (transport, mut peers) = DuplexTransport::new(64);
        let channel = channel(Arc::new(transport));
        let mut events = channel.subscribe();

        channel.connect(addr(), Some(Arc::new("hello"))).await.unwrap();
        assert!(channel.is_connected());
        assert_eq!(channel.address_family(), Some(AddressFamily::Ipv4));
        let _peer = peers.recv().await.unwrap();

        match events.recv().await.unwrap() {
            ChannelEvent::Connected(data) => {
                let user_data = data.user_data.unwrap();
                assert_eq!(user_data.downcast_ref::<&str>(), Some(&"hello"));
            }
            other => panic!("unexpected event {:?}", other),
        }

        channel.close().await;
        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert!(matches!(events.recv().await.unwrap(), ChannelEvent::Closed(_)));

        // closing again is a no-op
        channel.close().await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reconnect_closes_first() {
        let (transport, mut peers) = DuplexTransport::new(64);
        let channel = channel(Arc::new(transport));
        let mut events = channel.subscribe();

        channel.connect(addr(), None).await.unwrap();
        channel.connect(addr(), None).await.unwrap();
        assert!(channel.is_connected());
        assert!(peers.recv().await.is_some());
        assert!(peers.recv().await.is_some());

        assert!(matches!(events.recv().await.unwrap(), ChannelEvent::Connected(_)));
        assert!(matches!(events.recv().await.unwrap(), ChannelEvent::Closed(_)));
        assert!(matches!(events.recv().await.unwrap(), ChannelEvent::Connected(_)));
    }

    #[tokio::test]
    async fn test_connect_while_connecting() {
        let (inner, _peers) = DuplexTransport::new(64);
        let transport = Arc::new(StalledTransport { inner, release: Notify::new() });
        let channel = channel(transport.clone());

        let connecting = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.connect(addr(), None).await })
        };
        while channel.state() != ChannelState::Connecting {
            tokio::task::yield_now().await;
        }

        // second connect returns immediately
        channel.connect(addr(), None).await.unwrap();
        assert_eq!(channel.state(), ChannelState::Connecting);

        transport.release.notify_one();
        connecting.await.unwrap().unwrap();
        assert!(channel.is_connected());
        channel.close().await;
    }

    #[tokio::test]
    async fn test_close_while_connecting() {
        let (inner, _peers) = DuplexTransport::new(64);
        let transport = Arc::new(StalledTransport { inner, release: Notify::new() });
        let channel = channel(transport.clone());
        let mut events = channel.subscribe();

        let connecting = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.connect(addr(), None).await })
        };
        while channel.state() != ChannelState::Connecting {
            tokio::task::yield_now().await;
        }

        channel.close().await;
        assert_eq!(channel.state(), ChannelState::Disconnected);

        transport.release.notify_one();
        assert_eq!(connecting.await.unwrap(), Err(ChannelError::ChannelClosed));
        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_call() {
        let (transport, _peers) = DuplexTransport::new(1024);
        let channel = channel(Arc::new(transport));
        channel.connect(addr(), None).await.unwrap();

        let call = channel.begin_call::<TestMessage>(&TestMessage::new(1, vec![])).unwrap();
        let unique_id = call.unique_id();
        assert_eq!(channel.pending_rpc_count(), 1);

        assert!(channel.cancel_call(unique_id));
        assert!(!channel.cancel_call(unique_id));
        assert_eq!(call.await, Err(ChannelError::Cancelled { unique_id }));
        assert_eq!(channel.pending_rpc_count(), 0);

        channel.close().await;
    }
}
