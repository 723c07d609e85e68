use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::trace;

use crate::channel::channel_error::{ChannelError, ChannelErrorKind};


/// Opaque application data passed to `connect` and handed back in the [ChannelEvent::Connected]
///  event
pub type UserData = Arc<dyn Any + Send + Sync>;

#[derive(Clone, Debug)]
pub enum ChannelEvent {
    Connected(ConnectedData),
    Closed(ClosedData),
    Error(ErrorData),
    MissHeartbeat(MissHeartbeatData),
}

impl ChannelEvent {
    pub fn channel(&self) -> &str {
        match self {
            ChannelEvent::Connected(data) => &data.channel,
            ChannelEvent::Closed(data) => &data.channel,
            ChannelEvent::Error(data) => &data.channel,
            ChannelEvent::MissHeartbeat(data) => &data.channel,
        }
    }
}

#[derive(Clone)]
pub struct ConnectedData {
    pub channel: String,
    pub user_data: Option<UserData>,
}
impl Debug for ConnectedData {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectedData")
            .field("channel", &self.channel)
            .field("user_data", &self.user_data.as_ref().map(|_| "..."))
            .finish()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClosedData {
    pub channel: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ErrorData {
    pub channel: String,
    pub error_code: ChannelErrorKind,
    /// the operating system's error code for transport failures
    pub socket_error_code: Option<i32>,
    pub message: String,
}
impl ErrorData {
    pub fn new(channel: &str, error: &ChannelError) -> ErrorData {
        ErrorData {
            channel: channel.to_string(),
            error_code: error.kind(),
            socket_error_code: error.socket_error_code(),
            message: error.to_string(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MissHeartbeatData {
    pub channel: String,
    pub miss_count: u32,
}


pub struct ChannelEventNotifier {
    sender: broadcast::Sender<ChannelEvent>,
}
impl ChannelEventNotifier {
    pub fn new(capacity: usize) -> ChannelEventNotifier {
        let (sender, _) = broadcast::channel(capacity);

        ChannelEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: ChannelEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}
