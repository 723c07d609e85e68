use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

use crate::channel::channel_state::ChannelState;


/// Coarse classification of a [ChannelError], carried by error events
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum ChannelErrorKind {
    Connect = 1,
    Send = 2,
    Receive = 3,
    Serialize = 4,
    RpcTimeout = 5,
    RpcServerError = 6,
    ChannelClosed = 7,
    NotConnected = 8,
    Cancelled = 9,
    UnexpectedResponse = 10,
    PacketTooLarge = 11,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("connect failed: {message}")]
    Connect {
        socket_error_code: Option<i32>,
        message: String,
    },

    #[error("send failed: {message}")]
    Send {
        socket_error_code: Option<i32>,
        message: String,
    },

    #[error("receive failed: {message}")]
    Receive {
        socket_error_code: Option<i32>,
        message: String,
    },

    /// header or body codec failure
    #[error("serialization failed: {0}")]
    Serialize(String),

    #[error("RPC call {unique_id} timed out")]
    RpcTimeout {
        unique_id: u64,
    },

    /// a well-formed response carrying a non-zero application error code
    #[error("RPC call {unique_id} failed on the server with error code {error_code}")]
    RpcServerError {
        unique_id: u64,
        error_code: i32,
    },

    #[error("channel was closed")]
    ChannelClosed,

    #[error("channel {channel} is not connected (state {state:?})")]
    NotConnected {
        channel: String,
        state: ChannelState,
    },

    #[error("RPC call {unique_id} was cancelled")]
    Cancelled {
        unique_id: u64,
    },

    #[error("RPC call {unique_id} got a response with message id {message_id} that is not a {expected}")]
    UnexpectedResponse {
        unique_id: u64,
        message_id: i32,
        expected: &'static str,
    },

    #[error("packet body of {len} bytes exceeds the maximum of {max} bytes")]
    PacketTooLarge {
        len: u64,
        max: u32,
    },
}

impl ChannelError {
    pub fn connect(e: &std::io::Error) -> ChannelError {
        ChannelError::Connect {
            socket_error_code: e.raw_os_error(),
            message: e.to_string(),
        }
    }

    pub fn send(e: &std::io::Error) -> ChannelError {
        ChannelError::Send {
            socket_error_code: e.raw_os_error(),
            message: e.to_string(),
        }
    }

    pub fn receive(e: &std::io::Error) -> ChannelError {
        ChannelError::Receive {
            socket_error_code: e.raw_os_error(),
            message: e.to_string(),
        }
    }

    /// `{:#}` keeps anyhow's context chain in a single line
    pub fn serialize(e: &anyhow::Error) -> ChannelError {
        ChannelError::Serialize(format!("{:#}", e))
    }

    pub fn kind(&self) -> ChannelErrorKind {
        match self {
            ChannelError::Connect { .. } => ChannelErrorKind::Connect,
            ChannelError::Send { .. } => ChannelErrorKind::Send,
            ChannelError::Receive { .. } => ChannelErrorKind::Receive,
            ChannelError::Serialize(_) => ChannelErrorKind::Serialize,
            ChannelError::RpcTimeout { .. } => ChannelErrorKind::RpcTimeout,
            ChannelError::RpcServerError { .. } => ChannelErrorKind::RpcServerError,
            ChannelError::ChannelClosed => ChannelErrorKind::ChannelClosed,
            ChannelError::NotConnected { .. } => ChannelErrorKind::NotConnected,
            ChannelError::Cancelled { .. } => ChannelErrorKind::Cancelled,
            ChannelError::UnexpectedResponse { .. } => ChannelErrorKind::UnexpectedResponse,
            ChannelError::PacketTooLarge { .. } => ChannelErrorKind::PacketTooLarge,
        }
    }

    /// The operating system's error code for transport level failures, if there is one
    pub fn socket_error_code(&self) -> Option<i32> {
        match self {
            ChannelError::Connect { socket_error_code, .. } |
            ChannelError::Send { socket_error_code, .. } |
            ChannelError::Receive { socket_error_code, .. } => *socket_error_code,
            _ => None,
        }
    }
}
