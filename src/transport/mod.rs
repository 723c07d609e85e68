use std::net::SocketAddr;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod tcp_transport;


pub type TransportReader = Box<dyn AsyncRead + Send + Unpin>;
pub type TransportWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// This abstracts over the kind of connection a channel runs on. A channel is handed a
///  transport at construction time and calls `connect` for every connection attempt, getting
///  back independent read and write halves of one ordered, reliable byte stream.
///
/// Dropping both halves closes the connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, addr: SocketAddr) -> std::io::Result<(TransportReader, TransportWriter)>;
}


#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl From<&SocketAddr> for AddressFamily {
    fn from(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => AddressFamily::Ipv4,
            SocketAddr::V6(_) => AddressFamily::Ipv6,
        }
    }
}
