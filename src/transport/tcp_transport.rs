use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use crate::transport::{Transport, TransportReader, TransportWriter};


/// A plain TCP connection, split into owned halves so that reading and writing can run in
///  separate tasks
#[derive(Clone, Debug)]
pub struct TcpTransport {
    pub nodelay: bool,
}

impl Default for TcpTransport {
    fn default() -> Self {
        TcpTransport {
            nodelay: true,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, addr: SocketAddr) -> std::io::Result<(TransportReader, TransportWriter)> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(self.nodelay)?;
        debug!("connected TCP stream {:?} -> {:?}", stream.local_addr()?, addr);

        let (reader, writer) = stream.into_split();
        Ok((Box::new(reader), Box::new(writer)))
    }
}
