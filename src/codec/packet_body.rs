use bytes::{Bytes, BytesMut};

use crate::codec::packet_header::PacketHeader;


/// Application supplied (de)serialization of message bodies. The message id travels in the
///  header, so `deser` gets to see the header to decide what to deserialize.
pub trait PacketBodyCodec<M>: Send + Sync + 'static {
    fn ser(&self, message: &M, buf: &mut BytesMut) -> anyhow::Result<()>;

    fn deser(&self, header: &PacketHeader, buf: &[u8]) -> anyhow::Result<M>;
}

/// Optional compression of message bodies. It is applied only to messages that opt in (see
///  [crate::codec::ChannelMessage::wants_compression]), and the header's compression flag
///  tells the receiving side to decompress.
pub trait Compressor: Send + Sync + 'static {
    fn compress(&self, raw: &[u8]) -> anyhow::Result<Bytes>;
}

pub trait Decompressor: Send + Sync + 'static {
    fn decompress(&self, compressed: &[u8]) -> anyhow::Result<Bytes>;
}
