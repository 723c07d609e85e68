use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
#[cfg(test)] use mockall::automock;


/// The per-frame header. Its wire representation is up to the [PacketHeaderCodec] that is
///  registered with a channel, this struct is just the information that travels in it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    /// length of the entire frame, i.e. header *and* body
    pub total_len: u32,
    pub header_len: u16,
    pub message_id: i32,
    /// RPC correlation token, 0 for messages that are not part of an RPC call
    pub unique_id: u64,
    pub compression_flag: u8,
}

impl PacketHeader {
    pub const UNCOMPRESSED: u8 = 0;
    pub const COMPRESSED: u8 = 1;

    /// `None` if the header violates `total_len >= header_len`
    pub fn body_len(&self) -> Option<u32> {
        self.total_len.checked_sub(self.header_len.into())
    }

    pub fn is_rpc(&self) -> bool {
        self.unique_id != 0
    }

    pub fn is_compressed(&self) -> bool {
        self.compression_flag != Self::UNCOMPRESSED
    }
}


/// Strategy for turning a [PacketHeader] into bytes and back.
///
/// Headers have a fixed length per codec: the receive pipeline reads exactly `header_len()`
///  bytes before calling `deser`, and `ser` must write exactly that many bytes.
#[cfg_attr(test, automock)]
pub trait PacketHeaderCodec: Send + Sync + 'static {
    fn header_len(&self) -> usize;

    fn ser(&self, header: &PacketHeader, buf: &mut BytesMut) -> anyhow::Result<()>;

    fn deser(&self, buf: &[u8]) -> anyhow::Result<PacketHeader>;
}


/// Header layout, all numbers in network byte order (BE):
///
/// ```ascii
///  0: total length (u32) - header and body
///  4: header length (u16) - always 19 for this codec
///  6: message id (i32)
/// 10: unique id (u64) - RPC correlation, 0 if not an RPC
/// 18: compression flag (u8)
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultPacketHeaderCodec;

impl DefaultPacketHeaderCodec {
    pub const SERIALIZED_LEN: usize = 19;
    pub const SERIALIZED_LEN_U16: u16 = Self::SERIALIZED_LEN as u16;
}

impl PacketHeaderCodec for DefaultPacketHeaderCodec {
    fn header_len(&self) -> usize {
        Self::SERIALIZED_LEN
    }

    fn ser(&self, header: &PacketHeader, buf: &mut BytesMut) -> anyhow::Result<()> {
        if header.header_len != Self::SERIALIZED_LEN_U16 {
            bail!("header length must be {} for this codec, was {}", Self::SERIALIZED_LEN, header.header_len);
        }

        buf.put_u32(header.total_len);
        buf.put_u16(header.header_len);
        buf.put_i32(header.message_id);
        buf.put_u64(header.unique_id);
        buf.put_u8(header.compression_flag);
        Ok(())
    }

    fn deser(&self, mut buf: &[u8]) -> anyhow::Result<PacketHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("buffer underflow: packet header requires {} bytes, got {}", Self::SERIALIZED_LEN, buf.remaining());
        }

        let total_len = buf.get_u32();
        let header_len = buf.get_u16();
        if header_len != Self::SERIALIZED_LEN_U16 {
            bail!("unsupported header length {}", header_len);
        }
        if total_len < header_len as u32 {
            bail!("total length {} is smaller than the header length {}", total_len, header_len);
        }

        Ok(PacketHeader {
            total_len,
            header_len,
            message_id: buf.get_i32(),
            unique_id: buf.get_u64(),
            compression_flag: buf.get_u8(),
        })
    }
}
