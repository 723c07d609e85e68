use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};

use crate::codec::packet_header::{PacketHeader, PacketHeaderCodec};


/// A 13 byte header without an explicit header length field and with a 32 bit unique id, to
///  exercise channels with a header layout other than the default:
///
/// ```ascii
///  0: total length (u32)
///  4: message id (i32)
///  8: unique id (u32)
/// 12: compression flag (u8)
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct CompactPacketHeaderCodec;

impl CompactPacketHeaderCodec {
    pub const SERIALIZED_LEN: usize = 13;
    pub const SERIALIZED_LEN_U16: u16 = Self::SERIALIZED_LEN as u16;

    pub fn frame(message_id: i32, unique_id: u32, body: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u32((Self::SERIALIZED_LEN + body.len()) as u32);
        buf.put_i32(message_id);
        buf.put_u32(unique_id);
        buf.put_u8(PacketHeader::UNCOMPRESSED);
        buf.put_slice(body);
        buf.to_vec()
    }
}

impl PacketHeaderCodec for CompactPacketHeaderCodec {
    fn header_len(&self) -> usize {
        Self::SERIALIZED_LEN
    }

    fn ser(&self, header: &PacketHeader, buf: &mut BytesMut) -> anyhow::Result<()> {
        let unique_id = match u32::try_from(header.unique_id) {
            Ok(id) => id,
            Err(_) => bail!("unique id {} does not fit into 32 bits", header.unique_id),
        };

        buf.put_u32(header.total_len);
        buf.put_i32(header.message_id);
        buf.put_u32(unique_id);
        buf.put_u8(header.compression_flag);
        Ok(())
    }

    fn deser(&self, mut buf: &[u8]) -> anyhow::Result<PacketHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("buffer underflow: packet header requires {} bytes, got {}", Self::SERIALIZED_LEN, buf.remaining());
        }

        let total_len = buf.get_u32();
        if total_len < Self::SERIALIZED_LEN as u32 {
            bail!("total length {} is smaller than the header length {}", total_len, Self::SERIALIZED_LEN);
        }

        Ok(PacketHeader {
            total_len,
            header_len: Self::SERIALIZED_LEN_U16,
            message_id: buf.get_i32(),
            unique_id: buf.get_u32().into(),
            compression_flag: buf.get_u8(),
        })
    }
}
