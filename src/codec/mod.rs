//! The pluggable wire format of a channel: a header codec, a body codec and optional body
//!  compression. The channel itself never looks inside a body, it only frames it.

use std::fmt::Debug;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use bytes::{Bytes, BytesMut};

use crate::codec::packet_body::{Compressor, Decompressor, PacketBodyCodec};
use crate::codec::packet_header::{DefaultPacketHeaderCodec, PacketHeader, PacketHeaderCodec};

pub mod packet_body;
pub mod packet_header;


/// Application messages that travel over a channel. Typically this is an enum with a variant
///  per message id.
pub trait ChannelMessage: Debug + Send + Sync + 'static {
    fn message_id(&self) -> i32;

    /// Messages opt into body compression. This is ignored if the channel has no compressor.
    fn wants_compression(&self) -> bool {
        false
    }

    /// Application level error code for RPC responses, 0 meaning success. A response with a
    ///  non-zero code fails the corresponding call.
    fn error_code(&self) -> i32 {
        0
    }
}


/// A header and body, serialized and ready to be written to the wire
#[derive(Clone, Debug)]
pub struct EncodedPacket {
    pub header: PacketHeader,
    pub header_buf: Bytes,
    pub body_buf: Bytes,
}

impl EncodedPacket {
    pub fn len(&self) -> usize {
        self.header_buf.len() + self.body_buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(self.len());
        result.extend_from_slice(&self.header_buf);
        result.extend_from_slice(&self.body_buf);
        result
    }
}


/// The set of codec strategies registered with a channel
pub struct ChannelCodec<M> {
    header: Arc<dyn PacketHeaderCodec>,
    body: Arc<dyn PacketBodyCodec<M>>,
    compressor: Option<Arc<dyn Compressor>>,
    decompressor: Option<Arc<dyn Decompressor>>,
}

impl<M> Clone for ChannelCodec<M> {
    fn clone(&self) -> Self {
        ChannelCodec {
            header: self.header.clone(),
            body: self.body.clone(),
            compressor: self.compressor.clone(),
            decompressor: self.decompressor.clone(),
        }
    }
}

impl<M: ChannelMessage> ChannelCodec<M> {
    pub fn new(body: Arc<dyn PacketBodyCodec<M>>) -> ChannelCodec<M> {
        ChannelCodec {
            header: Arc::new(DefaultPacketHeaderCodec),
            body,
            compressor: None,
            decompressor: None,
        }
    }

    pub fn with_header_codec(mut self, header: Arc<dyn PacketHeaderCodec>) -> ChannelCodec<M> {
        self.header = header;
        self
    }

    pub fn with_compression(mut self, compressor: Arc<dyn Compressor>, decompressor: Arc<dyn Decompressor>) -> ChannelCodec<M> {
        self.compressor = Some(compressor);
        self.decompressor = Some(decompressor);
        self
    }

    pub fn header_codec(&self) -> &Arc<dyn PacketHeaderCodec> {
        &self.header
    }

    pub fn header_len(&self) -> usize {
        self.header.header_len()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let header_len = self.header.header_len();
        if header_len == 0 {
            return Err(anyhow!("header codec must have a non-zero header length"));
        }
        if u16::try_from(header_len).is_err() {
            return Err(anyhow!("header length {} does not fit the header's u16 length field", header_len));
        }
        Ok(())
    }

    /// Serializes body and header. The body comes first because the header contains its
    ///  (possibly compressed) length.
    pub fn encode(&self, message: &M, unique_id: u64) -> anyhow::Result<EncodedPacket> {
        let mut body_buf = BytesMut::new();
        self.body.ser(message, &mut body_buf)
            .context("serializing packet body")?;

        let (body_buf, compression_flag) = match &self.compressor {
            Some(compressor) if message.wants_compression() => {
                let compressed = compressor.compress(&body_buf)
                    .context("compressing packet body")?;
                (compressed, PacketHeader::COMPRESSED)
            }
            _ => (body_buf.freeze(), PacketHeader::UNCOMPRESSED),
        };

        let header_len = self.header.header_len();
        let total_len = u32::try_from(header_len + body_buf.len())
            .map_err(|_| anyhow!("packet length {} exceeds the u32 length field", header_len + body_buf.len()))?;

        let header = PacketHeader {
            total_len,
            header_len: u16::try_from(header_len)?,
            message_id: message.message_id(),
            unique_id,
            compression_flag,
        };

        let mut header_buf = BytesMut::with_capacity(header_len);
        self.header.ser(&header, &mut header_buf)
            .context("serializing packet header")?;
        if header_buf.len() != header_len {
            return Err(anyhow!("header codec wrote {} bytes but declares a header length of {}", header_buf.len(), header_len));
        }

        Ok(EncodedPacket {
            header,
            header_buf: header_buf.freeze(),
            body_buf,
        })
    }

    pub fn decode_body(&self, header: &PacketHeader, body_buf: &[u8]) -> anyhow::Result<M> {
        if header.is_compressed() {
            let decompressor = self.decompressor.as_ref()
                .ok_or_else(|| anyhow!("received a compressed packet (message id {}) but there is no decompressor", header.message_id))?;
            let decompressed = decompressor.decompress(body_buf)
                .context("decompressing packet body")?;
            self.body.deser(header, &decompressed)
        }
        else {
            self.body.deser(header, body_buf)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::message::{TaggingCompression, TestMessage, TestMessageCodec};
    use rstest::rstest;

    fn codec(with_compression: bool) -> ChannelCodec<TestMessage> {
        let codec = ChannelCodec::new(Arc::new(TestMessageCodec));
        if with_compression {
            codec.with_compression(Arc::new(TaggingCompression), Arc::new(TaggingCompression))
        }
        else {
            codec
        }
    }

    #[rstest]
    #[case::empty_body(TestMessage::new(5, vec![]), 0, false, 23, PacketHeader::UNCOMPRESSED)]
    #[case::body(TestMessage::new(5, vec![1, 2, 3]), 0, false, 26, PacketHeader::UNCOMPRESSED)]
    #[case::rpc(TestMessage::new(9, vec![1, 2, 3]), 17, false, 26, PacketHeader::UNCOMPRESSED)]
    #[case::compression_not_requested(TestMessage::new(5, vec![1, 2, 3]), 0, true, 26, PacketHeader::UNCOMPRESSED)]
    #[case::compressed(TestMessage::new(5, vec![1, 2, 3]).compressed(), 0, true, 27, PacketHeader::COMPRESSED)]
    #[case::no_compressor(TestMessage::new(5, vec![1, 2, 3]).compressed(), 0, false, 26, PacketHeader::UNCOMPRESSED)]
    fn test_encode_decode(#[case] message: TestMessage, #[case] unique_id: u64, #[case] with_compression: bool, #[case] expected_total_len: u32, #[case] expected_compression_flag: u8) {
        let codec = codec(with_compression);

        let encoded = codec.encode(&message, unique_id).unwrap();
        assert_eq!(encoded.header.total_len, expected_total_len);
        assert_eq!(encoded.header.header_len as usize, DefaultPacketHeaderCodec::SERIALIZED_LEN);
        assert_eq!(encoded.header.unique_id, unique_id);
        assert_eq!(encoded.header.message_id, message.message_id);
        assert_eq!(encoded.header.compression_flag, expected_compression_flag);
        assert_eq!(encoded.len(), expected_total_len as usize);

        let header = codec.header_codec().deser(&encoded.header_buf).unwrap();
        assert_eq!(header, encoded.header);

        let decoded = codec.decode_body(&header, &encoded.body_buf).unwrap();
        assert_eq!(decoded.message_id, message.message_id);
        assert_eq!(decoded.error_code, message.error_code);
        assert_eq!(decoded.payload, message.payload);
    }

    #[test]
    fn test_decode_compressed_without_decompressor() {
        let encoded = codec(true).encode(&TestMessage::new(1, vec![4]).compressed(), 0).unwrap();
        assert!(codec(false).decode_body(&encoded.header, &encoded.body_buf).is_err());
    }

    #[test]
    fn test_encode_header_codec_length_mismatch() {
        let mut header_codec = crate::codec::packet_header::MockPacketHeaderCodec::new();
        header_codec.expect_header_len()
            .return_const(4usize);
        header_codec.expect_ser()
            .returning(|_, buf| {
                buf.extend_from_slice(&[1, 2, 3]);
                Ok(())
            });

        let codec = codec(false).with_header_codec(Arc::new(header_codec));
        assert!(codec.encode(&TestMessage::new(1, vec![]), 0).is_err());
    }

    #[rstest]
    #[case::zero(0, false)]
    #[case::regular(19, true)]
    #[case::too_big(70_000, false)]
    fn test_validate(#[case] header_len: usize, #[case] expected_ok: bool) {
        let mut header_codec = crate::codec::packet_header::MockPacketHeaderCodec::new();
        header_codec.expect_header_len()
            .return_const(header_len);

        let codec = codec(false).with_header_codec(Arc::new(header_codec));
        assert_eq!(codec.validate().is_ok(), expected_ok);
    }
}
