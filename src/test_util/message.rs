use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::ChannelMessage;
use crate::codec::packet_body::{Compressor, Decompressor, PacketBodyCodec};
use crate::codec::packet_header::PacketHeader;


/// A generic message for tests: the body is an error code followed by an opaque payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestMessage {
    pub message_id: i32,
    pub error_code: i32,
    pub payload: Vec<u8>,
    pub compress: bool,
}

impl TestMessage {
    pub fn new(message_id: i32, payload: Vec<u8>) -> TestMessage {
        TestMessage {
            message_id,
            error_code: 0,
            payload,
            compress: false,
        }
    }

    pub fn compressed(mut self) -> TestMessage {
        self.compress = true;
        self
    }

    pub fn with_error_code(mut self, error_code: i32) -> TestMessage {
        self.error_code = error_code;
        self
    }
}

impl ChannelMessage for TestMessage {
    fn message_id(&self) -> i32 {
        self.message_id
    }

    fn wants_compression(&self) -> bool {
        self.compress
    }

    fn error_code(&self) -> i32 {
        self.error_code
    }
}

/// message id that [TestMessageCodec] refuses to serialize or deserialize
pub const UNSERIALIZABLE_MESSAGE_ID: i32 = -999;

pub struct TestMessageCodec;

impl TestMessageCodec {
    pub const ERROR_CODE_LEN: usize = size_of::<i32>();
}

impl PacketBodyCodec<TestMessage> for TestMessageCodec {
    fn ser(&self, message: &TestMessage, buf: &mut BytesMut) -> anyhow::Result<()> {
        if message.message_id == UNSERIALIZABLE_MESSAGE_ID {
            bail!("message id {} is not serializable", message.message_id);
        }
        buf.put_i32(message.error_code);
        buf.put_slice(&message.payload);
        Ok(())
    }

    fn deser(&self, header: &PacketHeader, mut buf: &[u8]) -> anyhow::Result<TestMessage> {
        if header.message_id == UNSERIALIZABLE_MESSAGE_ID {
            bail!("message id {} is not deserializable", header.message_id);
        }
        if !buf.has_remaining() {
            // a frame without a body
            return Ok(TestMessage {
                message_id: header.message_id,
                error_code: 0,
                payload: vec![],
                compress: header.is_compressed(),
            });
        }
        if buf.remaining() < Self::ERROR_CODE_LEN {
            bail!("buffer underflow: message body requires at least {} bytes", Self::ERROR_CODE_LEN);
        }
        let error_code = buf.get_i32();

        Ok(TestMessage {
            message_id: header.message_id,
            error_code,
            payload: buf.to_vec(),
            compress: header.is_compressed(),
        })
    }
}


/// Stand-in for a real compression algorithm: it prefixes a marker byte, and decompression
///  checks and strips it. That is enough to verify that the channel routes bodies through the
///  compressor and decompressor.
pub struct TaggingCompression;

impl TaggingCompression {
    pub const MARKER: u8 = 0x5a;
}

impl Compressor for TaggingCompression {
    fn compress(&self, raw: &[u8]) -> anyhow::Result<Bytes> {
        let mut buf = BytesMut::with_capacity(raw.len() + 1);
        buf.put_u8(Self::MARKER);
        buf.put_slice(raw);
        Ok(buf.freeze())
    }
}

impl Decompressor for TaggingCompression {
    fn decompress(&self, compressed: &[u8]) -> anyhow::Result<Bytes> {
        match compressed.split_first() {
            Some((&Self::MARKER, raw)) => Ok(Bytes::copy_from_slice(raw)),
            _ => bail!("not a compressed buffer"),
        }
    }
}
