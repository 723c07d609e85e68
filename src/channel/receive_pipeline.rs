use std::sync::Arc;

use bytes::{Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::channel::channel_error::ChannelError;
use crate::codec::packet_header::{PacketHeader, PacketHeaderCodec};


/// A complete frame, body still serialized (and possibly compressed)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedFrame {
    pub header: PacketHeader,
    pub body: Bytes,
}

/// Handles frames as they are reassembled by the read loop. This is called from inside the read
///  loop, so implementations must not block.
#[cfg_attr(test, automock)]
pub trait FrameDispatcher: Send + Sync + 'static {
    fn on_frame(&self, frame: ReceivedFrame);
}


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceivePhase {
    AwaitingHeader,
    AwaitingBody(PacketHeader),
}

/// Reassembles frames from reads of arbitrary size. `buf` always has exactly the length that the
///  current phase requires, and `offset` is the number of bytes of it that were already read.
///
/// The state is owned by a connection's read task, so it needs no synchronization.
pub struct ReceiveState {
    header_codec: Arc<dyn PacketHeaderCodec>,
    max_body_len: u32,
    phase: ReceivePhase,
    buf: BytesMut,
    offset: usize,
}

impl ReceiveState {
    pub fn new(header_codec: Arc<dyn PacketHeaderCodec>, max_body_len: u32, initial_capacity: usize) -> ReceiveState {
        let mut result = ReceiveState {
            header_codec,
            max_body_len,
            phase: ReceivePhase::AwaitingHeader,
            buf: BytesMut::with_capacity(initial_capacity),
            offset: 0,
        };
        result.await_header();
        result
    }

    pub fn phase(&self) -> ReceivePhase {
        self.phase
    }

    /// The part of the buffer that the next read should go to. This is never empty.
    pub fn unfilled_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.offset..]
    }

    /// Registers that `num_read` bytes were read into `unfilled_mut()`, returning a frame if that
    ///  completed one.
    ///
    /// Failures here mean that the frame's boundaries are unknown, so the stream can not be
    ///  resumed. That includes a header the header codec rejects: unlike a malformed body, which
    ///  is dropped by the dispatcher, it is fatal for the connection.
    pub fn advance(&mut self, num_read: usize) -> Result<Option<ReceivedFrame>, ChannelError> {
        self.offset += num_read;
        if self.offset < self.buf.len() {
            return Ok(None);
        }

        match self.phase {
            ReceivePhase::AwaitingHeader => {
                let header = self.header_codec.deser(&self.buf)
                    .map_err(|e| ChannelError::serialize(&e.context("deserializing packet header")))?;

                let body_len = header.body_len()
                    .ok_or_else(|| ChannelError::Serialize(format!("total length {} is smaller than the header length {}", header.total_len, header.header_len)))?;
                if body_len > self.max_body_len {
                    return Err(ChannelError::PacketTooLarge {
                        len: body_len.into(),
                        max: self.max_body_len,
                    });
                }

                if body_len == 0 {
                    self.await_header();
                    return Ok(Some(ReceivedFrame {
                        header,
                        body: Bytes::new(),
                    }));
                }

                self.phase = ReceivePhase::AwaitingBody(header);
                self.buf.clear();
                self.buf.resize(body_len as usize, 0);
                self.offset = 0;
                Ok(None)
            }
            ReceivePhase::AwaitingBody(header) => {
                let body = self.buf.split().freeze();
                self.await_header();
                Ok(Some(ReceivedFrame {
                    header,
                    body,
                }))
            }
        }
    }

    /// Copies `data` into the state as if it was read in one chunk, returning all frames it
    ///  completes
    pub fn feed(&mut self, mut data: &[u8]) -> Result<Vec<ReceivedFrame>, ChannelError> {
        let mut result = Vec::new();
        while !data.is_empty() {
            let unfilled = self.unfilled_mut();
            let n = unfilled.len().min(data.len());
            unfilled[..n].copy_from_slice(&data[..n]);
            data = &data[n..];

            result.extend(self.advance(n)?);
        }
        Ok(result)
    }

    fn await_header(&mut self) {
        self.phase = ReceivePhase::AwaitingHeader;
        self.buf.clear();
        self.buf.resize(self.header_codec.header_len(), 0);
        self.offset = 0;
    }
}


/// Reads from `reader` until the remote end closes the connection (`Ok`) or there is a failure,
///  handing every complete frame to the dispatcher in wire order.
pub async fn receive_loop<D: FrameDispatcher, R: AsyncRead + Unpin>(dispatcher: Arc<D>, mut reader: R, mut state: ReceiveState) -> Result<(), ChannelError> {
    loop {
        let num_read = reader.read(state.unfilled_mut()).await
            .map_err(|e| ChannelError::receive(&e))?;
        if num_read == 0 {
            debug!("connection closed by remote end");
            return Ok(());
        }

        if let Some(frame) = state.advance(num_read)? {
            dispatcher.on_frame(frame);
        }
    }
}
