use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::trace;

use crate::channel::channel_state::ChannelCounters;
use crate::codec::EncodedPacket;


/// A serialized packet waiting to be written
#[derive(Clone, Debug)]
pub struct SendEntry {
    pub message_id: i32,
    pub header: Bytes,
    pub body: Bytes,
}

impl SendEntry {
    pub fn len(&self) -> usize {
        self.header.len() + self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<EncodedPacket> for SendEntry {
    fn from(value: EncodedPacket) -> Self {
        SendEntry {
            message_id: value.header.message_id,
            header: value.header_buf,
            body: value.body_buf,
        }
    }
}


/// The outbound queue. Only the head entry is ever partially written, and `cursor` is the number
///  of its bytes that are already on the wire.
pub struct SendState {
    queue: VecDeque<SendEntry>,
    cursor: usize,
    open: bool,
}

impl SendState {
    pub fn new() -> SendState {
        SendState {
            queue: VecDeque::new(),
            cursor: 0,
            open: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// returns `false` and drops the entry if the queue is closed
    pub fn enqueue(&mut self, entry: SendEntry) -> bool {
        if !self.open {
            return false;
        }
        self.queue.push_back(entry);
        true
    }

    /// The unwritten rest of the head entry's header or, once the header is written, of its body.
    ///  Slicing `Bytes` is cheap, there is no copying here.
    pub fn next_chunk(&self) -> Option<Bytes> {
        let head = self.queue.front()?;
        if self.cursor < head.header.len() {
            Some(head.header.slice(self.cursor..))
        }
        else {
            Some(head.body.slice(self.cursor - head.header.len()..))
        }
    }

    /// Registers that `num_written` bytes of the head entry were written, returning the entry if
    ///  it is now complete
    pub fn advance(&mut self, num_written: usize) -> Option<SendEntry> {
        let head_len = self.queue.front()?.len();
        self.cursor += num_written;
        if self.cursor < head_len {
            return None;
        }

        self.cursor = 0;
        self.queue.pop_front()
    }

    /// Empties the queue (including a partially written head entry), returning the number of
    ///  discarded entries
    pub fn discard(&mut self) -> usize {
        let result = self.queue.len();
        self.queue.clear();
        self.cursor = 0;
        result
    }
}

impl Default for SendState {
    fn default() -> Self {
        SendState::new()
    }
}


/// The queue shared between application code enqueueing packets and the write task draining it
pub struct SendPipeline {
    state: Mutex<SendState>,
    notify: Notify,
    counters: Arc<ChannelCounters>,
}

impl SendPipeline {
    pub fn new(counters: Arc<ChannelCounters>) -> SendPipeline {
        SendPipeline {
            state: Mutex::new(SendState::new()),
            notify: Notify::new(),
            counters,
        }
    }

    /// starts accepting packets for a new connection, discarding anything left over
    pub fn open(&self) {
        let mut state = self.state.lock();
        let num_discarded = state.discard();
        self.counters.on_discarded(num_discarded);
        state.open = true;
    }

    /// stops accepting packets and discards queued ones
    pub fn close(&self) -> usize {
        let mut state = self.state.lock();
        state.open = false;
        let num_discarded = state.discard();
        self.counters.on_discarded(num_discarded);
        num_discarded
    }

    /// counters are updated while holding the queue lock, so they never run ahead of the queue
    pub fn enqueue(&self, entry: SendEntry) -> bool {
        {
            let mut state = self.state.lock();
            if !state.enqueue(entry) {
                return false;
            }
            self.counters.on_enqueued();
        }
        self.notify.notify_one();
        true
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().len()
    }

    fn next_chunk(&self) -> Option<Bytes> {
        self.state.lock().next_chunk()
    }

    fn advance(&self, num_written: usize) {
        let completed = {
            let mut state = self.state.lock();
            let completed = state.advance(num_written);
            if completed.is_some() {
                self.counters.on_sent();
            }
            completed
        };
        if let Some(entry) = completed {
            trace!("wrote packet with message id {} ({} bytes)", entry.message_id, entry.len());
        }
    }
}


/// Drains the send queue into `writer`, one write at a time so that wire order is enqueue order.
///  It flushes whenever the queue runs empty, and only returns on a write failure: a connection's
///  write task is aborted when the connection is closed.
pub async fn write_loop<W: AsyncWrite + Unpin>(pipeline: Arc<SendPipeline>, mut writer: W) -> std::io::Result<()> {
    loop {
        match pipeline.next_chunk() {
            Some(chunk) => {
                let num_written = writer.write(&chunk).await?;
                if num_written == 0 {
                    return Err(std::io::ErrorKind::WriteZero.into());
                }
                pipeline.advance(num_written);
            }
            None => {
                writer.flush().await?;
                // a permit stored by `notify_one` covers an enqueue between `next_chunk` and here
                pipeline.notify.notified().await;
            }
        }
    }
}
