use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use num_enum::{IntoPrimitive, TryFromPrimitive};


/// ```ascii
/// Disconnected -> Connecting -> Connected -> Closing -> Disconnected
///                     |                                     ^
///                     +------------- (failure) -------------+
/// ```
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum ChannelState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Closing = 3,
}

/// A [ChannelState] that can be read without taking the channel's lifecycle lock. Only the
///  lifecycle code writes it, and it does so while holding that lock.
pub struct AtomicChannelState(AtomicU8);

impl AtomicChannelState {
    pub fn new(state: ChannelState) -> AtomicChannelState {
        AtomicChannelState(AtomicU8::new(state.into()))
    }

    pub fn get(&self) -> ChannelState {
        ChannelState::try_from(self.0.load(Ordering::Acquire))
            .unwrap_or(ChannelState::Disconnected)
    }

    pub fn set(&self, state: ChannelState) {
        self.0.store(state.into(), Ordering::Release);
    }
}


#[derive(Default)]
pub struct ChannelCounters {
    sent_packets: AtomicU64,
    received_packets: AtomicU64,
    pending_sends: AtomicUsize,
}

impl ChannelCounters {
    pub fn reset(&self) {
        self.sent_packets.store(0, Ordering::Relaxed);
        self.received_packets.store(0, Ordering::Relaxed);
        self.pending_sends.store(0, Ordering::Relaxed);
    }

    pub fn sent_packets(&self) -> u64 {
        self.sent_packets.load(Ordering::Relaxed)
    }

    pub fn received_packets(&self) -> u64 {
        self.received_packets.load(Ordering::Relaxed)
    }

    pub fn pending_sends(&self) -> usize {
        self.pending_sends.load(Ordering::Relaxed)
    }

    pub fn on_enqueued(&self) {
        self.pending_sends.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_sent(&self) {
        self.sent_packets.fetch_add(1, Ordering::Relaxed);
        self.pending_sends.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn on_discarded(&self, num_discarded: usize) {
        self.pending_sends.fetch_sub(num_discarded, Ordering::Relaxed);
    }

    pub fn on_received(&self) {
        self.received_packets.fetch_add(1, Ordering::Relaxed);
    }
}
