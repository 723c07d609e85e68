use std::time::Duration;

use parking_lot::Mutex;


/// Supplies the application's heartbeat message. Returning `None` means that no heartbeat can be
///  sent right now, which counts as a missed heartbeat just like a failed send.
pub trait HeartbeatHandler<M: 'static>: Send + Sync + 'static {
    fn create_heartbeat(&self) -> Option<M>;
}


#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct HeartbeatState {
    pub elapsed: Duration,
    pub miss_count: u32,
}

/// Liveness bookkeeping. It is touched both by the periodic tick and by the read task, so the
///  state lives behind its own lock, separate from all other channel state. The lock is never
///  held while sending.
pub struct HeartbeatMonitor {
    interval: Option<Duration>,
    state: Mutex<HeartbeatState>,
}

impl HeartbeatMonitor {
    pub fn new(interval: Option<Duration>) -> HeartbeatMonitor {
        HeartbeatMonitor {
            interval,
            state: Default::default(),
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Adds `elapsed` and returns `true` if a heartbeat is due. Elapsed time is reset whenever a
    ///  heartbeat becomes due, whether or not sending it succeeds, so intervals do not compound.
    pub fn on_tick(&self, elapsed: Duration) -> bool {
        let Some(interval) = self.interval else {
            return false;
        };

        let mut state = self.state.lock();
        state.elapsed += elapsed;
        if state.elapsed < interval {
            return false;
        }
        state.elapsed = Duration::ZERO;
        true
    }

    /// returns the new miss count
    pub fn on_heartbeat_failed(&self) -> u32 {
        let mut state = self.state.lock();
        state.miss_count += 1;
        state.miss_count
    }

    pub fn on_packet_received(&self, reset_elapsed: bool, reset_miss_count: bool) {
        let mut state = self.state.lock();
        if reset_elapsed {
            state.elapsed = Duration::ZERO;
        }
        if reset_miss_count {
            state.miss_count = 0;
        }
    }

    pub fn reset(&self) {
        *self.state.lock() = HeartbeatState::default();
    }

    pub fn snapshot(&self) -> HeartbeatState {
        *self.state.lock()
    }

    pub fn miss_count(&self) -> u32 {
        self.state.lock().miss_count
    }

    pub fn elapsed(&self) -> Duration {
        self.state.lock().elapsed
    }
}
