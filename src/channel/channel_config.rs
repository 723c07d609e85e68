use std::time::Duration;

use anyhow::bail;
use rustc_hash::FxHashSet;


#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub name: String,

    /// `None` switches heartbeats off
    pub heartbeat_interval: Option<Duration>,
    /// receiving *any* packet counts as proof of liveness, not only heartbeat responses
    pub reset_heartbeat_elapsed_on_receive: bool,
    pub reset_miss_count_on_receive: bool,
    /// The channel closes itself when this many heartbeats in a row could not be sent. `None`
    ///  leaves that decision to the application, which is notified of every miss.
    pub max_missed_heartbeats: Option<u32>,

    pub rpc_timeout: Duration,

    /// upper bound for a packet's body length, both for sending and receiving
    pub max_packet_len: u32,
    /// initial capacity of the receive buffer, it grows for bigger packets
    pub receive_buffer_len: usize,

    /// message ids that are not logged per packet, typically heartbeats or other high-frequency
    ///  traffic
    pub log_suppressed_message_ids: FxHashSet<i32>,

    pub event_capacity: usize,
    pub tick_interval: Duration,
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>) -> ChannelConfig {
        ChannelConfig {
            name: name.into(),
            heartbeat_interval: Some(Duration::from_secs(30)),
            reset_heartbeat_elapsed_on_receive: true,
            reset_miss_count_on_receive: true,
            max_missed_heartbeats: None,
            rpc_timeout: Duration::from_secs(10),
            max_packet_len: 16 * 1024 * 1024,
            receive_buffer_len: 8192,
            log_suppressed_message_ids: Default::default(),
            event_capacity: 128,
            tick_interval: Duration::from_millis(100),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.is_empty() {
            bail!("channel name must not be empty");
        }
        if self.heartbeat_interval == Some(Duration::ZERO) {
            bail!("heartbeat interval must be positive - use `None` to disable heartbeats");
        }
        if self.max_missed_heartbeats == Some(0) {
            bail!("max missed heartbeats must be positive");
        }
        if self.rpc_timeout.is_zero() {
            bail!("RPC timeout must be positive");
        }
        if self.tick_interval.is_zero() {
            bail!("tick interval must be positive");
        }
        if self.event_capacity == 0 {
            bail!("event capacity must be positive");
        }
        Ok(())
    }

    pub fn is_logged(&self, message_id: i32) -> bool {
        !self.log_suppressed_message_ids.contains(&message_id)
    }
}
