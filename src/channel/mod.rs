//! A client side network channel: one ordered, reliable byte stream to a server, carrying
//!  length-framed packets in both directions, with heartbeats and request / response
//!  correlation on top.

pub mod channel_config;
pub mod channel_error;
pub mod channel_events;
pub mod channel_manager;
pub mod channel_state;
pub mod heartbeat;
pub mod network_channel;
pub mod packet_handlers;
pub mod receive_pipeline;
pub mod rpc;
pub mod send_pipeline;
pub mod ticker;
