use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::channel::channel_config::ChannelConfig;
use crate::channel::network_channel::NetworkChannel;
use crate::channel::ticker::{run_ticker, Tick};
use crate::codec::{ChannelCodec, ChannelMessage};
use crate::transport::Transport;


/// Owns an application's channels by name. All channels share the manager's transport and codec,
///  and they are ticked together.
pub struct ChannelManager<M: ChannelMessage> {
    transport: Arc<dyn Transport>,
    codec: ChannelCodec<M>,
    channels: RwLock<FxHashMap<String, NetworkChannel<M>>>,
}

impl<M: ChannelMessage> ChannelManager<M> {
    pub fn new(transport: Arc<dyn Transport>, codec: ChannelCodec<M>) -> ChannelManager<M> {
        ChannelManager {
            transport,
            codec,
            channels: Default::default(),
        }
    }

    pub fn create_channel(&self, config: ChannelConfig) -> anyhow::Result<NetworkChannel<M>> {
        match self.channels.write().entry(config.name.clone()) {
            Entry::Occupied(_) => {
                Err(anyhow!("there is already a channel named {}", config.name))
            }
            Entry::Vacant(e) => {
                let channel = NetworkChannel::new(config, self.transport.clone(), self.codec.clone())?;
                debug!("created channel {}", channel.name());
                e.insert(channel.clone());
                Ok(channel)
            }
        }
    }

    pub fn get_channel(&self, name: &str) -> Option<NetworkChannel<M>> {
        self.channels.read().get(name).cloned()
    }

    pub fn has_channel(&self, name: &str) -> bool {
        self.channels.read().contains_key(name)
    }

    pub fn channel_names(&self) -> Vec<String> {
        let mut result = self.channels.read().keys().cloned().collect::<Vec<_>>();
        result.sort();
        result
    }

    /// Closes and removes a channel, returning `false` if there is no channel with this name
    pub async fn destroy_channel(&self, name: &str) -> bool {
        let removed = self.channels.write().remove(name);
        match removed {
            Some(channel) => {
                channel.close().await;
                debug!("destroyed channel {}", name);
                true
            }
            None => false,
        }
    }

    /// closes and removes all channels
    pub async fn shut_down(&self) {
        let channels = std::mem::take(&mut *self.channels.write());
        info!("shutting down {} channels", channels.len());
        for channel in channels.into_values() {
            channel.close().await;
        }
    }

    fn snapshot(&self) -> Vec<NetworkChannel<M>> {
        self.channels.read().values().cloned().collect()
    }

    pub fn spawn_ticker(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(run_ticker(self.clone(), period))
    }
}

#[async_trait]
impl<M: ChannelMessage> Tick for ChannelManager<M> {
    async fn tick(&self, elapsed: Duration) {
        for channel in self.snapshot() {
            channel.tick(elapsed).await;
        }
    }
}
