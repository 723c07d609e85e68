use std::collections::hash_map::Entry;
use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::debug;


/// Application code handling inbound messages that are not RPC responses. Handlers are called
///  from a connection's read task, so they must not block: anything expensive should be handed
///  off to a separate task.
pub trait PacketHandler<M>: Send + Sync + 'static {
    fn handle(&self, message: M);
}

impl<M, F: Fn(M) + Send + Sync + 'static> PacketHandler<M> for F {
    fn handle(&self, message: M) {
        self(message)
    }
}


type HandlerMap<M> = FxHashMap<i32, Arc<dyn PacketHandler<M>>>;

/// Handlers by message id, plus an optional default handler for all other ids.
///
/// Changes replace the map as a whole, and dispatch works on a snapshot of it, so handlers can
///  be (de)registered at any time, even from inside a handler.
pub struct PacketHandlerRegistry<M> {
    handlers: RwLock<Arc<HandlerMap<M>>>,
    default_handler: RwLock<Option<Arc<dyn PacketHandler<M>>>>,
}

impl<M> Default for PacketHandlerRegistry<M> {
    fn default() -> Self {
        PacketHandlerRegistry {
            handlers: RwLock::new(Arc::new(FxHashMap::default())),
            default_handler: RwLock::new(None),
        }
    }
}

impl<M: 'static> PacketHandlerRegistry<M> {
    pub fn register(&self, message_id: i32, handler: Arc<dyn PacketHandler<M>>) -> anyhow::Result<()> {
        let mut handlers = self.handlers.write();
        let mut new_handlers = handlers.as_ref().clone();
        match new_handlers.entry(message_id) {
            Entry::Occupied(_) => {
                Err(anyhow!("registering a second handler for message id {}", message_id))
            }
            Entry::Vacant(e) => {
                e.insert(handler);
                *handlers = Arc::new(new_handlers);
                Ok(())
            }
        }
    }

    pub fn deregister(&self, message_id: i32) -> anyhow::Result<()> {
        let mut handlers = self.handlers.write();
        let mut new_handlers = handlers.as_ref().clone();
        if new_handlers.remove(&message_id).is_none() {
            return Err(anyhow!("deregistering handler for message id {} which is not registered", message_id));
        }
        *handlers = Arc::new(new_handlers);
        Ok(())
    }

    pub fn set_default_handler(&self, handler: Option<Arc<dyn PacketHandler<M>>>) {
        *self.default_handler.write() = handler;
    }

    pub fn has_handler(&self, message_id: i32) -> bool {
        self.handlers.read().contains_key(&message_id)
    }

    /// Returns `false` if there was no handler for the message
    pub fn dispatch(&self, message_id: i32, message: M) -> bool {
        let handler = self.handlers.read().get(&message_id).cloned()
            .or_else(|| self.default_handler.read().clone());

        match handler {
            Some(handler) => {
                handler.handle(message);
                true
            }
            None => {
                debug!("received message with id {} for which there is no handler - ignoring", message_id);
                false
            }
        }
    }
}
