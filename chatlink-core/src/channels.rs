//! Joined-channel bookkeeping for one connection.
//!
//! The snapshot mirrors whatever the server last reported and is replaced
//! wholesale on every change. It outlives sessions so that the channels
//! joined before a drop can be requested again after reconnecting.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::Connection;
use crate::listeners::{ListenerId, Listeners};

/// Notified with the full new list every time a connection's channels change.
pub trait ChannelListListener: Send + Sync {
    fn channel_list_changed(&self, connection: &Connection, channels: &[String]);
}

/// Current channel snapshot plus its subscribers.
#[derive(Default)]
pub struct ChannelMembership {
    current: Mutex<Vec<String>>,
    listeners: Listeners<dyn ChannelListListener>,
}

impl ChannelMembership {
    pub fn new(initial: Vec<String>) -> Self {
        Self {
            current: Mutex::new(initial),
            listeners: Listeners::new(),
        }
    }

    pub fn get(&self) -> Vec<String> {
        self.current.lock().clone()
    }

    /// Replace the snapshot. Does not notify; see [`Connection::set_channels`].
    pub fn replace(&self, channels: Vec<String>) {
        *self.current.lock() = channels;
    }

    pub fn subscribe(&self, listener: Arc<dyn ChannelListListener>) -> ListenerId {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    pub(crate) fn notify(&self, connection: &Connection, channels: &[String]) {
        self.listeners
            .notify(|l| l.channel_list_changed(connection, channels));
    }
}

/// Channels to request once a connection is established.
///
/// Autojoin channels always come first. The channels joined before the drop
/// follow only when `rejoin` is set. Duplicates are passed through as-is.
pub fn join_list(autojoin: &[String], previous: &[String], rejoin: bool) -> Vec<String> {
    let mut channels = autojoin.to_vec();
    if rejoin {
        channels.extend_from_slice(previous);
    }
    channels
}
