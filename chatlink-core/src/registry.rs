//! Owns every configured connection.
//!
//! Re-broadcasts per-connection changes to registry-wide listeners and keeps
//! the autoconnect list on disk in step with which connections are wanted.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::autoconnect::{AutoconnectEntry, AutoconnectStore};
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionDeps, ConnectionObserver, ConnectionStatus};
use crate::error::{ConfigError, ConnectionError};
use crate::listeners::{ListenerId, Listeners};

/// Registry-wide notifications. Every method defaults to a no-op.
pub trait RegistryListener: Send + Sync {
    fn connection_added(&self, _connection: &Connection) {}
    fn connection_removed(&self, _connection: &Connection) {}
    fn connection_info_changed(&self, _connection: &Connection) {}
    fn channel_list_changed(&self, _connection: &Connection, _channels: &[String]) {}
    fn connection_fully_disconnected(&self, _connection: &Connection) {}
}

pub struct ConnectionRegistry {
    me: Weak<ConnectionRegistry>,
    deps: ConnectionDeps,
    store: Arc<dyn AutoconnectStore>,
    connections: Mutex<Vec<Arc<Connection>>>,
    /// Removed once their disconnect completes.
    pending_removal: Mutex<HashSet<Uuid>>,
    listeners: Listeners<dyn RegistryListener>,
    settled: Notify,
    /// Cleared by `shutdown` so teardown doesn't empty the saved list.
    persist: AtomicBool,
    /// A background save is spawned and hasn't read the list yet.
    save_queued: AtomicBool,
    /// Held from reading the list until it is written.
    save_lock: Mutex<()>,
}

impl ConnectionRegistry {
    pub fn new(deps: ConnectionDeps, store: Arc<dyn AutoconnectStore>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            deps,
            store,
            connections: Mutex::new(Vec::new()),
            pending_removal: Mutex::new(HashSet::new()),
            listeners: Listeners::new(),
            settled: Notify::new(),
            persist: AtomicBool::new(true),
            save_queued: AtomicBool::new(false),
            save_lock: Mutex::new(()),
        })
    }

    // ── Membership ──

    /// Register a connection for `config`, seeded with `initial_channels`.
    pub fn add(&self, config: ServerConfig, initial_channels: Vec<String>) -> Result<Arc<Connection>, ConnectionError> {
        let connection = {
            let mut connections = self.connections.lock();
            if connections.iter().any(|c| c.id() == config.id) {
                return Err(ConnectionError::AlreadyRegistered(config.id));
            }
            let observer: Weak<dyn ConnectionObserver> = self.me.clone();
            let connection = Connection::with_observer(config, initial_channels, self.deps.clone(), observer);
            connections.push(Arc::clone(&connection));
            connection
        };
        tracing::debug!(connection = %connection.id(), name = %connection.name(), "Connection added");
        self.listeners.notify(|l| l.connection_added(&connection));
        Ok(connection)
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Connection>> {
        self.connections.lock().iter().find(|c| c.id() == id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<Connection>> {
        self.connections
            .lock()
            .iter()
            .find(|c| c.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// All connections, in registration order.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().clone()
    }

    /// Remove a connection that is already disconnected.
    pub fn remove(&self, id: Uuid) -> Result<(), ConnectionError> {
        let connection = self.get(id).ok_or(ConnectionError::UnknownConnection(id))?;
        if !connection.status().is_resting() {
            return Err(ConnectionError::NotDisconnected(id));
        }
        self.detach(&connection);
        Ok(())
    }

    /// Disconnect if needed and remove once fully disconnected.
    pub fn disconnect_and_remove(&self, id: Uuid) -> Result<(), ConnectionError> {
        let connection = self.get(id).ok_or(ConnectionError::UnknownConnection(id))?;
        if connection.status().is_resting() {
            self.detach(&connection);
            return Ok(());
        }
        self.pending_removal.lock().insert(id);
        connection.disconnect();
        Ok(())
    }

    fn detach(&self, connection: &Arc<Connection>) {
        let removed = {
            let mut connections = self.connections.lock();
            let before = connections.len();
            connections.retain(|c| c.id() != connection.id());
            connections.len() != before
        };
        self.pending_removal.lock().remove(&connection.id());
        if removed {
            tracing::debug!(connection = %connection.id(), "Connection removed");
            self.listeners.notify(|l| l.connection_removed(connection));
            self.save_autoconnect_async();
        }
    }

    // ── Bulk control ──

    /// Connect every registered connection that is not already up.
    pub fn connect_all(&self) {
        for connection in self.connections() {
            if let Err(e) = connection.connect() {
                tracing::warn!(connection = %connection.id(), error = %e, "Connect skipped");
            }
        }
    }

    pub fn disconnect_all(&self) {
        for connection in self.connections() {
            connection.disconnect();
        }
    }

    /// Save the autoconnect list as it stands, stop persisting, then
    /// disconnect everything. Pair with [`wait_all_disconnected`](Self::wait_all_disconnected).
    pub fn shutdown(&self) -> Result<(), ConfigError> {
        let saved = {
            let _guard = self.save_lock.lock();
            let saved = self.store.save(&self.autoconnect_entries());
            self.persist.store(false, Ordering::Release);
            saved
        };
        self.disconnect_all();
        saved
    }

    /// Any connection not yet settled at Idle or Disconnected.
    pub fn has_active(&self) -> bool {
        self.connections
            .lock()
            .iter()
            .any(|c| !c.status().is_resting())
    }

    /// Resolve once no connection is active.
    pub async fn wait_all_disconnected(&self) {
        loop {
            let settled = self.settled.notified();
            if !self.has_active() {
                return;
            }
            settled.await;
        }
    }

    // ── Listeners ──

    pub fn subscribe(&self, listener: Arc<dyn RegistryListener>) -> ListenerId {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    // ── Autoconnect ──

    /// Connections that should come back after a restart: up or coming up,
    /// and not disconnected by the user.
    pub fn autoconnect_entries(&self) -> Vec<AutoconnectEntry> {
        self.connections()
            .iter()
            .filter(|c| {
                matches!(c.status(), ConnectionStatus::Connected | ConnectionStatus::Connecting)
                    && !c.user_disconnect_requested()
            })
            .map(|c| AutoconnectEntry {
                id: c.id(),
                channels: c.channels(),
            })
            .collect()
    }

    /// Persist the autoconnect list in the background.
    ///
    /// Requests made before a queued save reads the list fold into that
    /// save. The file I/O runs on the blocking pool.
    pub fn save_autoconnect_async(&self) {
        if !self.persist.load(Ordering::Acquire) || self.save_queued.swap(true, Ordering::AcqRel) {
            return;
        }
        let me = self.me.clone();
        self.deps.scheduler.spawn(Box::pin(async move {
            let Some(this) = me.upgrade() else { return };
            let saved = tokio::task::spawn_blocking(move || {
                this.save_queued.store(false, Ordering::Release);
                let _guard = this.save_lock.lock();
                if !this.persist.load(Ordering::Acquire) {
                    return Ok(());
                }
                this.store.save(&this.autoconnect_entries())
            })
            .await;
            match saved {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "Failed to save autoconnect list"),
                Err(e) => tracing::warn!(error = %e, "Autoconnect save task failed"),
            }
        }));
    }

    /// Write the current autoconnect list. Concurrent saves are serialized
    /// so the last one to finish wrote the newest list.
    pub fn save_autoconnect(&self) -> Result<(), ConfigError> {
        let _guard = self.save_lock.lock();
        self.store.save(&self.autoconnect_entries())
    }

    /// Register and connect the servers saved in the autoconnect list.
    ///
    /// Entries whose server is no longer configured are skipped. Returns the
    /// number of connections started.
    pub fn restore_autoconnect(&self, servers: &[ServerConfig]) -> Result<usize, ConfigError> {
        let entries = self.store.load()?;
        let mut started = 0;
        for entry in entries {
            let Some(config) = servers.iter().find(|s| s.id == entry.id) else {
                tracing::debug!(connection = %entry.id, "Autoconnect entry has no server config");
                continue;
            };
            let connection = match self.get(entry.id) {
                Some(existing) => existing,
                None => match self.add(config.clone(), entry.channels) {
                    Ok(connection) => connection,
                    Err(e) => {
                        tracing::warn!(error = %e, "Can't restore connection");
                        continue;
                    }
                },
            };
            match connection.connect() {
                Ok(()) => started += 1,
                Err(e) => tracing::warn!(connection = %connection.id(), error = %e, "Can't restore connection"),
            }
        }
        tracing::info!(started, "Restored autoconnect list");
        Ok(started)
    }
}

impl ConnectionObserver for ConnectionRegistry {
    fn info_changed(&self, connection: &Connection) {
        self.listeners.notify(|l| l.connection_info_changed(connection));
        self.save_autoconnect_async();
    }

    fn channels_changed(&self, connection: &Connection, channels: &[String]) {
        self.listeners.notify(|l| l.channel_list_changed(connection, channels));
        self.save_autoconnect_async();
    }

    fn fully_disconnected(&self, connection: &Connection) {
        self.listeners.notify(|l| l.connection_fully_disconnected(connection));
        let pending = self.pending_removal.lock().contains(&connection.id());
        if pending && let Some(connection) = self.get(connection.id()) {
            self.detach(&connection);
        }
        self.settled.notify_waiters();
    }
}
