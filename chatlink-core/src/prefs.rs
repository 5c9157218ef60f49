//! Policy values the core reads from the settings and platform layers.
//!
//! These are queried live rather than captured, since the user can flip
//! reconnect settings or change networks between two attempts.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::Settings;

/// Global client preferences consulted by every connection.
pub trait Preferences: Send + Sync {
    /// Master switch for automatic reconnect.
    fn reconnect_enabled(&self) -> bool;
    /// Only auto-reconnect while on Wi-Fi.
    fn reconnect_wifi_required(&self) -> bool;
    /// Reconnect when the link drops because the network changed. Off means
    /// a lost link stays down until the user reconnects.
    fn reconnect_on_connectivity_change(&self) -> bool;
    /// Message sent with QUIT on a graceful disconnect.
    fn quit_message(&self) -> String;
}

/// Kind of network the host is currently attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    Wifi,
    Ethernet,
    Cellular,
    #[default]
    Unknown,
    Offline,
}

/// Reports the active network type.
pub trait NetworkMonitor: Send + Sync {
    fn network_type(&self) -> NetworkType;

    fn is_wifi(&self) -> bool {
        self.network_type() == NetworkType::Wifi
    }
}

/// A network monitor that always reports the same type.
///
/// Desktop builds have no connectivity API to ask, so the CLI configures one
/// of these from its settings.
#[derive(Debug, Clone, Copy)]
pub struct FixedNetwork(pub NetworkType);

impl NetworkMonitor for FixedNetwork {
    fn network_type(&self) -> NetworkType {
        self.0
    }
}

/// [`Settings`] behind a lock so they can be edited while connections run.
#[derive(Debug, Default)]
pub struct SharedSettings {
    inner: RwLock<Settings>,
}

impl SharedSettings {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: RwLock::new(settings),
        }
    }

    pub fn get(&self) -> Settings {
        self.inner.read().clone()
    }

    /// Apply an edit in place.
    pub fn update(&self, f: impl FnOnce(&mut Settings)) {
        f(&mut *self.inner.write());
    }
}

impl Preferences for SharedSettings {
    fn reconnect_enabled(&self) -> bool {
        self.inner.read().reconnect_enabled
    }

    fn reconnect_wifi_required(&self) -> bool {
        self.inner.read().reconnect_wifi_required
    }

    fn reconnect_on_connectivity_change(&self) -> bool {
        self.inner.read().reconnect_on_connectivity_change
    }

    fn quit_message(&self) -> String {
        self.inner.read().quit_message.clone()
    }
}
