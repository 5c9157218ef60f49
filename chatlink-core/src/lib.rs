//! Connection lifecycle core for chatlink.
//!
//! Owns one [`Connection`] per configured server and drives its state machine:
//! connect, graceful or aborted disconnect, unexpected drops, and automatic
//! reconnect with bounded backoff. Joined channels are mirrored from what the
//! server reports and requested again after a reconnect.
//!
//! The wire protocol, message storage and settings storage are collaborators
//! behind the traits in [`session`] and [`prefs`]. `chatlink-irc` provides the
//! IRC implementations.
//!
//! ## Threading
//!
//! Every [`Connection`] guards its state with a single lock that is never held
//! across I/O. Network operations run on the injected [`Scheduler`] and their
//! continuations re-take the lock to apply results, discarding any that belong
//! to a superseded attempt.

pub mod autoconnect;
pub mod channels;
pub mod config;
pub mod connection;
pub mod error;
pub mod history;
pub mod listeners;
pub mod policy;
pub mod prefs;
pub mod registry;
pub mod scheduler;
pub mod session;

pub use channels::{ChannelListListener, ChannelMembership};
pub use config::{Config, ServerConfig, Settings};
pub use connection::{Connection, ConnectionDeps, ConnectionSnapshot, ConnectionStatus, InfoListener};
pub use error::{CertificateRejected, ConfigError, ConnectionError};
pub use policy::{BackoffRule, BackoffSchedule, PreferenceGatedPolicy, ReconnectPolicy};
pub use prefs::{NetworkMonitor, NetworkType, Preferences};
pub use registry::{ConnectionRegistry, RegistryListener};
pub use scheduler::{Scheduler, TokioScheduler};
pub use session::{MessageSink, MessageSinkProvider, Session, SessionEvent, SessionFactory, SessionSetup};
