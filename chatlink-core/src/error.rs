//! Error types surfaced by the connection core.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

/// Errors returned synchronously by [`Connection`](crate::Connection) and
/// [`ConnectionRegistry`](crate::ConnectionRegistry) calls.
///
/// Network failures never show up here: they are absorbed by the state
/// machine and only observable through status changes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// `connect()` was called while a disconnect is still tearing the session
    /// down. This is a caller bug, not a network condition.
    #[error("connection {0} is disconnecting; connect must wait for it to finish")]
    DisconnectInProgress(Uuid),
    /// A connection must be fully disconnected before it is removed.
    #[error("connection {0} is still active")]
    NotDisconnected(Uuid),
    /// No connection with this id is registered.
    #[error("unknown connection {0}")]
    UnknownConnection(Uuid),
    /// A connection with this id is already registered.
    #[error("connection {0} already exists")]
    AlreadyRegistered(Uuid),
}

/// The user declined to trust the server certificate.
///
/// Session implementations put this anywhere in their connect error chain;
/// the core treats it as a terminal failure and does not auto-reconnect.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("server certificate was rejected by the user")]
pub struct CertificateRejected;

/// Returns true if `err` or any error in its source chain is a
/// [`CertificateRejected`].
pub fn is_certificate_rejection(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<CertificateRejected>().is_some())
}

/// Loading or saving on-disk configuration failed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("can't read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("can't write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("bad config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("can't serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}
