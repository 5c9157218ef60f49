//! IRC protocol adapter for chatlink.
//!
//! Provides [`IrcSessionFactory`], which plugs IRC sessions into
//! `chatlink_core::Connection`, and [`SqliteSinkProvider`] for per-connection
//! message logs.

mod link;
pub mod log;
pub mod message;
pub mod session;
pub mod transport;

pub use log::{SqliteMessageSink, SqliteSinkProvider};
pub use message::Message;
pub use session::{IrcSession, IrcSessionFactory, SESSION_KIND};
