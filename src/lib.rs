//! cachewire: client connection and command-dispatch layer of an in-memory
//! cache server.
//!
//! - Length-prefixed request framing with optional pipelining and
//!   acknowledgment ids
//! - Per-connection serialized, priority-ordered send path with response
//!   fragmentation
//! - Acknowledgment ledger so retried mutating commands are not re-applied
//! - Bad-client and idle monitoring, event subscriptions with bulk delivery
//! - A bundled in-process cache engine behind the `CacheEngine` trait

pub mod buffer;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod ledger;
pub mod processor;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod storage;

pub use config::Config;
pub use engine::{CacheEngine, LocalCache};
pub use server::ConnectionManager;
