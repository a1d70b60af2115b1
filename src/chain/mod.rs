//! Polygon event-log ingestion: JSON-RPC access, OrderFilled decoding and
//! the adaptive source watcher.

pub mod logs;
pub mod rpc;
pub mod watcher;

pub use rpc::{ChainRpc, HttpRpc, RawLog};
pub use watcher::{SourceWatcher, WatcherTick};
