//! copybot-backend library.
//!
//! Polymarket copy-trading core: chain watcher -> signal store -> pairing +
//! sizing -> mirror orders -> executor -> reconciler, with a process-wide
//! risk guard and a Telegram alert ledger. The `copybot` binary wires these
//! together; tests drive them directly.

pub mod chain;
pub mod config;
pub mod db;
pub mod executor;
pub mod gamma;
pub mod lock;
pub mod models;
pub mod notifier;
pub mod risk;
pub mod store;
pub mod worker;

pub use config::Config;
pub use db::Db;
