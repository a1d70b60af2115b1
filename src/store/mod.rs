//! Durable stores over the shared SQLite handle.
//!
//! Each store is a thin repository owning its table family; rows cross the
//! boundary as the typed structs in `models`.

pub mod orders;
pub mod pairs;
pub mod runtime;
pub mod signals;
pub mod vault;

pub use orders::OrderStore;
pub use pairs::PairStore;
pub use runtime::RuntimeStore;
pub use signals::SignalStore;
pub use vault::VaultStore;
