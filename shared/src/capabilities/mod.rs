//! Host-provided capabilities the core depends on: device storage,
//! connectivity and time.

pub mod clock;
pub mod kv;
pub mod network;

#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub mod sqlite;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::kv::{KeyNamespace, KvError, KvKey, KvStore, MemoryKv, StorageErrorCode};
pub use self::network::{ManualNetwork, NetworkStateSource};

#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use self::sqlite::SqliteKv;
