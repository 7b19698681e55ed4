//! Admission engines implementing [`crate::ratelimit::Backend`].

pub mod ledger;
pub mod memory;

pub use self::ledger::{LedgerBackend, LedgerBackendConfig};
pub use self::memory::{ConcurrencySnapshot, MemoryBackend, MemorySnapshot, RollingSnapshot};
