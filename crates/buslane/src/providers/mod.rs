//! Transport and store providers.
//!
//! Providers are resolved through an explicit registry populated at startup;
//! nothing is discovered by reflection or name scanning.

pub mod memory;
pub mod registry;
pub mod sqlite;

pub use memory::{MemoryMessageStore, MemoryTransport};
pub use registry::{ProviderRegistry, StoreFactory};
pub use sqlite::SqliteMessageStore;
