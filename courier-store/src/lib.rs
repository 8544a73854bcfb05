//! The delivery log: one row per recipient attempt, created `pending` before
//! any network activity and moved exactly once to `sent` or `failed`.

pub mod backends;
pub mod config;
pub mod error;
pub mod store;
pub mod types;

pub use backends::{FileDeliveryLog, MemoryDeliveryLog};
pub use config::{MemoryConfig, StoreConfig};
pub use error::{Result, SerializationError, StoreError};
pub use store::DeliveryLogStore;
pub use types::{
    DeliveryLogEntry, DeliveryLogId, DeliveryStatus, NewDeliveryLogEntry, Transition,
};
