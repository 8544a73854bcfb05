use std::sync::Arc;

use serde::Deserialize;

use crate::{
    backends::{FileDeliveryLog, MemoryDeliveryLog},
    store::DeliveryLogStore,
};

/// Which delivery log backend to run.
///
/// File-backed log:
/// ```ron
/// Courier (
///     store: File(
///         path: "/var/lib/courier/deliveries",
///     ),
/// )
/// ```
///
/// Memory-backed log with a capacity limit:
/// ```ron
/// Courier (
///     store: Memory(
///         capacity: 10000,
///     ),
/// )
/// ```
#[derive(Debug, Clone, Deserialize)]
pub enum StoreConfig {
    File(FileDeliveryLog),
    Memory(MemoryConfig),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryConfig {
    /// Maximum number of entries to keep (omit for unlimited)
    #[serde(default)]
    pub capacity: Option<usize>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Memory(MemoryConfig::default())
    }
}

impl StoreConfig {
    #[must_use]
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            Self::File(store) => Some(store.path()),
            Self::Memory(_) => None,
        }
    }

    /// Initialise the configured backend and hand it out as a trait object.
    ///
    /// # Errors
    /// Returns an error if the file store directory cannot be prepared.
    pub fn into_store(self) -> crate::Result<Arc<dyn DeliveryLogStore>> {
        match self {
            Self::File(store) => {
                store.init()?;
                Ok(Arc::new(store))
            }
            Self::Memory(config) => Ok(config.capacity.map_or_else(
                || Arc::new(MemoryDeliveryLog::new()) as Arc<dyn DeliveryLogStore>,
                |capacity| Arc::new(MemoryDeliveryLog::with_capacity(capacity)),
            )),
        }
    }
}
