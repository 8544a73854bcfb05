//! Delivery log backends:
//! - `memory`: in-process map, for tests and throwaway deployments
//! - `file`: one bincode file per entry, for production use

pub mod file;
pub mod memory;

pub use file::FileDeliveryLog;
pub use memory::MemoryDeliveryLog;
