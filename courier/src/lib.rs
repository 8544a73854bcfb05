pub mod controller;

pub use controller::{Courier, Resolver, SHUTDOWN_BROADCAST, Services};
