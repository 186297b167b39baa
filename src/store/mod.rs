//! Object store orchestration over a backend pool

mod distributed;
mod spool;
mod tasks;

pub use distributed::DistributedStore;
