//! cloudraid - Erasure-coded object storage over unreliable backends
//!
//! Objects are encoded into `k` data and `m` coding fragments, one fragment
//! per backend, and can be read back from any `k` of them. Placement
//! metadata is kept in sled so every object has exactly one current
//! placement epoch.

pub mod backend;
pub mod config;
pub mod erasure;
pub mod error;
pub mod logging;
pub mod metadata;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
pub use store::DistributedStore;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::backend::{Backend, BackendPool, BackendRegistry};
    pub use crate::config::Config;
    pub use crate::erasure::{CodingMethod, CodingScheme, StreamingCodec};
    pub use crate::error::{Error, Result};
    pub use crate::metadata::{SledUploadRepository, UploadRecord, UploadRepository};
    pub use crate::store::DistributedStore;
}
