//! Placement metadata
//!
//! Records which backend holds each fragment of each upload attempt, and
//! which attempt is the object's current placement epoch.

mod model;
mod store;

pub use model::{FragmentKind, SliceMetadata, UploadRecord};
pub use store::{SledUploadRepository, UploadRepository};
