//! Erasure coding engine
//!
//! [`CodingScheme`] performs the Galois-field algebra on equal-sized
//! fragments; [`StreamingCodec`] adapts it to byte streams.

pub mod bitmatrix;
pub mod codec;
pub mod galois;
pub mod schedule;
pub mod scheme;

pub use codec::{EncodedFragments, StreamingCodec, DEFAULT_WINDOW_SIZE};
pub use scheme::{CodingMethod, CodingScheme};
