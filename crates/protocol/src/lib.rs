//! Wire types for the droidplane command relay.
//!
//! This crate contains the serde-serializable shapes exchanged between
//! relay clients, the relay itself, and the device agent running inside
//! every session workload. Types here are pure data: no I/O, no state.
//!
//! Higher-level behavior (correlation, pooling, session resolution) is built
//! on top of these types in `droidplane-runtime` and `droidplane-core`.

pub mod action;
pub mod envelope;
pub mod error_code;
pub mod packages;

pub use action::*;
pub use envelope::*;
pub use error_code::*;
pub use packages::*;
