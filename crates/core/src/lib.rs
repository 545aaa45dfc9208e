#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Shared protocol and base types for the tidepool worker runtime
//! (wire frames, error kinds, id generation, environment detection).

pub mod env;
pub mod error;
pub mod frame;
pub mod ids;
pub mod log;

pub use error::PoolError;
pub use frame::{Frame, StreamEnvelope, StreamKind};
