//! CacheCraft Core
//!
//! Shared building blocks for every CacheCraft crate: the error taxonomy
//! used across the DHT and cache layers, and the cancellation primitives
//! (`Cancel`, `WatchDog`) that every long-running operation takes by
//! reference.

mod cancel;
mod error;

pub use cancel::{Cancel, WatchDog};
pub use error::{first_non_cancel, Error, Result};
