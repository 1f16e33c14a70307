//! nx-core: shared types, IDs, errors, configuration, and event system.
//!
//! This crate is the foundational dependency for the other nx-* crates,
//! providing type-safe identifiers, a unified error type, the media-domain
//! model (requests, probe results, transcode plans, file descriptors),
//! application configuration, and a broadcast event bus.

pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod media;

// Re-export the most commonly used items at the crate root.
pub use error::{Error, Result, Severity};
pub use ids::*;
pub use media::*;
