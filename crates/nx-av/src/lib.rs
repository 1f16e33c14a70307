//! # nx-av
//!
//! External tool management, probing, and media processing stages for the
//! netsix delivery pipeline.
//!
//! This crate provides:
//!
//! - **Tool discovery** ([`ToolRegistry`]) -- find and cache paths to ffmpeg,
//!   mp4info and mp4fragment.
//! - **Command execution** ([`ToolCommand`]) -- async builder with timeout
//!   support for running external processes to completion, or spawning them
//!   as a killable [`ToolProcess`] with streamed stderr.
//! - **Probing** ([`MediaProbe`]) -- track codecs and duration via mp4info.
//! - **Normalisation** ([`normalize_container`]) -- stream-copy a foreign
//!   container into mp4.
//! - **Fragmentation** ([`fragment`]) -- idempotent mp4fragment invocation.
//! - **Transcoding** ([`TranscodeJob`]) -- supervised ffmpeg encode with
//!   normalised progress and cancellation.

pub mod command;
pub mod fragment;
pub mod normalize;
pub mod probe;
pub mod progress;
pub mod tools;
pub mod transcode;

#[cfg(all(test, unix))]
mod testing;

// ---- Re-exports for convenience ----

pub use command::{ToolCommand, ToolOutput, ToolProcess};
pub use fragment::{fragment, FragmentOutcome};
pub use normalize::normalize_container;
pub use probe::MediaProbe;
pub use progress::ProgressTracker;
pub use tools::{ToolConfig, ToolInfo, ToolRegistry};
pub use transcode::TranscodeJob;
