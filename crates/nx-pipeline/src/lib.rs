//! # nx-pipeline
//!
//! Turns a selected source file into a streamable, fragmented mp4 and
//! delivers it in chunks.
//!
//! This crate provides:
//!
//! - **[`CapabilityOracle`]** -- answers whether the playback environment
//!   decodes a MIME/codec string.
//! - **[`decide`]** -- maps a probe result to a [`TranscodePlan`](nx_core::TranscodePlan).
//! - **[`ChunkStreamer`]** -- sequential chunk delivery with buffer
//!   backpressure over a [`ChunkSink`].
//! - **[`Orchestrator`]** -- per-request state machine wiring probe, decision,
//!   transcode, fragmentation and streaming together.

pub mod capability;
pub mod decision;
pub mod orchestrator;
pub mod streamer;

pub use capability::{supports_codec, CapabilityOracle, StaticCapabilities};
pub use decision::{decide, Decision};
pub use orchestrator::{Delivery, Orchestrator};
pub use streamer::{ChunkSink, ChunkStreamer, ControlMessage, StreamSummary, StreamTarget};
