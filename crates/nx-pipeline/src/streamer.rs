//! Chunked delivery of a finalized file.
//!
//! [`ChunkStreamer`] reads a file in fixed-size windows and hands each chunk
//! to a [`StreamTarget`]. Remote sinks expose how many bytes they still have
//! queued; the streamer holds back while that exceeds the high-water mark.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use nx_core::config::StreamingConfig;
use nx_core::FileDescriptor;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Control messages
// ---------------------------------------------------------------------------

/// Out-of-band messages sent to a remote peer as JSON text frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// The requested file has to be re-encoded before it can be sent.
    #[serde(rename_all = "camelCase")]
    NeedTranscoding {
        is_video_type_supported: bool,
        is_audio_type_supported: bool,
    },
    /// Encoder progress in percent.
    TranscodingProgress(u8),
    /// The file is ready; chunks follow once the peer acknowledges.
    SendFileInformation(Box<FileDescriptor>),
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// A message-oriented channel to a remote consumer, e.g. a data channel.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    /// Queue one binary frame.
    async fn send(&self, chunk: Bytes) -> io::Result<()>;

    /// Bytes queued but not yet transmitted.
    fn buffered_bytes(&self) -> usize;

    /// Whether the channel is open.
    fn is_ready(&self) -> bool {
        true
    }

    /// Serialize a control message and queue it as a single frame.
    async fn send_control(&self, message: &ControlMessage) -> io::Result<()> {
        let json = serde_json::to_vec(message).map_err(io::Error::other)?;
        self.send(Bytes::from(json)).await
    }
}

/// Where chunks go.
#[derive(Clone)]
pub enum StreamTarget {
    /// A peer behind a [`ChunkSink`]; subject to backpressure.
    Remote(Arc<dyn ChunkSink>),
    /// In-process playback. Chunks are delivered on the channel and the
    /// bounded channel capacity provides backpressure.
    Local(mpsc::Sender<Bytes>),
}

impl std::fmt::Debug for StreamTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote(sink) => f
                .debug_struct("Remote")
                .field("buffered_bytes", &sink.buffered_bytes())
                .finish(),
            Self::Local(_) => f.write_str("Local"),
        }
    }
}

/// Totals for a finished stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StreamSummary {
    pub chunks: u64,
    pub bytes: u64,
}

/// Wait until `sink` has fewer than `limit` bytes queued, re-checking every
/// `poll`. There is no upper bound on the wait; only `cancel` ends it early.
pub async fn wait_for_buffer(
    sink: &dyn ChunkSink,
    limit: usize,
    poll: Duration,
    cancel: &CancellationToken,
) -> nx_core::Result<()> {
    let mut logged = false;
    while sink.buffered_bytes() >= limit {
        if !logged {
            tracing::debug!(
                "sink buffer at {} bytes (limit {limit}); waiting",
                sink.buffered_bytes()
            );
            logged = true;
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(nx_core::Error::Cancelled),
            _ = tokio::time::sleep(poll) => {}
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// ChunkStreamer
// ---------------------------------------------------------------------------

/// Sequential, exactly-once chunk delivery.
#[derive(Debug, Clone)]
pub struct ChunkStreamer {
    chunk_size: usize,
    high_water_mark: usize,
    poll_interval: Duration,
}

impl ChunkStreamer {
    pub fn new(chunk_size: usize, high_water_mark: usize, poll_interval: Duration) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            high_water_mark,
            poll_interval,
        }
    }

    pub fn from_config(streaming: &StreamingConfig) -> Self {
        Self::new(
            streaming.effective_chunk_size(),
            streaming.high_water_mark,
            streaming.poll_interval(),
        )
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Stream `path` to `target`.
    ///
    /// `on_chunk(index, bytes_sent)` is called after each delivered chunk with
    /// the zero-based chunk index and the running byte total.
    ///
    /// # Errors
    ///
    /// - [`nx_core::Error::Cancelled`] if `cancel` fires. The chunk being
    ///   prepared at that point is not delivered.
    /// - [`nx_core::Error::StreamIo`] on read failures, send failures, a
    ///   closed local channel, or a remote sink that is not ready.
    pub async fn stream(
        &self,
        path: &Path,
        target: &StreamTarget,
        cancel: &CancellationToken,
        mut on_chunk: impl FnMut(u64, u64) + Send,
    ) -> nx_core::Result<StreamSummary> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| nx_core::Error::StreamIo(format!("{}: {e}", path.display())))?;

        tracing::info!("streaming {} ({target:?})", path.display());

        let mut buf = vec![0u8; self.chunk_size];
        let mut summary = StreamSummary::default();

        loop {
            if cancel.is_cancelled() {
                return Err(nx_core::Error::Cancelled);
            }

            let n = read_full(&mut file, &mut buf)
                .await
                .map_err(|e| nx_core::Error::StreamIo(format!("{}: {e}", path.display())))?;
            if n == 0 {
                break;
            }
            let chunk = Bytes::copy_from_slice(&buf[..n]);

            match target {
                StreamTarget::Remote(sink) => {
                    wait_for_buffer(sink.as_ref(), self.high_water_mark, self.poll_interval, cancel)
                        .await?;
                    if cancel.is_cancelled() {
                        return Err(nx_core::Error::Cancelled);
                    }
                    if !sink.is_ready() {
                        return Err(nx_core::Error::StreamIo("sink is not ready".into()));
                    }
                    sink.send(chunk)
                        .await
                        .map_err(|e| nx_core::Error::StreamIo(format!("send failed: {e}")))?;
                }
                StreamTarget::Local(tx) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(nx_core::Error::Cancelled),
                        sent = tx.send(chunk) => sent.map_err(|_| {
                            nx_core::Error::StreamIo("local receiver closed".into())
                        })?,
                    }
                }
            }

            on_chunk(summary.chunks, summary.bytes + n as u64);
            summary.chunks += 1;
            summary.bytes += n as u64;
        }

        tracing::info!(
            "streamed {}: {} chunk(s), {} bytes",
            path.display(),
            summary.chunks,
            summary.bytes
        );
        Ok(summary)
    }
}

/// Fill `buf` from `reader`, stopping early only at end of file.
async fn read_full(reader: &mut tokio::fs::File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
