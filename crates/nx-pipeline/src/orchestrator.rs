//! Request orchestration.
//!
//! One request is active at a time. [`Orchestrator::submit`] aborts the
//! previous request, then runs the preparation flow on a background task:
//!
//! ```text
//! Idle -> Probing -> Deciding -> [Transcoding ->] Remuxing -> Ready
//!      -> Streaming -> Done
//! ```
//!
//! Sources that do not need normalisation skip probing and the decision and
//! go straight to `Remuxing` (fragmentation). Any failure or cancellation
//! removes the request's intermediates, moves the state to `Aborted` and
//! emits exactly one terminal event. A failed stream returns to `Idle`.

use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use nx_av::{fragment, normalize_container, FragmentOutcome, MediaProbe, ToolRegistry, TranscodeJob};
use nx_core::config::Config;
use nx_core::events::{EventBus, EventPayload};
use nx_core::{
    total_chunks, CachePaths, Error, FileDescriptor, MediaRequest, Origin, PipelineState,
    RequestId, Result, Severity,
};
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capability::CapabilityOracle;
use crate::decision::{decide, Decision};
use crate::streamer::{wait_for_buffer, ChunkStreamer, ControlMessage, StreamTarget};

/// Container advertised in file descriptors.
const DESCRIPTOR_CONTAINER: &str = "video/mp4";

/// How a request's chunks reach the consumer.
pub type Delivery = StreamTarget;

// ---------------------------------------------------------------------------
// RequestContext
// ---------------------------------------------------------------------------

/// Everything that belongs to one request. Dropped with the request.
struct RequestContext {
    id: RequestId,
    request: MediaRequest,
    paths: CachePaths,
    delivery: Delivery,
    cancel: CancellationToken,
    state: RwLock<PipelineState>,
    progress: AtomicU8,
    descriptor: RwLock<Option<FileDescriptor>>,
    events: Arc<EventBus>,
}

impl RequestContext {
    fn emit(&self, payload: EventPayload) {
        self.events.broadcast(self.id, payload);
    }

    fn state(&self) -> PipelineState {
        *self.state.read()
    }

    fn set_state(&self, state: PipelineState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            tracing::info!(request = %self.id, "{previous} -> {state}");
            self.emit(EventPayload::StateChanged { state });
        }
    }

    fn notice(&self, category: Severity, message: String) {
        self.emit(EventPayload::Notice { category, message });
    }

    fn remote_sink(&self) -> Option<&Arc<dyn crate::streamer::ChunkSink>> {
        match &self.delivery {
            StreamTarget::Remote(sink) => Some(sink),
            StreamTarget::Local(_) => None,
        }
    }

    /// Settle a failed or cancelled request. Emits one terminal event.
    fn abort_with(&self, err: &Error) {
        self.paths.remove_intermediates();
        self.set_state(PipelineState::Aborted);
        if err.is_cancelled() {
            tracing::info!(request = %self.id, "cancelled");
            self.emit(EventPayload::Cancelled);
        } else {
            tracing::error!(request = %self.id, "failed: {err}");
            self.emit(EventPayload::Failed {
                category: err.severity(),
                reason: err.to_string(),
            });
        }
    }

    /// Run `fut` unless the request is cancelled first. Dropping a tool
    /// future kills its child process.
    async fn cancellable<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = fut => result,
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

struct Active {
    ctx: Arc<RequestContext>,
    task: Option<JoinHandle<()>>,
}

impl Active {
    /// Whether cancelling can still change the outcome. A fresh request is
    /// `Idle` until its task reaches the first stage, while a request whose
    /// stream failed is `Idle` with nothing left running.
    fn is_cancellable(&self) -> bool {
        match self.ctx.state() {
            PipelineState::Done | PipelineState::Aborted => false,
            PipelineState::Idle => self.task.as_ref().is_some_and(|task| !task.is_finished()),
            _ => true,
        }
    }

    /// Cancel the request and wait for its task to finish cleaning up.
    async fn abort(&mut self) {
        self.ctx.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!(request = %self.ctx.id, "request task panicked: {e}");
            }
        }
        // A request parked in `Ready` has no task to observe the token.
        if !self.ctx.state().is_settled() {
            self.ctx.abort_with(&Error::Cancelled);
        }
    }
}

struct Shared {
    config: Config,
    tools: ToolRegistry,
    oracle: Arc<dyn CapabilityOracle>,
    events: Arc<EventBus>,
}

/// Drives media requests from selection to the last chunk.
pub struct Orchestrator {
    shared: Arc<Shared>,
    /// Serialises submit / acknowledge / cancel.
    active: tokio::sync::Mutex<Option<Active>>,
    /// Lock-free view of the active request for synchronous queries.
    current: RwLock<Option<Arc<RequestContext>>>,
}

impl Orchestrator {
    pub fn new(config: Config, tools: ToolRegistry, oracle: Arc<dyn CapabilityOracle>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                tools,
                oracle,
                events: Arc::new(EventBus::default()),
            }),
            active: tokio::sync::Mutex::new(None),
            current: RwLock::new(None),
        }
    }

    /// Subscribe to pipeline events.
    pub fn subscribe(&self) -> broadcast::Receiver<nx_core::events::Event> {
        self.shared.events.subscribe()
    }

    /// The event bus, for late subscribers that want recent history.
    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    /// Id of the active request, if any.
    pub fn active_request(&self) -> Option<RequestId> {
        self.current.read().as_ref().map(|ctx| ctx.id)
    }

    /// State of the active request; `Idle` when there is none.
    pub fn state(&self) -> PipelineState {
        self.current
            .read()
            .as_ref()
            .map_or(PipelineState::Idle, |ctx| ctx.state())
    }

    /// Last transcode progress percentage of the active request.
    pub fn progress(&self) -> u8 {
        self.current
            .read()
            .as_ref()
            .map_or(0, |ctx| ctx.progress.load(Ordering::Acquire))
    }

    /// Descriptor of the active request once it is ready.
    pub fn descriptor(&self) -> Option<FileDescriptor> {
        self.current
            .read()
            .as_ref()
            .and_then(|ctx| ctx.descriptor.read().clone())
    }

    /// Start preparing `request`, aborting whatever was active.
    ///
    /// Returns once the preparation task has been spawned; progress is
    /// reported through events.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the delivery does not match the
    /// request origin.
    pub async fn submit(&self, request: MediaRequest, delivery: Delivery) -> Result<RequestId> {
        match (request.origin, &delivery) {
            (Origin::Remote, StreamTarget::Local(_)) | (Origin::Local, StreamTarget::Remote(_)) => {
                return Err(Error::Validation(format!(
                    "{} request cannot use {delivery:?} delivery",
                    request.origin
                )));
            }
            _ => {}
        }

        let mut active = self.active.lock().await;
        if let Some(previous) = active.as_mut() {
            tracing::info!(request = %previous.ctx.id, "superseded by new request");
            previous.abort().await;
        }

        let paths = request.paths(&self.shared.config.cache);
        let ctx = Arc::new(RequestContext {
            id: request.id,
            paths,
            delivery,
            cancel: CancellationToken::new(),
            state: RwLock::new(PipelineState::Idle),
            progress: AtomicU8::new(0),
            descriptor: RwLock::new(None),
            events: self.shared.events.clone(),
            request,
        });

        tracing::info!(
            request = %ctx.id,
            origin = %ctx.request.origin,
            "submitted {}",
            ctx.request.source_path().display()
        );
        ctx.emit(EventPayload::RequestSubmitted {
            filename: ctx.request.filename.clone(),
        });

        let task = tokio::spawn(run_prepare(self.shared.clone(), ctx.clone()));
        *self.current.write() = Some(ctx.clone());
        let id = ctx.id;
        *active = Some(Active {
            ctx,
            task: Some(task),
        });
        Ok(id)
    }

    /// The consumer has the descriptor and wants the chunks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] unless the active request is `Ready`.
    pub async fn acknowledge_ready(&self) -> Result<()> {
        let mut guard = self.active.lock().await;
        let active = guard
            .as_mut()
            .ok_or_else(|| Error::Validation("no active request".into()))?;

        let state = active.ctx.state();
        if state != PipelineState::Ready {
            return Err(Error::Validation(format!(
                "request {} is not ready (state {state})",
                active.ctx.id
            )));
        }
        let descriptor = active
            .ctx
            .descriptor
            .read()
            .clone()
            .ok_or_else(|| Error::Internal("ready request without descriptor".into()))?;

        // The preparation task is already past `Ready`; reap it.
        if let Some(task) = active.task.take() {
            let _ = task.await;
        }

        active.ctx.set_state(PipelineState::Streaming);
        active.task = Some(tokio::spawn(run_stream(
            self.shared.clone(),
            active.ctx.clone(),
            descriptor,
        )));
        Ok(())
    }

    /// Cancel the active request and wait for its cleanup. A finished,
    /// aborted or failed-and-idle request is left alone.
    pub async fn cancel(&self) {
        let mut guard = self.active.lock().await;
        if let Some(active) = guard.as_mut() {
            if !active.is_cancellable() {
                return;
            }
            tracing::info!(request = %active.ctx.id, "cancel requested");
            active.abort().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Preparation
// ---------------------------------------------------------------------------

async fn run_prepare(shared: Arc<Shared>, ctx: Arc<RequestContext>) {
    if let Err(e) = prepare(&shared, &ctx).await {
        ctx.abort_with(&e);
    }
}

async fn prepare(shared: &Shared, ctx: &Arc<RequestContext>) -> Result<()> {
    if ctx.cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    let source = ctx.request.source_path();
    if !tokio::fs::try_exists(&source).await? {
        return Err(Error::not_found("source file", source.display()));
    }
    tokio::fs::create_dir_all(&ctx.paths.intermediate_dir).await?;

    let reuse = tokio::fs::try_exists(&ctx.paths.destination).await?;
    let needs_normalize = ctx.request.extension().is_some_and(|ext| {
        shared
            .config
            .pipeline
            .normalize_extensions
            .iter()
            .any(|n| n.eq_ignore_ascii_case(&ext))
    });

    let fragment_source = if needs_normalize && !reuse {
        ctx.set_state(PipelineState::Probing);
        ctx.cancellable(normalize_container(&shared.tools, &source, &ctx.paths.normalized))
            .await?;

        let prober = MediaProbe::from_registry(&shared.tools)
            .map_err(|e| Error::Probe(e.to_string()))?;
        let info = ctx.cancellable(prober.probe(&ctx.paths.normalized)).await?;

        ctx.set_state(PipelineState::Deciding);
        let decision = decide(&info, shared.oracle.as_ref(), &shared.config.transcode)?;

        if decision.plan.needs_transcode() {
            transcode(shared, ctx, &decision, info.duration_ms).await?;
            remove_file(&ctx.paths.normalized).await;
            ctx.paths.transcoded.clone()
        } else {
            ctx.paths.normalized.clone()
        }
    } else {
        if reuse {
            tracing::info!(request = %ctx.id, "destination exists; skipping preparation");
        }
        source
    };

    ctx.set_state(PipelineState::Remuxing);
    let outcome = ctx
        .cancellable(fragment(&shared.tools, &fragment_source, &ctx.paths.destination))
        .await;
    if let Err(ref e) = outcome {
        // A killed mp4fragment may have left a partial destination behind.
        if e.is_cancelled() {
            remove_file(&ctx.paths.destination).await;
        }
    }
    if outcome? == FragmentOutcome::Fragmented {
        tracing::info!(request = %ctx.id, "fragmented {}", ctx.paths.destination.display());
    }
    ctx.paths.remove_intermediates();

    finalize(shared, ctx).await
}

async fn transcode(
    shared: &Shared,
    ctx: &Arc<RequestContext>,
    decision: &Decision,
    duration_ms: u64,
) -> Result<()> {
    let filename = &ctx.request.filename;

    ctx.emit(EventPayload::NeedsTranscoding {
        video_ok: decision.video_supported,
        audio_ok: decision.audio_supported,
    });
    ctx.notice(Severity::Warning, "Transcoding needed".into());
    if let Some(sink) = ctx.remote_sink() {
        let announce = [
            ControlMessage::NeedTranscoding {
                is_video_type_supported: decision.video_supported,
                is_audio_type_supported: decision.audio_supported,
            },
            // The peer shows its progress bar from the start of the encode.
            ControlMessage::TranscodingProgress(0),
        ];
        for message in &announce {
            sink.send_control(message)
                .await
                .map_err(|e| Error::StreamIo(format!("control message failed: {e}")))?;
        }
    }

    ctx.set_state(PipelineState::Transcoding);
    ctx.notice(Severity::Info, format!("Begin to transcode {filename}"));

    let (tx, rx) = mpsc::unbounded_channel();
    let job = TranscodeJob::start(
        &shared.tools,
        &ctx.paths.normalized,
        &ctx.paths.transcoded,
        &decision.plan,
        duration_ms,
        move |pct| {
            let _ = tx.send(pct);
        },
    )?;
    let relay = tokio::spawn(relay_progress(ctx.clone(), rx));

    let job_cancel = job.cancellation_token();
    let wait = job.wait();
    tokio::pin!(wait);
    let result = tokio::select! {
        result = &mut wait => result,
        _ = ctx.cancel.cancelled() => {
            job_cancel.cancel();
            wait.await
        }
    };

    // The relay ends once the job drops its progress sender.
    if let Err(e) = relay.await {
        tracing::warn!(request = %ctx.id, "progress relay failed: {e}");
    }

    result?;
    ctx.notice(Severity::Info, format!("Done transcoding {filename}"));
    Ok(())
}

async fn relay_progress(ctx: Arc<RequestContext>, mut rx: mpsc::UnboundedReceiver<u8>) {
    while let Some(percent) = rx.recv().await {
        ctx.progress.store(percent, Ordering::Release);
        ctx.emit(EventPayload::ProgressUpdated { percent });
        if let Some(sink) = ctx.remote_sink() {
            if let Err(e) = sink
                .send_control(&ControlMessage::TranscodingProgress(percent))
                .await
            {
                tracing::warn!(request = %ctx.id, "progress relay to peer failed: {e}");
            }
        }
    }
}

async fn finalize(shared: &Shared, ctx: &Arc<RequestContext>) -> Result<()> {
    let destination = &ctx.paths.destination;

    let prober = MediaProbe::from_registry(&shared.tools).map_err(|e| Error::Probe(e.to_string()))?;
    let information = ctx.cancellable(prober.probe(destination)).await?;
    let size = tokio::fs::metadata(destination).await?.len();
    let chunk_size = shared.config.streaming.effective_chunk_size() as u64;

    let descriptor = FileDescriptor {
        request_id: ctx.id,
        origin: ctx.request.origin,
        path: ctx.paths.cache_dir.clone(),
        filename: ctx.request.destination_filename(),
        source_filename: ctx.request.filename.clone(),
        size,
        chunk_size,
        total_chunks: total_chunks(size, chunk_size),
        mime_type: information.mime_type(DESCRIPTOR_CONTAINER),
        information,
    };

    if let Some(sink) = ctx.remote_sink() {
        // The descriptor must not queue behind an earlier transfer.
        wait_for_buffer(
            sink.as_ref(),
            1,
            shared.config.streaming.poll_interval(),
            &ctx.cancel,
        )
        .await?;
        sink.send_control(&ControlMessage::SendFileInformation(Box::new(descriptor.clone())))
            .await
            .map_err(|e| Error::StreamIo(format!("control message failed: {e}")))?;
    }

    if ctx.cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    tracing::info!(
        request = %ctx.id,
        "ready: {} ({} bytes, {} chunks)",
        descriptor.full_path().display(),
        descriptor.size,
        descriptor.total_chunks
    );
    *ctx.descriptor.write() = Some(descriptor.clone());
    ctx.set_state(PipelineState::Ready);
    ctx.emit(EventPayload::FileReady {
        descriptor: Box::new(descriptor),
    });
    Ok(())
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

async fn run_stream(shared: Arc<Shared>, ctx: Arc<RequestContext>, descriptor: FileDescriptor) {
    let streamer = ChunkStreamer::from_config(&shared.config.streaming);
    let events = ctx.clone();
    let result = streamer
        .stream(&descriptor.full_path(), &ctx.delivery, &ctx.cancel, |index, bytes_sent| {
            events.emit(EventPayload::ChunkSent { index, bytes_sent });
        })
        .await;

    match result {
        Ok(summary) => {
            ctx.set_state(PipelineState::Done);
            ctx.emit(EventPayload::StreamCompleted {
                chunks: summary.chunks,
                bytes: summary.bytes,
            });
        }
        Err(e) if e.is_cancelled() => ctx.abort_with(&e),
        Err(e) => {
            tracing::error!(request = %ctx.id, "stream failed: {e}");
            ctx.emit(EventPayload::Failed {
                category: e.severity(),
                reason: e.to_string(),
            });
            ctx.set_state(PipelineState::Idle);
        }
    }
}

async fn remove_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!("Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove {}: {e}", path.display()),
    }
}
