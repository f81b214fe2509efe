// Streaming session over a long-lived backend
//
// A session owns one typed `RenderEvent` stream. Per session, emission
// order is preserved and `PromptComplete` resolves at most one in-flight
// prompt. A reader that stops consuming never blocks the backend when the
// `DropWithError` policy is selected; `Backpressure` slows the producer
// instead.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex, Notify, RwLock};

use cadre_core::{CadreError, Result};
use cadre_types::{RenderEvent, StopReason};

use crate::process::{ProcessPool, ProcessSink, ProcessSpec};
use crate::wire::{self, WireCommand};

const CANCEL_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    /// A prompt is in flight.
    Working,
    Closed,
    Error,
}

/// What to do when the event consumer falls behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Slow the producer until the consumer catches up.
    Backpressure,
    /// Drop events and surface an `Error` event noting the gap.
    DropWithError,
}

#[derive(Clone)]
pub struct SessionConfig {
    pub process: ProcessSpec,
    pub overflow: OverflowPolicy,
    pub channel_capacity: usize,
    /// Cap on accumulated prompt output. Exceeding it truncates the turn
    /// text and flags the outcome.
    pub max_output_bytes: Option<usize>,
    pub grace_period: Duration,
}

impl SessionConfig {
    pub fn new(process: ProcessSpec) -> Self {
        Self {
            process,
            overflow: OverflowPolicy::Backpressure,
            channel_capacity: 256,
            max_output_bytes: None,
            grace_period: Duration::from_secs(5),
        }
    }
}

/// Result of one completed prompt turn.
#[derive(Debug, Clone)]
pub struct PromptOutcome {
    pub text: String,
    pub stop_reason: StopReason,
    pub truncated: bool,
}

/// Per-chunk callback registered for a turn.
pub type ChunkCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Writing half of a session transport. Production code uses the process
/// pool's stdin; tests attach channel-backed fakes.
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn send_line(&self, line: &str) -> Result<()>;
}

#[async_trait]
impl CommandSink for ProcessSink {
    async fn send_line(&self, line: &str) -> Result<()> {
        ProcessSink::send_line(self, line).await
    }
}

struct PendingTurn {
    id: String,
    buffer: String,
    truncated: bool,
    on_chunk: Option<ChunkCallback>,
    done_tx: oneshot::Sender<Result<PromptOutcome>>,
}

struct SessionInner {
    key: String,
    pool: Arc<ProcessPool>,
    config: SessionConfig,
    state: RwLock<SessionState>,
    writer: Mutex<Option<Arc<dyn CommandSink>>>,
    pending: Mutex<Option<PendingTurn>>,
    turn_done: Notify,
    events_tx: mpsc::Sender<RenderEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<RenderEvent>>>,
    consumer_attached: AtomicBool,
    dropped_events: AtomicU64,
    last_error: Mutex<Option<String>>,
}

/// One long-lived connection to a backend, multiplexed into a typed event
/// stream.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(key: impl Into<String>, pool: Arc<ProcessPool>, config: SessionConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.channel_capacity.max(1));
        Self {
            inner: Arc::new(SessionInner {
                key: key.into(),
                pool,
                config,
                state: RwLock::new(SessionState::Disconnected),
                writer: Mutex::new(None),
                pending: Mutex::new(None),
                turn_done: Notify::new(),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                consumer_attached: AtomicBool::new(false),
                dropped_events: AtomicU64::new(0),
                last_error: Mutex::new(None),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub async fn state(&self) -> SessionState {
        *self.inner.state.read().await
    }

    pub async fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().await.clone()
    }

    /// Take the session's event stream. Events are delivered only after the
    /// first call, so observers should attach before connecting.
    pub async fn events(&self) -> Option<mpsc::Receiver<RenderEvent>> {
        let rx = self.inner.events_rx.lock().await.take();
        if rx.is_some() {
            self.inner.consumer_attached.store(true, Ordering::SeqCst);
        }
        rx
    }

    /// Spawn (or reuse) the backend process and start the reader.
    pub async fn connect(&self) -> Result<()> {
        {
            let state = *self.inner.state.read().await;
            if matches!(state, SessionState::Connected | SessionState::Working) {
                return Ok(());
            }
            *self.inner.state.write().await = SessionState::Connecting;
        }

        let handle = match self
            .inner
            .pool
            .acquire(&self.inner.key, &self.inner.config.process)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                *self.inner.state.write().await = SessionState::Error;
                return Err(e);
            }
        };

        let (sink, lines) = handle.split();
        self.attach(Arc::new(sink), lines).await
    }

    /// Wire an already-established transport into this session. Used by
    /// `connect` and by test harnesses.
    pub async fn attach(
        &self,
        sink: Arc<dyn CommandSink>,
        lines: mpsc::Receiver<String>,
    ) -> Result<()> {
        *self.inner.writer.lock().await = Some(sink);
        *self.inner.state.write().await = SessionState::Connected;

        let inner = self.inner.clone();
        tokio::spawn(async move {
            reader_loop(inner, lines).await;
        });

        self.inner.deliver(RenderEvent::Connected).await;
        Ok(())
    }

    /// Send one prompt and suspend until the backend signals end-of-turn.
    pub async fn send_prompt(&self, text: &str) -> Result<PromptOutcome> {
        self.send_prompt_with(text, None).await
    }

    /// Like `send_prompt`, additionally invoking `on_chunk` for every
    /// message chunk of this turn.
    pub async fn send_prompt_with(
        &self,
        text: &str,
        on_chunk: Option<ChunkCallback>,
    ) -> Result<PromptOutcome> {
        {
            let state = *self.inner.state.read().await;
            match state {
                SessionState::Working => {
                    return Err(CadreError::InvalidOperation(format!(
                        "session {} already has a prompt in flight",
                        self.inner.key
                    )))
                }
                SessionState::Connected => {}
                other => {
                    return Err(CadreError::Session(format!(
                        "session {} is not connected (state {:?})",
                        self.inner.key, other
                    )))
                }
            }
        }

        let turn_id = uuid::Uuid::new_v4().to_string();
        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().await;
            if pending.is_some() {
                return Err(CadreError::InvalidOperation(format!(
                    "session {} already has a prompt in flight",
                    self.inner.key
                )));
            }
            *pending = Some(PendingTurn {
                id: turn_id.clone(),
                buffer: String::new(),
                truncated: false,
                on_chunk,
                done_tx,
            });
        }
        *self.inner.state.write().await = SessionState::Working;

        let command = WireCommand::Prompt {
            id: turn_id,
            text: text.to_string(),
        };
        if let Err(e) = self.send_command(&command).await {
            self.inner.pending.lock().await.take();
            *self.inner.state.write().await = SessionState::Error;
            self.inner.pool.record_failure(&self.inner.key).await;
            return Err(e);
        }

        match done_rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(CadreError::Session(format!(
                "session {} closed mid-turn",
                self.inner.key
            ))),
        }
    }

    /// Cancel the in-flight prompt, draining events until `PromptComplete`
    /// or the 5 s drain timeout. Idempotent: a session with no prompt in
    /// flight returns immediately.
    pub async fn cancel_prompt(&self) -> Result<()> {
        let turn_id = {
            let pending = self.inner.pending.lock().await;
            match pending.as_ref() {
                Some(turn) => turn.id.clone(),
                None => return Ok(()),
            }
        };

        let _ = self
            .send_command(&WireCommand::Cancel { id: turn_id })
            .await;

        let notified = self.inner.turn_done.notified();
        tokio::pin!(notified);
        if tokio::time::timeout(CANCEL_DRAIN_TIMEOUT, &mut notified)
            .await
            .is_err()
        {
            // The backend never confirmed; resolve the turn locally.
            if let Some(turn) = self.inner.pending.lock().await.take() {
                let outcome = PromptOutcome {
                    text: turn.buffer,
                    stop_reason: StopReason::Cancelled,
                    truncated: turn.truncated,
                };
                let _ = turn.done_tx.send(Ok(outcome));
            }
            *self.inner.state.write().await = SessionState::Connected;
        }
        Ok(())
    }

    /// Gracefully stop the backend (grace period, then kill) and close the
    /// stream.
    pub async fn disconnect(&self) -> Result<()> {
        {
            let mut state = self.inner.state.write().await;
            if *state == SessionState::Closed {
                return Ok(());
            }
            *state = SessionState::Closed;
        }

        let _ = self.send_command(&WireCommand::Shutdown).await;
        self.inner.pool.shutdown(&self.inner.key).await?;
        *self.inner.writer.lock().await = None;

        if let Some(turn) = self.inner.pending.lock().await.take() {
            let _ = turn.done_tx.send(Err(CadreError::Session(format!(
                "session {} disconnected",
                self.inner.key
            ))));
            self.inner.turn_done.notify_waiters();
        }

        self.inner.deliver(RenderEvent::Disconnected).await;
        Ok(())
    }

    async fn send_command(&self, command: &WireCommand) -> Result<()> {
        let writer = self.inner.writer.lock().await.clone();
        let Some(writer) = writer else {
            return Err(CadreError::Session(format!(
                "session {} has no transport",
                self.inner.key
            )));
        };
        let line = wire::encode_command(command)?;
        writer.send_line(&line).await
    }
}

async fn reader_loop(inner: Arc<SessionInner>, mut lines: mpsc::Receiver<String>) {
    while let Some(line) = lines.recv().await {
        let event = match wire::decode_event(&line) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("session {}: {}", inner.key, e);
                inner
                    .deliver(RenderEvent::Info {
                        message: format!("unparseable backend line skipped: {}", e),
                    })
                    .await;
                continue;
            }
        };
        inner.handle_event(event).await;
    }
    inner.on_stream_end().await;
}

impl SessionInner {
    async fn handle_event(self: &Arc<Self>, event: RenderEvent) {
        match &event {
            RenderEvent::MessageChunk { text } => {
                let mut pending = self.pending.lock().await;
                if let Some(turn) = pending.as_mut() {
                    if let Some(on_chunk) = &turn.on_chunk {
                        on_chunk(text);
                    }
                    append_capped(
                        &mut turn.buffer,
                        &mut turn.truncated,
                        text,
                        self.config.max_output_bytes,
                    );
                }
            }
            RenderEvent::MessageEnd { full } => {
                let mut pending = self.pending.lock().await;
                if let Some(turn) = pending.as_mut() {
                    if turn.buffer.is_empty() {
                        append_capped(
                            &mut turn.buffer,
                            &mut turn.truncated,
                            full,
                            self.config.max_output_bytes,
                        );
                    }
                }
            }
            RenderEvent::Error { message } => {
                tracing::warn!("session {} backend error: {}", self.key, message);
                *self.last_error.lock().await = Some(message.clone());
            }
            RenderEvent::PromptComplete { stop_reason } => {
                let turn = self.pending.lock().await.take();
                match turn {
                    Some(turn) => {
                        let outcome = PromptOutcome {
                            text: turn.buffer,
                            stop_reason: *stop_reason,
                            truncated: turn.truncated,
                        };
                        let _ = turn.done_tx.send(Ok(outcome));
                        *self.state.write().await = SessionState::Connected;
                        self.turn_done.notify_waiters();
                    }
                    None => {
                        tracing::debug!(
                            "session {}: PromptComplete with no prompt in flight",
                            self.key
                        );
                    }
                }
            }
            _ => {}
        }
        self.deliver(event).await;
    }

    async fn on_stream_end(self: &Arc<Self>) {
        {
            let mut state = self.state.write().await;
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Error;
        }

        tracing::warn!("session {}: backend stream ended unexpectedly", self.key);
        self.pool.record_failure(&self.key).await;

        if let Some(turn) = self.pending.lock().await.take() {
            let _ = turn.done_tx.send(Err(CadreError::Session(format!(
                "session {} backend disconnected mid-turn",
                self.key
            ))));
            self.turn_done.notify_waiters();
        }

        self.deliver(RenderEvent::Error {
            message: "backend disconnected".to_string(),
        })
        .await;
        self.deliver(RenderEvent::Disconnected).await;
    }

    async fn deliver(&self, event: RenderEvent) {
        if !self.consumer_attached.load(Ordering::SeqCst) {
            return;
        }
        match self.config.overflow {
            OverflowPolicy::Backpressure => {
                let _ = self.events_tx.send(event).await;
            }
            OverflowPolicy::DropWithError => {
                let dropped = self.dropped_events.swap(0, Ordering::SeqCst);
                if dropped > 0 {
                    let note = RenderEvent::Error {
                        message: format!("{} events dropped by slow consumer", dropped),
                    };
                    if self.events_tx.try_send(note).is_err() {
                        self.dropped_events.fetch_add(dropped, Ordering::SeqCst);
                    }
                }
                if let Err(mpsc::error::TrySendError::Full(_)) = self.events_tx.try_send(event) {
                    self.dropped_events.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }
}

fn append_capped(buffer: &mut String, truncated: &mut bool, text: &str, cap: Option<usize>) {
    match cap {
        None => buffer.push_str(text),
        Some(cap) => {
            if buffer.len() >= cap {
                *truncated = true;
                return;
            }
            let room = cap - buffer.len();
            if text.len() <= room {
                buffer.push_str(text);
            } else {
                let mut end = room;
                while !text.is_char_boundary(end) {
                    end -= 1;
                }
                buffer.push_str(&text[..end]);
                *truncated = true;
            }
        }
    }
}
