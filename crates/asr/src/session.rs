//! Session facade and lifecycle state for one recognition task.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AsrConfig;
use crate::error::AsrError;
use crate::transport::{AsrTransport, WsTransport};
use crate::worker;
use crate::{AudioFrame, TranscriptEvent};

/// How long `close` waits for a loop to unwind before aborting it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle of one recognition task.
///
/// A session opens its transport during construction, so `Connecting`
/// is the initial state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    AwaitingStart,
    Streaming,
    Finishing,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Cross-task state shared by the audio sender and the result receiver.
///
/// The status field is the only datum mutated from both loops; everything
/// else is either immutable or a synchronization primitive.
pub(crate) struct SessionShared {
    pub(crate) task_id: String,
    pub(crate) config: AsrConfig,
    status: Mutex<SessionStatus>,
    error: Mutex<Option<AsrError>>,
    /// Single-fire start signal, consumed by the sender. The receiver
    /// fires it on task-started and drops it on exit so a blocked
    /// sender can never wait past the receiver's lifetime.
    pub(crate) started_tx: Mutex<Option<oneshot::Sender<()>>>,
    /// Flipped by `close()`; both loops select on it.
    pub(crate) closing: watch::Sender<bool>,
    pub(crate) closed: AtomicBool,
    finish_sent: AtomicBool,
}

impl SessionShared {
    pub(crate) fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    /// Moves to `next` unless the session is already terminal.
    pub(crate) fn transition(&self, next: SessionStatus) -> bool {
        let mut status = self.status.lock();
        if status.is_terminal() {
            return false;
        }
        debug!(task_id = %self.task_id, from = ?*status, to = ?next, "session transition");
        *status = next;
        true
    }

    /// Moves from exactly `from` to `to`.
    pub(crate) fn advance(&self, from: SessionStatus, to: SessionStatus) -> bool {
        let mut status = self.status.lock();
        if *status != from {
            return false;
        }
        debug!(task_id = %self.task_id, from = ?from, to = ?to, "session transition");
        *status = to;
        true
    }

    /// Records the first fatal error and enters `Failed`.
    ///
    /// Returns false when the session was already terminal; the first
    /// failure wins and later ones are dropped.
    pub(crate) fn fail(&self, err: AsrError) -> bool {
        let mut status = self.status.lock();
        if status.is_terminal() {
            return false;
        }
        debug!(task_id = %self.task_id, from = ?*status, error = %err, "session failed");
        *status = SessionStatus::Failed;
        *self.error.lock() = Some(err);
        true
    }

    /// Claims the one finish-task send. Returns true for the first caller.
    pub(crate) fn claim_finish(&self) -> bool {
        !self.finish_sent.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn finish_sent(&self) -> bool {
        self.finish_sent.load(Ordering::SeqCst)
    }

    pub(crate) fn last_error(&self) -> Option<AsrError> {
        self.error.lock().clone()
    }
}

struct SessionTasks {
    audio_tx: Option<mpsc::Sender<AudioFrame>>,
    send_task: Option<JoinHandle<()>>,
    recv_task: Option<JoinHandle<()>>,
}

/// The finite transcript stream: events until the session completes,
/// or events followed by one error when it fails.
pub type EventReceiver = mpsc::Receiver<Result<TranscriptEvent, AsrError>>;

/// Public handle for one realtime recognition session.
///
/// Owns the transport and the two background loops (audio sender and
/// result receiver). Dropping the handle aborts the loops; call
/// [`SpeechSession::close`] for an orderly shutdown.
pub struct SpeechSession {
    shared: Arc<SessionShared>,
    transport: Arc<dyn AsrTransport>,
    inner: TokioMutex<SessionTasks>,
}

impl SpeechSession {
    /// Opens the connection and starts a recognition task.
    ///
    /// Returns the session handle and the transcript event stream. The
    /// stream is single-consumer and ends when the session reaches
    /// `Completed` or `Failed`.
    pub async fn connect(config: AsrConfig) -> Result<(Self, EventReceiver), AsrError> {
        let transport = WsTransport::connect(&config).await?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    /// Starts a session over an already-open transport.
    ///
    /// Used by [`SpeechSession::connect`] and by tests that script the
    /// transport.
    pub fn with_transport(
        config: AsrConfig,
        transport: Arc<dyn AsrTransport>,
    ) -> (Self, EventReceiver) {
        let task_id = Uuid::new_v4().to_string();
        let (audio_tx, audio_rx) = mpsc::channel(config.frame_queue_capacity);
        let (event_tx, event_rx) = mpsc::channel(config.event_queue_capacity);
        let (started_tx, started_rx) = oneshot::channel();
        let (closing, _) = watch::channel(false);

        let shared = Arc::new(SessionShared {
            task_id: task_id.clone(),
            config,
            status: Mutex::new(SessionStatus::Connecting),
            error: Mutex::new(None),
            started_tx: Mutex::new(Some(started_tx)),
            closing,
            closed: AtomicBool::new(false),
            finish_sent: AtomicBool::new(false),
        });

        info!(%task_id, "recognition session starting");

        let send_task = tokio::spawn(worker::send_loop(
            shared.clone(),
            transport.clone(),
            audio_rx,
            started_rx,
            event_tx.clone(),
        ));
        let recv_task = tokio::spawn(worker::recv_loop(
            shared.clone(),
            transport.clone(),
            event_tx,
        ));

        let session = Self {
            shared,
            transport,
            inner: TokioMutex::new(SessionTasks {
                audio_tx: Some(audio_tx),
                send_task: Some(send_task),
                recv_task: Some(recv_task),
            }),
        };
        (session, event_rx)
    }

    /// Enqueues a raw PCM frame for transmission.
    ///
    /// Frames pushed after [`SpeechSession::finish_input`] or
    /// [`SpeechSession::close`], or once the session is terminal, are
    /// rejected with [`AsrError::SessionClosed`].
    pub async fn push_frame(&self, frame: AudioFrame) -> Result<(), AsrError> {
        if self.shared.closed.load(Ordering::SeqCst) || self.shared.status().is_terminal() {
            return Err(AsrError::SessionClosed);
        }
        let audio_tx = self.inner.lock().await.audio_tx.clone();
        match audio_tx {
            Some(tx) => tx.send(frame).await.map_err(|_| AsrError::SessionClosed),
            None => Err(AsrError::SessionClosed),
        }
    }

    /// Signals end of input. Frames already queued are still sent, then
    /// the sender issues the single finish-task command.
    pub async fn finish_input(&self) {
        self.inner.lock().await.audio_tx.take();
    }

    /// Orderly shutdown: ends the audio queue, lets the sender flush and
    /// finish the task, then tears the transport down (which wakes a
    /// blocked receive) and joins both loops.
    ///
    /// Idempotent and safe to call concurrently; the transport teardown
    /// runs exactly once.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        // send_replace stores the value even while no receiver is
        // subscribed yet, so a close racing the run-task send sticks.
        self.shared.closing.send_replace(true);

        let mut inner = self.inner.lock().await;
        inner.audio_tx.take();

        if let Some(mut task) = inner.send_task.take()
            && tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err()
        {
            warn!(task_id = %self.shared.task_id, "audio sender did not stop in time, aborting");
            task.abort();
            let _ = task.await;
        }

        self.transport.close().await;

        if let Some(mut task) = inner.recv_task.take()
            && tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err()
        {
            warn!(task_id = %self.shared.task_id, "result receiver did not stop in time, aborting");
            task.abort();
            let _ = task.await;
        }

        info!(
            task_id = %self.shared.task_id,
            status = ?self.shared.status(),
            "recognition session closed"
        );
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    /// Task identifier, stable for the session's lifetime.
    pub fn task_id(&self) -> &str {
        &self.shared.task_id
    }

    /// The fatal error that ended the session, if any.
    pub fn last_error(&self) -> Option<AsrError> {
        self.shared.last_error()
    }
}

impl Drop for SpeechSession {
    fn drop(&mut self) {
        // Orderly shutdown goes through close(); this is the backstop so
        // a dropped handle never leaves the loops running.
        if let Ok(inner) = self.inner.try_lock() {
            if let Some(task) = &inner.send_task {
                task.abort();
            }
            if let Some(task) = &inner.recv_task {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(!SessionStatus::Connecting.is_terminal());
        assert!(!SessionStatus::AwaitingStart.is_terminal());
        assert!(!SessionStatus::Streaming.is_terminal());
        assert!(!SessionStatus::Finishing.is_terminal());
    }
}
