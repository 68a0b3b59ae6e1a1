//! The two concurrent loops of a recognition session.
//!
//! The audio sender owns the write half of the transport, the result
//! receiver the read half; they meet only through [`SessionShared`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::AudioFrame;
use crate::TranscriptEvent;
use crate::error::AsrError;
use crate::protocol::{self, InboundEvent};
use crate::session::{SessionShared, SessionStatus};
use crate::transport::{AsrTransport, TransportEvent};

type EventSender = mpsc::Sender<Result<TranscriptEvent, AsrError>>;

/// Outcome of waiting for the start acknowledgment.
///
/// Computed inside the select so no watch borrow is held across an
/// await point; the follow-up sends happen after the select resolves.
enum StartWait {
    Acked,
    ReceiverGone,
    TimedOut,
    Closing,
}

/// Audio sender: issues run-task, blocks until the start acknowledgment,
/// then forwards queued frames in order and finishes the task exactly once.
pub(crate) async fn send_loop(
    shared: Arc<SessionShared>,
    transport: Arc<dyn AsrTransport>,
    mut audio_rx: mpsc::Receiver<AudioFrame>,
    started_rx: oneshot::Receiver<()>,
    events: EventSender,
) {
    // Subscribed before the first send so a close racing run-task is
    // never missed.
    let mut closing = shared.closing.subscribe();

    let run_task = protocol::run_task(&shared.task_id, &shared.config);
    if let Err(e) = transport.send_text(run_task).await {
        fail(&shared, &transport, &events, e).await;
        return;
    }
    shared.transition(SessionStatus::AwaitingStart);
    debug!(task_id = %shared.task_id, "run-task sent, awaiting task-started");

    let start_timeout = Duration::from_millis(shared.config.start_timeout_ms);
    let wait = tokio::select! {
        ack = tokio::time::timeout(start_timeout, started_rx) => match ack {
            Ok(Ok(())) => StartWait::Acked,
            Ok(Err(_)) => StartWait::ReceiverGone,
            Err(_) => StartWait::TimedOut,
        },
        _ = closing.wait_for(|closing| *closing) => StartWait::Closing,
    };
    match wait {
        // The receiver has already moved the session to Streaming.
        StartWait::Acked => {}
        StartWait::ReceiverGone => {
            // Receiver exited before acknowledging; it has recorded
            // the terminal state. No audio, no finish-task.
            return;
        }
        StartWait::TimedOut => {
            warn!(task_id = %shared.task_id, ?start_timeout, "task-started never arrived");
            fail(
                &shared,
                &transport,
                &events,
                AsrError::TaskStartTimeout(start_timeout),
            )
            .await;
            return;
        }
        StartWait::Closing => {
            // Cancelled before the task started: no audio ever goes out,
            // but the open task is still finished.
            finish(&shared, &transport).await;
            return;
        }
    }

    let mut frames: u64 = 0;
    loop {
        let frame = tokio::select! {
            frame = audio_rx.recv() => frame,
            // close() drops queued frames; finish_input drains them.
            _ = closing.wait_for(|closing| *closing) => None,
        };
        let Some(frame) = frame else { break };

        if let Err(e) = transport.send_binary(frame.data).await {
            if !shared.status().is_terminal() {
                fail(&shared, &transport, &events, e).await;
            }
            return;
        }
        frames += 1;
        if frames == 1 || frames.is_multiple_of(500) {
            debug!(task_id = %shared.task_id, frames, "audio frames forwarded");
        }
    }

    finish(&shared, &transport).await;
    debug!(task_id = %shared.task_id, frames, "audio sender stopped");
}

/// Result receiver: drives the state machine from inbound events and
/// emits transcripts until a terminal event, closure, or error.
pub(crate) async fn recv_loop(
    shared: Arc<SessionShared>,
    transport: Arc<dyn AsrTransport>,
    events: EventSender,
) {
    loop {
        match transport.receive().await {
            TransportEvent::Text(text) => match protocol::parse_inbound(&text) {
                Ok(InboundEvent::TaskStarted { task_id }) => {
                    if let Some(id) = task_id
                        && id != shared.task_id
                    {
                        warn!(expected = %shared.task_id, got = %id, "task-started for unknown task");
                    }
                    if shared.advance(SessionStatus::AwaitingStart, SessionStatus::Streaming) {
                        info!(task_id = %shared.task_id, "task started, audio may flow");
                    }
                    if let Some(tx) = shared.started_tx.lock().take() {
                        let _ = tx.send(());
                    }
                }
                Ok(InboundEvent::ResultGenerated { sentence }) => {
                    let Some(sentence) = sentence else { continue };
                    let text = sentence.text.trim();
                    if sentence.heartbeat || text.is_empty() {
                        continue;
                    }
                    let event = TranscriptEvent {
                        text: text.to_string(),
                        is_final: sentence.sentence_end,
                        language: shared.config.language_hints.first().cloned(),
                        confidence: sentence.confidence,
                    };
                    debug!(
                        task_id = %shared.task_id,
                        is_final = event.is_final,
                        text = %event.text,
                        "transcript"
                    );
                    if events.send(Ok(event)).await.is_err() {
                        // Caller dropped the stream; keep draining so the
                        // task can still end cleanly.
                        debug!(task_id = %shared.task_id, "event stream receiver dropped");
                    }
                }
                Ok(InboundEvent::TaskFinished) => {
                    info!(task_id = %shared.task_id, "task finished");
                    shared.transition(SessionStatus::Completed);
                    transport.close().await;
                    break;
                }
                Ok(InboundEvent::TaskFailed { code, message }) => {
                    fail(
                        &shared,
                        &transport,
                        &events,
                        AsrError::RemoteTaskFailure { code, message },
                    )
                    .await;
                    break;
                }
                Ok(InboundEvent::Unknown(name)) => {
                    debug!(event = %name, "ignoring unhandled service event");
                }
                Err(e) => {
                    fail(&shared, &transport, &events, e).await;
                    break;
                }
            },
            TransportEvent::Closed => {
                if shared.status() == SessionStatus::Finishing && shared.finish_sent() {
                    // Clean closure after finish-task is the success path.
                    shared.transition(SessionStatus::Completed);
                } else if !shared.status().is_terminal() {
                    fail(&shared, &transport, &events, AsrError::TransportClosed).await;
                }
                break;
            }
            TransportEvent::Failed(e) => {
                if !shared.status().is_terminal() {
                    fail(&shared, &transport, &events, AsrError::Transport(e)).await;
                }
                break;
            }
        }
    }

    // The session is over: wake a sender still blocked on the start
    // signal or the audio queue so it unwinds and the stream ends.
    shared.started_tx.lock().take();
    shared.closing.send_replace(true);
    debug!(task_id = %shared.task_id, status = ?shared.status(), "result receiver stopped");
}

/// Sends finish-task at most once per session; skipped when the session
/// is already terminal or the transport is gone.
async fn finish(shared: &SessionShared, transport: &Arc<dyn AsrTransport>) {
    if shared.status().is_terminal() || !shared.claim_finish() {
        return;
    }
    shared.transition(SessionStatus::Finishing);
    match transport.send_text(protocol::finish_task(&shared.task_id)).await {
        Ok(()) => debug!(task_id = %shared.task_id, "finish-task sent"),
        Err(AsrError::TransportClosed) => {}
        Err(e) => warn!(task_id = %shared.task_id, error = %e, "finish-task not delivered"),
    }
}

/// Records the first fatal error, surfaces it on the event stream, and
/// releases the transport so the peer loop unblocks.
async fn fail(
    shared: &SessionShared,
    transport: &Arc<dyn AsrTransport>,
    events: &EventSender,
    err: AsrError,
) {
    if !shared.fail(err.clone()) {
        return;
    }
    warn!(task_id = %shared.task_id, error = %err, "recognition session failed");
    let _ = events.send(Err(err)).await;
    transport.close().await;
}
