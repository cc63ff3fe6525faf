//! Session orchestration.
//!
//! Owns the in-memory map of session id to transcript. Each submitted
//! user turn builds a context window, streams a completion through the
//! pipeline, forwards fragments to the caller, and commits the assistant
//! turn only once the stream completes without error.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::Utc;
use futures::{Stream, StreamExt};
use palaver_context::ContextWindow;
use palaver_core::{Fragment, Session, SessionId, Turn, TurnId, TurnRole};
use palaver_pipeline::{CompletionPipeline, PipelineError};
use palaver_resilience::{CircuitBreaker, CircuitBreakerStats};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Orchestration failure surfaced to the transport layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(SessionId),
    /// A submit arrived while the same session was still awaiting a
    /// completion. Concurrent submits per session are a caller error.
    #[error("session {0} already has a completion in flight")]
    Busy(SessionId),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Result of accepting one user turn: the ids the transport needs plus
/// the lazy fragment sequence to forward.
#[derive(Debug)]
pub struct Submission {
    pub session_id: SessionId,
    pub assistant_turn_id: TurnId,
    pub fragments: SubmissionStream,
}

/// Fragment sequence for one submit call. Dropping it cancels the
/// in-flight upstream request.
#[derive(Debug)]
pub struct SubmissionStream {
    receiver: mpsc::UnboundedReceiver<Result<Fragment, SessionError>>,
    cancel: CancellationToken,
}

impl SubmissionStream {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Stream for SubmissionStream {
    type Item = Result<Fragment, SessionError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for SubmissionStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct SessionEntry {
    session: Session,
    awaiting_completion: bool,
}

/// Owns every session and serializes submits per session id.
pub struct SessionOrchestrator {
    sessions: Arc<RwLock<HashMap<SessionId, SessionEntry>>>,
    pipeline: Arc<CompletionPipeline>,
    window: ContextWindow,
}

impl SessionOrchestrator {
    pub fn new(pipeline: Arc<CompletionPipeline>, window: ContextWindow) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            pipeline,
            window,
        }
    }

    /// Accept one user turn for a session, creating the session when no id
    /// is supplied.
    ///
    /// The user turn is committed immediately; the assistant turn is
    /// committed only after the stream finishes cleanly. On error the
    /// session is left exactly as it was plus the user turn.
    pub async fn submit(
        &self,
        text: &str,
        session_id: Option<SessionId>,
    ) -> Result<Submission, SessionError> {
        let text = text.trim().to_string();
        let assistant_turn_id = TurnId::new();

        let (session_id, context) = {
            let mut sessions = self.sessions.write().await;

            let entry = match session_id {
                Some(id) => {
                    let entry = sessions.get_mut(&id).ok_or(SessionError::NotFound(id))?;
                    if entry.awaiting_completion {
                        return Err(SessionError::Busy(id));
                    }
                    entry
                }
                None => {
                    let session = Session::new();
                    let id = session.id;
                    info!(session_id = %id, "session created");
                    sessions.entry(id).or_insert(SessionEntry {
                        session,
                        awaiting_completion: false,
                    })
                }
            };

            let id = entry.session.id;
            entry.session.push_turn(Turn::user(text, id));
            entry.awaiting_completion = true;

            (id, self.window.fit(&entry.session.turns))
        };

        debug!(
            session_id = %session_id,
            context_turns = context.len(),
            "submitting completion"
        );

        let upstream = self.pipeline.stream(context);
        let cancel = upstream.cancellation_token();
        let (tx, rx) = mpsc::unbounded_channel();

        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            forward_and_commit(upstream, tx, sessions, session_id, assistant_turn_id).await;
        });

        Ok(Submission {
            session_id,
            assistant_turn_id,
            fragments: SubmissionStream {
                receiver: rx,
                cancel,
            },
        })
    }

    /// Read-only transcript snapshot.
    pub async fn session(&self, id: SessionId) -> Result<Session, SessionError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .map(|entry| entry.session.clone())
            .ok_or(SessionError::NotFound(id))
    }

    /// Explicit session deletion.
    pub async fn delete_session(&self, id: SessionId) -> Result<(), SessionError> {
        self.sessions
            .write()
            .await
            .remove(&id)
            .map(|_| info!(session_id = %id, "session deleted"))
            .ok_or(SessionError::NotFound(id))
    }

    pub async fn active_session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Remove every idle session older than `max_age`. Sessions still
    /// awaiting a completion are kept so their deferred commit cannot land
    /// in a deleted transcript. Returns the number removed.
    pub async fn clear_older_than(&self, max_age: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();

        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, entry| {
            entry.awaiting_completion || entry.session.idle_for(now) <= cutoff
        });
        let removed = before - sessions.len();

        if removed > 0 {
            info!(removed, "idle sessions swept");
        }
        removed
    }

    pub fn circuit_breaker_stats(&self) -> CircuitBreakerStats {
        self.breaker().stats()
    }

    pub fn reset_circuit_breaker(&self) {
        self.breaker().reset();
    }

    fn breaker(&self) -> &Arc<CircuitBreaker> {
        self.pipeline.breaker()
    }
}

async fn forward_and_commit(
    mut upstream: palaver_pipeline::FragmentStream,
    tx: mpsc::UnboundedSender<Result<Fragment, SessionError>>,
    sessions: Arc<RwLock<HashMap<SessionId, SessionEntry>>>,
    session_id: SessionId,
    assistant_turn_id: TurnId,
) {
    let mut buffer = String::new();

    // The session must be settled before the terminal event reaches the
    // caller, so a follow-up submit observing the final fragment never
    // races the transcript commit.
    while let Some(item) = upstream.next().await {
        match item {
            Ok(fragment) if fragment.is_final => {
                commit(&sessions, session_id, assistant_turn_id, buffer).await;
                let _ = tx.send(Ok(fragment));
                return;
            }
            Ok(fragment) => {
                buffer.push_str(&fragment.text);
                let _ = tx.send(Ok(fragment));
            }
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "completion failed");
                release(&sessions, session_id).await;
                let _ = tx.send(Err(SessionError::Pipeline(err)));
                return;
            }
        }
    }

    // Upstream vanished without a terminal event; discard the partial
    // buffer like any other failure.
    release(&sessions, session_id).await;
}

async fn commit(
    sessions: &RwLock<HashMap<SessionId, SessionEntry>>,
    session_id: SessionId,
    assistant_turn_id: TurnId,
    text: String,
) {
    let mut sessions = sessions.write().await;
    if let Some(entry) = sessions.get_mut(&session_id) {
        entry.awaiting_completion = false;
        let turn = Turn::with_id(assistant_turn_id, TurnRole::Assistant, text, session_id);
        entry.session.push_turn(turn);
        debug!(session_id = %session_id, "assistant turn committed");
    }
}

/// Clear the in-flight marker without committing anything; the partial
/// buffer is discarded from the transcript's point of view.
async fn release(sessions: &RwLock<HashMap<SessionId, SessionEntry>>, session_id: SessionId) {
    let mut sessions = sessions.write().await;
    if let Some(entry) = sessions.get_mut(&session_id) {
        entry.awaiting_completion = false;
    }
}

#[cfg(test)]
impl SessionOrchestrator {
    async fn set_last_activity(&self, id: SessionId, at: chrono::DateTime<Utc>) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(&id) {
            entry.session.last_activity_at = at;
        }
    }
}
