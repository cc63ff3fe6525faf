//! Streaming completion pipeline.
//!
//! Wraps every upstream attempt in circuit-breaker admission and a capped
//! exponential backoff retry policy, while forwarding text fragments to
//! the consumer as they arrive. Fragments already delivered before a retry
//! are not retracted; the retry restarts generation from empty output.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use palaver_core::{Fragment, Turn};
use palaver_resilience::{CircuitBreaker, RetryConfig, RetryPolicy};
use palaver_runtime::{CompletionChunk, CompletionClient, CompletionError, CompletionRequest};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Terminal pipeline failure. No final fragment follows any of these.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// The breaker rejected the call; the upstream was never contacted.
    #[error("circuit open after {consecutive_failures} consecutive upstream failures")]
    CircuitOpen { consecutive_failures: u32 },
    /// Every attempt failed; wraps the last underlying error.
    #[error("retries exhausted after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: CompletionError,
    },
    /// Non-retriable upstream failure (credentials rejected).
    #[error(transparent)]
    Upstream(CompletionError),
    /// The caller cancelled the request. Never counted as a breaker
    /// failure.
    #[error("completion cancelled by caller")]
    Cancelled,
}

/// Generation knobs plus the retry policy applied to every request.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub retry: RetryConfig,
}

/// Caller-facing handle over one streamed completion.
///
/// Yields fragments in upstream order; the final fragment has empty text
/// and `is_final = true`. Dropping the handle cancels the in-flight
/// upstream call.
pub struct FragmentStream {
    receiver: mpsc::UnboundedReceiver<Result<Fragment, PipelineError>>,
    cancel: CancellationToken,
}

impl FragmentStream {
    /// Token the caller can use to cancel the request; cancellation stops
    /// the upstream call and is never recorded against the breaker.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Stream for FragmentStream {
    type Item = Result<Fragment, PipelineError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for FragmentStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum AttemptOutcome {
    Completed,
    Failed(CompletionError),
    Cancelled,
}

/// Retrying, breaker-guarded streaming completion pipeline. One instance
/// per upstream endpoint; the breaker is injected so its counters are
/// shared by every session.
pub struct CompletionPipeline {
    client: Arc<dyn CompletionClient>,
    breaker: Arc<CircuitBreaker>,
    config: PipelineConfig,
}

impl CompletionPipeline {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        breaker: Arc<CircuitBreaker>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            client,
            breaker,
            config,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Start a streamed completion for `prompt`.
    ///
    /// Delivery is push-based over an unbounded channel: a slow consumer
    /// queues fragments rather than blocking the upstream read.
    pub fn stream(&self, prompt: Vec<Turn>) -> FragmentStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let request = CompletionRequest {
            turns: prompt,
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        let client = Arc::clone(&self.client);
        let breaker = Arc::clone(&self.breaker);
        let retry = self.config.retry.clone();
        let worker_cancel = cancel.clone();

        tokio::spawn(async move {
            run_attempts(client, breaker, request, retry, tx, worker_cancel).await;
        });

        FragmentStream {
            receiver: rx,
            cancel,
        }
    }

    /// Buffering variant: run the same streamed pipeline and return the
    /// concatenated text.
    pub async fn complete(&self, prompt: Vec<Turn>) -> Result<String, PipelineError> {
        let mut fragments = self.stream(prompt);
        let mut content = String::new();

        while let Some(item) = fragments.next().await {
            let fragment = item?;
            if fragment.is_final {
                break;
            }
            content.push_str(&fragment.text);
        }

        Ok(content)
    }
}

async fn run_attempts(
    client: Arc<dyn CompletionClient>,
    breaker: Arc<CircuitBreaker>,
    request: CompletionRequest,
    retry: RetryConfig,
    tx: mpsc::UnboundedSender<Result<Fragment, PipelineError>>,
    cancel: CancellationToken,
) {
    let mut policy = RetryPolicy::new(retry);
    let mut attempts: u32 = 0;

    loop {
        if let Err(rejection) = breaker.try_acquire() {
            let _ = tx.send(Err(PipelineError::CircuitOpen {
                consecutive_failures: rejection.consecutive_failures,
            }));
            return;
        }

        attempts += 1;
        match run_one_attempt(client.as_ref(), request.clone(), &tx, &cancel).await {
            AttemptOutcome::Completed => {
                breaker.record_success();
                let _ = tx.send(Ok(Fragment::end()));
                return;
            }
            AttemptOutcome::Cancelled => {
                debug!(attempts, "completion cancelled by caller");
                let _ = tx.send(Err(PipelineError::Cancelled));
                return;
            }
            AttemptOutcome::Failed(err) => {
                breaker.record_failure();

                if !err.is_retriable() {
                    let _ = tx.send(Err(PipelineError::Upstream(err)));
                    return;
                }

                match policy.next_delay() {
                    Some(delay) => {
                        warn!(
                            attempt = attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "completion attempt failed, retrying"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                let _ = tx.send(Err(PipelineError::Cancelled));
                                return;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => {
                        debug!(attempts, error = %err, "retries exhausted");
                        let _ = tx.send(Err(PipelineError::RetriesExhausted {
                            attempts,
                            source: err,
                        }));
                        return;
                    }
                }
            }
        }
    }
}

async fn run_one_attempt(
    client: &dyn CompletionClient,
    request: CompletionRequest,
    tx: &mpsc::UnboundedSender<Result<Fragment, PipelineError>>,
    cancel: &CancellationToken,
) -> AttemptOutcome {
    let connect = tokio::select! {
        _ = cancel.cancelled() => return AttemptOutcome::Cancelled,
        result = client.stream(request) => result,
    };

    let mut chunks = match connect {
        Ok(chunks) => chunks,
        Err(err) => return AttemptOutcome::Failed(err),
    };

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return AttemptOutcome::Cancelled,
            item = chunks.next() => item,
        };

        match item {
            Some(Ok(CompletionChunk::Delta { text })) => {
                // A closed receiver means the consumer went away; treat it
                // like cancellation.
                if tx.send(Ok(Fragment::text(text))).is_err() {
                    return AttemptOutcome::Cancelled;
                }
            }
            Some(Ok(CompletionChunk::Done)) | None => return AttemptOutcome::Completed,
            Some(Err(err)) => return AttemptOutcome::Failed(err),
        }
    }
}
