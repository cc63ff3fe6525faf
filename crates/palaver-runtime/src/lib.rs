//! Completion client abstractions.
//!
//! The rest of the system depends only on [`CompletionClient`]: one
//! buffered or streamed completion attempt against an upstream provider,
//! failing with a status-bearing error the pipeline can classify.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::{self, Stream};
use palaver_core::Turn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod openai;

pub use openai::OpenAiClient;

/// One completion request: the prompt turns plus generation knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub turns: Vec<Turn>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn new(turns: Vec<Turn>) -> Self {
        Self {
            turns,
            model: None,
            max_tokens: None,
            temperature: None,
        }
    }
}

/// Buffered completion result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub model: Option<String>,
    pub finish_reason: Option<String>,
}

/// One unit of a streamed completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionChunk {
    Delta { text: String },
    Done,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<CompletionChunk, CompletionError>> + Send>>;

/// Upstream failure taxonomy, classified from the provider's HTTP status.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompletionError {
    /// 401/403: credentials rejected. Retrying cannot succeed.
    #[error("upstream rejected credentials: {0}")]
    Auth(String),
    /// 429: rate limited. Retried with backoff.
    #[error("upstream rate limit: {0}")]
    RateLimited(String),
    /// 5xx: transient server-side failure. Retried with backoff.
    #[error("upstream unavailable ({status}): {message}")]
    Unavailable { status: u16, message: String },
    /// Anything else, including transport and decode failures.
    #[error("unexpected upstream failure: {0}")]
    Unexpected(String),
    /// Scripted test client ran out of queued outcomes.
    #[error("mock client has no scripted outcome")]
    MockExhausted,
}

impl CompletionError {
    /// Classify an upstream HTTP status into the taxonomy.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => CompletionError::Auth(message),
            429 => CompletionError::RateLimited(message),
            500..=599 => CompletionError::Unavailable { status, message },
            _ => CompletionError::Unexpected(format!("status {status}: {message}")),
        }
    }

    /// Whether another attempt could plausibly succeed.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, CompletionError::Auth(_))
    }
}

/// One completion attempt against the upstream provider. Implementations
/// must not retry internally; retry and breaker policy live in the
/// pipeline.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    fn name(&self) -> &'static str;

    /// Single buffered completion.
    async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse, CompletionError>;

    /// Streamed completion: incremental text chunks terminated by
    /// [`CompletionChunk::Done`].
    async fn stream(&self, req: CompletionRequest) -> Result<ChunkStream, CompletionError>;
}

type ScriptedStream = Result<Vec<Result<CompletionChunk, CompletionError>>, CompletionError>;

/// Scriptable client for tests: queue one outcome per expected attempt,
/// count how many attempts actually arrived.
#[derive(Debug, Default)]
pub struct MockClient {
    complete_queue: Mutex<VecDeque<Result<CompletionResponse, CompletionError>>>,
    stream_queue: Mutex<VecDeque<ScriptedStream>>,
    complete_calls: AtomicU32,
    stream_calls: AtomicU32,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_complete(&self, result: Result<CompletionResponse, CompletionError>) {
        self.complete_queue
            .lock()
            .expect("mock complete queue poisoned")
            .push_back(result);
    }

    /// Queue a whole reply as word-sized deltas followed by Done.
    pub fn enqueue_reply(&self, text: &str) {
        let mut items: Vec<Result<CompletionChunk, CompletionError>> = text
            .split_inclusive(' ')
            .map(|piece| {
                Ok(CompletionChunk::Delta {
                    text: piece.to_string(),
                })
            })
            .collect();
        items.push(Ok(CompletionChunk::Done));
        self.push_stream(Ok(items));
    }

    /// Queue an attempt that fails before any chunk is produced.
    pub fn enqueue_stream_error(&self, error: CompletionError) {
        self.push_stream(Err(error));
    }

    /// Queue an attempt that yields `chunks` and then fails mid-stream.
    pub fn enqueue_interrupted(&self, chunks: Vec<CompletionChunk>, error: CompletionError) {
        let items = chunks
            .into_iter()
            .map(Ok)
            .chain(std::iter::once(Err(error)))
            .collect();
        self.push_stream(Ok(items));
    }

    /// Queue an attempt with explicit per-item outcomes.
    pub fn enqueue_stream(&self, items: Vec<Result<CompletionChunk, CompletionError>>) {
        self.push_stream(Ok(items));
    }

    fn push_stream(&self, script: ScriptedStream) {
        self.stream_queue
            .lock()
            .expect("mock stream queue poisoned")
            .push_back(script);
    }

    pub fn complete_calls(&self) -> u32 {
        self.complete_calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> u32 {
        self.stream_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionClient for MockClient {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn complete(
        &self,
        _req: CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        self.complete_queue
            .lock()
            .expect("mock complete queue poisoned")
            .pop_front()
            .unwrap_or(Err(CompletionError::MockExhausted))
    }

    async fn stream(&self, _req: CompletionRequest) -> Result<ChunkStream, CompletionError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        let items = self
            .stream_queue
            .lock()
            .expect("mock stream queue poisoned")
            .pop_front()
            .unwrap_or(Err(CompletionError::MockExhausted))?;

        Ok(Box::pin(stream::iter(items)))
    }
}
