//! OpenAI-compatible chat-completions client.
//!
//! Speaks the `/v1/chat/completions` dialect with support for SSE
//! streaming, against any base URL that implements it.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest_eventsource::{Event, RequestBuilderExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    ChunkStream, CompletionChunk, CompletionClient, CompletionError, CompletionRequest,
    CompletionResponse,
};

const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    default_model: String,
}

impl OpenAiClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("reqwest client should build"),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
        }
    }

    /// Create a client from `OPENAI_API_KEY`, `OPENAI_API_BASE` and
    /// `PALAVER_MODEL`.
    pub fn from_env() -> Self {
        let api_key =
            env::var("OPENAI_API_KEY").expect("OPENAI_API_KEY environment variable must be set");
        let mut client = Self::new(api_key);
        if let Ok(base_url) = env::var("OPENAI_API_BASE") {
            client.base_url = base_url;
        }
        if let Ok(model) = env::var("PALAVER_MODEL") {
            client.default_model = model;
        }
        client
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    fn endpoint(&self) -> String {
        format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            CHAT_COMPLETIONS_PATH
        )
    }

    fn payload(&self, req: CompletionRequest, stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: req
                .model
                .unwrap_or_else(|| self.default_model.clone()),
            messages: req
                .turns
                .iter()
                .map(|turn| ChatMessage {
                    role: turn.role.as_str().to_string(),
                    content: turn.text.clone(),
                })
                .collect(),
            max_tokens: req.max_tokens,
            temperature: req.temperature,
            stream,
        }
    }

    async fn status_error(status: StatusCode, response: reqwest::Response) -> CompletionError {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unable to read body>".to_string());

        let message = serde_json::from_str::<ErrorEnvelope>(&body)
            .ok()
            .map(|envelope| envelope.error.message)
            .unwrap_or(body);

        CompletionError::from_status(status.as_u16(), message)
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn complete(
        &self,
        req: CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError> {
        let payload = self.payload(req, false);
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| CompletionError::Unexpected(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::status_error(status, response).await);
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|err| CompletionError::Unexpected(err.to_string()))?;

        let first_choice = body.choices.into_iter().next().ok_or_else(|| {
            CompletionError::Unexpected("missing choice in response".to_string())
        })?;

        Ok(CompletionResponse {
            content: first_choice.message.content.unwrap_or_default(),
            model: Some(body.model),
            finish_reason: first_choice.finish_reason,
        })
    }

    async fn stream(&self, req: CompletionRequest) -> Result<ChunkStream, CompletionError> {
        let payload = self.payload(req, true);
        let request = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&payload);

        let mut event_source = request
            .eventsource()
            .map_err(|err| CompletionError::Unexpected(err.to_string()))?;

        let (tx, rx) = mpsc::channel::<Result<CompletionChunk, CompletionError>>(32);
        tokio::spawn(async move {
            // Set once a terminal item (Done or an error) has been sent, so
            // the fallback below never follows an error with a Done.
            let mut terminated = false;

            while let Some(event) = event_source.next().await {
                match event {
                    Ok(Event::Open) => continue,
                    Ok(Event::Message(message)) => {
                        if message.data == "[DONE]" {
                            let _ = tx.send(Ok(CompletionChunk::Done)).await;
                            terminated = true;
                            event_source.close();
                            break;
                        }

                        let chunk =
                            match serde_json::from_str::<ChatCompletionChunk>(&message.data) {
                                Ok(chunk) => chunk,
                                Err(err) => {
                                    let _ = tx
                                        .send(Err(CompletionError::Unexpected(err.to_string())))
                                        .await;
                                    terminated = true;
                                    event_source.close();
                                    break;
                                }
                            };

                        if let Some(choice) = chunk.choices.into_iter().next() {
                            if let Some(text) = choice.delta.content {
                                if !text.is_empty() {
                                    let _ = tx.send(Ok(CompletionChunk::Delta { text })).await;
                                }
                            }

                            if choice.finish_reason.is_some() {
                                let _ = tx.send(Ok(CompletionChunk::Done)).await;
                                terminated = true;
                                event_source.close();
                                break;
                            }
                        }
                    }
                    Err(reqwest_eventsource::Error::StreamEnded) => break,
                    Err(reqwest_eventsource::Error::InvalidStatusCode(status, response)) => {
                        let err = OpenAiClient::status_error(status, response).await;
                        let _ = tx.send(Err(err)).await;
                        terminated = true;
                        event_source.close();
                        break;
                    }
                    Err(err) => {
                        let _ = tx
                            .send(Err(CompletionError::Unexpected(err.to_string())))
                            .await;
                        terminated = true;
                        event_source.close();
                        break;
                    }
                }
            }

            if !terminated {
                let _ = tx.send(Ok(CompletionChunk::Done)).await;
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    model: String,
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use palaver_core::{SessionId, Turn};
    use serde_json::json;

    use super::OpenAiClient;
    use crate::{CompletionChunk, CompletionClient, CompletionError, CompletionRequest};

    fn request() -> CompletionRequest {
        let session_id = SessionId::new();
        CompletionRequest {
            turns: vec![
                Turn::system("You are terse.", session_id),
                Turn::user("Say hello", session_id),
            ],
            model: Some("gpt-4o-mini".to_string()),
            max_tokens: Some(32),
            temperature: Some(0.2),
        }
    }

    #[tokio::test]
    async fn complete_sends_turns_as_chat_messages() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .body_includes("\"stream\":false")
                    .body_includes("\"role\":\"system\"")
                    .body_includes("\"role\":\"user\"");
                then.status(200).json_body(json!({
                    "id": "chatcmpl-1",
                    "object": "chat.completion",
                    "model": "gpt-4o-mini",
                    "choices": [{
                        "index": 0,
                        "message": {"role": "assistant", "content": "Hello there"},
                        "finish_reason": "stop"
                    }]
                }));
            })
            .await;

        let client = OpenAiClient::new("test-key").with_base_url(server.base_url());
        let response = client.complete(request()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(response.content, "Hello there");
        assert_eq!(response.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn stream_reads_sse_and_emits_delta_chunks() {
        let server = MockServer::start_async().await;
        let sse = concat!(
            "data: {\"id\":\"chatcmpl-2\",\"object\":\"chat.completion.chunk\",\"model\":\"gpt-4o-mini\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"id\":\"chatcmpl-2\",\"object\":\"chat.completion.chunk\",\"model\":\"gpt-4o-mini\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: {\"id\":\"chatcmpl-2\",\"object\":\"chat.completion.chunk\",\"model\":\"gpt-4o-mini\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n"
        );

        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .body_includes("\"stream\":true");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(sse);
            })
            .await;

        let client = OpenAiClient::new("test-key").with_base_url(server.base_url());
        let mut stream = client.stream(request()).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        let done = stream.next().await.unwrap().unwrap();

        mock.assert_async().await;
        assert_eq!(
            first,
            CompletionChunk::Delta {
                text: "Hel".to_string()
            }
        );
        assert_eq!(
            second,
            CompletionChunk::Delta {
                text: "lo".to_string()
            }
        );
        assert_eq!(done, CompletionChunk::Done);
    }

    #[tokio::test]
    async fn complete_classifies_auth_failure() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(401).json_body(json!({
                    "error": {"message": "Invalid API key", "type": "invalid_request_error"}
                }));
            })
            .await;

        let client = OpenAiClient::new("bad-key").with_base_url(server.base_url());
        let err = client.complete(request()).await.unwrap_err();

        assert_eq!(err, CompletionError::Auth("Invalid API key".to_string()));
    }

    #[tokio::test]
    async fn complete_classifies_rate_limit_and_server_errors() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .body_includes("\"max_tokens\":1");
                then.status(429).json_body(json!({
                    "error": {"message": "Rate limit exceeded", "type": "rate_limit_error"}
                }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .body_includes("\"max_tokens\":2");
                then.status(503).body("overloaded");
            })
            .await;

        let client = OpenAiClient::new("test-key").with_base_url(server.base_url());

        let mut rate_limited = request();
        rate_limited.max_tokens = Some(1);
        let err = client.complete(rate_limited).await.unwrap_err();
        assert_eq!(
            err,
            CompletionError::RateLimited("Rate limit exceeded".to_string())
        );

        let mut unavailable = request();
        unavailable.max_tokens = Some(2);
        let err = client.complete(unavailable).await.unwrap_err();
        assert!(matches!(
            err,
            CompletionError::Unavailable { status: 503, .. }
        ));
    }

    #[tokio::test]
    async fn stream_surfaces_status_errors_through_the_taxonomy() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(500).body("internal error");
            })
            .await;

        let client = OpenAiClient::new("test-key").with_base_url(server.base_url());
        let mut stream = client.stream(request()).await.unwrap();

        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            CompletionError::Unavailable { status: 500, .. }
        ));
    }
}
