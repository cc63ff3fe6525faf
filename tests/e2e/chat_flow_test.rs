//! End-to-end chat flow over the scriptable completion client: submit,
//! stream, commit, degrade under failure, recover after reset.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use palaver_context::ContextWindow;
use palaver_core::TurnRole;
use palaver_pipeline::{CompletionPipeline, PipelineConfig, PipelineError};
use palaver_resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryConfig};
use palaver_runtime::{CompletionClient, CompletionError, MockClient};
use palaver_session::{SessionError, SessionOrchestrator, Submission};

fn build_orchestrator(
    client: Arc<MockClient>,
    breaker: Arc<CircuitBreaker>,
) -> SessionOrchestrator {
    let pipeline = Arc::new(CompletionPipeline::new(
        client as Arc<dyn CompletionClient>,
        breaker,
        PipelineConfig {
            retry: RetryConfig {
                max_retries: 1,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(10),
            },
            ..PipelineConfig::default()
        },
    ));
    SessionOrchestrator::new(pipeline, ContextWindow::new(2048, "Answer briefly."))
}

async fn drain(submission: &mut Submission) -> Result<String, SessionError> {
    let mut text = String::new();
    while let Some(item) = submission.fragments.next().await {
        let fragment = item?;
        if fragment.is_final {
            break;
        }
        text.push_str(&fragment.text);
    }
    Ok(text)
}

#[tokio::test]
async fn conversation_survives_an_outage_and_an_operator_reset() {
    let client = Arc::new(MockClient::new());
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 2,
        success_threshold: 1,
        open_duration: Duration::from_secs(60),
    }));
    let orchestrator = build_orchestrator(Arc::clone(&client), Arc::clone(&breaker));

    // Healthy round trip.
    client.enqueue_reply("The capital of France is Paris.");
    let mut first = orchestrator.submit("Capital of France?", None).await.unwrap();
    let reply = drain(&mut first).await.unwrap();
    assert_eq!(reply, "The capital of France is Paris.");
    let session_id = first.session_id;

    // Outage: both attempts of the next submit fail, opening the circuit.
    client.enqueue_stream_error(CompletionError::Unavailable {
        status: 503,
        message: "upstream down".to_string(),
    });
    client.enqueue_stream_error(CompletionError::Unavailable {
        status: 503,
        message: "upstream down".to_string(),
    });
    let mut second = orchestrator
        .submit("And Germany?", Some(session_id))
        .await
        .unwrap();
    let err = drain(&mut second).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Pipeline(PipelineError::RetriesExhausted { attempts: 2, .. })
    ));
    assert_eq!(orchestrator.circuit_breaker_stats().state, CircuitState::Open);

    // While open, a new submit fast-fails without touching the upstream.
    let calls_before = client.stream_calls();
    let mut third = orchestrator
        .submit("Still there?", Some(session_id))
        .await
        .unwrap();
    let err = drain(&mut third).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Pipeline(PipelineError::CircuitOpen { .. })
    ));
    assert_eq!(client.stream_calls(), calls_before);

    // Operator reset restores service.
    orchestrator.reset_circuit_breaker();
    client.enqueue_reply("Berlin.");
    let mut fourth = orchestrator
        .submit("And Germany?", Some(session_id))
        .await
        .unwrap();
    let reply = drain(&mut fourth).await.unwrap();
    assert_eq!(reply, "Berlin.");

    // Transcript: only completed exchanges carry assistant turns; failed
    // submits left just their user turn.
    let session = orchestrator.session(session_id).await.unwrap();
    let roles: Vec<TurnRole> = session.turns.iter().map(|t| t.role).collect();
    assert_eq!(
        roles,
        vec![
            TurnRole::User,
            TurnRole::Assistant,
            TurnRole::User,
            TurnRole::User,
            TurnRole::User,
            TurnRole::Assistant,
        ]
    );
}
