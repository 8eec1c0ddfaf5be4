//! End-to-end tests: llama-session driving the echo engine.

use futures::StreamExt;
use llama_cli::EchoEngine;
use llama_session::{InferenceSession, Role, SessionConfig, SessionError, StreamStatus};

fn session(context_size: usize) -> InferenceSession {
    InferenceSession::new(SessionConfig::default(), move || {
        EchoEngine::new(context_size)
    })
    .unwrap()
}

#[tokio::test]
async fn conversation_round_trip() {
    let session = session(2048);
    session.load("/models/echo.gguf").await.unwrap();
    assert_eq!(session.context_size().await.unwrap(), 2048);

    let prompt = session
        .format(Role::User, "hello from the lane", None)
        .await
        .unwrap();
    let reply = session.generate(prompt).await.unwrap().collect_text().await;
    assert_eq!(reply.unwrap(), "hello from the lane");

    let metrics = session.last_metrics().unwrap();
    assert_eq!(metrics.output_token_count, 4);
    assert!(metrics.input_token_estimate > 0);

    // Second turn: no preamble, cache kept from the first turn.
    let prompt = session.format(Role::User, "again", None).await.unwrap();
    assert!(!prompt.contains("system"));
    let reply = session.generate(prompt).await.unwrap().collect_text().await;
    assert_eq!(reply.unwrap(), "again");

    session.shutdown().await;
}

#[tokio::test]
async fn small_context_truncates_reply() {
    // The formatted turn takes 4 of the 6 slots: 2 left for the reply.
    let config = SessionConfig {
        system_prompt: "terse".into(),
        ..SessionConfig::default()
    };
    let session = InferenceSession::new(config, || EchoEngine::new(6)).unwrap();
    session.load("/models/echo.gguf").await.unwrap();

    let prompt = session.format(Role::User, "a b", None).await.unwrap();
    let mut stream = session.generate(prompt).await.unwrap();
    let mut fragments = Vec::new();
    while let Some(item) = stream.next().await {
        fragments.push(item.unwrap());
    }
    assert_eq!(fragments.len(), 2);
    assert_eq!(stream.status(), Some(StreamStatus::Complete));
}

#[tokio::test]
async fn overflowing_prompt_surfaces_error_and_resets_cache() {
    let session = session(8);
    session.load("/models/echo.gguf").await.unwrap();

    let long = "word ".repeat(20);
    let err = session.generate(long).await.unwrap().collect_text().await;
    assert!(matches!(err, Err(SessionError::Generation(_))));

    // The cache was cleared, so a short prompt fits again.
    let reply = session.generate("short one").await.unwrap().collect_text().await;
    assert_eq!(reply.unwrap(), "short one");
}

#[tokio::test]
async fn config_reaches_the_engine_defaults() {
    let session = session(2048);
    assert_eq!(session.set_temperature(1.3).await.unwrap(), 1.0);
    assert_eq!(session.set_max_tokens(50).await.unwrap(), 128);
    session.load("/models/echo.gguf").await.unwrap();
    assert_eq!(session.config().temperature, 1.0);
    assert_eq!(session.config().max_tokens, 128);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_is_shareable_across_tasks() {
    let session = std::sync::Arc::new(session(2048));
    session.load("/models/echo.gguf").await.unwrap();

    let worker = {
        let session = session.clone();
        tokio::spawn(async move {
            let stream = session.generate("from a task").await?;
            stream.collect_text().await
        })
    };
    assert_eq!(worker.await.unwrap().unwrap(), "from a task");
}
