//! Model transport seam and the retry/timeout layer on top of it.
//!
//! The actual wire protocol lives outside the core; hosts hand in any
//! [`ModelTransport`]. [`ModelClient`] adds the pieces the runtime relies
//! on: a hard call timeout and bounded retries with jittered backoff for
//! transient failures.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use tracing::warn;

use crate::config::Policy;
use crate::error::ModelErr;
use crate::error::Result;
use crate::util::backoff;

/// One model turn, fully assembled.
#[derive(Debug, Clone)]
pub struct ModelCall {
    pub model: String,
    pub prompt: String,
    /// Upper bound on completion tokens; also used by the governor's
    /// admission projection.
    pub max_completion_tokens: u64,
}

/// What the transport hands back for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelCompletion {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
}

#[async_trait]
pub trait ModelTransport: Send + Sync {
    async fn call(&self, request: &ModelCall) -> std::result::Result<ModelCompletion, ModelErr>;
}

#[derive(Clone)]
pub struct ModelClient {
    transport: Arc<dyn ModelTransport>,
    timeout: Duration,
    retry_limit: u64,
}

impl ModelClient {
    pub fn new(transport: Arc<dyn ModelTransport>, policy: &Policy) -> ModelClient {
        ModelClient {
            transport,
            timeout: policy.model_timeout,
            retry_limit: policy.model_retry_limit,
        }
    }

    pub async fn call(&self, request: &ModelCall) -> Result<ModelCompletion> {
        let mut attempt = 0u64;
        loop {
            attempt += 1;
            match tokio::time::timeout(self.timeout, self.transport.call(request)).await {
                Ok(Ok(completion)) => return Ok(completion),
                Ok(Err(err)) if err.is_transient() && attempt <= self.retry_limit => {
                    let delay = match &err {
                        ModelErr::RateLimited(Some(delay)) => *delay,
                        _ => backoff(attempt),
                    };
                    debug!(attempt, ?delay, "transient model error: {err}; retrying");
                    tokio::time::sleep(delay).await;
                }
                Ok(Err(err)) => return Err(err.into()),
                Err(_) if attempt <= self.retry_limit => {
                    warn!(attempt, "model call timed out; retrying");
                    tokio::time::sleep(backoff(attempt)).await;
                }
                Err(_) => {
                    return Err(ModelErr::Unavailable(format!(
                        "model call timed out after {}ms",
                        self.timeout.as_millis()
                    ))
                    .into());
                }
            }
        }
    }
}

/// Deterministic transport for tests and offline runs: replies are queued
/// up front and popped one per call, while every received prompt is kept
/// for assertions.
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<std::result::Result<ModelCompletion, ModelErr>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new() -> ScriptedTransport {
        ScriptedTransport::default()
    }

    pub fn push(&self, completion: ModelCompletion) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(Ok(completion));
        }
    }

    pub fn push_err(&self, err: ModelErr) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(Err(err));
        }
    }

    /// Queue a plain-text reply with nominal usage numbers.
    pub fn push_text(&self, text: impl Into<String>) {
        self.push(ModelCompletion {
            text: text.into(),
            tokens_in: 200,
            tokens_out: 60,
            cost_usd: 0.001,
        });
    }

    /// Queue a reply wrapping `code` in an ACTION block.
    pub fn push_action(&self, code: &str) {
        self.push_text(format!("ACTION\n{code}\nEND_ACTION"));
    }

    /// Queue a reply wrapping `answer` in a FINAL block.
    pub fn push_final(&self, answer: &str) {
        self.push_text(format!("FINAL\n{answer}\nEND_FINAL"));
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ModelTransport for ScriptedTransport {
    async fn call(&self, request: &ModelCall) -> std::result::Result<ModelCompletion, ModelErr> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(request.prompt.clone());
        }
        let next = self.replies.lock().ok().and_then(|mut r| r.pop_front());
        match next {
            Some(reply) => reply,
            None => Err(ModelErr::Unavailable("scripted transport exhausted".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::error::RlmErr;
    use pretty_assertions::assert_eq;

    fn request() -> ModelCall {
        ModelCall {
            model: "gpt-5".to_string(),
            prompt: "hello".to_string(),
            max_completion_tokens: 512,
        }
    }

    fn client(transport: Arc<ScriptedTransport>) -> ModelClient {
        let mut policy = Policy::from_env();
        policy.model_retry_limit = 2;
        policy.model_timeout = Duration::from_secs(5);
        ModelClient::new(transport, &policy)
    }

    #[tokio::test]
    async fn retries_transient_errors_then_succeeds() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_err(ModelErr::Unavailable("blip".to_string()));
        transport.push_text("FINAL\nok\nEND_FINAL");

        let completion = client(Arc::clone(&transport)).call(&request()).await.unwrap();
        assert!(completion.text.contains("ok"));
        assert_eq!(transport.prompts().len(), 2);
    }

    #[tokio::test]
    async fn refusals_are_not_retried() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_err(ModelErr::Refused("nope".to_string()));
        transport.push_text("unreachable");

        let err = client(Arc::clone(&transport)).call(&request()).await.unwrap_err();
        assert!(matches!(err, RlmErr::Model(ModelErr::Refused(_))));
        assert_eq!(transport.prompts().len(), 1);
    }

    #[tokio::test]
    async fn transient_errors_past_the_limit_bubble_up() {
        let transport = Arc::new(ScriptedTransport::new());
        for _ in 0..4 {
            transport.push_err(ModelErr::RateLimited(Some(Duration::from_millis(1))));
        }
        let err = client(Arc::clone(&transport)).call(&request()).await.unwrap_err();
        assert!(matches!(err, RlmErr::Model(ModelErr::RateLimited(_))));
    }
}
