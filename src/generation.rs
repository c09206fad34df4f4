//! Generation-service collaborators
//!
//! The core only needs `generate(prompt, quiet) -> text`. [`HttpGenerator`] talks to an
//! OpenAI-compatible chat completions endpoint; [`ScriptedGenerator`] replays canned answers
//! for tests and dry runs. [`HostActivity`] reports whether the host is still producing a
//! turn, which completion checks wait out before asking.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Errors from the generation service
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("Network error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Host still generating after {0:?}")]
    HostBusy(Duration),
}

/// Prompt in, text out
#[async_trait]
pub trait Generator: Send + Sync {
    /// `quiet` asks for a background generation that does not show up in the conversation
    async fn generate(&self, prompt: &str, quiet: bool) -> Result<String, GenerationError>;
}

/// Settings for [`HttpGenerator`]
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Base URL including the API version, e.g. `http://localhost:5001/v1`
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the bearer token, if any
    pub api_key_env: Option<String>,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5001/v1".to_string(),
            model: "default".to_string(),
            api_key_env: None,
            max_tokens: 512,
            timeout: Duration::from_secs(120),
        }
    }
}

/// OpenAI-compatible chat completions client
pub struct HttpGenerator {
    http: Client,
    config: GeneratorConfig,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl HttpGenerator {
    pub fn new(config: GeneratorConfig) -> Result<Self, GenerationError> {
        let http = Client::builder().timeout(config.timeout).build()?;
        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty());
        if config.api_key_env.is_some() && api_key.is_none() {
            warn!(
                env = config.api_key_env.as_deref().unwrap_or_default(),
                "API key variable is not set, sending unauthenticated requests"
            );
        }
        Ok(Self {
            http,
            config,
            api_key,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(&self, prompt: &str, quiet: bool) -> Result<String, GenerationError> {
        debug!(model = %self.config.model, quiet, prompt_len = prompt.len(), "generate: called");
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [{ "role": "user", "content": prompt }],
            "max_tokens": self.config.max_tokens,
        });

        let mut request = self.http.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GenerationError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| GenerationError::InvalidResponse("no choices in response".to_string()))
    }
}

/// Replays queued responses in order, then a fallback, recording every prompt
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
    fallback: String,
}

impl ScriptedGenerator {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
            prompts: Mutex::new(Vec::new()),
            fallback: "false".to_string(),
        }
    }

    /// Answer used once the queue is empty
    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = fallback.into();
        self
    }

    pub fn push(&self, response: impl Into<String>) {
        if let Ok(mut queue) = self.responses.lock() {
            queue.push_back(response.into());
        }
    }

    /// Prompts received so far
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|prompts| prompts.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, prompt: &str, _quiet: bool) -> Result<String, GenerationError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        let next = self
            .responses
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front());
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }
}

/// Whether the host is currently producing a turn
pub trait HostActivity: Send + Sync {
    fn is_generating(&self) -> bool;
}

/// Host activity flag set through the HTTP surface
#[derive(Debug, Default)]
pub struct HostState {
    generating: AtomicBool,
}

impl HostState {
    pub fn set_generating(&self, generating: bool) {
        self.generating.store(generating, Ordering::SeqCst);
    }
}

impl HostActivity for HostState {
    fn is_generating(&self) -> bool {
        self.generating.load(Ordering::SeqCst)
    }
}

/// Bounds for the pre-check wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Polls until the host is idle, failing with [`GenerationError::HostBusy`] past the timeout
pub async fn wait_until_idle(
    host: &dyn HostActivity,
    wait: WaitConfig,
) -> Result<(), GenerationError> {
    let poll = async {
        while host.is_generating() {
            tokio::time::sleep(wait.poll_interval).await;
        }
    };
    tokio::time::timeout(wait.timeout, poll)
        .await
        .map_err(|_| GenerationError::HostBusy(wait.timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_scripted_generator_replays_then_falls_back() {
        let generator = ScriptedGenerator::new(["1. A", "true"]).with_fallback("nope");
        assert_eq!(generator.generate("first", false).await.unwrap(), "1. A");
        assert_eq!(generator.generate("second", true).await.unwrap(), "true");
        assert_eq!(generator.generate("third", true).await.unwrap(), "nope");
        assert_eq!(generator.prompts(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_wait_returns_when_host_idle() {
        let host = HostState::default();
        assert!(wait_until_idle(&host, WaitConfig::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_times_out_when_host_stays_busy() {
        let host = HostState::default();
        host.set_generating(true);
        let wait = WaitConfig {
            timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(5),
        };
        let err = wait_until_idle(&host, wait).await.unwrap_err();
        assert!(matches!(err, GenerationError::HostBusy(d) if d == wait.timeout));
    }

    #[tokio::test]
    async fn test_wait_resumes_once_host_finishes() {
        let host = Arc::new(HostState::default());
        host.set_generating(true);
        let flipper = host.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            flipper.set_generating(false);
        });
        let wait = WaitConfig {
            timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(5),
        };
        assert!(wait_until_idle(host.as_ref(), wait).await.is_ok());
    }

    #[test]
    fn test_endpoint_joins_base_url() {
        let generator = HttpGenerator::new(GeneratorConfig {
            base_url: "http://localhost:5001/v1/".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            generator.endpoint(),
            "http://localhost:5001/v1/chat/completions"
        );
    }
}
