//! Chat-completion client abstraction
//!
//! Every model-backed component (generator, critics, query rewriting,
//! guard model) talks to an OpenAI-compatible chat endpoint through the
//! [`ChatModel`] trait, so tests and alternate providers plug in at one seam.

use crate::errors::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A single chat message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Provider-independent completion request
#[derive(Debug, Clone)]
pub struct Completion {
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Completion {
    /// System instructions followed by one user message
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
            temperature: None,
            max_tokens: None,
        }
    }

    /// A bare user message, as guard models expect
    pub fn user_only(user: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::user(user)],
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Trait for chat-completion backends
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Run one completion and return the assistant text
    async fn complete(&self, request: Completion) -> Result<String>;

    /// Get the model name
    fn model_name(&self) -> &str;
}

/// OpenAI chat-completions client (also serves Groq and other compatible hosts)
pub struct OpenAiChatModel {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    service: &'static str,
    timeout_ms: u64,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

impl OpenAiChatModel {
    /// Create a new client
    ///
    /// `service` labels errors and logs (e.g. "llm", "moderation").
    pub fn new(
        service: &'static str,
        api_key: String,
        model: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            api_key,
            model: model.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service,
            timeout_ms: timeout.as_millis() as u64,
        })
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn complete(&self, request: Completion) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);

        let body = ChatRequest {
            model: &self.model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: false,
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout {
                        operation: format!("{} completion", self.service),
                        timeout_ms: self.timeout_ms,
                    }
                } else {
                    AppError::upstream(self.service, format!("Request failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("API error {}: {}", status, body);
            // Client errors other than throttling will not succeed on retry
            return Err(if status.is_client_error() && status.as_u16() != 429 {
                AppError::Configuration { message }
            } else {
                AppError::upstream(self.service, message)
            });
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            AppError::upstream(self.service, format!("Failed to parse response: {}", e))
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| AppError::upstream(self.service, "Empty response from model"))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Scripted model for unit tests
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays queued replies in order and records every request
    #[derive(Default)]
    pub struct ScriptedModel {
        replies: Mutex<VecDeque<Result<String>>>,
        pub requests: Mutex<Vec<Completion>>,
    }

    impl ScriptedModel {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn reply(self, text: &str) -> Self {
            self.replies.lock().unwrap().push_back(Ok(text.to_string()));
            self
        }

        pub fn fail(self, error: AppError) -> Self {
            self.replies.lock().unwrap().push_back(Err(error));
            self
        }

        pub fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        /// Concatenated message contents of the n-th request
        pub fn prompt(&self, n: usize) -> String {
            self.requests.lock().unwrap()[n]
                .messages
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n")
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn complete(&self, request: Completion) -> Result<String> {
            self.requests.lock().unwrap().push(request);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(AppError::upstream("llm", "script exhausted")))
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_builder() {
        let completion = Completion::new("be terse", "what is fibre?")
            .temperature(0.0)
            .max_tokens(64);

        assert_eq!(completion.messages.len(), 2);
        assert_eq!(completion.messages[0].role, "system");
        assert_eq!(completion.messages[1].content, "what is fibre?");
        assert_eq!(completion.temperature, Some(0.0));
        assert_eq!(completion.max_tokens, Some(64));
    }

    #[test]
    fn test_request_serialization_skips_unset_options() {
        let messages = vec![ChatMessage::user("hi")];
        let body = ChatRequest {
            model: "gpt-4o-mini",
            messages: &messages,
            max_tokens: None,
            temperature: None,
            stream: false,
        };

        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("max_tokens").is_none());
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[test]
    fn test_base_url_is_normalized() {
        let model = OpenAiChatModel::new(
            "llm",
            "key".to_string(),
            "gpt-4o-mini",
            "https://api.openai.com/v1/",
            Duration::from_secs(5),
        )
        .unwrap();

        assert_eq!(model.base_url, "https://api.openai.com/v1");
        assert_eq!(model.model_name(), "gpt-4o-mini");
    }
}
