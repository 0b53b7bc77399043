use crate::config::ModelConfig;
use crate::error::ModelError;
use crate::retry::with_retry;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One request to the model: a system instruction, the conversation so far
/// and an optional description of the expected response shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub schema_hint: Option<String>,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            messages: vec![ChatMessage::user(user)],
            schema_hint: None,
        }
    }

    pub fn with_schema_hint(mut self, hint: impl Into<String>) -> Self {
        self.schema_hint = Some(hint.into());
        self
    }

    /// Last user message, which is what scripted test models key on.
    pub fn last_user_message(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| message.content.as_str())
            .unwrap_or_default()
    }

    fn to_messages(&self) -> Vec<ChatMessage> {
        let system = match &self.schema_hint {
            Some(hint) => format!("{}\n\nResponse schema:\n{}", self.system, hint),
            None => self.system.clone(),
        };

        let mut messages = Vec::with_capacity(self.messages.len() + 1);
        messages.push(ChatMessage {
            role: Role::System,
            content: system,
        });
        messages.extend(self.messages.iter().cloned());
        messages
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, prompt: &Prompt) -> Result<String, ModelError>;
}

/// Chat client for an OpenAI-compatible server (LM Studio, llama.cpp,
/// vLLM) reachable at a local address.
pub struct OpenAiChatModel {
    completions_url: Url,
    model: String,
    temperature: f32,
    max_tokens: u32,
    client: Client,
}

impl OpenAiChatModel {
    pub fn new(config: &ModelConfig) -> Result<Self, ModelError> {
        let base = format!("{}/", config.endpoint.trim_end_matches('/'));
        let completions_url = Url::parse(&base)
            .and_then(|base| base.join("chat/completions"))
            .map_err(|error| ModelError::Unavailable(format!("invalid endpoint: {error}")))?;

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|error| ModelError::Unavailable(error.to_string()))?;

        Ok(Self {
            completions_url,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            client,
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAiChatModel {
    async fn complete(&self, prompt: &Prompt) -> Result<String, ModelError> {
        let body = json!({
            "model": self.model,
            "messages": prompt.to_messages(),
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "stream": false,
        });

        debug!(url = %self.completions_url, turns = prompt.messages.len(), "chat completion request");

        let response = self
            .client
            .post(self.completions_url.clone())
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ModelError::Unavailable(format!(
                "chat endpoint returned {status}: {text}"
            )));
        }

        let payload: Value = response.json().await?;
        message_content(&payload)
    }
}

fn message_content(payload: &Value) -> Result<String, ModelError> {
    payload
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ModelError::Malformed("response has no choices[0].message.content".to_string()))
}

/// Issues `prompt` under the configured timeout, retrying transient
/// failures as many times as the retry policy allows.
pub async fn complete_with_retry(
    model: &dyn LanguageModel,
    prompt: &Prompt,
    config: &ModelConfig,
) -> Result<String, ModelError> {
    with_retry(
        "model completion",
        config.retry.transient_retries,
        config.request_timeout,
        || model.complete(prompt),
        ModelError::Timeout,
        ModelError::is_transient,
    )
    .await
}
