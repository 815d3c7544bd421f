use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::AgentConfig;

/// Failure modes of the text-generation capability.
///
/// Callers recover from every variant locally; none of them is fatal to a turn.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("failed to reach generation endpoint: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("generation endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("generation endpoint returned no content")]
    EmptyResponse,
    #[error("failed to decode completion: {0}")]
    Decode(String),
}

/// The single text-generation capability the control loop drives.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
        system: Option<&str>,
    ) -> Result<String, GenerationError>;
}

#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

impl LlmClient {
    pub fn new(api_url: String, api_key: String, model: String) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(
            config.llm_api_url.clone(),
            config.llm_api_key.clone().unwrap_or_default(),
            config.llm_model.clone(),
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: Vec<Message>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, GenerationError> {
        let url = format!("{}/chat/completions", self.api_url);

        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: Some(temperature),
            max_tokens: Some(max_tokens),
        };

        let mut req = self.client.post(&url).json(&request);

        // Add API key header if provided (not needed for local models)
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req.send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            return Err(GenerationError::Status { status, body });
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Decode(e.to_string()))?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or(GenerationError::EmptyResponse)?;

        if content.trim().is_empty() {
            return Err(GenerationError::EmptyResponse);
        }

        Ok(content)
    }
}

#[async_trait]
impl Generator for LlmClient {
    async fn generate(
        &self,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
        system: Option<&str>,
    ) -> Result<String, GenerationError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system.filter(|s| !s.trim().is_empty()) {
            messages.push(Message {
                role: "system".to_string(),
                content: system.to_string(),
            });
        }
        messages.push(Message {
            role: "user".to_string(),
            content: prompt.to_string(),
        });

        tracing::debug!(
            "Generating with {} (temperature {:.2}, max_tokens {})",
            self.model,
            temperature,
            max_tokens
        );
        self.complete(messages, temperature, max_tokens).await
    }
}

/// Structured model output that always has a known-good substitute.
pub trait StructuredPayload: DeserializeOwned {
    fn fallback() -> Self;
}

#[derive(Debug, thiserror::Error)]
#[error("unparsable structured output: {reason} (raw: {excerpt})")]
pub struct ParseFailure {
    pub reason: String,
    pub excerpt: String,
}

/// Parse a JSON payload out of free-form model text.
pub fn parse_payload<T: DeserializeOwned>(raw: &str) -> Result<T, ParseFailure> {
    let failure = |reason: String| ParseFailure {
        reason,
        excerpt: truncate_for_log(raw, 200),
    };

    let json = extract_json(raw).ok_or_else(|| failure("no JSON found".to_string()))?;
    serde_json::from_str::<T>(&json).map_err(|e| failure(e.to_string()))
}

/// Parse a payload, substituting its fallback literal on failure.
///
/// Returns whether the fallback was used so callers can count failures.
pub fn parse_or_fallback<T: StructuredPayload>(raw: &str, what: &str) -> (T, bool) {
    match parse_payload::<T>(raw) {
        Ok(parsed) => (parsed, false),
        Err(e) => {
            tracing::warn!("{} parse failed, using fallback: {}", what, e);
            (T::fallback(), true)
        }
    }
}

/// Pull a JSON object or array out of model output.
pub fn extract_json(response: &str) -> Option<String> {
    let text = strip_thinking_tags(response.trim());

    if serde_json::from_str::<serde_json::Value>(&text).is_ok() {
        return Some(text);
    }

    if let Some(json) = extract_from_code_block(&text) {
        return Some(json);
    }

    let object_at = text.find('{');
    let array_at = text.find('[');
    let order = match (object_at, array_at) {
        (Some(o), Some(a)) if a < o => [('[', ']'), ('{', '}')],
        _ => [('{', '}'), ('[', ']')],
    };

    for (open, close) in order {
        if let Some(start) = text.find(open) {
            if let Some(json) = extract_balanced(&text[start..], open, close) {
                return Some(json);
            }
        }
    }

    None
}

fn strip_thinking_tags(text: &str) -> String {
    let mut result = text.to_string();
    for (open_tag, close_tag) in [("<thinking>", "</thinking>"), ("<think>", "</think>")] {
        while let Some(start) = result.find(open_tag) {
            if let Some(end) = result[start..].find(close_tag) {
                let end_pos = start + end + close_tag.len();
                result.replace_range(start..end_pos, "");
            } else {
                // Unclosed tag: drop everything after it
                result.replace_range(start.., "");
            }
        }
    }
    result.trim().to_string()
}

fn extract_from_code_block(text: &str) -> Option<String> {
    if let Some(start) = text.find("```json") {
        if let Some(end) = text[start + 7..].find("```") {
            return Some(text[start + 7..start + 7 + end].trim().to_string());
        }
    }
    if let Some(start) = text.find("```") {
        if let Some(end) = text[start + 3..].find("```") {
            let content = text[start + 3..start + 3 + end].trim();
            if content.starts_with('{') || content.starts_with('[') {
                return Some(content.to_string());
            }
        }
    }
    None
}

fn extract_balanced(text: &str, open: char, close: char) -> Option<String> {
    let mut depth = 0usize;
    let mut start = None;

    for (i, ch) in text.char_indices() {
        if ch == open {
            if depth == 0 {
                start = Some(i);
            }
            depth += 1;
        } else if ch == close && depth > 0 {
            depth -= 1;
            if depth == 0 {
                if let Some(s) = start {
                    let candidate = &text[s..i + ch.len_utf8()];
                    if serde_json::from_str::<serde_json::Value>(candidate).is_ok() {
                        return Some(candidate.to_string());
                    }
                    start = None;
                }
            }
        }
    }
    None
}

pub(crate) fn truncate_for_log(text: &str, max_chars: usize) -> String {
    let mut out = String::new();
    for (idx, ch) in text.chars().enumerate() {
        if idx >= max_chars {
            out.push_str("...");
            break;
        }
        out.push(ch);
    }
    out
}
