//! Stateless call to the external inference endpoint. Structurally grounded
//! in the teacher's `OpenRouterClient` (a struct over `reqwest::Client`
//! built via `from_env`, posting a chat-completion request with Bearer
//! auth, reading the body as text before parsing for a readable error
//! snippet, and timing the call with `Instant`); the decision-DSL parsing
//! that module built on top is specific to that trading bot and has no
//! counterpart here.

use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct LlmUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

/// A successful call always has non-empty `content`; the pipeline treats
/// empty content as a failure even though transport succeeded.
#[derive(Debug, Clone)]
pub struct LlmCallOutput {
    pub model: String,
    pub content: String,
    pub usage: LlmUsage,
    pub latency_ms: u64,
}

#[derive(Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    api_key: String,
    referer: Option<String>,
    title: Option<String>,
}

impl LlmClient {
    pub fn new(http: reqwest::Client, api_key: impl Into<String>) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            referer: std::env::var("LLM_HTTP_REFERER")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            title: std::env::var("LLM_APP_TITLE")
                .ok()
                .filter(|s| !s.trim().is_empty()),
        }
    }

    /// `session_id` is opaque to the transport; it's threaded through so a
    /// provider supporting per-session context can key on it, and so error
    /// messages can reference which analysis request failed.
    pub async fn chat_completion(
        &self,
        model: &str,
        system_message: &str,
        user_message: &str,
        max_tokens: u32,
        temperature: f64,
        session_id: &str,
    ) -> Result<LlmCallOutput> {
        let start = Instant::now();

        let req = ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system_message.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user_message.to_string(),
                },
            ],
            temperature: Some(temperature),
            max_tokens: Some(max_tokens),
        };

        let mut http_req = self
            .http
            .post("https://openrouter.ai/api/v1/chat/completions")
            .timeout(Duration::from_secs(30))
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .header(reqwest::header::CONTENT_TYPE, "application/json");

        if let Some(r) = &self.referer {
            http_req = http_req.header("HTTP-Referer", r);
        }
        if let Some(t) = &self.title {
            http_req = http_req.header("X-Title", t);
        }

        let resp = http_req
            .json(&req)
            .send()
            .await
            .with_context(|| format!("llm request failed for session {session_id}"))?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            let snippet: String = body.chars().take(800).collect();
            return Err(anyhow!(
                "llm provider returned {} for session {session_id}: {snippet}",
                status.as_u16()
            ));
        }

        let parsed: ChatCompletionResponse =
            serde_json::from_str(&body).context("llm response json parse")?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .map(|m| m.content)
            .unwrap_or_default();

        Ok(LlmCallOutput {
            model: model.to_string(),
            content,
            usage: LlmUsage {
                prompt_tokens: parsed.usage.as_ref().and_then(|u| u.prompt_tokens),
                completion_tokens: parsed.usage.as_ref().and_then(|u| u.completion_tokens),
                total_tokens: parsed.usage.as_ref().and_then(|u| u.total_tokens),
            },
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionResponse {
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: Option<ChatUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    pub message: Option<ChatMessageOut>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessageOut {
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    pub prompt_tokens: Option<u64>,
    #[serde(default)]
    pub completion_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
}

/// Builds the pipeline's `session_id = "analysis_{user}_{unix_ts}"` format.
pub fn session_id(user_id: i64, unix_ts: i64) -> String {
    format!("analysis_{user_id}_{unix_ts}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_matches_expected_format() {
        assert_eq!(session_id(1000, 1700000000), "analysis_1000_1700000000");
    }
}
