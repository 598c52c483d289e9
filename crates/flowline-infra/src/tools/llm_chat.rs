//! `llm-chat`: send a conversation to an OpenAI-compatible chat endpoint.
//!
//! Input: `{ messages: [{ role, content }], model?, temperature?, maxTokens? }`
//! with `role` one of system/user/assistant and `temperature` in `[0, 2]`.
//!
//! Output: `{ content, model, usage? }` where `usage` carries
//! `promptTokens`, `completionTokens` and `totalTokens` when the server
//! reports them.
//!
//! The endpoint, key, and default model come from [`LlmChatConfig`], which
//! reads `LLM_BASE_URL`, `LLM_API_KEY` and `LLM_MODEL` and falls back to a
//! local LM Studio server.

use std::time::Duration;

use flowline_core::tool::Tool;
use flowline_types::tool::{ToolContext, ToolMetadata, ToolResult};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const BASE_URL_ENV: &str = "LLM_BASE_URL";
pub const API_KEY_ENV: &str = "LLM_API_KEY";
pub const MODEL_ENV: &str = "LLM_MODEL";

const DEFAULT_BASE_URL: &str = "http://localhost:1234/v1";
const DEFAULT_API_KEY: &str = "lm-studio";
const DEFAULT_MODEL: &str = "local-model";

/// Endpoint settings for [`LlmChatTool`].
///
/// Does not derive Debug so the API key cannot end up in logs.
pub struct LlmChatConfig {
    /// Base URL up to and including the API version, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    pub api_key: SecretString,
    /// Used when the input names no model.
    pub default_model: String,
}

impl LlmChatConfig {
    /// Build from `LLM_BASE_URL`, `LLM_API_KEY`, and `LLM_MODEL`.
    pub fn from_env() -> Self {
        let var = |name: &str, default: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        Self {
            base_url: var(BASE_URL_ENV, DEFAULT_BASE_URL),
            api_key: SecretString::from(var(API_KEY_ENV, DEFAULT_API_KEY)),
            default_model: var(MODEL_ENV, DEFAULT_MODEL),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: Role,
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatInput {
    messages: Vec<ChatMessage>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    max_tokens: Option<u32>,
}

impl ChatInput {
    fn parse(input: &Value) -> Result<Self, String> {
        let parsed: ChatInput =
            serde_json::from_value(input.clone()).map_err(|e| format!("Invalid input: {e}"))?;
        if let Some(t) = parsed.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(format!("Invalid input: temperature {t} is outside 0..=2"));
            }
        }
        if parsed.max_tokens == Some(0) {
            return Err("Invalid input: maxTokens must be positive".to_string());
        }
        Ok(parsed)
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    model: String,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

// ---------------------------------------------------------------------------
// LlmChatTool
// ---------------------------------------------------------------------------

/// Built-in tool calling a chat-completions API.
pub struct LlmChatTool {
    client: reqwest::Client,
    config: LlmChatConfig,
    metadata: ToolMetadata,
}

impl LlmChatTool {
    pub fn new(config: LlmChatConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            config,
            metadata: ToolMetadata {
                name: "llm-chat".to_string(),
                version: "1.0.0".to_string(),
                description: "Send messages to an LLM and receive a response".to_string(),
            },
        }
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    /// `Ok(None)` when the server answered without any message content.
    async fn complete(&self, input: &ChatInput) -> Result<Option<Value>, String> {
        let body = CompletionRequest {
            model: input.model.as_deref().unwrap_or(&self.config.default_model),
            messages: &input.messages,
            temperature: input.temperature,
            max_tokens: input.max_tokens,
        };

        let response = self
            .client
            .post(self.url())
            .bearer_auth(self.config.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(format!("HTTP {status}: {error_body}"));
        }

        let completion: CompletionResponse = response
            .json()
            .await
            .map_err(|e| format!("failed to parse response: {e}"))?;

        let Some(content) = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.is_empty())
        else {
            return Ok(None);
        };

        let mut output = json!({ "content": content, "model": completion.model });
        if let Some(usage) = completion.usage {
            output["usage"] = json!({
                "promptTokens": usage.prompt_tokens,
                "completionTokens": usage.completion_tokens,
                "totalTokens": usage.total_tokens,
            });
        }
        Ok(Some(output))
    }
}

impl Tool for LlmChatTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    async fn execute(&self, input: &Value, ctx: &ToolContext) -> ToolResult {
        let parsed = match ChatInput::parse(input) {
            Ok(parsed) => parsed,
            Err(message) => return ToolResult::fail(message),
        };

        tracing::debug!(
            run_id = %ctx.workflow_run.id,
            step_run_id = %ctx.step_run.id,
            messages = parsed.messages.len(),
            "llm-chat request"
        );

        match self.complete(&parsed).await {
            Ok(Some(output)) => ToolResult::ok(output),
            Ok(None) => ToolResult::fail("No response content from LLM"),
            Err(message) => ToolResult::fail(format!("LLM request failed: {message}")),
        }
    }
}
