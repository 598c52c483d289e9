//! `http-fetch`: make an HTTP request and return the response.
//!
//! Input: `{ url, method?, headers?, body?, timeout? }` where `method` is one
//! of GET/POST/PUT/PATCH/DELETE (default GET), `body` is sent as its JSON
//! serialization, and `timeout` is in milliseconds (default 30000).
//!
//! Output: `{ status, statusText, headers, body }`. The body is parsed as JSON
//! when the response content type is `application/json`, otherwise returned
//! as text.

use std::collections::BTreeMap;
use std::time::Duration;

use flowline_core::tool::Tool;
use flowline_types::tool::{ToolContext, ToolMetadata, ToolResult};
use reqwest::Method;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::{Map, Value, json};

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Deserialize)]
struct FetchInput {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    timeout: Option<u64>,
}

impl FetchInput {
    fn parse(input: &Value) -> Result<Self, String> {
        let parsed: FetchInput =
            serde_json::from_value(input.clone()).map_err(|e| format!("Invalid input: {e}"))?;
        reqwest::Url::parse(&parsed.url)
            .map_err(|e| format!("Invalid input: invalid url '{}': {e}", parsed.url))?;
        Ok(parsed)
    }

    fn method(&self) -> Result<Method, String> {
        match self.method.as_deref().map(str::to_uppercase).as_deref() {
            None | Some("GET") => Ok(Method::GET),
            Some("POST") => Ok(Method::POST),
            Some("PUT") => Ok(Method::PUT),
            Some("PATCH") => Ok(Method::PATCH),
            Some("DELETE") => Ok(Method::DELETE),
            Some(other) => Err(format!("Invalid input: unsupported method '{other}'")),
        }
    }
}

/// Built-in tool performing outbound HTTP requests.
pub struct HttpFetchTool {
    client: reqwest::Client,
    metadata: ToolMetadata,
}

impl HttpFetchTool {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            metadata: ToolMetadata {
                name: "http-fetch".to_string(),
                version: "1.0.0".to_string(),
                description: "Make HTTP requests to external APIs".to_string(),
            },
        }
    }

    async fn fetch(&self, input: FetchInput, method: Method) -> Result<Value, reqwest::Error> {
        let timeout = Duration::from_millis(input.timeout.unwrap_or(DEFAULT_TIMEOUT_MS));
        let mut request = self.client.request(method, &input.url).timeout(timeout);

        for (name, value) in &input.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = input.body.as_ref().filter(|b| !b.is_null()) {
            request = request.body(body.to_string());
        }

        let response = request.send().await?;
        let status = response.status();

        let mut headers = Map::new();
        for (name, value) in response.headers() {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            match headers.get_mut(name.as_str()) {
                Some(Value::String(existing)) => {
                    existing.push_str(", ");
                    existing.push_str(&value);
                }
                _ => {
                    headers.insert(name.as_str().to_string(), Value::String(value));
                }
            }
        }

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("application/json"));
        let body = if is_json {
            response.json::<Value>().await?
        } else {
            Value::String(response.text().await?)
        };

        Ok(json!({
            "status": status.as_u16(),
            "statusText": status.canonical_reason().unwrap_or(""),
            "headers": headers,
            "body": body,
        }))
    }
}

impl Default for HttpFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

impl Tool for HttpFetchTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    async fn execute(&self, input: &Value, ctx: &ToolContext) -> ToolResult {
        let parsed = match FetchInput::parse(input) {
            Ok(parsed) => parsed,
            Err(message) => return ToolResult::fail(message),
        };
        let method = match parsed.method() {
            Ok(method) => method,
            Err(message) => return ToolResult::fail(message),
        };

        tracing::debug!(
            run_id = %ctx.workflow_run.id,
            step_run_id = %ctx.step_run.id,
            method = %method,
            url = %parsed.url,
            "http-fetch request"
        );

        match self.fetch(parsed, method).await {
            Ok(output) => ToolResult::ok(output),
            Err(err) => ToolResult::fail(format!("HTTP request failed: {err}")),
        }
    }
}
