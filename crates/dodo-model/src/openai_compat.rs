// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Generic driver for OpenAI-compatible chat completion APIs.
//!
//! Dozens of providers (and every local server worth running) speak the
//! same `/chat/completions` SSE wire format, so one configurable driver is
//! the whole provider seam: the registry points it at the right base URL
//! and key, and everything else in the runtime only sees [`LlmClient`].

use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    client::{ClientError, EventStream},
    CompletionRequest, LlmClient, Message, Role, StreamEvent, Usage,
};

pub struct OpenAiCompatClient {
    /// Provider id returned by `LlmClient::provider()`.
    provider_name: String,
    /// Model id forwarded to the API.
    model: String,
    /// API key (pre-resolved from config or env).  `None` for local servers.
    api_key: Option<String>,
    /// Full chat completions URL.
    chat_url: String,
    max_tokens: u32,
    temperature: f32,
    http: reqwest::Client,
}

impl OpenAiCompatClient {
    /// `base_url` ends before `/chat/completions`, e.g.
    /// `https://api.groq.com/openai/v1`.
    pub fn new(
        provider_name: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        base_url: &str,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            provider_name: provider_name.into(),
            model: model.into(),
            api_key,
            chat_url: format!("{base}/chat/completions"),
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.2),
            http: reqwest::Client::new(),
        }
    }

    fn wire_message(m: &Message) -> Value {
        match m.role {
            Role::Tool => json!({
                "role": "tool",
                "tool_call_id": m.tool_call_id,
                "content": m.content,
            }),
            Role::Assistant if !m.tool_calls.is_empty() => {
                let calls: Vec<Value> = m
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": { "name": tc.name, "arguments": tc.args_json() },
                        })
                    })
                    .collect();
                json!({
                    "role": "assistant",
                    "content": if m.content.is_empty() { Value::Null } else { Value::String(m.content.clone()) },
                    "tool_calls": calls,
                })
            }
            Role::System => json!({ "role": "system", "content": m.content }),
            Role::User => json!({ "role": "user", "content": m.content }),
            Role::Assistant => json!({ "role": "assistant", "content": m.content }),
        }
    }

    fn build_body(&self, req: &CompletionRequest) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(Self::wire_message).collect();
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        },
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }
        body
    }

    fn api_error(&self, status: u16, message: String, retry_after: Option<Duration>) -> ClientError {
        ClientError::Api {
            provider: self.provider_name.clone(),
            status,
            message,
            retry_after,
        }
    }
}

/// Parse a Retry-After header value: either delta-seconds or an HTTP-date.
pub(crate) fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = chrono::DateTime::parse_from_rfc2822(value.trim()).ok()?;
    let delta = when.with_timezone(&chrono::Utc) - chrono::Utc::now();
    delta.to_std().ok()
}

/// Translate one SSE data payload into stream events.
fn chunk_events(chunk: &Value, out: &mut Vec<StreamEvent>) {
    if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
        out.push(StreamEvent::Usage(Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        }));
    }
    let Some(delta) = chunk["choices"].get(0).map(|c| &c["delta"]) else {
        return;
    };
    if let Some(text) = delta["content"].as_str() {
        if !text.is_empty() {
            out.push(StreamEvent::TextDelta(text.to_string()));
        }
    }
    if let Some(calls) = delta["tool_calls"].as_array() {
        for tc in calls {
            out.push(StreamEvent::ToolCallDelta {
                index: tc["index"].as_u64().unwrap_or(0) as u32,
                id: tc["id"].as_str().unwrap_or("").to_string(),
                name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
                arguments: tc["function"]["arguments"]
                    .as_str()
                    .unwrap_or("")
                    .to_string(),
                error: None,
            });
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    fn provider(&self) -> &str {
        &self.provider_name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn stream(&self, req: CompletionRequest) -> Result<EventStream, ClientError> {
        let body = self.build_body(&req);
        debug!(url = %self.chat_url, model = %self.model, "chat completion request");

        let mut http_req = self.http.post(&self.chat_url).json(&body);
        if let Some(key) = &self.api_key {
            http_req = http_req.bearer_auth(key);
        }

        let resp = http_req
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let text = resp.text().await.unwrap_or_default();
            return Err(self.api_error(status.as_u16(), text, retry_after));
        }

        let mut bytes = resp.bytes_stream();
        let events = stream! {
            let mut buf = String::new();
            while let Some(part) = bytes.next().await {
                let part = match part {
                    Ok(p) => p,
                    Err(e) => {
                        yield Err(ClientError::Network(e.to_string()));
                        return;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&part));

                // SSE frames are newline-delimited; a frame may span chunks,
                // so only complete lines are consumed from the buffer.
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim_end_matches('\r').to_string();
                    buf.drain(..=pos);

                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        yield Ok(StreamEvent::Done);
                        return;
                    }
                    match serde_json::from_str::<Value>(data) {
                        Ok(chunk) => {
                            let mut out = Vec::new();
                            chunk_events(&chunk, &mut out);
                            for ev in out {
                                yield Ok(ev);
                            }
                        }
                        Err(e) => {
                            yield Ok(StreamEvent::Error(format!("bad SSE chunk: {e}")));
                        }
                    }
                }
            }
            yield Ok(StreamEvent::Done);
        };
        Ok(Box::pin(events))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
