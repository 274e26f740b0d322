// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use crate::{Completion, CompletionRequest, StreamEvent, ToolCallAssembler, Usage};

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ClientError>> + Send>>;

/// Errors surfaced by model clients.
///
/// `Api` carries the HTTP status and the provider's Retry-After hint (when
/// one was attached) so the retry policy can classify and schedule without
/// string-parsing.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{provider} API error (status {status}): {message}")]
    Api {
        provider: String,
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("network error: {0}")]
    Network(String),
    #[error("stream decode error: {0}")]
    Decode(String),
}

impl ClientError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ClientError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Capability trait for LLM access.  The scheduler depends on nothing else.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Provider id for status display ("openai", "mock", ...).
    fn provider(&self) -> &str;

    /// Model identifier as reported to users.
    fn model(&self) -> &str;

    /// Send a completion request and return a stream of events.
    async fn stream(&self, req: CompletionRequest) -> Result<EventStream, ClientError>;

    /// Non-streaming completion.
    ///
    /// The default implementation drains [`stream`] and assembles the final
    /// text and tool calls, so drivers only have to implement streaming.
    async fn complete(&self, req: CompletionRequest) -> Result<Completion, ClientError> {
        let mut stream = self.stream(req).await?;
        let mut content = String::new();
        let mut usage = Usage::default();
        let mut assembler = ToolCallAssembler::new();

        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::TextDelta(delta) => content.push_str(&delta),
                StreamEvent::ToolCallDelta {
                    index,
                    id,
                    name,
                    arguments,
                    error,
                } => assembler.push(index, &id, &name, &arguments, error.as_deref()),
                StreamEvent::Usage(u) => usage.add(u),
                StreamEvent::Done => break,
                StreamEvent::Error(e) => {
                    tracing::warn!("model stream warning: {e}");
                }
            }
        }

        Ok(Completion {
            content,
            tool_calls: assembler.finish(),
            usage,
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
