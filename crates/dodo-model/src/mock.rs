// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{
    client::{ClientError, EventStream},
    CompletionRequest, LlmClient, Role, StreamEvent, Usage,
};

/// Deterministic mock client for tests and the "mock" provider.  Echoes the
/// last user message back as the assistant response.
#[derive(Default)]
pub struct MockClient;

#[async_trait]
impl LlmClient for MockClient {
    fn provider(&self) -> &str {
        "mock"
    }
    fn model(&self) -> &str {
        "mock-model"
    }

    async fn stream(&self, req: CompletionRequest) -> Result<EventStream, ClientError> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_else(|| "[no input]".into());

        let events: Vec<Result<StreamEvent, ClientError>> = vec![
            Ok(StreamEvent::TextDelta(format!("MOCK: {reply}"))),
            Ok(StreamEvent::Usage(Usage {
                input_tokens: 10,
                output_tokens: 10,
            })),
            Ok(StreamEvent::Done),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// A pre-scripted client.  Each call to `stream` pops the next response
/// script from the front of the queue.  This lets tests specify exact event
/// sequences, including tool calls, without network access.
pub struct ScriptedClient {
    scripts: Arc<Mutex<Vec<Vec<StreamEvent>>>>,
    /// The last `CompletionRequest` seen by this client.
    /// Written on each call so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl ScriptedClient {
    /// Build a client from a list of response scripts.  The outer `Vec` is
    /// the ordered list of calls; the inner `Vec` is the event sequence
    /// emitted for that call.
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Convenience: client that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![Self::text_script(reply)])
    }

    /// One script that streams `reply` and finishes.
    pub fn text_script(reply: impl Into<String>) -> Vec<StreamEvent> {
        vec![
            StreamEvent::TextDelta(reply.into()),
            StreamEvent::Usage(Usage {
                input_tokens: 5,
                output_tokens: 5,
            }),
            StreamEvent::Done,
        ]
    }

    /// One script that emits the given (id, name, json-args) tool calls.
    pub fn tool_call_script(calls: &[(&str, &str, &str)]) -> Vec<StreamEvent> {
        let mut events: Vec<StreamEvent> = calls
            .iter()
            .enumerate()
            .map(|(i, (id, name, args))| StreamEvent::ToolCallDelta {
                index: i as u32,
                id: (*id).into(),
                name: (*name).into(),
                arguments: (*args).into(),
                error: None,
            })
            .collect();
        events.push(StreamEvent::Usage(Usage {
            input_tokens: 5,
            output_tokens: 5,
        }));
        events.push(StreamEvent::Done);
        events
    }

    /// Convenience: client that returns a tool call, then a text reply on
    /// the following turn.
    pub fn tool_then_text(
        tool_id: &str,
        tool_name: &str,
        args_json: &str,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            Self::tool_call_script(&[(tool_id, tool_name, args_json)]),
            Self::text_script(final_text),
        ])
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    fn provider(&self) -> &str {
        "scripted-mock"
    }
    fn model(&self) -> &str {
        "scripted-mock-model"
    }

    async fn stream(&self, req: CompletionRequest) -> Result<EventStream, ClientError> {
        *self.last_request.lock().unwrap() = Some(req);
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed
                vec![
                    StreamEvent::TextDelta("[no more scripts]".into()),
                    StreamEvent::Done,
                ]
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<Result<StreamEvent, ClientError>> = events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
