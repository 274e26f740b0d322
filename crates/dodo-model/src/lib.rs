// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Data model and LLM client seam for the dodo runtime.
//!
//! Everything above this crate depends on the [`LlmClient`] trait and the
//! transcript types; concrete HTTP drivers plug in behind the registry.

mod client;
pub mod mock;
mod openai_compat;
pub mod registry;
mod types;

pub use client::{ClientError, EventStream, LlmClient};
pub use openai_compat::OpenAiCompatClient;
pub use types::{
    Completion, CompletionRequest, Message, Role, StreamEvent, ToolCallAssembler, ToolCallRequest,
    ToolSchema, Usage,
};
