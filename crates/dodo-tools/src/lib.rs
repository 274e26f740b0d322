// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Tool abstraction and built-in tools for the dodo runtime.

pub mod builtin;
pub mod events;
pub mod plan;
mod registry;
mod tool;

pub use registry::{validate_args, ToolRegistry, ToolSchema};
pub use tool::{Tool, ToolCall, ToolCategory, ToolMeta, ToolOutput};
