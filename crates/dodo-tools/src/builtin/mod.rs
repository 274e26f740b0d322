// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod plan;
mod read_span;
mod respond;
mod search_code;

pub use plan::PlanTool;
pub use read_span::ReadSpanTool;
pub use respond::RespondTool;
pub use search_code::SearchCodeTool;

use std::sync::Arc;

use tokio::sync::mpsc;

use dodo_retrieval::RetrievalEngine;

use crate::events::ToolEvent;
use crate::registry::ToolRegistry;

/// Register the built-in tool set for a session.
///
/// Returns the receiver half of the tool-event channel; the agent loop
/// drains it after each dispatch round.  Host-specific tools (edit, shell,
/// build) are registered by the caller on top of these.
pub fn register_builtin(
    registry: &mut ToolRegistry,
    engine: Arc<RetrievalEngine>,
) -> mpsc::Receiver<ToolEvent> {
    let (tx, rx) = mpsc::channel(16);
    registry.register(SearchCodeTool::new(Arc::clone(&engine)));
    registry.register(ReadSpanTool::new(engine));
    registry.register(PlanTool::new(tx));
    registry.register(RespondTool);
    rx
}
