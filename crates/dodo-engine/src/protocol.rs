// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Wire protocol between the engine and an external client.
//!
//! Newline-delimited JSON, one message per line.  Every message carries a
//! `type` discriminator; commands carry `session_id` when scoped to a
//! session and events mirror it.
//!
//! # Typical session flow
//!
//! ```text
//! Client                              Engine
//!    │                                   │
//!    │── start_session {repo_root} ─────►│  status: session_ready
//!    │                                   │
//!    │── user_message {message} ────────►│  status: thinking
//!    │◄─ assistant_text {final: false} ───│  ... streaming deltas ...
//!    │◄─ tool_event {phase: start} ───────│  (if tools requested)
//!    │◄─ activity {state: started} ───────│
//!    │◄─ tool_output {chunk} ─────────────│
//!    │◄─ token_usage ─────────────────────│
//!    │◄─ done {summary} ──────────────────│
//!    │                                   │
//!    │── cancel_request ────────────────►│  cancelled   (any time mid-run)
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Client → engine commands ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Create a new session or resume a persisted one.
    StartSession {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        repo_root: Option<String>,
        #[serde(default)]
        meta: Option<Value>,
        #[serde(default)]
        config: Option<Value>,
    },

    /// Submit a user message to a session.
    UserMessage {
        session_id: String,
        message: String,
        #[serde(default)]
        request_id: Option<String>,
    },

    /// Cancel the session's in-flight run.  A no-op for idle or unknown
    /// sessions.
    CancelRequest { session_id: String },

    /// Persist configuration to the project's `.dodo/config.json`.
    SaveConfig {
        #[serde(default)]
        session_id: Option<String>,
        config: Value,
    },

    /// Request the effective configuration.
    GetConfig {
        #[serde(default)]
        session_id: Option<String>,
    },

    /// Reload configuration from disk and hot-swap the session's LLM
    /// client.  The transcript is preserved.
    ReloadConfig { session_id: String },

    /// Grant or deny indexing permission for a repo without `.dodo/`.
    ProjectPermission { session_id: String, granted: bool },
}

// ── Engine → client events ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Coarse lifecycle updates: `session_ready`, `thinking`, `retrying`.
    Status {
        #[serde(default)]
        session_id: Option<String>,
        state: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Assistant text: streaming deltas (`final: false`) and the complete
    /// turn text (`final: true`).
    AssistantText {
        session_id: String,
        content: String,
        #[serde(rename = "final")]
        is_final: bool,
    },

    /// Tool-call lifecycle transition (`phase`: `start` | `end`).
    ToolEvent {
        session_id: String,
        call_id: String,
        tool: String,
        phase: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },

    /// Fine-grained activity record for one tool invocation.
    Activity {
        session_id: String,
        call_id: String,
        tool: String,
        state: String,
    },

    /// A chunk of tool output.
    ToolOutput {
        session_id: String,
        call_id: String,
        tool: String,
        chunk: String,
    },

    /// Repository files changed by the run (from `respond`).
    FilesChanged {
        session_id: String,
        files: Vec<String>,
    },

    /// Cumulative token usage after a model turn.
    TokenUsage {
        session_id: String,
        input_tokens: u32,
        output_tokens: u32,
        total_tokens: u32,
    },

    /// Context-management notices (budget warnings, compression).
    Context { session_id: String, message: String },

    /// The session's mini-plan was created or revised.
    ProjectPlan { session_id: String, plan: Value },

    /// The run completed.
    Done { session_id: String, summary: String },

    /// An error event.  `kind` distinguishes advisory conditions
    /// (`soft_cap`) from hard failures (`agent_error`, `invalid_command`).
    Error {
        #[serde(default)]
        session_id: Option<String>,
        kind: String,
        message: String,
    },

    /// The engine needs configuration before it can serve requests.
    SetupRequired { message: String },

    /// Effective configuration, in response to `get_config`/`save_config`.
    ConfigLoaded { config: Value },

    /// Configuration was reloaded into the session.
    ConfigReloaded { session_id: String },

    /// The in-flight run was cancelled.
    Cancelled { session_id: String },

    /// Replayed transcript for a resumed session.
    SessionHistory { session_id: String, messages: Value },

    /// First contact with a repo that has no `.dodo/` directory yet.
    ProjectPermissionRequired {
        session_id: String,
        repo_root: String,
    },
}

/// Decode one NDJSON line into a command.
pub fn decode_command(line: &str) -> Result<Command, serde_json::Error> {
    serde_json::from_str(line)
}

/// Encode an event as one NDJSON line (no trailing newline).
pub fn encode_event(event: &Event) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_session_decodes_with_minimal_fields() {
        let cmd = decode_command(r#"{"type":"start_session"}"#).unwrap();
        assert!(matches!(
            cmd,
            Command::StartSession {
                session_id: None,
                repo_root: None,
                ..
            }
        ));
    }

    #[test]
    fn user_message_round_trips() {
        let cmd = Command::UserMessage {
            session_id: "s1".into(),
            message: "hello".into(),
            request_id: Some("r1".into()),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains(r#""type":"user_message""#));
        let back = decode_command(&json).unwrap();
        match back {
            Command::UserMessage {
                session_id,
                message,
                request_id,
            } => {
                assert_eq!(session_id, "s1");
                assert_eq!(message, "hello");
                assert_eq!(request_id.as_deref(), Some("r1"));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_command_type_is_a_decode_error() {
        assert!(decode_command(r#"{"type":"warp_drive"}"#).is_err());
        assert!(decode_command("not json at all").is_err());
    }

    #[test]
    fn assistant_text_serialises_final_keyword() {
        let ev = Event::AssistantText {
            session_id: "s1".into(),
            content: "hi".into(),
            is_final: true,
        };
        let json = encode_event(&ev).unwrap();
        assert!(json.contains(r#""final":true"#), "{json}");
        assert!(json.contains(r#""type":"assistant_text""#));
    }

    #[test]
    fn event_type_tags_are_snake_case() {
        let ev = Event::ProjectPermissionRequired {
            session_id: "s".into(),
            repo_root: "/r".into(),
        };
        let json = encode_event(&ev).unwrap();
        assert!(json.contains(r#""type":"project_permission_required""#));
    }

    #[test]
    fn error_event_round_trips_kind() {
        let ev = Event::Error {
            session_id: None,
            kind: "soft_cap".into(),
            message: "advice".into(),
        };
        let json = encode_event(&ev).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        match back {
            Event::Error { kind, .. } => assert_eq!(kind, "soft_cap"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn cancel_request_decodes() {
        let cmd = decode_command(r#"{"type":"cancel_request","session_id":"abc"}"#).unwrap();
        assert!(matches!(cmd, Command::CancelRequest { session_id } if session_id == "abc"));
    }
}
