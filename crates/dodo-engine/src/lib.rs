// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Session management and the NDJSON stdio protocol bridge.

pub mod bridge;
mod hook;
mod manager;
pub mod protocol;
mod session;

pub use bridge::{handle_command, run, EventSender, EVENT_CHANNEL_CAPACITY};
pub use hook::ChannelHook;
pub use manager::{ClientFactory, SessionManager, ToolInstaller};
pub use session::{latest_record, repo_hash, sessions_dir, Session, SessionRecord, DEFAULT_TITLE};
