// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Session-manager scenarios: happy path, cancellation, busy rejection,
//! resume, and respond bookkeeping.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use dodo_config::Config;
use dodo_engine::{protocol::Event, EventSender, SessionManager, SessionRecord};
use dodo_model::mock::ScriptedClient;
use dodo_model::{LlmClient, Role, StreamEvent};
use dodo_retrieval::{HashEmbedder, KeywordIndex, RetrievalEngine, Store};
use dodo_tools::{Tool, ToolCall, ToolCategory, ToolMeta, ToolOutput};

struct SleepyTool;

#[async_trait]
impl Tool for SleepyTool {
    fn name(&self) -> &str {
        "sleepy"
    }
    fn description(&self) -> &str {
        "sleeps for two seconds"
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object"})
    }
    fn meta(&self) -> ToolMeta {
        ToolMeta::for_category(ToolCategory::Other)
    }
    async fn execute(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolOutput {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => ToolOutput::err(&call.id, "cancelled"),
            _ = tokio::time::sleep(Duration::from_secs(2)) => ToolOutput::ok(&call.id, "slept"),
        }
    }
}

struct Fixture {
    dir: tempfile::TempDir,
    manager: Arc<SessionManager>,
    events: mpsc::Receiver<Event>,
}

fn fixture(scripts: Vec<Vec<StreamEvent>>, with_sleepy: bool) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    fixture_at(dir, scripts, with_sleepy)
}

fn fixture_at(
    dir: tempfile::TempDir,
    scripts: Vec<Vec<StreamEvent>>,
    with_sleepy: bool,
) -> Fixture {
    let store = Arc::new(Store::open(&dir.path().join(".dodo/index.db")).unwrap());
    let engine = Arc::new(RetrievalEngine::new(
        store,
        Arc::new(KeywordIndex::new()),
        Arc::new(HashEmbedder::default()),
        dir.path(),
        1.2,
    ));
    let (sender, events) = EventSender::channel();
    let client: Arc<dyn LlmClient> = Arc::new(ScriptedClient::new(scripts));
    let mut manager = SessionManager::new(dir.path(), Config::default(), engine, sender)
        .with_storage_base(dir.path().join("state"))
        .with_client_factory(Box::new(move |_| Ok(Arc::clone(&client))));
    if with_sleepy {
        manager = manager.with_tool_installer(Box::new(|registry| {
            registry.register(SleepyTool);
        }));
    }
    Fixture {
        dir,
        manager: Arc::new(manager),
        events,
    }
}

fn drain(rx: &mut mpsc::Receiver<Event>) -> Vec<Event> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

fn load_record(fx: &Fixture, id: &str) -> SessionRecord {
    let dir = dodo_engine::sessions_dir(&fx.dir.path().join("state"), fx.dir.path());
    SessionRecord::load(&dir.join(format!("{id}.json"))).unwrap()
}

// ── Happy path (single turn) ──────────────────────────────────────────────────

#[tokio::test]
async fn happy_path_single_turn() {
    let mut fx = fixture(vec![ScriptedClient::text_script("hello")], false);
    fx.manager.start_session(Some("s1".into()), None).await;

    let startup = drain(&mut fx.events);
    assert!(
        startup
            .iter()
            .any(|e| matches!(e, Event::Status { state, session_id, .. }
                if state == "session_ready" && session_id.as_deref() == Some("s1"))),
        "{startup:?}"
    );

    fx.manager.user_message("s1", "hi").await;
    let events = drain(&mut fx.events);

    assert!(events
        .iter()
        .any(|e| matches!(e, Event::Status { state, .. } if state == "thinking")));
    assert!(events.iter().any(|e| matches!(e, Event::AssistantText { content, is_final, .. }
        if content == "hello" && *is_final)));
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::Done { summary, .. } if summary == "hello")));

    // Transcript persisted: system + user + assistant.
    let record = load_record(&fx, "s1");
    assert_eq!(record.transcript.len(), 3);
    assert_eq!(record.transcript[0].role, Role::System);
    assert_eq!(record.transcript[2].content, "hello");
    // Title fell back to the user message prefix.
    assert_eq!(record.title, "hi");
}

// ── Cancellation mid-tool ─────────────────────────────────────────────────────

#[tokio::test]
async fn cancellation_mid_tool_emits_cancelled_and_prefixes_next_message() {
    let mut fx = fixture(
        vec![
            ScriptedClient::tool_call_script(&[("t1", "sleepy", "{}")]),
            ScriptedClient::text_script("second run answer"),
        ],
        true,
    );
    fx.manager.start_session(Some("s1".into()), None).await;
    drain(&mut fx.events);

    let manager = Arc::clone(&fx.manager);
    let run = tokio::spawn(async move {
        manager.user_message("s1", "long task").await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    fx.manager.cancel_request("s1").await;
    run.await.unwrap();

    let events = drain(&mut fx.events);
    assert!(
        events
            .iter()
            .any(|e| matches!(e, Event::Cancelled { session_id } if session_id == "s1")),
        "{events:?}"
    );
    assert!(
        !events.iter().any(|e| matches!(e, Event::Done { .. })),
        "a cancelled run must not emit done"
    );

    // A subsequent user message carries the cancellation note.
    fx.manager.user_message("s1", "try again").await;
    drain(&mut fx.events);
    let record = load_record(&fx, "s1");
    let last_user = record
        .transcript
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .unwrap();
    assert!(last_user
        .content
        .starts_with("[System Note: The user cancelled"));
    assert!(last_user.content.contains("try again"));
}

// ── Busy rejection ────────────────────────────────────────────────────────────

#[tokio::test]
async fn second_user_message_while_running_is_rejected() {
    let mut fx = fixture(
        vec![ScriptedClient::tool_call_script(&[("t1", "sleepy", "{}")])],
        true,
    );
    fx.manager.start_session(Some("s1".into()), None).await;
    drain(&mut fx.events);

    let manager = Arc::clone(&fx.manager);
    let run = tokio::spawn(async move {
        manager.user_message("s1", "first").await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    fx.manager.user_message("s1", "second").await;

    let events = drain(&mut fx.events);
    assert!(
        events
            .iter()
            .any(|e| matches!(e, Event::Error { kind, .. } if kind == "run_in_flight")),
        "{events:?}"
    );

    fx.manager.cancel_request("s1").await;
    run.await.unwrap();
}

// ── Session lifecycle ─────────────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_session_id_is_rejected() {
    let mut fx = fixture(vec![], false);
    fx.manager.start_session(Some("dup".into()), None).await;
    drain(&mut fx.events);
    fx.manager.start_session(Some("dup".into()), None).await;
    let events = drain(&mut fx.events);
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::Error { kind, .. } if kind == "session_already_active")));
}

#[tokio::test]
async fn mismatched_repo_root_is_rejected() {
    let mut fx = fixture(vec![], false);
    fx.manager
        .start_session(None, Some("/definitely/not/this/repo".into()))
        .await;
    let events = drain(&mut fx.events);
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::Error { kind, .. } if kind == "invalid_request")));
}

#[tokio::test]
async fn unknown_session_user_message_is_an_error() {
    let mut fx = fixture(vec![], false);
    fx.manager.user_message("ghost", "hello?").await;
    let events = drain(&mut fx.events);
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::Error { kind, .. } if kind == "unknown_session")));
}

#[tokio::test]
async fn cancel_of_idle_or_unknown_session_is_a_noop() {
    let mut fx = fixture(vec![], false);
    fx.manager.start_session(Some("s1".into()), None).await;
    drain(&mut fx.events);
    fx.manager.cancel_request("s1").await;
    fx.manager.cancel_request("ghost").await;
    let events = drain(&mut fx.events);
    assert!(
        !events.iter().any(|e| matches!(e, Event::Cancelled { .. })),
        "idle cancel must not emit cancelled: {events:?}"
    );
}

// ── Resume ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn persisted_session_resumes_with_history() {
    let fx = {
        let mut fx = fixture(vec![ScriptedClient::text_script("first answer")], false);
        fx.manager.start_session(Some("s1".into()), None).await;
        fx.manager.user_message("s1", "remember this").await;
        drain(&mut fx.events);
        fx
    };

    // A fresh manager over the same repo and state dir resumes the session.
    let mut fx2 = fixture_at(fx.dir, vec![], false);
    fx2.manager.start_session(Some("s1".into()), None).await;
    let events = drain(&mut fx2.events);

    let history = events.iter().find_map(|e| match e {
        Event::SessionHistory { messages, .. } => Some(messages.clone()),
        _ => None,
    });
    let history = history.expect("resume must replay history");
    let replayed: Vec<Value> = history.as_array().unwrap().clone();
    assert_eq!(replayed.len(), 3, "system + user + assistant");
}

#[tokio::test]
async fn fresh_session_gets_previous_session_summary() {
    let fx = {
        let mut fx = fixture(
            vec![ScriptedClient::tool_call_script(&[(
                "r1",
                "respond",
                r#"{"summary":"refactored the parser","files_changed":["src/p.rs"]}"#,
            )])],
            false,
        );
        fx.manager.start_session(Some("s1".into()), None).await;
        fx.manager.user_message("s1", "refactor").await;
        drain(&mut fx.events);
        fx
    };

    let mut fx2 = fixture_at(fx.dir, vec![], false);
    fx2.manager.start_session(Some("s2".into()), None).await;
    drain(&mut fx2.events);
    let record = load_record(&fx2, "s2");
    let context = record
        .transcript
        .iter()
        .find(|m| m.content.starts_with("Previous Session Context:"))
        .expect("previous summary must be injected");
    assert!(context.content.contains("refactored the parser"));
}

// ── Respond bookkeeping ───────────────────────────────────────────────────────

#[tokio::test]
async fn respond_records_summary_and_files_changed() {
    let mut fx = fixture(
        vec![ScriptedClient::tool_call_script(&[(
            "r1",
            "respond",
            r#"{"summary":"did the thing","files_changed":["src/a.rs","src/b.rs"]}"#,
        )])],
        false,
    );
    fx.manager.start_session(Some("s1".into()), None).await;
    drain(&mut fx.events);
    fx.manager.user_message("s1", "do the thing").await;

    let events = drain(&mut fx.events);
    let files = events.iter().find_map(|e| match e {
        Event::FilesChanged { files, .. } => Some(files.clone()),
        _ => None,
    });
    assert_eq!(files.unwrap(), vec!["src/a.rs", "src/b.rs"]);

    let record = load_record(&fx, "s1");
    assert_eq!(record.summary.as_deref(), Some("did the thing"));
}
