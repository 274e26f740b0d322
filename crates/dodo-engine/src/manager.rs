// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The session multiplexer.
//!
//! Owns the id → session map, constructs agents (retrieval injected via
//! tools that close over the engine), persists transcripts, routes
//! cancellation, and reports everything through the event channel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dodo_config::{Config, ModelConfig};
use dodo_core::{load_rules, system_prompt, Agent, AgentError, HookBus};
use dodo_model::{LlmClient, Message, Role};
use dodo_retrieval::RetrievalEngine;
use dodo_tools::builtin::register_builtin;
use dodo_tools::ToolRegistry;

use crate::bridge::EventSender;
use crate::hook::ChannelHook;
use crate::protocol::Event;
use crate::session::{
    latest_record, sessions_dir, Session, SessionRecord, DEFAULT_TITLE,
};

/// Builds an LLM client from the model config (environment-aware).
pub type ClientFactory =
    Box<dyn Fn(&ModelConfig) -> anyhow::Result<Arc<dyn LlmClient>> + Send + Sync>;

/// Registers host tools (edit, shell, build runners) on top of the
/// built-ins when a session is constructed.
pub type ToolInstaller = Box<dyn Fn(&mut ToolRegistry) + Send + Sync>;

pub struct SessionManager {
    repo_root: PathBuf,
    config: StdMutex<Config>,
    engine: Arc<RetrievalEngine>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    events: EventSender,
    /// Base state directory (normally `~/.dodo`).
    storage_base: PathBuf,
    client_factory: ClientFactory,
    tool_installer: Option<ToolInstaller>,
    permission_granted: AtomicBool,
}

impl SessionManager {
    pub fn new(
        repo_root: impl Into<PathBuf>,
        config: Config,
        engine: Arc<RetrievalEngine>,
        events: EventSender,
    ) -> Self {
        let repo_root = repo_root.into();
        // A pre-existing .dodo directory counts as prior indexing consent.
        let permission = repo_root.join(".dodo").is_dir();
        let storage_base = dirs::home_dir()
            .map(|h| h.join(".dodo"))
            .unwrap_or_else(|| repo_root.join(".dodo"));
        Self {
            repo_root,
            config: StdMutex::new(config),
            engine,
            sessions: Mutex::new(HashMap::new()),
            events,
            storage_base,
            client_factory: Box::new(|model| dodo_model::registry::client_from_env(model)),
            tool_installer: None,
            permission_granted: AtomicBool::new(permission),
        }
    }

    pub fn with_storage_base(mut self, base: impl Into<PathBuf>) -> Self {
        self.storage_base = base.into();
        self
    }

    pub fn with_client_factory(mut self, factory: ClientFactory) -> Self {
        self.client_factory = factory;
        self
    }

    pub fn with_tool_installer(mut self, installer: ToolInstaller) -> Self {
        self.tool_installer = Some(installer);
        self
    }

    /// Override the indexing-permission state (the constructor infers it
    /// from `.dodo/` presence, which callers that create the directory
    /// themselves need to correct).
    pub fn with_permission(self, granted: bool) -> Self {
        self.permission_granted.store(granted, Ordering::SeqCst);
        self
    }

    pub fn events(&self) -> &EventSender {
        &self.events
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn permission_granted(&self) -> bool {
        self.permission_granted.load(Ordering::SeqCst)
    }

    fn sessions_dir(&self) -> PathBuf {
        sessions_dir(&self.storage_base, &self.repo_root)
    }

    fn error(&self, session_id: Option<&str>, kind: &str, message: impl Into<String>) {
        self.events.emit(Event::Error {
            session_id: session_id.map(String::from),
            kind: kind.into(),
            message: message.into(),
        });
    }

    async fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(id).cloned()
    }

    // ── start_session ─────────────────────────────────────────────────────────

    pub async fn start_session(&self, session_id: Option<String>, repo_root: Option<String>) {
        if let Some(requested) = repo_root.as_deref() {
            if Path::new(requested) != self.repo_root {
                self.error(
                    None,
                    "invalid_request",
                    format!(
                        "this engine serves {}, not {requested}",
                        self.repo_root.display()
                    ),
                );
                return;
            }
        }

        let id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        {
            let sessions = self.sessions.lock().await;
            if sessions.contains_key(&id) {
                self.error(Some(&id), "session_already_active", "session id is live");
                return;
            }
        }

        let agent = match self.build_agent() {
            Ok(agent) => agent,
            Err(e) => {
                self.events.emit(Event::SetupRequired {
                    message: format!("cannot construct an agent: {e}"),
                });
                return;
            }
        };
        let session = Arc::new(Session::new(id.clone(), self.repo_root.clone(), agent));

        let dir = self.sessions_dir();
        let persisted = dir.join(format!("{id}.json"));
        if persisted.is_file() {
            // Resume: replay the stored transcript into the fresh agent.
            match SessionRecord::load(&persisted) {
                Ok(record) => {
                    {
                        let mut agent = session.agent.lock().await;
                        for msg in &record.transcript {
                            agent.append_message(msg.clone());
                        }
                    }
                    *session.title.lock().unwrap_or_else(|p| p.into_inner()) =
                        record.title.clone();
                    *session.summary.lock().unwrap_or_else(|p| p.into_inner()) =
                        record.summary.clone();
                    self.events.emit(Event::SessionHistory {
                        session_id: id.clone(),
                        messages: serde_json::to_value(&record.transcript)
                            .unwrap_or(serde_json::Value::Null),
                    });
                }
                Err(e) => warn!(session = %id, "failed to load persisted session: {e}"),
            }
        } else {
            let mut agent = session.agent.lock().await;
            agent.append_message(Message::system(system_prompt(
                &self.repo_root,
                &self.engine.workspace_context(),
                load_rules(&self.repo_root).as_deref(),
            )));
            // Brand-new session: carry over the previous session's summary.
            if let Some(prev) = latest_record(&dir, &id) {
                if let Some(summary) = prev.summary.filter(|s| !s.is_empty()) {
                    agent.append_message(Message::system(format!(
                        "Previous Session Context: {summary}"
                    )));
                }
            }
        }

        self.sessions.lock().await.insert(id.clone(), Arc::clone(&session));

        // Persist immediately so a crash does not lose the handle.
        if let Err(e) = session.record().await.save(&dir) {
            warn!(session = %id, "initial persist failed: {e}");
        }

        self.events.emit(Event::Status {
            session_id: Some(id.clone()),
            state: "session_ready".into(),
            message: None,
        });
        if !self.permission_granted() {
            self.events.emit(Event::ProjectPermissionRequired {
                session_id: id,
                repo_root: self.repo_root.to_string_lossy().to_string(),
            });
        }
    }

    fn build_agent(&self) -> anyhow::Result<Agent> {
        let config = self.config.lock().unwrap_or_else(|p| p.into_inner()).clone();
        let mut registry = ToolRegistry::new();
        let plan_events = register_builtin(&mut registry, Arc::clone(&self.engine));
        if let Some(installer) = &self.tool_installer {
            installer(&mut registry);
        }
        let client = (self.client_factory)(&config.model)?;
        Ok(Agent::new(
            client,
            Arc::new(registry),
            config.agent,
            plan_events,
        )?)
    }

    // ── user_message ──────────────────────────────────────────────────────────

    pub async fn user_message(&self, session_id: &str, message: &str) {
        let Some(session) = self.session(session_id).await else {
            self.error(Some(session_id), "unknown_session", "no such session");
            return;
        };

        let token = CancellationToken::new();
        if !session.try_begin_run(token.clone()) {
            self.error(
                Some(session_id),
                "run_in_flight",
                "a run is already in progress for this session",
            );
            return;
        }

        let text = if session.last_run_cancelled.swap(false, Ordering::SeqCst) {
            format!(
                "[System Note: The user cancelled the previous request before it \
                 completed.]\n\n{message}"
            )
        } else {
            message.to_string()
        };

        let mut hooks = HookBus::new();
        hooks.add(Arc::new(ChannelHook::new(
            session_id.to_string(),
            self.events.clone(),
        )));

        let result = {
            let mut agent = session.agent.lock().await;
            agent.append_message(Message::user(text));
            agent.run(&token, &hooks).await
        };

        match result {
            Ok(()) => self.finalize_run(&session).await,
            Err(e) if e.is_cancelled() => {
                // The cancel path already emitted `cancelled`; the run itself
                // counts as handled.
                debug!(session = %session_id, "run cancelled");
            }
            Err(e) => self.report_run_error(session_id, e),
        }

        self.derive_title(&session).await;
        if let Err(e) = session.record().await.save(&self.sessions_dir()) {
            warn!(session = %session_id, "persist failed: {e}");
        }
        session.end_run();
    }

    fn report_run_error(&self, session_id: &str, err: AgentError) {
        match err.root() {
            AgentError::SoftCap { kind } => {
                self.error(Some(session_id), "soft_cap", kind.guidance());
            }
            AgentError::Budget { .. } => {
                self.error(Some(session_id), "budget", err.to_string());
            }
            _ => self.error(Some(session_id), "agent_error", err.to_string()),
        }
    }

    /// Post-run bookkeeping: pull the `respond` result out of the
    /// transcript and record summary plus changed files.
    async fn finalize_run(&self, session: &Arc<Session>) {
        let agent = session.agent.lock().await;
        let transcript = &agent.state().transcript;

        let respond_id = transcript.iter().rev().find_map(|m| {
            m.tool_calls
                .iter()
                .find(|tc| tc.name == "respond")
                .map(|tc| tc.id.clone())
        });
        let Some(respond_id) = respond_id else {
            return;
        };
        let Some(result_msg) = transcript.iter().rev().find(|m| {
            m.role == Role::Tool && m.tool_call_id.as_deref() == Some(respond_id.as_str())
        }) else {
            return;
        };
        if result_msg.content.starts_with("ERROR:") {
            return;
        }
        let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&result_msg.content) else {
            return;
        };

        if let Some(summary) = parsed.get("summary").and_then(|v| v.as_str()) {
            *session.summary.lock().unwrap_or_else(|p| p.into_inner()) =
                Some(summary.to_string());
        }
        let files: Vec<String> = parsed
            .get("files_changed")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        if !files.is_empty() {
            self.events.emit(Event::FilesChanged {
                session_id: session.id.clone(),
                files,
            });
        }
    }

    /// Title fallback: the first 50 characters of the first user message.
    /// (An LLM summarizer may overwrite this; the fallback is the floor.)
    async fn derive_title(&self, session: &Arc<Session>) {
        let needs_title = {
            let title = session.title.lock().unwrap_or_else(|p| p.into_inner());
            *title == DEFAULT_TITLE
        };
        if !needs_title {
            return;
        }
        let agent = session.agent.lock().await;
        let Some(first_user) = agent
            .state()
            .transcript
            .iter()
            .find(|m| m.role == Role::User)
        else {
            return;
        };
        let title: String = first_user.content.chars().take(50).collect();
        if !title.is_empty() {
            *session.title.lock().unwrap_or_else(|p| p.into_inner()) = title;
        }
    }

    // ── cancel_request ────────────────────────────────────────────────────────

    pub async fn cancel_request(&self, session_id: &str) {
        let Some(session) = self.session(session_id).await else {
            debug!(session = %session_id, "cancel for unknown session ignored");
            return;
        };
        if session.request_cancel() {
            self.events.emit(Event::Cancelled {
                session_id: session_id.to_string(),
            });
        } else {
            debug!(session = %session_id, "cancel with no run in flight ignored");
        }
    }

    // ── configuration ─────────────────────────────────────────────────────────

    pub async fn reload_config(&self, session_id: &str) {
        let Some(session) = self.session(session_id).await else {
            self.error(Some(session_id), "unknown_session", "no such session");
            return;
        };
        let fresh = match dodo_config::load(&self.repo_root, None) {
            Ok(cfg) => cfg,
            Err(e) => {
                self.error(Some(session_id), "config_error", e.to_string());
                return;
            }
        };
        dodo_config::apply_env(&fresh);
        let client = match (self.client_factory)(&fresh.model) {
            Ok(client) => client,
            Err(e) => {
                self.error(Some(session_id), "config_error", e.to_string());
                return;
            }
        };
        *self.config.lock().unwrap_or_else(|p| p.into_inner()) = fresh;
        session.agent.lock().await.set_client(client);
        self.events.emit(Event::ConfigReloaded {
            session_id: session_id.to_string(),
        });
    }

    pub async fn save_config(&self, value: serde_json::Value) {
        let config: Config = match serde_json::from_value(value) {
            Ok(cfg) => cfg,
            Err(e) => {
                self.error(None, "config_error", format!("invalid config: {e}"));
                return;
            }
        };
        if let Err(e) = dodo_config::save_project(&self.repo_root, &config) {
            self.error(None, "config_error", e.to_string());
            return;
        }
        dodo_config::apply_env(&config);
        let as_value = serde_json::to_value(&config).unwrap_or(serde_json::Value::Null);
        *self.config.lock().unwrap_or_else(|p| p.into_inner()) = config;
        self.events.emit(Event::ConfigLoaded { config: as_value });
    }

    pub async fn get_config(&self) {
        let config = self.config.lock().unwrap_or_else(|p| p.into_inner()).clone();
        self.events.emit(Event::ConfigLoaded {
            config: serde_json::to_value(&config).unwrap_or(serde_json::Value::Null),
        });
    }

    pub async fn project_permission(&self, session_id: &str, granted: bool) {
        self.permission_granted.store(granted, Ordering::SeqCst);
        self.events.emit(Event::Status {
            session_id: Some(session_id.to_string()),
            state: if granted {
                "project_permission_granted"
            } else {
                "project_permission_denied"
            }
            .into(),
            message: None,
        });
    }

    /// Cancel all in-flight runs (stdin EOF teardown).
    pub async fn shutdown(&self) {
        let sessions = self.sessions.lock().await;
        for session in sessions.values() {
            session.request_cancel();
        }
    }
}
