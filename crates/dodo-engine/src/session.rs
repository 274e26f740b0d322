// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use dodo_core::Agent;
use dodo_model::Message;

pub const DEFAULT_TITLE: &str = "Untitled";

/// Stable directory key for a repository path.
pub fn repo_hash(repo: &Path) -> String {
    let digest = Sha256::digest(repo.to_string_lossy().as_bytes());
    hex::encode(&digest[..8])
}

/// `~/.dodo/sessions/<repo-hash>` (home resolution left to the caller for
/// testability).
pub fn sessions_dir(base: &Path, repo: &Path) -> PathBuf {
    base.join("sessions").join(repo_hash(repo))
}

/// The on-disk form of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub repo: String,
    pub title: String,
    #[serde(default)]
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub transcript: Vec<Message>,
}

impl SessionRecord {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, dir: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.json", self.id));
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Most recent persisted session record in `dir`, excluding `skip_id`.
/// Feeds the "Previous Session Context" injection for fresh sessions.
pub fn latest_record(dir: &Path, skip_id: &str) -> Option<SessionRecord> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut latest: Option<SessionRecord> = None;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().map(|e| e != "json").unwrap_or(true) {
            continue;
        }
        let Ok(record) = SessionRecord::load(&path) else {
            continue;
        };
        if record.id == skip_id {
            continue;
        }
        let newer = latest
            .as_ref()
            .map(|l| record.updated_at > l.updated_at)
            .unwrap_or(true);
        if newer {
            latest = Some(record);
        }
    }
    latest
}

/// Live per-session state owned by the manager.
///
/// Invariants: at most one in-flight run (`running`), and the cancel
/// handle is present exactly while a run is in flight.
pub struct Session {
    pub id: String,
    pub repo_root: PathBuf,
    pub created_at: DateTime<Utc>,
    pub title: StdMutex<String>,
    pub summary: StdMutex<Option<String>>,
    pub agent: Mutex<Agent>,
    pub cancel: StdMutex<Option<CancellationToken>>,
    pub running: AtomicBool,
    pub last_run_cancelled: AtomicBool,
}

impl Session {
    pub fn new(id: String, repo_root: PathBuf, agent: Agent) -> Self {
        Self {
            id,
            repo_root,
            created_at: Utc::now(),
            title: StdMutex::new(DEFAULT_TITLE.to_string()),
            summary: StdMutex::new(None),
            agent: Mutex::new(agent),
            cancel: StdMutex::new(None),
            running: AtomicBool::new(false),
            last_run_cancelled: AtomicBool::new(false),
        }
    }

    /// Try to mark the session running.  Returns false when a run is
    /// already in flight (the caller fails fast).
    pub fn try_begin_run(&self, token: CancellationToken) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.cancel.lock().unwrap_or_else(|p| p.into_inner()) = Some(token);
        true
    }

    /// Clear the running flag and the cancel handle.
    pub fn end_run(&self) {
        *self.cancel.lock().unwrap_or_else(|p| p.into_inner()) = None;
        self.running.store(false, Ordering::SeqCst);
    }

    /// Invoke the stored cancel handle, if any.  Returns whether a run was
    /// actually cancelled.
    pub fn request_cancel(&self) -> bool {
        let guard = self.cancel.lock().unwrap_or_else(|p| p.into_inner());
        match guard.as_ref() {
            Some(token) => {
                token.cancel();
                self.last_run_cancelled.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Snapshot the session into its persistent record.
    pub async fn record(&self) -> SessionRecord {
        let agent = self.agent.lock().await;
        SessionRecord {
            id: self.id.clone(),
            repo: self.repo_root.to_string_lossy().to_string(),
            title: self.title.lock().unwrap_or_else(|p| p.into_inner()).clone(),
            summary: self
                .summary
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .clone(),
            created_at: self.created_at,
            updated_at: Utc::now(),
            transcript: agent.state().transcript.clone(),
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
