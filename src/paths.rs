//! Directory layout for orchestrator state.
//!
//! ```text
//! <repo>/.orchestrator/
//!   audit.jsonl              process-global tool audit log
//!   state.json               coordination store (task registry)
//!   current                  id of the current session
//!   sessions/<session_id>/
//!     state.json             workflow instance state
//!     log.jsonl              workflow event log
//! ```

use std::path::{Path, PathBuf};

pub const ORCHESTRATOR_DIR: &str = ".orchestrator";

/// Resolves every path the orchestrator persists to, scoped to a working
/// directory and a session.
#[derive(Debug, Clone)]
pub struct OrchestratorPaths {
    base_dir: PathBuf,
    session_id: String,
}

impl OrchestratorPaths {
    pub fn new(base_dir: &Path, session_id: Option<String>) -> Self {
        let session_id = session_id.unwrap_or_else(new_session_id);
        Self {
            base_dir: base_dir.to_path_buf(),
            session_id,
        }
    }

    /// Reuse the session recorded in `.orchestrator/current`, or start a
    /// fresh one if there is none.
    pub fn current_or_new(base_dir: &Path) -> Self {
        let session_id = read_current_session(base_dir);
        Self::new(base_dir, session_id)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn root(&self) -> PathBuf {
        self.base_dir.join(ORCHESTRATOR_DIR)
    }

    pub fn session_dir(&self) -> PathBuf {
        self.root().join("sessions").join(&self.session_id)
    }

    /// Workflow instance state for this session.
    pub fn state_file(&self) -> PathBuf {
        self.session_dir().join("state.json")
    }

    /// Workflow event log for this session.
    pub fn log_file(&self) -> PathBuf {
        self.session_dir().join("log.jsonl")
    }

    /// Process-global tool audit log.
    pub fn audit_file(&self) -> PathBuf {
        self.root().join("audit.jsonl")
    }

    /// Coordination store shared across sessions.
    pub fn coordination_file(&self) -> PathBuf {
        self.root().join("state.json")
    }

    pub fn current_file(&self) -> PathBuf {
        self.root().join("current")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.session_dir())
    }

    /// Record this session as current.
    pub fn write_current(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.root())?;
        std::fs::write(self.current_file(), &self.session_id)
    }
}

fn read_current_session(base_dir: &Path) -> Option<String> {
    let current = base_dir.join(ORCHESTRATOR_DIR).join("current");
    let id = std::fs::read_to_string(current).ok()?;
    let id = id.trim().to_string();
    if id.is_empty() { None } else { Some(id) }
}

/// Short session ids, like `s_3fa9c1d2`.
pub fn new_session_id() -> String {
    format!("s_{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}
