//! Coordination substrate: the task registry.
//!
//! A small, persistent store of task coordination state - who claimed what,
//! which phase each task is in, dependency edges, the global completed set,
//! and blocker notes. Every mutation is written through to disk atomically
//! under the registry's lock; readers of the snapshot projection never see
//! a half-applied update.
//!
//! A task is "unblocked" iff every id in its dependency list is in the
//! completed set.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::persist;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub phase: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEntry {
    pub agent_id: String,
    pub phase: String,
    pub claimed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub transitions: Vec<TransitionRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockerEntry {
    pub task_id: String,
    pub blocker: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CoordinationState {
    #[serde(default)]
    tasks: BTreeMap<String, TaskEntry>,
    #[serde(default)]
    dependencies: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    completed: BTreeSet<String>,
    #[serde(default)]
    blockers: Vec<BlockerEntry>,
}

/// Minimal read-only projection of one task's coordination state, safe to
/// hand to agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_dependencies: Vec<String>,
    pub completed_tasks: Vec<String>,
    pub current_phase: String,
    pub blockers: Vec<String>,
}

/// Thread-safe task registry persisted as a single JSON document.
#[derive(Debug, Clone)]
pub struct TaskRegistry {
    state_file: PathBuf,
    state: Arc<Mutex<CoordinationState>>,
}

impl TaskRegistry {
    pub fn new(state_file: PathBuf) -> Self {
        let state = Self::load(&state_file);
        Self {
            state_file,
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn load(state_file: &PathBuf) -> CoordinationState {
        match persist::read_locked(state_file) {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "coordination store unreadable; starting fresh");
                CoordinationState::default()
            }),
            _ => CoordinationState::default(),
        }
    }

    pub fn register_task(
        &self,
        task_id: &str,
        agent_id: &str,
        phase: &str,
        dependencies: Vec<String>,
    ) -> std::io::Result<()> {
        let mut state = self.state.lock().expect("registry lock poisoned");
        state.tasks.insert(
            task_id.to_string(),
            TaskEntry {
                agent_id: agent_id.to_string(),
                phase: phase.to_string(),
                claimed_at: Utc::now(),
                completed_at: None,
                transitions: Vec::new(),
            },
        );
        if !dependencies.is_empty() {
            state.dependencies.insert(task_id.to_string(), dependencies);
        }
        self.save(&state)
    }

    pub fn update_phase(&self, task_id: &str, new_phase: &str) -> std::io::Result<()> {
        let mut state = self.state.lock().expect("registry lock poisoned");
        if let Some(task) = state.tasks.get_mut(task_id) {
            task.phase = new_phase.to_string();
            task.transitions.push(TransitionRecord {
                phase: new_phase.to_string(),
                timestamp: Utc::now(),
            });
            self.save(&state)?;
        }
        Ok(())
    }

    pub fn mark_completed(&self, task_id: &str) -> std::io::Result<()> {
        let mut state = self.state.lock().expect("registry lock poisoned");
        state.completed.insert(task_id.to_string());
        if let Some(task) = state.tasks.get_mut(task_id) {
            task.completed_at = Some(Utc::now());
        }
        self.save(&state)
    }

    pub fn add_blocker(&self, task_id: &str, blocker: &str) -> std::io::Result<()> {
        let mut state = self.state.lock().expect("registry lock poisoned");
        state.blockers.push(BlockerEntry {
            task_id: task_id.to_string(),
            blocker: blocker.to_string(),
            timestamp: Utc::now(),
        });
        self.save(&state)
    }

    /// Snapshot of one task: its dependency list, the subset of those
    /// dependencies already completed, current phase, and blocker notes.
    pub fn snapshot(&self, task_id: &str) -> TaskSnapshot {
        let state = self.state.lock().expect("registry lock poisoned");
        let dependencies = state
            .dependencies
            .get(task_id)
            .cloned()
            .unwrap_or_default();
        let completed_tasks = dependencies
            .iter()
            .filter(|d| state.completed.contains(*d))
            .cloned()
            .collect();
        let current_phase = state
            .tasks
            .get(task_id)
            .map(|t| t.phase.clone())
            .unwrap_or_else(|| "UNKNOWN".to_string());
        let blockers = state
            .blockers
            .iter()
            .filter(|b| b.task_id == task_id)
            .map(|b| b.blocker.clone())
            .collect();

        TaskSnapshot {
            task_dependencies: dependencies,
            completed_tasks,
            current_phase,
            blockers,
        }
    }

    pub fn is_unblocked(&self, task_id: &str) -> bool {
        let state = self.state.lock().expect("registry lock poisoned");
        state
            .dependencies
            .get(task_id)
            .map(|deps| deps.iter().all(|d| state.completed.contains(d)))
            .unwrap_or(true)
    }

    pub fn get_task(&self, task_id: &str) -> Option<TaskEntry> {
        self.state
            .lock()
            .expect("registry lock poisoned")
            .tasks
            .get(task_id)
            .cloned()
    }

    pub fn all_tasks(&self) -> BTreeMap<String, TaskEntry> {
        self.state
            .lock()
            .expect("registry lock poisoned")
            .tasks
            .clone()
    }

    fn save(&self, state: &CoordinationState) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(state).map_err(std::io::Error::other)?;
        persist::write_atomic(&self.state_file, &json)
    }
}
