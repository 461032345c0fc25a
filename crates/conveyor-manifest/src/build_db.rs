//! Boundary to the external build database (CIDB).
//!
//! The database answers the cheap bulk question "which of a master's
//! sub-builds have reported in, and which of those have finished"; per-builder
//! detail still comes from the blob store. Production wires a real client in;
//! tests use the in-memory fake.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildDbError {
    #[error("build database unavailable: {0}")]
    Unavailable(String),

    #[error("unknown master build id {0}")]
    UnknownBuild(i64),
}

pub type Result<T> = std::result::Result<T, BuildDbError>;

/// Coarse per-builder state as the database sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    /// The builder started and is still running.
    Inflight,
    /// The builder reached a terminal state.
    Completed,
}

pub trait BuildDatabase: Send + Sync {
    /// Coarse state of every sub-build of `master_build_id` that has
    /// reported in. Builders absent from the map never started.
    fn builder_states(&self, master_build_id: i64) -> Result<HashMap<String, BuildState>>;
}

/// In-memory fake keyed by master build id.
#[derive(Debug, Default)]
pub struct MemoryBuildDatabase {
    states: Mutex<HashMap<i64, HashMap<String, BuildState>>>,
}

impl MemoryBuildDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a sub-build of `master_build_id` started running.
    pub fn mark_started(&self, master_build_id: i64, builder: &str) {
        self.set(master_build_id, builder, BuildState::Inflight);
    }

    /// Record that a sub-build of `master_build_id` finished.
    pub fn mark_completed(&self, master_build_id: i64, builder: &str) {
        self.set(master_build_id, builder, BuildState::Completed);
    }

    fn set(&self, master_build_id: i64, builder: &str, state: BuildState) {
        self.states
            .lock()
            .expect("build db mutex")
            .entry(master_build_id)
            .or_default()
            .insert(builder.to_string(), state);
    }
}

impl BuildDatabase for MemoryBuildDatabase {
    fn builder_states(&self, master_build_id: i64) -> Result<HashMap<String, BuildState>> {
        let states = self.states.lock().expect("build db mutex");
        Ok(states.get(&master_build_id).cloned().unwrap_or_default())
    }
}
