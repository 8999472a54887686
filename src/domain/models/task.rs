//! Task domain model.
//!
//! Tasks are the children of a job in every reconciliation tree. A replaced
//! task keeps its lineage through `original_id`, `resubmit_of` and
//! `resubmit_number`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reason codes attached to task status changes.
pub mod reason {
    pub const NORMAL: &str = "normal";
    pub const FAILED: &str = "failed";
    pub const KILLED: &str = "killed";
    pub const SCALED_DOWN: &str = "scaled_down";
    pub const STUCK_IN_STATE: &str = "stuck_in_state";
    pub const STUCK_IN_KILLING_STATE: &str = "stuck_in_killing_state";
    pub const LOST: &str = "lost";
    pub const RETRIES_EXHAUSTED: &str = "retries_exhausted";
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created in the reference model, not yet handed to an agent
    #[default]
    Accepted,
    /// Placed and launched on an agent
    Launched,
    /// Agent is starting the container
    StartInitiated,
    /// Container is running
    Started,
    /// Kill requested
    KillInitiated,
    /// Terminal
    Finished,
}

impl TaskState {
    /// Every state, in lifecycle order.
    pub const ALL: [Self; 6] = [
        Self::Accepted,
        Self::Launched,
        Self::StartInitiated,
        Self::Started,
        Self::KillInitiated,
        Self::Finished,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Launched => "launched",
            Self::StartInitiated => "start_initiated",
            Self::Started => "started",
            Self::KillInitiated => "kill_initiated",
            Self::Finished => "finished",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "accepted" => Some(Self::Accepted),
            "launched" => Some(Self::Launched),
            "start_initiated" | "startinitiated" => Some(Self::StartInitiated),
            "started" => Some(Self::Started),
            "kill_initiated" | "killinitiated" => Some(Self::KillInitiated),
            "finished" => Some(Self::Finished),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished)
    }

    /// Kill already requested or task already done.
    pub fn is_terminating(&self) -> bool {
        matches!(self, Self::KillInitiated | Self::Finished)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
    pub reason_code: String,
    pub reason_message: String,
    /// Wall clock time (ms since epoch) the state was entered
    pub timestamp_ms: u64,
}

impl TaskStatus {
    pub fn new(state: TaskState, reason_code: impl Into<String>, reason_message: impl Into<String>, timestamp_ms: u64) -> Self {
        Self {
            state,
            reason_code: reason_code.into(),
            reason_message: reason_message.into(),
            timestamp_ms,
        }
    }
}

/// A task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub job_id: String,
    pub version: u64,
    /// Batch slot; `None` for service tasks
    pub index: Option<u32>,
    /// Id of the first task in the replacement chain
    pub original_id: String,
    /// Task this one replaced
    pub resubmit_of: Option<String>,
    /// Number of replacements in the chain so far
    pub resubmit_number: u32,
    pub status: TaskStatus,
    #[serde(default)]
    pub status_history: Vec<TaskStatus>,
}

impl Task {
    /// Create a fresh accepted task with a generated id.
    pub fn new(job_id: impl Into<String>, index: Option<u32>, now_ms: u64) -> Self {
        let job_id = job_id.into();
        let id = format!("{job_id}-{}", Uuid::new_v4());
        Self {
            original_id: id.clone(),
            id,
            job_id,
            version: 0,
            index,
            resubmit_of: None,
            resubmit_number: 0,
            status: TaskStatus::new(TaskState::Accepted, reason::NORMAL, "Task accepted", now_ms),
            status_history: Vec::new(),
        }
    }

    /// Create the replacement of a finished task, preserving its lineage.
    pub fn replacing(previous: &Self, now_ms: u64) -> Self {
        let mut task = Self::new(previous.job_id.clone(), previous.index, now_ms);
        task.original_id = previous.original_id.clone();
        task.resubmit_of = Some(previous.id.clone());
        task.resubmit_number = previous.resubmit_number + 1;
        task
    }

    pub fn state(&self) -> TaskState {
        self.status.state
    }

    pub fn is_terminating(&self) -> bool {
        self.status.state.is_terminating()
    }

    /// New version of this task with `status`, the old status pushed to history.
    #[must_use]
    pub fn with_status(&self, status: TaskStatus) -> Self {
        let mut status_history = self.status_history.clone();
        status_history.push(self.status.clone());
        Self {
            version: self.version + 1,
            status,
            status_history,
            ..self.clone()
        }
    }
}
