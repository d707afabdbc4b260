use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Child;

use crate::scheduler::{JobId, SchedulerClient};
use crate::script::ScriptFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Waiting,
    Dispatched,
    Done,
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemStatus::Waiting => write!(f, "waiting"),
            ItemStatus::Dispatched => write!(f, "dispatched"),
            ItemStatus::Done => write!(f, "done"),
        }
    }
}

/// Whatever is running a dispatched item, and how to stop it.
#[derive(Debug)]
pub enum JobHandle {
    /// Local subprocess running the per-item wrapper
    Process(Child),
    /// Job submitted to the batch scheduler for this item alone, cancelled
    /// with the scheduler's cancel command. Neither built-in strategy
    /// creates one: direct dispatch owns local processes and array claims
    /// are `ArrayTask`s. It is the handle for per-item submissions.
    SchedulerJob(JobId),
    /// Claimed over the dispenser by a task of the given array batch.
    /// Tasks are not individually addressable, so this is never cancelled
    /// on its own; stopping the spool cancels the whole batch.
    ArrayTask(Option<JobId>),
}

impl JobHandle {
    /// Best-effort cancellation. Failures are logged, never returned.
    pub async fn terminate(self, client: &SchedulerClient) {
        match self {
            JobHandle::Process(mut child) => {
                let pid = child.id();
                if let Err(e) = child.kill().await {
                    tracing::warn!(pid = ?pid, error = %e, "Failed to terminate job process");
                } else {
                    tracing::debug!(pid = ?pid, "Terminated job process");
                }
            }
            JobHandle::SchedulerJob(job_id) => client.cancel(&job_id).await,
            JobHandle::ArrayTask(batch) => {
                tracing::debug!(
                    batch = ?batch.as_ref().map(JobId::as_str),
                    "Array task cannot be cancelled individually"
                );
            }
        }
    }

    /// Batch an array task belongs to, if this is one.
    pub fn array_batch(&self) -> Option<Option<&JobId>> {
        match self {
            JobHandle::ArrayTask(batch) => Some(batch.as_ref()),
            _ => None,
        }
    }
}

/// Resources owned by an item while it is dispatched.
#[derive(Debug)]
pub struct Dispatch {
    pub handle: JobHandle,
    pub script: Option<ScriptFile>,
    pub dispatched_at: DateTime<Utc>,
}

impl Dispatch {
    pub fn new(handle: JobHandle) -> Self {
        Self {
            handle,
            script: None,
            dispatched_at: Utc::now(),
        }
    }

    pub fn with_script(mut self, script: ScriptFile) -> Self {
        self.script = Some(script);
        self
    }
}

/// Processing state. The handle lives inside `Dispatched`, so a waiting item
/// can never hold one and a dispatched item always does.
#[derive(Debug)]
pub enum ItemState {
    Waiting,
    Dispatched(Dispatch),
    Done,
}

impl ItemState {
    pub fn status(&self) -> ItemStatus {
        match self {
            ItemState::Waiting => ItemStatus::Waiting,
            ItemState::Dispatched(_) => ItemStatus::Dispatched,
            ItemState::Done => ItemStatus::Done,
        }
    }
}

/// One file to be processed.
#[derive(Debug)]
pub struct WorkItem {
    path: PathBuf,
    pub state: ItemState,
    pub enqueued_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: ItemState::Waiting,
            enqueued_at: Utc::now(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn status(&self) -> ItemStatus {
        self.state.status()
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self.state, ItemState::Waiting)
    }

    pub fn handle(&self) -> Option<&JobHandle> {
        match &self.state {
            ItemState::Dispatched(dispatch) => Some(&dispatch.handle),
            _ => None,
        }
    }

    pub fn handle_mut(&mut self) -> Option<&mut JobHandle> {
        match &mut self.state {
            ItemState::Dispatched(dispatch) => Some(&mut dispatch.handle),
            _ => None,
        }
    }

    /// Move a waiting item to `Dispatched`. Hands the dispatch back if the
    /// item is not waiting.
    pub fn dispatch(&mut self, dispatch: Dispatch) -> Result<(), Dispatch> {
        if !self.is_waiting() {
            return Err(dispatch);
        }
        self.state = ItemState::Dispatched(dispatch);
        Ok(())
    }

    /// Move a dispatched item to `Done`, releasing what it owned.
    pub fn finish(&mut self) -> Option<Dispatch> {
        match std::mem::replace(&mut self.state, ItemState::Done) {
            ItemState::Dispatched(dispatch) => Some(dispatch),
            other => {
                self.state = other;
                None
            }
        }
    }
}
