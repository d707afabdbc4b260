use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::{DispatchStrategy, SpoolConfig, ThrottleWindow};
use crate::error::{Result, SpoolError};
use crate::queue::{Dispatch, JobHandle, Retired, SharedStore};
use crate::scheduler::{JobId, SchedulerClient};
use crate::script::ScriptFile;
use crate::spool::timer::{DelayClass, ThrottleTimer, TimerAction};
use crate::template::{self, TemplateSet};

const SCRIPT_PREFIX: &str = "qspool-";

/// What the coordinator is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Settling,
    Dispatching,
    Pausing,
    Stopped,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Idle => write!(f, "idle"),
            Phase::Settling => write!(f, "settling"),
            Phase::Dispatching => write!(f, "dispatching"),
            Phase::Pausing => write!(f, "pausing"),
            Phase::Stopped => write!(f, "stopped"),
        }
    }
}

/// Message types for the coordinator event loop
#[derive(Debug)]
pub enum CoordinatorMessage {
    /// An item was added to or removed from the store
    QueueChanged,
    /// Stop the coordinator. With `wait`, keep working until the store is
    /// empty first.
    Stop {
        wait: bool,
        done: oneshot::Sender<()>,
    },
}

/// One array submission covering the items waiting when it was made.
#[derive(Debug)]
pub struct DispatchBatch {
    pub id: JobId,
    pub size: usize,
    pub chunk_size: usize,
    pub wrapper: ScriptFile,
    pub submission: ScriptFile,
    pub submitted_at: DateTime<Utc>,
}

/// Decides when to launch work and when to reconcile it.
///
/// Runs as a single task; timer fires and queue notifications are handled
/// one at a time, and every external command runs outside the store lock.
pub struct Coordinator {
    store: SharedStore,
    client: SchedulerClient,
    templates: TemplateSet,
    strategy: DispatchStrategy,
    throttle: ThrottleWindow,
    script: PathBuf,
    scratch_dir: PathBuf,
    keep_scripts: bool,
    advertise_host: String,
    dispenser_port: Option<u16>,
    timer: ThrottleTimer,
    batch: Option<DispatchBatch>,
    phase: watch::Sender<Phase>,
}

impl Coordinator {
    pub fn new(
        config: &SpoolConfig,
        store: SharedStore,
        client: SchedulerClient,
        dispenser_port: Option<u16>,
    ) -> Result<(Self, watch::Receiver<Phase>)> {
        config.validate()?;
        let submission_template = match config.strategy {
            DispatchStrategy::Array => template::ARRAY_TEMPLATE,
            DispatchStrategy::Direct => template::DIRECT_TEMPLATE,
        };
        let (phase, phase_rx) = watch::channel(Phase::Idle);

        let coordinator = Self {
            store,
            client,
            templates: TemplateSet::from_config(&config.templates, submission_template),
            strategy: config.strategy,
            throttle: config.throttle,
            script: config.target_script()?.clone(),
            scratch_dir: config.scratch_dir.clone(),
            keep_scripts: config.keep_scripts,
            advertise_host: config.advertise_host.clone(),
            dispenser_port,
            timer: ThrottleTimer::new(&config.throttle),
            batch: None,
            phase,
        };
        Ok((coordinator, phase_rx))
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn batch(&self) -> Option<&DispatchBatch> {
        self.batch.as_ref()
    }

    pub fn timer(&self) -> &ThrottleTimer {
        &self.timer
    }

    /// Run the coordinator event loop until stopped or until every sender
    /// is gone.
    pub async fn run(mut self, mut message_rx: mpsc::Receiver<CoordinatorMessage>) {
        let mut draining: Option<oneshot::Sender<()>> = None;
        let mut drain_check = tokio::time::interval(self.throttle.settle);

        loop {
            tokio::select! {
                msg = message_rx.recv() => match msg {
                    Some(CoordinatorMessage::QueueChanged) => self.queue_changed().await,
                    Some(CoordinatorMessage::Stop { wait: true, done }) => {
                        tracing::info!("Draining queue before stopping");
                        if let Some(previous) = draining.replace(done) {
                            let _ = previous.send(());
                        }
                    }
                    Some(CoordinatorMessage::Stop { wait: false, done }) => {
                        self.stop_now().await;
                        let _ = done.send(());
                        if let Some(waiting) = draining.take() {
                            let _ = waiting.send(());
                        }
                        break;
                    }
                    None => {
                        self.stop_now().await;
                        break;
                    }
                },

                _ = self.timer.expired() => {
                    if let Some(action) = self.timer.fire() {
                        self.run_action(action).await;
                    }
                }

                _ = drain_check.tick(), if draining.is_some() => {
                    if self.store.lock().await.is_empty() {
                        self.stop_now().await;
                        if let Some(done) = draining.take() {
                            let _ = done.send(());
                        }
                        break;
                    }
                }
            }
        }

        tracing::info!("Coordinator stopped");
    }

    /// React to a store change: let the queue settle, then reconcile if work
    /// is in flight or dispatch if not.
    pub async fn queue_changed(&mut self) {
        let action = if self.work_in_flight().await {
            TimerAction::Update
        } else {
            TimerAction::Dispatch
        };
        self.timer.arm(DelayClass::Settle, action);
        self.publish_phase();
    }

    /// Run one timer action and re-arm.
    pub async fn run_action(&mut self, action: TimerAction) {
        match action {
            TimerAction::Update => self.update_cycle().await,
            TimerAction::Dispatch => self.dispatch_cycle().await,
        }
        self.rearm().await;
    }

    /// Launch waiting work under the configured strategy. Failures are logged
    /// and the cycle is skipped; the next fire retries.
    pub async fn dispatch_cycle(&mut self) {
        self.phase.send_replace(Phase::Dispatching);
        let result = match self.strategy {
            DispatchStrategy::Direct => self.dispatch_direct().await.map(|_| ()),
            DispatchStrategy::Array => self.dispatch_array().await,
        };
        if let Err(e) = result {
            match e {
                SpoolError::Template(_) => {
                    tracing::error!(error = %e, "Template error, skipping dispatch cycle")
                }
                _ => tracing::warn!(error = %e, "Dispatch cycle failed, will retry"),
            }
        }
    }

    /// Retire finished work under the configured strategy.
    pub async fn update_cycle(&mut self) {
        let retired = match self.strategy {
            DispatchStrategy::Direct => self.store.lock().await.reap_exited(),
            DispatchStrategy::Array => self.update_array().await,
        };
        for item in retired {
            let waited = item.dispatch.dispatched_at - item.enqueued_at;
            match item.exit {
                Some(status) if !status.success() => tracing::warn!(
                    path = %item.path.display(),
                    exit_code = ?status.code(),
                    queued_secs = waited.num_seconds(),
                    "Work item failed"
                ),
                _ => tracing::info!(
                    path = %item.path.display(),
                    exit_code = ?item.exit.and_then(|s| s.code()),
                    queued_secs = waited.num_seconds(),
                    "Work item done"
                ),
            }
            // Dropping the dispatch releases its script.
        }
    }

    /// Cancel the timer, terminate everything dispatched and cancel the live
    /// batch.
    pub async fn stop_now(&mut self) {
        self.timer.cancel();

        let drained = self.store.lock().await.drain_dispatched();
        for (path, dispatch) in drained {
            tracing::info!(path = %path.display(), "Terminating dispatched work item");
            dispatch.handle.terminate(&self.client).await;
        }

        if let Some(batch) = self.batch.take() {
            self.client.cancel(&batch.id).await;
            self.store.lock().await.set_batch(None);
        }

        self.phase.send_replace(Phase::Stopped);
    }

    async fn work_in_flight(&self) -> bool {
        self.batch.is_some() || self.store.lock().await.dispatched_count() > 0
    }

    /// Work in flight: reconcile after the settle delay. Otherwise, waiting
    /// items: dispatch after the pause. Otherwise go idle.
    async fn rearm(&mut self) {
        let (dispatched, waiting) = {
            let store = self.store.lock().await;
            (store.dispatched_count(), store.waiting_count())
        };

        if dispatched > 0 || self.batch.is_some() {
            self.timer.arm(DelayClass::Settle, TimerAction::Update);
        } else if waiting > 0 {
            self.timer.arm(DelayClass::Pause, TimerAction::Dispatch);
        } else {
            self.timer.cancel();
        }
        self.publish_phase();
    }

    fn publish_phase(&self) {
        let phase = match self.timer.pending() {
            Some((DelayClass::Settle, _)) => Phase::Settling,
            Some((DelayClass::Pause, _)) => Phase::Pausing,
            None => Phase::Idle,
        };
        self.phase.send_if_modified(|current| {
            if *current == phase {
                false
            } else {
                tracing::debug!(from = %current, to = %phase, "Coordinator phase");
                *current = phase;
                true
            }
        });
    }

    /// Direct strategy: one wrapper process per item, up to the cap.
    async fn dispatch_direct(&mut self) -> Result<usize> {
        let mut launched = 0;

        loop {
            let path = {
                let store = self.store.lock().await;
                if store.dispatched_count() >= self.throttle.max_concurrent {
                    break;
                }
                match store.waiting_paths(1).pop() {
                    Some(path) => path,
                    None => break,
                }
            };

            let dispatch = self.launch_direct(&path)?;
            let claimed = self.store.lock().await.claim(&path, dispatch);
            match claimed {
                Ok(()) => {
                    launched += 1;
                    tracing::info!(path = %path.display(), "Dispatched work item");
                }
                Err(dispatch) => {
                    tracing::debug!(path = %path.display(), "Item left the queue during launch");
                    dispatch.handle.terminate(&self.client).await;
                }
            }
        }

        if launched > 0 {
            tracing::info!(launched, "Dispatch cycle complete");
        }
        Ok(launched)
    }

    fn launch_direct(&self, path: &Path) -> Result<Dispatch> {
        let dir = path.parent().unwrap_or_else(|| Path::new("/"));
        let text = self.templates.render(
            template::DIRECT_TEMPLATE,
            &template::params([
                ("script", shell_path("script", &self.script)?),
                ("dir", shell_path("dir", dir)?),
                ("file", shell_path("file", path)?),
            ]),
        )?;
        let wrapper = ScriptFile::write(&self.scratch_dir, SCRIPT_PREFIX, ".sh", &text, self.keep_scripts)?;

        let child = Command::new("sh")
            .arg(wrapper.path())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| SpoolError::ExternalCommand {
                command: format!("sh {}", wrapper.path().display()),
                reason: e.to_string(),
            })?;

        Ok(Dispatch::new(JobHandle::Process(child)).with_script(wrapper))
    }

    /// Array strategy: one submission covering every waiting item; its tasks
    /// pull their items from the dispenser.
    async fn dispatch_array(&mut self) -> Result<()> {
        if self.batch.is_some() {
            return Ok(());
        }
        let size = self.store.lock().await.waiting_count();
        if size == 0 {
            return Ok(());
        }
        let port = self.dispenser_port.ok_or_else(|| {
            SpoolError::Configuration("array dispatch requires a running dispenser".to_string())
        })?;
        let chunk_size = size.min(self.throttle.max_concurrent);
        let script = shell_path("script", &self.script)?;

        let wrapper_text = self.templates.render(
            template::WRAPPER_TEMPLATE,
            &template::params([
                ("port", port.to_string()),
                ("host", template::shell_word("host", &self.advertise_host)?),
                ("script", script.clone()),
            ]),
        )?;
        let wrapper = ScriptFile::write(&self.scratch_dir, SCRIPT_PREFIX, ".sh", &wrapper_text, self.keep_scripts)?;

        let submission_text = self.templates.render(
            template::ARRAY_TEMPLATE,
            &template::params([
                ("array_size", size.to_string()),
                ("wrapper", shell_path("wrapper", wrapper.path())?),
                ("script", script),
                ("chunk_size", chunk_size.to_string()),
            ]),
        )?;
        let submission = ScriptFile::write(
            &self.scratch_dir,
            SCRIPT_PREFIX,
            ".qsub",
            &submission_text,
            self.keep_scripts,
        )?;

        let id = self.client.submit(submission.path()).await?;
        self.store.lock().await.set_batch(Some(id.clone()));
        tracing::info!(batch = %id, size, chunk_size, "Submitted array batch");

        self.batch = Some(DispatchBatch {
            id,
            size,
            chunk_size,
            wrapper,
            submission,
            submitted_at: Utc::now(),
        });
        Ok(())
    }

    async fn update_array(&mut self) -> Vec<Retired> {
        if let Some(batch) = &self.batch {
            match self.client.is_active(&batch.id).await {
                Ok(true) => return Vec::new(),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(batch = %batch.id, error = %e, "Status poll failed, assuming batch is still active");
                    return Vec::new();
                }
            }
        }

        let finished = self.batch.take();
        let retired = {
            let mut store = self.store.lock().await;
            store.set_batch(None);
            store.retire_batch(finished.as_ref().map(|b| &b.id))
        };
        if let Some(batch) = finished {
            let elapsed = Utc::now() - batch.submitted_at;
            tracing::info!(
                batch = %batch.id,
                size = batch.size,
                retired = retired.len(),
                elapsed_secs = elapsed.num_seconds(),
                "Array batch finished"
            );
        }
        retired
    }
}

fn shell_path(key: &str, path: &Path) -> Result<String> {
    Ok(template::shell_word(key, &path.display().to_string())?)
}
