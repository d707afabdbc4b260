//! The job spool: a throttled queue of per-file jobs.
//!
//! [`Spool`] ties the pieces together:
//! - **Store**: a [`SharedStore`] of work items, shared with the dispenser
//! - **Coordinator**: a task that dispatches and reconciles work when the
//!   throttle timer fires
//! - **Dispenser**: for the array strategy, the TCP service array tasks pull
//!   their items from
//!
//! # Flow
//!
//! 1. [`Spool::enqueue`] / [`Spool::dequeue`] change the store and notify the
//!    coordinator
//! 2. The coordinator waits for the queue to settle, then dispatches
//! 3. While work is in flight it reconciles every settle interval
//! 4. Once nothing is in flight it pauses, then dispatches the next batch

pub mod coordinator;
pub mod timer;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::{DispatchStrategy, SpoolConfig};
use crate::dispenser::{DispenserHandle, DispenserServer};
use crate::error::Result;
use crate::queue::{ItemState, SharedStore, WorkStore};
use crate::scheduler::{JobId, SchedulerClient};

pub use coordinator::{Coordinator, CoordinatorMessage, DispatchBatch, Phase};
pub use timer::{DelayClass, ThrottleTimer, TimerAction};

const MESSAGE_BUFFER: usize = 1024;

/// Point-in-time view of the spool.
#[derive(Debug, Clone, Serialize)]
pub struct SpoolStatus {
    pub size: usize,
    pub waiting: usize,
    pub dispatched: usize,
    pub phase: Phase,
    pub batch: Option<JobId>,
}

pub struct Spool {
    store: SharedStore,
    client: SchedulerClient,
    message_tx: mpsc::Sender<CoordinatorMessage>,
    phase: watch::Receiver<Phase>,
    coordinator: JoinHandle<()>,
    dispenser: Option<DispenserHandle>,
}

impl Spool {
    /// Validate the configuration, start the dispenser (array strategy) and
    /// spawn the coordinator.
    ///
    /// # Errors
    ///
    /// Returns a configuration error before anything starts if the
    /// configuration is incomplete, or an I/O error if the dispenser cannot
    /// bind its port.
    pub async fn start(config: SpoolConfig) -> Result<Self> {
        config.validate()?;
        let store = WorkStore::new(config.inclusion_pattern()?).into_shared();
        let client = SchedulerClient::new(config.scheduler.clone());

        let dispenser = match config.strategy {
            DispatchStrategy::Array => {
                let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
                let server = DispenserServer::bind(addr, store.clone(), config.request_timeout)?;
                Some(server.spawn())
            }
            DispatchStrategy::Direct => None,
        };
        let port = dispenser.as_ref().map(|d| d.local_addr().port());

        let (coordinator, phase) = Coordinator::new(&config, store.clone(), client.clone(), port)?;
        let (message_tx, message_rx) = mpsc::channel(MESSAGE_BUFFER);
        let coordinator = tokio::spawn(coordinator.run(message_rx));

        tracing::info!(
            strategy = ?config.strategy,
            max_concurrent = config.throttle.max_concurrent,
            dispenser_port = ?port,
            "Spool started"
        );

        Ok(Self {
            store,
            client,
            message_tx,
            phase,
            coordinator,
            dispenser,
        })
    }

    /// Queue a file. Returns false if it is filtered out or already queued.
    pub async fn enqueue(&self, path: impl Into<PathBuf>) -> bool {
        let added = self.store.lock().await.enqueue(path.into());
        if added {
            self.notify().await;
        }
        added
    }

    /// Remove a file from the queue, cancelling its job if it was already
    /// dispatched. Returns whether the file was queued.
    pub async fn dequeue(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let removed = self.store.lock().await.remove(path);
        let Some(item) = removed else {
            return false;
        };

        if let ItemState::Dispatched(dispatch) = item.state {
            tracing::info!(path = %path.display(), "Cancelling dequeued work item");
            dispatch.handle.terminate(&self.client).await;
        }
        self.notify().await;
        true
    }

    /// Number of queued items, in any state.
    pub async fn size(&self) -> usize {
        self.store.lock().await.len()
    }

    pub async fn status(&self) -> SpoolStatus {
        let store = self.store.lock().await;
        SpoolStatus {
            size: store.len(),
            waiting: store.waiting_count(),
            dispatched: store.dispatched_count(),
            phase: *self.phase.borrow(),
            batch: store.batch().cloned(),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn store(&self) -> SharedStore {
        self.store.clone()
    }

    pub fn dispenser_addr(&self) -> Option<SocketAddr> {
        self.dispenser.as_ref().map(DispenserHandle::local_addr)
    }

    /// Wait until the queue is empty and the coordinator has gone idle.
    pub async fn wait_drained(&self) {
        let mut phase = self.phase.clone();
        loop {
            let current = *phase.borrow_and_update();
            if matches!(current, Phase::Idle | Phase::Stopped) && self.store.lock().await.is_empty() {
                return;
            }
            if phase.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stop the spool. With `wait`, queued work is allowed to finish first;
    /// otherwise everything dispatched is terminated immediately.
    pub async fn stop(self, wait: bool) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .message_tx
            .send(CoordinatorMessage::Stop { wait, done: done_tx })
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }

        if let Err(e) = self.coordinator.await {
            tracing::error!(error = %e, "Coordinator task failed");
        }
        if let Some(dispenser) = self.dispenser {
            dispenser.shutdown().await;
        }
        tracing::info!("Spool stopped");
    }

    async fn notify(&self) {
        if self
            .message_tx
            .send(CoordinatorMessage::QueueChanged)
            .await
            .is_err()
        {
            tracing::debug!("Coordinator is gone, queue change not scheduled");
        }
    }
}
