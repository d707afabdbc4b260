use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use regex::Regex;
use tokio::sync::Mutex;

use crate::queue::item::{Dispatch, ItemState, ItemStatus, JobHandle, WorkItem};
use crate::scheduler::JobId;

/// The store shared by the coordinator and the dispenser. One lock guards
/// every read and write; nothing awaits external commands while holding it.
pub type SharedStore = Arc<Mutex<WorkStore>>;

/// An item that left the store after its work finished.
#[derive(Debug)]
pub struct Retired {
    pub path: PathBuf,
    pub enqueued_at: DateTime<Utc>,
    pub dispatch: Dispatch,
    /// Exit status of the local process, when there was one and it was
    /// observed
    pub exit: Option<ExitStatus>,
}

/// Work items keyed by path, in insertion order.
#[derive(Debug, Default)]
pub struct WorkStore {
    items: IndexMap<PathBuf, WorkItem>,
    pattern: Option<Regex>,
    batch: Option<JobId>,
}

impl WorkStore {
    pub fn new(pattern: Option<Regex>) -> Self {
        Self {
            items: IndexMap::new(),
            pattern,
            batch: None,
        }
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    /// Whether a path passes the inclusion pattern.
    pub fn accepts(&self, path: &Path) -> bool {
        match &self.pattern {
            Some(pattern) => pattern.is_match(&path.to_string_lossy()),
            None => true,
        }
    }

    /// Queue a path as `Waiting`. Returns false when the path is filtered out
    /// or already present.
    pub fn enqueue(&mut self, path: PathBuf) -> bool {
        if !self.accepts(&path) || self.items.contains_key(&path) {
            return false;
        }
        tracing::debug!(path = %path.display(), "Work item queued");
        self.items.insert(path.clone(), WorkItem::new(path));
        true
    }

    /// Remove a path regardless of state. The caller cancels any handle the
    /// returned item still owns, after releasing the lock.
    pub fn remove(&mut self, path: &Path) -> Option<WorkItem> {
        self.items.shift_remove(path)
    }

    pub fn status_of(&self, path: &Path) -> Option<ItemStatus> {
        self.items.get(path).map(WorkItem::status)
    }

    /// Number of items in any state
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn waiting_count(&self) -> usize {
        self.items.values().filter(|i| i.is_waiting()).count()
    }

    pub fn dispatched_count(&self) -> usize {
        self.items
            .values()
            .filter(|i| i.status() == ItemStatus::Dispatched)
            .count()
    }

    /// Paths of waiting items in insertion order, at most `limit` of them.
    pub fn waiting_paths(&self, limit: usize) -> Vec<PathBuf> {
        self.items
            .values()
            .filter(|i| i.is_waiting())
            .take(limit)
            .map(|i| i.path().to_path_buf())
            .collect()
    }

    /// Array batch whose tasks are currently pulling work.
    pub fn batch(&self) -> Option<&JobId> {
        self.batch.as_ref()
    }

    pub fn set_batch(&mut self, batch: Option<JobId>) {
        self.batch = batch;
    }

    /// Claim the first waiting item for a pulling array task.
    pub fn next_waiting(&mut self) -> Option<PathBuf> {
        let handle = JobHandle::ArrayTask(self.batch.clone());
        let item = self.items.values_mut().find(|i| i.is_waiting())?;
        // A waiting item always accepts a dispatch.
        item.dispatch(Dispatch::new(handle)).ok()?;
        Some(item.path().to_path_buf())
    }

    /// Mark a specific waiting item dispatched with a handle that is already
    /// running. The dispatch comes back if the item was removed or claimed in
    /// the meantime, so the caller can cancel it.
    pub fn claim(&mut self, path: &Path, dispatch: Dispatch) -> Result<(), Dispatch> {
        match self.items.get_mut(path) {
            Some(item) => item.dispatch(dispatch),
            None => Err(dispatch),
        }
    }

    /// Retire dispatched items whose local process has exited.
    pub fn reap_exited(&mut self) -> Vec<Retired> {
        let mut retired = Vec::new();
        self.items.retain(|path, item| {
            let exit = match item.handle_mut() {
                Some(JobHandle::Process(child)) => match child.try_wait() {
                    Ok(Some(status)) => Some(status),
                    Ok(None) => return true,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Lost track of job process");
                        None
                    }
                },
                _ => return true,
            };
            Self::retire(item, exit, &mut retired);
            false
        });
        retired
    }

    /// Retire items claimed by tasks of a finished array batch, together with
    /// claims that carry no batch at all.
    pub fn retire_batch(&mut self, batch: Option<&JobId>) -> Vec<Retired> {
        let mut retired = Vec::new();
        self.items.retain(|_, item| {
            let belongs = match item.handle().and_then(JobHandle::array_batch) {
                Some(None) => true,
                Some(Some(id)) => Some(id) == batch,
                None => false,
            };
            if !belongs {
                return true;
            }
            Self::retire(item, None, &mut retired);
            false
        });
        retired
    }

    /// Remove every dispatched item, handing back what they own.
    pub fn drain_dispatched(&mut self) -> Vec<(PathBuf, Dispatch)> {
        let mut drained = Vec::new();
        self.items.retain(|path, item| match item.finish() {
            Some(dispatch) => {
                drained.push((path.clone(), dispatch));
                false
            }
            None => true,
        });
        drained
    }

    fn retire(item: &mut WorkItem, exit: Option<ExitStatus>, into: &mut Vec<Retired>) {
        if let Some(dispatch) = item.finish() {
            into.push(Retired {
                path: item.path().to_path_buf(),
                enqueued_at: item.enqueued_at,
                dispatch,
                exit,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txt_store() -> WorkStore {
        WorkStore::new(Some(Regex::new(r"\.txt$").unwrap()))
    }

    #[test]
    fn drain_leaves_waiting_items() {
        let mut store = txt_store();
        store.enqueue(PathBuf::from("/d/a.txt"));
        store.enqueue(PathBuf::from("/d/b.txt"));
        store.next_waiting();

        let drained = store.drain_dispatched();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0, PathBuf::from("/d/a.txt"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.status_of(Path::new("/d/b.txt")), Some(ItemStatus::Waiting));
    }

    #[test]
    fn retire_batch_keeps_other_batches() {
        let mut store = txt_store();
        for name in ["a", "b", "c"] {
            store.enqueue(PathBuf::from(format!("/d/{}.txt", name)));
        }
        store.set_batch(Some(JobId::new("1")));
        store.next_waiting();
        store.set_batch(Some(JobId::new("2")));
        store.next_waiting();

        let retired = store.retire_batch(Some(&JobId::new("1")));
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].path, PathBuf::from("/d/a.txt"));
        assert!(retired[0].exit.is_none());
        assert_eq!(store.status_of(Path::new("/d/b.txt")), Some(ItemStatus::Dispatched));
        assert_eq!(store.status_of(Path::new("/d/c.txt")), Some(ItemStatus::Waiting));
    }

    #[test]
    fn claims_without_batch_retire_with_any_batch() {
        let mut store = txt_store();
        store.enqueue(PathBuf::from("/d/a.txt"));
        store.next_waiting();

        let retired = store.retire_batch(None);
        assert_eq!(retired.len(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn claim_of_missing_item_hands_dispatch_back() {
        let mut store = txt_store();
        let result = store.claim(
            Path::new("/d/missing.txt"),
            Dispatch::new(JobHandle::SchedulerJob(JobId::new("5"))),
        );
        assert!(result.is_err());
    }
}
