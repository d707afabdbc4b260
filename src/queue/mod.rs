//! Work items and the store that holds them.
//!
//! The store maps each file path to exactly one [`WorkItem`], in insertion
//! order. Items move `Waiting -> Dispatched -> Done` and never back; a
//! dispatched item owns a [`JobHandle`] describing what runs it.
//!
//! Both the dispatch coordinator (push) and the work dispenser (pull) claim
//! items through the same [`SharedStore`] lock.

pub mod item;
pub mod store;

pub use item::{Dispatch, ItemState, ItemStatus, JobHandle, WorkItem};
pub use store::{Retired, SharedStore, WorkStore};
