pub mod client;
pub mod job;

pub use client::SchedulerClient;
pub use job::JobId;
