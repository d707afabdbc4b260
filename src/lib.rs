pub mod config;
pub mod dispenser;
pub mod error;
pub mod queue;
pub mod scheduler;
pub mod script;
pub mod shutdown;
pub mod spool;
pub mod template;

pub use config::{DispatchStrategy, SchedulerConfig, SpoolConfig, TemplateConfig, ThrottleWindow};
pub use error::{Result, SpoolError, TemplateError};
pub use spool::{Spool, SpoolStatus};
