use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;

use crate::error::{Result, SpoolError};

/// How waiting items are turned into running work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchStrategy {
    /// One array submission to the batch scheduler; its tasks pull work items
    /// from the dispenser.
    #[default]
    Array,
    /// One local subprocess per work item.
    Direct,
}

/// Pacing of dispatch cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleWindow {
    /// Quiescence delay after the queue changes before acting on it
    pub settle: Duration,
    /// Delay between dispatch batches once no work is in flight
    pub pause: Duration,
    /// Upper bound on dispatched items (direct) or on concurrently running
    /// array tasks (array)
    pub max_concurrent: usize,
}

impl Default for ThrottleWindow {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(3),
            pause: Duration::from_secs(10),
            max_concurrent: 50,
        }
    }
}

/// Command lines used to talk to the batch scheduler.
///
/// Each command is a program followed by leading arguments; the spool appends
/// the script path (submit) or job id (cancel).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub submit: Vec<String>,
    pub status: Vec<String>,
    pub cancel: Vec<String>,
    /// State codes in the status listing that count as "still active"
    pub active_states: Vec<String>,
    /// Zero-based column of the state code in the status listing
    pub state_column: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            submit: vec!["qsub".to_string()],
            status: vec!["qstat".to_string()],
            cancel: vec!["qdel".to_string()],
            active_states: vec!["Q".to_string(), "R".to_string()],
            state_column: 4,
        }
    }
}

/// Where submission script templates come from.
///
/// Lookup order for a template name: the explicit override (if the name is
/// the strategy's submission template), then `dir/<name>`, then the built-in
/// copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateConfig {
    pub dir: Option<PathBuf>,
    /// Replaces the strategy's submission template (`array.qsub` or `direct.sh`)
    pub submission: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SpoolConfig {
    /// Script run on every work item, with the item path as its only argument
    pub script: Option<PathBuf>,
    /// Regular expression a path must match to be queued; `None` accepts all
    pub pattern: Option<String>,
    pub throttle: ThrottleWindow,
    pub strategy: DispatchStrategy,
    /// Dispenser port; 0 picks an ephemeral port
    pub port: u16,
    /// Host name array tasks use to reach the dispenser
    pub advertise_host: String,
    pub templates: TemplateConfig,
    /// Directory receiving generated submission scripts
    pub scratch_dir: PathBuf,
    /// Keep generated scripts instead of deleting them once reconciled
    pub keep_scripts: bool,
    pub scheduler: SchedulerConfig,
    /// How long the dispenser waits for a request on an accepted connection
    pub request_timeout: Duration,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            script: None,
            pattern: None,
            throttle: ThrottleWindow::default(),
            strategy: DispatchStrategy::default(),
            port: 8002,
            advertise_host: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            templates: TemplateConfig::default(),
            scratch_dir: std::env::temp_dir(),
            keep_scripts: false,
            scheduler: SchedulerConfig::default(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl SpoolConfig {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: Some(script.into()),
            ..Default::default()
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn with_strategy(mut self, strategy: DispatchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.throttle.max_concurrent = max_concurrent;
        self
    }

    pub fn with_delays(mut self, settle: Duration, pause: Duration) -> Self {
        self.throttle.settle = settle;
        self.throttle.pause = pause;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Check the configuration before any queue activity starts.
    pub fn validate(&self) -> Result<()> {
        if self.script.is_none() {
            return Err(SpoolError::Configuration(
                "no target script specified".to_string(),
            ));
        }
        if self.throttle.max_concurrent == 0 {
            return Err(SpoolError::Configuration(
                "maximum concurrent jobs must be at least 1".to_string(),
            ));
        }
        for (name, delay) in [("settle", self.throttle.settle), ("pause", self.throttle.pause)] {
            if delay.is_zero() {
                return Err(SpoolError::Configuration(format!(
                    "{} delay must be greater than zero",
                    name
                )));
            }
        }
        for (name, cmd) in [
            ("submit", &self.scheduler.submit),
            ("status", &self.scheduler.status),
            ("cancel", &self.scheduler.cancel),
        ] {
            if cmd.is_empty() {
                return Err(SpoolError::Configuration(format!(
                    "scheduler {} command is empty",
                    name
                )));
            }
        }
        self.inclusion_pattern()?;
        Ok(())
    }

    /// Compile the inclusion pattern, if one is set.
    pub fn inclusion_pattern(&self) -> Result<Option<Regex>> {
        match self.pattern.as_deref() {
            None | Some("") => Ok(None),
            Some(p) => Ok(Some(Regex::new(p)?)),
        }
    }

    /// The target script, once `validate` has passed.
    pub fn target_script(&self) -> Result<&PathBuf> {
        self.script
            .as_ref()
            .ok_or_else(|| SpoolError::Configuration("no target script specified".to_string()))
    }
}
