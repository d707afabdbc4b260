//! Shared helpers for spool integration tests.
//!
//! Provides a fake batch scheduler (shell one-liners standing in for
//! `qsub`/`qstat`/`qdel`), short-delay configurations and polling asserts.

#![allow(dead_code)]

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use qspool::config::{DispatchStrategy, SchedulerConfig, SpoolConfig};
use tempfile::TempDir;

/// Job id every fake submission reports (before suffix stripping).
pub const FAKE_SUBMIT_OUTPUT: &str = "4242.master.cm.cluster";
pub const FAKE_JOB_ID: &str = "4242";

/// A scheduler made of shell one-liners. Status output is read from a file
/// the test controls; submissions and cancellations are appended to logs.
pub struct FakeScheduler {
    dir: TempDir,
    submit_output: String,
}

impl FakeScheduler {
    pub fn new() -> Self {
        Self::with_submit_output(FAKE_SUBMIT_OUTPUT)
    }

    pub fn with_submit_output(output: &str) -> Self {
        let scheduler = Self {
            dir: tempfile::tempdir().unwrap(),
            submit_output: output.to_string(),
        };
        scheduler.set_status("");
        scheduler
    }

    fn status_file(&self) -> PathBuf {
        self.dir.path().join("qstat.txt")
    }

    fn submit_log(&self) -> PathBuf {
        self.dir.path().join("submitted.log")
    }

    fn cancel_log(&self) -> PathBuf {
        self.dir.path().join("cancelled.log")
    }

    pub fn config(&self) -> SchedulerConfig {
        SchedulerConfig {
            submit: vec![
                "sh".to_string(),
                "-c".to_string(),
                format!(
                    "echo \"$1\" >> '{}'; printf '%s\\n' '{}'",
                    self.submit_log().display(),
                    self.submit_output
                ),
                "qsub".to_string(),
            ],
            status: vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("cat '{}'", self.status_file().display()),
            ],
            cancel: vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("echo \"$1\" >> '{}'", self.cancel_log().display()),
                "qdel".to_string(),
            ],
            ..SchedulerConfig::default()
        }
    }

    /// Replace what the status command prints.
    pub fn set_status(&self, listing: &str) {
        std::fs::write(self.status_file(), listing).unwrap();
    }

    /// Report `id` in state `state` (e.g. "R", "Q", "C").
    pub fn report(&self, id: &str, state: &str) {
        self.set_status(&qstat_listing(&[(id, state)]));
    }

    pub fn submitted(&self) -> Vec<PathBuf> {
        read_lines(&self.submit_log()).into_iter().map(PathBuf::from).collect()
    }

    pub fn cancelled(&self) -> Vec<String> {
        read_lines(&self.cancel_log())
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Torque-style `qstat` output with a header.
pub fn qstat_listing(jobs: &[(&str, &str)]) -> String {
    let mut out = String::from(
        "Job ID                    Name             User            Time Use S Queue\n\
         ------------------------- ---------------- --------------- -------- - -----\n",
    );
    for (id, state) in jobs {
        out.push_str(&format!(
            "{}.master.cm.cluster   array.qsub       kort            00:00:01 {} batch\n",
            id, state
        ));
    }
    out
}

/// Configuration with short delays, an ephemeral dispenser port and a
/// private scratch directory.
pub fn test_config(strategy: DispatchStrategy, scratch: &Path) -> SpoolConfig {
    SpoolConfig::new("/bin/true")
        .with_strategy(strategy)
        .with_delays(Duration::from_millis(20), Duration::from_millis(40))
        .with_port(0)
        .with_scratch_dir(scratch)
}

/// Same as [`test_config`] but with delays long enough that the timer never
/// fires during a test.
pub fn quiet_config(strategy: DispatchStrategy, scratch: &Path) -> SpoolConfig {
    test_config(strategy, scratch).with_delays(Duration::from_secs(3600), Duration::from_secs(3600))
}

/// Create `count` empty files named `file<i>.<ext>` in `dir`.
pub fn data_files(dir: &Path, count: usize, ext: &str) -> Vec<PathBuf> {
    (0..count)
        .map(|i| {
            let path = dir.join(format!("file{}.{}", i, ext));
            std::fs::write(&path, b"data").unwrap();
            path
        })
        .collect()
}

/// Write a template file and return its path.
pub fn template_file(dir: &Path, name: &str, text: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, text).unwrap();
    path
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(condition: F, timeout_duration: Duration, poll_interval: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
