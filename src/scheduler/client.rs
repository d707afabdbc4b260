use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

use crate::config::SchedulerConfig;
use crate::error::{Result, SpoolError};
use crate::scheduler::job::{listed_as_active, parse_submission, JobId};

/// Talks to the batch scheduler through its command line tools.
///
/// Every call runs the configured command to completion and captures its
/// stdout, so callers must not hold the store lock across these calls.
#[derive(Debug, Clone)]
pub struct SchedulerClient {
    config: SchedulerConfig,
}

impl SchedulerClient {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    /// Submit a script and return the stable job id the scheduler assigned.
    pub async fn submit(&self, script: &Path) -> Result<JobId> {
        let output = self.run(&self.config.submit, Some(script.as_os_str())).await?;
        let job_id = parse_submission(&output).ok_or_else(|| SpoolError::SubmissionParse {
            output: output.clone(),
        })?;
        tracing::info!(job_id = %job_id, script = %script.display(), "Submitted job");
        Ok(job_id)
    }

    /// Whether the status listing still shows the job as queued or running.
    ///
    /// A job missing from the listing has left the scheduler; whether it
    /// finished, failed or was evicted is not distinguished here.
    pub async fn is_active(&self, job_id: &JobId) -> Result<bool> {
        let listing = self.run(&self.config.status, None).await?;
        let active = listed_as_active(
            &listing,
            job_id,
            &self.config.active_states,
            self.config.state_column,
        );
        tracing::debug!(job_id = %job_id, active, "Polled job status");
        Ok(active)
    }

    /// Cancel a job. Best effort: the job may already be gone, so failures
    /// are only logged.
    pub async fn cancel(&self, job_id: &JobId) {
        match self
            .run(&self.config.cancel, Some(OsStr::new(job_id.as_str())))
            .await
        {
            Ok(_) => tracing::info!(job_id = %job_id, "Cancelled job"),
            Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Failed to cancel job"),
        }
    }

    async fn run(&self, command: &[String], extra: Option<&OsStr>) -> Result<String> {
        let (program, args) = command.split_first().ok_or_else(|| {
            SpoolError::Configuration("scheduler command is empty".to_string())
        })?;
        let display = command.join(" ");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(extra) = extra {
            cmd.arg(extra);
        }

        let output = cmd.output().await.map_err(|e| SpoolError::ExternalCommand {
            command: display.clone(),
            reason: e.to_string(),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SpoolError::ExternalCommand {
                command: display,
                reason: if stderr.trim().is_empty() {
                    format!("exited with {}", output.status)
                } else {
                    format!("exited with {}: {}", output.status, stderr.trim())
                },
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
