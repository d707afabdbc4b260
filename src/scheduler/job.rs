use serde::Serialize;

/// Stable identifier of a batch scheduler job.
///
/// Schedulers decorate ids with a server suffix (`1234.master.cluster`) or an
/// array index (`1234[]`, `1234[7].master`); the stable id is everything
/// before the first `.` or `[`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parse the first whitespace-separated token of `raw`, dropping any
    /// suffix. Returns `None` if nothing is left.
    pub fn parse(raw: &str) -> Option<Self> {
        let token = raw.split_whitespace().next()?;
        let stem = token.split(['.', '[']).next()?;
        if stem.is_empty() {
            None
        } else {
            Some(Self(stem.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Job id from the output of the submit command: the first non-empty line.
pub fn parse_submission(output: &str) -> Option<JobId> {
    output
        .lines()
        .find(|line| !line.trim().is_empty())
        .and_then(JobId::parse)
}

/// Whether a status listing shows `job` in one of the active states.
///
/// Lines too short to have a state column (headers, separators, blank lines)
/// are skipped.
pub fn listed_as_active(
    listing: &str,
    job: &JobId,
    active_states: &[String],
    state_column: usize,
) -> bool {
    listing.lines().any(|line| {
        let columns: Vec<&str> = line.split_whitespace().collect();
        if columns.len() <= state_column {
            return false;
        }
        JobId::parse(columns[0]).as_ref() == Some(job)
            && active_states.iter().any(|s| s == columns[state_column])
    })
}
