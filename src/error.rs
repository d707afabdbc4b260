use thiserror::Error;

/// Failures while rendering a submission script.
#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Template not found: {name}")]
    MissingTemplate { name: String },

    #[error("Template {template} references undefined placeholder {{{key}}}")]
    UndefinedPlaceholder { template: String, key: String },

    #[error("Value for {{{key}}} cannot be quoted for the shell")]
    UnquotableValue { key: String },
}

#[derive(Error, Debug)]
pub enum SpoolError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("Could not parse a job id from submission output: {output:?}")]
    SubmissionParse { output: String },

    #[error("External command `{command}` failed: {reason}")]
    ExternalCommand { command: String, reason: String },

    #[error("Dispenser connection error: {0}")]
    Dispenser(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<regex::Error> for SpoolError {
    fn from(e: regex::Error) -> Self {
        SpoolError::Configuration(format!("invalid inclusion pattern: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, SpoolError>;
