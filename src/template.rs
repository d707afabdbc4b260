//! Submission script templates.
//!
//! Templates are plain text with `{name}` placeholders. `{{` and `}}` render
//! as literal braces; any other brace is copied through unchanged. Shell
//! parameter expansion must be escaped (`${{HOME}}`), plain `$HOME` needs
//! nothing.
//!
//! Values that end up as shell words (paths, host names) are quoted with
//! [`shell_word`] before substitution, so templates place them bare:
//! `exec {script} {file}`, never `'{file}'`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::config::TemplateConfig;
use crate::error::TemplateError;

/// Array submission script
pub const ARRAY_TEMPLATE: &str = "array.qsub";
/// Wrapper run by each array task; pulls one item from the dispenser
pub const WRAPPER_TEMPLATE: &str = "jobber.sh";
/// Per-item wrapper for direct dispatch
pub const DIRECT_TEMPLATE: &str = "direct.sh";

const BUILTIN: &[(&str, &str)] = &[
    (ARRAY_TEMPLATE, include_str!("../templates/array.qsub")),
    (WRAPPER_TEMPLATE, include_str!("../templates/jobber.sh")),
    (DIRECT_TEMPLATE, include_str!("../templates/direct.sh")),
];

pub type Params = BTreeMap<String, String>;

/// Build a parameter map from key/value pairs.
pub fn params<const N: usize>(pairs: [(&str, String); N]) -> Params {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    // SAFETY: hardcoded pattern that always compiles
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{|\}\}|\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
    })
}

/// Quote `value` as a single POSIX shell word.
pub fn shell_word(key: &str, value: &str) -> Result<String, TemplateError> {
    shlex::try_quote(value)
        .map(|quoted| quoted.into_owned())
        .map_err(|_| TemplateError::UnquotableValue {
            key: key.to_string(),
        })
}

/// Replace every placeholder in `text` with its value from `params`.
pub fn substitute(name: &str, text: &str, params: &Params) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in placeholder().captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&text[last..whole.start()]);
        match caps.get(1) {
            Some(key) => {
                let value = params.get(key.as_str()).ok_or_else(|| {
                    TemplateError::UndefinedPlaceholder {
                        template: name.to_string(),
                        key: key.as_str().to_string(),
                    }
                })?;
                out.push_str(value);
            }
            None => out.push_str(&whole.as_str()[..1]),
        }
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(out)
}

/// Locates templates by name.
#[derive(Debug, Clone, Default)]
pub struct TemplateSet {
    dir: Option<PathBuf>,
    overrides: HashMap<String, PathBuf>,
}

impl TemplateSet {
    /// Only the templates compiled into the binary.
    pub fn builtin() -> Self {
        Self::default()
    }

    /// Templates per configuration. `submission` names the template the
    /// configured submission override replaces.
    pub fn from_config(config: &TemplateConfig, submission: &str) -> Self {
        let mut set = Self {
            dir: config.dir.clone(),
            overrides: HashMap::new(),
        };
        if let Some(path) = &config.submission {
            set = set.with_override(submission, path.clone());
        }
        set
    }

    fn with_override(mut self, name: &str, path: impl Into<PathBuf>) -> Self {
        self.overrides.insert(name.to_string(), path.into());
        self
    }

    /// Text of the named template.
    pub fn source(&self, name: &str) -> Result<String, TemplateError> {
        let missing = || TemplateError::MissingTemplate {
            name: name.to_string(),
        };

        if let Some(path) = self.overrides.get(name) {
            return read_template(path).ok_or_else(missing);
        }
        if let Some(text) = self.dir.as_deref().and_then(|dir| read_template(&dir.join(name))) {
            return Ok(text);
        }
        BUILTIN
            .iter()
            .find(|(builtin, _)| *builtin == name)
            .map(|(_, text)| text.to_string())
            .ok_or_else(missing)
    }

    pub fn render(&self, name: &str, params: &Params) -> Result<String, TemplateError> {
        let text = self.source(name)?;
        substitute(name, &text, params)
    }
}

fn read_template(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => Some(text),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Template not readable");
            None
        }
    }
}
