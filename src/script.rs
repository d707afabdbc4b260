use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::TempPath;

use crate::error::Result;

/// A generated submission script on disk.
///
/// Temporary scripts are deleted when dropped; kept scripts stay behind for
/// debugging.
#[derive(Debug)]
pub enum ScriptFile {
    Temporary(TempPath),
    Kept(PathBuf),
}

impl ScriptFile {
    /// Write `contents` to a fresh file in `dir`. The file is closed before
    /// returning so it can be handed to another process.
    pub fn write(dir: &Path, prefix: &str, suffix: &str, contents: &str, keep: bool) -> Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(suffix)
            .tempfile_in(dir)?;
        file.write_all(contents.as_bytes())?;
        file.flush()?;

        let path = file.into_temp_path();
        if keep {
            let kept = path.keep().map_err(|e| e.error)?;
            tracing::debug!(path = %kept.display(), "Keeping generated script");
            Ok(ScriptFile::Kept(kept))
        } else {
            Ok(ScriptFile::Temporary(path))
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            ScriptFile::Temporary(path) => path,
            ScriptFile::Kept(path) => path,
        }
    }
}
