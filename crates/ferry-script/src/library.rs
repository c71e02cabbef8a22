//! Named scripts available to `Load`.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use ferry_core::ScriptError;

/// Extension tried for named scripts on disk.
pub const SCRIPT_EXTENSION: &str = "fy";

/// Registered scripts first, then `<root>/<name>` and `<root>/<name>.fy`.
#[derive(Debug, Clone, Default)]
pub struct ScriptLibrary {
    scripts: HashMap<String, String>,
    root: Option<PathBuf>,
}

impl ScriptLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.scripts.insert(name.into(), source.into());
        self
    }

    pub fn with_root(mut self, root: impl AsRef<Path>) -> Self {
        self.root = Some(root.as_ref().to_path_buf());
        self
    }

    /// Source of the script called `name`.
    pub fn source(&self, name: &str) -> Result<String, ScriptError> {
        if let Some(source) = self.scripts.get(name) {
            return Ok(source.clone());
        }

        let Some(root) = &self.root else {
            return Err(ScriptError::NotFound(name.to_string()));
        };
        if Path::new(name).is_absolute() || name.split('/').any(|part| part == "..") {
            return Err(ScriptError::NotFound(name.to_string()));
        }

        let path = root.join(name);
        let candidates = [path.clone(), path.with_extension(SCRIPT_EXTENSION)];
        for candidate in &candidates {
            match std::fs::read_to_string(candidate) {
                Ok(source) => return Ok(source),
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                // Directories and unreadable files.
                Err(e) => {
                    tracing::debug!("Skipping {}: {}", candidate.display(), e);
                    continue;
                }
            }
        }
        Err(ScriptError::NotFound(name.to_string()))
    }
}
