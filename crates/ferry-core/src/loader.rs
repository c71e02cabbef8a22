//! Fetching module source for import specifiers.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::error::{Error, Result};

/// Source text for one specifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSource {
    /// Name the engine should use for the module in diagnostics.
    pub identifier: String,
    pub text: String,
}

/// Locates module source for a specifier.
///
/// Loaders are shared by every context; the per-context caching lives in
/// the [`ModuleLinker`](crate::linker::ModuleLinker).
pub trait ModuleLoader: Send + Sync + 'static {
    fn fetch<'a>(&'a self, specifier: &'a str) -> BoxFuture<'a, Result<ModuleSource>>;
}

/// Serves modules from memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryLoader {
    modules: HashMap<String, String>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(mut self, specifier: impl Into<String>, source: impl Into<String>) -> Self {
        self.insert(specifier, source);
        self
    }

    pub fn insert(&mut self, specifier: impl Into<String>, source: impl Into<String>) {
        self.modules.insert(specifier.into(), source.into());
    }
}

impl ModuleLoader for MemoryLoader {
    fn fetch<'a>(&'a self, specifier: &'a str) -> BoxFuture<'a, Result<ModuleSource>> {
        let found = self.modules.get(specifier).cloned();
        async move {
            let text = found.ok_or_else(|| Error::Resolution {
                specifier: specifier.to_string(),
                message: "no such module".to_string(),
            })?;
            Ok(ModuleSource {
                identifier: specifier.to_string(),
                text,
            })
        }
        .boxed()
    }
}

/// Reads modules from files under a root directory.
#[derive(Debug, Clone)]
pub struct FsLoader {
    root: PathBuf,
    extension: Option<String>,
}

impl FsLoader {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            extension: None,
        }
    }

    /// Also try `<specifier>.<extension>` when the bare path does not exist.
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn candidates(&self, specifier: &str) -> Vec<PathBuf> {
        let relative = specifier.trim_start_matches("./");
        let base = self.root.join(relative);
        let mut paths = vec![base.clone()];
        if let Some(ref ext) = self.extension
            && base.extension().is_none()
        {
            paths.push(base.with_extension(ext));
        }
        paths
    }
}

impl ModuleLoader for FsLoader {
    fn fetch<'a>(&'a self, specifier: &'a str) -> BoxFuture<'a, Result<ModuleSource>> {
        async move {
            if Path::new(specifier).is_absolute() || specifier.split('/').any(|part| part == "..") {
                return Err(Error::Resolution {
                    specifier: specifier.to_string(),
                    message: "specifier escapes the module root".to_string(),
                });
            }

            for path in self.candidates(specifier) {
                match tokio::fs::read_to_string(&path).await {
                    Ok(text) => {
                        tracing::debug!("Loaded '{}' from {}", specifier, path.display());
                        return Ok(ModuleSource {
                            identifier: path.display().to_string(),
                            text,
                        });
                    }
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => {
                        return Err(Error::Resolution {
                            specifier: specifier.to_string(),
                            message: format!("failed to read {}: {}", path.display(), e),
                        });
                    }
                }
            }

            Err(Error::Resolution {
                specifier: specifier.to_string(),
                message: format!("not found under {}", self.root.display()),
            })
        }
        .boxed()
    }
}
