//! Confinement of input and output files to one directory.

use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("cannot resolve '{}': {source}", path.display())]
    Resolve { path: PathBuf, source: io::Error },

    #[error("'{}' is outside the allowed directory '{}'", path.display(), root.display())]
    OutsideRoot { path: PathBuf, root: PathBuf },

    #[error("'{}' does not name a file", path.display())]
    NotAFile { path: PathBuf },
}

fn resolve(path: &Path) -> Result<PathBuf, PathError> {
    path.canonicalize().map_err(|source| PathError::Resolve {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolves paths and rejects any that escape the root directory,
/// including through `..` or symlinks.
#[derive(Debug, Clone)]
pub struct PathGuard {
    root: PathBuf,
}

impl PathGuard {
    pub fn new(root: &Path) -> Result<Self, PathError> {
        Ok(Self {
            root: resolve(root)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn check(&self, path: PathBuf) -> Result<PathBuf, PathError> {
        if path.starts_with(&self.root) {
            Ok(path)
        } else {
            Err(PathError::OutsideRoot {
                path,
                root: self.root.clone(),
            })
        }
    }

    /// An existing file to read.
    pub fn input(&self, path: &Path) -> Result<PathBuf, PathError> {
        self.check(resolve(path)?)
    }

    /// A file to create or overwrite. Its directory must already exist.
    pub fn output(&self, path: &Path) -> Result<PathBuf, PathError> {
        let Some(Component::Normal(name)) = path.components().next_back() else {
            return Err(PathError::NotAFile {
                path: path.to_path_buf(),
            });
        };
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let resolved = resolve(parent)?.join(name);
        // An existing symlink must not point outside either.
        let resolved = if resolved.exists() {
            resolve(&resolved)?
        } else {
            resolved
        };
        self.check(resolved)
    }
}
