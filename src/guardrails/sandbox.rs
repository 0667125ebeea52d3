//! Confinement of artifact writes to the output root.
//!
//! Candidate paths are resolved lexically against the canonical root, then the
//! deepest existing ancestor is canonicalized so a symlink planted inside the
//! root cannot redirect a write outside it.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("path '{path}' escapes the output root: {reason}")]
pub struct SandboxViolation {
    pub path: String,
    pub reason: &'static str,
}

#[derive(Debug, Clone)]
pub struct PathSandbox {
    root: PathBuf,
}

impl PathSandbox {
    /// Create the root if needed and pin its canonical form.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        fs::create_dir_all(root.as_ref())?;
        let root = fs::canonicalize(root.as_ref())?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `candidate` to a path strictly inside the root.
    pub fn resolve(&self, candidate: &str) -> Result<PathBuf, SandboxViolation> {
        let violation = |reason| SandboxViolation {
            path: candidate.to_string(),
            reason,
        };

        if candidate.trim().is_empty() {
            return Err(violation("empty path"));
        }
        if candidate.contains('\0') {
            return Err(violation("embedded NUL byte"));
        }

        // Treat Windows separators as separators so `..\` cannot slip through.
        let normalized = candidate.replace('\\', "/");
        let path = Path::new(&normalized);

        let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
        for component in path.components() {
            match component {
                Component::Prefix(_) => return Err(violation("path prefix")),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir => {
                    if parts.pop().is_none() {
                        return Err(violation("parent traversal above base"));
                    }
                }
                Component::Normal(part) => parts.push(part),
            }
        }

        let mut resolved = if path.has_root() {
            PathBuf::from("/")
        } else {
            self.root.clone()
        };
        resolved.extend(parts);

        if !resolved.starts_with(&self.root) {
            return Err(violation("outside output root"));
        }
        if resolved == self.root {
            return Err(violation("resolves to the output root itself"));
        }

        self.check_existing_ancestor(&resolved)
            .map_err(|_| violation("symlinked ancestor leaves output root"))?;

        Ok(resolved)
    }

    /// Resolve `candidate` and require it to land strictly inside the
    /// `subtree` directory of the root.
    pub fn resolve_under(&self, subtree: &str, candidate: &str) -> Result<PathBuf, SandboxViolation> {
        let resolved = self.resolve(candidate)?;
        let base = self.root.join(subtree);
        if !resolved.starts_with(&base) || resolved == base {
            return Err(SandboxViolation {
                path: candidate.to_string(),
                reason: "leaves its agent's output directory",
            });
        }
        Ok(resolved)
    }

    fn check_existing_ancestor(&self, resolved: &Path) -> Result<(), ()> {
        let mut probe = Some(resolved);
        while let Some(current) = probe {
            if fs::symlink_metadata(current).is_ok() {
                let real = fs::canonicalize(current).map_err(|_| ())?;
                return if real.starts_with(&self.root) { Ok(()) } else { Err(()) };
            }
            probe = current.parent();
        }
        Err(())
    }
}
