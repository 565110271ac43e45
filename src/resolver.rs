//! Maps requested paths to file content.
//!
//! Relative paths resolve against a root directory (the working directory
//! by default); absolute paths are used as-is. There is no sandboxing:
//! any regular file the process can read is servable, `..` included.

use std::io;
use std::path::PathBuf;
use tracing::trace;

/// Outcome of resolving a path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Full text of a regular, readable file
    Found(String),
    /// Missing, not a regular file, or unreadable
    NotFound,
}

/// Resolves request paths against a root directory
#[derive(Debug, Clone)]
pub struct FileResolver {
    root: PathBuf,
}

impl FileResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a path token to file content.
    ///
    /// Invalid UTF-8 is replaced rather than rejected. Errors other than
    /// "missing"/"unreadable" while reading a regular file are returned.
    pub async fn resolve(&self, path: &str) -> io::Result<Resolution> {
        if path.is_empty() {
            return Ok(Resolution::NotFound);
        }

        let full_path = self.root.join(path);

        let metadata = match tokio::fs::metadata(&full_path).await {
            Ok(metadata) => metadata,
            Err(e) => {
                trace!(path = %full_path.display(), error = %e, "Metadata lookup failed");
                return Ok(Resolution::NotFound);
            }
        };

        if !metadata.is_file() {
            return Ok(Resolution::NotFound);
        }

        match tokio::fs::read(&full_path).await {
            Ok(bytes) => Ok(Resolution::Found(String::from_utf8_lossy(&bytes).into_owned())),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
                ) =>
            {
                trace!(path = %full_path.display(), error = %e, "File not readable");
                Ok(Resolution::NotFound)
            }
            Err(e) => Err(e),
        }
    }
}
