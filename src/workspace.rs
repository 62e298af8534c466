//! Per-execution temporary directories.
//!
//! Each execution gets a uniquely named directory under a shared root. The
//! [`SessionWorkspace`] value owns that directory: dropping it unlinks every
//! file and removes the directory, so the workspace cannot outlive the
//! execution that created it on any exit path.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ExecError;
use crate::language::LanguageProfile;

/// Name of the stdin file written next to the source.
pub const STDIN_FILE_NAME: &str = "input.txt";

/// Creates session workspaces under a base root.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a fresh directory named by a new UUID.
    pub fn create(&self) -> Result<SessionWorkspace, ExecError> {
        let session_id = Uuid::new_v4();
        fs::create_dir_all(&self.root).map_err(ExecError::WorkspaceCreation)?;
        let dir = self.root.join(session_id.to_string());
        fs::create_dir(&dir).map_err(ExecError::WorkspaceCreation)?;
        debug!(session = %session_id, dir = %dir.display(), "Created workspace");
        Ok(SessionWorkspace {
            session_id,
            dir,
            source_path: None,
            stdin_path: None,
            removed: false,
        })
    }
}

/// An isolated directory holding one execution's source and stdin files.
#[derive(Debug)]
pub struct SessionWorkspace {
    session_id: Uuid,
    dir: PathBuf,
    source_path: Option<PathBuf>,
    stdin_path: Option<PathBuf>,
    removed: bool,
}

impl SessionWorkspace {
    pub const fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    pub fn stdin_path(&self) -> Option<&Path> {
        self.stdin_path.as_deref()
    }

    /// Write the program to `<dir>/<entrypoint>.<ext>`.
    pub fn write_source(&mut self, code: &str, profile: &LanguageProfile) -> Result<PathBuf, ExecError> {
        let path = self.dir.join(profile.source_file_name());
        fs::write(&path, code).map_err(ExecError::WorkspaceCreation)?;
        self.source_path = Some(path.clone());
        Ok(path)
    }

    /// Write normalized stdin, if there is any.
    pub fn write_stdin(&mut self, stdin: &str) -> Result<Option<PathBuf>, ExecError> {
        let Some(normalized) = normalize_stdin(stdin) else {
            return Ok(None);
        };
        let path = self.dir.join(STDIN_FILE_NAME);
        fs::write(&path, normalized).map_err(ExecError::WorkspaceCreation)?;
        self.stdin_path = Some(path.clone());
        Ok(Some(path))
    }

    /// Unlink every file, then remove the directory. Safe to call repeatedly.
    pub fn cleanup(&mut self) -> Result<(), ExecError> {
        if self.removed {
            return Ok(());
        }
        match remove_dir_files(&self.dir) {
            Ok(()) => {
                self.removed = true;
                debug!(session = %self.session_id, "Removed workspace");
                Ok(())
            }
            Err(e) => Err(ExecError::WorkspaceCleanup(e)),
        }
    }
}

impl Drop for SessionWorkspace {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            warn!(
                session = %self.session_id,
                dir = %self.dir.display(),
                error = ?e.detail(),
                "Failed to clean up workspace"
            );
        }
    }
}

fn remove_dir_files(dir: &Path) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    match fs::remove_dir(dir) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Trim every line and terminate each one (including the last) with `\n`.
///
/// Returns `None` when there is nothing to deliver.
pub fn normalize_stdin(stdin: &str) -> Option<String> {
    if stdin.trim().is_empty() {
        return None;
    }
    let mut out = String::with_capacity(stdin.len() + 1);
    for line in stdin.lines() {
        out.push_str(line.trim());
        out.push('\n');
    }
    Some(out)
}
