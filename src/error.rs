use std::fmt;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use thiserror::Error;

/// The four ways a safe write can fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The target, its parent directory, or a name pattern is unusable.
    InvalidPath,
    /// The target is a symlink; the write refused to go through it.
    SymlinkRefusal,
    /// The pre-replacement backup could not be made. The target is untouched.
    BackupFailed,
    /// Any other I/O error, including an exclusive-create collision.
    IoFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match *self {
            ErrorKind::InvalidPath => "invalid path",
            ErrorKind::SymlinkRefusal => "symlink refusal",
            ErrorKind::BackupFailed => "backup failed",
            ErrorKind::IoFailure => "I/O failure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by every write operation in this crate.
///
/// Each variant carries the target path the caller asked for, so a
/// command-line caller can print kind and path without extra bookkeeping.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("invalid path {}: {reason}", path.display())]
    InvalidPath { path: PathBuf, reason: &'static str },

    #[error("refusing to write through symlink at {}", path.display())]
    SymlinkRefusal { path: PathBuf },

    #[error("could not back up {}: {source}", path.display())]
    BackupFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// `backup` is set when a backup had already been made and was left in
    /// place for recovery.
    #[error("I/O failure writing {}: {source}", path.display())]
    Io {
        path: PathBuf,
        backup: Option<PathBuf>,
        #[source]
        source: io::Error,
    },
}

impl WriteError {
    pub(crate) fn invalid(path: &Path, reason: &'static str) -> WriteError {
        WriteError::InvalidPath {
            path: path.to_path_buf(),
            reason,
        }
    }

    pub(crate) fn symlink(path: &Path) -> WriteError {
        WriteError::SymlinkRefusal {
            path: path.to_path_buf(),
        }
    }

    pub(crate) fn backup(path: &Path, source: io::Error) -> WriteError {
        WriteError::BackupFailed {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn io(path: &Path, source: io::Error) -> WriteError {
        WriteError::Io {
            path: path.to_path_buf(),
            backup: None,
            source,
        }
    }

    pub(crate) fn with_backup(self, retained: Option<PathBuf>) -> WriteError {
        match self {
            WriteError::Io { path, source, .. } => WriteError::Io {
                path,
                backup: retained,
                source,
            },
            other => other,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match *self {
            WriteError::InvalidPath { .. } => ErrorKind::InvalidPath,
            WriteError::SymlinkRefusal { .. } => ErrorKind::SymlinkRefusal,
            WriteError::BackupFailed { .. } => ErrorKind::BackupFailed,
            WriteError::Io { .. } => ErrorKind::IoFailure,
        }
    }

    /// The target path of the failed call.
    pub fn path(&self) -> &Path {
        match *self {
            WriteError::InvalidPath { ref path, .. }
            | WriteError::SymlinkRefusal { ref path }
            | WriteError::BackupFailed { ref path, .. }
            | WriteError::Io { ref path, .. } => path,
        }
    }

    /// A backup file this call created and did not remove.
    pub fn retained_backup(&self) -> Option<&Path> {
        match *self {
            WriteError::Io {
                backup: Some(ref backup),
                ..
            } => Some(backup),
            _ => None,
        }
    }

    pub fn io_error(&self) -> Option<&io::Error> {
        match *self {
            WriteError::BackupFailed { ref source, .. } | WriteError::Io { ref source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }
}
