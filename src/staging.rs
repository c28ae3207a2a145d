use std::fmt;
use std::fs;
use std::io;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use tempfile::NamedTempFile;
use tempfile::TempPath;

use crate::linux;

/// The platform-specific file backing a staged write.
enum Backing {
    /// Unnamed `O_TMPFILE` file; linked under the staging name at persist time.
    Linux(fs::File),
    /// Exclusively created, named file, removed on drop unless persisted.
    Fallback(NamedTempFile),
}

use self::Backing::*;

/// A staging file living next to its destination.
///
/// Dropping a `StagingFile` that was never persisted leaves nothing behind.
pub(crate) struct StagingFile {
    name: PathBuf,
    backing: Backing,
}

impl StagingFile {
    /// Create a staging file in `dir` that will be named `name` (a sibling
    /// path inside `dir`) when it needs a name.
    ///
    /// The fallback path opens `name` with `O_CREAT | O_EXCL`, so an existing
    /// file or symlink at that name is an `AlreadyExists` error, never reused.
    pub fn create_in(dir: &Path, name: PathBuf) -> io::Result<StagingFile> {
        if let Ok(file) = linux::create_anonymous_in(dir) {
            return Ok(StagingFile {
                name,
                backing: Linux(file),
            });
        }

        let file = create_exclusive(&name)?;
        let path = TempPath::try_from_path(name.clone()).map_err(|error| {
            let _ = fs::remove_file(&name);
            error
        })?;
        Ok(StagingFile {
            backing: Fallback(NamedTempFile::from_parts(file, path)),
            name,
        })
    }

    pub fn file(&self) -> &fs::File {
        match self.backing {
            Linux(ref file) => file,
            Fallback(ref named) => named.as_file(),
        }
    }

    fn file_mut(&mut self) -> &mut fs::File {
        match self.backing {
            Linux(ref mut file) => file,
            Fallback(ref mut named) => named.as_file_mut(),
        }
    }

    /// Atomically replace `dest` with this file, with a single `rename(2)`.
    ///
    /// Whatever is at `dest`, including a symlink, is replaced as a directory
    /// entry; a symlink's destination is never opened.
    pub fn persist_by_rename(self, dest: &Path) -> io::Result<()> {
        let file = match self.backing {
            Linux(file) => file,
            Fallback(named) => return named.persist(dest).map(|_| ()).map_err(|e| e.error),
        };

        linux::link_at(&file, &self.name)?;

        fs::rename(&self.name, dest).map_err(|error| {
            // the name is ours; don't leave it around if we couldn't move it
            let _ = fs::remove_file(&self.name);
            error
        })
    }

    /// Store this file at `dest`, which must not exist.
    pub fn persist_noclobber(self, dest: &Path) -> io::Result<()> {
        match self.backing {
            Linux(file) => linux::link_at(&file, dest),
            Fallback(named) => named
                .persist_noclobber(dest)
                .map(|_| ())
                .map_err(|e| e.error),
        }
    }
}

#[cfg(unix)]
fn create_exclusive(name: &Path) -> io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(name)
}

#[cfg(not(unix))]
fn create_exclusive(name: &Path) -> io::Result<fs::File> {
    fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(name)
}

impl Write for StagingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file_mut().flush()
    }
}

impl fmt::Debug for StagingFile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "StagingFile::{}({})",
            match self.backing {
                Linux(_) => "Linux",
                Fallback(_) => "Fallback",
            },
            self.name.display()
        )
    }
}
