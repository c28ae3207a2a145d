use std::env;
use std::io;
use std::path::Path;

use crate::error::WriteError;
use crate::writer::SafeWriter;
use crate::writer::Staged;
use crate::writer::Written;

/// A buffered, push-style front end for a safe write.
///
/// A `Sponge` will "soak up" writes, and eventually, when you're ready, write them to the
/// destination file. Until [`commit`](Sponge::commit) the destination is untouched; after it,
/// the destination is the complete new content. Dropping a `Sponge` abandons the write and
/// removes its staging file.
///
/// Commit goes through [`SafeWriter`]: a symlink at the destination is refused, not followed.
///
/// Space is needed to soak up these writes: if you are overwriting a large file, you may need
/// disc space for the entire file to be stored twice.
///
/// # Example
///
/// ```rust
/// # use std::io::Write;
/// # let dir = tempfile::TempDir::new().unwrap();
/// # let path = dir.path().join("example.txt");
/// let mut temp = safe_replace::Sponge::new_for(&path).unwrap();
/// temp.write_all(b"hello").unwrap();
/// temp.commit().unwrap();
/// ```
pub struct Sponge {
    temp: io::BufWriter<Staged>,
}

impl Sponge {
    /// Create a `Sponge` which will eventually overwrite the named file, using a default
    /// [`SafeWriter`]. The file does not have to exist; its directory does.
    ///
    /// A relative path is resolved against the current directory immediately, so a later
    /// `chdir` doesn't redirect the commit.
    pub fn new_for<P: AsRef<Path>>(path: P) -> Result<Sponge, WriteError> {
        let path = path.as_ref();

        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            let mut absolute = env::current_dir().map_err(|e| WriteError::io(path, e))?;
            absolute.push(path);
            absolute
        };

        SafeWriter::new().sponge(path)
    }

    pub(crate) fn from_staged(staged: Staged) -> Sponge {
        Sponge {
            temp: io::BufWriter::new(staged),
        }
    }

    /// Write the `Sponge` out to the destination file.
    ///
    /// The staged content is flushed and `fsync`ed before it is renamed into place. This
    /// method consumes `self`, so errors are not recoverable; the destination is unchanged
    /// by any failure before the rename.
    pub fn commit(self) -> Result<Written, WriteError> {
        let staged = self.temp.into_inner().map_err(|e| {
            let (error, buf) = e.into_parts();
            WriteError::io(buf.get_ref().target(), error)
        })?;
        staged.commit()
    }
}

/// A `Sponge` is a `BufWriter`.
impl io::Write for Sponge {
    /// `write` to the intermediate file, without touching the destination.
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        self.temp.write(buf)
    }

    /// `flush` to the intermediate file, without touching the destination.
    fn flush(&mut self) -> Result<(), io::Error> {
        self.temp.flush()
    }
}
