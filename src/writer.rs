use std::fs;
use std::io;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use rand::rngs::ThreadRng;
use rand::CryptoRng;
use rand::RngCore;

use crate::backup;
use crate::error::WriteError;
use crate::pattern::NamePattern;
use crate::sponge::Sponge;
use crate::staging::StagingFile;

/// The outcome of a successful write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Written {
    /// Bytes of payload now at the target.
    pub bytes: u64,
    /// The backup of the previous content, if one was made and retained.
    /// Ownership of this file passes to the caller.
    pub backup: Option<PathBuf>,
}

/// Replaces files atomically, never writing through a symlink.
///
/// Each write streams the payload into a staging file next to the target,
/// `fsync`s it, applies the configured permissions, checks the target with
/// `lstat`, optionally copies the old content to a backup, and finally
/// `rename(2)`s the staging file over the target. Until that rename the
/// target is untouched; after it, the target is the complete new file.
///
/// A symlink at the target is refused with
/// [`WriteError::SymlinkRefusal`]. If an adversary swaps a symlink in after
/// the check, the rename replaces the link itself; its destination is never
/// opened for writing.
///
/// A `SafeWriter` holds no per-target state and can be reused. It does not
/// serialize concurrent writes to the same target: the last rename wins.
///
/// # Example
///
/// ```rust
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// # let dir = tempfile::TempDir::new()?;
/// # let path = dir.path().join("profile.mobileprovision");
/// use safe_replace::{NamePattern, SafeWriter};
///
/// let written = SafeWriter::new()
///     .temp_pattern(NamePattern::new(".asc-profile-*")?)
///     .backup_pattern(NamePattern::new(".asc-profile-backup-*")?)
///     .write(&path, &b"profile bytes"[..])?;
/// assert_eq!(13, written.bytes);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SafeWriter<R = ThreadRng> {
    permissions: Option<fs::Permissions>,
    temp: Option<NamePattern>,
    backup: Option<NamePattern>,
    retain_backup: bool,
    rng: R,
}

impl SafeWriter<ThreadRng> {
    /// A writer producing `0o644` files (on unix), with the default staging
    /// pattern and no backups.
    pub fn new() -> SafeWriter<ThreadRng> {
        SafeWriter {
            permissions: default_permissions(),
            temp: None,
            backup: None,
            retain_backup: true,
            rng: rand::thread_rng(),
        }
    }
}

impl Default for SafeWriter<ThreadRng> {
    fn default() -> Self {
        SafeWriter::new()
    }
}

#[cfg(unix)]
fn default_permissions() -> Option<fs::Permissions> {
    use std::os::unix::fs::PermissionsExt;
    Some(fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn default_permissions() -> Option<fs::Permissions> {
    None
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Replace,
    CreateNew,
}

impl<R: RngCore + CryptoRng> SafeWriter<R> {
    /// Use `rng` for the staging and backup name tokens.
    pub fn with_rng<S: RngCore + CryptoRng>(self, rng: S) -> SafeWriter<S> {
        SafeWriter {
            permissions: self.permissions,
            temp: self.temp,
            backup: self.backup,
            retain_backup: self.retain_backup,
            rng,
        }
    }

    /// Permissions for the final file.
    pub fn permissions(mut self, permissions: fs::Permissions) -> Self {
        self.permissions = Some(permissions);
        self
    }

    /// Mode bits for the final file.
    #[cfg(unix)]
    pub fn mode(self, mode: u32) -> Self {
        use std::os::unix::fs::PermissionsExt;
        self.permissions(fs::Permissions::from_mode(mode))
    }

    /// Name template for staging files. Defaults to `.<file name>.*.tmp`.
    pub fn temp_pattern(mut self, pattern: NamePattern) -> Self {
        self.temp = Some(pattern);
        self
    }

    /// Back up an existing target under this template before replacing it.
    /// An empty pattern turns backups off.
    pub fn backup_pattern(mut self, pattern: NamePattern) -> Self {
        self.backup = if pattern.is_empty() {
            None
        } else {
            Some(pattern)
        };
        self
    }

    /// Whether a backup survives a successful write (the default), or is
    /// removed once the new content is in place.
    pub fn retain_backup(mut self, retain: bool) -> Self {
        self.retain_backup = retain;
        self
    }

    /// Atomically replace `target` with the contents of `payload`.
    pub fn write<P: AsRef<Path>, T: Read>(
        &mut self,
        target: P,
        mut payload: T,
    ) -> Result<Written, WriteError> {
        let mut staged = self.stage(target)?;
        staged.fill(&mut payload)?;
        staged.commit()
    }

    /// Write `payload` to `target`, which must not exist yet.
    ///
    /// An existing file fails with an [`io::ErrorKind::AlreadyExists`]
    /// I/O failure; a symlink still fails with
    /// [`WriteError::SymlinkRefusal`].
    pub fn create_new<P: AsRef<Path>, T: Read>(
        &mut self,
        target: P,
        mut payload: T,
    ) -> Result<Written, WriteError> {
        let mut staged = self.stage_as(target.as_ref(), Mode::CreateNew)?;
        staged.fill(&mut payload)?;
        staged.commit()
    }

    /// Replace the file a symlink at `target` points to, instead of refusing.
    ///
    /// **This gives up the symlink guarantee.** Whoever controls the link
    /// controls which file is replaced. The replacement itself is still
    /// staged and renamed atomically, and takes over the owner and
    /// permissions of the file it replaces. The link is left in place.
    ///
    /// A dangling link fails with [`WriteError::InvalidPath`]. A target that
    /// is not a symlink is written exactly as [`write`](Self::write) would.
    pub fn write_following_symlinks<P: AsRef<Path>, T: Read>(
        &mut self,
        target: P,
        mut payload: T,
    ) -> Result<Written, WriteError> {
        let target = target.as_ref();
        let is_link = match fs::symlink_metadata(target) {
            Ok(ref metadata) => metadata.file_type().is_symlink(),
            Err(_) => false,
        };
        if !is_link {
            return self.write(target, payload);
        }

        let resolved = fs::canonicalize(target).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => WriteError::invalid(target, "symlink points to nothing"),
            _ => WriteError::io(target, e),
        })?;

        let mut staged = self.stage_as(&resolved, Mode::Replace)?;
        staged.inherit_from = Some(resolved);
        staged.fill(&mut payload)?;
        staged.commit()
    }

    /// Start a write to `target`, to be fed through [`io::Write`] and then
    /// [`Staged::commit`]ted.
    ///
    /// The target is checked now as well as at commit time: a directory fails
    /// with [`WriteError::InvalidPath`] and a symlink with
    /// [`WriteError::SymlinkRefusal`] before any staging file exists.
    pub fn stage<P: AsRef<Path>>(&mut self, target: P) -> Result<Staged, WriteError> {
        self.stage_as(target.as_ref(), Mode::Replace)
    }

    /// A buffered [`Sponge`] over a staged write to `target`.
    pub fn sponge<P: AsRef<Path>>(&mut self, target: P) -> Result<Sponge, WriteError> {
        Ok(Sponge::from_staged(self.stage(target)?))
    }

    fn stage_as(&mut self, target: &Path, mode: Mode) -> Result<Staged, WriteError> {
        let (parent, file_name) = split_target(target)?;

        match inspect(target)? {
            Existing::Nothing => (),
            Existing::File if mode == Mode::CreateNew => {
                return Err(WriteError::io(
                    target,
                    io::Error::new(io::ErrorKind::AlreadyExists, "target already exists"),
                ));
            }
            Existing::File => (),
        }

        let temp = self
            .temp
            .clone()
            .unwrap_or_else(|| NamePattern::staging_for(&file_name));
        let staging_name = parent.join(temp.generate(&mut self.rng));

        let backup = match (mode, self.backup.as_ref()) {
            (Mode::Replace, Some(pattern)) => Some(PendingBackup {
                path: parent.join(pattern.generate(&mut self.rng)),
                retain: self.retain_backup,
            }),
            _ => None,
        };

        let staging =
            StagingFile::create_in(&parent, staging_name).map_err(|e| WriteError::io(target, e))?;

        Ok(Staged {
            target: target.to_path_buf(),
            parent,
            staging,
            written: 0,
            permissions: self.permissions.clone(),
            backup,
            inherit_from: None,
            mode,
        })
    }
}

#[derive(Debug)]
struct PendingBackup {
    path: PathBuf,
    retain: bool,
}

/// A write in progress. Feed it with [`io::Write`], then [`commit`](Self::commit).
///
/// Dropping a `Staged` without committing removes the staging file and leaves
/// the target as it was.
#[derive(Debug)]
pub struct Staged {
    target: PathBuf,
    parent: PathBuf,
    staging: StagingFile,
    written: u64,
    permissions: Option<fs::Permissions>,
    backup: Option<PendingBackup>,
    inherit_from: Option<PathBuf>,
    mode: Mode,
}

impl Staged {
    /// The path this write will replace. For a followed symlink, the file it
    /// resolved to.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    fn fill<T: Read + ?Sized>(&mut self, payload: &mut T) -> Result<u64, WriteError> {
        io::copy(payload, self).map_err(|e| WriteError::io(&self.target, e))
    }

    #[cfg(feature = "async")]
    pub(crate) fn staging_file(&self) -> &fs::File {
        self.staging.file()
    }

    #[cfg(feature = "async")]
    pub(crate) fn add_written(&mut self, bytes: u64) {
        self.written += bytes;
    }

    /// Make the staged content visible at the target.
    ///
    /// On any error before the final rename the target is byte-for-byte
    /// unchanged and the staging file is gone.
    pub fn commit(mut self) -> Result<Written, WriteError> {
        let target = self.target.clone();

        self.staging
            .flush()
            .and_then(|()| self.staging.file().sync_all())
            .map_err(|e| WriteError::io(&target, e))?;

        self.apply_metadata()
            .map_err(|e| WriteError::io(&target, e))?;

        let existing = inspect(&target)?;

        if self.mode == Mode::CreateNew {
            self.staging
                .persist_noclobber(&target)
                .map_err(|e| WriteError::io(&target, e))?;
            sync_dir(&self.parent);
            return Ok(Written {
                bytes: self.written,
                backup: None,
            });
        }

        let backup = match (existing, self.backup.take()) {
            (Existing::File, Some(backup)) => {
                backup::copy_to_backup(&target, &backup.path)
                    .map_err(|e| WriteError::backup(&target, e))?;
                Some(backup)
            }
            _ => None,
        };

        if let Err(e) = self.staging.persist_by_rename(&target) {
            return Err(WriteError::io(&target, e).with_backup(backup.map(|b| b.path)));
        }

        sync_dir(&self.parent);

        let backup = match backup {
            Some(backup) if !backup.retain => match fs::remove_file(&backup.path) {
                Ok(()) => None,
                // couldn't clean up; hand it to the caller instead
                Err(_) => Some(backup.path),
            },
            Some(backup) => Some(backup.path),
            None => None,
        };

        Ok(Written {
            bytes: self.written,
            backup,
        })
    }

    fn apply_metadata(&self) -> io::Result<()> {
        if let Some(ref source) = self.inherit_from {
            if copy_metadata(source, self.staging.file())? {
                return Ok(());
            }
        }

        match self.permissions {
            Some(ref permissions) => self.staging.file().set_permissions(permissions.clone()),
            None => Ok(()),
        }
    }
}

impl Write for Staged {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.staging.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.staging.flush()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Existing {
    Nothing,
    File,
}

/// `lstat` the target and sort it into something we may replace, or an error.
fn inspect(target: &Path) -> Result<Existing, WriteError> {
    match fs::symlink_metadata(target) {
        Ok(metadata) => {
            let file_type = metadata.file_type();
            if file_type.is_symlink() {
                Err(WriteError::symlink(target))
            } else if file_type.is_dir() {
                Err(WriteError::invalid(target, "target is a directory"))
            } else if !file_type.is_file() {
                Err(WriteError::invalid(target, "target is not a regular file"))
            } else {
                Ok(Existing::File)
            }
        }
        Err(ref e) if io::ErrorKind::NotFound == e.kind() => Ok(Existing::Nothing),
        Err(e) => Err(WriteError::io(target, e)),
    }
}

/// Split `target` into its (existing, directory) parent and its file name.
fn split_target(target: &Path) -> Result<(PathBuf, String), WriteError> {
    if target.as_os_str().is_empty() {
        return Err(WriteError::invalid(target, "path is empty"));
    }

    let file_name = target
        .file_name()
        .ok_or_else(|| WriteError::invalid(target, "path has no file name"))?
        .to_string_lossy()
        .into_owned();

    let parent = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    match fs::metadata(&parent) {
        Ok(ref metadata) if metadata.is_dir() => Ok((parent, file_name)),
        Ok(_) => Err(WriteError::invalid(target, "parent is not a directory")),
        Err(ref e) if io::ErrorKind::NotFound == e.kind() => Err(WriteError::invalid(
            target,
            "parent directory does not exist",
        )),
        Err(e) => Err(WriteError::io(target, e)),
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    // the rename already happened; durability of the entry is best-effort
    let _ = fs::File::open(dir).and_then(|dir| dir.sync_all());
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

/// Give `dest` the permissions and, on unix, the owner of `source`.
/// Returns `false` if `source` doesn't exist.
fn copy_metadata(source: &Path, dest: &fs::File) -> io::Result<bool> {
    let metadata = match source.metadata() {
        Ok(metadata) => metadata,
        Err(ref e) if io::ErrorKind::NotFound == e.kind() => {
            return Ok(false);
        }
        Err(e) => Err(e)?,
    };

    dest.set_permissions(metadata.permissions())?;

    #[cfg(unix)]
    unix_chown::chown(metadata, dest)?;

    Ok(true)
}

#[cfg(unix)]
mod unix_chown {
    use std::fs;
    use std::io;
    use std::os::unix::fs::MetadataExt;
    use std::os::unix::io::AsRawFd;

    pub fn chown(source: fs::Metadata, dest: &fs::File) -> Result<(), io::Error> {
        let fd = dest.as_raw_fd();
        zero_success(unsafe { libc::fchown(fd, source.uid(), source.gid()) })?;
        Ok(())
    }

    fn zero_success(err: libc::c_int) -> Result<(), io::Error> {
        if 0 == err {
            return Ok(());
        }

        Err(io::Error::last_os_error())
    }
}

/// Atomically replace `target` with `payload`, refusing to write through a
/// symlink.
///
/// `temp_pattern` and `backup_pattern` are [`NamePattern`] templates. An
/// empty `backup_pattern` means no backup; otherwise an existing target is
/// copied to a fresh backup file first, which is left for the caller. Returns
/// the number of bytes written.
///
/// ```rust
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// # let dir = tempfile::TempDir::new()?;
/// # let path = dir.path().join("hello.txt");
/// # #[cfg(unix)] {
/// use std::fs::Permissions;
/// use std::os::unix::fs::PermissionsExt;
///
/// let n = safe_replace::write_no_symlink_overwrite(
///     &path,
///     &b"hello"[..],
///     Permissions::from_mode(0o600),
///     ".hello-*",
///     "",
/// )?;
/// assert_eq!(5, n);
/// # }
/// # Ok(())
/// # }
/// ```
pub fn write_no_symlink_overwrite<P: AsRef<Path>, T: Read>(
    target: P,
    payload: T,
    permissions: fs::Permissions,
    temp_pattern: &str,
    backup_pattern: &str,
) -> Result<u64, WriteError> {
    let target = target.as_ref();
    let temp = NamePattern::new(temp_pattern)
        .map_err(|_| WriteError::invalid(target, "temp pattern contains a path separator"))?;
    let backup = NamePattern::new(backup_pattern)
        .map_err(|_| WriteError::invalid(target, "backup pattern contains a path separator"))?;

    SafeWriter::new()
        .permissions(permissions)
        .temp_pattern(temp)
        .backup_pattern(backup)
        .write(target, payload)
        .map(|written| written.bytes)
}
