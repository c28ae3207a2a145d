use std::fs;
use std::io;
use std::path::Path;

/// Copy the regular file at `original` into a new file at `backup`.
///
/// `original` is opened without following symlinks, and `backup` is created
/// exclusively. If the copy fails after `backup` was created, it is removed
/// again; a file that was already at `backup` is never touched.
pub(crate) fn copy_to_backup(original: &Path, backup: &Path) -> io::Result<u64> {
    let mut source = open_nofollow(original)?;
    let metadata = source.metadata()?;
    if !metadata.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "backup source is not a regular file",
        ));
    }

    let mut dest = create_private(backup)?;

    let copied = io::copy(&mut source, &mut dest)
        .and_then(|copied| {
            dest.set_permissions(metadata.permissions())?;
            dest.sync_all()?;
            Ok(copied)
        })
        .map_err(|error| {
            let _ = fs::remove_file(backup);
            error
        })?;

    Ok(copied)
}

/// Owner-only until the copy is complete; the source's permissions are
/// applied afterwards.
#[cfg(unix)]
fn create_private(path: &Path) -> io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn create_private(path: &Path) -> io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
}

#[cfg(unix)]
fn open_nofollow(path: &Path) -> io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOFOLLOW)
        .open(path)
}

#[cfg(not(unix))]
fn open_nofollow(path: &Path) -> io::Result<fs::File> {
    if fs::symlink_metadata(path)?.file_type().is_symlink() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "backup source is a symlink",
        ));
    }
    fs::File::open(path)
}
