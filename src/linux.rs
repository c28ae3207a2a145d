use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::FromRawFd;
use std::path::Path;

use libc::c_char;
use libc::linkat;
use libc::open;
use libc::AT_FDCWD;
use libc::AT_SYMLINK_FOLLOW;
use libc::O_CLOEXEC;
use libc::O_RDWR;
use libc::O_TMPFILE;

/// Create an unnamed file in `dir`. It has no directory entry until
/// [`link_at`] gives it one, and disappears with the descriptor otherwise.
pub fn create_anonymous_in(dir: &Path) -> io::Result<fs::File> {
    // linking back in goes through procfs
    if !Path::new("/proc/self/fd").is_dir() {
        return Err(io::ErrorKind::Unsupported.into());
    }

    let path = cstr(dir)?;
    match unsafe { open(path.as_ptr(), O_CLOEXEC | O_TMPFILE | O_RDWR, 0o600) } {
        -1 => Err(io::Error::last_os_error()),
        fd => Ok(unsafe { FromRawFd::from_raw_fd(fd) }),
    }
}

/// Give an anonymous file the name `dest`.
///
/// Fails with `AlreadyExists` if anything, including a dangling symlink, is
/// already at `dest`; nothing at `dest` is followed or replaced.
pub fn link_at(what: &fs::File, dest: &Path) -> io::Result<()> {
    let proc_path = format!("/proc/self/fd/{}", what.as_raw_fd());
    let old_path = cstr(Path::new(&proc_path))?;
    let new_path = cstr(dest)?;

    unsafe { link_symlink_fd_at(&old_path, &new_path) }
}

fn cstr(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contained a null"))
}

unsafe fn link_symlink_fd_at(old_path: &CString, new_path: &CString) -> io::Result<()> {
    if linkat(
        AT_FDCWD,
        old_path.as_ptr() as *const c_char,
        AT_FDCWD,
        new_path.as_ptr() as *const c_char,
        AT_SYMLINK_FOLLOW,
    ) != 0
    {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}
