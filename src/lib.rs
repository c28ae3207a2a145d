//! Replace files without ever writing through a symlink.
//!
//! [`SafeWriter`] stages new content in a sibling file, `fsync`s it, and
//! `rename(2)`s it over the target, so the target is always either the old
//! complete file or the new one. A symlink at the target is refused, and an
//! existing file can be copied to a backup first.
//!
//! [`write_no_symlink_overwrite`] is the one-call form; [`Sponge`] is the
//! buffered, push-style form. [`SafeWriter::create_new`] refuses to replace
//! anything, and [`SafeWriter::write_following_symlinks`] is the explicitly
//! unsafe variant that replaces a symlink's destination.
//!
//! On Linux the staging file is an unnamed `O_TMPFILE` file until it is
//! committed, so an abandoned write leaves nothing in the directory.
//!
//! The library does not log; reporting failures is the caller's business.

#[cfg(target_os = "linux")]
mod linux;

#[cfg(not(target_os = "linux"))]
mod linux {
    use std::fs;
    use std::io;
    use std::path::Path;

    pub fn create_anonymous_in(_dir: &Path) -> io::Result<fs::File> {
        Err(io::ErrorKind::Unsupported.into())
    }

    pub fn link_at(_what: &fs::File, _dest: &Path) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }
}

mod backup;
mod error;
#[cfg(feature = "async")]
mod nonblocking;
mod pattern;
mod sponge;
mod staging;
mod writer;

pub use error::ErrorKind;
pub use error::WriteError;
#[cfg(feature = "async")]
pub use nonblocking::fill_async;
#[cfg(feature = "async")]
pub use nonblocking::write_async;
pub use pattern::NamePattern;
pub use pattern::PatternError;
pub use sponge::Sponge;
pub use writer::write_no_symlink_overwrite;
pub use writer::SafeWriter;
pub use writer::Staged;
pub use writer::Written;
