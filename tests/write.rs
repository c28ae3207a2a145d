use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use rand::rngs::StdRng;
use rand::SeedableRng;
use safe_replace::{write_no_symlink_overwrite, ErrorKind, NamePattern, SafeWriter};

fn entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[cfg(unix)]
fn owner_rw() -> fs::Permissions {
    use std::os::unix::fs::PermissionsExt;
    fs::Permissions::from_mode(0o600)
}

#[cfg(not(unix))]
fn owner_rw() -> fs::Permissions {
    fs::metadata(".").unwrap().permissions()
}

#[test]
fn absent_target_gets_payload() -> io::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let target = dir.path().join("profile");

    let n = write_no_symlink_overwrite(&target, &b"hello"[..], owner_rw(), ".asc-profile-*", "")
        .unwrap();

    assert_eq!(5, n);
    assert_eq!("hello", fs::read_to_string(&target)?);
    assert_eq!(vec!["profile".to_string()], entries(dir.path()));

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        assert_eq!(0o600, fs::metadata(&target)?.permissions().mode() & 0o777);
    }
    Ok(())
}

#[test]
fn existing_target_is_backed_up() -> io::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let target = dir.path().join("profile");
    fs::write(&target, "old")?;

    let n = write_no_symlink_overwrite(
        &target,
        &b"new"[..],
        owner_rw(),
        ".asc-profile-*",
        ".asc-profile-backup-*",
    )
    .unwrap();

    assert_eq!(3, n);
    assert_eq!("new", fs::read_to_string(&target)?);

    let backup_pattern = NamePattern::new(".asc-profile-backup-*").unwrap();
    let backups: Vec<String> = entries(dir.path())
        .into_iter()
        .filter(|name| backup_pattern.matches(name))
        .collect();
    assert_eq!(1, backups.len());
    assert_eq!("old", fs::read_to_string(dir.path().join(&backups[0]))?);
    assert_eq!(2, entries(dir.path()).len());
    Ok(())
}

#[test]
fn written_reports_retained_backup() -> io::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let target = dir.path().join("config.json");
    fs::write(&target, "{}")?;

    let written = SafeWriter::new()
        .backup_pattern(NamePattern::new("config.json.*.bak").unwrap())
        .write(&target, &br#"{"a":1}"#[..])
        .unwrap();

    let backup = written.backup.expect("backup retained");
    assert_eq!(dir.path(), backup.parent().unwrap());
    assert_eq!("{}", fs::read_to_string(&backup)?);
    Ok(())
}

#[test]
fn empty_payload_makes_empty_file() -> io::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let target = dir.path().join("empty");
    fs::write(&target, "not empty")?;

    let written = SafeWriter::new().write(&target, io::empty()).unwrap();

    assert_eq!(0, written.bytes);
    assert_eq!(0, fs::metadata(&target)?.len());
    assert_eq!(vec!["empty".to_string()], entries(dir.path()));
    Ok(())
}

#[test]
fn no_artifacts_after_success() -> io::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let target = dir.path().join("data");
    fs::write(&target, "old")?;

    let mut writer = SafeWriter::new().temp_pattern(NamePattern::new(".data-*").unwrap());
    for round in 0..5 {
        writer
            .write(&target, format!("round {}", round).as_bytes())
            .unwrap();
    }

    assert_eq!("round 4", fs::read_to_string(&target)?);
    assert_eq!(vec!["data".to_string()], entries(dir.path()));
    Ok(())
}

#[cfg(unix)]
#[test]
fn symlink_target_is_refused() -> io::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let real = dir.path().join("real");
    let link = dir.path().join("link");
    fs::write(&real, "real")?;
    std::os::unix::fs::symlink(&real, &link)?;

    let err = write_no_symlink_overwrite(
        &link,
        &b"attacker controlled"[..],
        owner_rw(),
        ".link-*",
        ".link-backup-*",
    )
    .unwrap_err();

    assert_eq!(ErrorKind::SymlinkRefusal, err.kind());
    assert_eq!(link.as_path(), err.path());
    assert_eq!("real", fs::read_to_string(&real)?);
    assert!(fs::symlink_metadata(&link)?.file_type().is_symlink());
    assert_eq!(
        vec!["link".to_string(), "real".to_string()],
        entries(dir.path())
    );
    Ok(())
}

#[cfg(unix)]
#[test]
fn symlink_swapped_in_after_staging_is_refused() -> io::Result<()> {
    use std::io::Write;

    let dir = tempfile::TempDir::new()?;
    let real = dir.path().join("real");
    let target = dir.path().join("target");
    fs::write(&real, "real")?;
    fs::write(&target, "old")?;

    let mut staged = SafeWriter::new().stage(&target).unwrap();
    staged.write_all(b"new")?;

    fs::remove_file(&target)?;
    std::os::unix::fs::symlink(&real, &target)?;

    let err = staged.commit().unwrap_err();
    assert_eq!(ErrorKind::SymlinkRefusal, err.kind());
    assert_eq!("real", fs::read_to_string(&real)?);
    assert_eq!(
        vec!["real".to_string(), "target".to_string()],
        entries(dir.path())
    );
    Ok(())
}

#[test]
fn directory_target_is_invalid_every_time() -> io::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let target = dir.path().join("subdir");
    fs::create_dir(&target)?;
    let before = entries(dir.path());

    for _ in 0..2 {
        let err = write_no_symlink_overwrite(&target, &b"x"[..], owner_rw(), ".subdir-*", "")
            .unwrap_err();
        assert_eq!(ErrorKind::InvalidPath, err.kind());
        assert_eq!(before, entries(dir.path()));
        assert_eq!(0, entries(&target).len());
    }
    Ok(())
}

#[test]
fn missing_parent_is_invalid_every_time() -> io::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let target = dir.path().join("missing").join("file");

    for _ in 0..2 {
        let err = SafeWriter::new().write(&target, &b"x"[..]).unwrap_err();
        assert_eq!(ErrorKind::InvalidPath, err.kind());
        assert!(entries(dir.path()).is_empty());
    }
    Ok(())
}

#[test]
fn pattern_with_separator_is_invalid() -> io::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let target = dir.path().join("file");

    let err = write_no_symlink_overwrite(&target, &b"x"[..], owner_rw(), "../escape-*", "")
        .unwrap_err();
    assert_eq!(ErrorKind::InvalidPath, err.kind());
    assert!(entries(dir.path()).is_empty());
    Ok(())
}

#[test]
fn backup_collision_leaves_target_untouched() -> io::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let target = dir.path().join("profile");
    fs::write(&target, "old")?;

    let temp = NamePattern::new(".profile-*").unwrap();
    let backup = NamePattern::new(".profile-backup-*").unwrap();

    // names are drawn staging first, then backup
    let mut draws = StdRng::seed_from_u64(7);
    let _staging_name = temp.generate(&mut draws);
    let backup_name = backup.generate(&mut draws);
    fs::write(dir.path().join(&backup_name), "squatter")?;

    let err = SafeWriter::new()
        .with_rng(StdRng::seed_from_u64(7))
        .temp_pattern(temp)
        .backup_pattern(backup)
        .write(&target, &b"new"[..])
        .unwrap_err();

    assert_eq!(ErrorKind::BackupFailed, err.kind());
    assert_eq!(
        io::ErrorKind::AlreadyExists,
        err.io_error().map(|e| e.kind()).unwrap()
    );
    assert_eq!("old", fs::read_to_string(&target)?);
    assert_eq!("squatter", fs::read_to_string(dir.path().join(&backup_name))?);
    assert_eq!(
        vec![backup_name, "profile".to_string()],
        entries(dir.path())
    );
    Ok(())
}

#[test]
fn create_new_refuses_existing() -> io::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let target = dir.path().join("profile");

    let written = SafeWriter::new()
        .create_new(&target, &b"first"[..])
        .unwrap();
    assert_eq!(5, written.bytes);

    let err = SafeWriter::new()
        .create_new(&target, &b"second"[..])
        .unwrap_err();
    assert_eq!(ErrorKind::IoFailure, err.kind());
    assert_eq!(
        io::ErrorKind::AlreadyExists,
        err.io_error().map(|e| e.kind()).unwrap()
    );
    assert_eq!("first", fs::read_to_string(&target)?);
    assert_eq!(vec!["profile".to_string()], entries(dir.path()));
    Ok(())
}

#[cfg(unix)]
#[test]
fn create_new_refuses_symlink() -> io::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let link = dir.path().join("link");
    std::os::unix::fs::symlink(dir.path().join("nowhere"), &link)?;

    let err = SafeWriter::new().create_new(&link, &b"x"[..]).unwrap_err();
    assert_eq!(ErrorKind::SymlinkRefusal, err.kind());
    assert!(!dir.path().join("nowhere").exists());
    Ok(())
}

#[cfg(unix)]
#[test]
fn following_replaces_link_destination() -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::TempDir::new()?;
    let real = dir.path().join("real");
    let link = dir.path().join("link");
    fs::write(&real, "real")?;
    fs::set_permissions(&real, fs::Permissions::from_mode(0o640))?;
    std::os::unix::fs::symlink(&real, &link)?;

    let written = SafeWriter::new()
        .write_following_symlinks(&link, &b"replaced"[..])
        .unwrap();

    assert_eq!(8, written.bytes);
    assert!(fs::symlink_metadata(&link)?.file_type().is_symlink());
    assert_eq!("replaced", fs::read_to_string(&real)?);
    assert_eq!(0o640, fs::metadata(&real)?.permissions().mode() & 0o777);
    assert_eq!(
        vec!["link".to_string(), "real".to_string()],
        entries(dir.path())
    );
    Ok(())
}

#[cfg(unix)]
#[test]
fn following_regular_file_uses_configured_mode() -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::TempDir::new()?;
    let target = dir.path().join("plain");
    fs::write(&target, "old")?;
    fs::set_permissions(&target, fs::Permissions::from_mode(0o644))?;

    SafeWriter::new()
        .mode(0o600)
        .write_following_symlinks(&target, &b"new"[..])
        .unwrap();

    assert_eq!("new", fs::read_to_string(&target)?);
    assert_eq!(0o600, fs::metadata(&target)?.permissions().mode() & 0o777);
    Ok(())
}

#[cfg(unix)]
#[test]
fn following_dangling_link_is_invalid() -> io::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let link = dir.path().join("link");
    std::os::unix::fs::symlink(dir.path().join("nowhere"), &link)?;

    let err = SafeWriter::new()
        .write_following_symlinks(&link, &b"x"[..])
        .unwrap_err();
    assert_eq!(ErrorKind::InvalidPath, err.kind());
    assert_eq!(vec!["link".to_string()], entries(dir.path()));
    Ok(())
}

/// Yields `good` bytes, then fails.
struct Truncated {
    good: usize,
}

impl io::Read for Truncated {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.good == 0 {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "payload cut off"));
        }
        let n = self.good.min(buf.len());
        buf[..n].fill(b'x');
        self.good -= n;
        Ok(n)
    }
}

#[test]
fn failing_payload_leaves_target_alone() -> io::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let target = dir.path().join("profile");
    fs::write(&target, "old")?;

    let err = SafeWriter::new()
        .temp_pattern(NamePattern::new(".profile-*").unwrap())
        .backup_pattern(NamePattern::new(".profile-backup-*").unwrap())
        .write(&target, Truncated { good: 100_000 })
        .unwrap_err();

    assert_eq!(ErrorKind::IoFailure, err.kind());
    assert_eq!(
        io::ErrorKind::ConnectionReset,
        err.io_error().map(|e| e.kind()).unwrap()
    );
    assert!(err.retained_backup().is_none());
    assert_eq!("old", fs::read_to_string(&target)?);
    assert_eq!(vec!["profile".to_string()], entries(dir.path()));
    Ok(())
}

#[test]
fn readers_see_old_or_new_never_partial() -> io::Result<()> {
    const LEN: usize = 1 << 20;

    let dir = tempfile::TempDir::new()?;
    let target = dir.path().join("big");
    fs::write(&target, vec![b'a'; LEN])?;

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let target = target.clone();
        let done = done.clone();
        thread::spawn(move || {
            let mut reads = 0;
            while !done.load(Ordering::SeqCst) || reads == 0 {
                let content = fs::read(&target).unwrap();
                assert_eq!(LEN, content.len());
                let first = content[0];
                assert!(content.iter().all(|&b| b == first));
                reads += 1;
            }
        })
    };

    let mut writer = SafeWriter::new();
    for round in 0..20 {
        let fill = if round % 2 == 0 { b'b' } else { b'a' };
        writer.write(&target, &vec![fill; LEN][..]).unwrap();
    }
    done.store(true, Ordering::SeqCst);
    reader.join().unwrap();

    assert_eq!(vec!["big".to_string()], entries(dir.path()));
    Ok(())
}
