use std::fs;
use std::io;
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use safe_replace::{NamePattern, SafeWriter, WriteError, Written};
use tracing::{debug, info, metadata::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "safe-replace",
    version,
    about = "Atomically write a file without following symlinks",
    long_about = None
)]
struct Cli {
    /// File to write
    target: PathBuf,

    /// Read the new content from this file instead of stdin
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Replace the target if it exists (otherwise it must not exist)
    #[arg(short, long)]
    force: bool,

    /// With --force, replace the file a symlink target points to instead of refusing
    #[arg(long, requires = "force")]
    follow_symlinks: bool,

    /// Permission bits of the written file, in octal
    #[arg(short, long, default_value = "644", value_parser = parse_mode)]
    mode: u32,

    /// Staging file name template; the last '*' becomes a random token
    #[arg(long, env = "SAFE_REPLACE_TEMP_PATTERN")]
    temp_pattern: Option<String>,

    /// Back up an existing target under this name template before replacing it
    #[arg(long, env = "SAFE_REPLACE_BACKUP_PATTERN")]
    backup_pattern: Option<String>,

    /// Keep the backup after a successful write
    #[arg(long, requires = "backup_pattern")]
    keep_backup: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn parse_mode(s: &str) -> Result<u32, String> {
    let mode = u32::from_str_radix(s.trim_start_matches("0o"), 8)
        .map_err(|e| format!("not an octal mode: {e}"))?;
    if mode > 0o7777 {
        return Err(format!("mode {s} out of range"));
    }
    Ok(mode)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(&cli) {
        Ok(written) => {
            println!("wrote {} bytes to {}", written.bytes, cli.target.display());
            if let Some(backup) = written.backup {
                println!("backup: {}", backup.display());
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            report(&err);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn report(err: &anyhow::Error) {
    match err.downcast_ref::<WriteError>() {
        Some(write_err) => {
            if let Some(backup) = write_err.retained_backup() {
                warn!(backup = %backup.display(), "previous content left in backup");
            }
            eprintln!(
                "error: {}: {}: {}",
                write_err.kind(),
                write_err.path().display(),
                write_err
            );
        }
        None => eprintln!("error: {err:#}"),
    }
}

fn run(cli: &Cli) -> Result<Written> {
    let mut writer = build_writer(cli)?;
    let payload = open_payload(cli)?;

    debug!(
        path = %cli.target.display(),
        force = cli.force,
        follow_symlinks = cli.follow_symlinks,
        "writing"
    );

    let written = if !cli.force {
        writer.create_new(&cli.target, payload)?
    } else if cli.follow_symlinks {
        warn!(path = %cli.target.display(), "following symlinks at the target");
        writer.write_following_symlinks(&cli.target, payload)?
    } else {
        writer.write(&cli.target, payload)?
    };

    info!(bytes = written.bytes, path = %cli.target.display(), "written");
    Ok(written)
}

fn build_writer(cli: &Cli) -> Result<SafeWriter> {
    let mut writer = SafeWriter::new().retain_backup(cli.keep_backup);

    #[cfg(unix)]
    {
        writer = writer.mode(cli.mode);
    }
    #[cfg(not(unix))]
    debug!(mode = cli.mode, "permission bits ignored on this platform");

    if let Some(ref pattern) = cli.temp_pattern {
        writer = writer.temp_pattern(
            NamePattern::new(pattern).context("invalid --temp-pattern")?,
        );
    }
    if let Some(ref pattern) = cli.backup_pattern {
        let pattern = NamePattern::new(pattern).context("invalid --backup-pattern")?;
        if cli.force {
            writer = writer.backup_pattern(pattern);
        } else {
            // nothing is ever replaced without --force
            debug!(%pattern, "backup pattern unused");
        }
    }

    Ok(writer)
}

fn open_payload(cli: &Cli) -> Result<Box<dyn Read>> {
    Ok(match cli.input {
        Some(ref input) => Box::new(
            fs::File::open(input)
                .with_context(|| format!("failed to open input {}", input.display()))?,
        ),
        None => Box::new(io::stdin().lock()),
    })
}
