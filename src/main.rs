use anyhow::Result;
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

use medorg::{
    run_backup, run_checksums, run_restore, volume, AliasSpec, BackupOptions, ChecksumOptions,
    Config, RestoreOptions, SourceRoot, VolumeCopier,
};

// Exit codes shared with the other front-ends.
const EXIT_CONFIG: i32 = 1;
const EXIT_NOT_FOUND: i32 = 3;
const EXIT_RESTORE: i32 = 5;

#[derive(Parser)]
#[command(
    name = "medorg",
    version,
    about = "Multi-volume content-addressed file backup"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Quiet mode (no summary output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Refresh per-directory checksum metadata
    Checksum {
        /// Directories to scan
        #[arg(required = true)]
        dirs: Vec<PathBuf>,

        /// Recompute digests even for unchanged files
        #[arg(short, long)]
        force: bool,

        /// Verify stored digests against file contents
        #[arg(long)]
        validate: bool,

        /// Drop stored digests and volume labels before recomputing
        #[arg(long)]
        scrub: bool,

        /// Maximum simultaneous hash computations
        #[arg(short = 'j', long, default_value_t = medorg::checksum::DEFAULT_HASH_TOKENS)]
        concurrency: usize,

        /// Let the adaptive tuner resize the hash pool
        #[arg(long)]
        tune: bool,

        /// Exclude files matching glob patterns (can be used multiple times)
        #[arg(short, long, value_name = "PATTERN")]
        exclude: Vec<String>,
    },

    /// Back up sources onto a labelled volume
    Backup {
        /// Sources as alias=path (or plain paths, aliased by directory name)
        #[arg(required = true)]
        sources: Vec<String>,

        /// Destination volume root
        #[arg(short, long)]
        dest: PathBuf,

        /// Stop copying to a file once it lives on this many volumes
        #[arg(long, default_value_t = 2)]
        max_dests: usize,

        /// Scan and reconcile labels without copying
        #[arg(long)]
        scan_only: bool,

        /// Write a restore journal here afterwards
        #[arg(long, value_name = "PATH")]
        journal: Option<PathBuf>,

        /// Tag the destination with a fresh label if it has none
        #[arg(long)]
        init_volume: bool,

        #[arg(short = 'j', long, default_value_t = medorg::checksum::DEFAULT_HASH_TOKENS)]
        concurrency: usize,

        #[arg(long)]
        tune: bool,

        #[arg(short, long, value_name = "PATTERN")]
        exclude: Vec<String>,
    },

    /// Restore files from an attached backup volume using a journal
    Restore {
        /// Journal file written by a backup
        journal: PathBuf,

        /// Root of the attached backup volume
        volume: PathBuf,

        /// Restore destinations as alias=path (can be used multiple times)
        #[arg(short = 't', long = "to", value_name = "ALIAS=PATH")]
        to: Vec<String>,
    },

    /// Show or create a volume label
    Label {
        path: PathBuf,

        /// Tag the volume if it has no label yet
        #[arg(long)]
        create: bool,

        /// Replace the label, orphaning all references to the old one
        #[arg(long, conflicts_with = "create")]
        recreate: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("{} {e:#}", "Error:".red());
            process::exit(1);
        }
    }
}

fn parse_alias(spec: &str) -> Result<(String, PathBuf)> {
    match spec.split_once('=') {
        Some((alias, path)) if !alias.is_empty() && !path.is_empty() => {
            Ok((alias.to_string(), PathBuf::from(path)))
        }
        Some(_) => anyhow::bail!("expected alias=path, got '{spec}'"),
        None => {
            let path = PathBuf::from(spec);
            let alias = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| anyhow::anyhow!("cannot derive an alias from '{spec}'"))?;
            Ok((alias, path))
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Checksum { dirs, force, validate, scrub, concurrency, tune, exclude } => {
            for dir in &dirs {
                if !dir.is_dir() {
                    eprintln!("{} no such directory: {}", "Error:".red(), dir.display());
                    return Ok(EXIT_NOT_FOUND);
                }
            }
            let opts = ChecksumOptions {
                force,
                validate,
                scrub,
                max_concurrent: concurrency.max(1),
                tune,
                ignore_patterns: exclude,
                ..ChecksumOptions::default()
            };
            let report = run_checksums(&dirs, &opts)?;
            if !cli.quiet {
                println!(
                    "{} {} files seen, {} hashed ({})",
                    "Done.".green().bold(),
                    report.files,
                    report.hashed,
                    format_bytes(report.bytes_hashed)
                );
                for path in &report.mismatches {
                    println!("{} {}", "mismatch:".red(), path.display());
                }
            }
            Ok(if report.mismatches.is_empty() { 0 } else { 1 })
        }

        Command::Backup {
            sources,
            dest,
            max_dests,
            scan_only,
            journal,
            init_volume,
            concurrency,
            tune,
            exclude,
        } => {
            let mut roots = Vec::new();
            for spec in &sources {
                let (alias, path) = match parse_alias(spec) {
                    Ok(pair) => pair,
                    Err(e) => {
                        eprintln!("{} {e:#}", "Error:".red());
                        return Ok(EXIT_CONFIG);
                    }
                };
                if !path.is_dir() {
                    eprintln!("{} no such source: {}", "Error:".red(), path.display());
                    return Ok(EXIT_NOT_FOUND);
                }
                roots.push(SourceRoot::new(alias, path));
            }
            if !dest.is_dir() {
                eprintln!("{} no such destination: {}", "Error:".red(), dest.display());
                return Ok(EXIT_NOT_FOUND);
            }
            if init_volume {
                volume::ensure_label(&dest)?;
            }

            let opts = BackupOptions {
                max_dests,
                hash_concurrency: concurrency.max(1),
                tune,
                ignore_patterns: exclude,
                journal,
                ..BackupOptions::default()
            };
            let orphans = Mutex::new(Vec::new());
            let orphan_cb = |path: &Path| orphans.lock().unwrap().push(path.to_path_buf());
            let copier = VolumeCopier::new();

            let summary = run_backup(
                &roots,
                &dest,
                &opts,
                Some(&orphan_cb),
                if scan_only { None } else { Some(&copier) },
            )?;

            if !cli.quiet {
                println!(
                    "{} {} copied ({}), {} already present, {} failed, {} orphans",
                    "Done.".green().bold(),
                    summary.copied,
                    format_bytes(summary.bytes_copied),
                    summary.already_present,
                    summary.failed,
                    summary.orphans
                );
                if summary.volume_full {
                    println!("{}", "volume full: backup is partial but consistent".yellow());
                }
                for path in orphans.lock().unwrap().iter() {
                    println!("{} {}", "orphan:".yellow(), path.display());
                }
            }
            Ok(0)
        }

        Command::Restore { journal, volume: vol, to } => {
            if !journal.is_file() {
                eprintln!("{} no such journal: {}", "Error:".red(), journal.display());
                return Ok(EXIT_NOT_FOUND);
            }
            let mut config = Config::new();
            for spec in &to {
                let (alias, path) = match spec.split_once('=') {
                    Some((a, p)) if !a.is_empty() && !p.is_empty() => {
                        (a.to_string(), PathBuf::from(p))
                    }
                    _ => {
                        eprintln!("{} expected ALIAS=PATH, got '{spec}'", "Error:".red());
                        return Ok(EXIT_CONFIG);
                    }
                };
                config.add_alias(alias, AliasSpec { source: path, restore_to: None });
            }

            let summary = match run_restore(&journal, &vol, &config, &RestoreOptions::default()) {
                Ok(summary) => summary,
                Err(e) => {
                    eprintln!("{} {e:#}", "Error:".red());
                    return Ok(EXIT_RESTORE);
                }
            };

            if !cli.quiet {
                println!(
                    "{} {} restored, {} already correct, {} failed",
                    "Done.".green().bold(),
                    summary.restored,
                    summary.already_correct,
                    summary.failed
                );
                if !summary.needed.is_empty() {
                    let labels: Vec<&str> =
                        summary.needed.iter().map(|l| l.as_str()).collect();
                    println!("{} {}", "still needed:".yellow(), labels.join(", "));
                }
                for alias in &summary.skipped_aliases {
                    println!("{} no destination for alias '{alias}'", "skipped:".yellow());
                }
            }
            Ok(if summary.failed > 0 { EXIT_RESTORE } else { 0 })
        }

        Command::Label { path, create, recreate } => {
            if !path.is_dir() {
                eprintln!("{} no such directory: {}", "Error:".red(), path.display());
                return Ok(EXIT_NOT_FOUND);
            }
            let label = if recreate {
                volume::recreate_label(&path)?
            } else if create {
                volume::ensure_label(&path)?
            } else {
                volume::read_label(&path)?
            };
            println!("{label}");
            Ok(0)
        }
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "K", "M", "G", "T"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{}{}", bytes, UNITS[0])
    } else {
        format!("{:.2}{}", size, UNITS[unit_idx])
    }
}
