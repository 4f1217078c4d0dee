//! # docseal CLI - Tamper-evident documents from the command line
//!
//! A command-line interface for the docseal integrity library.
//!
//! ## Features
//! - Track files and detect writes that bypassed docseal
//! - Replace file content atomically under a lease
//! - Walk and export the hash-linked integrity chain
//! - Take integrity snapshots with a Merkle root over every tracked file
//! - Roll back operations interrupted by a crash
//!
//! ## Usage
//! ```bash
//! # Initialize docseal in the current directory
//! docseal init
//!
//! # Track a document (or a whole directory)
//! docseal track chapter1.md
//!
//! # Replace its content atomically
//! docseal write chapter1.md --content "# Chapter One" -m "retitle"
//!
//! # Check everything
//! docseal verify
//! docseal verify-chain --strict
//! docseal snapshot
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use docseal::{
    AtomicOptions, CheckpointStatus, Docseal, DocsealBuilder, DocsealError, LockGranularity,
    LockStrategy, Result,
};
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

/// docseal CLI - Integrity checksums, hash-linked audit chain and atomic edits
#[derive(Parser)]
#[command(name = "docseal")]
#[command(version)]
#[command(about = "Prove protected files were not silently altered, and change them atomically")]
#[command(long_about = None)]
struct Cli {
    /// Document root (defaults to current directory)
    #[arg(short, long, global = true)]
    path: Option<PathBuf>,

    /// Storage directory (defaults to <root>/.docseal)
    #[arg(short, long, global = true)]
    storage: Option<PathBuf>,

    /// Identity written into leases and checkpoints
    #[arg(long, global = true)]
    holder: Option<String>,

    /// How long to wait for a lease, e.g. "500ms" or "5s"
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize docseal for a directory
    Init {
        /// Lease mechanism
        #[arg(long, value_enum, default_value = "file-marker")]
        lock_strategy: StrategyMode,

        /// Lease lifetime if a holder never releases, e.g. "30s"
        #[arg(long, value_parser = humantime::parse_duration)]
        lease_ttl: Option<Duration>,

        /// Refuse atomic writes when fenced files are already out of sync
        #[arg(long)]
        strict: bool,

        /// Record successful verifications in the chain
        #[arg(long)]
        record_verifications: bool,
    },

    /// Record checksums for files (directories are walked)
    #[command(alias = "add")]
    Track {
        /// Files or directories, relative to the root
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Stop tracking files
    #[command(alias = "rm")]
    Forget {
        /// Files, relative to the root
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Verify files against their stored checksums
    Verify {
        /// Files to verify (defaults to every tracked file)
        paths: Vec<PathBuf>,
    },

    /// Walk the integrity chain and report broken links
    #[command(alias = "vc")]
    VerifyChain {
        /// Exit with an error if any violation is found
        #[arg(long)]
        strict: bool,
    },

    /// Verify everything and record a snapshot block
    #[command(alias = "snap")]
    Snapshot {
        /// Show progress
        #[arg(long)]
        progress: bool,
    },

    /// Replace a tracked file's content atomically
    #[command(alias = "w")]
    Write {
        /// File to write, relative to the root
        file: PathBuf,

        /// New content (reads stdin when neither --content nor --from is given)
        #[arg(short, long, conflicts_with = "from")]
        content: Option<String>,

        /// Copy new content from this file
        #[arg(short, long)]
        from: Option<PathBuf>,

        /// Checkpoint description
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Show the integrity chain
    #[command(alias = "lg")]
    Log {
        /// Show only the last N blocks
        #[arg(short, long)]
        limit: Option<usize>,

        /// Write the chain as JSON lines to this file
        #[arg(long)]
        export: Option<PathBuf>,
    },

    /// List checkpoints
    #[command(alias = "ls")]
    Checkpoints {
        /// Show file lists and errors
        #[arg(short, long)]
        detailed: bool,

        /// Show only the last N checkpoints
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Roll back operations interrupted by a crash
    Recover,

    /// Show active leases
    Leases,

    /// Show status
    Status,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum StrategyMode {
    FileMarker,
    OsLock,
}

impl From<StrategyMode> for LockStrategy {
    fn from(mode: StrategyMode) -> Self {
        match mode {
            StrategyMode::FileMarker => LockStrategy::FileMarker,
            StrategyMode::OsLock => LockStrategy::OsLock,
        }
    }
}

/// Settings shared by every command that opens storage
struct Context {
    root_path: PathBuf,
    storage_path: PathBuf,
    holder: Option<String>,
    timeout: Option<Duration>,
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("docseal=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        eprintln!("{}: {}", "Error".red().bold(), e.user_message());
        std::process::exit(if e.is_critical() { 2 } else { 1 });
    }
}

/// Main command runner
fn run(cli: Cli) -> Result<()> {
    let root_path = cli.path.unwrap_or_else(|| PathBuf::from("."));
    let storage_path = cli.storage.unwrap_or_else(|| root_path.join(".docseal"));
    let ctx = Context {
        root_path,
        storage_path,
        holder: cli.holder,
        timeout: cli.timeout,
    };

    match cli.command {
        Commands::Init {
            lock_strategy,
            lease_ttl,
            strict,
            record_verifications,
        } => cmd_init(&ctx, lock_strategy.into(), lease_ttl, strict, record_verifications),
        Commands::Track { paths } => cmd_track(&ctx, paths),
        Commands::Forget { paths } => cmd_forget(&ctx, paths),
        Commands::Verify { paths } => cmd_verify(&ctx, paths),
        Commands::VerifyChain { strict } => cmd_verify_chain(&ctx, strict),
        Commands::Snapshot { progress } => cmd_snapshot(&ctx, progress),
        Commands::Write {
            file,
            content,
            from,
            message,
        } => cmd_write(&ctx, file, content, from, message),
        Commands::Log { limit, export } => cmd_log(&ctx, limit, export),
        Commands::Checkpoints { detailed, limit } => cmd_checkpoints(&ctx, detailed, limit),
        Commands::Recover => cmd_recover(&ctx),
        Commands::Leases => cmd_leases(&ctx),
        Commands::Status => cmd_status(&ctx),
    }
}

/// Initialize docseal in a directory
///
/// The storage directory contains:
/// - metadata.json: configuration and format version
/// - checksums/: one record per tracked file
/// - chain/: one JSON file per chain block, starting with genesis
/// - leases/: lease markers or lock files
/// - checkpoints/: checkpoint records and pre-images
fn cmd_init(
    ctx: &Context,
    lock_strategy: LockStrategy,
    lease_ttl: Option<Duration>,
    strict: bool,
    record_verifications: bool,
) -> Result<()> {
    if ctx.storage_path.join("metadata.json").exists() {
        return Err(DocsealError::StorageAlreadyExists(ctx.storage_path.clone()));
    }

    println!("{}", "Initializing docseal...".blue().bold());

    let mut builder = DocsealBuilder::new()
        .lock_strategy(lock_strategy)
        .strict_pre_state(strict)
        .record_verifications(record_verifications);
    if let Some(ttl) = lease_ttl {
        builder = builder.lease_ttl(ttl);
    }
    if let Some(timeout) = ctx.timeout {
        builder = builder.default_timeout(timeout);
    }
    let seal = builder.build(ctx.root_path.clone(), ctx.storage_path.clone())?;

    println!("{} Initialized docseal", "✓".green().bold());
    println!("  Root: {}", seal.root_path().display().to_string().cyan());
    println!("  Storage: {}", ctx.storage_path.display().to_string().cyan());
    println!("  Leases: {}", seal.config().lock_strategy.to_string().cyan());
    println!("\nNext steps:");
    println!("  - Track a document: {}", "docseal track <file>".yellow());
    println!("  - Check it later: {}", "docseal verify".yellow());

    Ok(())
}

/// Track files
///
/// Directories are walked recursively; the storage directory is skipped.
fn cmd_track(ctx: &Context, paths: Vec<PathBuf>) -> Result<()> {
    let seal = open_docseal(ctx)?;
    let storage_dir = ctx.storage_path.canonicalize().ok();

    let mut files = Vec::new();
    for path in paths {
        let absolute = seal.root_path().join(&path);
        if absolute.is_dir() {
            for entry in WalkDir::new(&absolute).follow_links(false) {
                let entry = entry.map_err(|e| DocsealError::internal(e.to_string()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                if let Some(storage_dir) = &storage_dir {
                    if entry.path().starts_with(storage_dir) {
                        continue;
                    }
                }
                files.push(entry.into_path());
            }
        } else {
            files.push(absolute);
        }
    }

    for file in &files {
        let record = seal.record_checksum(file)?;
        println!(
            "{} {} {} {}",
            "✓".green().bold(),
            short_digest(&record.digests.combined).yellow(),
            display_path(&seal, &record.path),
            format!("({})", docseal::format_bytes(record.size_bytes)).dimmed()
        );
    }
    println!("Tracked {} file(s)", files.len().to_string().cyan());

    Ok(())
}

fn cmd_forget(ctx: &Context, paths: Vec<PathBuf>) -> Result<()> {
    let seal = open_docseal(ctx)?;
    for path in paths {
        if seal.forget(&path)? {
            println!("{} Forgot {}", "✓".green().bold(), path.display());
        } else {
            println!("{} {} was not tracked", "⚠".yellow().bold(), path.display());
        }
    }
    Ok(())
}

/// Verify files against their stored checksums
///
/// Every mismatch is recorded in the chain. Exits with an error if any
/// file failed.
fn cmd_verify(ctx: &Context, paths: Vec<PathBuf>) -> Result<()> {
    let seal = open_docseal(ctx)?;
    let paths = if paths.is_empty() {
        seal.tracked_paths()?
    } else {
        paths
    };

    if paths.is_empty() {
        println!("{}", "Nothing is tracked yet".yellow());
        return Ok(());
    }

    println!("{}", "Verifying files...".blue().bold());
    let mut invalid = Vec::new();
    for path in &paths {
        let outcome = seal.verify(path)?;
        if outcome.valid {
            println!("  {} {}", "✓".green(), display_path(&seal, &outcome.path));
        } else {
            println!("  {} {}", "✗".red().bold(), display_path(&seal, &outcome.path));
            if let Some(detail) = outcome.mismatch_detail() {
                println!("      {}", detail.dimmed());
            }
            invalid.push(outcome.path);
        }
    }

    println!(
        "\n{}/{} files valid",
        (paths.len() - invalid.len()).to_string().green(),
        paths.len()
    );

    match invalid.first() {
        Some(first) => Err(DocsealError::internal(format!(
            "{} file(s) failed verification, first: {}",
            invalid.len(),
            first.display()
        ))),
        None => Ok(()),
    }
}

fn cmd_verify_chain(ctx: &Context, strict: bool) -> Result<()> {
    let seal = open_docseal(ctx)?;
    let start = Instant::now();

    println!("{}", "Verifying integrity chain...".blue().bold());
    let report = if strict {
        seal.ensure_chain_intact()?
    } else {
        seal.verify_chain()?
    };

    println!("\n{}", "Chain Verification Report:".bold());
    println!("  Blocks checked: {}", report.blocks_checked);
    if report.valid {
        println!("  Links: {}", "✓ Intact".green());
    } else {
        println!("  Links: {}", "✗ Broken".red());
        for violation in &report.violations {
            println!("    {} {}", "✗".red(), violation);
        }
    }
    println!("  Verification time: {}", format_duration(round_ms(start.elapsed())));

    Ok(())
}

/// Verify every tracked file and the chain at once
fn cmd_snapshot(ctx: &Context, show_progress: bool) -> Result<()> {
    let seal = open_docseal(ctx)?;

    let start = Instant::now();
    let progress = if show_progress {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
            pb.set_style(style);
        }
        pb.set_message("Hashing tracked files...");
        pb.enable_steady_tick(Duration::from_millis(100));
        Some(pb)
    } else {
        None
    };

    let report = seal.create_integrity_snapshot()?;

    if let Some(pb) = progress {
        pb.finish_and_clear();
    }

    let summary = &report.summary;
    let mark = if summary.all_valid && summary.chain_valid {
        "✓".green().bold()
    } else {
        "✗".red().bold()
    };
    println!("{} Snapshot {} (block {})", mark, short_id(&summary.snapshot_id).yellow().bold(), report.block_id);
    println!("  Tracked: {}", summary.tracked.to_string().cyan());
    println!("  Merkle root: {}", short_digest(&summary.merkle_root).cyan());
    println!(
        "  Files: {}",
        if summary.all_valid {
            "✓ All valid".green()
        } else {
            format!("✗ {} invalid", summary.invalid_count).red()
        }
    );
    for path in &summary.invalid_paths {
        println!("    {} {}", "✗".red(), display_path(&seal, path));
    }
    println!(
        "  Chain: {}",
        if summary.chain_valid { "✓ Intact".green() } else { "✗ Broken".red() }
    );
    println!("  Time: {}", format_duration(round_ms(start.elapsed())).to_string().cyan());

    Ok(())
}

/// Replace a tracked file's content atomically
///
/// The write runs under a lease with the old bytes saved first. If it
/// fails, the file and its checksum record are put back.
fn cmd_write(
    ctx: &Context,
    file: PathBuf,
    content: Option<String>,
    from: Option<PathBuf>,
    message: Option<String>,
) -> Result<()> {
    let seal = open_docseal(ctx)?;

    let bytes = match (content, from) {
        (Some(content), _) => content.into_bytes(),
        (None, Some(from)) => {
            fs::read(&from).map_err(|e| DocsealError::unavailable(from.display().to_string(), e))?
        }
        (None, None) => {
            let mut buffer = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buffer)
                .map_err(|e| DocsealError::unavailable("stdin", e))?;
            buffer
        }
    };

    let target = seal.root_path().join(&file);
    let mut options = AtomicOptions::new([file.clone()]).granularity(LockGranularity::PerPath);
    if let Some(message) = &message {
        options = options.description(message.clone());
    }
    if let Some(timeout) = ctx.timeout {
        options = options.timeout(timeout);
    }

    let start = Instant::now();
    let size = bytes.len() as u64;
    let outcome = seal.execute_atomic(options, || {
        fs::write(&target, &bytes)?;
        Ok(())
    })?;

    for path in &outcome.pre_state_violations {
        println!(
            "{} {} had been changed outside docseal before this write",
            "⚠".yellow().bold(),
            display_path(&seal, path)
        );
    }
    println!(
        "{} Committed checkpoint {}",
        "✓".green().bold(),
        short_id(&outcome.checkpoint_id).yellow().bold()
    );
    println!("  File: {}", file.display().to_string().cyan());
    println!("  Size: {}", docseal::format_bytes(size).cyan());
    println!("  Time: {}", format_duration(round_ms(start.elapsed())).to_string().cyan());

    Ok(())
}

fn cmd_log(ctx: &Context, limit: Option<usize>, export: Option<PathBuf>) -> Result<()> {
    let seal = open_docseal(ctx)?;

    if let Some(export) = export {
        let file = fs::File::create(&export)
            .map_err(|e| DocsealError::unavailable(export.display().to_string(), e))?;
        let count = seal.export_chain(std::io::BufWriter::new(file))?;
        println!(
            "{} Exported {} block(s) to {}",
            "✓".green().bold(),
            count,
            export.display().to_string().cyan()
        );
        return Ok(());
    }

    let blocks = seal.chain_blocks()?;
    let skip = limit.map_or(0, |limit| blocks.len().saturating_sub(limit));

    println!("{}", "Integrity chain:".blue().bold());
    for block in blocks.iter().skip(skip) {
        println!(
            "  {:>5}  {}  {}  {:<19}  {}",
            block.id.to_string().dimmed(),
            short_digest(&block.digest_b).yellow(),
            block.timestamp.format("%Y-%m-%d %H:%M:%S"),
            block.event.kind().cyan(),
            short_digest(&block.previous_digest).dimmed()
        );
    }
    println!("\nTotal: {} block(s)", blocks.len());

    Ok(())
}

fn cmd_checkpoints(ctx: &Context, detailed: bool, limit: Option<usize>) -> Result<()> {
    let seal = open_docseal(ctx)?;
    let checkpoints = seal.list_checkpoints()?;

    if checkpoints.is_empty() {
        println!("{}", "No checkpoints found".yellow());
        return Ok(());
    }

    let skip = limit.map_or(0, |limit| checkpoints.len().saturating_sub(limit));
    println!("{}", "Checkpoints:".blue().bold());
    for checkpoint in checkpoints.iter().skip(skip) {
        let status = match checkpoint.status {
            CheckpointStatus::Committed => checkpoint.status.to_string().green(),
            CheckpointStatus::RolledBack => checkpoint.status.to_string().yellow(),
            CheckpointStatus::FailedRollback => checkpoint.status.to_string().red().bold(),
            _ => checkpoint.status.to_string().normal(),
        };
        println!(
            "  {} {} {:<16} {}",
            checkpoint.short_id().yellow(),
            checkpoint.started_at.format("%Y-%m-%d %H:%M:%S"),
            status,
            checkpoint.description.as_deref().unwrap_or("")
        );

        if detailed {
            println!("    Holder: {}", checkpoint.holder_id.dimmed());
            for path in &checkpoint.file_paths {
                println!("    - {}", display_path(&seal, path));
            }
            if let Some(error) = &checkpoint.error {
                println!("    Error: {}", error.red());
            }
        }
    }

    Ok(())
}

fn cmd_recover(ctx: &Context) -> Result<()> {
    let seal = open_docseal(ctx)?;
    println!("{}", "Recovering interrupted operations...".blue().bold());

    let report = seal.recover_pending()?;
    if report.is_empty() {
        println!("{} Nothing to recover", "✓".green().bold());
        return Ok(());
    }

    for id in &report.recovered {
        println!("  {} rolled back {}", "✓".green(), short_id(id).yellow());
    }
    for id in &report.skipped {
        println!("  {} {} is still running, skipped", "⚠".yellow(), short_id(id).yellow());
    }
    for (id, reason) in &report.failed {
        println!("  {} {}: {}", "✗".red().bold(), short_id(id).yellow(), reason);
    }

    if report.failed.is_empty() {
        Ok(())
    } else {
        Err(DocsealError::internal(format!(
            "{} checkpoint(s) could not be recovered",
            report.failed.len()
        )))
    }
}

fn cmd_leases(ctx: &Context) -> Result<()> {
    let seal = open_docseal(ctx)?;
    let leases = seal.leases()?;

    if leases.is_empty() {
        println!("{}", "No active leases".green());
        return Ok(());
    }

    println!("{}", "Leases:".blue().bold());
    for lease in leases {
        let remaining = if lease.is_expired() {
            "expired".red()
        } else {
            format!("{} left", format_duration(Duration::from_secs(lease.remaining().as_secs()))).normal()
        };
        println!("  {} {}", lease.resource_key.cyan(), remaining);
        println!("    Holder: {} ({})", lease.holder_id, lease.strategy);
    }

    Ok(())
}

fn cmd_status(ctx: &Context) -> Result<()> {
    let seal = open_docseal(ctx)?;
    let config = seal.config();

    println!("{}", "docseal Status:".blue().bold());
    println!();
    println!("  Root: {}", seal.root_path().display());
    println!("  Storage: {}", ctx.storage_path.display());
    println!("  Holder: {}", seal.holder_id());

    println!("\n{}", "Configuration:".bold());
    println!("  Leases: {}", config.lock_strategy);
    println!("  Lease TTL: {}", format_duration(config.lease_ttl()));
    println!("  Default timeout: {}", format_duration(config.default_timeout()));
    println!("  Strict pre-state: {}", config.strict_pre_state);

    let tracked = seal.tracked_paths()?;
    let checkpoints = seal.list_checkpoints()?;
    let pending = checkpoints
        .iter()
        .filter(|c| c.status.needs_recovery())
        .count();

    println!("\n{}", "Evidence:".bold());
    println!("  Tracked files: {}", tracked.len());
    println!("  Chain blocks: {}", seal.chain().len()?);
    println!("  Checkpoints: {}", checkpoints.len());
    if pending > 0 {
        println!(
            "  {} {} checkpoint(s) need recovery. Run {}",
            "⚠".yellow().bold(),
            pending,
            "docseal recover".yellow()
        );
    }

    Ok(())
}

fn open_docseal(ctx: &Context) -> Result<Docseal> {
    if !ctx.storage_path.join("metadata.json").exists() {
        return Err(DocsealError::StorageNotInitialized(ctx.storage_path.clone()));
    }

    let mut builder = DocsealBuilder::new();
    if let Some(holder) = &ctx.holder {
        builder = builder.holder_id(holder.clone());
    }
    builder.build(ctx.root_path.clone(), ctx.storage_path.clone())
}

fn display_path(seal: &Docseal, path: &Path) -> String {
    path.strip_prefix(seal.root_path())
        .unwrap_or(path)
        .display()
        .to_string()
}

fn short_digest(digest: &str) -> &str {
    &digest[..12.min(digest.len())]
}

fn short_id(id: &str) -> &str {
    &id[..8.min(id.len())]
}

fn round_ms(duration: Duration) -> Duration {
    Duration::from_millis(duration.as_millis() as u64)
}
