#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use fdfs_block::{BlockStore, DirBlockStore, OverlayStore};
use fdfs_error::{EXIT_OPERATIONAL, FsckError};
use fdfs_ondisk::Superblock;
use fdfs_repair::{Checker, FreeListReconciler, FsckReport, SuperblockValidator, now_epoch_secs};
use fdfs_types::Layout;
use serde::Serialize;
use std::env::VarError;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, info_span};
use tracing_subscriber::EnvFilter;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Human,
    Json,
}

impl LogFormat {
    const ENV_KEY: &'static str = "FDFS_LOG_FORMAT";

    fn parse(raw: &str) -> Result<Self> {
        <Self as ValueEnum>::from_str(raw.trim(), true).map_err(|_| {
            anyhow::anyhow!(
                "invalid {key}={raw:?}; expected one of: human, json",
                key = Self::ENV_KEY
            )
        })
    }

    fn from_env() -> Result<Option<Self>> {
        match std::env::var(Self::ENV_KEY) {
            Ok(value) => Ok(Some(Self::parse(&value)?)),
            Err(VarError::NotPresent) => Ok(None),
            Err(VarError::NotUnicode(_)) => {
                bail!("{key} contains non-UTF-8 bytes", key = Self::ENV_KEY)
            }
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Json => "json",
        }
    }
}

fn default_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Logs go to stderr so that stdout carries only the report.
fn init_logging(log_format_override: Option<LogFormat>) -> Result<LogFormat> {
    let format = match log_format_override {
        Some(format) => format,
        None => LogFormat::from_env()?.unwrap_or(LogFormat::Human),
    };

    match format {
        LogFormat::Human => tracing_subscriber::fmt()
            .with_env_filter(default_env_filter())
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_level(true)
            .compact()
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize human logger: {err}"))?,
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_env_filter(default_env_filter())
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_level(true)
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize JSON logger: {err}"))?,
    }

    Ok(format)
}

#[derive(Parser)]
#[command(name = "fdfs", about = "Offline checker and repairer for fusedata images")]
struct Cli {
    /// Log output format (`human` or `json`).
    ///
    /// Precedence: `--log-format` > `FDFS_LOG_FORMAT` > `human`.
    #[arg(long, value_enum, global = true)]
    log_format: Option<LogFormat>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check an image and repair it in place.
    Check {
        /// Directory holding the `fusedata.<n>` units.
        image: PathBuf,
        /// Report what would change without writing anything.
        #[arg(short = 'n', long)]
        dry_run: bool,
        /// Reference time in seconds since the epoch (default: now).
        #[arg(long)]
        now: Option<u64>,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Print the superblock and declared free-list size without modifying anything.
    Inspect {
        /// Directory holding the `fusedata.<n>` units.
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

impl Command {
    const fn name(&self) -> &'static str {
        match self {
            Self::Check { .. } => "check",
            Self::Inspect { .. } => "inspect",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CheckOptions {
    now: Option<u64>,
    dry_run: bool,
    json: bool,
}

// ── Entry point ─────────────────────────────────────────────────────────────

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(exit_code(&error));
    }
}

/// Exit status for a failed command: the first [`FsckError`] in the chain
/// decides, anything else is operational.
fn exit_code(error: &anyhow::Error) -> i32 {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<FsckError>())
        .map_or(EXIT_OPERATIONAL, FsckError::exit_code)
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let log_format = init_logging(cli.log_format)?;
    let command_name = cli.command.name();
    let run_span = info_span!(
        target: "fdfs::cli",
        "command",
        command = command_name,
        log_format = log_format.as_str()
    );
    let _run_guard = run_span.enter();
    let started = Instant::now();

    info!(target: "fdfs::cli", command = command_name, "command_start");

    let result = match cli.command {
        Command::Check {
            image,
            dry_run,
            now,
            json,
        } => check_cmd(&image, CheckOptions { now, dry_run, json }),
        Command::Inspect { image, json } => inspect_cmd(&image, json),
    };

    let duration_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
    if let Err(err) = &result {
        error!(
            target: "fdfs::cli",
            command = command_name,
            duration_us,
            error = %err,
            "command_failed"
        );
    } else {
        info!(
            target: "fdfs::cli",
            command = command_name,
            duration_us,
            "command_succeeded"
        );
    }

    result
}

fn open_image(path: &Path, layout: &Layout) -> Result<DirBlockStore> {
    DirBlockStore::open(path, layout.block_size, layout.max_blocks)
        .with_context(|| format!("failed to open image directory {}", path.display()))
}

// ── check ───────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct CheckOutput {
    image: String,
    dry_run: bool,
    /// Units a dry run would have changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pending_writes: Option<usize>,
    #[serde(flatten)]
    report: FsckReport,
}

fn check_cmd(path: &Path, options: CheckOptions) -> Result<()> {
    let command_span = info_span!(
        target: "fdfs::cli::check",
        "check",
        image = %path.display(),
        dry_run = options.dry_run,
        output_json = options.json
    );
    let _command_guard = command_span.enter();

    let output = run_check(path, options)?;
    if options.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_check(&output);
    }
    Ok(())
}

fn run_check(path: &Path, options: CheckOptions) -> Result<CheckOutput> {
    let layout = Layout::DEFAULT;
    let store = open_image(path, &layout)?;
    let now = options.now.unwrap_or_else(now_epoch_secs);

    let (report, pending_writes) = if options.dry_run {
        let overlay = OverlayStore::new(store);
        let report = check_store(&overlay, layout, now, path)?;
        (report, Some(overlay.pending_writes()?))
    } else {
        (check_store(&store, layout, now, path)?, None)
    };

    Ok(CheckOutput {
        image: path.display().to_string(),
        dry_run: options.dry_run,
        pending_writes,
        report,
    })
}

fn check_store(
    store: &dyn BlockStore,
    layout: Layout,
    now: u64,
    path: &Path,
) -> Result<FsckReport> {
    Checker::new(store, layout)
        .run(now)
        .with_context(|| format!("check of {} stopped", path.display()))
}

fn print_check(output: &CheckOutput) {
    let report = &output.report;
    println!("fdfs check: {}", output.image);
    println!("now: {}", report.now);
    for finding in &report.findings {
        println!("  {finding}");
    }
    if report.free_list.is_none() {
        println!("free list: left unchanged (root directory unreadable)");
    }
    println!("result: {report}");
    if let Some(pending) = output.pending_writes {
        println!("dry run: {pending} blocks would change");
    }
}

// ── inspect ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct InspectOutput {
    image: String,
    superblock: Superblock,
    device_matches: bool,
    declared_free: usize,
}

fn inspect_cmd(path: &Path, json: bool) -> Result<()> {
    let command_span = info_span!(
        target: "fdfs::cli::inspect",
        "inspect",
        image = %path.display(),
        output_json = json
    );
    let _command_guard = command_span.enter();

    let output = run_inspect(path)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        let sb = &output.superblock;
        println!("fdfs image: {}", output.image);
        println!("creationTime: {}", sb.creation_time);
        println!("reserved: {}", sb.reserved);
        println!(
            "deviceId: {}{}",
            sb.device_id,
            if output.device_matches { "" } else { " (foreign)" }
        );
        println!("freeStart: {}", sb.free_start);
        println!("freeEnd: {}", sb.free_end);
        println!("root: {}", sb.root);
        println!("maxBlocks: {}", sb.max_blocks);
        println!("declared free blocks: {}", output.declared_free);
    }
    Ok(())
}

fn run_inspect(path: &Path) -> Result<InspectOutput> {
    let layout = Layout::DEFAULT;
    let store = open_image(path, &layout)?;
    let superblock = SuperblockValidator::new(&store, layout)
        .read()
        .with_context(|| format!("failed to read superblock of {}", path.display()))?;
    let declared_free = FreeListReconciler::new(&store, layout).read_declared()?.len();
    Ok(InspectOutput {
        image: path.display().to_string(),
        device_matches: superblock.device_id == layout.device_id,
        superblock,
        declared_free,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fdfs_harness::ImageFixture;
    use fdfs_types::BlockNumber;

    const NOW: u64 = 1_700_000_000;

    fn write_image(dir: &Path, edit: impl FnOnce(&mut ImageFixture)) {
        let layout = Layout::DEFAULT;
        let mut fixture = ImageFixture::new(layout);
        fixture
            .add_file(
                layout.root_block(),
                "a.txt",
                BlockNumber(27),
                BlockNumber(28),
                b"abc",
            )
            .expect("add file");
        edit(&mut fixture);
        let store = DirBlockStore::open(dir, layout.block_size, layout.max_blocks).expect("open");
        fixture.write_to(&store).expect("write image");
    }

    #[test]
    fn parse_check_flags() {
        let cli = Cli::try_parse_from(["fdfs", "check", "img", "-n", "--now", "42", "--json"])
            .expect("parse");
        let Command::Check {
            image,
            dry_run,
            now,
            json,
        } = cli.command
        else {
            panic!("expected check");
        };
        assert_eq!(image, PathBuf::from("img"));
        assert!(dry_run);
        assert_eq!(now, Some(42));
        assert!(json);
        assert_eq!(cli.log_format, None);
    }

    #[test]
    fn parse_global_log_format() {
        let cli = Cli::try_parse_from(["fdfs", "inspect", "img", "--log-format", "json"])
            .expect("parse");
        assert_eq!(cli.log_format, Some(LogFormat::Json));
        assert_eq!(cli.command.name(), "inspect");
    }

    #[test]
    fn reject_unknown_subcommand_and_bad_now() {
        assert!(Cli::try_parse_from(["fdfs", "mount", "img"]).is_err());
        assert!(Cli::try_parse_from(["fdfs", "check", "img", "--now", "-5"]).is_err());
    }

    #[test]
    fn log_format_parse_is_case_insensitive() {
        assert_eq!(LogFormat::parse(" JSON ").expect("json"), LogFormat::Json);
        assert!(LogFormat::parse("yaml").is_err());
    }

    #[test]
    fn dry_run_leaves_image_directory_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_image(dir.path(), |fixture| {
            fixture.inode_mut(BlockNumber(27)).expect("inode").gid = 0;
        });
        let unit = dir.path().join("fusedata.27");
        let before = std::fs::read(&unit).expect("read unit");

        let output = run_check(
            dir.path(),
            CheckOptions {
                now: Some(NOW),
                dry_run: true,
                json: true,
            },
        )
        .expect("check");

        assert_eq!(output.pending_writes, Some(1));
        assert_eq!(output.report.findings.len(), 1);
        assert_eq!(std::fs::read(&unit).expect("read unit"), before);

        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&output).expect("json")).expect("value");
        assert_eq!(json["dry_run"], true);
        assert_eq!(json["findings"][0]["kind"], "auto_repaired");
        assert_eq!(json["findings"][0]["block"], 27);
    }

    #[test]
    fn foreign_image_fails_with_operational_exit_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_image(dir.path(), |fixture| fixture.superblock_mut().device_id = 99);

        let err = run_check(
            dir.path(),
            CheckOptions {
                now: Some(NOW),
                ..CheckOptions::default()
            },
        )
        .unwrap_err();

        assert_eq!(exit_code(&err), EXIT_OPERATIONAL);
        assert!(matches!(
            err.chain().find_map(|c| c.downcast_ref::<FsckError>()),
            Some(FsckError::DeviceMismatch { found: 99, .. })
        ));
    }

    #[test]
    fn inspect_reports_superblock_and_free_list() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_image(dir.path(), |_| {});

        let output = run_inspect(dir.path()).expect("inspect");

        assert!(output.device_matches);
        assert_eq!(output.superblock.max_blocks, 10_000);
        assert_eq!(output.declared_free, 10_000 - 27 - 2);
    }

    #[test]
    fn missing_image_directory_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = run_inspect(&dir.path().join("absent")).unwrap_err();
        assert_eq!(exit_code(&err), EXIT_OPERATIONAL);
    }
}
