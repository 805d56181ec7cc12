#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use bgfs_alloc::Discrepancy;
use bgfs_block::{ByteDevice, FileByteDevice};
use bgfs_core::{Config, Filesystem, FormatOptions, FsStats, GroupSummary, format};
use serde::Serialize;
use std::env;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

// ── Command line ────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Mkfs { path: PathBuf, opts: FormatOptions },
    Inspect { path: PathBuf, json: bool },
    Check { path: PathBuf, json: bool },
    Help,
}

#[derive(Debug, PartialEq, Eq)]
struct Invocation {
    config: Option<PathBuf>,
    command: Command,
}

fn next_value(flag: &str, args: &mut impl Iterator<Item = String>) -> Result<String> {
    args.next()
        .with_context(|| format!("{flag} requires a value"))
}

fn next_u32(flag: &str, args: &mut impl Iterator<Item = String>) -> Result<u32> {
    let raw = next_value(flag, args)?;
    raw.parse()
        .with_context(|| format!("{flag} expects an unsigned integer, got {raw:?}"))
}

fn parse_args(args: Vec<String>) -> Result<Invocation> {
    let mut config = None;
    let mut rest = Vec::with_capacity(args.len());
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            config = Some(PathBuf::from(next_value("--config", &mut iter)?));
        } else {
            rest.push(arg);
        }
    }

    let mut args = rest.into_iter();
    let Some(command) = args.next() else {
        return Ok(Invocation {
            config,
            command: Command::Help,
        });
    };

    let command = match command.as_str() {
        "mkfs" => {
            let Some(path) = args.next() else {
                bail!("mkfs requires <image-path> --blocks <count>");
            };
            let mut opts = FormatOptions::default();
            while let Some(flag) = args.next() {
                match flag.as_str() {
                    "--blocks" => opts.blocks_count = Some(next_u32(&flag, &mut args)?),
                    "--block-size" => opts.block_size = next_u32(&flag, &mut args)?,
                    "--blocks-per-group" => {
                        opts.blocks_per_group = Some(next_u32(&flag, &mut args)?);
                    }
                    "--inodes-per-group" => {
                        opts.inodes_per_group = Some(next_u32(&flag, &mut args)?);
                    }
                    "--label" => opts.volume_name = next_value(&flag, &mut args)?,
                    "--no-sparse" => opts.sparse_super = false,
                    "--no-csum" => opts.metadata_csum = false,
                    other => bail!("unknown mkfs option: {other}"),
                }
            }
            if opts.blocks_count.is_none() {
                bail!("mkfs requires --blocks <count>");
            }
            Command::Mkfs {
                path: PathBuf::from(path),
                opts,
            }
        }
        "inspect" | "check" => {
            let Some(path) = args.next() else {
                bail!("{command} requires a path argument");
            };
            let path = PathBuf::from(path);
            let mut json = false;
            for flag in args {
                match flag.as_str() {
                    "--json" => json = true,
                    other => bail!("unknown {command} option: {other}"),
                }
            }
            if command == "inspect" {
                Command::Inspect { path, json }
            } else {
                Command::Check { path, json }
            }
        }
        "--help" | "-h" | "help" => Command::Help,
        other => bail!("unknown command: {other}"),
    };
    Ok(Invocation { config, command })
}

fn print_usage() {
    println!("bgfs\n");
    println!("USAGE:");
    println!("  bgfs [--config <file.toml>] mkfs <image-path> --blocks <count>");
    println!("       [--block-size <1024|2048|4096>] [--blocks-per-group <n>]");
    println!("       [--inodes-per-group <n>] [--label <name>] [--no-sparse] [--no-csum]");
    println!("  bgfs [--config <file.toml>] inspect <image-path> [--json]");
    println!("  bgfs [--config <file.toml>] check <image-path> [--json]");
}

// ── Entry point ─────────────────────────────────────────────────────────────

fn main() {
    if let Err(error) = run(env::args().skip(1).collect()) {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn init_logging(config: &Config) {
    // A second initialisation (tests) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_max_level(config.log_level.level_filter())
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn run(args: Vec<String>) -> Result<()> {
    let invocation = parse_args(args)?;
    let config = match &invocation.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => Config::default(),
    };
    init_logging(&config);
    debug!(?config, "cli_config");

    match invocation.command {
        Command::Mkfs { path, opts } => {
            let summary = mkfs(&path, &opts)?;
            println!("{summary}");
            Ok(())
        }
        Command::Inspect { path, json } => {
            let report = inspect(&path, config)?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("serialize output")?
                );
            } else {
                print!("{}", report.render());
            }
            Ok(())
        }
        Command::Check { path, json } => {
            let report = check(&path, config)?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("serialize output")?
                );
            } else {
                print!("{}", report.render());
            }
            if !report.clean {
                bail!(
                    "{} discrepancies found in {}",
                    report.discrepancies.len(),
                    path.display()
                );
            }
            Ok(())
        }
        Command::Help => {
            print_usage();
            Ok(())
        }
    }
}

// ── Commands ────────────────────────────────────────────────────────────────

fn mkfs(path: &Path, opts: &FormatOptions) -> Result<String> {
    let blocks = opts.blocks_count.unwrap_or(0);
    let len = u64::from(blocks) * u64::from(opts.block_size);
    let dev = FileByteDevice::create(path, len)
        .with_context(|| format!("failed to create image {}", path.display()))?;
    let sb = format(Arc::new(dev), opts)
        .with_context(|| format!("failed to format {}", path.display()))?;
    Ok(format!(
        "formatted {}: {} blocks of {} bytes, {} groups, {} inodes, {} free blocks",
        path.display(),
        sb.blocks_count,
        sb.block_size,
        sb.groups_count(),
        sb.inodes_count,
        sb.free_blocks_count
    ))
}

fn open_image(path: &Path, config: Config) -> Result<Filesystem> {
    let dev: Arc<dyn ByteDevice> = Arc::new(
        FileByteDevice::open(path)
            .with_context(|| format!("failed to open image {}", path.display()))?,
    );
    Filesystem::mount_read_only(dev, config)
        .with_context(|| format!("failed to read bgfs metadata in {}", path.display()))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

#[derive(Debug, Serialize)]
struct InspectOutput {
    volume_name: String,
    uuid: String,
    clean: bool,
    mount_count: u16,
    sparse_super: bool,
    metadata_csum: bool,
    stats: FsStats,
    groups: Vec<GroupSummary>,
}

impl InspectOutput {
    fn render(&self) -> String {
        let mut out = String::from("bgfs inspector\n");
        let s = &self.stats;
        let _ = writeln!(out, "volume_name: {}", self.volume_name);
        let _ = writeln!(out, "uuid: {}", self.uuid);
        let _ = writeln!(out, "clean: {}", self.clean);
        let _ = writeln!(out, "block_size: {}", s.block_size);
        let _ = writeln!(out, "blocks: {} ({} free)", s.blocks_count, s.free_blocks);
        let _ = writeln!(out, "inodes: {} ({} free)", s.inodes_count, s.free_inodes);
        let _ = writeln!(out, "directories: {}", s.used_dirs);
        let _ = writeln!(
            out,
            "features: sparse_super={} metadata_csum={}",
            self.sparse_super, self.metadata_csum
        );
        for g in &self.groups {
            let _ = writeln!(
                out,
                "group {:>4}: blocks {}+{} free {} inodes free {} dirs {} bitmap {}/{} table {}{}",
                g.group,
                g.first_block,
                g.block_count,
                g.free_blocks,
                g.free_inodes,
                g.used_dirs,
                g.block_bitmap,
                g.inode_bitmap,
                g.inode_table,
                if g.has_backup { " [backup]" } else { "" }
            );
        }
        out
    }
}

fn inspect(path: &Path, config: Config) -> Result<InspectOutput> {
    let fs = open_image(path, config)?;
    let sb = fs.superblock();
    Ok(InspectOutput {
        volume_name: sb.volume_name.clone(),
        uuid: hex(&sb.uuid),
        clean: sb.state & bgfs_core::STATE_VALID != 0,
        mount_count: sb.mnt_count,
        sparse_super: sb.has_sparse_super(),
        metadata_csum: sb.has_metadata_csum(),
        stats: fs.stats(),
        groups: fs.group_summaries(),
    })
}

#[derive(Debug, Serialize)]
struct CheckOutput {
    clean: bool,
    discrepancies: Vec<Discrepancy>,
}

impl CheckOutput {
    fn render(&self) -> String {
        if self.clean {
            return "no discrepancies\n".to_owned();
        }
        let mut out = String::new();
        for d in &self.discrepancies {
            let scope = d
                .group
                .map_or_else(|| "superblock".to_owned(), |g| format!("group {g}"));
            let _ = writeln!(
                out,
                "{scope}: {:?} recorded {} actual {}",
                d.kind, d.recorded, d.actual
            );
        }
        out
    }
}

fn check(path: &Path, config: Config) -> Result<CheckOutput> {
    let fs = open_image(path, config)?;
    let discrepancies = fs
        .check_consistency()
        .with_context(|| format!("consistency check failed on {}", path.display()))?;
    Ok(CheckOutput {
        clean: discrepancies.is_empty(),
        discrepancies,
    })
}
