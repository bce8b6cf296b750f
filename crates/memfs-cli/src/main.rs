#![forbid(unsafe_code)]
//! `memfs`: command-line tools for MemFS image files.
//!
//! The host's mmap role is simulated with whole-file reads and writes: a
//! command loads the image bytes, runs against them through the core, and
//! writes them back only when it mutated something.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use memfs_core::check::{check_image, CheckReport};
use memfs_core::Fs;
use memfs_types::HEADER_SIZE;
use serde::Serialize;
use std::io::Write as _;
use std::path::{Path, PathBuf};

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "memfs", about = "MemFS, a persistable in-memory filesystem toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create and initialize a new image file.
    Create {
        /// Path of the image file to create.
        image: PathBuf,
        /// Image size in bytes.
        #[arg(long, default_value_t = 1024 * 1024)]
        size: u64,
    },
    /// Print header and usage facts about an image.
    Inspect {
        /// Path to the image file.
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// List a directory inside an image.
    Ls {
        /// Path to the image file.
        image: PathBuf,
        /// Directory path inside the image.
        #[arg(default_value = "/")]
        path: String,
    },
    /// Print a file's contents to stdout.
    Cat {
        /// Path to the image file.
        image: PathBuf,
        /// File path inside the image.
        path: String,
    },
    /// Verify the structural invariants of an image.
    Check {
        /// Path to the image file.
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

// ── Serializable outputs ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct InspectOutput {
    image_bytes: u64,
    usable_bytes: u64,
    block_size: u64,
    total_blocks: u64,
    free_blocks: u64,
    name_max: u64,
    root_entries: u64,
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Create { image, size } => create(&image, size),
        Command::Inspect { image, json } => inspect(&image, json),
        Command::Ls { image, path } => ls(&image, &path),
        Command::Cat { image, path } => cat(&image, &path),
        Command::Check { image, json } => check(&image, json),
    }
}

fn load_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read image: {}", path.display()))
}

fn create(path: &Path, size: u64) -> Result<()> {
    if path.exists() {
        bail!("refusing to overwrite existing file: {}", path.display());
    }
    let region = build_image(size)?;
    std::fs::write(path, &region)
        .with_context(|| format!("failed to write image: {}", path.display()))?;
    println!("created {} ({size} bytes)", path.display());
    Ok(())
}

/// Build an initialized in-memory image of `size` bytes.
fn build_image(size: u64) -> Result<Vec<u8>> {
    // Enough for the header, the root inode, and one small file.
    let minimum = HEADER_SIZE + 1024;
    if size < minimum {
        bail!("image size {size} is too small (minimum {minimum} bytes)");
    }
    let mut region = vec![0_u8; usize::try_from(size).context("image size exceeds memory")?];
    Fs::open(&mut region).context("failed to initialize image")?;
    Ok(region)
}

fn inspect_output(region: &mut [u8]) -> Result<InspectOutput> {
    let image_bytes = region.len() as u64;
    let fs = Fs::open(region).context("failed to open image")?;
    let stats = fs.statfs().context("statfs failed")?;
    let root_entries = fs.readdir("/").context("readdir failed")?.len() as u64;
    Ok(InspectOutput {
        image_bytes,
        usable_bytes: fs.image().usable_size(),
        block_size: stats.block_size,
        total_blocks: stats.total_blocks,
        free_blocks: stats.free_blocks,
        name_max: stats.name_max,
        root_entries,
    })
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let mut region = load_image(path)?;
    let output = inspect_output(&mut region)?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("MemFS image: {}", path.display());
        println!("image_bytes: {}", output.image_bytes);
        println!("usable_bytes: {}", output.usable_bytes);
        println!("block_size: {}", output.block_size);
        println!("total_blocks: {}", output.total_blocks);
        println!("free_blocks: {}", output.free_blocks);
        println!("name_max: {}", output.name_max);
        println!("root_entries: {}", output.root_entries);
    }
    Ok(())
}

fn ls(path: &Path, dir: &str) -> Result<()> {
    let mut region = load_image(path)?;
    let fs = Fs::open(&mut region).context("failed to open image")?;
    let mut names = fs
        .readdir(dir)
        .with_context(|| format!("cannot list {dir}"))?;
    names.sort();
    for name in names {
        println!("{name}");
    }
    Ok(())
}

fn cat(path: &Path, file: &str) -> Result<()> {
    let mut region = load_image(path)?;
    let fs = Fs::open(&mut region).context("failed to open image")?;
    let size = fs
        .getattr(0, 0, file)
        .with_context(|| format!("cannot stat {file}"))?
        .size;
    let mut buf = vec![0_u8; usize::try_from(size).context("file too large")?];
    fs.read(file, &mut buf, 0)
        .with_context(|| format!("cannot read {file}"))?;
    std::io::stdout()
        .write_all(&buf)
        .context("failed to write to stdout")?;
    Ok(())
}

fn check_report(region: &mut [u8]) -> Result<CheckReport> {
    let fs = Fs::open(region).context("failed to open image")?;
    check_image(fs.image()).context("scan failed")
}

fn check(path: &Path, json: bool) -> Result<()> {
    let mut region = load_image(path)?;
    let report = check_report(&mut region)?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize report")?
        );
    } else {
        println!(
            "scanned {} inodes ({} dirs, {} files): {} free + {} reachable of {} usable bytes",
            report.inode_count,
            report.directory_count,
            report.file_count,
            report.free_bytes,
            report.reachable_bytes,
            report.usable_bytes,
        );
        for finding in &report.findings {
            println!("  [{}] {}", finding.offset, finding.detail);
        }
    }

    if !report.is_clean() {
        std::process::exit(2);
    }
    Ok(())
}
