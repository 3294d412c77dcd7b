//! gdiff CLI - GDIFF binary delta tool
//!
//! Usage:
//!   gdiff diff <source> <target> (-o <output> | -d) [OPTIONS]
//!   gdiff patch <source> <patch> -o <output> [OPTIONS]
//!   gdiff merge <first> <second> -o <output> [OPTIONS]
//!   gdiff convert <patch> -o <output> [OPTIONS]
//!   gdiff dump <patch>

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use gdiff::{
    DEFAULT_CHUNK_SIZE, DEFAULT_INDEX_INTERVAL, DebugWriter, Delta, DeltaError, DeltaOptions,
    GDiffWriter, IndexOptions, ReadSeekSource, WriterOptions,
};
use owo_colors::OwoColorize;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// Largest input accepted, in bytes.
const MAX_INPUT_LEN: u64 = i32::MAX as u64;

/// GDIFF binary delta tool
#[derive(Parser)]
#[command(name = "gdiff")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Log more (-v debug, -vv trace); RUST_LOG applies otherwise
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute a patch from source to target
    Diff {
        /// Source file (original version)
        source: PathBuf,

        /// Target file (new version)
        target: PathBuf,

        /// Output patch file
        #[arg(short, long, required_unless_present = "dump", conflicts_with = "dump")]
        output: Option<PathBuf>,

        /// Print the instructions as text instead of writing a patch
        #[arg(short, long)]
        dump: bool,

        /// Block size in bytes; also the shortest copy
        #[arg(short, long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,

        /// Encode copy offsets relative to the previous copy
        #[arg(long)]
        differential: bool,

        /// Confirm checksum hits with a second, independent checksum
        #[arg(long)]
        duplicate_checksum: bool,

        /// Trust checksum hits without comparing bytes
        #[arg(long)]
        accept_hash: bool,

        /// Checksum table file: loaded if present, otherwise written
        #[arg(long)]
        checksums: Option<PathBuf>,

        /// Overwrite output file if it exists
        #[arg(short, long)]
        force: bool,

        /// Suppress output except errors
        #[arg(short, long)]
        quiet: bool,
    },
    /// Apply a patch to reconstruct the target
    Patch {
        /// Source file (original version)
        source: PathBuf,

        /// Patch file
        patch: PathBuf,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,

        /// Overwrite output file if it exists
        #[arg(short, long)]
        force: bool,

        /// Suppress output except errors
        #[arg(short, long)]
        quiet: bool,
    },
    /// Merge patches A->B and B->C into one patch A->C
    Merge {
        /// First patch (A->B)
        first: PathBuf,

        /// Second patch (B->C)
        second: PathBuf,

        /// Output patch file
        #[arg(short, long)]
        output: PathBuf,

        /// Records between two samples of the first patch's index
        #[arg(long, default_value_t = DEFAULT_INDEX_INTERVAL)]
        interval: usize,

        /// Encode copy offsets relative to the previous copy
        #[arg(long)]
        differential: bool,

        /// Overwrite output file if it exists
        #[arg(short, long)]
        force: bool,

        /// Suppress output except errors
        #[arg(short, long)]
        quiet: bool,
    },
    /// Rewrite a patch in normal or differential mode
    Convert {
        /// Patch file
        patch: PathBuf,

        /// Output patch file
        #[arg(short, long)]
        output: PathBuf,

        /// Encode copy offsets relative to the previous copy
        #[arg(long)]
        differential: bool,

        /// Overwrite output file if it exists
        #[arg(short, long)]
        force: bool,

        /// Suppress output except errors
        #[arg(short, long)]
        quiet: bool,
    },
    /// Print the instructions of a patch as text
    Dump {
        /// Patch file
        patch: PathBuf,
    },
}

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_INVALID_PATCH: i32 = 2;
const EXIT_TOO_LARGE: i32 = 3;

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Diff {
            source,
            target,
            output,
            dump,
            chunk_size,
            differential,
            duplicate_checksum,
            accept_hash,
            checksums,
            force,
            quiet,
        } => {
            let options = DeltaOptions::new()
                .chunk_size(chunk_size)
                .duplicate_checksum(duplicate_checksum)
                .accept_hash(accept_hash);
            let writer = WriterOptions::new().differential(differential);
            match (dump, output) {
                (true, _) => handle_dump_diff(&source, &target, options, checksums.as_deref()),
                (false, Some(output)) => handle_diff(
                    &source,
                    &target,
                    &output,
                    options,
                    writer,
                    checksums.as_deref(),
                    force,
                    quiet,
                ),
                (false, None) => Err(anyhow::anyhow!("Either --output or --dump is required")),
            }
        }
        Commands::Patch {
            source,
            patch,
            output,
            force,
            quiet,
        } => handle_patch(&source, &patch, &output, force, quiet),
        Commands::Merge {
            first,
            second,
            output,
            interval,
            differential,
            force,
            quiet,
        } => handle_merge(&first, &second, &output, interval, differential, force, quiet),
        Commands::Convert {
            patch,
            output,
            differential,
            force,
            quiet,
        } => handle_convert(&patch, &output, differential, force, quiet),
        Commands::Dump { patch } => handle_dump(&patch),
    };

    match result {
        Ok(()) => process::exit(EXIT_SUCCESS),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".bright_red().bold(), e);

            let exit_code = match e.chain().find_map(|c| c.downcast_ref::<DeltaError>()) {
                Some(DeltaError::SizeLimit { .. }) => EXIT_TOO_LARGE,
                Some(err) if err.is_format_error() => EXIT_INVALID_PATCH,
                Some(DeltaError::UnexpectedEndOfSource { .. } | DeltaError::RangeOutOfBounds { .. }) => {
                    EXIT_INVALID_PATCH
                }
                _ => EXIT_ERROR,
            };

            process::exit(exit_code);
        }
    }
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

#[allow(clippy::too_many_arguments)]
fn handle_diff(
    source_path: &Path,
    target_path: &Path,
    output_path: &Path,
    options: DeltaOptions,
    writer_options: WriterOptions,
    checksums: Option<&Path>,
    force: bool,
    quiet: bool,
) -> Result<()> {
    let source_size = input_len(source_path, "source")?;
    let target_size = input_len(target_path, "target")?;
    check_output(output_path, force)?;

    if !quiet {
        println!(
            "{} Source: {}, Target: {}",
            "File sizes:".bright_cyan(),
            format_bytes(source_size),
            format_bytes(target_size)
        );
    }

    let mut delta = prepare_delta(options, checksums, quiet)?;
    if !quiet {
        delta.set_progress(|progress| {
            eprint!(
                "\rProcessed {} so far, matched {}   ",
                format_bytes(progress.processed),
                format_bytes(progress.found)
            );
        });
    }

    let mut source = ReadSeekSource::open(source_path)
        .with_context(|| format!("Failed to open source file: {}", source_path.display()))?;
    let target = BufReader::new(
        File::open(target_path)
            .with_context(|| format!("Failed to open target file: {}", target_path.display()))?,
    );
    let output = BufWriter::new(
        File::create(output_path)
            .with_context(|| format!("Failed to create output file: {}", output_path.display()))?,
    );

    let start = Instant::now();
    let mut writer = GDiffWriter::with_options(output, writer_options)?;
    let stats = delta
        .compute(&mut source, target, &mut writer)
        .context("Diff failed")?;
    let elapsed = start.elapsed();

    save_checksums(&delta, checksums, quiet)?;

    if !quiet {
        let written = writer.written();
        let writer_stats = *writer.stats();
        eprintln!();
        println!(
            "{} Created {} ({}, {:.1}% of target)",
            "Success:".bright_green().bold(),
            output_path.display(),
            format_bytes(written),
            percent(written, target_size)
        );
        println!(
            "   Copied {} in {} copies ({} byte / {} short / {} int / {} long offsets), {} literal",
            format_bytes(stats.copied),
            stats.copies,
            writer_stats.byte_copies,
            writer_stats.short_copies,
            writer_stats.int_copies,
            writer_stats.long_copies,
            format_bytes(stats.literal_bytes)
        );
        println!("   Diff took {}", format_duration(elapsed));
    }

    Ok(())
}

fn handle_dump_diff(
    source_path: &Path,
    target_path: &Path,
    options: DeltaOptions,
    checksums: Option<&Path>,
) -> Result<()> {
    input_len(source_path, "source")?;
    input_len(target_path, "target")?;

    let mut delta = prepare_delta(options, checksums, true)?;
    let mut source = ReadSeekSource::open(source_path)
        .with_context(|| format!("Failed to open source file: {}", source_path.display()))?;
    let target = BufReader::new(
        File::open(target_path)
            .with_context(|| format!("Failed to open target file: {}", target_path.display()))?,
    );

    let stdout = io::stdout();
    let mut sink = DebugWriter::new(stdout.lock());
    delta
        .compute(&mut source, target, &mut sink)
        .context("Diff failed")?;
    save_checksums(&delta, checksums, true)?;
    Ok(())
}

fn handle_patch(
    source_path: &Path,
    patch_path: &Path,
    output_path: &Path,
    force: bool,
    quiet: bool,
) -> Result<()> {
    let source_size = input_len(source_path, "source")?;
    let patch_size = input_len(patch_path, "patch")?;
    check_output(output_path, force)?;

    if !quiet {
        println!(
            "{} Source: {}, Patch: {}",
            "File sizes:".bright_cyan(),
            format_bytes(source_size),
            format_bytes(patch_size)
        );
    }

    let mut source = ReadSeekSource::open(source_path)
        .with_context(|| format!("Failed to open source file: {}", source_path.display()))?;
    let patch = BufReader::new(
        File::open(patch_path)
            .with_context(|| format!("Failed to open patch file: {}", patch_path.display()))?,
    );
    let output = BufWriter::new(
        File::create(output_path)
            .with_context(|| format!("Failed to create output file: {}", output_path.display()))?,
    );

    let start = Instant::now();
    let written = gdiff::apply(&mut source, patch, output).context("Patch failed")?;
    let elapsed = start.elapsed();

    if !quiet {
        println!();
        println!(
            "{} Created {} ({})",
            "Success:".bright_green().bold(),
            output_path.display(),
            format_bytes(written)
        );
        println!("   Patching took {}", format_duration(elapsed));
    }

    Ok(())
}

fn handle_merge(
    first_path: &Path,
    second_path: &Path,
    output_path: &Path,
    interval: usize,
    differential: bool,
    force: bool,
    quiet: bool,
) -> Result<()> {
    input_len(first_path, "first patch")?;
    input_len(second_path, "second patch")?;
    check_output(output_path, force)?;

    let mut first = ReadSeekSource::open(first_path)
        .with_context(|| format!("Failed to open patch file: {}", first_path.display()))?;
    let second = BufReader::new(
        File::open(second_path)
            .with_context(|| format!("Failed to open patch file: {}", second_path.display()))?,
    );
    let output = BufWriter::new(
        File::create(output_path)
            .with_context(|| format!("Failed to create output file: {}", output_path.display()))?,
    );

    let start = Instant::now();
    let mut writer =
        GDiffWriter::with_options(output, WriterOptions::new().differential(differential))?;
    let options = IndexOptions::default().interval(interval);
    let target_len =
        gdiff::merge(&mut first, second, &mut writer, &options).context("Merge failed")?;
    let elapsed = start.elapsed();

    if !quiet {
        println!(
            "{} Created {} ({}, reconstructs {})",
            "Success:".bright_green().bold(),
            output_path.display(),
            format_bytes(writer.written()),
            format_bytes(target_len)
        );
        println!("   Merging took {}", format_duration(elapsed));
    }

    Ok(())
}

fn handle_convert(
    patch_path: &Path,
    output_path: &Path,
    differential: bool,
    force: bool,
    quiet: bool,
) -> Result<()> {
    let patch_size = input_len(patch_path, "patch")?;
    check_output(output_path, force)?;

    let patch = BufReader::new(
        File::open(patch_path)
            .with_context(|| format!("Failed to open patch file: {}", patch_path.display()))?,
    );
    let output = BufWriter::new(
        File::create(output_path)
            .with_context(|| format!("Failed to create output file: {}", output_path.display()))?,
    );

    let mut writer =
        GDiffWriter::with_options(output, WriterOptions::new().differential(differential))?;
    gdiff::convert(patch, &mut writer).context("Convert failed")?;

    if !quiet {
        println!(
            "{} Created {} ({} -> {})",
            "Success:".bright_green().bold(),
            output_path.display(),
            format_bytes(patch_size),
            format_bytes(writer.written())
        );
    }

    Ok(())
}

fn handle_dump(patch_path: &Path) -> Result<()> {
    input_len(patch_path, "patch")?;
    let patch = BufReader::new(
        File::open(patch_path)
            .with_context(|| format!("Failed to open patch file: {}", patch_path.display()))?,
    );

    let stdout = io::stdout();
    let mut sink = DebugWriter::new(stdout.lock());
    gdiff::convert(patch, &mut sink).context("Dump failed")?;
    Ok(())
}

// ============================================================================
// Checksum tables
// ============================================================================

fn prepare_delta(options: DeltaOptions, checksums: Option<&Path>, quiet: bool) -> Result<Delta> {
    let mut delta = Delta::with_options(options)?;
    let Some(path) = checksums else {
        return Ok(delta);
    };

    if path.exists() {
        let mut file = BufReader::new(
            File::open(path)
                .with_context(|| format!("Failed to open checksum file: {}", path.display()))?,
        );
        delta
            .read_checksums(&mut file)
            .with_context(|| format!("Failed to load checksum file: {}", path.display()))?;
        if !quiet {
            println!(
                "{} Loaded checksums from {} (chunk size {})",
                "Info:".bright_cyan(),
                path.display(),
                delta.chunk_size()
            );
        }
    } else {
        delta.set_keep_source(true);
    }
    Ok(delta)
}

fn save_checksums(delta: &Delta, checksums: Option<&Path>, quiet: bool) -> Result<()> {
    let Some(path) = checksums else {
        return Ok(());
    };
    if path.exists() {
        return Ok(());
    }

    let mut file = BufWriter::new(
        File::create(path)
            .with_context(|| format!("Failed to create checksum file: {}", path.display()))?,
    );
    delta.write_checksums(&mut file)?;
    file.flush()?;
    if !quiet {
        println!("{} Saved checksums to {}", "Info:".bright_cyan(), path.display());
    }
    Ok(())
}

// ============================================================================
// Utilities
// ============================================================================

fn input_len(path: &Path, what: &str) -> Result<u64> {
    if !path.exists() {
        bail!("File not found: {}", path.display());
    }
    let len = fs::metadata(path)
        .with_context(|| format!("Failed to read {} file metadata", what))?
        .len();
    if len > MAX_INPUT_LEN {
        return Err(DeltaError::SizeLimit {
            len,
            max: MAX_INPUT_LEN,
        })
        .with_context(|| format!("{} file is too large: {}", what, path.display()));
    }
    Ok(len)
}

fn check_output(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "Output file already exists: {}\n   Use --force to overwrite",
            path.display()
        );
    }
    Ok(())
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        (part as f64 / whole as f64) * 100.0
    }
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn format_duration(duration: std::time::Duration) -> String {
    let nanos = duration.as_nanos();

    if nanos < 1_000 {
        format!("{}ns", nanos)
    } else if nanos < 1_000_000 {
        format!("{:.1}μs", nanos as f64 / 1_000.0)
    } else if nanos < 1_000_000_000 {
        format!("{:.2}ms", nanos as f64 / 1_000_000.0)
    } else {
        format!("{:.3}s", duration.as_secs_f64())
    }
}
