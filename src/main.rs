//! Main entry point for the zipcap CLI application.
//!
//! This binary provides a command-line interface for listing and extracting
//! ZIP archives under a configurable memory ceiling.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};

use zipcap::io::LocalFileReader;
use zipcap::{
    BackpressureHandler, Cli, ExtractOptions, FailurePolicy, FilterConfig, StreamEntry,
    StreamingZipExtractor,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let options = extract_options(&cli);
    let extractor = StreamingZipExtractor::open_path(Path::new(&cli.file), options)
        .with_context(|| format!("failed to open {}", cli.file))?;

    if cli.list || cli.verbose {
        return list_entries(&extractor, cli.verbose).await;
    }
    extract_entries(&extractor, &cli).await
}

/// Translate CLI flags into extraction options.
fn extract_options(cli: &Cli) -> ExtractOptions {
    let mut filter = FilterConfig::new();
    if !cli.patterns.is_empty() {
        filter = filter.include_patterns(cli.patterns.iter().cloned());
    }
    if !cli.exclude.is_empty() {
        filter = filter.exclude_patterns(cli.exclude.iter().cloned());
    }

    ExtractOptions {
        max_memory: cli.max_memory,
        high_water_mark: cli.high_water_mark.map(|s| s as usize),
        max_entries: cli.max_entries,
        chunk_size: cli.chunk_size.map(|s| s as usize),
        parallel: cli.parallel,
        parallel_workers: cli.workers,
        on_failure: if cli.keep_going {
            FailurePolicy::Skip
        } else {
            FailurePolicy::Abort
        },
        filter: Some(filter),
        ..Default::default()
    }
}

/// List archive contents.
///
/// Simple format prints one name per line; verbose format prints a table
/// with sizes, compression ratio, and DOS timestamps, plus a totals line.
async fn list_entries(
    extractor: &StreamingZipExtractor<LocalFileReader>,
    verbose: bool,
) -> Result<()> {
    let entries = extractor.extract_streams().await?;

    if verbose {
        println!(
            "{:>10}  {:>10}  {:>5}  {:>10}  {:>5}  Name",
            "Length", "Size", "Cmpr", "Date", "Time"
        );
        println!("{}", "-".repeat(70));
    }

    let mut total_uncompressed = 0u64;
    let mut total_compressed = 0u64;
    let mut file_count = 0usize;

    for entry in &entries {
        if !verbose {
            println!("{}", entry.name());
            continue;
        }

        let meta = entry.metadata();
        let (year, month, day) = meta.mod_date();
        let (hour, minute, _second) = meta.mod_time();
        let ratio = if meta.uncompressed_size > 0 {
            format!(
                "{:>4}%",
                100 - (meta.compressed_size * 100 / meta.uncompressed_size)
            )
        } else {
            "  0%".to_string()
        };
        println!(
            "{:>10}  {:>10}  {}  {:04}-{:02}-{:02}  {:02}:{:02}  {}",
            meta.uncompressed_size,
            meta.compressed_size,
            ratio,
            year,
            month,
            day,
            hour,
            minute,
            entry.name()
        );
        if entry.is_file() {
            total_uncompressed += meta.uncompressed_size;
            total_compressed += meta.compressed_size;
            file_count += 1;
        }
    }

    if verbose {
        println!("{}", "-".repeat(70));
        let total_ratio = if total_uncompressed > 0 {
            format!(
                "{:>4}%",
                100 - (total_compressed * 100 / total_uncompressed)
            )
        } else {
            "  0%".to_string()
        };
        println!(
            "{:>10}  {:>10}  {}  {:>21}  {} files",
            total_uncompressed, total_compressed, total_ratio, "", file_count
        );
    }

    Ok(())
}

/// Extract all surviving entries to disk, streaming each payload through a
/// backpressure-aware reader so a slow disk never inflates memory use.
async fn extract_entries(
    extractor: &StreamingZipExtractor<LocalFileReader>,
    cli: &Cli,
) -> Result<()> {
    let entries = extractor.extract_streams().await?;
    let handler = extractor.backpressure();
    let keep_going = cli.keep_going;

    for entry in &entries {
        let result = extract_one(entry, cli, &handler).await;
        if let Err(e) = result {
            if !keep_going {
                return Err(e).with_context(|| format!("failed to extract {}", entry.name()));
            }
            if !cli.is_quiet() {
                eprintln!("Skipping: {} ({e})", entry.name());
            }
        }
    }
    Ok(())
}

async fn extract_one(
    entry: &StreamEntry<LocalFileReader>,
    cli: &Cli,
    handler: &BackpressureHandler,
) -> Result<()> {
    let output_path = match output_path_for(entry.name(), cli) {
        Some(path) => path,
        // Junked directory entries have no path of their own.
        None => return Ok(()),
    };

    if entry.is_directory() {
        if !cli.junk_paths {
            tokio::fs::create_dir_all(&output_path).await?;
        }
        return Ok(());
    }

    if output_path.exists() {
        if cli.never_overwrite {
            if !cli.is_quiet() {
                eprintln!("Skipping: {} (file exists)", entry.name());
            }
            return Ok(());
        }
        if !cli.overwrite {
            if !cli.is_quiet() {
                eprintln!("Skipping: {} (use -o to overwrite)", entry.name());
            }
            return Ok(());
        }
    }

    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    if !cli.is_quiet() {
        eprintln!("Extracting: {}", entry.name());
    }

    let stream = entry.open().await?;
    let mut throttled = handler.throttle(stream);
    let mut file = tokio::fs::File::create(&output_path).await?;
    tokio::io::copy(&mut throttled, &mut file).await?;
    Ok(())
}

/// Output path for an entry name, honoring `-d` and `-j`.
///
/// Names reaching this point already passed the filter's security screen,
/// so a simple join is safe. Returns `None` for a junked directory entry.
fn output_path_for(name: &str, cli: &Cli) -> Option<PathBuf> {
    let normalized = name.replace('\\', "/");
    let relative = if cli.junk_paths {
        Path::new(&normalized).file_name()?.to_string_lossy().to_string()
    } else {
        normalized
    };
    Some(match &cli.extract_dir {
        Some(dir) => PathBuf::from(dir).join(&relative),
        None => PathBuf::from(&relative),
    })
}
