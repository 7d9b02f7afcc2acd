//! CLI entrypoint for the rosalloc harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rosalloc_core::size_class::{MAX_THREAD_LOCAL_BRACKET_IDX, SizeClassTable};
use rosalloc_core::{PageReleaseMode, RosAllocConfig};
use rosalloc_harness::structured_log::{LogEmitter, validate_log_file};
use rosalloc_harness::workload::{WorkloadConfig, run_workload};

/// Stress and conformance tooling for rosalloc.
#[derive(Debug, Parser)]
#[command(name = "rosalloc-harness")]
#[command(about = "Stress and conformance harness for rosalloc")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the multi-mutator churn workload.
    Stress {
        /// Number of mutator threads.
        #[arg(long, default_value_t = 4)]
        threads: u64,
        /// Operations per mutator.
        #[arg(long, default_value_t = 10_000)]
        ops: usize,
        /// PRNG seed.
        #[arg(long, default_value_t = 0x9e37_79b9_7f4a_7c15)]
        seed: u64,
        /// Objects per collector batch.
        #[arg(long, default_value_t = 64)]
        batch: usize,
        /// Page release mode (none, end, size, size_and_end, all).
        #[arg(long)]
        release_mode: Option<String>,
        /// Page size in bytes (defaults to ROSALLOC_PAGE_SIZE or 4096).
        #[arg(long)]
        page_size: Option<usize>,
        /// Region capacity in MiB.
        #[arg(long, default_value_t = 256)]
        capacity_mib: usize,
        /// JSONL log output path (if omitted, logs go to stderr).
        #[arg(long)]
        log: Option<PathBuf>,
        /// JSON report output path (if omitted, prints to stdout).
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Print the size-bracket geometry for a page size as JSON.
    Geometry {
        #[arg(long, default_value_t = 4096)]
        page_size: usize,
    },
    /// Validate a structured JSONL log.
    ValidateLog {
        /// Path to the JSONL file.
        #[arg(long)]
        log: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Stress {
            threads,
            ops,
            seed,
            batch,
            release_mode,
            page_size,
            capacity_mib,
            log,
            report,
        } => {
            let env = RosAllocConfig::from_env()?;
            let config = WorkloadConfig {
                seed,
                mutators: threads,
                ops_per_mutator: ops,
                batch_size: batch,
                capacity: capacity_mib << 20,
                page_size: page_size.unwrap_or(env.page_size),
                release_mode: release_mode
                    .as_deref()
                    .map_or(env.page_release_mode, PageReleaseMode::from_str_loose),
                ..WorkloadConfig::default()
            };
            let run_id = format!("stress-{seed:x}");
            let mut emitter = match &log {
                Some(path) => LogEmitter::to_file(path, &run_id)?,
                None => LogEmitter::to_writer(Box::new(std::io::stderr()), &run_id),
            };
            eprintln!(
                "Running {} mutators x {} ops (release mode {:?})",
                config.mutators, config.ops_per_mutator, config.release_mode
            );
            let result = run_workload(&config, &mut emitter)?;
            let json = serde_json::to_string_pretty(&result)?;
            match report {
                Some(path) => {
                    std::fs::write(&path, json)?;
                    eprintln!("Report written to {}", path.display());
                }
                None => println!("{json}"),
            }
            if !result.consistent {
                return Err("allocator bitmaps disagree with surviving objects".into());
            }
        }
        Command::Geometry { page_size } => {
            let table = SizeClassTable::new(page_size)?;
            let rows: Vec<serde_json::Value> = table
                .iter()
                .enumerate()
                .map(|(idx, layout)| {
                    serde_json::json!({
                        "index": idx,
                        "bracket_size": layout.bracket_size,
                        "num_pages": layout.num_pages,
                        "num_slots": layout.num_slots,
                        "header_size": layout.header_size,
                        "bulk_free_bitmap_offset": layout.bulk_free_bitmap_offset,
                        "thread_local_free_bitmap_offset": layout.thread_local_free_bitmap_offset,
                        "thread_local": idx <= MAX_THREAD_LOCAL_BRACKET_IDX,
                    })
                })
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "page_size": table.page_size(),
                    "brackets": rows,
                }))?
            );
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = validate_log_file(&log)?;
            for err in &errors {
                eprintln!("{err}");
            }
            if !errors.is_empty() {
                return Err(format!("{} invalid field(s) in {lines} line(s)", errors.len()).into());
            }
            eprintln!("{lines} line(s) valid");
        }
    }

    Ok(())
}
