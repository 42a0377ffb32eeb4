//! StreamStack command line
//!
//! ```text
//! streamstack [--config stack.yaml | --root DIR] <command>
//!
//!   read  <file>   read a byte range through the stack
//!   bench <file>   issue many concurrent reads and report throughput
//!   serve          export a directory to network devices
//!   config         print the default stack configuration
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};
use futures::future::join_all;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use streamstack::error::{Error, Result};
use streamstack::metrics::encode_prometheus;
use streamstack::transport::{FileServer, LocalFileConfig, LocalFileTransport};
use streamstack::{StackConfig, Statistic, Streamer};

// =============================================================================
// CLI Arguments
// =============================================================================

/// StreamStack - layered file streaming with seek-aware scheduling
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Stack configuration file (YAML)
    #[arg(long, env = "STREAMSTACK_CONFIG")]
    config: Option<PathBuf>,

    /// Root directory of the default local stack (ignored with --config)
    #[arg(long, env = "STREAMSTACK_ROOT", default_value = ".")]
    root: PathBuf,

    /// Print stack statistics to stderr when the command finishes
    #[arg(long, env = "STREAMSTACK_STATS_FORMAT")]
    stats_format: Option<StatsFormat>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read a byte range of a file
    Read {
        file: String,

        #[arg(long, default_value = "0")]
        offset: u64,

        /// Bytes to read; defaults to the rest of the file for local stacks
        #[arg(long)]
        length: Option<u64>,

        /// Write the data here instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Read a file in fixed-size blocks, all submitted at once
    Bench {
        file: String,

        #[arg(long, default_value = "65536")]
        block_size: u64,

        #[arg(long, default_value = "256")]
        count: u64,
    },

    /// Serve a directory to network devices
    Serve {
        #[arg(long, env = "STREAMSTACK_ADDR", default_value = "0.0.0.0:7450")]
        addr: String,

        /// Accept writes from clients
        #[arg(long)]
        writable: bool,
    },

    /// Print the effective stack configuration as YAML
    Config,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StatsFormat {
    Text,
    Json,
    Prometheus,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let stack = load_stack_config(&args)?;

    match &args.command {
        Command::Read {
            file,
            offset,
            length,
            output,
        } => {
            let streamer = Streamer::from_config(&stack)?;
            let length = match length {
                Some(length) => *length,
                None => local_file_length(&args, file)?.saturating_sub(*offset),
            };
            info!(file = %file, offset, length, "Reading");

            let started = Instant::now();
            let data = streamer.read(file.as_str(), *offset, length)?.await.into_result()?;
            info!(bytes = data.len(), elapsed_ms = started.elapsed().as_millis() as u64, "Read complete");

            match output {
                Some(path) => std::fs::write(path, &data)?,
                None => std::io::stdout().lock().write_all(&data)?,
            }
            report_statistics(&args, &streamer)?;
        }

        Command::Bench {
            file,
            block_size,
            count,
        } => {
            let streamer = Streamer::from_config(&stack)?;
            let handles = bench_offsets(*block_size, *count)?
                .into_iter()
                .map(|offset| streamer.read(file.as_str(), offset, *block_size))
                .collect::<Result<Vec<_>>>()?;

            let started = Instant::now();
            let completions = join_all(handles).await;
            let elapsed = started.elapsed();

            let mut bytes = 0u64;
            let mut failed = 0usize;
            for completion in &completions {
                if completion.is_success() {
                    bytes += completion.bytes_transferred;
                } else {
                    failed += 1;
                    warn!(id = %completion.id, status = %completion.status, "Read failed");
                }
            }
            print_bench(bytes, completions.len(), failed, elapsed);
            report_statistics(&args, &streamer)?;
        }

        Command::Serve { addr, writable } => {
            let config = LocalFileConfig::new(args.root.clone()).with_writable(*writable);
            let server = FileServer::bind(addr.as_str(), LocalFileTransport::new(config)?).await?;
            info!(addr = %server.local_addr()?, root = %args.root.display(), "File server started");

            server
                .serve_with_shutdown(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Failed to listen for shutdown signal: {}", e);
                    }
                })
                .await?;
            info!("File server stopped");
        }

        Command::Config => {
            print!("{}", stack.to_yaml()?);
        }
    }

    Ok(())
}

fn load_stack_config(args: &Args) -> Result<StackConfig> {
    match &args.config {
        Some(path) => {
            info!(path = %path.display(), "Loading stack configuration");
            StackConfig::from_file(path)
        }
        None => Ok(StackConfig::local(args.root.clone())),
    }
}

fn local_file_length(args: &Args, file: &str) -> Result<u64> {
    if args.config.is_some() {
        return Err(Error::Config(
            "--length is required when the stack comes from --config".into(),
        ));
    }
    Ok(std::fs::metadata(args.root.join(file))?.len())
}

/// Start offset of each bench block.
fn bench_offsets(block_size: u64, count: u64) -> Result<Vec<u64>> {
    (0..count)
        .map(|i| {
            i.checked_mul(block_size).ok_or_else(|| {
                Error::Config(format!(
                    "block {} of size {} is past the largest file offset",
                    i, block_size
                ))
            })
        })
        .collect()
}

fn print_bench(bytes: u64, requests: usize, failed: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    println!("requests:   {} ({} failed)", requests, failed);
    println!("bytes:      {}", bytes);
    println!("elapsed:    {:.3}s", secs);
    println!("throughput: {:.2} MiB/s", bytes as f64 / secs / (1024.0 * 1024.0));
}

fn report_statistics(args: &Args, streamer: &Streamer) -> Result<()> {
    let Some(format) = args.stats_format else {
        return Ok(());
    };
    let stats: Vec<Statistic> = streamer.collect_statistics();
    let rendered = match format {
        StatsFormat::Text => stats
            .iter()
            .map(|s| format!("{}\n", s))
            .collect::<String>(),
        StatsFormat::Json => serde_json::to_string_pretty(&stats)? + "\n",
        StatsFormat::Prometheus => encode_prometheus(&stats)?,
    };
    eprint!("{}", rendered);
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // stdout carries file data for `read`
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
