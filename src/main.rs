//! znsio command-line interface
//!
//! Drive-loop workloads (`read`, `write`, `append`) plus zone management
//! (`report`, `reset`) over any device URI the backend understands.

use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use znsio::backend;
use znsio::drive::{self, DriveConfig, Workload};
use znsio::engine;
use znsio::error::Result;
use znsio::zone::ZoneDirectory;

#[derive(Parser)]
#[command(name = "znsio", version, about = "Asynchronous I/O engine for zoned block storage")]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "ZNSIO_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, env = "ZNSIO_LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read one zone sequentially (defaults to the first full zone)
    Read(RunArgs),
    /// Fill one zone with sequential writes (defaults to the first empty zone)
    Write(RunArgs),
    /// Fill one zone with zone appends (defaults to the first empty zone)
    Append(RunArgs),
    /// Print a zone report
    Report {
        /// Device URI
        uri: String,
        /// Byte offset; the report starts at the zone containing it
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Number of zones to report (default: through the last zone)
        #[arg(long)]
        zones: Option<u32>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Reset write pointers over a byte range
    Reset {
        /// Device URI
        uri: String,
        /// Byte offset of the range start
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Byte length of the range
        #[arg(long)]
        length: u64,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Device URI
    uri: String,

    /// Queue depth
    #[arg(long, default_value_t = 8)]
    qdepth: u32,

    /// Target zone's start LBA (default: picked by zone state)
    #[arg(long)]
    slba: Option<u64>,

    /// Namespace id (default: the device's namespace)
    #[arg(long)]
    nsid: Option<u32>,

    /// Print the run report as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_json);

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            error!(%err, "command failed");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Read(args) => run_workload(args, Workload::Read),
        Commands::Write(args) => run_workload(args, Workload::Write),
        Commands::Append(args) => run_workload(args, Workload::Append),
        Commands::Report {
            uri,
            offset,
            zones,
            json,
        } => report(&uri, offset, zones, json),
        Commands::Reset {
            uri,
            offset,
            length,
        } => {
            engine::reset_write_pointer(&uri, offset, length)?;
            println!("reset complete: offset {offset}, length {length}");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_workload(args: RunArgs, workload: Workload) -> Result<ExitCode> {
    let cfg = DriveConfig {
        uri: args.uri,
        queue_depth: args.qdepth,
        slba: args.slba,
        nsid: args.nsid,
    };
    let report = drive::run(&cfg, workload)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{}: zone {} submitted {} completed {} errors {} ({} bytes in {:.3}s)",
            report.workload,
            report.zslba,
            report.submitted,
            report.completed,
            report.errors,
            report.bytes,
            report.elapsed_secs
        );
    }

    Ok(if report.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn report(uri: &str, offset: u64, zones: Option<u32>, json: bool) -> Result<ExitCode> {
    let dev = backend::open(uri)?;
    let geo = dev.geometry();

    let first = (offset >> geo.ssw()) / geo.nsect;
    let count = zones.unwrap_or_else(|| geo.nzones.saturating_sub(first) as u32);
    let result = ZoneDirectory::load(&dev, first * geo.nsect, count);
    backend::close(dev);
    let dir = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(dir.zones())?);
    } else {
        println!("{:>12} {:>12} {:>8} {:>15} {:>18}", "zslba", "wp", "zcap", "state", "type");
        for zone in dir.zones() {
            println!(
                "{:>12} {:>12} {:>8} {:>15} {:>18}",
                zone.zslba,
                zone.wp,
                zone.zcap,
                zone.state.to_string(),
                zone.ztype.to_string()
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}
