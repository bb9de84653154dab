use std::error::Error;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};
use env_logger::Env;
use log::{error, info, warn};

use flow_sleuth::capture::{process_capture, process_captures};
use flow_sleuth::config::Config;
use flow_sleuth::flow::AggregationStats;
use flow_sleuth::label::Labeler;
use flow_sleuth::matcher::Matcher;
use flow_sleuth::merge::{MergeReport, MergeSettings, run_merge};
use flow_sleuth::queue::CaptureQueue;

#[derive(Parser, Debug)]
#[command(
    name = "flow-sleuth",
    version,
    author,
    about = "Reconstruct flows from PCAP files and merge them with HTTP logs into a labelled dataset"
)]
struct Cli {
    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file path
    #[arg(long, value_name = "CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert capture files into flow table CSVs
    Flows(FlowsArgs),
    /// Merge L7 logs with flow tables into a labelled CSV
    Merge(MergeArgs),
    /// Poll a capture directory and convert files as they settle
    Watch(WatchArgs),
}

#[derive(Args, Debug)]
struct FlowsArgs {
    /// Input PCAP files
    #[arg(short, long, value_name = "PCAP", required = true, num_args = 1..)]
    input: Vec<PathBuf>,

    /// Output directory
    #[arg(short, long, value_name = "DIR")]
    output_dir: PathBuf,

    /// Stop reading each capture after this many packets
    #[arg(long, value_name = "N")]
    max_packets: Option<u64>,
}

#[derive(Args, Debug)]
struct MergeArgs {
    /// Directory holding traffic-*.log files
    #[arg(long, value_name = "DIR", default_value = "./logs")]
    logs_dir: PathBuf,

    /// Directory holding flow table CSVs
    #[arg(long, value_name = "DIR", default_value = "./csv")]
    csv_dir: PathBuf,

    /// Output CSV path
    #[arg(short, long, value_name = "CSV", default_value = "./output/merged_traffic.csv")]
    output: PathBuf,

    /// Attacker IP(s), comma-separated
    #[arg(long, env = "ATTACKER_IP")]
    attacker_ip: Option<String>,

    /// Normal traffic IP(s), comma-separated
    #[arg(long, env = "NORMAL_IP")]
    normal_ip: Option<String>,

    /// Time tolerance around a flow's lifetime, in milliseconds
    #[arg(long, value_name = "MS")]
    tolerance_ms: Option<u64>,
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// Directory the capture process writes PCAP files into
    #[arg(long, value_name = "DIR", default_value = "/data/pcap")]
    pcap_dir: PathBuf,

    /// Directory for flow table CSVs
    #[arg(long, value_name = "DIR", default_value = "/data/csv")]
    csv_dir: PathBuf,

    /// Maximum number of unprocessed captures to keep
    #[arg(long, value_name = "N")]
    max_pending: Option<usize>,

    /// Seconds between directory scans
    #[arg(long, value_name = "SECS")]
    interval_secs: Option<u64>,

    /// Keep capture files after converting them
    #[arg(long)]
    keep: bool,

    /// Scan and process once, then exit
    #[arg(long)]
    once: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // Setup logging level based on verbosity
    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    info!("Starting flow-sleuth v{}", env!("CARGO_PKG_VERSION"));
    let config = Config::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Command::Flows(args) => run_flows(args, &config),
        Command::Merge(args) => run_merge_command(args, &config),
        Command::Watch(args) => run_watch(args, &config),
    }
}

fn run_flows(args: FlowsArgs, config: &Config) -> Result<(), Box<dyn Error>> {
    let tables = config.feature_tables();
    let max_packets = args.max_packets.or(config.capture.max_packets);
    info!("Input files: {}", args.input.len());
    info!("Output directory: {:?}", args.output_dir);

    let results = process_captures(&args.input, &args.output_dir, &tables.protocols, max_packets);
    let mut failed = 0;
    let mut flows = 0;
    let mut totals = AggregationStats::default();
    for (input, result) in args.input.iter().zip(results) {
        match result {
            Ok(summary) => {
                info!(
                    "Wrote CSV output to {:?} ({} flows, {} packets skipped{})",
                    summary.output,
                    summary.flows,
                    summary.stats.skipped(),
                    if summary.truncated { ", truncated" } else { "" }
                );
                flows += summary.flows;
                totals.combine(&summary.stats);
            }
            Err(e) => {
                failed += 1;
                error!("Failed to process {:?}: {}", input, e);
            }
        }
    }
    info!(
        "Total: {} packets read, {} aggregated into {} flows, {} skipped",
        totals.packets_read,
        totals.packets_aggregated,
        flows,
        totals.skipped()
    );
    if failed > 0 {
        return Err(format!("{} of {} capture files failed", failed, args.input.len()).into());
    }
    Ok(())
}

fn run_merge_command(args: MergeArgs, config: &Config) -> Result<(), Box<dyn Error>> {
    let attacker_ip = args
        .attacker_ip
        .unwrap_or_else(|| config.labels.attacker_ips.clone());
    let normal_ip = args
        .normal_ip
        .unwrap_or_else(|| config.labels.normal_ips.clone());
    let tolerance_ms = args.tolerance_ms.unwrap_or(config.matching.tolerance_ms);

    info!("L7 Logs Dir: {:?}", args.logs_dir);
    info!("L3/4 CSV Dir: {:?}", args.csv_dir);
    info!("Output: {:?}", args.output);
    info!("Attacker IP: {}", display_or_unset(&attacker_ip));
    info!("Normal IP: {}", display_or_unset(&normal_ip));
    info!("Match tolerance: {} ms", tolerance_ms);

    let settings = MergeSettings {
        matcher: Matcher::new(tolerance_ms),
        labeler: Labeler::from_lists(&attacker_ip, &normal_ip),
        tables: config.feature_tables(),
    };
    let report = run_merge(&args.logs_dir, &args.csv_dir, &args.output, &settings)?;
    print_report(&report, &args.output);
    Ok(())
}

fn display_or_unset(list: &str) -> &str {
    if list.trim().is_empty() {
        "(not set)"
    } else {
        list
    }
}

fn print_report(report: &MergeReport, output: &Path) {
    if report.written {
        println!(
            "Saved {} records to {}",
            report.merge.records,
            output.display()
        );
    } else {
        println!("No records to save.");
    }
    println!(
        "Matched {} of {} records with L3/4 flows ({} had unusable timestamp or address)",
        report.merge.matched, report.merge.records, report.merge.unmatchable
    );
    println!(
        "Skipped: {} malformed log lines, {} malformed flow rows, {} unreadable files",
        report.l7.malformed_lines,
        report.flows.malformed_rows,
        report.l7.unreadable_files.len() + report.flows.unreadable_files.len()
    );
    if report.merge.records > 0 {
        println!("\nLabel Distribution:");
        for line in report.merge.labels.report_lines() {
            println!("  {}", line);
        }
    }
}

fn run_watch(args: WatchArgs, config: &Config) -> Result<(), Box<dyn Error>> {
    let capacity = args.max_pending.unwrap_or(config.capture.max_pending);
    let interval = Duration::from_secs(args.interval_secs.unwrap_or(config.capture.poll_interval_secs));
    let delete_processed = config.capture.delete_processed && !args.keep;
    let tables = config.feature_tables();

    std::fs::create_dir_all(&args.csv_dir)?;
    info!("Watching {:?} (backlog limit {})", args.pcap_dir, capacity);

    let mut queue = CaptureQueue::new(
        &args.pcap_dir,
        &args.csv_dir,
        capacity,
        Duration::from_secs(config.capture.settle_secs),
    );
    loop {
        let scan = queue.refresh().map(|pending| pending.len());
        match scan {
            Ok(found) => {
                if found > 0 {
                    info!("{} captures pending", found);
                }
                queue.evict_overflow();
                while let Some(pcap) = queue.pop() {
                    match process_capture(
                        &pcap,
                        &args.csv_dir,
                        &tables.protocols,
                        config.capture.max_packets,
                    ) {
                        Ok(summary) => {
                            info!("Converted {:?} ({} flows)", pcap, summary.flows);
                            if delete_processed {
                                match std::fs::remove_file(&pcap) {
                                    Ok(()) => info!("Deleted processed file: {:?}", pcap),
                                    Err(e) => warn!("Failed to delete {:?}: {}", pcap, e),
                                }
                            }
                        }
                        Err(e) => error!("Error converting {:?}: {}", pcap, e),
                    }
                    queue.mark_consumed(&pcap);
                }
            }
            Err(e) => error!("Error scanning capture directory: {}", e),
        }
        if args.once {
            return Ok(());
        }
        thread::sleep(interval);
    }
}
