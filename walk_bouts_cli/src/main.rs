use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueHint};
use rayon::prelude::*;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use walk_bouts::{
    classify_walks, detect_walks, drop_near_duplicates, group_by_date, merge_intervals,
    normalize_records, DailyWalks, Params, RawRecord,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Walking-bout detection from wearable step-interval logs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Detect walking bouts and write the per-day summary
    Detect(DetectArgs),
    /// Dry-run the pipeline and report per-stage diagnostics
    Inspect(InspectArgs),
}

#[derive(Parser, Debug)]
struct DetectArgs {
    /// Record CSV files to ingest (time_start_local,time_end_local,time_offset,steps)
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Output JSON path (`-` for stdout)
    #[arg(short, long, default_value = "walks.json", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Also write a flat CSV table (date,start,end,steps)
    #[arg(long, value_hint = ValueHint::FilePath)]
    csv: Option<PathBuf>,

    /// Pretty-print the JSON output
    #[arg(long)]
    pretty: bool,

    /// Near-duplicate tolerance against the next row, seconds
    #[arg(long, default_value_t = 1)]
    near_dup_eps: i64,

    /// Maximum gap between mergeable intervals, seconds
    #[arg(long, default_value_t = 60)]
    merge_gap: i64,

    /// Relative speed tolerance between mergeable intervals, percent
    #[arg(long, default_value_t = 15.0)]
    speed_tolerance: f64,

    /// Minimum qualifying bout duration, minutes
    #[arg(long, default_value_t = 5.0)]
    min_duration: f64,

    /// Minimum qualifying bout speed, steps per minute
    #[arg(long, default_value_t = 75.0)]
    min_speed: f64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log per-stage timings
    #[arg(long)]
    profile: bool,
}

#[derive(Parser, Debug)]
struct InspectArgs {
    /// Record CSV files to ingest
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = match &cli.command {
        Command::Detect(args) if args.verbose => "debug",
        Command::Inspect(args) if args.verbose => "debug",
        _ => "info",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Detect(args) => handle_detect(args),
        Command::Inspect(args) => handle_inspect(args),
    }
}

fn handle_detect(args: DetectArgs) -> Result<()> {
    let params = Params {
        near_duplicate_eps_sec: args.near_dup_eps,
        merge_gap_sec: args.merge_gap,
        speed_tolerance_pct: args.speed_tolerance,
        min_bout_minutes: args.min_duration,
        min_bout_speed: args.min_speed,
    };

    let t_read = Instant::now();
    let rows = read_records(&args.inputs)?;
    if args.profile || args.verbose {
        info!(
            "Read stage: {:.1} ms ({} rows)",
            t_read.elapsed().as_secs_f64() * 1000.0,
            rows.len()
        );
    }

    let t_detect = Instant::now();
    let walks = detect_walks(&rows, &params)?;
    if args.profile || args.verbose {
        info!(
            "Detect stage: {:.1} ms",
            t_detect.elapsed().as_secs_f64() * 1000.0
        );
    }

    let total_bouts: usize = walks.values().map(Vec::len).sum();
    if total_bouts == 0 {
        warn!("No qualifying walking bouts in {} rows", rows.len());
    } else {
        info!(
            "Detected {} walking bouts across {} days",
            total_bouts,
            walks.len()
        );
    }

    if args.output.as_os_str() == "-" {
        write_walks_stdout(&walks, args.pretty)?;
    } else {
        write_walks_json(&walks, &args.output, args.pretty)?;
        info!("Wrote walk summary: {}", args.output.display());
    }

    if let Some(path) = args.csv.as_ref() {
        write_walks_csv(&walks, path)?;
        info!("Wrote walk table: {}", path.display());
    }

    Ok(())
}

fn handle_inspect(args: InspectArgs) -> Result<()> {
    let params = Params::default();
    let rows = read_records(&args.inputs)?;
    info!("Rows ingested: {}", rows.len());
    if rows.is_empty() {
        return Ok(());
    }

    let intervals = normalize_records(&rows)?;
    let undefined_speed = intervals.iter().filter(|i| i.speed.is_none()).count();
    if undefined_speed > 0 {
        warn!(
            "{} rows have a non-positive duration and carry no speed",
            undefined_speed
        );
    }

    let raw_count = intervals.len();
    let deduped = drop_near_duplicates(intervals, params.near_duplicate_eps_sec);
    info!(
        "Duplicate rows dropped: {} ({} remain)",
        raw_count - deduped.len(),
        deduped.len()
    );

    let merged = merge_intervals(deduped, &params);
    info!(
        "Merge converged after {} passes ({} pairs coalesced, {} intervals remain)",
        merged.passes,
        merged.merges,
        merged.intervals.len()
    );

    if let (Some(first), Some(last)) = (merged.intervals.first(), merged.intervals.last()) {
        info!(
            "Feed spans {} .. {}",
            first.start_utc.format("%Y-%m-%d %H:%M:%S"),
            last.end_utc.format("%Y-%m-%d %H:%M:%S")
        );
    }

    let bouts = classify_walks(&merged.intervals, &params);
    let days = group_by_date(bouts);
    let total_bouts: usize = days.values().map(Vec::len).sum();
    info!(
        "Qualifying bouts: {} across {} days",
        total_bouts,
        days.len()
    );
    for (date, day_bouts) in &days {
        let steps: u64 = day_bouts.iter().map(|b| b.steps).sum();
        info!("  {}: {} bouts, {} steps", date, day_bouts.len(), steps);
    }

    Ok(())
}

/// Read all input CSVs, in parallel, preserving the input file order.
fn read_records(inputs: &[PathBuf]) -> Result<Vec<RawRecord>> {
    if inputs.is_empty() {
        return Err(anyhow!("no input files supplied"));
    }

    let mut per_file: Vec<(usize, Vec<RawRecord>)> = inputs
        .par_iter()
        .enumerate()
        .map(|(file_id, path)| -> Result<(usize, Vec<RawRecord>)> {
            let rows = read_record_csv(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Ok((file_id, rows))
        })
        .collect::<Result<Vec<_>>>()?;

    per_file.sort_by_key(|(file_id, _)| *file_id);
    Ok(per_file.into_iter().flat_map(|(_, rows)| rows).collect())
}

fn read_record_csv(path: &Path) -> Result<Vec<RawRecord>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}

fn write_walks_stdout(walks: &DailyWalks, pretty: bool) -> Result<()> {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    write_walks_writer(walks, &mut handle, pretty)?;
    handle.write_all(b"\n")?;
    Ok(())
}

fn write_walks_json(walks: &DailyWalks, path: &Path, pretty: bool) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    write_walks_writer(walks, &mut writer, pretty)?;
    writer.write_all(b"\n")?;
    Ok(())
}

fn write_walks_writer<W: Write>(walks: &DailyWalks, writer: &mut W, pretty: bool) -> Result<()> {
    if pretty {
        serde_json::to_writer_pretty(writer, walks)?;
    } else {
        serde_json::to_writer(writer, walks)?;
    }
    Ok(())
}

fn write_walks_csv(walks: &DailyWalks, path: &Path) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    writer.write_record(["date", "start", "end", "steps"])?;
    for (date, bouts) in walks {
        for bout in bouts {
            writer.write_record([
                date.to_string(),
                bout.start_utc.format("%Y-%m-%d %H:%M:%S").to_string(),
                bout.end_utc.format("%Y-%m-%d %H:%M:%S").to_string(),
                bout.steps.to_string(),
            ])?;
        }
    }
    writer.flush()?;
    Ok(())
}
