//! prescribing-spc - batch driver for the prescribing metrics pipeline
//!
//! - prescribing-spc tidy    - raw extracts → tidy.csv
//! - prescribing-spc run     - tidy.csv → metrics.csv + quality.json (+ SQLite)
//! - prescribing-spc summary - tidy.csv → whole-history practice summary (+ quality.json)
//!
//! Logging honours `RUST_LOG`; `--verbose` raises the default to debug.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use prescribing_spc_core::export::write_new_file;
use prescribing_spc_core::ingest::{self, DatasetManifest};
use prescribing_spc_core::{
    EngineConfig, Granularity, OutputPaths, Pipeline, QualityReportExport, Reported,
    TidyRecordStore,
};

/// Prescribing SPC and funnel-plot metrics
#[derive(Parser, Debug)]
#[command(name = "prescribing-spc", version)]
#[command(about = "Per-capita prescribing rates with SPC and funnel-plot outlier detection", long_about = None)]
struct Cli {
    /// Debug-level logging for this tool and the engine
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build the tidy record store from raw prescribing and list-size extracts
    Tidy(TidyArgs),
    /// Compute rates, smoothing, SPC flags and funnel limits
    Run(RunArgs),
    /// Summarise each unit over all periods on one funnel
    Summary(SummaryArgs),
}

#[derive(Args, Debug)]
struct TidyArgs {
    /// Dataset manifest (month,url,file_name,type)
    #[arg(long, value_name = "CSV", requires = "raw_dir", conflicts_with_all = ["prescribing", "list_sizes"])]
    manifest: Option<PathBuf>,

    /// Directory holding the files named in the manifest
    #[arg(long, value_name = "DIR")]
    raw_dir: Option<PathBuf>,

    /// Prescribing extract(s) with a month column
    #[arg(long, value_name = "CSV", num_args = 1..)]
    prescribing: Vec<PathBuf>,

    /// List-size extract(s) with a month column
    #[arg(long, value_name = "CSV", num_args = 1..)]
    list_sizes: Vec<PathBuf>,

    /// Engine configuration (TOML); column names and BNF prefix
    #[arg(long, value_name = "TOML")]
    config: Option<PathBuf>,

    /// Tidy CSV to create
    #[arg(long, value_name = "CSV")]
    out: PathBuf,

    /// Data-quality report for the preparation step
    #[arg(long, value_name = "JSON")]
    report: Option<PathBuf>,

    /// Replace existing output files
    #[arg(long)]
    force: bool,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Tidy CSV produced by `tidy`
    #[arg(long, value_name = "CSV")]
    tidy: PathBuf,

    /// Engine configuration (TOML)
    #[arg(long, value_name = "TOML")]
    config: Option<PathBuf>,

    /// Override the configured granularity (practice, pcn, icb, national)
    #[arg(long)]
    granularity: Option<Granularity>,

    /// Metrics CSV to create
    #[arg(long, value_name = "CSV")]
    out: PathBuf,

    /// Data-quality report to create
    #[arg(long, value_name = "JSON")]
    report: PathBuf,

    /// Also write the full table with control limits as JSON
    #[arg(long, value_name = "JSON")]
    json: Option<PathBuf>,

    /// Append the metrics and issues to a SQLite database
    #[arg(long, value_name = "DB")]
    sqlite: Option<PathBuf>,

    /// Replace existing output files (never SQLite rows)
    #[arg(long)]
    force: bool,
}

#[derive(Args, Debug)]
struct SummaryArgs {
    /// Tidy CSV produced by `tidy`
    #[arg(long, value_name = "CSV")]
    tidy: PathBuf,

    /// Engine configuration (TOML)
    #[arg(long, value_name = "TOML")]
    config: Option<PathBuf>,

    /// Override the configured granularity
    #[arg(long)]
    granularity: Option<Granularity>,

    /// Summary CSV to create
    #[arg(long, value_name = "CSV")]
    out: PathBuf,

    /// Data-quality report (JSON) to create
    #[arg(long, value_name = "JSON")]
    report: Option<PathBuf>,

    /// Replace existing output files
    #[arg(long)]
    force: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "prescribing_spc=debug,prescribing_spc_core=debug"
    } else {
        "prescribing_spc=info,prescribing_spc_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&Path>, granularity: Option<Granularity>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    Ok(match granularity {
        Some(g) => config.with_granularity(g),
        None => config,
    })
}

/// Clear the way for a write-once output.
fn prepare_output(path: &Path, force: bool) -> Result<()> {
    if force && path.exists() {
        warn!("Replacing existing {}", path.display());
        fs::remove_file(path).with_context(|| format!("Failed to remove {}", path.display()))?;
    }
    Ok(())
}

fn read_extracts<T>(
    paths: &[PathBuf],
    read: impl Fn(BufReader<File>, &str) -> ingest::IngestResult<Vec<T>>,
) -> Result<Vec<T>> {
    let mut rows = Vec::new();
    for path in paths {
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        rows.extend(read(BufReader::new(file), &path.display().to_string())?);
    }
    Ok(rows)
}

fn cmd_tidy(args: TidyArgs) -> Result<()> {
    let config = load_config(args.config.as_deref(), None)?;
    let pipeline = Pipeline::new(config)?;

    let prepared: Reported<TidyRecordStore> = match (&args.manifest, &args.raw_dir) {
        (Some(manifest), Some(raw_dir)) => pipeline
            .prepare_tidy(manifest, raw_dir)
            .with_context(|| format!("Failed to prepare tidy data from {}", manifest.display()))?,
        _ => {
            if args.prescribing.is_empty() || args.list_sizes.is_empty() {
                bail!("either --manifest with --raw-dir, or --prescribing and --list-sizes, is required");
            }
            let columns = &pipeline.config().ingest.columns;
            let prescribing = read_extracts(&args.prescribing, |r, name| {
                ingest::read_prescribing(r, name, &columns.prescribing, None)
            })?;
            let list_sizes = read_extracts(&args.list_sizes, |r, name| {
                ingest::read_list_sizes(r, name, &columns.list_size, None)
            })?;
            ingest::prepare_tidy(&prescribing, &list_sizes, &pipeline.config().ingest.bnf_prefix)
        }
    };

    let (store, report) = prepared.into_parts();
    prepare_output(&args.out, args.force)?;
    write_new_file(&args.out, store.to_csv().as_bytes())
        .with_context(|| format!("Failed to write {}", args.out.display()))?;
    info!("Wrote {} tidy records to {}", store.len(), args.out.display());

    if let Some(report_path) = &args.report {
        prepare_output(report_path, args.force)?;
        QualityReportExport::from_report(&report, store.len(), None)
            .write_json(report_path)
            .with_context(|| format!("Failed to write {}", report_path.display()))?;
    }
    if !report.is_empty() {
        warn!("{} data-quality issues while preparing tidy data", report.len());
    }
    Ok(())
}

fn cmd_run(args: RunArgs) -> Result<()> {
    let config = load_config(args.config.as_deref(), args.granularity)?;
    let pipeline = Pipeline::new(config)?;

    let store = TidyRecordStore::from_csv_path(&args.tidy)
        .with_context(|| format!("Failed to load tidy data {}", args.tidy.display()))?;
    let output = pipeline.run(&store);

    let paths = OutputPaths {
        metrics_csv: args.out,
        quality_json: args.report,
        metrics_json: args.json,
        sqlite: args.sqlite,
    };
    prepare_output(&paths.metrics_csv, args.force)?;
    prepare_output(&paths.quality_json, args.force)?;
    if let Some(json) = &paths.metrics_json {
        prepare_output(json, args.force)?;
    }

    let written = pipeline
        .write_outputs(&output, &paths)
        .context("Failed to write run outputs")?;
    info!(
        "Run complete: {} rows, {} issues, sha256 {}",
        written.rows_written, written.issues, written.metrics_sha256
    );
    println!("{}  {}", written.metrics_sha256, paths.metrics_csv.display());
    Ok(())
}

fn cmd_summary(args: SummaryArgs) -> Result<()> {
    let config = load_config(args.config.as_deref(), args.granularity)?;
    let pipeline = Pipeline::new(config)?;

    let store = TidyRecordStore::from_csv_path(&args.tidy)
        .with_context(|| format!("Failed to load tidy data {}", args.tidy.display()))?;
    let (summary, report) = pipeline
        .summary(&store)
        .context("Failed to summarise units")?
        .into_parts();

    prepare_output(&args.out, args.force)?;
    if let Some(report_path) = &args.report {
        prepare_output(report_path, args.force)?;
        if report_path.exists() {
            bail!("Output already exists: {}", report_path.display());
        }
    }

    let digest = summary
        .write_csv(&args.out)
        .with_context(|| format!("Failed to write {}", args.out.display()))?;
    info!(
        "Wrote summary of {} units ({} rows excluded) to {}",
        summary.units.len(),
        report.excluded_rows(),
        args.out.display()
    );

    if let Some(report_path) = &args.report {
        QualityReportExport::from_report(&report, summary.units.len(), Some(digest.clone()))
            .write_json(report_path)
            .with_context(|| format!("Failed to write {}", report_path.display()))?;
    }
    println!("{}  {}", digest, args.out.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Tidy(args) => cmd_tidy(args),
        Commands::Run(args) => cmd_run(args),
        Commands::Summary(args) => cmd_summary(args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "prescribing-spc",
            "run",
            "--tidy",
            "tidy.csv",
            "--out",
            "metrics.csv",
            "--report",
            "quality.json",
            "--granularity",
            "pcn",
        ])
        .unwrap();

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.granularity, Some(Granularity::Pcn));
                assert_eq!(args.out, PathBuf::from("metrics.csv"));
                assert!(args.sqlite.is_none());
                assert!(!args.force);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_run_requires_report() {
        let result = Cli::try_parse_from(["prescribing-spc", "run", "--tidy", "t.csv", "--out", "m.csv"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_bad_granularity_rejected() {
        let result = Cli::try_parse_from([
            "prescribing-spc",
            "summary",
            "--tidy",
            "t.csv",
            "--out",
            "s.csv",
            "--granularity",
            "region",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_manifest_conflicts_with_direct_files() {
        let result = Cli::try_parse_from([
            "prescribing-spc",
            "tidy",
            "--manifest",
            "datasets.csv",
            "--raw-dir",
            "raw",
            "--prescribing",
            "epd.csv",
            "--out",
            "tidy.csv",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_tidy_then_run() {
        let dir = tempfile::tempdir().unwrap();
        let epd = dir.path().join("epd.csv");
        let lists = dir.path().join("lists.csv");
        let mut epd_csv = String::from("practice_code,month,bnf_code,items\n");
        let mut list_csv = String::from("practice_code,month,list_size\n");
        for m in 1..=3 {
            epd_csv.push_str(&format!("A81001,2024-0{m},0501013B0AAABAB,{}\n", 10 + m));
            epd_csv.push_str(&format!("A81002,2024-0{m},0501013B0AAABAB,{}\n", 20 + m));
            epd_csv.push_str(&format!("A81002,2024-0{m},0407010H0AAAMAM,99\n"));
            list_csv.push_str(&format!("A81001,2024-0{m},1000\nA81002,2024-0{m},2000\n"));
        }
        fs::write(&epd, epd_csv).unwrap();
        fs::write(&lists, list_csv).unwrap();

        let tidy = dir.path().join("tidy.csv");
        cmd_tidy(TidyArgs {
            manifest: None,
            raw_dir: None,
            prescribing: vec![epd],
            list_sizes: vec![lists],
            config: None,
            out: tidy.clone(),
            report: None,
            force: false,
        })
        .unwrap();
        let store = TidyRecordStore::from_csv_path(&tidy).unwrap();
        assert_eq!(store.len(), 6);
        assert_eq!(store.records()[3].practice_code, "A81002");
        assert_eq!(store.records()[3].items, Some(21));

        let out = dir.path().join("metrics.csv");
        let args = || RunArgs {
            tidy: tidy.clone(),
            config: None,
            granularity: None,
            out: out.clone(),
            report: dir.path().join("quality.json"),
            json: None,
            sqlite: None,
            force: false,
        };
        cmd_run(args()).unwrap();
        assert!(cmd_run(args()).is_err());
        cmd_run(RunArgs {
            force: true,
            ..args()
        })
        .unwrap();
        assert_eq!(fs::read_to_string(&out).unwrap().lines().count(), 7);
    }

    #[test]
    fn test_summary_writes_quality_report() {
        let dir = tempfile::tempdir().unwrap();
        let tidy = dir.path().join("tidy.csv");
        let mut csv = String::from("practice_code,month,items,list_size\n");
        for (practice, items) in [("A81001", 10), ("A81002", 20), ("A81003", 15)] {
            csv.push_str(&format!("{practice},2024-01,{items},1000\n"));
        }
        csv.push_str("A81004,2024-01,7,0\n");
        fs::write(&tidy, csv).unwrap();

        let out = dir.path().join("summary.csv");
        let report = dir.path().join("summary-quality.json");
        let args = || SummaryArgs {
            tidy: tidy.clone(),
            config: None,
            granularity: None,
            out: out.clone(),
            report: Some(report.clone()),
            force: false,
        };
        cmd_summary(args()).unwrap();

        let json = fs::read_to_string(&report).unwrap();
        let digest = prescribing_spc_core::export::sha256_hex(&fs::read(&out).unwrap());
        assert!(json.contains(&format!("\"output_sha256\": \"{digest}\"")));
        assert!(json.contains("\"zero_list_size\": 1"));

        // an existing report blocks the run before the summary is touched
        fs::remove_file(&out).unwrap();
        assert!(cmd_summary(args()).is_err());
        assert!(!out.exists());
        cmd_summary(SummaryArgs {
            force: true,
            ..args()
        })
        .unwrap();
        assert!(out.exists());
    }
}
