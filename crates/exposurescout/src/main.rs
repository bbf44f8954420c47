//! exscout - host state integrity auditor.
//!
//! Takes snapshots of accounts and filesystem trees, diffs two snapshots and
//! shows the resulting reports.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

use exposurescout_core::collector::identity::{IdentityCollector, ScriptSource};
use exposurescout_core::collector::FileSystemCollector;
use exposurescout_core::report::{DiffReport, Element, Filter, FilterRule, RuleCommand};
use exposurescout_core::storage::Database;
use exposurescout_core::{AnalysisManager, ManagerConfig, ManagerError};

/// Host state integrity auditor.
#[derive(Parser)]
#[command(name = "exscout", about = "Host state integrity auditor", version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Directory holding snapshot and report files.
    #[arg(short, long, global = true, default_value = "./data")]
    data_dir: PathBuf,

    /// SQLite database used instead of, or in addition to, files.
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Collect a snapshot and save it.
    Snapshot {
        /// Run id. Defaults to the current UTC time.
        #[arg(long)]
        run_id: Option<String>,

        /// Filesystem tree to capture. Repeatable.
        #[arg(short, long = "path", value_name = "PATH")]
        paths: Vec<PathBuf>,

        /// Path not to enter while walking. Repeatable.
        #[arg(short, long, value_name = "PATH")]
        exclude: Vec<PathBuf>,

        /// Skip users, groups and sudoers.
        #[arg(long)]
        no_users: bool,

        /// Directory with Users.sh, Groups.sh and Sudoers.sh to use instead
        /// of reading /etc directly.
        #[arg(long, value_name = "DIR")]
        scripts: Option<PathBuf>,

        /// Poll interval in milliseconds while collectors run.
        #[arg(long, default_value = "200")]
        poll_ms: u64,
    },

    /// Diff two saved snapshots and export the report.
    Diff {
        run_a: String,
        run_b: String,

        /// Report id. Defaults to `<run_a>_<run_b>`.
        #[arg(long)]
        report_id: Option<String>,

        /// Print the report as JSON.
        #[cfg(feature = "json")]
        #[arg(long)]
        json: bool,
    },

    /// Print a saved report.
    Show {
        report_id: String,

        /// Keep only collectors whose name matches. Repeatable.
        #[arg(long, value_name = "PATTERN")]
        include: Vec<String>,

        /// Drop collectors whose name matches. Repeatable.
        #[arg(long, value_name = "PATTERN")]
        exclude: Vec<String>,

        /// Print the report as JSON.
        #[cfg(feature = "json")]
        #[arg(long)]
        json: bool,
    },
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["exscout", "exposurescout", "exposurescout_core"] {
        if let Ok(directive) = format!("{target}={level}").parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Filter(#[from] exposurescout_core::report::FilterError),

    #[cfg(feature = "json")]
    #[error("cannot render JSON: {0}")]
    Json(#[from] serde_json::Error),
}

fn open_db(args: &Args) -> Result<Option<Database>, CliError> {
    Ok(args.db.as_ref().map(Database::open).transpose()?)
}

fn default_run_id() -> String {
    Utc::now().format("%Y%m%dT%H%M%SZ").to_string()
}

fn describe(element: &Element) -> String {
    match element {
        Element::File(f) => f.path.clone(),
        Element::User(u) => format!("{}({})", u.uid, u.name),
        Element::Group(g) => format!("{}:{}", g.name, g.gid),
        Element::Sudoer(s) => s.uid.to_string(),
    }
}

fn print_report(report_id: &str, report: &DiffReport) {
    println!(
        "report {report_id}: {} -> {}, {} elements",
        report.run_id_a(),
        report.run_id_b(),
        report.len()
    );
    for collector in report.collectors() {
        println!("{collector}");
        let Some(sections) = report.sections(collector) else {
            continue;
        };
        for (element_type, section) in sections {
            if section.is_no_diff() {
                println!("  {element_type}: no difference");
                continue;
            }
            println!("  {element_type}: {} elements", section.elements().len());
            for e in section.elements() {
                println!("    {:<8} {:<20} {}", e.status, e.run_id, describe(&e.element));
            }
        }
    }
}

#[cfg(feature = "json")]
fn render(report_id: &str, report: &DiffReport, json: bool) -> Result<(), CliError> {
    if json {
        println!("{}", report.to_json()?);
    } else {
        print_report(report_id, report);
    }
    Ok(())
}

#[cfg(not(feature = "json"))]
fn render(report_id: &str, report: &DiffReport, _json: bool) -> Result<(), CliError> {
    print_report(report_id, report);
    Ok(())
}

fn run(args: &Args) -> Result<(), CliError> {
    let mut manager = AnalysisManager::new(ManagerConfig::with_data_dir(&args.data_dir));
    let db = open_db(args)?;

    match &args.command {
        Command::Snapshot {
            run_id,
            paths,
            exclude,
            no_users,
            scripts,
            poll_ms,
        } => {
            let run_id = run_id.clone().unwrap_or_else(default_run_id);
            if !no_users {
                let collector = match scripts {
                    Some(dir) => IdentityCollector::with_source(Arc::new(ScriptSource::new(dir))),
                    None => IdentityCollector::new(),
                };
                manager.add_collector(Box::new(collector))?;
            }
            if !paths.is_empty() {
                let mut collector = FileSystemCollector::new();
                collector.set_rules(paths.iter().cloned());
                for path in exclude {
                    collector.exclude(path.clone());
                }
                manager.add_collector(Box::new(collector))?;
            }

            manager.run_snapshot(&run_id)?;
            while manager.is_running() {
                thread::sleep(Duration::from_millis(*poll_ms));
            }

            let path = manager.save(&run_id)?;
            if let Some(db) = &db {
                manager.save_db(db, &run_id)?;
            }
            println!("{run_id} {}", path.display());
        }

        Command::Diff {
            run_a,
            run_b,
            report_id,
            #[cfg(feature = "json")]
            json,
        } => {
            #[cfg(not(feature = "json"))]
            let json = &false;
            let report_id = report_id.clone().unwrap_or_else(|| format!("{run_a}_{run_b}"));
            for run_id in [run_a, run_b] {
                if manager.run(run_id).is_some() {
                    continue;
                }
                match &db {
                    Some(db) => manager.load_db(db, run_id)?,
                    None => manager.load(run_id)?,
                }
            }

            manager.make_diff(run_a, run_b, &report_id)?;
            let path = manager.export_report(&report_id)?;
            if let Some(db) = &db {
                manager.export_report_db(db, &report_id)?;
            }
            info!(report_id, path = %path.display(), "report written");
            if let Some(report) = manager.report(&report_id) {
                render(&report_id, report, *json)?;
            }
        }

        Command::Show {
            report_id,
            include,
            exclude,
            #[cfg(feature = "json")]
            json,
        } => {
            #[cfg(not(feature = "json"))]
            let json = &false;
            match &db {
                Some(db) => manager.import_report_db(db, report_id)?,
                None => manager.import_report(report_id)?,
            };

            let mut filter = Filter::new();
            for pattern in include {
                filter.add_rule(FilterRule::collector(RuleCommand::Include, pattern)?);
            }
            for pattern in exclude {
                filter.add_rule(FilterRule::collector(RuleCommand::Exclude, pattern)?);
            }
            let shown = if filter.is_empty() {
                report_id.clone()
            } else {
                let filtered_id = format!("{report_id}.filtered");
                manager.filter_report(report_id, &filter, &filtered_id)?;
                filtered_id
            };
            if let Some(report) = manager.report(&shown) {
                render(report_id, report, *json)?;
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
