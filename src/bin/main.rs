//! relink CLI - Materialize uid references as foreign keys
//!
//! Usage:
//!   relink run [-d dreq.sqlite] [--keep-uid-table]
//!   relink discover [-d dreq.sqlite]
//!   relink audit [-d dreq.sqlite]
//!   relink strip [-d dreq.sqlite] [--force]
//!   relink add-column --table T --column C --type TYPE
//!
//! Examples:
//!   relink run -d dreq.sqlite --output json
//!   relink --log-level debug discover --defer-unpopulated
//!   relink add-column --table standardname --column first_version --type INTEGER

use clap::{Parser, Subcommand, ValueEnum};
use relink::config::{LogFormat, Settings};
use relink::discover::{Discovery, RelationDiscoverer, UnpopulatedPolicy};
use relink::patch::add_column;
use relink::pipeline::{self, PipelineOptions};
use relink::sql::ColumnDef;
use relink::validate::IntegrityValidator;
use relink::worklist::Worklist;
use relink::RelinkError;
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::Level;

#[derive(Parser)]
#[command(name = "relink")]
#[command(about = "relink - Materialize uid cross-references of a SQLite data request as foreign keys")]
#[command(version)]
struct Cli {
    /// Path to a relink.toml config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log line format
    #[arg(long, global = true)]
    log_format: Option<LogFormatArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover, materialize, validate and strip
    Run {
        /// Path to the SQLite database
        #[arg(short, long)]
        database: Option<PathBuf>,

        /// Keep the identifier table
        #[arg(short, long)]
        keep_uid_table: bool,

        /// Leave relations without evidence pending instead of trusting the hint
        #[arg(long)]
        defer_unpopulated: bool,

        /// Strip even while relations are unresolved
        #[arg(long)]
        force_strip: bool,

        /// Output format
        #[arg(short, long, default_value = "text")]
        output: OutputFormat,
    },

    /// Classify declared relations without changing the database
    Discover {
        /// Path to the SQLite database
        #[arg(short, long)]
        database: Option<PathBuf>,

        /// Report relations without evidence as unpopulated
        #[arg(long)]
        defer_unpopulated: bool,

        /// Output format
        #[arg(short, long, default_value = "text")]
        output: OutputFormat,
    },

    /// Run a foreign key check without changing the database
    Audit {
        /// Path to the SQLite database
        #[arg(short, long)]
        database: Option<PathBuf>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        output: OutputFormat,
    },

    /// Drop the identifier table and every reference to it
    Strip {
        /// Path to the SQLite database
        #[arg(short, long)]
        database: Option<PathBuf>,

        /// Strip even while relations are unresolved
        #[arg(long)]
        force: bool,
    },

    /// Append a column to a table, keeping its rows and constraints
    AddColumn {
        /// Path to the SQLite database
        #[arg(short, long)]
        database: Option<PathBuf>,

        /// Table to extend
        #[arg(long)]
        table: String,

        /// New column name
        #[arg(long)]
        column: String,

        /// Declared SQL type
        #[arg(long = "type")]
        sql_type: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Human readable summary
    Text,
    /// JSON report
    Json,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::from_file(path),
        None => Settings::load(),
    };
    let settings = match settings {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| settings.logging.level.clone());
    let format = cli
        .log_format
        .map(LogFormat::from)
        .unwrap_or(settings.logging.format);
    setup_logging(&level, format);

    let result = match cli.command {
        Commands::Run {
            database,
            keep_uid_table,
            defer_unpopulated,
            force_strip,
            output,
        } => {
            let options = PipelineOptions {
                policy: policy(&settings, defer_unpopulated),
                strip: settings.strip.enabled && !keep_uid_table,
                force_strip: settings.strip.force || force_strip,
            };
            cmd_run(&settings, database, options, output)
        }
        Commands::Discover {
            database,
            defer_unpopulated,
            output,
        } => cmd_discover(&settings, database, policy(&settings, defer_unpopulated), output),
        Commands::Audit { database, output } => cmd_audit(&settings, database, output),
        Commands::Strip { database, force } => {
            cmd_strip(&settings, database, settings.strip.force || force)
        }
        Commands::AddColumn {
            database,
            table,
            column,
            sql_type,
        } => cmd_add_column(&settings, database, &table, &column, sql_type.as_deref()),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            if e.is_schema_error() {
                eprintln!("The database needs manual attention before relink can continue.");
            }
            ExitCode::FAILURE
        }
    }
}

fn setup_logging(level: &str, format: LogFormat) {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }
}

fn policy(settings: &Settings, defer: bool) -> UnpopulatedPolicy {
    if defer {
        UnpopulatedPolicy::Defer
    } else {
        settings.discovery.unpopulated
    }
}

fn open(settings: &Settings, database: Option<PathBuf>) -> Result<rusqlite::Connection, RelinkError> {
    let path = match database {
        Some(path) => path,
        None => settings.database_path()?,
    };
    pipeline::open(&path)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), RelinkError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_run(
    settings: &Settings,
    database: Option<PathBuf>,
    options: PipelineOptions,
    output: OutputFormat,
) -> Result<ExitCode, RelinkError> {
    let mut conn = open(settings, database)?;
    let report = pipeline::run(&mut conn, &settings.staging, &options)?;

    match output {
        OutputFormat::Text => print!("{}", report),
        OutputFormat::Json => print_json(&report)?,
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_discover(
    settings: &Settings,
    database: Option<PathBuf>,
    policy: UnpopulatedPolicy,
    output: OutputFormat,
) -> Result<ExitCode, RelinkError> {
    let conn = open(settings, database)?;
    let discovery = match Worklist::load(&conn, &settings.staging.worklist_table)? {
        Some(worklist) => RelationDiscoverer::new(&conn, &settings.staging)
            .with_policy(policy)
            .discover(&worklist)?,
        None => Discovery::default(),
    };

    match output {
        OutputFormat::Text => {
            for (table, relations) in &discovery.confirmed {
                for (field, owner) in relations {
                    println!("{}({}) -> {}", table, field, owner);
                }
            }
            for conflict in &discovery.conflicts {
                println!("conflict: {}", conflict);
            }
            println!(
                "{} confirmed, {} conflicts",
                discovery.confirmed_count(),
                discovery.conflicts.len()
            );
        }
        OutputFormat::Json => print_json(&discovery)?,
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_audit(
    settings: &Settings,
    database: Option<PathBuf>,
    output: OutputFormat,
) -> Result<ExitCode, RelinkError> {
    let conn = open(settings, database)?;
    let violations = IntegrityValidator::new(&conn).audit()?;

    match output {
        OutputFormat::Text => {
            for violation in &violations {
                println!("{}", violation);
            }
            println!("foreign key violations: {}", violations.len());
        }
        OutputFormat::Json => print_json(&violations)?,
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_strip(
    settings: &Settings,
    database: Option<PathBuf>,
    force: bool,
) -> Result<ExitCode, RelinkError> {
    let mut conn = open(settings, database)?;
    let report = pipeline::strip(&mut conn, &settings.staging, force)?;

    println!(
        "{} tables rewritten, {} unchanged",
        report.rewritten.len(),
        report.unchanged.len()
    );
    if !report.dropped_identifier_table {
        println!("no identifier table found");
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_add_column(
    settings: &Settings,
    database: Option<PathBuf>,
    table: &str,
    column: &str,
    sql_type: Option<&str>,
) -> Result<ExitCode, RelinkError> {
    let mut conn = open(settings, database)?;
    let added = add_column(
        &mut conn,
        &settings.staging,
        table,
        ColumnDef::new(column, sql_type),
    )?;

    if added {
        println!("added {}.{}", table, column);
    } else {
        println!("{}.{} already exists", table, column);
    }
    Ok(ExitCode::SUCCESS)
}
