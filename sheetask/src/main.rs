use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use sheetsense_core::{
    CancellationToken, Outcome, QueryRequest, SenseConfig, SheetSense, SnapshotSource, read_workbook,
};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod formatter;

#[derive(Parser)]
#[command(name = "sheetask")]
#[command(about = "Ask questions about the structure and formulas of Excel/ODS workbooks", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file (TOML)
    #[arg(short, long, value_name = "CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the column and formula records extracted from a workbook
    Extract {
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value = "human")]
        format: OutputFormat,
    },
    /// Build the semantic index of a workbook and save it
    Index {
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Where to write the index
        #[arg(short, long, value_name = "INDEX")]
        out: PathBuf,
    },
    /// Answer a question about a workbook
    Ask {
        #[arg(value_name = "FILE")]
        file: PathBuf,

        #[arg(value_name = "QUESTION")]
        question: String,

        /// Previously saved index; built on the fly when absent
        #[arg(short, long, value_name = "INDEX")]
        index: Option<PathBuf>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "human")]
        format: OutputFormat,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Human-readable colored output
    Human,
    /// JSON output for scripting
    Json,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        _ => tracing::Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<SenseConfig> {
    let config = if let Some(config_path) = path {
        SenseConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?
    } else {
        // Fall back to a config in the current directory, then to defaults
        let default_config_path = PathBuf::from("sheetsense.toml");
        if default_config_path.exists() {
            SenseConfig::from_file(&default_config_path).with_context(|| {
                format!("Failed to load config from {}", default_config_path.display())
            })?
        } else {
            SenseConfig::default()
        }
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(cli.config.as_deref())?;
    let engine = SheetSense::new(config).context("Failed to set up services")?;
    let cancel = CancellationToken::new();

    match cli.command {
        Command::Extract { file, format } => {
            let workbook = read_workbook(&file)?;
            let extraction = engine
                .extract(&workbook)
                .with_context(|| format!("Failed to extract records from {}", file.display()))?;
            match format {
                OutputFormat::Human => formatter::print_extraction(&file, &extraction),
                OutputFormat::Json => formatter::print_json(&extraction)?,
            }
        }
        Command::Index { file, out } => {
            let workbook = read_workbook(&file)?;
            let snapshot = engine
                .index_workbook(&workbook, &cancel)
                .with_context(|| format!("Failed to index {}", file.display()))?;
            engine
                .store()
                .save_snapshot(&snapshot.spreadsheet_id, &out)
                .with_context(|| format!("Failed to write index to {}", out.display()))?;
            formatter::print_index_summary(&file, &out, &snapshot);
        }
        Command::Ask {
            file,
            question,
            index,
            format,
        } => {
            let workbook = read_workbook(&file)?;
            let spreadsheet_id = match &index {
                Some(path) => {
                    engine
                        .store()
                        .load_snapshot(path)
                        .with_context(|| format!("Failed to load index from {}", path.display()))?
                        .spreadsheet_id
                        .clone()
                }
                None => {
                    engine
                        .index_workbook(&workbook, &cancel)
                        .with_context(|| format!("Failed to index {}", file.display()))?
                        .spreadsheet_id
                        .clone()
                }
            };
            let source = SnapshotSource::new(Arc::new(workbook));

            let mut request = QueryRequest::new(spreadsheet_id.clone(), question);
            loop {
                let response = engine.ask(request, &source, &cancel)?;
                match format {
                    OutputFormat::Human => formatter::print_response(&response),
                    OutputFormat::Json => formatter::print_json(&response)?,
                }

                let Outcome::Clarification { .. } = &response.outcome else {
                    break;
                };
                if matches!(format, OutputFormat::Json) {
                    break;
                }
                let Some(answer) = prompt("> ")? else {
                    break;
                };
                request = QueryRequest::new(spreadsheet_id.clone(), answer).with_prior(response.session);
            }
        }
    }

    Ok(())
}

/// Read one non-empty line from stdin; `None` on end of input
fn prompt(label: &str) -> Result<Option<String>> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        return Ok(None);
    }
    let line = line.trim();
    Ok((!line.is_empty()).then(|| line.to_string()))
}
