//! invoice-flow CLI
//!
//! Usage:
//!   invoice-flow run invoice.json
//!   invoice-flow resume hitl_INV-001 --decision APPROVED --input '{"reviewer": "ana"}'
//!   invoice-flow show hitl_INV-001
//!   invoice-flow list --status PAUSED_FOR_HITL
//!   invoice-flow inspect

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value as JsonValue;
use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use invoice_flow::invoice::{self, STATUS_CLAIMED};
use invoice_flow::{Executor, FlowConfig, FlowError, Outcome, StateRecord, StoreConfig};

/// invoice-flow - Invoice pipeline with human review checkpoints
#[derive(Parser, Debug)]
#[command(name = "invoice-flow")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// SQLite checkpoint database (overrides config and INVOICE_FLOW_DB)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run an invoice through the pipeline
    Run {
        /// Invoice JSON file, or '-' for stdin
        invoice: String,
    },

    /// Resume a paused invoice after review
    Resume {
        /// Checkpoint id printed by `run`
        checkpoint_id: String,

        /// Reviewer decision (e.g. APPROVED, REJECTED)
        #[arg(short, long)]
        decision: Option<String>,

        /// Payload updates as JSON string or @file.json
        #[arg(short, long)]
        input: Option<String>,
    },

    /// Print a stored checkpoint
    Show {
        checkpoint_id: String,
    },

    /// List stored checkpoints
    List {
        /// Only checkpoints with this status
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Print the pipeline structure
    Inspect {
        /// Output format (mermaid, text)
        #[arg(short, long, default_value = "mermaid")]
        format: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => tracing::Level::ERROR,
        (_, 0) => tracing::Level::WARN,
        (_, 1) => tracing::Level::INFO,
        (_, 2) => tracing::Level::DEBUG,
        (_, _) => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config = load_config(cli.config.as_ref(), cli.db)?;

    match cli.command {
        Commands::Run { invoice } => run_invoice(&config, &invoice),
        Commands::Resume {
            checkpoint_id,
            decision,
            input,
        } => resume_invoice(&config, &checkpoint_id, decision, input),
        Commands::Show { checkpoint_id } => show_checkpoint(&config, &checkpoint_id),
        Commands::List { status } => list_checkpoints(&config, status),
        Commands::Inspect { format } => inspect_pipeline(&format),
    }
}

/// Resolve configuration: file, then environment, then `--db`
fn load_config(path: Option<&PathBuf>, db: Option<PathBuf>) -> Result<FlowConfig> {
    let config = match path {
        Some(path) => FlowConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => FlowConfig::default(),
    };
    let mut config = config
        .with_env_overrides()
        .context("Invalid environment override")?;

    if let Some(path) = db {
        config.checkpoint = StoreConfig::Sqlite { path };
    }
    Ok(config)
}

fn executor(config: &FlowConfig) -> Result<Executor> {
    let graph = invoice::build_graph().context("Failed to build invoice pipeline")?;
    let store = config
        .open_store()
        .context("Failed to open checkpoint store")?;
    Ok(Executor::new(Arc::new(graph), store).with_options(config.execution_options()))
}

fn print_outcome(outcome: &Outcome) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(outcome)?);
    if let Outcome::Suspended(handle) = outcome {
        eprintln!(
            "Paused at {} ({}). Use 'invoice-flow resume {}' to continue",
            handle.step, handle.status, handle.checkpoint_id
        );
    }
    Ok(())
}

/// Run a new invoice
fn run_invoice(config: &FlowConfig, source: &str) -> Result<()> {
    let content = if source == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read invoice from stdin")?;
        buffer
    } else {
        fs::read_to_string(source).with_context(|| format!("Failed to read {}", source))?
    };

    let payload: JsonValue =
        serde_json::from_str(&content).context("Failed to parse invoice JSON")?;
    if !payload.is_object() {
        bail!("Invoice must be a JSON object");
    }

    let outcome = executor(config)?.run(StateRecord::from_payload(payload))?;
    print_outcome(&outcome)
}

/// Resume a paused invoice
///
/// The checkpoint is claimed atomically before resuming so a second resume of
/// the same id is refused, even from a concurrent process.
fn resume_invoice(
    config: &FlowConfig,
    checkpoint_id: &str,
    decision: Option<String>,
    input: Option<String>,
) -> Result<()> {
    let updates = parse_input(input)?;
    let executor = executor(config)?;
    let store = executor.store();

    let claimed = store.claim(checkpoint_id, STATUS_CLAIMED).map_err(|e| match e {
        FlowError::NotFound(id) => anyhow::anyhow!("Checkpoint not found: {}", id),
        other => other.into(),
    })?;
    if !claimed {
        bail!("Checkpoint {} has already been claimed", checkpoint_id);
    }

    tracing::info!("Resuming checkpoint {}", checkpoint_id);

    let outcome = executor.resume_with(checkpoint_id, |state| {
        state.merge_payload(&updates);
        if let Some(decision) = decision {
            state.decision = decision;
        }
    })?;
    print_outcome(&outcome)
}

fn show_checkpoint(config: &FlowConfig, checkpoint_id: &str) -> Result<()> {
    let store = config.open_store()?;
    let checkpoint = store.load(checkpoint_id)?;
    println!("{}", checkpoint.to_json()?);
    Ok(())
}

fn list_checkpoints(config: &FlowConfig, status: Option<String>) -> Result<()> {
    let store = config.open_store()?;
    let summaries = store.list(status.as_deref())?;
    println!("{}", serde_json::to_string_pretty(&summaries)?);
    Ok(())
}

fn inspect_pipeline(format: &str) -> Result<()> {
    let graph = invoice::build_graph()?;

    match format {
        "mermaid" => println!("{}", graph.to_mermaid()),
        "text" => {
            println!("Pipeline: {}", graph.name());
            println!("Entry: {}", graph.entry());
            println!();
            println!("Steps ({}):", graph.step_count());
            for name in graph.step_names() {
                match graph.edge(name) {
                    Some(invoice_flow::Edge::Fixed(next)) => println!("  {} -> {}", name, next),
                    Some(invoice_flow::Edge::Conditional(router)) => {
                        let targets = router
                            .targets()
                            .map(|t| t.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(" | "))
                            .unwrap_or_else(|| "?".to_string());
                        println!("  {} --[{}]--> {}", name, router.name, targets);
                    }
                    None => println!("  {}", name),
                }
            }
        }
        other => bail!("Unknown format '{}' (expected mermaid or text)", other),
    }

    Ok(())
}

/// Parse input from string or file
fn parse_input(input: Option<String>) -> Result<JsonValue> {
    match input {
        None => Ok(serde_json::json!({})),
        Some(s) if s.starts_with('@') => {
            let path = &s[1..];
            let content = fs::read_to_string(path).context(format!("Failed to read {}", path))?;
            serde_json::from_str(&content).context("Failed to parse input JSON file")
        }
        Some(s) => serde_json::from_str(&s).context("Failed to parse input JSON"),
    }
}
