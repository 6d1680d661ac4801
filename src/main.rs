//! qbind CLI - run and check query function files

use std::path::Path;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use qbind::config::QbindConfig;
use qbind::engine::{create_engine_factory, RenderEngineFactory};
use qbind::error::{FixSuggestion, QueryError, Result};
use qbind::event_log::EventLog;
use qbind::scope::OnMissing;
use qbind::sink::{SharedSink, SilentSink, StdoutSink, TracingSink};
use qbind::value::{CallArgs, Value};
use qbind::QueryFile;

#[derive(Parser)]
#[command(name = "qbind")]
#[command(about = "qbind - bind and run declarative query functions")]
#[command(version)]
struct Cli {
    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a query file
    Run {
        /// Path to query .yaml file
        file: String,

        /// Positional argument (JSON, or plain text)
        #[arg(short = 'a', long = "arg", value_name = "VALUE")]
        args: Vec<String>,

        /// Keyword argument as KEY=VALUE (JSON, or plain text)
        #[arg(short = 'k', long = "kwarg", value_name = "KEY=VALUE")]
        kwargs: Vec<String>,

        /// Override default engine (render, mock)
        #[arg(short, long)]
        engine: Option<String>,

        /// Force a model
        #[arg(short, long)]
        model: Option<String>,

        /// Echo engine output as it is produced
        #[arg(long)]
        echo: bool,

        /// Print the invocation events as JSON
        #[arg(long)]
        events: bool,
    },

    /// Validate a query file and resolve its captured variables
    Check {
        /// Path to query .yaml file
        file: String,
    },
}

#[tokio::main]
async fn main() {
    // Load .env file (ignore if not present)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let result = match cli.command {
        Commands::Run {
            file,
            args,
            kwargs,
            engine,
            model,
            echo,
            events,
        } => {
            let sink = output_sink(echo, cli.verbose);
            run_query(&file, &args, &kwargs, engine, model, sink, events).await
        }
        Commands::Check { file } => check_query(&file),
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        if let Some(suggestion) = e.fix_suggestion() {
            eprintln!("  {} {}", "Fix:".yellow(), suggestion);
        }
        std::process::exit(1);
    }
}

async fn run_query(
    file: &str,
    args: &[String],
    kwargs: &[String],
    engine_override: Option<String>,
    model_override: Option<String>,
    sink: SharedSink,
    events: bool,
) -> Result<()> {
    let config = QbindConfig::load()?.with_env();
    let engine_name = engine_override.unwrap_or_else(|| config.engine().to_string());
    let factory = create_engine_factory(&engine_name)?;

    let mut query = QueryFile::from_path(file)?
        .into_definition()?
        .build(factory)?;
    if let Some(model) = model_override.or_else(|| config.model().map(str::to_string)) {
        query.force_model(model);
    }
    query.set_output_sink(sink);
    let log = EventLog::new();
    if events {
        query = query.with_event_log(log.clone());
    }

    let mut call = CallArgs::new();
    for raw in args {
        call = call.arg(parse_value(raw));
    }
    for raw in kwargs {
        let (key, value) = raw.split_once('=').ok_or_else(|| QueryError::Config {
            reason: format!("keyword argument '{}' must be KEY=VALUE", raw),
        })?;
        call = call.kwarg(key.trim(), parse_value(value));
    }

    println!(
        "{} Query: {} | engine: {} | model: {}",
        "→".cyan(),
        query.name().cyan().bold(),
        query.engine_name().cyan(),
        query.forced_model().unwrap_or("(default)").cyan()
    );

    let results = query.call(call).await?;

    println!("{}", "Output:".cyan().bold());
    println!("{}", to_pretty(&results)?);

    if events {
        println!("{}", "Events:".cyan().bold());
        println!("{}", to_pretty(&log.to_json())?);
    }

    Ok(())
}

fn check_query(file: &str) -> Result<()> {
    let config = QbindConfig::load()?.with_env();
    let on_missing = config.on_missing()?;

    let query = QueryFile::from_path(file)?
        .into_definition()?
        .build(Arc::new(RenderEngineFactory))?;
    let context = query.context().ok_or_else(|| QueryError::MissingContext {
        query: query.name().to_string(),
    })?;

    println!("{} Query '{}' is valid", "✓".green(), display_name(file));
    println!("  Signature: {}", context.signature);
    println!("  Inputs: {}", query.input_keys().join(", "));
    println!("  Outputs: {}", query.output_keys().join(", "));
    if !query.postprocessors().is_empty() {
        let names: Vec<&str> = query.postprocessors().iter().map(|p| p.name()).collect();
        println!("  Postprocessors: {}", names.join(", "));
    }

    for name in context
        .query_params
        .iter()
        .filter(|p| !context.signature.contains(p.as_str()))
    {
        match context.scope.resolve(name, on_missing)? {
            Some(value) => println!("  Captured: {} = {}", name, value),
            None => println!("  {} {} is unresolved", "!".yellow(), name),
        }
    }
    if on_missing == OnMissing::Ignore {
        println!("  (unresolved names ignored)");
    }

    Ok(())
}

/// `--echo` prints engine output, `--verbose` logs it, otherwise it is dropped
fn output_sink(echo: bool, verbose: bool) -> SharedSink {
    if echo {
        Arc::new(StdoutSink)
    } else if verbose {
        Arc::new(TracingSink)
    } else {
        Arc::new(SilentSink)
    }
}

/// JSON when it parses, plain text otherwise
fn parse_value(raw: &str) -> Value {
    serde_json::from_str::<serde_json::Value>(raw)
        .map(Value::from)
        .unwrap_or_else(|_| Value::from(raw))
}

fn to_pretty(value: &impl serde::Serialize) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| QueryError::Engine(e.to_string()))
}

fn display_name(file: &str) -> String {
    Path::new(file)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.to_string())
}
