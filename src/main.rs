//! rstate - statechart runner
//!
//! Loads a machine definition, feeds it events and prints every published
//! snapshot as a JSON line.

use clap::Parser;
use rstate_runtime::{Config, Event, Machine, MachineOptions};
use serde_json::Value;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rstate")]
#[command(about = "Run a statechart definition against a stream of events")]
#[command(version)]
struct Cli {
    /// Machine definition (JSON)
    definition: PathBuf,

    /// Events, one per line: a JSON event object, a JSON string or a bare
    /// event type. Reads stdin when omitted.
    events: Option<PathBuf>,

    /// Initial context override (JSON)
    #[arg(short, long)]
    context: Option<String>,

    /// Macrostep divergence bound
    #[arg(long, env = "RSTATE_MAX_MICROSTEPS")]
    max_microsteps: Option<usize>,
}

fn parse_event(line: &str) -> Event {
    match serde_json::from_str::<Value>(line) {
        Ok(Value::String(event_type)) => Event::new(event_type),
        Ok(value @ Value::Object(_)) => {
            serde_json::from_value(value).unwrap_or_else(|_| Event::new(line))
        }
        _ => Event::new(line),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr; stdout carries snapshots
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };
    if let Some(limit) = cli.max_microsteps {
        config.engine.max_microsteps = limit;
        config.validate()?;
    }

    let definition: Value = serde_json::from_str(&std::fs::read_to_string(&cli.definition)?)?;
    let mut options = MachineOptions::new().with_config(&config);
    if let Some(context) = &cli.context {
        options = options.with_context(serde_json::from_str(context)?);
    }

    let machine = match Machine::create(&definition, options) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!(code = e.error_code(), "Invalid machine definition: {}", e);
            return Err(e.into());
        }
    };
    tracing::info!(
        machine = %machine.id(),
        checksum = %machine.definition().checksum,
        states = machine.definition().len(),
        "Loaded definition"
    );

    machine.subscribe(|snapshot| println!("{}", snapshot.to_json()));
    machine.start();

    let reader: Box<dyn BufRead> = match &cli.events {
        Some(path) => Box::new(BufReader::new(std::fs::File::open(path)?)),
        None => Box::new(BufReader::new(std::io::stdin())),
    };
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        machine.send(parse_event(line));
        // Let task actors make progress between events
        tokio::task::yield_now().await;
    }

    let snapshot = machine.get_snapshot();
    tracing::info!(
        status = ?snapshot.status,
        value = %serde_json::to_string(&snapshot.value)?,
        "Finished"
    );
    machine.stop();

    Ok(())
}
