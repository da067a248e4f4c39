use std::collections::HashMap;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;

use lockstep_adapter::{
  AdapterRegistry, CallOutcome, ChannelEvent, CommandAdapter, CommandOutcome, ExternalCallAdapter,
  ExternalSubscribeAdapter, LoopbackBus, LoopbackChannel, LoopbackConnector,
};
use lockstep_engine::TaskEngine;
use lockstep_task::{TaskDefinition, unix_millis};

/// Lockstep - a streaming task-orchestration engine
#[derive(Parser)]
#[command(name = "lockstep")]
#[command(version, about, long_about = None)]
struct Cli {
  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Run a task definition against the loopback collaborators
  Run {
    /// Path to the task definition file (JSON)
    definition_file: PathBuf,

    /// Path to a fixtures file scripting the loopback collaborators
    #[arg(long)]
    fixtures: Option<PathBuf>,

    /// Request id for the run (generated when omitted)
    #[arg(long, default_value = "")]
    request_id: String,

    /// Per-event debug logging
    #[arg(long)]
    debug: bool,
  },
}

/// Scripted behavior for the loopback collaborators.
#[derive(Debug, Default, Deserialize)]
struct Fixtures {
  #[serde(default)]
  commands: HashMap<String, CommandFixture>,
  /// Keyed as "target/action".
  #[serde(default)]
  calls: HashMap<String, CallFixture>,
  #[serde(default)]
  channels: HashMap<String, Vec<ChannelEventFixture>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum CommandFixture {
  Complete(Value),
  Error(Value),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum CallFixture {
  Success(Value),
  Failure { code: String, message: String },
}

#[derive(Debug, Deserialize)]
struct ChannelEventFixture {
  #[serde(rename = "type")]
  event_type: String,
  data: Option<Value>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
    )
    .with_writer(io::stderr)
    .init();

  let cli = Cli::parse();

  match cli.command {
    Some(Commands::Run {
      definition_file,
      fixtures,
      request_id,
      debug,
    }) => {
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(async { run_task(definition_file, fixtures, request_id, debug).await })?;
    }
    None => {
      println!("lockstep - use --help to see available commands");
    }
  }

  Ok(())
}

async fn run_task(
  definition_file: PathBuf,
  fixtures_file: Option<PathBuf>,
  request_id: String,
  debug: bool,
) -> Result<()> {
  let definition_content = tokio::fs::read_to_string(&definition_file)
    .await
    .with_context(|| format!("failed to read definition file: {}", definition_file.display()))?;

  let definition: TaskDefinition = serde_json::from_str(&definition_content)
    .with_context(|| format!("failed to parse definition file: {}", definition_file.display()))?;

  eprintln!(
    "Loaded task: {} ({} nodes)",
    definition.name,
    definition.node_count()
  );

  let fixtures = match fixtures_file {
    Some(path) => {
      let content = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("failed to read fixtures file: {}", path.display()))?;
      serde_json::from_str(&content)
        .with_context(|| format!("failed to parse fixtures file: {}", path.display()))?
    }
    None => Fixtures::default(),
  };

  // Initial context from stdin
  let initial_context = read_context_from_stdin()?;

  let registry = build_registry(fixtures).context("failed to build adapter registry")?;
  let engine = TaskEngine::new(registry);
  let task_key = definition.key.clone();
  engine.register(definition).context("failed to register task")?;

  let mut session = engine
    .task(&task_key)
    .run(&request_id, initial_context, debug)
    .context("failed to start run")?;

  eprintln!("Run started: {}", session.request_id);

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => {
        eprintln!("Cancelling run {}", session.request_id);
        session.cancel();
      }
      event = session.next_event() => match event {
        Some(event) => println!("{}", serde_json::to_string(&event)?),
        None => break,
      }
    }
  }

  Ok(())
}

/// Wire the loopback collaborators from fixtures and register the stock
/// adapters over them.
fn build_registry(fixtures: Fixtures) -> Result<Arc<AdapterRegistry>> {
  let bus = Arc::new(LoopbackBus::new());
  for (name, fixture) in fixtures.commands {
    let outcome = match fixture {
      CommandFixture::Complete(results) => CommandOutcome::Complete(results),
      CommandFixture::Error(errors) => CommandOutcome::Error(errors),
    };
    bus.on_command(&name, outcome);
  }

  let channel = Arc::new(LoopbackChannel::new());
  for (key, fixture) in fixtures.calls {
    let (target, action) = key
      .split_once('/')
      .with_context(|| format!("call fixture key '{key}' is not 'target/action'"))?;
    let outcome = match fixture {
      CallFixture::Success(data) => CallOutcome::Success(data),
      CallFixture::Failure { code, message } => CallOutcome::Failure { code, message },
    };
    channel.respond(target, action, outcome);
  }

  let connector = Arc::new(LoopbackConnector::new());
  for (target, events) in fixtures.channels {
    let events = events
      .into_iter()
      .map(|e| ChannelEvent {
        channel_id: String::new(),
        event_type: e.event_type,
        target: target.clone(),
        data: e.data,
        timestamp: unix_millis(),
        raw: None,
      })
      .collect();
    connector.script(&target, events);
  }

  let registry = Arc::new(AdapterRegistry::new());
  registry.register(Arc::new(CommandAdapter::new(bus)))?;
  registry.register(Arc::new(ExternalCallAdapter::new(channel)))?;
  registry.register(Arc::new(ExternalSubscribeAdapter::new(connector)))?;
  Ok(registry)
}

fn read_context_from_stdin() -> Result<serde_json::Map<String, Value>> {
  use std::io::IsTerminal;

  if io::stdin().is_terminal() {
    // No stdin pipe, start with an empty context
    Ok(serde_json::Map::new())
  } else {
    let mut input = String::new();
    io::stdin()
      .read_to_string(&mut input)
      .context("failed to read initial context from stdin")?;

    if input.trim().is_empty() {
      Ok(serde_json::Map::new())
    } else {
      serde_json::from_str(&input).context("failed to parse initial context JSON from stdin")
    }
  }
}
