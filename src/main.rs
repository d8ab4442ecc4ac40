use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crudsync::cache::{CacheEntry, QueryArgs, QueryData, DEFAULT_PAGE_NUMBER};
use crudsync::config::Config;
use crudsync::event::{EventHandler, SyncEvent};
use crudsync::session::SessionState;
use crudsync::DataClient;

#[derive(Parser, Debug)]
#[command(name = "crudsync")]
#[command(about = "Cache-first client for entity REST APIs")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/crudsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show the routes used for an entity
  Routes { entity: String },
  /// Fetch a page of records
  List {
    entity: String,
    #[arg(long, default_value_t = DEFAULT_PAGE_NUMBER)]
    page: u64,
    #[arg(long)]
    limit: Option<u64>,
    /// Extra query arguments as key=value (value parsed as JSON when possible)
    #[arg(long = "filter", value_parser = parse_filter)]
    filters: Vec<(String, Value)>,
  },
  /// Fetch one record
  Get { entity: String, id: String },
  /// Create a record from a JSON payload
  Create { entity: String, payload: String },
  /// Merge a JSON patch into a record
  Update {
    entity: String,
    id: String,
    patch: String,
  },
  /// Delete a record
  Delete { entity: String, id: String },
  /// Store session tokens
  Login {
    #[arg(long)]
    access: String,
    #[arg(long)]
    refresh: Option<String>,
    #[arg(long)]
    csrf: Option<String>,
  },
  /// Clear the stored session
  Logout,
}

fn parse_filter(s: &str) -> std::result::Result<(String, Value), String> {
  let (key, value) = s
    .split_once('=')
    .ok_or_else(|| format!("expected key=value, got {s}"))?;
  let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
  Ok((key.to_string(), value))
}

fn parse_json(s: &str) -> Result<Value> {
  serde_json::from_str(s).map_err(|e| eyre!("Invalid JSON payload: {}", e))
}

/// Log to a daily file under the user data dir; stderr if there is none.
fn init_logging() -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  match dirs::data_dir() {
    Some(data_dir) => {
      let appender = tracing_appender::rolling::daily(data_dir.join("crudsync").join("logs"), "crudsync.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
      Some(guard)
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
      None
    }
  }
}

fn print_entry(entry: &CacheEntry) -> Result<()> {
  let output = match &entry.result {
    QueryData::Record(record) => record.clone(),
    QueryData::List(records) => json!({
      "result": records,
      "pagination": entry.pagination,
    }),
  };
  println!("{}", serde_json::to_string_pretty(&output)?);
  Ok(())
}

fn print_value(value: &Value) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

/// Report notifications the core raised while the command ran.
fn report_events(events: &mut EventHandler) {
  for event in events.drain() {
    match event {
      SyncEvent::Error { message } => eprintln!("error: {message}"),
      SyncEvent::PermissionDenied { message } => eprintln!("permission denied: {message}"),
      SyncEvent::SessionRefreshed => eprintln!("session refreshed"),
      SyncEvent::NavigateToLogin => eprintln!("session ended, run `crudsync login`"),
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _log_guard = init_logging();

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let (client, mut events) = DataClient::new(&config)?;

  if let Some(token) = Config::env_access_token() {
    let current = client.session();
    client.login(SessionState {
      access_token: Some(token),
      ..current
    })?;
  }

  let result = run(&client, &config, args.command).await;
  report_events(&mut events);
  result
}

async fn run(client: &DataClient, config: &Config, command: Command) -> Result<()> {
  match command {
    Command::Routes { entity } => {
      let descriptor = client.routes(&entity)?;
      println!("{}", serde_json::to_string_pretty(&*descriptor)?);
    }
    Command::List {
      entity,
      page,
      limit,
      filters,
    } => {
      let limit = limit.unwrap_or(config.paging.default_page_limit);
      let args = filters
        .into_iter()
        .fold(QueryArgs::page(page, limit), |args, (k, v)| args.with(k, v));
      print_entry(&client.fetch_list(&entity, args).await?)?;
    }
    Command::Get { entity, id } => {
      print_entry(&client.fetch_by_id(&entity, &id).await?)?;
    }
    Command::Create { entity, payload } => {
      print_value(&client.create(&entity, parse_json(&payload)?).await?)?;
    }
    Command::Update { entity, id, patch } => {
      print_value(&client.update(&entity, &id, parse_json(&patch)?).await?)?;
    }
    Command::Delete { entity, id } => {
      print_value(&client.delete(&entity, &id).await?)?;
    }
    Command::Login {
      access,
      refresh,
      csrf,
    } => {
      let mut session = SessionState::new(access, refresh);
      session.csrf_token = csrf;
      client.login(session)?;
      println!("Logged in");
    }
    Command::Logout => {
      client.logout()?;
      println!("Logged out");
    }
  }
  Ok(())
}
