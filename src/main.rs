use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use url::Url;

use shellcache::cache::{CacheStorage, MemoryStorage, SqliteStorage};
use shellcache::event::{self, Event, EventSender, WireEvent};
use shellcache::net::{HttpNetwork, Method, Request};
use shellcache::platform::{HeadlessClients, HeadlessSurface, Platform};
use shellcache::{AgentConfig, AgentHost};

#[derive(Parser, Debug)]
#[command(name = "shellcache")]
#[command(about = "Offline cache and push-notification agent for web applications")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shellcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Origin the application is served from
  #[arg(long, global = true)]
  origin: Option<Url>,

  /// Sub-path the application is served under
  #[arg(long, global = true)]
  base_path: Option<String>,

  /// Cache database path (default: $XDG_DATA_HOME/shellcache/cache.db)
  #[arg(long, global = true)]
  db: Option<PathBuf>,

  /// Keep caches in memory only
  #[arg(long, global = true)]
  ephemeral: bool,

  /// Log to stderr instead of the log file
  #[arg(long, global = true)]
  log_stderr: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Register the agent: install the manifest and activate
  Register,
  /// Send a request through the agent
  Fetch {
    /// Absolute URL, or a path under the base path
    url: String,
    #[arg(short, long, default_value = "GET")]
    method: String,
    /// Treat as a top-level page load
    #[arg(long)]
    navigate: bool,
    #[arg(long)]
    body: Option<String>,
  },
  /// Deliver a push message
  Push { payload: Option<String> },
  /// Click a displayed notification
  Click {
    id: u64,
    #[arg(short, long)]
    action: Option<String>,
  },
  /// Show a notification the way the page does
  Notify {
    title: String,
    body: String,
    #[arg(long)]
    tag: Option<String>,
  },
  /// List cache stores and their entries
  Caches,
  /// Read JSON-lines events from stdin
  Run,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging(args.log_stderr)?;

  // Load configuration
  let mut config = AgentConfig::load(args.config.as_deref())?;
  if let Some(origin) = args.origin.clone() {
    config.origin = origin;
  }
  if let Some(base_path) = args.base_path.clone() {
    config.base_path = base_path;
  }
  let config = config.normalized()?;

  let storage: Arc<dyn CacheStorage> = if args.ephemeral {
    Arc::new(MemoryStorage::new())
  } else if let Some(path) = &args.db {
    Arc::new(SqliteStorage::open_at(path)?)
  } else {
    Arc::new(SqliteStorage::open_default()?)
  };

  let host = AgentHost::new(Platform {
    storage,
    network: Arc::new(HttpNetwork::new()?),
    clients: Arc::new(HeadlessClients::new()),
    surface: Arc::new(HeadlessSurface::new()),
  });
  let script_url = config.script_url()?;

  match args.command {
    Command::Register => {
      let outcome = host.register(script_url, config).await?;
      print_json(&outcome)?;
    }
    Command::Caches => {
      let storage = &host.platform().storage;
      for name in storage.names()? {
        let marker = if name == config.cache_name { "*" } else { " " };
        println!("{} {}", marker, name);
        for key in storage.keys(&name)? {
          match storage.get(&name, &key)? {
            Some(entry) => println!(
              "    {}  {} (cached {})",
              entry.response.status,
              key,
              entry.cached_at.format("%Y-%m-%d %H:%M:%S")
            ),
            None => println!("    {}", key),
          }
        }
      }
    }
    Command::Run => run_stdin(&host, script_url, config).await?,
    command => {
      if !host.resume(script_url, config.clone())? {
        warn!("Agent is not installed; run `shellcache register` first");
      }
      one_shot(&host, &config, command).await?;
    }
  }

  host.drain().await;
  Ok(())
}

async fn one_shot(host: &AgentHost, config: &AgentConfig, command: Command) -> Result<()> {
  let event = match command {
    Command::Fetch {
      url,
      method,
      navigate,
      body,
    } => {
      let url = resolve_target(config, &url)?;
      let mut request = if navigate {
        Request::navigate(url)
      } else {
        Request::get(url)
      };
      request.method = method.parse::<Method>()?;
      if let Some(body) = body {
        request = request.with_body(body);
      }
      Event::Fetch {
        request,
        respond_to: None,
      }
    }
    Command::Push { payload } => Event::Push {
      payload: payload.map(String::into_bytes),
    },
    Command::Click { id, action } => Event::NotificationClick { id, action },
    Command::Notify { title, body, tag } => {
      let agent = host
        .active()
        .ok_or_else(|| eyre!("No active agent to show notifications"))?;
      let id = agent
        .dispatcher()
        .notify(&title, &body, tag.as_deref())
        .await?;
      println!("{}", id);
      return Ok(());
    }
    other => return Err(eyre!("{:?} cannot run as a one-shot event", other)),
  };

  let outcome = host
    .dispatch(event)
    .await
    .await
    .map_err(|_| eyre!("Event was dropped before completing"))?;
  print_json(&outcome)
}

/// `{"type":"fetch","url":"..."}` per line; one JSON outcome per line back.
async fn run_stdin(host: &AgentHost, script_url: Url, config: AgentConfig) -> Result<()> {
  host.resume(script_url.clone(), config.clone())?;

  let (events, receiver) = event::channel();
  let (outcomes, mut reported) = event::outcome_channel();

  let printer = tokio::spawn(async move {
    while let Some(outcome) = reported.recv().await {
      if let Err(e) = print_json(&outcome) {
        warn!("Failed to print outcome: {}", e);
      }
    }
  });

  // Dropping `events` at end of input lets `run` drain and return
  let (read, ()) = tokio::join!(
    read_events(host, events, script_url, config),
    host.run(receiver, outcomes)
  );

  let _ = printer.await;
  read
}

async fn read_events(
  host: &AgentHost,
  events: EventSender,
  script_url: Url,
  config: AgentConfig,
) -> Result<()> {
  let mut lines = BufReader::new(tokio::io::stdin()).lines();

  while let Some(line) = lines.next_line().await? {
    let line = line.trim();
    if line.is_empty() {
      continue;
    }

    let wire: WireEvent = match serde_json::from_str(line) {
      Ok(w) => w,
      Err(e) => {
        warn!("Skipping malformed event: {}", e);
        continue;
      }
    };

    let event = match wire {
      WireEvent::Register => {
        match host.register(script_url.clone(), config.clone()).await {
          Ok(outcome) => print_json(&outcome)?,
          Err(e) => warn!("Registration failed: {}", e),
        }
        continue;
      }
      WireEvent::Notify { title, body, tag } => {
        if let Some(agent) = host.active() {
          let id = agent
            .dispatcher()
            .notify(&title, &body, tag.as_deref())
            .await?;
          info!(id, "Page notification shown");
        }
        continue;
      }
      WireEvent::Push { payload } => Event::Push {
        payload: payload.map(String::into_bytes),
      },
      WireEvent::NotificationClick { id, action } => Event::NotificationClick { id, action },
      fetch @ WireEvent::Fetch { .. } => match fetch.into_request() {
        Some(request) => Event::Fetch {
          request,
          respond_to: None,
        },
        None => continue,
      },
    };

    events
      .send(event)
      .map_err(|_| eyre!("Event loop stopped before input ended"))?;
  }

  Ok(())
}

fn resolve_target(config: &AgentConfig, target: &str) -> Result<Url> {
  if target.starts_with("http://") || target.starts_with("https://") {
    Url::parse(target).map_err(|e| eyre!("Invalid url '{}': {}", target, e))
  } else {
    config.resolve(target)
  }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string(value)?);
  Ok(())
}

/// Logs go to a daily rolling file under the data directory unless
/// `--log-stderr` is given. The guard must live until exit.
fn init_logging(to_stderr: bool) -> Result<Option<WorkerGuard>> {
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("shellcache=info"));

  if to_stderr {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .init();
    return Ok(None);
  }

  let log_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("shellcache")
    .join("logs");

  let appender = tracing_appender::rolling::daily(log_dir, "shellcache.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(Some(guard))
}
