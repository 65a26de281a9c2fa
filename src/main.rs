mod cache;
mod config;
mod event;
mod host;
mod logging;
mod net;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use cache::{CacheHandle, CacheStore, Generation, LifecycleController, SqliteStore};
use config::{Config, VariantConfig};
use event::EventDispatcher;
use host::{AgentHost, AgentState};
use net::{HttpNetwork, Method, Network, Request};

#[derive(Parser, Debug)]
#[command(name = "offline-agent")]
#[command(about = "Offline-first caching agent for map applications")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-agent/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Application variant whose agent to drive
  #[arg(short, long, global = true)]
  variant: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Provision the variant's generation with its seed resources
  Install,
  /// Delete every generation except the variant's current one
  Activate,
  /// Request resources through the active agent
  Fetch {
    #[command(flatten)]
    options: FetchOptions,
    /// Behave as if there were no connectivity
    #[arg(long)]
    offline: bool,
  },
  /// List the generations present in the store
  Generations,
  /// Install, activate, then request resources, all in one go
  Run {
    #[command(flatten)]
    options: FetchOptions,
  },
}

#[derive(clap::Args, Debug)]
struct FetchOptions {
  /// Resource locators, relative to the variant's base URL
  locators: Vec<String>,

  /// Request method
  #[arg(short = 'X', long, default_value = "GET")]
  method: String,

  /// Extra request header, as "Name: value"
  #[arg(short = 'H', long = "header")]
  headers: Vec<String>,
}

type Host = AgentHost<SqliteStore, HttpNetwork>;

fn controller(
  store: &Arc<SqliteStore>,
  variant: &VariantConfig,
  offline: bool,
) -> Result<(LifecycleController<SqliteStore, HttpNetwork>, Arc<HttpNetwork>)> {
  let network = Arc::new(HttpNetwork::new(&variant.base_url)?.with_offline(offline));
  let controller = LifecycleController::new(
    Arc::clone(store),
    Arc::clone(&network),
    variant.policy(),
    variant.seed_resources.clone(),
  );
  Ok((controller, network))
}

/// Issue every request concurrently and print one line per result.
async fn fetch_all(
  host: &Host,
  events: &EventDispatcher,
  network: &HttpNetwork,
  options: &FetchOptions,
) -> Result<()> {
  let method: Method = options.method.parse()?;
  let headers = options
    .headers
    .iter()
    .map(|header| {
      header
        .split_once(':')
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .ok_or_else(|| eyre!("Invalid header '{}', expected 'Name: value'", header))
    })
    .collect::<Result<Vec<_>>>()?;

  let requests = options
    .locators
    .iter()
    .map(|locator| {
      let request = Request::new(method, network.resolve(locator)?);
      Ok(
        headers
          .iter()
          .fold(request, |request, (name, value)| request.with_header(name.clone(), value.clone())),
      )
    })
    .collect::<Result<Vec<_>>>()?;

  let results = join_all(requests.iter().cloned().map(|request| events.fetch(request))).await;

  let mut failed = 0;
  for (request, result) in requests.iter().zip(results) {
    match result {
      Ok(intercepted) => {
        let response = &intercepted.response;
        println!(
          "{:<8} {} {:<6} {:>8}  {}",
          intercepted.source.as_str(),
          response.status(),
          response.kind().as_str(),
          response.body().len(),
          request.url
        );
      }
      Err(e) => {
        failed += 1;
        println!("{:<8} {:#}", "failed", e);
      }
    }
  }

  for failure in host.controller().flush().await {
    warn!(error = %failure, "Background store write failed");
  }

  if failed > 0 {
    return Err(eyre!("{} of {} request(s) failed", failed, requests.len()));
  }
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.logging)?;

  let variant_name = config.variant_name(args.variant.as_deref());
  let variant = config.variant(Some(variant_name))?;
  let current = variant.generation.identifier();
  let store = Arc::new(SqliteStore::open(&config.store_path(variant_name)?)?);

  match args.command {
    Command::Generations => {
      for (name, created_at) in store.generations()? {
        let marker = if name == current {
          "*"
        } else if Generation::parse(&name).is_none() {
          "?"
        } else {
          " "
        };
        let entries = store.open(&name).await?.keys().await?.len();
        println!(
          "{} {:<32} {:>6} entries  created {}",
          marker,
          name,
          entries,
          created_at.format("%Y-%m-%d %H:%M:%S")
        );
      }
    }
    Command::Install => {
      let (controller, network) = controller(&store, &variant, false)?;
      let host = Arc::new(AgentHost::new(controller, network));
      EventDispatcher::spawn(host).install().await?;
      println!("Installed {}", current);
    }
    Command::Activate => {
      let (controller, network) = controller(&store, &variant, false)?;
      let host = Arc::new(
        AgentHost::restore(controller, network, store.as_ref(), AgentState::Installed).await?,
      );
      EventDispatcher::spawn(host).activate().await?;
      println!("Activated {}", current);
    }
    Command::Fetch { options, offline } => {
      let (controller, network) = controller(&store, &variant, offline)?;
      let host: Arc<Host> = Arc::new(
        AgentHost::restore(controller, Arc::clone(&network), store.as_ref(), AgentState::Activated)
          .await?,
      );
      let events = EventDispatcher::spawn(Arc::clone(&host));
      fetch_all(&host, &events, &network, &options).await?;
    }
    Command::Run { options } => {
      let (controller, network) = controller(&store, &variant, false)?;
      let host: Arc<Host> = Arc::new(AgentHost::new(controller, Arc::clone(&network)));
      let events = EventDispatcher::spawn(Arc::clone(&host));

      events.install().await?;
      if host.can_activate() {
        events.activate().await?;
      }
      println!("Agent {} is {:?}", current, host.state());

      fetch_all(&host, &events, &network, &options).await?;
    }
  }

  Ok(())
}
