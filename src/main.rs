use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing::info;

use salus_offline::{
  logging, CacheManager, CacheStorage, Config, Destination, EventOutcome, HttpNetwork,
  LifecycleEvent, MemoryStorage, Network, ServiceWorker, SqliteStorage,
};

#[derive(Parser, Debug)]
#[command(name = "salus-offline")]
#[command(about = "Offline cache for the Salus calculator")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/salus/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin the calculator is served from
  #[arg(short, long)]
  origin: Option<String>,

  /// Keep the cache in memory for this run only
  #[arg(long)]
  in_memory: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch and store every asset of the current generation
  Install,
  /// Install, then remove every other generation
  Activate,
  /// Answer one request the way the page would see it
  Fetch {
    /// Path relative to the origin, e.g. ./index.html
    path: String,

    /// Request destination (guessed from the path if omitted)
    #[arg(short, long, value_enum)]
    destination: Option<Destination>,

    #[arg(short, long, default_value = "GET")]
    method: String,
  },
  /// List stored cache generations
  Caches,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override origin if specified on command line
  let config = if let Some(origin) = args.origin {
    Config { origin, ..config }
  } else {
    config
  };

  let _log_guard = logging::init(&config.logging)?;

  let origin = config.origin_url()?;
  info!(origin = %origin, "Using origin");
  let network = HttpNetwork::new()?;

  if args.in_memory {
    let manager = CacheManager::new(MemoryStorage::new(), network, origin);
    return run(args.command, manager).await;
  }

  let storage = match &config.cache_path {
    Some(path) => SqliteStorage::open_at(path)?,
    None => SqliteStorage::open()?,
  };
  run(args.command, CacheManager::new(storage, network, origin)).await
}

async fn run<S: CacheStorage, N: Network>(
  command: Command,
  manager: CacheManager<S, N>,
) -> Result<()> {
  match command {
    Command::Install => {
      let worker = ServiceWorker::new(manager);
      dispatch(&worker, LifecycleEvent::Install).await?;
    }
    Command::Activate => {
      let worker = ServiceWorker::new(manager);
      dispatch(&worker, LifecycleEvent::Install).await?;
      dispatch(&worker, LifecycleEvent::Activate).await?;
    }
    Command::Fetch {
      path,
      destination,
      method,
    } => {
      let mut request = manager.request_for(&path)?.with_method(&method);
      if let Some(destination) = destination {
        request = request.with_destination(destination);
      }

      // Install skips assets already stored, so this also works offline
      let worker = ServiceWorker::new(manager);
      dispatch(&worker, LifecycleEvent::Install).await?;
      dispatch(&worker, LifecycleEvent::Activate).await?;

      dispatch(&worker, LifecycleEvent::Fetch(request)).await?;
    }
    Command::Caches => {
      let storage = manager.storage();
      for name in storage.keys()? {
        let count = storage.entry_count(&name)?.unwrap_or(0);
        let marker = if name == manager.cache_name() { "*" } else { " " };
        println!("{} {} ({} entries)", marker, name, count);
      }
    }
  }

  Ok(())
}

/// Deliver an event and print what came of it.
async fn dispatch<S: CacheStorage, N: Network>(
  worker: &ServiceWorker<S, N>,
  event: LifecycleEvent,
) -> Result<()> {
  match worker.dispatch(event).await? {
    EventOutcome::Installed(report) => {
      println!(
        "installed {}: {} fetched, {} already cached",
        report.cache_name, report.fetched, report.already_cached
      );
    }
    EventOutcome::Activated(report) => {
      for name in &report.deleted {
        println!("deleted {}", name);
      }
      for (name, reason) in &report.failed {
        eprintln!("could not delete {}: {}", name, reason);
      }
      println!("activated");
    }
    EventOutcome::Response(result) => {
      let from = match &result.cache_name {
        Some(name) => format!("{} ({})", result.source, name),
        None => result.source.to_string(),
      };
      println!(
        "{} {} from {}, {} bytes",
        result.data.status,
        result.data.url,
        from,
        result.data.body.len()
      );
      if result.data.status >= 400 {
        return Err(eyre!("Request failed with status {}", result.data.status));
      }
    }
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use async_trait::async_trait;
  use salus_offline::assets::{ASSETS, CACHE_NAME};
  use salus_offline::{Request, Response};
  use std::sync::Arc;
  use url::Url;

  /// Transport with no connectivity at all.
  struct Offline;

  #[async_trait]
  impl Network for Offline {
    async fn fetch(&self, request: &Request) -> Result<Response> {
      Err(eyre!("Failed to fetch {}: network unreachable", request.url))
    }
  }

  fn origin() -> Url {
    Url::parse("https://salus.test/").unwrap()
  }

  fn fully_cached(storage: &MemoryStorage, cache: &str) {
    let entries: Vec<(Request, Response)> = ASSETS
      .iter()
      .map(|asset| {
        let request = Request::get(origin().join(asset).unwrap());
        let response = Response::new(&request.url, 200, *asset);
        (request, response)
      })
      .collect();
    storage.put_all(cache, &entries).unwrap();
  }

  #[tokio::test]
  async fn test_fetch_command_prunes_old_generations_before_serving() {
    let storage = Arc::new(MemoryStorage::new());
    fully_cached(&storage, "salus-calculator-v1");
    fully_cached(&storage, CACHE_NAME);
    let manager = CacheManager::shared(storage.clone(), Arc::new(Offline), origin());

    let command = Command::Fetch {
      path: "./profit.png".to_string(),
      destination: None,
      method: "GET".to_string(),
    };
    run(command, manager).await.unwrap();

    assert_eq!(storage.keys().unwrap(), vec![CACHE_NAME]);
  }

  #[tokio::test]
  async fn test_fetch_command_fails_offline_without_cache() {
    let storage = Arc::new(MemoryStorage::new());
    let manager = CacheManager::shared(storage, Arc::new(Offline), origin());

    let command = Command::Fetch {
      path: "./index.html".to_string(),
      destination: None,
      method: "GET".to_string(),
    };
    assert!(run(command, manager).await.is_err());
  }
}
