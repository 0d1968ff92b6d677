use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use shopsync::datalayer::QueryOptions;
use shopsync::{App, Config, EntityKind, PaymentVerification};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "shopsync")]
#[command(about = "Inspect and drive the storefront offline data layer")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shopsync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Mirror logs to stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Connectivity, breaker, cache and queue summary
  Status,
  /// List queued offline operations in replay order
  Queue,
  /// Replay the offline queue now
  Sync,
  /// Drop every queued offline operation
  Clear,
  /// Show operations dropped without reaching the server
  Failures {
    /// Empty the failure log instead
    #[arg(long)]
    clear: bool,
  },
  /// Read one entity through the cache
  Get { entity: String, id: String },
  /// Ask the server to verify a payment signature
  VerifyPayment {
    #[arg(long)]
    order_id: String,
    #[arg(long)]
    payment_id: String,
    #[arg(long)]
    signature: String,
  },
}

fn init_logging(verbose: bool) -> Result<WorkerGuard> {
  let log_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("shopsync")
    .join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (file_writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "shopsync.log"));
  let filter = EnvFilter::try_from_env("SHOPSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
  let stderr = verbose.then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

  tracing_subscriber::registry()
    .with(filter)
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false),
    )
    .with(stderr)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
  let out = serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to render output: {}", e))?;
  println!("{}", out);
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging(args.verbose)?;

  let config = Config::load(args.config.as_deref())?;
  let mut app = App::new(config)?;

  let result = run(&mut app, args.command).await;
  app.shutdown();
  result
}

async fn run(app: &mut App, command: Command) -> Result<()> {
  let data = app.data().clone();
  match command {
    Command::Status => print_json(&app.status())?,
    Command::Queue => {
      let pending = data.offline().pending();
      if pending.is_empty() {
        println!("Offline queue is empty");
      }
      for op in pending {
        println!(
          "{}  {:<8} {:<14} {:<12} priority={:?} retries={}/{} queued={}",
          op.id,
          format!("{:?}", op.kind).to_lowercase(),
          op.entity.to_string(),
          op.entity_id.as_deref().unwrap_or("-"),
          op.priority,
          op.retry_count,
          op.max_retries,
          op.created_at.format("%Y-%m-%d %H:%M:%S"),
        );
      }
    }
    Command::Sync => {
      let report = data
        .offline()
        .sync_operations()
        .await
        .map_err(|e| eyre!("Sync failed: {}", e))?;
      print_json(&report)?;
    }
    Command::Clear => {
      let cleared = data
        .offline()
        .clear()
        .map_err(|e| eyre!("Failed to clear offline queue: {}", e))?;
      println!("Cleared {} queued operation(s)", cleared);
    }
    Command::Failures { clear } => {
      if clear {
        data
          .offline()
          .clear_failures()
          .map_err(|e| eyre!("Failed to clear failure log: {}", e))?;
        println!("Failure log cleared");
      } else {
        let failures = data
          .offline()
          .failures()
          .map_err(|e| eyre!("Failed to read failure log: {}", e))?;
        print_json(&failures)?;
      }
    }
    Command::Get { entity, id } => {
      let kind = EntityKind::resolve(&entity).ok_or_else(|| {
        let known: Vec<_> = EntityKind::ALL.iter().map(|k| k.name()).collect();
        eyre!("Unknown entity '{}'. Known: {}", entity, known.join(", "))
      })?;
      app.start();
      let response = data
        .get(kind, &id, QueryOptions::default())
        .await
        .map_err(|e| eyre!("Failed to load {} {}: {}", kind, id, e))?;
      print_json(&response)?;
    }
    Command::VerifyPayment {
      order_id,
      payment_id,
      signature,
    } => {
      app.start();
      let verification = PaymentVerification::new(order_id, payment_id, signature);
      let response = data
        .verify_payment(&verification)
        .await
        .map_err(|e| eyre!("Payment verification failed: {}", e))?;
      print_json(&response)?;
    }
  }
  Ok(())
}
