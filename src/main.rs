mod attendance;
mod cache;
mod config;
mod error;
mod event;
mod query;
mod sync;
#[cfg(test)]
mod testing;

use chrono::{NaiveDate, NaiveTime};
use clap::{Args as ClapArgs, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use attendance::{
  AttendanceRecord, AttendanceStatus, CheckMethod, DateRange, HttpRemoteSource, PersonKind,
  SyncState,
};
use cache::{AttendanceCache, CacheResult, CacheSource, SqliteStore};
use config::Config;
use error::Error;
use event::{Event, EventHandler};
use query::Query;
use sync::{PassOutcome, SyncCoordinator};

type Service = AttendanceCache<HttpRemoteSource, SqliteStore>;

#[derive(Parser, Debug)]
#[command(name = "attcache")]
#[command(about = "Offline-capable attendance cache for the school attendance API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/attendance-cache/config.yaml)
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
  /// Show attendance for a date range
  List {
    #[arg(long)]
    from: NaiveDate,
    #[arg(long)]
    to: NaiveDate,
    /// Skip the memory cache and ask the API again
    #[arg(long)]
    refresh: bool,
  },
  /// Record attendance (queued locally if the API is unreachable)
  Create(CreateArgs),
  /// Show records waiting to be synced
  Pending,
  /// Push queued records now (skipped while another attcache process is mid-pass)
  Sync,
  /// Show cache statistics
  Stats,
  /// Drop the memory cache and the local store
  Clear {
    /// Also discard records that have not been synced yet
    #[arg(long)]
    yes: bool,
  },
  /// Keep a date range on screen, refreshing and syncing in the background
  Watch {
    #[arg(long)]
    from: NaiveDate,
    #[arg(long)]
    to: NaiveDate,
    /// Seconds between refreshes
    #[arg(long, default_value_t = 30)]
    refresh_secs: u64,
  },
}

#[derive(ClapArgs, Debug)]
struct CreateArgs {
  #[arg(long)]
  user_id: i64,
  #[arg(long)]
  username: String,
  #[arg(long, default_value = "student")]
  kind: PersonKind,
  #[arg(long)]
  date: NaiveDate,
  /// HH:MM or HH:MM:SS
  #[arg(long, value_parser = parse_time)]
  check_in: Option<NaiveTime>,
  #[arg(long, value_parser = parse_time)]
  check_out: Option<NaiveTime>,
  #[arg(long, default_value = "present")]
  status: AttendanceStatus,
  #[arg(long, default_value = "manual")]
  method: CheckMethod,
  #[arg(long, default_value = "")]
  note: String,
}

fn parse_time(s: &str) -> Result<NaiveTime, chrono::ParseError> {
  NaiveTime::parse_from_str(s, "%H:%M").or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
}

impl CreateArgs {
  fn into_record(self) -> AttendanceRecord {
    AttendanceRecord {
      id: 0,
      user_id: self.user_id,
      username: self.username,
      kind: self.kind,
      date: self.date,
      check_in_time: self.check_in,
      check_out_time: self.check_out,
      status: self.status,
      method: self.method,
      note: self.note,
      sync_state: SyncState::Pending,
    }
  }
}

fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = init_tracing(args.verbose)?;

  // Shared pool for on-demand reads/writes; the sync ticker is one task on it.
  let runtime = tokio::runtime::Builder::new_multi_thread()
    .enable_all()
    .max_blocking_threads(config.workers.blocking_threads.max(1))
    .build()
    .map_err(|e| eyre!("Failed to start runtime: {}", e))?;

  runtime.block_on(run(args.command, config))
}

/// Log to a daily file under the data directory, and to stderr with --verbose.
/// Use RUST_LOG to control the level (e.g., RUST_LOG=debug).
fn init_tracing(verbose: bool) -> Result<WorkerGuard> {
  let log_dir = Config::data_dir()?.join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "attcache.log"));

  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let stderr = verbose.then(|| fmt::layer().with_writer(std::io::stderr));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(stderr)
    .init();

  Ok(guard)
}

async fn run(command: Command, config: Config) -> Result<()> {
  let remote = HttpRemoteSource::new(&config)?;
  let db_path = config.db_path()?;
  let store = SqliteStore::open(&db_path)
    .map_err(|e| eyre!("Failed to open local store at {}: {}", db_path.display(), e))?;
  let cache = AttendanceCache::new(remote, store, config.cache.ttl())
    .with_remote_timeout(config.remote.timeout());

  info!(command = ?command, "attcache starting");

  match command {
    Command::List { from, to, refresh } => {
      let range = DateRange::new(from, to);
      if refresh {
        cache.invalidate(&range);
      }
      match cache.get_by_range(range).await {
        Ok(result) => print_result(&range, &result),
        Err(Error::NoCachedData { .. }) => {
          println!("Offline and nothing cached for {}", range);
        }
        Err(e) => return Err(e.into()),
      }
    }
    Command::Create(args) => {
      let record = cache.create(args.into_record()).await?;
      match record.sync_state {
        SyncState::Synced => println!("Recorded as #{}", record.id),
        SyncState::Pending => println!(
          "API unreachable; queued locally as #{} and will sync automatically",
          record.id
        ),
      }
    }
    Command::Pending => {
      let pending = cache.list_pending()?;
      if pending.is_empty() {
        println!("Nothing waiting to sync");
      } else {
        print_records(&pending);
      }
    }
    Command::Sync => match SyncCoordinator::new(cache.clone()).run_pass().await {
      PassOutcome::Completed(report) => println!(
        "Synced {} of {} queued records ({} failed)",
        report.synced.len(),
        report.attempted,
        report.failed
      ),
      PassOutcome::Skipped => println!("A sync pass is already running"),
    },
    Command::Stats => println!("{}", cache.stats()?),
    Command::Clear { yes } => {
      let pending = cache.stats()?.store.pending;
      if pending > 0 && !yes {
        return Err(eyre!(
          "{} records have not been synced yet; pass --yes to discard them",
          pending
        ));
      }
      cache.clear_all().await?;
      println!("Caches cleared");
    }
    Command::Watch {
      from,
      to,
      refresh_secs,
    } => {
      let range = DateRange::new(from, to);
      watch(cache.clone(), &config, range, Duration::from_secs(refresh_secs.max(1))).await;
    }
  }

  cache.flush_writes().await;
  Ok(())
}

/// Keep re-reading `range` while the sync coordinator runs in the background.
async fn watch(cache: Service, config: &Config, range: DateRange, refresh: Duration) {
  let mut events = EventHandler::new(Duration::from_millis(250));

  let (report_tx, mut report_rx) = mpsc::unbounded_channel();
  let sync = SyncCoordinator::new(cache.clone())
    .with_observer(report_tx)
    .spawn(config.sync.interval());

  let forward = events.sender();
  tokio::spawn(async move {
    while let Some(report) = report_rx.recv().await {
      if forward.send(Event::Synced(report)).is_err() {
        break;
      }
    }
  });

  let reader = cache.clone();
  let mut query = Query::new(move || {
    let cache = reader.clone();
    async move { cache.get_by_range(range).await.map_err(|e| e.to_string()) }
  })
  .with_stale_time(refresh);
  query.fetch();

  println!("Watching {} (Ctrl-C to stop)", range);

  while let Some(event) = events.next().await {
    match event {
      Event::Tick => {
        if query.poll() {
          if let Some(result) = query.state().data() {
            print_result(&range, result);
            // Remote is reachable again; don't wait for the next tick to drain the queue.
            let queued = cache.list_pending().map(|p| !p.is_empty()).unwrap_or(false);
            if result.source == CacheSource::Network && queued {
              drop(sync.trigger());
            }
          } else if let Some(e) = query.state().error() {
            eprintln!("{}", e);
          }
        } else if query.needs_refresh() {
          query.refetch();
        }
      }
      Event::Synced(report) => {
        println!("Synced {} queued records", report.synced.len());
        query.refetch();
      }
      Event::Quit => break,
    }
  }

  sync.shutdown().await;
}

fn print_result(range: &DateRange, result: &CacheResult<Vec<AttendanceRecord>>) {
  let as_of = result.cached_at.with_timezone(&chrono::Local).format("%H:%M:%S");
  let note = if result.is_fallback() {
    " - offline, showing local copy"
  } else {
    ""
  };
  println!(
    "{} records for {} ({}, as of {}){}",
    result.data.len(),
    range,
    result.source,
    as_of,
    note
  );
  print_records(&result.data);
}

fn print_records(records: &[AttendanceRecord]) {
  let time = |t: Option<NaiveTime>| {
    t.map(|t| t.format("%H:%M").to_string())
      .unwrap_or_else(|| "--:--".to_string())
  };

  for r in records {
    let pending = if r.is_pending() { " (pending)" } else { "" };
    println!(
      "{:>7}  {}  {:<20} {:<8} {} {}  {:<10} {:<8}{}{}",
      r.id,
      r.date,
      r.username,
      r.kind,
      time(r.check_in_time),
      time(r.check_out_time),
      r.status,
      r.method,
      if r.note.is_empty() {
        String::new()
      } else {
        format!("  {}", r.note)
      },
      pending
    );
  }
}
