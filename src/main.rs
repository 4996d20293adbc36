mod config;

use chrono::Local;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::Config;
use coursenotes::cache::CacheSource;
use coursenotes::connectivity::{Connectivity, NetworkStatus};
use coursenotes::notes::{NewNote, Note, NotesReadOptions, NotesRepository, PublishState, WriteOutcome};
use coursenotes::remote::HttpRemote;
use coursenotes::site::{SiteContext, SiteId, SiteRegistry};
use coursenotes::storage::SqliteStore;
use coursenotes::sync::{SyncCoordinator, SyncResult};

#[derive(Parser, Debug)]
#[command(name = "coursenotes")]
#[command(about = "Read and write course notes, online or offline")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/coursenotes/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Site id to use (default: default_site from the config)
  #[arg(short, long)]
  site: Option<String>,

  /// Treat the device as offline: writes are queued without trying the server
  #[arg(long)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show the notes of a course
  Notes {
    course: i64,
    /// Only show one publish state (site, course or personal)
    #[arg(long)]
    state: Option<PublishState>,
    /// Bypass the cache
    #[arg(long)]
    refresh: bool,
  },
  /// Add a note about a user
  Add {
    course: i64,
    user: i64,
    state: PublishState,
    text: String,
  },
  /// Send queued notes to the server
  Sync,
  /// List queued operations
  Pending,
  /// Mark the cached notes of a course stale
  Invalidate { course: i64 },
  /// Forget cached data and capabilities of the site
  Logout,
  /// Sync automatically until interrupted, printing each run
  Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;

  let data_dir = config.data_dir()?;
  std::fs::create_dir_all(&data_dir)
    .map_err(|e| eyre!("Failed to create data directory {}: {}", data_dir.display(), e))?;
  let _log_guard = init_logging(&data_dir);

  let selected = config.site(args.site.as_deref())?;
  let store = Arc::new(SqliteStore::open(&SqliteStore::default_path(&data_dir))?);
  let mut registry = SiteRegistry::new(store);
  if let Some(max_age) = config.cache_max_age() {
    registry = registry.with_cache_max_age(max_age);
  }

  // The selected site must be usable; others are registered for `watch` when possible
  for site in &config.sites {
    let token = match Config::token(site) {
      Ok(token) => token,
      Err(err) if site.id == selected.id => return Err(err),
      Err(err) => {
        warn!(site = %site.id, error = %err, "site skipped");
        continue;
      }
    };
    let remote = HttpRemote::new(&site.url, token, config.request_timeout())?;
    registry.register(SiteId::new(&site.id), Arc::new(remote));
  }
  let registry = Arc::new(registry);
  let site = registry.get(&SiteId::new(&selected.id))?;

  let connectivity = Connectivity::new(if args.offline {
    NetworkStatus::Offline
  } else {
    NetworkStatus::Online
  });
  let repo = NotesRepository::new(connectivity.clone());
  let coordinator = Arc::new(
    SyncCoordinator::new(config.retry_policy()).with_handler(NotesRepository::replay_handler()),
  );

  match args.command {
    Command::Notes {
      course,
      state,
      refresh,
    } => show_notes(&repo, &site, course, state, refresh).await,
    Command::Add {
      course,
      user,
      state,
      text,
    } => add_note(&repo, &site, course, user, state, text).await,
    Command::Sync => {
      let result = coordinator.sync(&site).await;
      print_sync_result(site.id(), &result);
      Ok(())
    }
    Command::Pending => {
      let pending = site.queue().list(None)?;
      if pending.is_empty() {
        println!("Nothing queued.");
      }
      for op in pending {
        println!(
          "{} {} created {} attempts {}: {}",
          op.id,
          op.entity_kind,
          op.created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
          op.attempts,
          op.payload
        );
      }
      Ok(())
    }
    Command::Invalidate { course } => {
      repo.invalidate(&site, course)?;
      println!("Cached notes of course {} marked stale.", course);
      Ok(())
    }
    Command::Logout => {
      registry.logout(site.id())?;
      println!("Logged out of {}.", site.id());
      Ok(())
    }
    Command::Watch => watch(&coordinator, registry, connectivity, config.sync_interval()).await,
  }
}

/// Log to a daily file under the data directory so stdout stays clean.
fn init_logging(data_dir: &Path) -> tracing_appender::non_blocking::WorkerGuard {
  let appender = tracing_appender::rolling::daily(data_dir.join("logs"), "coursenotes.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::registry()
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "coursenotes=info".into()))
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false),
    )
    .init();

  guard
}

/// Site info drives the feature checks; without it they stay permissive.
async fn load_site_info(site: &SiteContext) {
  if let Err(err) = site.refresh_info().await {
    warn!(site = %site.id(), error = %err, "site info unavailable");
  }
}

async fn show_notes(
  repo: &NotesRepository,
  site: &Arc<SiteContext>,
  course: i64,
  state: Option<PublishState>,
  refresh: bool,
) -> Result<()> {
  load_site_info(site).await;
  if site.info().is_some() && !repo.is_view_notes_enabled(site) {
    return Err(eyre!("Notes are not available on {}", site.id()));
  }

  let options = NotesReadOptions {
    ignore_cache: refresh,
    only_online: false,
  };
  let result = repo.read(site, course, options).await?;
  repo.log_view(site, course).await;

  match result.source {
    CacheSource::Emergency => println!(
      "Offline: showing notes cached {}",
      result
        .cached_at
        .map(|at| at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "earlier".to_string())
    ),
    CacheSource::Offline => println!("Offline: only notes not yet sent are shown"),
    CacheSource::Network | CacheSource::Cache => {}
  }
  for warning in &result.data.warnings {
    println!("Warning: {}", warning);
  }

  let states = match state {
    Some(state) => vec![state],
    None => PublishState::ALL.to_vec(),
  };
  for state in states {
    let notes = result.data.of_state(state).to_vec();
    let notes = repo.attach_display_metadata(site, notes).await;
    print_notes(state, &notes);
  }
  Ok(())
}

fn print_notes(state: PublishState, notes: &[Note]) {
  let pending = if NotesRepository::has_pending_offline(notes) {
    " (some not yet sent)"
  } else {
    ""
  };
  println!("== {} notes{} ==", state, pending);
  if notes.is_empty() {
    println!("  (none)");
  }

  for note in notes {
    let author = note
      .author
      .as_ref()
      .map(|a| a.full_name.clone())
      .unwrap_or_else(|| format!("User {}", note.user_id));
    let when = note
      .last_modified
      .map(|at| at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
      .unwrap_or_default();
    let marker = if note.offline { "[pending] " } else { "" };
    println!("  {}{} {}: {}", marker, author, when, note.text);
  }
}

async fn add_note(
  repo: &NotesRepository,
  site: &Arc<SiteContext>,
  course: i64,
  user: i64,
  state: PublishState,
  text: String,
) -> Result<()> {
  load_site_info(site).await;
  if site.info().is_some() && !repo.is_add_note_enabled(site) {
    return Err(eyre!("Adding notes is not enabled on {}", site.id()));
  }

  match repo.write(site, NewNote::new(user, course, state, text)).await? {
    WriteOutcome::Confirmed => println!("Note saved."),
    WriteOutcome::Queued(id) => {
      println!("Note stored offline as {}; it will be sent on the next sync.", id)
    }
  }
  Ok(())
}

fn print_sync_result(site: &SiteId, result: &SyncResult) {
  println!(
    "{}: {} sent, {} dropped",
    site,
    result.succeeded.len(),
    result.failed.len()
  );
  for failed in &result.failed {
    println!("  {} dropped: {}", failed.operation_id, failed.reason);
  }
  for warning in &result.warnings {
    if !result.failed.iter().any(|f| &f.reason == warning) {
      println!("  warning: {}", warning);
    }
  }
  if let Some(reason) = &result.interrupted {
    println!("  stopped early, will retry: {}", reason);
  }
}

async fn watch(
  coordinator: &Arc<SyncCoordinator>,
  registry: Arc<SiteRegistry>,
  connectivity: Connectivity,
  interval: std::time::Duration,
) -> Result<()> {
  let mut events = coordinator.subscribe();
  let task = coordinator.spawn_auto_sync(registry, connectivity, interval);
  println!("Syncing every {}s; press Ctrl-C to stop.", interval.as_secs());

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      event = events.recv() => match event {
        Ok(event) if !event.result.is_empty() || event.result.interrupted.is_some() => {
          print_sync_result(&event.site_id, &event.result);
        }
        Ok(_) => {}
        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
          warn!(skipped, "missed sync events");
        }
        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
      },
    }
  }

  task.abort();
  Ok(())
}
