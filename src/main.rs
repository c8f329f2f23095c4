use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use notifeed::backend::{ChangeChannel, ChangeHub, HttpBackend, NotificationBackend, SqliteBackend};
use notifeed::config::Config;
use notifeed::model::{NotificationKind, Payload};
use notifeed::storage::{Database, DatabaseError};
use notifeed::view;
use notifeed::{FeedError, NotificationCenter, NotificationItem};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Get the config directory path (~/.config/notifeed/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("notifeed"))
}

#[derive(Parser, Debug)]
#[command(name = "notifeed", about = "Notification feed with live cache sync")]
struct Args {
    /// Config file (defaults to ~/.config/notifeed/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Use the remote API from `backend_url` instead of the local database
    #[arg(long, global = true)]
    remote: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List loaded notifications, newest first
    List {
        #[arg(long)]
        owner: String,
        /// Number of pages to load
        #[arg(long, default_value_t = 1)]
        pages: usize,
    },
    /// Mark one notification read (or unread)
    Read {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        id: String,
        #[arg(long)]
        unread: bool,
    },
    /// Mark every notification read
    ReadAll {
        #[arg(long)]
        owner: String,
    },
    /// Create a notification in the local database
    Push {
        #[arg(long)]
        owner: String,
        #[arg(long, default_value = "system")]
        kind: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        message: Option<String>,
        /// Prompt a mention links to
        #[arg(long)]
        prompt: Option<String>,
    },
    /// Keep a live session open and report unread counts as they change
    Watch {
        #[arg(long)]
        owner: String,
        /// Stop after this many seconds (runs until Ctrl+C when omitted)
        #[arg(long)]
        seconds: Option<u64>,
    },
}

struct Backends {
    backend: Arc<dyn NotificationBackend>,
    channel: Arc<dyn ChangeChannel>,
    local: Option<SqliteBackend>,
}

async fn open_local(config: &Config, config_dir: &Path) -> Result<SqliteBackend> {
    let db_path = config
        .database_path
        .clone()
        .unwrap_or_else(|| config_dir.join("notifications.db"));
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;

    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!("Error: The notification database is locked by another process. Try again shortly.");
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
    };
    Ok(SqliteBackend::new(db, ChangeHub::new(), config.feed_topic.clone()))
}

fn open_remote(config: &Config) -> Result<HttpBackend> {
    let base_url = config
        .backend_url
        .as_deref()
        .context("--remote requires backend_url in the config file")?;
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to build HTTP client")?;
    HttpBackend::new(client, base_url, config.api_key.clone(), config.request_timeout())
        .context("Invalid backend_url")
}

async fn open_backends(args: &Args, config: &Config, config_dir: &Path) -> Result<Backends> {
    if args.remote {
        let remote = open_remote(config)?;
        tracing::info!("Using remote notification backend");
        // The remote API has no push channel here; a local hub just stays silent.
        return Ok(Backends {
            backend: Arc::new(remote),
            channel: Arc::new(ChangeHub::new()),
            local: None,
        });
    }
    let local = open_local(config, config_dir).await?;
    Ok(Backends {
        backend: Arc::new(local.clone()),
        channel: Arc::new(local.clone()),
        local: Some(local),
    })
}

fn print_item(item: &NotificationItem) {
    let marker = if item.is_unread() { "*" } else { " " };
    println!(
        "{} {}  {}  [{}]  {}",
        marker,
        item.created_at.format("%Y-%m-%d %H:%M"),
        item.id,
        item.kind,
        view::resolve_display_title(item)
    );
    if let Some(message) = view::resolve_display_message(item) {
        println!("      {}", message);
    }
    if let Some(target) = view::build_navigation_target(item) {
        println!("      -> {}", target.href());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
    }
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?
        .with_env_overrides();
    tracing::debug!(config = ?config, "Effective configuration");

    let backends = open_backends(&args, &config, &config_dir).await?;
    let mut center = NotificationCenter::new(
        backends.backend.clone(),
        backends.channel.clone(),
        config.center_options(),
    );

    match &args.command {
        Command::List { owner, pages } => {
            center.set_owner(Some(owner.as_str())).await;
            let feed = center.feed();
            feed.fetch_first_page().await?;
            for _ in 1..*pages {
                if !feed.has_next_page() {
                    break;
                }
                feed.fetch_next_page().await?;
            }
            let items = feed.items();
            for item in &items {
                print_item(item);
            }
            println!(
                "{} shown, {} unread, {} unread mentions{}",
                items.len(),
                view::count_unread(&items),
                view::count_unread_mentions(&items),
                if feed.has_next_page() { ", more available" } else { "" }
            );
        }

        Command::Read { owner, id, unread } => {
            center.set_owner(Some(owner.as_str())).await;
            let read_at = center.mutations().set_read(id, !unread).await?;
            match read_at {
                Some(at) => println!("Marked {} read at {}", id, at.to_rfc3339()),
                None => println!("Marked {} unread", id),
            }
        }

        Command::ReadAll { owner } => {
            center.set_owner(Some(owner.as_str())).await;
            match center.mutations().mark_all_read().await {
                Ok(at) => println!("Marked all notifications read at {}", at.to_rfc3339()),
                Err(e @ FeedError::PermissionDenied) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Command::Push {
            owner,
            kind,
            title,
            message,
            prompt,
        } => {
            let Some(local) = &backends.local else {
                anyhow::bail!("push only works against the local database");
            };
            let mut payload = Payload::default();
            payload.insert("title", title.as_str());
            if let Some(message) = message {
                payload.insert("message", message.as_str());
            }
            if let Some(prompt) = prompt {
                payload.insert("prompt_id", prompt.as_str());
            }
            let item = local
                .create_notification(owner, NotificationKind::from(kind.as_str()), payload)
                .await
                .context("Failed to create notification")?;
            println!("Created {}", item.id);
        }

        Command::Watch { owner, seconds } => {
            center.set_owner(Some(owner.as_str())).await;
            let feed = center.feed();
            feed.fetch_first_page().await?;
            let key = notifeed::cache::FeedKey::notifications(owner);

            let deadline = seconds.map(|s| tokio::time::Instant::now() + Duration::from_secs(s));
            let mut poll = tokio::time::interval(Duration::from_secs(1));
            let mut last_unread = None;
            println!("Watching notifications for {} (Ctrl+C to stop)", owner);

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = async {
                        match deadline {
                            Some(at) => tokio::time::sleep_until(at).await,
                            None => std::future::pending::<()>().await,
                        }
                    } => break,
                    _ = poll.tick() => {
                        // Writes from other processes never reach this hub.
                        center.cache().invalidate(&key);
                        let unread = view::count_unread(feed.items());
                        if last_unread != Some(unread) {
                            tracing::info!(owner = %owner, unread, "Unread count changed");
                            println!("{} unread", unread);
                            last_unread = Some(unread);
                        }
                    }
                }
            }
        }
    }

    center.shutdown().await;
    Ok(())
}
