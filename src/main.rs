//! CLI entry point for `newspool`: a driver and inspection tool for the
//! news database files.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;

use newspool::active::ActiveTable;
use newspool::config;
use newspool::history::{HistoryStore, HistoryStatus};
use newspool::newsrc::Newsrc;
use newspool::session::{MoveCmd, Session, SessionOptions};
use newspool::spool::SpoolStore;

#[derive(Parser)]
#[command(name = "newspool", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override the active file location
    #[arg(long, global = true, env = "NEWSPOOL_ACTIVE")]
    active: Option<PathBuf>,

    /// Override the history database location
    #[arg(long, global = true, env = "NEWSPOOL_HISTORY")]
    history: Option<PathBuf>,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and mutate the active index
    Active {
        #[command(subcommand)]
        command: ActiveCmd,
    },
    /// Inspect and mutate the history database
    History {
        #[command(subcommand)]
        command: HistoryCmd,
    },
    /// Subscription file status
    Newsrc {
        /// Print each subscribed group with its unread count
        #[arg(long)]
        json: bool,
    },
    /// Walk unread news, printing each position visited
    Walk {
        /// Follow reply chains before sequential order
        #[arg(long)]
        thread: bool,
        /// Include already-read articles
        #[arg(long)]
        reread: bool,
        /// Walk backwards
        #[arg(long)]
        reverse: bool,
        /// Stop after this many articles
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Mark visited articles read in the newsrc
        #[arg(long)]
        commit: bool,
    },
}

#[derive(Subcommand)]
enum ActiveCmd {
    /// List all groups
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show one group
    Find {
        group: String,
        #[arg(long)]
        json: bool,
    },
    /// Reserve the next article number in a group
    Bump { group: String },
    /// Create a group (and its ancestors)
    Create {
        name: String,
        #[arg(long)]
        moderated: bool,
    },
    /// Flag a group as removed
    Remove { group: String },
}

#[derive(Subcommand)]
enum HistoryCmd {
    /// Look up a message-ID
    Seek {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Dump every entry in storage order
    Sweep {
        #[arg(long)]
        json: bool,
    },
    /// Drop entries whose expiry has passed and rewrite the database
    Expire,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = config::load_config();

    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    setup_logging(log_level, &config);

    let active_path = cli.active.unwrap_or_else(|| config.paths.active.clone());
    let history_path = cli.history.unwrap_or_else(|| config.paths.history.clone());

    match cli.command {
        Commands::Active { command } => cmd_active(command, &active_path),
        Commands::History { command } => cmd_history(command, &history_path),
        Commands::Newsrc { json } => cmd_newsrc(json, &active_path, &config),
        Commands::Walk {
            thread,
            reread,
            reverse,
            limit,
            commit,
        } => cmd_walk(thread, reread, reverse, limit, commit, &active_path, &history_path, &config),
    }
}

/// Set up tracing with stderr output and optional file logging.
fn setup_logging(level: &str, config: &config::Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let log_dir = config::cache_dir(config);
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(&log_dir, "newspool.log");
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

fn cmd_active(command: ActiveCmd, path: &PathBuf) -> anyhow::Result<()> {
    let mut table = ActiveTable::open(path).context("opening active file")?;

    match command {
        ActiveCmd::List { json } => {
            for (_, grp) in table.iter() {
                if json {
                    println!(
                        "{}",
                        json!({
                            "group": grp.name,
                            "min": grp.min,
                            "max": grp.max,
                            "moderated": grp.flags.moderated,
                            "removed": grp.flags.removed,
                            "unread": grp.unread,
                        })
                    );
                } else {
                    println!("{} {}-{} ({} articles)", grp.name, grp.min, grp.max, grp.article_count());
                }
            }
        }
        ActiveCmd::Find { group, json } => {
            let id = table
                .find(&group)
                .with_context(|| format!("no such group: {group}"))?;
            let grp = table.group(id);
            if json {
                println!(
                    "{}",
                    json!({
                        "group": grp.name,
                        "min": grp.min,
                        "max": grp.max,
                        "moderated": grp.flags.moderated,
                        "local": grp.flags.local,
                        "removed": grp.flags.removed,
                        "last_post": grp.last_post,
                    })
                );
            } else {
                println!("{} {}-{}", grp.name, grp.min, grp.max);
            }
        }
        ActiveCmd::Bump { group } => {
            let id = table
                .find(&group)
                .with_context(|| format!("no such group: {group}"))?;
            let article = table.bump_article(id)?;
            println!("{group}/{article}");
        }
        ActiveCmd::Create { name, moderated } => {
            table.create(&name, moderated, true)?;
            println!("created {name}");
        }
        ActiveCmd::Remove { group } => {
            let id = table
                .find(&group)
                .with_context(|| format!("no such group: {group}"))?;
            table.mark_removed(id)?;
            println!("removed {group}");
        }
    }
    Ok(())
}

fn cmd_history(command: HistoryCmd, path: &PathBuf) -> anyhow::Result<()> {
    match command {
        HistoryCmd::Seek { id, json } => {
            let mut store = HistoryStore::open(path, false).context("opening history")?;
            match store.seek(&id) {
                None => anyhow::bail!("not found: {id}"),
                Some(HistoryStatus::Valid) => {
                    let mut locations = Vec::new();
                    while let Some(loc) = store.next_location() {
                        locations.push(loc.to_string());
                    }
                    if json {
                        println!("{}", json!({"id": id, "status": "valid", "locations": locations}));
                    } else {
                        println!("{id}: {}", locations.join(" "));
                    }
                }
                Some(status) => {
                    if json {
                        println!("{}", json!({"id": id, "status": format!("{status:?}")}));
                    } else {
                        println!("{id}: {status:?}");
                    }
                }
            }
        }
        HistoryCmd::Sweep { json } => {
            let mut store = HistoryStore::open(path, false).context("opening history")?;
            store.rewind();
            while let Some(entry) = store.next_entry() {
                if json {
                    println!(
                        "{}",
                        json!({
                            "id": entry.id,
                            "received": entry.received,
                            "expires": entry.expires,
                            "status": format!("{:?}", entry.status()),
                        })
                    );
                } else {
                    println!("{entry}");
                }
            }
        }
        HistoryCmd::Expire => {
            let mut store = HistoryStore::open(path, true).context("opening history")?;
            let now = chrono::Utc::now().timestamp();
            let dropped = store.drop_expired(now);
            store.commit()?;
            println!("dropped {dropped} entries");
        }
    }
    Ok(())
}

fn cmd_newsrc(json: bool, active_path: &PathBuf, config: &config::Config) -> anyhow::Result<()> {
    let mut table = ActiveTable::open(active_path).context("opening active file")?;
    if let Some(admin) = &config.paths.admin {
        table.apply_admin_overlay(admin)?;
    }

    let rc_path = config.newsrc_path();
    let rc = match Newsrc::read(&rc_path, &mut table)? {
        Some(rc) => rc,
        None => Newsrc::generate_default(&rc_path, &mut table, &config.subscribe.default_groups)?,
    };

    if json {
        for (_, grp) in table.iter() {
            if grp.sub.is_subscribed() && !grp.flags.removed {
                println!("{}", json!({"group": grp.name, "unread": grp.unread}));
            }
        }
    } else {
        println!("{} group(s) with unread news", rc.waiting(&table));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_walk(
    thread: bool,
    reread: bool,
    reverse: bool,
    limit: Option<usize>,
    commit: bool,
    active_path: &PathBuf,
    history_path: &PathBuf,
    config: &config::Config,
) -> anyhow::Result<()> {
    let mut table = ActiveTable::open(active_path).context("opening active file")?;
    if let Some(admin) = &config.paths.admin {
        table.apply_admin_overlay(admin)?;
    }
    table.debug_dump();

    let rc_path = config.newsrc_path();
    let rc = match Newsrc::read(&rc_path, &mut table)? {
        Some(rc) => rc,
        None => Newsrc::generate_default(&rc_path, &mut table, &config.subscribe.default_groups)?,
    };

    let history = HistoryStore::open(history_path, true).context("opening history")?;
    let spool = SpoolStore::open(&config.paths.spool_dir, config.performance.article_cache_size);

    let opts = SessionOptions {
        thread,
        reread,
        reverse,
        user: whoami(),
        quiet: config.feedback.quiet.clone(),
    };
    let mut session = Session::new(table, history, spool, opts);
    session.set_muted(rc.ignored_ids().map(str::to_string));

    let mut visited = 0usize;
    while let Some(place) = session.advance(MoveCmd::Next)? {
        let grp = session.table().group(place.group);
        println!("{}/{}", grp.name, place.article);
        visited += 1;
        if limit.is_some_and(|n| visited >= n) {
            break;
        }
    }

    let (table, _) = session.finish(config.feedback.log.as_deref())?;
    if commit {
        rc.write(&table)?;
    }
    eprintln!("{visited} article(s)");
    Ok(())
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "news".to_string())
}
