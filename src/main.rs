mod core;
mod plugins;

use crate::core::hub::{Hub, HubHandle, Subscription, DEFAULT_KEEPALIVE, DEFAULT_SUBSCRIBER_BUFFER};
use crate::core::ingest::{BackoffPolicy, IngestConfig, WebhookIngestor};
use crate::core::model::{Category, EventKind, JobId, SubscriptionEntry};
use crate::core::orchestrator::Orchestrator;
use crate::core::progress::{fmt_bytes, DEFAULT_PROGRESS_INTERVAL};
use crate::core::queue::DownloadQueue;
use crate::core::store::SqliteStore;
use crate::core::webhook::WebhookHandler;
use crate::core::worker::{DownloadWorker, WorkerContext, DEFAULT_STALL_TIMEOUT};
use crate::plugins::api::routes::{self, ApiState};
use crate::plugins::plex::catalog::PlexClient;
use crate::plugins::registry::{PluginRegistry, ServiceConfig, SubscriptionStore};
use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn db_arg() -> Arg {
    Arg::new("db")
        .long("db")
        .env("PLEX_LOCAL_DL_DB")
        .help("SQLite file holding subscriptions and queued webhooks")
        .default_value("./data/plex-local-dl.sqlite")
        .value_parser(value_parser!(PathBuf))
        .num_args(1)
}

fn transfer_args(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("dest_root")
            .long("dest-root")
            .env("DEST_ROOT")
            .help("Local directory downloads are written under")
            .default_value("/data/local")
            .value_parser(value_parser!(PathBuf))
            .num_args(1),
    )
    .arg(
        Arg::new("workers")
            .long("workers")
            .help("Concurrent downloads")
            .default_value("1")
            .value_parser(value_parser!(usize))
            .num_args(1),
    )
    .arg(
        Arg::new("progress_interval_ms")
            .long("progress-interval-ms")
            .help("Minimum gap between progress updates of one download")
            .default_value(DEFAULT_PROGRESS_INTERVAL.as_millis().to_string())
            .value_parser(value_parser!(u64))
            .num_args(1),
    )
    .arg(
        Arg::new("stall_timeout_secs")
            .long("stall-timeout-secs")
            .help("Abandon a download when no data arrives for this long")
            .default_value(DEFAULT_STALL_TIMEOUT.as_secs().to_string())
            .value_parser(value_parser!(u64))
            .num_args(1),
    )
}

fn worker_context(m: &ArgMatches, plex: &Arc<PlexClient>, hub: &HubHandle) -> anyhow::Result<WorkerContext> {
    Ok(WorkerContext {
        source: plex.clone(),
        catalog: plex.clone(),
        hub: hub.clone(),
        progress_interval: Duration::from_millis(arg(m, "progress_interval_ms")?),
        stall_timeout: Duration::from_secs(arg(m, "stall_timeout_secs")?),
    })
}

fn build_cli(registry: &PluginRegistry) -> Command {
    let serve = transfer_args(Command::new("serve").about("Run the API, the download workers and the webhook loop"))
        .arg(db_arg())
        .arg(
            Arg::new("keepalive_secs")
                .long("keepalive-secs")
                .help("Ping period for status subscribers")
                .default_value(DEFAULT_KEEPALIVE.as_secs().to_string())
                .value_parser(value_parser!(u64))
                .num_args(1),
        )
        .arg(
            Arg::new("subscriber_buffer")
                .long("subscriber-buffer")
                .help("Events buffered per status subscriber before it is dropped")
                .default_value(DEFAULT_SUBSCRIBER_BUFFER.to_string())
                .value_parser(value_parser!(usize))
                .num_args(1),
        )
        .arg(
            Arg::new("no_webhooks")
                .long("no-webhooks")
                .help("Do not consume the webhook queue")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("webhook_batch")
                .long("webhook-batch")
                .help("Messages taken per poll")
                .default_value("5")
                .value_parser(value_parser!(usize))
                .num_args(1),
        )
        .arg(
            Arg::new("webhook_visibility_secs")
                .long("webhook-visibility-secs")
                .help("How long a polled message stays hidden")
                .default_value("30")
                .value_parser(value_parser!(u64))
                .num_args(1),
        )
        .arg(
            Arg::new("webhook_idle_secs")
                .long("webhook-idle-secs")
                .help("Pause after a poll that returned nothing")
                .default_value("5")
                .value_parser(value_parser!(u64))
                .num_args(1),
        )
        .arg(
            Arg::new("backoff_short_secs")
                .long("backoff-short-secs")
                .help("Pause after each of the first four failed polls")
                .default_value("120")
                .value_parser(value_parser!(u64))
                .num_args(1),
        )
        .arg(
            Arg::new("backoff_long_secs")
                .long("backoff-long-secs")
                .help("Pause after every later failed poll")
                .default_value("1800")
                .value_parser(value_parser!(u64))
                .num_args(1),
        );
    let serve = registry.augment_command("serve", serve);

    let download = transfer_args(Command::new("download").about("Download media by Plex key and exit")).arg(
        Arg::new("media_keys")
            .help("Plex rating keys (movie, episode, season or show)")
            .action(ArgAction::Append)
            .num_args(1..)
            .required(true),
    );
    let download = registry.augment_command("download", download);

    let category = || {
        Arg::new("category")
            .help("movie or series")
            .required(true)
            .num_args(1)
    };
    let external_id = || {
        Arg::new("external_id")
            .help("IMDb id for movies, TVDB id for series")
            .required(true)
            .num_args(1)
    };
    let subscriptions = Command::new("subscriptions")
        .about("Manage auto-download subscriptions")
        .subcommand_required(true)
        .arg(db_arg())
        .subcommand(Command::new("list").about("List subscriptions"))
        .subcommand(
            Command::new("add")
                .about("Subscribe to a movie or series")
                .arg(category())
                .arg(external_id())
                .arg(Arg::new("media_key").help("Plex rating key").required(true).num_args(1))
                .arg(Arg::new("title").long("title").default_value("").num_args(1)),
        )
        .subcommand(
            Command::new("remove")
                .about("Remove a subscription")
                .arg(category())
                .arg(external_id()),
        );

    Command::new("plex-local-dl")
        .about("Mirror media from a Plex server to local storage")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(serve)
        .subcommand(download)
        .subcommand(subscriptions)
}

fn arg<T: Clone + Send + Sync + 'static>(m: &ArgMatches, id: &str) -> anyhow::Result<T> {
    m.get_one::<T>(id)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("missing argument {}", id))
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let registry = PluginRegistry::with_defaults();
    let matches = build_cli(&registry).get_matches();

    match matches.subcommand() {
        Some(("serve", m)) => {
            init_tracing("info");
            serve(&registry, m).await
        }
        Some(("download", m)) => {
            // bars own the terminal, keep logs to warnings unless asked
            init_tracing("warn");
            download(&registry, m).await
        }
        Some(("subscriptions", m)) => {
            init_tracing("warn");
            subscriptions(m).await
        }
        _ => Ok(()),
    }
}

async fn serve(registry: &PluginRegistry, m: &ArgMatches) -> anyhow::Result<()> {
    let mut cfg = ServiceConfig::default();
    registry.apply_matches("serve", m, &mut cfg)?;

    let dest_root: PathBuf = arg(m, "dest_root")?;
    let db: PathBuf = arg(m, "db")?;
    let workers: usize = arg(m, "workers")?;
    let ingest = IngestConfig {
        batch: arg(m, "webhook_batch")?,
        visibility: Duration::from_secs(arg(m, "webhook_visibility_secs")?),
        idle: Duration::from_secs(arg(m, "webhook_idle_secs")?),
        backoff: BackoffPolicy {
            short: Duration::from_secs(arg(m, "backoff_short_secs")?),
            long: Duration::from_secs(arg(m, "backoff_long_secs")?),
            ..BackoffPolicy::default()
        },
    };

    tokio::fs::create_dir_all(&dest_root)
        .await
        .with_context(|| format!("create dest root {}", dest_root.display()))?;
    let store = SqliteStore::open(&db).await?;
    let plex = Arc::new(PlexClient::new(cfg.plex.clone())?);

    let hub = Hub::spawn(
        arg(m, "subscriber_buffer")?,
        Duration::from_secs(arg(m, "keepalive_secs")?),
    );
    let (queue, jobs) = DownloadQueue::new();
    DownloadWorker::spawn_pool(worker_context(m, &plex, &hub)?, jobs.into_pool(workers));

    let orchestrator = Orchestrator::new(queue, hub, plex, dest_root.clone());

    if m.get_flag("no_webhooks") {
        info!("webhook ingestion disabled");
    } else {
        let handler = WebhookHandler::new(Arc::new(store.clone()), orchestrator.clone());
        tokio::spawn(WebhookIngestor::new(Arc::new(store.clone()), handler, ingest).run());
    }

    info!(
        plex = %cfg.plex.url,
        dest = %dest_root.display(),
        db = %db.display(),
        workers,
        "plex-local-dl started"
    );
    routes::serve(&cfg.listen, ApiState { orchestrator, store }, shutdown_signal()).await?;
    info!("shut down, queued and in-flight downloads were dropped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn download(registry: &PluginRegistry, m: &ArgMatches) -> anyhow::Result<()> {
    let mut cfg = ServiceConfig::default();
    registry.apply_matches("download", m, &mut cfg)?;

    let dest_root: PathBuf = arg(m, "dest_root")?;
    let workers: usize = arg(m, "workers")?;
    let keys: Vec<String> = m
        .get_many::<String>("media_keys")
        .map(|v| v.cloned().collect())
        .unwrap_or_default();

    tokio::fs::create_dir_all(&dest_root)
        .await
        .with_context(|| format!("create dest root {}", dest_root.display()))?;
    let plex = Arc::new(PlexClient::new(cfg.plex)?);

    // one local subscriber that never lags far behind
    let hub = Hub::spawn(4096, DEFAULT_KEEPALIVE);
    let sub = hub.subscribe();

    let (queue, jobs) = DownloadQueue::new();
    DownloadWorker::spawn_pool(worker_context(m, &plex, &hub)?, jobs.into_pool(workers));
    let orchestrator = Orchestrator::new(queue, hub, plex, dest_root);

    let mut ids = Vec::new();
    for key in &keys {
        ids.extend(orchestrator.enqueue_media(key).await?);
    }
    if ids.is_empty() {
        println!("Nothing to download.");
        return Ok(());
    }

    let total = ids.len();
    let failed = render_progress(sub, ids.into_iter().collect()).await?;
    if failed > 0 {
        anyhow::bail!("{} of {} downloads failed", failed, total);
    }
    println!("Downloaded {} file(s).", total);
    Ok(())
}

struct JobView {
    title: String,
    status: &'static str,
    downloaded: u64,
    total: u64,
    error: Option<String>,
}

/// Draws one bar per job until every job in `pending` is terminal. Returns the failure count.
async fn render_progress(mut sub: Subscription, mut pending: HashSet<JobId>) -> anyhow::Result<usize> {
    let mp = MultiProgress::new();
    let sty_spin = ProgressStyle::with_template("{spinner:.green} {prefix} {wide_msg}")?.tick_chars("|/-\\ ");
    let sty_bar =
        ProgressStyle::with_template("{prefix} {bar:40.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec}, eta {eta}) {wide_msg}")?;

    let mut bars: HashMap<JobId, ProgressBar> = HashMap::new();
    let mut views: HashMap<JobId, JobView> = HashMap::new();
    let mut order: Vec<JobId> = Vec::new();
    let mut failed = 0;

    while !pending.is_empty() {
        let Some(evt) = sub.recv().await else {
            anyhow::bail!("progress stream closed with {} download(s) unfinished", pending.len());
        };
        let Some(id) = evt.job_id else { continue };
        if !pending.contains(&id) {
            continue;
        }
        let terminal = evt.kind.is_terminal();

        match evt.kind {
            EventKind::Start => {
                let pb = mp.add(ProgressBar::new(evt.total_bytes));
                if evt.total_bytes > 0 {
                    pb.set_style(sty_bar.clone());
                } else {
                    pb.set_style(sty_spin.clone());
                    pb.enable_steady_tick(Duration::from_millis(120));
                }
                pb.set_prefix(format!("[{}]", evt.title));
                pb.set_message("queued");
                bars.insert(id, pb);
                order.push(id);
                views.insert(
                    id,
                    JobView { title: evt.title, status: "queued", downloaded: 0, total: evt.total_bytes, error: None },
                );
            }
            EventKind::Update => {
                if let Some(pb) = bars.get(&id) {
                    pb.set_position(evt.bytes_downloaded);
                    if evt.total_bytes == 0 {
                        pb.set_message(fmt_bytes(evt.bytes_downloaded));
                    } else {
                        pb.set_message("");
                    }
                }
                if let Some(v) = views.get_mut(&id) {
                    v.status = "downloading";
                    v.downloaded = evt.bytes_downloaded;
                }
            }
            EventKind::Complete => {
                if let Some(pb) = bars.get(&id) {
                    pb.set_position(evt.bytes_downloaded);
                    pb.finish_with_message("done");
                }
                if let Some(v) = views.get_mut(&id) {
                    v.status = "done";
                    v.downloaded = evt.bytes_downloaded;
                    v.total = evt.total_bytes;
                }
            }
            EventKind::Failed => {
                let msg = evt.message.unwrap_or_else(|| "unknown error".to_string());
                if let Some(pb) = bars.get(&id) {
                    pb.abandon_with_message(format!("failed: {}", msg));
                }
                if let Some(v) = views.get_mut(&id) {
                    v.status = "failed";
                    v.error = Some(msg);
                }
                failed += 1;
            }
            EventKind::Ping => {}
        }
        if terminal {
            pending.remove(&id);
        }
    }

    let _ = mp.println("");
    let _ = mp.println("Summary:");
    for id in &order {
        if let Some(v) = views.get(id) {
            let _ = mp.println(format!(
                "- {} status={} {} / {}",
                v.title,
                v.status,
                fmt_bytes(v.downloaded),
                fmt_bytes(v.total)
            ));
            if let Some(e) = &v.error {
                let _ = mp.println(format!("  error: {}", e));
            }
        }
    }
    Ok(failed)
}

async fn subscriptions(m: &ArgMatches) -> anyhow::Result<()> {
    let db: PathBuf = arg(m, "db")?;
    let store = SqliteStore::open(&db).await?;

    match m.subcommand() {
        Some(("list", _)) => {
            for e in store.list().await? {
                println!("{}\t{}\t{}\t{}", e.category, e.external_id, e.media_key, e.title);
            }
        }
        Some(("add", sm)) => {
            let entry = SubscriptionEntry {
                category: arg::<String>(sm, "category")?.parse()?,
                external_id: arg(sm, "external_id")?,
                media_key: arg(sm, "media_key")?,
                title: arg(sm, "title")?,
            };
            store.add(&entry).await?;
            println!("Subscribed {} {} -> media {}", entry.category, entry.external_id, entry.media_key);
        }
        Some(("remove", sm)) => {
            let category: Category = arg::<String>(sm, "category")?.parse()?;
            let external_id: String = arg(sm, "external_id")?;
            store.remove(category, &external_id).await?;
            println!("Removed {} {}", category, external_id);
        }
        _ => {}
    }
    Ok(())
}
