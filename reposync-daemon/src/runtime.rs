use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use reposync_core::{config, RepositoryDescriptor, SyncConfig};
use reposync_engine::{EngineConfig, GitBackend, ProcessRunner, SyncCoordinator};

use crate::error::{io_err, DaemonError};
use crate::lock;
use crate::notifier::{self, Notifier};
use crate::paths::{config_path, logs_dir, reposync_root, socket_path, DEBOUNCE_WINDOW};
use crate::protocol::{
    BatchReport, DaemonRequest, DaemonResponse, DaemonStatus, RepositoryState, SyncReport,
};
use crate::status_store;

/// Last successfully loaded config; a bad edit keeps the previous one.
pub type ConfigCache = Arc<RwLock<SyncConfig>>;

struct SyncJob {
    /// Empty means every configured repository.
    repos: Vec<String>,
    source: &'static str,
    respond_to: oneshot::Sender<Result<SyncReport, String>>,
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    ensure_runtime_dirs(home)?;
    init_tracing(home);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run the daemon runtime: scheduler, sync processor, config watcher,
/// control socket, log rotation, and signal handling.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;

    let initial = {
        let home = home.clone();
        tokio::task::spawn_blocking(move || config::load_at(&home))
            .await
            .map_err(|err| DaemonError::Protocol(format!("config load join error: {err}")))??
    };
    tracing::info!(
        repositories = initial.repositories.len(),
        interval_secs = initial.sync_interval_secs,
        max_concurrency = initial.max_concurrency,
        "starting reposync daemon",
    );
    notify_blocking(
        notifier::from_config(&initial),
        vec![notifier::startup_message(initial.repositories.len())],
    )
    .await;

    let cache: ConfigCache = Arc::new(RwLock::new(initial));
    let started_at = Utc::now();
    let cancel = CancellationToken::new();

    let (sync_tx, sync_rx) = mpsc::channel::<SyncJob>(64);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let scheduler_handle = {
        let shutdown = shutdown_tx.clone();
        let cache = cache.clone();
        let sync_tx = sync_tx.clone();
        tokio::spawn(async move {
            let result = scheduler_task(cache, sync_tx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let processor_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let cache = cache.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let result =
                sync_processor_task(home, cache, sync_rx, cancel, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let watcher_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let cache = cache.clone();
        tokio::spawn(async move {
            let result = config_watcher_task(home, cache, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let cache = cache.clone();
        let sync_tx = sync_tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let result = socket_server_task(
                home,
                cache,
                sync_tx,
                cancel,
                shutdown.clone(),
                shutdown.subscribe(),
                started_at,
            )
            .await;
            let _ = shutdown.send(());
            result
        })
    };

    let rotation_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        tokio::spawn(async move {
            let result = log_rotation_task(home, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                received = shutdown_signal() => match received {
                    Ok(name) => {
                        tracing::info!(signal = name, "shutting down daemon");
                        begin_shutdown(&shutdown, &cancel);
                        Ok(())
                    }
                    Err(err) => Err(err),
                },
            }
        })
    };

    drop(sync_tx);

    let (
        scheduler_result,
        processor_result,
        watcher_result,
        socket_result,
        rotation_result,
        signal_result,
    ) = tokio::join!(
        scheduler_handle,
        processor_handle,
        watcher_handle,
        socket_handle,
        rotation_handle,
        signal_handle
    );

    let final_config = cache.read().await.clone();
    notify_blocking(
        notifier::from_config(&final_config),
        vec![notifier::shutdown_message()],
    )
    .await;
    tracing::info!("reposync daemon stopped");

    handle_join("scheduler", scheduler_result)?;
    handle_join("sync_processor", processor_result)?;
    handle_join("config_watcher", watcher_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("log_rotation", rotation_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

fn begin_shutdown(shutdown: &broadcast::Sender<()>, cancel: &CancellationToken) {
    cancel.cancel();
    let _ = shutdown.send(());
}

/// Resolves with the name of the first of SIGINT or SIGTERM to arrive.
#[cfg(unix)]
async fn shutdown_signal() -> Result<&'static str, DaemonError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).map_err(|e| io_err("SIGTERM handler", e))?;
    tokio::select! {
        received = tokio::signal::ctrl_c() => {
            received.map_err(|e| io_err("SIGINT handler", e))?;
            Ok("SIGINT")
        }
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<&'static str, DaemonError> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| io_err("ctrl-c handler", e))?;
    Ok("ctrl-c")
}

// ─── Scheduler + sync processor ───────────────────────────────────────────────

/// Enqueue a full batch, wait for it, then sleep `sync_interval` (re-read
/// from the cache every round, so reloads take effect on the next tick).
async fn scheduler_task(
    cache: ConfigCache,
    sync_tx: mpsc::Sender<SyncJob>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            outcome = enqueue_sync(&sync_tx, Vec::new(), "schedule") => match outcome {
                Ok(report) => tracing::debug!(
                    status = ?report.batch.overall_status,
                    "scheduled sync completed",
                ),
                Err(DaemonError::ChannelClosed(_)) => break,
                Err(err) => tracing::error!(error = %err, "scheduled sync failed"),
            },
        }

        let interval = cache.read().await.sync_interval();
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    Ok(())
}

/// Single consumer of the job queue, so batches never overlap.
async fn sync_processor_task(
    home: PathBuf,
    cache: ConfigCache,
    mut sync_rx: mpsc::Receiver<SyncJob>,
    cancel: CancellationToken,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            maybe_job = sync_rx.recv() => {
                let Some(job) = maybe_job else { break };
                let config = cache.read().await.clone();
                let notifier = notifier::from_config(&config);

                let outcome = run_batch(
                    &home,
                    &config,
                    &job.repos,
                    job.source,
                    &cancel,
                    notifier,
                )
                .await
                .map_err(|err| err.to_string());

                let _ = job.respond_to.send(outcome);
            }
        }
    }
    Ok(())
}

/// One batch end to end: select repositories, sync under the batch lock,
/// record status, notify.
async fn run_batch(
    home: &Path,
    config: &SyncConfig,
    names: &[String],
    source: &'static str,
    cancel: &CancellationToken,
    notifier: Arc<dyn Notifier>,
) -> Result<SyncReport, DaemonError> {
    let repos = select_repositories(config, names)?;
    let coordinator = SyncCoordinator::new(
        EngineConfig::from(config),
        Arc::new(ProcessRunner::new().with_env("GIT_TERMINAL_PROMPT", "0")),
        Arc::new(GitBackend::new()),
    );

    let batch_lock = {
        let home = home.to_path_buf();
        tokio::task::spawn_blocking(move || lock::lock_sync(&home))
            .await
            .map_err(|err| DaemonError::Protocol(format!("sync lock join error: {err}")))??
    };
    tracing::info!(source, repositories = repos.len(), "sync batch starting");
    let batch = coordinator.sync_all_with_cancel(&repos, cancel).await;
    drop(batch_lock);

    let messages = notifier::batch_messages(&batch);
    let report = BatchReport::from(&batch);
    let recorded = {
        let home = home.to_path_buf();
        tokio::task::spawn_blocking(move || status_store::record_at(&home, &batch).map(|_| ()))
            .await
            .map_err(|err| DaemonError::Protocol(format!("status store join error: {err}")))?
    };
    if let Err(err) = recorded {
        tracing::warn!(error = %err, "failed to record sync status");
    }
    notify_blocking(notifier, messages).await;

    Ok(SyncReport {
        source: source.to_string(),
        repos: names.to_vec(),
        batch: report,
    })
}

/// Every configured repository, or the named ones in the order given.
fn select_repositories(
    config: &SyncConfig,
    names: &[String],
) -> Result<Vec<RepositoryDescriptor>, DaemonError> {
    if names.is_empty() {
        return Ok(config.repositories.clone());
    }
    names
        .iter()
        .map(|name| {
            config
                .repositories
                .iter()
                .find(|descriptor| descriptor.name.0 == *name)
                .cloned()
                .ok_or_else(|| DaemonError::Protocol(format!("unknown repository '{name}'")))
        })
        .collect()
}

async fn enqueue_sync(
    sync_tx: &mpsc::Sender<SyncJob>,
    repos: Vec<String>,
    source: &'static str,
) -> Result<SyncReport, DaemonError> {
    let (tx, rx) = oneshot::channel();
    sync_tx
        .send(SyncJob {
            repos,
            source,
            respond_to: tx,
        })
        .await
        .map_err(|_| DaemonError::ChannelClosed("sync queue"))?;

    let outcome = rx
        .await
        .map_err(|_| DaemonError::ChannelClosed("sync response"))?;
    outcome.map_err(DaemonError::Protocol)
}

async fn notify_blocking(notifier: Arc<dyn Notifier>, messages: Vec<String>) {
    if messages.is_empty() {
        return;
    }
    let joined = tokio::task::spawn_blocking(move || {
        notifier::deliver(notifier.as_ref(), &messages);
    })
    .await;
    if let Err(err) = joined {
        tracing::warn!(error = %err, "notification task join failure");
    }
}

// ─── Config hot reload ────────────────────────────────────────────────────────

async fn config_watcher_task(
    home: PathBuf,
    cache: ConfigCache,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let root = reposync_root(&home);
    if !root.exists() {
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
    }
    // Events arrive with canonical paths (e.g. /private/var on macOS).
    let root = fs::canonicalize(&root).unwrap_or(root);
    let config_file = root.join(
        config_path(&home)
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("config.yaml")),
    );

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;
    // Editors replace the file on save, so watch the directory.
    watcher.watch(&root, RecursiveMode::NonRecursive)?;
    tracing::debug!(path = %root.display(), "watching config directory");

    let mut debounce = HashMap::<PathBuf, Instant>::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }
                if !event.paths.iter().any(|path| path == &config_file) {
                    continue;
                }
                if !should_process_event(&mut debounce, &config_file, Instant::now()) {
                    continue;
                }
                // Let the writer finish before reading.
                tokio::time::sleep(DEBOUNCE_WINDOW).await;
                reload_config(&home, &cache).await;
            }
        }
    }

    Ok(())
}

async fn reload_config(home: &Path, cache: &ConfigCache) {
    let home = home.to_path_buf();
    let loaded = tokio::task::spawn_blocking(move || config::load_at(&home)).await;
    match loaded {
        Ok(Ok(config)) => {
            tracing::info!(
                repositories = config.repositories.len(),
                interval_secs = config.sync_interval_secs,
                "config reloaded",
            );
            *cache.write().await = config;
        }
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "config reload rejected; keeping previous config")
        }
        Err(err) => tracing::error!(error = %err, "config reload join failure"),
    }
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_))
}

fn should_process_event(
    debounce: &mut HashMap<PathBuf, Instant>,
    path: &Path,
    now: Instant,
) -> bool {
    should_process_event_with_threshold(debounce, path, now, DEBOUNCE_WINDOW)
}

fn should_process_event_with_threshold(
    debounce: &mut HashMap<PathBuf, Instant>,
    path: &Path,
    now: Instant,
    threshold: Duration,
) -> bool {
    debounce.retain(|_, seen_at| now.duration_since(*seen_at) <= Duration::from_secs(30));
    match debounce.get(path) {
        Some(last_seen) if now.duration_since(*last_seen) < threshold => false,
        _ => {
            debounce.insert(path.to_path_buf(), now);
            true
        }
    }
}

// ─── Control socket ───────────────────────────────────────────────────────────

async fn socket_server_task(
    home: PathBuf,
    cache: ConfigCache,
    sync_tx: mpsc::Sender<SyncJob>,
    cancel: CancellationToken,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
    started_at: DateTime<Utc>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let client = SocketClient {
                    home: home.clone(),
                    cache: cache.clone(),
                    sync_tx: sync_tx.clone(),
                    cancel: cancel.clone(),
                    shutdown_tx: shutdown_tx.clone(),
                    started_at,
                };
                tokio::spawn(async move {
                    if let Err(err) = client.serve(stream).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

struct SocketClient {
    home: PathBuf,
    cache: ConfigCache,
    sync_tx: mpsc::Sender<SyncJob>,
    cancel: CancellationToken,
    shutdown_tx: broadcast::Sender<()>,
    started_at: DateTime<Utc>,
}

impl SocketClient {
    async fn serve(self, stream: UnixStream) -> Result<(), DaemonError> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| io_err("daemon socket read", e))?
        {
            if line.trim().is_empty() {
                continue;
            }

            let request = match serde_json::from_str::<DaemonRequest>(&line) {
                Ok(request) => request,
                Err(err) => {
                    write_response(
                        &mut writer,
                        &DaemonResponse::error(format!("invalid request: {err}")),
                    )
                    .await?;
                    continue;
                }
            };

            let stop = request == DaemonRequest::Stop;
            let response = self.handle(request).await;
            write_response(&mut writer, &response).await?;
            if stop {
                break;
            }
        }
        Ok(())
    }

    async fn handle(&self, request: DaemonRequest) -> DaemonResponse {
        match request {
            DaemonRequest::Status => {
                let config = self.cache.read().await.clone();
                let history = load_status_snapshot(&self.home).await;
                DaemonResponse::Status(build_status(
                    &self.home,
                    &config,
                    history,
                    self.started_at,
                ))
            }
            DaemonRequest::Sync { repos } => {
                match enqueue_sync(&self.sync_tx, repos, "socket").await {
                    Ok(report) => DaemonResponse::Synced(report),
                    Err(err) => DaemonResponse::error(err.to_string()),
                }
            }
            DaemonRequest::Stop => {
                tracing::info!("stop requested over control socket");
                begin_shutdown(&self.shutdown_tx, &self.cancel);
                DaemonResponse::Stopping
            }
        }
    }
}

async fn load_status_snapshot(home: &Path) -> status_store::StatusFile {
    let home = home.to_path_buf();
    match tokio::task::spawn_blocking(move || status_store::load_at(&home)).await {
        Ok(Ok(status)) => status,
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "failed to read status store");
            status_store::StatusFile::default()
        }
        Err(err) => {
            tracing::warn!(error = %err, "status store join failure");
            status_store::StatusFile::default()
        }
    }
}

fn build_status(
    home: &Path,
    config: &SyncConfig,
    mut history: status_store::StatusFile,
    started_at: DateTime<Utc>,
) -> DaemonStatus {
    let repositories = config
        .repositories
        .iter()
        .map(|repo| RepositoryState {
            name: repo.name.clone(),
            local_path: repo.local_path.clone(),
            history: history.repositories.remove(&repo.name).unwrap_or_default(),
        })
        .collect();

    DaemonStatus {
        pid: std::process::id(),
        started_at,
        sync_interval_secs: config.sync_interval_secs,
        max_concurrency: config.max_concurrency,
        config: config_path(home),
        last_batch: history.last_batch,
        repositories,
    }
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

// ─── Housekeeping ─────────────────────────────────────────────────────────────

async fn log_rotation_task(
    home: PathBuf,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let home = home.clone();
                // Failures are logged inside rotate_logs.
                tokio::task::spawn_blocking(move || {
                    crate::log_rotation::rotate_logs(&home);
                })
                .await
                .ok();
            }
        }
    }
    Ok(())
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    for dir in [reposync_root(home), logs_dir(home)] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

/// Console output plus `daemon.log`; warnings and errors also go to
/// `daemon-err.log`.
fn init_tracing(home: &Path) {
    use tracing_subscriber::fmt::writer::MakeWriterExt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    use crate::log_rotation::AppendLogWriter;
    use crate::paths::{stderr_log_path, stdout_log_path};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer().with_target(false);
    let file = fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_writer(
            AppendLogWriter::new(stdout_log_path(home)).and(
                AppendLogWriter::new(stderr_log_path(home)).with_max_level(tracing::Level::WARN),
            ),
        );
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use reposync_core::{RepoName, RepositoryDescriptor};
    use reposync_engine::BatchStatus;
    use tempfile::TempDir;
    use tokio::time::advance;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<String>>,
    }

    impl Notifier for RecordingNotifier {
        fn send(&self, message: &str) -> Result<(), DaemonError> {
            self.sent.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    fn config_with_missing_repos(root: &Path, names: &[&str]) -> SyncConfig {
        SyncConfig {
            repositories: names
                .iter()
                .map(|name| RepositoryDescriptor::new(*name, "", root.join(name)))
                .collect(),
            ..SyncConfig::default()
        }
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn debounce_coalesces_rapid_events() {
        let threshold = Duration::from_millis(100);
        let mut debounce = HashMap::<PathBuf, Instant>::new();
        let path = PathBuf::from("/tmp/config.yaml");
        let mut reloads = 0usize;

        for _ in 0..5 {
            if should_process_event_with_threshold(&mut debounce, &path, Instant::now(), threshold)
            {
                reloads += 1;
            }
            advance(Duration::from_millis(10)).await;
        }
        assert_eq!(reloads, 1, "rapid saves should collapse to one reload");

        advance(Duration::from_millis(150)).await;
        assert!(should_process_event_with_threshold(
            &mut debounce,
            &path,
            Instant::now(),
            threshold
        ));
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn select_repositories_filters_by_name() {
        let config = config_with_missing_repos(Path::new("/srv"), &["api", "web", "docs"]);
        assert_eq!(select_repositories(&config, &[]).unwrap().len(), 3);

        let picked = select_repositories(&config, &names(&["docs", "api"])).unwrap();
        let picked: Vec<_> = picked.iter().map(|repo| repo.name.0.as_str()).collect();
        assert_eq!(picked, ["docs", "api"]);

        assert!(matches!(
            select_repositories(&config, &names(&["web", "nope"])),
            Err(DaemonError::Protocol(msg)) if msg.contains("'nope'")
        ));
    }

    #[tokio::test]
    async fn batch_records_status_and_notifies_failures() {
        let home = TempDir::new().unwrap();
        let config = config_with_missing_repos(home.path(), &["api", "web"]);
        let notifier = Arc::new(RecordingNotifier::default());

        let report = run_batch(
            home.path(),
            &config,
            &[],
            "test",
            &CancellationToken::new(),
            notifier.clone(),
        )
        .await
        .unwrap();

        assert_eq!(report.source, "test");
        assert!(report.repos.is_empty());
        assert_eq!(report.batch.overall_status, BatchStatus::Failure);
        assert_eq!(report.batch.errors[&RepoName::from("api")].kind, "path_not_found");

        let status = status_store::load_at(home.path()).unwrap();
        assert_eq!(status.repositories[&RepoName::from("web")].failed_syncs, 1);

        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("Sync failures:"));
        assert!(sent[0].contains("api: path_not_found:"));
    }

    #[tokio::test]
    async fn empty_batch_sends_nothing() {
        let home = TempDir::new().unwrap();
        let notifier = Arc::new(RecordingNotifier::default());

        let report = run_batch(
            home.path(),
            &SyncConfig::default(),
            &[],
            "test",
            &CancellationToken::new(),
            notifier.clone(),
        )
        .await
        .unwrap();

        assert_eq!(report.batch.overall_status, BatchStatus::Success);
        assert!(notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_waits_for_a_foreground_sync_to_release_the_lock() {
        let home = TempDir::new().unwrap();
        let config = config_with_missing_repos(home.path(), &["api"]);
        let held = lock::lock_sync(home.path()).unwrap();

        let batch = {
            let home = home.path().to_path_buf();
            tokio::spawn(async move {
                run_batch(
                    &home,
                    &config,
                    &[],
                    "test",
                    &CancellationToken::new(),
                    Arc::new(RecordingNotifier::default()),
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!batch.is_finished());
        assert!(!crate::paths::status_path(home.path()).exists());

        drop(held);
        let report = batch.await.unwrap().unwrap();
        assert_eq!(report.batch.errors.len(), 1);
    }

    #[tokio::test]
    async fn status_merges_config_and_history() {
        let home = TempDir::new().unwrap();
        let config = config_with_missing_repos(home.path(), &["api", "web"]);
        run_batch(
            home.path(),
            &config,
            &names(&["api"]),
            "test",
            &CancellationToken::new(),
            Arc::new(RecordingNotifier::default()),
        )
        .await
        .unwrap();

        let history = load_status_snapshot(home.path()).await;
        let status = build_status(home.path(), &config, history, Utc::now());

        assert_eq!(status.pid, std::process::id());
        assert_eq!(
            status.last_batch.as_ref().map(|batch| batch.status),
            Some(BatchStatus::Failure)
        );
        assert_eq!(status.repositories.len(), 2);
        let api = &status.repositories[0];
        assert_eq!(api.name, RepoName::from("api"));
        assert_eq!(api.history.failed_syncs, 1);
        assert_eq!(api.history.errors[0].kind, "path_not_found");
        assert_eq!(status.repositories[1].history.total_syncs, 0);
    }

    #[tokio::test]
    async fn reload_keeps_previous_config_on_invalid_file() {
        let home = TempDir::new().unwrap();
        let good = config_with_missing_repos(home.path(), &["api"]);
        config::save_at(home.path(), &good).unwrap();
        let cache: ConfigCache = Arc::new(RwLock::new(SyncConfig::default()));

        reload_config(home.path(), &cache).await;
        assert_eq!(cache.read().await.repositories.len(), 1);

        fs::write(config_path(home.path()), "max_concurrency: 0\n").unwrap();
        reload_config(home.path(), &cache).await;
        assert_eq!(cache.read().await.repositories.len(), 1);
    }

    fn client(home: &Path) -> (SocketClient, CancellationToken, broadcast::Receiver<()>) {
        let (sync_tx, _sync_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let cancel = CancellationToken::new();
        let client = SocketClient {
            home: home.to_path_buf(),
            cache: Arc::new(RwLock::new(SyncConfig::default())),
            sync_tx,
            cancel: cancel.clone(),
            shutdown_tx,
            started_at: Utc::now(),
        };
        (client, cancel, shutdown_rx)
    }

    #[tokio::test]
    async fn socket_client_answers_status_and_stop() {
        let home = TempDir::new().unwrap();
        let (client, cancel, mut shutdown_rx) = client(home.path());

        let status = client.handle(DaemonRequest::Status).await;
        assert!(matches!(status, DaemonResponse::Status(s) if s.repositories.is_empty()));

        let stop = client.handle(DaemonRequest::Stop).await;
        assert!(matches!(stop, DaemonResponse::Stopping));
        assert!(cancel.is_cancelled());
        shutdown_rx.recv().await.unwrap();
    }

    #[tokio::test]
    async fn malformed_line_gets_an_error_reply_and_connection_stays_open() {
        let home = TempDir::new().unwrap();
        let (client, _cancel, _shutdown_rx) = client(home.path());
        let (server, peer) = UnixStream::pair().unwrap();
        let serving = tokio::spawn(client.serve(server));

        let (reader, mut writer) = peer.into_split();
        let mut replies = BufReader::new(reader).lines();
        writer.write_all(b"{\"cmd\":\"explode\"}\n").await.unwrap();
        let first: DaemonResponse =
            serde_json::from_str(&replies.next_line().await.unwrap().unwrap()).unwrap();
        assert!(
            matches!(&first, DaemonResponse::Error { message } if message.contains("explode")),
            "got {first:?}"
        );

        writer.write_all(b"{\"cmd\":\"stop\"}\n").await.unwrap();
        let second: DaemonResponse =
            serde_json::from_str(&replies.next_line().await.unwrap().unwrap()).unwrap();
        assert!(matches!(second, DaemonResponse::Stopping));
        serving.await.unwrap().unwrap();
    }
}
