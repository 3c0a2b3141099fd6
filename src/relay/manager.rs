//! Transcoder manager
//!
//! Owns the table of live FFmpeg children keyed by stream key. Guarantees
//! at most one child per key (overlap keys excepted), fans child stdout out
//! to every attached subscriber, restarts crashed children inside a budget,
//! and reaps idle records.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::errors::RelayError;
use crate::models::{Channel, ProfileSpec};

use super::command::{self, LaunchPlan};
use super::resolver::{ResolvedSource, SourceResolver};
use super::ring_buffer::RingBuffer;
use super::{OutputShape, StreamKey};

/// Tunables for the stream lifecycle engine
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Read size for the child stdout reader task
    pub chunk_size: usize,
    /// Byte cap of the bootstrap ring buffer
    pub ring_capacity: usize,
    /// Chunk capacity of each subscriber queue
    pub subscriber_queue: usize,
    /// Per-subscriber deadline before a slow client is evicted
    pub push_timeout: Duration,
    /// Health window after spawn during which an exit fails the launch
    pub spawn_grace: Duration,
    /// How long `open` waits for a `Starting` record
    pub starting_wait: Duration,
    /// Zero-subscriber lifetime before a record is reaped
    pub idle_timeout: Duration,
    /// Sweeper period
    pub sweep_interval: Duration,
    /// Maximum restarts inside `restart_window`
    pub restart_limit: u32,
    pub restart_window: Duration,
    /// Grace between SIGTERM and SIGKILL
    pub stop_timeout: Duration,
    /// Deadline for `shutdown`
    pub shutdown_timeout: Duration,
    /// Deadline for one resolver run
    pub resolver_timeout: Duration,
    /// Exits this soon after spawn always count as unexpected
    pub early_exit_window: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            ring_capacity: 8 * 1024 * 1024,
            subscriber_queue: 32,
            push_timeout: Duration::from_secs(5),
            spawn_grace: Duration::from_secs(1),
            starting_wait: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(15),
            restart_limit: 5,
            restart_window: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(10),
            resolver_timeout: Duration::from_secs(30),
            early_exit_window: Duration::from_secs(2),
        }
    }
}

/// Record lifecycle. Only `Running` and `Degraded` accept subscribers;
/// `Starting` queues them for a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Starting,
    Running,
    Degraded,
    Stopping,
    Exited,
    Failed,
}

impl RecordState {
    fn as_str(self) -> &'static str {
        match self {
            RecordState::Starting => "starting",
            RecordState::Running => "running",
            RecordState::Degraded => "degraded",
            RecordState::Stopping => "stopping",
            RecordState::Exited => "exited",
            RecordState::Failed => "failed",
        }
    }
}

/// Everything needed to respawn a record from scratch
struct LaunchSpec {
    channel: Channel,
    profile: Option<ProfileSpec>,
}

struct SubscriberSlot {
    id: Uuid,
    tx: mpsc::Sender<Bytes>,
    /// Set when the queue first refused a chunk; the slot is evicted
    /// once it has been unable to accept for the push deadline.
    full_since: Option<Instant>,
}

struct RestartWindow {
    count: u32,
    since: Instant,
}

impl RestartWindow {
    fn new() -> Self {
        Self {
            count: 0,
            since: Instant::now(),
        }
    }

    /// Charge one restart against the budget; false when exhausted
    fn charge(&mut self, limit: u32, window: Duration) -> bool {
        if self.since.elapsed() > window {
            self.count = 0;
            self.since = Instant::now();
        }
        self.count += 1;
        self.count <= limit
    }
}

/// Live bookkeeping for one child process and its subscribers
pub struct StreamRecord {
    pub key: StreamKey,
    launch: LaunchSpec,
    argv: Mutex<Vec<String>>,
    started_at: DateTime<Utc>,
    pid: Mutex<Option<u32>>,
    state_tx: watch::Sender<RecordState>,
    ring: Mutex<RingBuffer>,
    subscribers: Mutex<Vec<SubscriberSlot>>,
    last_active: Mutex<Instant>,
    spawned_at: Mutex<Instant>,
    restart_window: Mutex<RestartWindow>,
    restarts_total: AtomicU64,
    child: Mutex<Option<Child>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    segmented: bool,
    bootstrap: bool,
    output_dir: Option<PathBuf>,
    manifest: Option<&'static str>,
}

impl StreamRecord {
    fn state(&self) -> RecordState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: RecordState) {
        self.state_tx.send_replace(state);
    }

    pub fn output_dir(&self) -> Option<&PathBuf> {
        self.output_dir.as_ref()
    }

    pub fn manifest(&self) -> Option<&'static str> {
        self.manifest
    }

    async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    async fn touch(&self) {
        *self.last_active.lock().await = Instant::now();
    }
}

/// One client's byte-delivery context attached to a record.
///
/// Yields the ring bootstrap flush first (non-segmented records), then
/// live chunks in child-stdout order. Dropping the subscription detaches
/// it; for overlap records that also tears the child down.
pub struct Subscription {
    pub id: Uuid,
    initial: Option<Bytes>,
    rx: mpsc::Receiver<Bytes>,
    record: Arc<StreamRecord>,
    manager: Arc<TranscoderManager>,
}

impl Stream for Subscription {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(initial) = self.initial.take() {
            if !initial.is_empty() {
                return Poll::Ready(Some(Ok(initial)));
            }
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let manager = Arc::clone(&self.manager);
        let record = Arc::clone(&self.record);
        let id = self.id;
        tokio::spawn(async move {
            manager.detach(&record, id).await;
        });
    }
}

/// Snapshot row for the tuners listing
#[derive(Debug, Clone, Serialize)]
pub struct LiveStream {
    pub key: String,
    pub channel_id: u32,
    pub variant: String,
    pub shape: String,
    pub pid: Option<u32>,
    pub argv: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub subscribers: usize,
    pub restarts: u64,
    pub state: String,
}

/// Aggregate counters for `/metrics`
#[derive(Debug, Clone, Serialize)]
pub struct RelayStats {
    pub live_records: usize,
    pub subscribers: usize,
    pub total_restarts: u64,
}

pub struct TranscoderManager {
    records: Mutex<HashMap<StreamKey, Arc<StreamRecord>>>,
    launch_locks: Mutex<HashMap<StreamKey, Arc<Mutex<()>>>>,
    profiles: BTreeMap<String, ProfileSpec>,
    settings: RelaySettings,
    ffmpeg_command: String,
    media_root: PathBuf,
    resolver: SourceResolver,
    overlap_seq: AtomicU64,
    restarts_total: AtomicU64,
    shutting_down: AtomicBool,
}

impl TranscoderManager {
    pub fn new(
        profiles: BTreeMap<String, ProfileSpec>,
        ffmpeg_command: impl Into<String>,
        yt_dlp_command: impl Into<String>,
        media_root: PathBuf,
        settings: RelaySettings,
    ) -> Arc<Self> {
        let resolver = SourceResolver::new(yt_dlp_command, settings.resolver_timeout);
        Arc::new(Self {
            records: Mutex::new(HashMap::new()),
            launch_locks: Mutex::new(HashMap::new()),
            profiles,
            settings,
            ffmpeg_command: ffmpeg_command.into(),
            media_root,
            resolver,
            overlap_seq: AtomicU64::new(0),
            restarts_total: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn from_config(config: &AppConfig) -> Arc<Self> {
        Self::new(
            config.ffmpeg_profiles.clone(),
            config.server.ffmpeg_command.clone(),
            config.server.yt_dlp_command.clone(),
            config.server.media_root(),
            RelaySettings::default(),
        )
    }

    pub fn profiles(&self) -> &BTreeMap<String, ProfileSpec> {
        &self.profiles
    }

    /// Mint a fresh private key for an overlap request
    pub fn overlap_key(&self, channel_id: u32, variant: &str) -> StreamKey {
        let seq = self.overlap_seq.fetch_add(1, Ordering::Relaxed) + 1;
        StreamKey::new(channel_id, variant, OutputShape::Overlap(seq))
    }

    /// Periodic sweeper reaping idle and failed records
    pub fn start_sweeper(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.settings.sweep_interval);
            loop {
                ticker.tick().await;
                if manager.shutting_down.load(Ordering::Relaxed) {
                    break;
                }
                manager.sweep_idle().await;
            }
        });
    }

    async fn sweep_idle(&self) {
        let candidates: Vec<Arc<StreamRecord>> = {
            let records = self.records.lock().await;
            records.values().cloned().collect()
        };
        for record in candidates {
            let idle = {
                let subs = record.subscribers.lock().await;
                subs.is_empty()
            };
            if !idle {
                continue;
            }
            let idle_for = record.last_active.lock().await.elapsed();
            let failed = record.state() == RecordState::Failed;
            if idle_for > self.settings.idle_timeout || (failed && idle_for > self.settings.sweep_interval) {
                info!(key = %record.key, "reaping idle transcoder (no subscribers for {:?})", idle_for);
                self.stop_record(&record.key).await;
            }
        }
        // Launch locks for keys without a record are stale
        let records = self.records.lock().await;
        let mut locks = self.launch_locks.lock().await;
        locks.retain(|key, _| records.contains_key(key));
    }

    async fn lookup(&self, key: &StreamKey) -> Option<Arc<StreamRecord>> {
        self.records.lock().await.get(key).cloned()
    }

    async fn launch_lock(&self, key: &StreamKey) -> Arc<Mutex<()>> {
        let mut locks = self.launch_locks.lock().await;
        locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Open a subscription for the given key, launching a child if needed.
    ///
    /// `channel` is the base channel body; variant resolution happens here
    /// so an unknown variant is rejected before anything spawns.
    pub async fn open(
        self: &Arc<Self>,
        key: StreamKey,
        channel: &Channel,
    ) -> Result<Subscription, RelayError> {
        if self.shutting_down.load(Ordering::Relaxed) {
            return Err(RelayError::ShuttingDown);
        }

        let effective = channel
            .resolve_variant(&key.variant)
            .ok_or_else(|| RelayError::BadVariant {
                channel: channel.id,
                variant: key.variant.clone(),
            })?;

        // Private instances bypass lookup and never publish for sharing
        if key.shape.is_overlap() {
            let record = self.launch(key, effective).await?;
            return self.attach(record).await;
        }

        if let Some(record) = self.lookup(&key).await {
            if let Some(subscription) = self.try_attach(&record).await? {
                return Ok(subscription);
            }
        }

        let lock = self.launch_lock(&key).await;
        let _guard = lock.lock().await;

        // Someone may have published while we waited for the key lock
        if let Some(record) = self.lookup(&key).await {
            if let Some(subscription) = self.try_attach(&record).await? {
                return Ok(subscription);
            }
        }

        let record = self.launch(key, effective).await?;
        self.attach(record).await
    }

    /// Ensure a record is live without attaching a subscriber (segmented
    /// manifest requests).
    pub async fn ensure_running(
        self: &Arc<Self>,
        key: StreamKey,
        channel: &Channel,
    ) -> Result<Arc<StreamRecord>, RelayError> {
        if self.shutting_down.load(Ordering::Relaxed) {
            return Err(RelayError::ShuttingDown);
        }
        let effective = channel
            .resolve_variant(&key.variant)
            .ok_or_else(|| RelayError::BadVariant {
                channel: channel.id,
                variant: key.variant.clone(),
            })?;

        if let Some(record) = self.lookup(&key).await {
            match record.state() {
                RecordState::Failed => {
                    return Err(RelayError::RestartBudgetExhausted {
                        key: key.to_string(),
                    })
                }
                RecordState::Stopping | RecordState::Exited => {}
                _ => {
                    record.touch().await;
                    return Ok(record);
                }
            }
        }

        let lock = self.launch_lock(&key).await;
        let _guard = lock.lock().await;
        if let Some(record) = self.lookup(&key).await {
            if !matches!(record.state(), RecordState::Stopping | RecordState::Exited) {
                record.touch().await;
                return Ok(record);
            }
        }
        self.launch(key, effective).await
    }

    /// Look up a live record without side effects
    pub async fn record(&self, key: &StreamKey) -> Option<Arc<StreamRecord>> {
        self.lookup(key).await
    }

    /// Reset the idle timer for a record (C4 file reads)
    pub async fn touch(&self, key: &StreamKey) {
        if let Some(record) = self.lookup(key).await {
            record.touch().await;
        }
    }

    async fn resolve_source(
        &self,
        channel: &Channel,
    ) -> Result<ResolvedSource, RelayError> {
        let raw = channel.source.clone().unwrap_or_default();
        match channel.effective_source_handler() {
            Some(handler) => self.resolver.resolve(&raw, &handler).await,
            None => Ok(ResolvedSource::direct(raw)),
        }
    }

    async fn build_plan(
        &self,
        key: &StreamKey,
        channel: &Channel,
        profile: Option<&ProfileSpec>,
    ) -> Result<LaunchPlan, RelayError> {
        let resolved = self.resolve_source(channel).await?;
        command::build_plan(
            channel,
            profile,
            key,
            &self.ffmpeg_command,
            &self.media_root,
            &resolved,
        )
    }

    fn profile_for(&self, channel: &Channel) -> Option<ProfileSpec> {
        channel
            .ffmpeg_profile
            .as_deref()
            .and_then(|name| self.profiles.get(name))
            .cloned()
    }

    async fn spawn_child(&self, plan: &LaunchPlan) -> Result<Child, RelayError> {
        if let Some(dir) = &plan.output_dir {
            // Stale segments from a previous incarnation confuse players
            let _ = tokio::fs::remove_dir_all(dir).await;
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| RelayError::SpawnFailed {
                    message: format!("failed to create output dir {}: {e}", dir.display()),
                })?;
        }

        let mut cmd = Command::new(&plan.program);
        match &plan.shell_line {
            Some(line) => {
                cmd.arg("-c").arg(line);
            }
            None => {
                cmd.args(&plan.args);
            }
        }
        if !plan.env.is_empty() {
            cmd.envs(plan.env.iter());
        }
        if let Some(cwd) = &plan.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        cmd.spawn().map_err(|e| RelayError::SpawnFailed {
            message: format!("failed to spawn {}: {e}", plan.program),
        })
    }

    /// Launch critical section body: resolve, build, spawn, health-check,
    /// publish. Callers hold the per-key launch lock (overlap keys are
    /// unique so they need no lock).
    async fn launch(
        self: &Arc<Self>,
        key: StreamKey,
        channel: Channel,
    ) -> Result<Arc<StreamRecord>, RelayError> {
        let profile = self.profile_for(&channel);
        let plan = self.build_plan(&key, &channel, profile.as_ref()).await?;
        let mut child = self.spawn_child(&plan).await?;
        let pid = child.id();

        info!(key = %key, ?pid, "started transcoder: {:?}", plan.display_args());

        let (state_tx, _state_rx) = watch::channel(RecordState::Starting);
        let record = Arc::new(StreamRecord {
            key: key.clone(),
            launch: LaunchSpec { channel, profile },
            argv: Mutex::new(plan.display_args()),
            started_at: Utc::now(),
            pid: Mutex::new(pid),
            state_tx,
            ring: Mutex::new(RingBuffer::new(self.settings.ring_capacity)),
            subscribers: Mutex::new(Vec::new()),
            last_active: Mutex::new(Instant::now()),
            spawned_at: Mutex::new(Instant::now()),
            restart_window: Mutex::new(RestartWindow::new()),
            restarts_total: AtomicU64::new(0),
            child: Mutex::new(None),
            reader: Mutex::new(None),
            segmented: plan.segmented,
            bootstrap: plan.bootstrap,
            output_dir: plan.output_dir.clone(),
            manifest: plan.manifest,
        });

        // The reader starts before the health window so the pipe drains
        // into the ring from the first byte.
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        *record.child.lock().await = Some(child);
        if let Some(stderr) = stderr {
            Self::spawn_stderr_logger(&record.key, stderr);
        }
        if let Some(stdout) = stdout {
            self.spawn_reader(&record, stdout).await;
        }

        tokio::time::sleep(self.settings.spawn_grace).await;

        let early_exit = record.state() == RecordState::Exited || {
            let mut guard = record.child.lock().await;
            match guard.as_mut() {
                Some(child) => child.try_wait().ok().flatten().is_some(),
                None => true,
            }
        };
        if early_exit {
            warn!(key = %record.key, "transcoder exited during the startup health window");
            self.dismantle(&record).await;
            return Err(RelayError::StartupExit {
                message: format!("child for {} exited during startup", record.key),
            });
        }

        record.set_state(RecordState::Running);
        self.records
            .lock()
            .await
            .insert(key.clone(), Arc::clone(&record));
        Ok(record)
    }

    fn spawn_stderr_logger(key: &StreamKey, stderr: tokio::process::ChildStderr) {
        let key = key.clone();
        tokio::spawn(async move {
            let reader = BufReader::new(stderr);
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let lower = line.to_lowercase();
                if lower.contains("error") || lower.contains("failed") || lower.contains("invalid")
                {
                    warn!(target: "amps::ffmpeg", key = %key, "{line}");
                } else {
                    debug!(target: "amps::ffmpeg", key = %key, "{line}");
                }
            }
        });
    }

    fn spawn_reader<'a>(
        self: &'a Arc<Self>,
        record: &'a Arc<StreamRecord>,
        stdout: tokio::process::ChildStdout,
    ) -> Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let manager = Arc::clone(self);
            let record_for_task = Arc::clone(record);
            let mut stdout = stdout;
            let handle = tokio::spawn(async move {
                let mut buf = vec![0u8; manager.settings.chunk_size];
                loop {
                    match stdout.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            let chunk = Bytes::copy_from_slice(&buf[..n]);
                            manager.broadcast(&record_for_task, chunk).await;
                        }
                        Err(e) => {
                            warn!(key = %record_for_task.key, "transcoder stdout read error: {e}");
                            break;
                        }
                    }
                }
                manager.on_reader_closed(record_for_task).await;
            });
            *record.reader.lock().await = Some(handle);
        })
    }

    /// Append a chunk to the ring and deliver it to every subscriber.
    ///
    /// The ring lock is held across the deliveries so attaches cannot slip
    /// in between; without that a late joiner could see a chunk both in
    /// its bootstrap flush and as a live delivery. Delivery is strictly
    /// non-blocking: the reader task never waits on an individual
    /// subscriber, a slow client must not stall the child's stdout or
    /// starve the other viewers. A slot whose queue refused a chunk has a
    /// gap the client must not be allowed to skip over, so delivery to it
    /// never resumes; it gets the push deadline to drain what it already
    /// has and is then evicted.
    async fn broadcast(self: &Arc<Self>, record: &Arc<StreamRecord>, chunk: Bytes) {
        let (evicted, now_empty) = {
            let mut ring = record.ring.lock().await;
            if !record.segmented {
                ring.push(chunk.clone());
            }
            let mut subs = record.subscribers.lock().await;
            let mut evicted = 0usize;
            subs.retain_mut(|slot| {
                if let Some(since) = slot.full_since {
                    if since.elapsed() >= self.settings.push_timeout {
                        evicted += 1;
                        return false;
                    }
                    return true;
                }
                match slot.tx.try_send(chunk.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        slot.full_since = Some(Instant::now());
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        evicted += 1;
                        false
                    }
                }
            });
            (evicted, subs.is_empty())
        };

        if evicted > 0 {
            warn!(
                key = %record.key,
                "evicted {evicted} subscriber(s) that stopped accepting data"
            );
            record.touch().await;
            if now_empty && record.key.shape.is_overlap() {
                // Broadcast runs on the reader task; drop our own join
                // handle so the stop path does not wait on it.
                record.reader.lock().await.take();
                self.stop_record(&record.key).await;
            }
        }
    }

    /// Attach once the record leaves `Starting`; `None` means the record
    /// went terminal and the caller should fall through to a fresh launch.
    async fn try_attach(
        self: &Arc<Self>,
        record: &Arc<StreamRecord>,
    ) -> Result<Option<Subscription>, RelayError> {
        let mut state_rx = record.state_tx.subscribe();
        let deadline = Instant::now() + self.settings.starting_wait;
        loop {
            let state = *state_rx.borrow();
            match state {
                RecordState::Running | RecordState::Degraded => {
                    return Ok(Some(self.attach(Arc::clone(record)).await?));
                }
                RecordState::Failed => {
                    return Err(RelayError::RestartBudgetExhausted {
                        key: record.key.to_string(),
                    });
                }
                RecordState::Stopping | RecordState::Exited => return Ok(None),
                RecordState::Starting => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(RelayError::NotAccepting {
                            key: record.key.to_string(),
                        });
                    }
                    if tokio::time::timeout(remaining, state_rx.changed())
                        .await
                        .is_err()
                    {
                        return Err(RelayError::NotAccepting {
                            key: record.key.to_string(),
                        });
                    }
                }
            }
        }
    }

    async fn attach(
        self: &Arc<Self>,
        record: Arc<StreamRecord>,
    ) -> Result<Subscription, RelayError> {
        let (tx, rx) = mpsc::channel(self.settings.subscriber_queue);
        let id = Uuid::new_v4();

        let initial = {
            let ring = record.ring.lock().await;
            let mut subs = record.subscribers.lock().await;
            let snapshot = if !record.segmented && record.bootstrap {
                ring.snapshot()
            } else {
                Bytes::new()
            };
            subs.push(SubscriberSlot {
                id,
                tx,
                full_since: None,
            });
            snapshot
        };
        record.touch().await;

        debug!(key = %record.key, subscriber = %id, "attached subscriber");
        Ok(Subscription {
            id,
            initial: Some(initial),
            rx,
            record,
            manager: Arc::clone(self),
        })
    }

    pub(crate) async fn detach(self: &Arc<Self>, record: &Arc<StreamRecord>, id: Uuid) {
        let now_empty = {
            let mut subs = record.subscribers.lock().await;
            let before = subs.len();
            subs.retain(|s| s.id != id);
            before != subs.len() && subs.is_empty()
        };
        record.touch().await;
        debug!(key = %record.key, subscriber = %id, "detached subscriber");
        if now_empty && record.key.shape.is_overlap() {
            info!(key = %record.key, "sole overlap subscriber left; stopping private transcoder");
            self.stop_record(&record.key).await;
        }
    }

    /// Reader-task epilogue: classify the closure and either restart the
    /// child in place or retire the record.
    async fn on_reader_closed(self: &Arc<Self>, record: Arc<StreamRecord>) {
        match record.state() {
            // A managed stop owns the cleanup; the launcher owns startup
            // failures.
            RecordState::Stopping | RecordState::Exited | RecordState::Failed => return,
            RecordState::Starting => {
                record.set_state(RecordState::Exited);
                return;
            }
            RecordState::Running | RecordState::Degraded => {}
        }

        let status = {
            let mut guard = record.child.lock().await;
            match guard.as_mut() {
                Some(child) => tokio::time::timeout(Duration::from_secs(2), child.wait())
                    .await
                    .ok()
                    .and_then(|r| r.ok()),
                None => None,
            }
        };
        let spawned_elapsed = record.spawned_at.lock().await.elapsed();
        let has_subscribers = !record.subscribers.lock().await.is_empty();
        let clean_exit = status.is_some_and(|s| s.success());

        let unexpected = spawned_elapsed < self.settings.early_exit_window
            || (!clean_exit && has_subscribers);

        if unexpected && !self.shutting_down.load(Ordering::Relaxed) {
            warn!(
                key = %record.key,
                ?status,
                "transcoder died unexpectedly; attempting restart"
            );
            record.set_state(RecordState::Degraded);
            // Every attempt charges the budget, including respawns that
            // fail outright (a resolver error is a launch failure too).
            loop {
                let within_budget = record
                    .restart_window
                    .lock()
                    .await
                    .charge(self.settings.restart_limit, self.settings.restart_window);
                if !within_budget {
                    error!(
                        key = %record.key,
                        "restart budget exhausted; marking record failed"
                    );
                    break;
                }
                record.restarts_total.fetch_add(1, Ordering::Relaxed);
                self.restarts_total.fetch_add(1, Ordering::Relaxed);
                match self.respawn(&record).await {
                    Ok(()) => {
                        record.set_state(RecordState::Running);
                        return;
                    }
                    Err(e) => {
                        error!(key = %record.key, "restart failed: {e}");
                    }
                }
            }
            // Failed sink: subscribers are closed, the record stays
            // visible until the sweeper reaps it so repeat opens see 503.
            record.set_state(RecordState::Failed);
            self.close_subscribers(&record).await;
            return;
        }

        debug!(key = %record.key, ?status, "transcoder ended");
        record.set_state(RecordState::Exited);
        self.records.lock().await.remove(&record.key);
        self.close_subscribers(&record).await;
        // This runs on the reader task itself; drop the handle so
        // dismantle does not wait on its own join.
        record.reader.lock().await.take();
        self.dismantle(&record).await;
    }

    /// Re-enter the launch critical section and swap a fresh child into
    /// the existing record; surviving subscribers keep their queues.
    async fn respawn(self: &Arc<Self>, record: &Arc<StreamRecord>) -> Result<(), RelayError> {
        let lock = self.launch_lock(&record.key).await;
        let _guard = lock.lock().await;

        let plan = self
            .build_plan(
                &record.key,
                &record.launch.channel,
                record.launch.profile.as_ref(),
            )
            .await?;
        let mut child = self.spawn_child(&plan).await?;
        let pid = child.id();
        info!(key = %record.key, ?pid, "respawned transcoder");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        {
            let mut guard = record.child.lock().await;
            *guard = Some(child);
        }
        *record.pid.lock().await = pid;
        *record.spawned_at.lock().await = Instant::now();
        *record.argv.lock().await = plan.display_args();
        if let Some(stderr) = stderr {
            Self::spawn_stderr_logger(&record.key, stderr);
        }
        if let Some(stdout) = stdout {
            self.spawn_reader(record, stdout).await;
        }

        tokio::time::sleep(self.settings.spawn_grace).await;
        let still_alive = {
            let mut guard = record.child.lock().await;
            match guard.as_mut() {
                Some(child) => child.try_wait().ok().flatten().is_none(),
                None => false,
            }
        };
        if !still_alive {
            return Err(RelayError::StartupExit {
                message: format!("respawned child for {} exited during startup", record.key),
            });
        }
        Ok(())
    }

    async fn close_subscribers(&self, record: &StreamRecord) {
        // Dropping the senders closes every subscriber queue, which ends
        // the client streams (drop means disconnect, never silent loss).
        record.subscribers.lock().await.clear();
    }

    /// Terminate the child (graceful then forced), join the reader and
    /// delete the output directory.
    async fn dismantle(&self, record: &StreamRecord) {
        if let Some(mut child) = record.child.lock().await.take() {
            if let Some(pid) = child.id() {
                // Graceful first; FFmpeg finalises segment lists on TERM
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }
            match tokio::time::timeout(self.settings.stop_timeout, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(key = %record.key, %status, "transcoder terminated");
                }
                Ok(Err(e)) => warn!(key = %record.key, "error awaiting transcoder exit: {e}"),
                Err(_) => {
                    warn!(key = %record.key, "transcoder ignored SIGTERM; killing");
                    let _ = child.kill().await;
                }
            }
        }

        let reader = record.reader.lock().await.take();
        if let Some(handle) = reader {
            if tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .is_err()
            {
                warn!(key = %record.key, "reader task did not settle in time");
            }
        }

        if let Some(dir) = &record.output_dir {
            let _ = tokio::fs::remove_dir_all(dir).await;
        }
    }

    /// Remove and fully stop a record. Safe to call concurrently with
    /// `open`; the record leaves the table before anything slow happens.
    pub async fn stop_record(&self, key: &StreamKey) -> bool {
        let record = { self.records.lock().await.remove(key) };
        let Some(record) = record else {
            return false;
        };
        record.set_state(RecordState::Stopping);
        self.close_subscribers(&record).await;
        self.dismantle(&record).await;
        record.set_state(RecordState::Exited);
        info!(key = %key, "stopped transcoder");
        true
    }

    /// Public kill for the API surface
    pub async fn kill(&self, key: &StreamKey) -> Result<(), RelayError> {
        if self.stop_record(key).await {
            Ok(())
        } else {
            Err(RelayError::RecordNotFound {
                key: key.to_string(),
            })
        }
    }

    /// Terminate every record belonging to a channel (delete cascade)
    pub async fn kill_channel(&self, channel_id: u32) -> usize {
        let keys: Vec<StreamKey> = {
            let records = self.records.lock().await;
            records
                .keys()
                .filter(|k| k.channel_id == channel_id)
                .cloned()
                .collect()
        };
        let mut stopped = 0;
        for key in keys {
            if self.stop_record(&key).await {
                stopped += 1;
            }
        }
        stopped
    }

    /// Snapshot of live records for the tuners listing
    pub async fn list_live(&self) -> Vec<LiveStream> {
        let records: Vec<Arc<StreamRecord>> = {
            let records = self.records.lock().await;
            records.values().cloned().collect()
        };
        let mut live = Vec::with_capacity(records.len());
        for record in records {
            live.push(LiveStream {
                key: record.key.to_string(),
                channel_id: record.key.channel_id,
                variant: record.key.variant.clone(),
                shape: record.key.shape.to_string(),
                pid: *record.pid.lock().await,
                argv: record.argv.lock().await.clone(),
                started_at: record.started_at,
                subscribers: record.subscriber_count().await,
                restarts: record.restarts_total.load(Ordering::Relaxed),
                state: record.state().as_str().to_string(),
            });
        }
        live.sort_by(|a, b| a.key.cmp(&b.key));
        live
    }

    pub async fn stats(&self) -> RelayStats {
        let records: Vec<Arc<StreamRecord>> = {
            let records = self.records.lock().await;
            records.values().cloned().collect()
        };
        let mut subscribers = 0;
        for record in &records {
            subscribers += record.subscriber_count().await;
        }
        RelayStats {
            live_records: records.len(),
            subscribers,
            total_restarts: self.restarts_total.load(Ordering::Relaxed),
        }
    }

    /// Terminate all children, drain subscribers and stop background work
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        let keys: Vec<StreamKey> = {
            let records = self.records.lock().await;
            records.keys().cloned().collect()
        };
        let stop_all = async {
            for key in keys {
                self.stop_record(&key).await;
            }
        };
        if tokio::time::timeout(self.settings.shutdown_timeout, stop_all)
            .await
            .is_err()
        {
            warn!("shutdown deadline exceeded; remaining children are killed on drop");
        }
    }
}
