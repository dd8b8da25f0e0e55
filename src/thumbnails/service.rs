//! The thumbnail service: what consumers call to get thumbnails.
//!
//! `request`/`get_thumbnail` never block on a decode. They answer from memory,
//! then from the persistent store, and otherwise hand back a loading
//! placeholder while a worker generates the real thing. Concurrent misses for
//! the same key share one generation ("flight"). Results flow back through a
//! single dispatcher thread, which stores generated thumbnails in both tiers
//! and is the only sender of [`ThumbnailEvent`]s. Callers' threads also touch
//! the tiers: a persistent hit is promoted into memory, and a stale or
//! unreadable blob found on read is deleted.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use super::decoder::{self, Decoder};
use super::key::normalize_path;
use super::memory::MemoryCache;
use super::persistent::PersistentCache;
use super::placeholder::{PlaceholderFactory, PlaceholderKind};
use super::worker::{
    GenerationTask, Priority, TaskOutcome, TaskQueue, WorkerContext, WorkerMessage, WorkerPool,
};
use super::{Bitmap, CacheKey, ReloadToken, RequestContext};
use crate::config::ThumbnailConfig;
use crate::db::{PhotoRecord, ThumbnailStore};
use crate::error::{DecodeError, DecodeErrorKind, ThumbnailError};

/// Notification delivered to the consumer for an earlier `request`.
#[derive(Debug, Clone)]
pub enum ThumbnailEvent {
    /// Low resolution stand-in; the full result follows.
    Preview {
        key: CacheKey,
        context: RequestContext,
        token: ReloadToken,
        bitmap: Bitmap,
    },
    Full {
        key: CacheKey,
        context: RequestContext,
        token: ReloadToken,
        bitmap: Bitmap,
    },
    Failed {
        key: CacheKey,
        context: RequestContext,
        token: ReloadToken,
        error: DecodeErrorKind,
        placeholder: Bitmap,
    },
}

impl ThumbnailEvent {
    pub fn key(&self) -> &CacheKey {
        match self {
            ThumbnailEvent::Preview { key, .. }
            | ThumbnailEvent::Full { key, .. }
            | ThumbnailEvent::Failed { key, .. } => key,
        }
    }

    pub fn context(&self) -> RequestContext {
        match self {
            ThumbnailEvent::Preview { context, .. }
            | ThumbnailEvent::Full { context, .. }
            | ThumbnailEvent::Failed { context, .. } => *context,
        }
    }

    pub fn token(&self) -> ReloadToken {
        match self {
            ThumbnailEvent::Preview { token, .. }
            | ThumbnailEvent::Full { token, .. }
            | ThumbnailEvent::Failed { token, .. } => *token,
        }
    }

    /// The bitmap to display: the thumbnail itself, or a failure placeholder.
    pub fn bitmap(&self) -> &Bitmap {
        match self {
            ThumbnailEvent::Preview { bitmap, .. } | ThumbnailEvent::Full { bitmap, .. } => bitmap,
            ThumbnailEvent::Failed { placeholder, .. } => placeholder,
        }
    }

    /// Whether this is the last event for its request.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ThumbnailEvent::Preview { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearScope {
    All,
    /// Only thumbnails whose source lives under this directory.
    Directory(PathBuf),
}

/// Entries dropped by an invalidation, per tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Removed {
    pub memory: usize,
    pub persisted: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub l1_hits: u64,
    pub l2_hits: u64,
    /// Requests that attached to a generation already in flight.
    pub coalesced: u64,
    pub generated: u64,
    pub failures: u64,
    /// Tasks dropped before decode because nobody wanted them any more.
    pub skipped: u64,
    /// Results withheld from consumers whose reload token moved on.
    pub stale_discards: u64,
    pub l2_write_errors: u64,
    pub in_flight: usize,
    pub queued: usize,
    pub memory_entries: usize,
    pub memory_bytes: usize,
}

#[derive(Default)]
struct Stats {
    requests: AtomicU64,
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    coalesced: AtomicU64,
    generated: AtomicU64,
    failures: AtomicU64,
    skipped: AtomicU64,
    stale_discards: AtomicU64,
    l2_write_errors: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy)]
struct Subscriber {
    context: RequestContext,
    token: ReloadToken,
}

/// Completion slot for blocking callers of a flight.
#[derive(Default)]
struct FlightSignal {
    result: Mutex<Option<Result<Bitmap, ThumbnailError>>>,
    done: Condvar,
}

impl FlightSignal {
    fn complete(&self, result: Result<Bitmap, ThumbnailError>) {
        let mut slot = self.result.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(result);
        drop(slot);
        self.done.notify_all();
    }

    fn wait(&self) -> Result<Bitmap, ThumbnailError> {
        let mut slot = self.result.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            slot = self.done.wait(slot).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// One generation in progress and everyone waiting on it.
struct Flight {
    task_id: u64,
    priority: Priority,
    /// Token current when the flight started; decides staleness of prefetches.
    origin_token: ReloadToken,
    subscribers: Vec<Subscriber>,
    blocking: usize,
    signal: Arc<FlightSignal>,
}

impl Flight {
    fn is_abandoned(&self, current: ReloadToken) -> bool {
        if self.blocking > 0 {
            return false;
        }
        if self.subscribers.is_empty() {
            return self.origin_token != current;
        }
        self.subscribers.iter().all(|s| s.token != current)
    }
}

enum Waiter {
    Subscriber(Subscriber),
    Blocking,
    Prefetch,
}

enum Join {
    Cached(Bitmap),
    Started(Arc<FlightSignal>),
    Attached(Arc<FlightSignal>),
    Stopped,
}

struct Shared {
    config: ThumbnailConfig,
    memory: MemoryCache,
    persistent: Arc<PersistentCache>,
    placeholders: PlaceholderFactory,
    queue: Arc<TaskQueue>,
    flights: Mutex<HashMap<CacheKey, Flight>>,
    reload: AtomicU64,
    /// Bumped by every invalidation; results started before it are not cached.
    epoch: AtomicU64,
    /// Held across an epoch check and the cache writes it allows, and across
    /// an epoch bump and the removals that follow it.
    invalidation: Mutex<()>,
    next_task: AtomicU64,
    events: Sender<ThumbnailEvent>,
    stats: Stats,
}

impl Shared {
    fn lock_flights(&self) -> MutexGuard<'_, HashMap<CacheKey, Flight>> {
        self.flights.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_invalidation(&self) -> MutexGuard<'_, ()> {
        self.invalidation.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn reload_token(&self) -> ReloadToken {
        ReloadToken(self.reload.load(Ordering::SeqCst))
    }

    fn emit(&self, event: ThumbnailEvent) {
        // Consumer may have dropped its receiver
        let _ = self.events.send(event);
    }

    /// Memory tier, then persistent tier (promoting hits into memory).
    fn cached(&self, key: &CacheKey) -> Option<Bitmap> {
        if let Some(bitmap) = self.memory.get(key) {
            bump(&self.stats.l1_hits);
            return Some(bitmap);
        }

        let epoch = self.current_epoch();
        match self.persistent.get(key) {
            Ok(Some(bitmap)) => {
                bump(&self.stats.l2_hits);
                let _invalidation = self.lock_invalidation();
                if self.current_epoch() == epoch {
                    self.memory.put(key.clone(), bitmap.clone());
                }
                Some(bitmap)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Persisted thumbnail read failed, treating as miss");
                None
            }
        }
    }

    fn join_or_start(&self, key: CacheKey, real_path: &Path, waiter: Waiter) -> Join {
        let mut flights = self.lock_flights();

        if let Some(flight) = flights.get_mut(&key) {
            let signal = Arc::clone(&flight.signal);
            let visible = match waiter {
                Waiter::Subscriber(subscriber) => {
                    flight.subscribers.push(subscriber);
                    true
                }
                Waiter::Blocking => {
                    flight.blocking += 1;
                    true
                }
                Waiter::Prefetch => false,
            };
            if visible {
                bump(&self.stats.coalesced);
                if flight.priority == Priority::Prefetch {
                    flight.priority = Priority::Visible;
                    self.queue.promote(&key);
                }
                tracing::debug!(key = %key, "Attached to in-flight generation");
            }
            return Join::Attached(signal);
        }

        // The previous flight for this key may have landed since the caller looked
        if let Some(bitmap) = self.memory.get(&key) {
            return Join::Cached(bitmap);
        }

        let origin_token = self.reload_token();
        let priority = match waiter {
            Waiter::Subscriber(_) | Waiter::Blocking => Priority::Visible,
            Waiter::Prefetch => Priority::Prefetch,
        };
        let task = GenerationTask {
            id: self.next_task.fetch_add(1, Ordering::Relaxed),
            key: key.clone(),
            real_path: real_path.to_path_buf(),
            priority,
            check_persistent: priority == Priority::Prefetch,
            epoch: self.current_epoch(),
        };

        let mut flight = Flight {
            task_id: task.id,
            priority,
            origin_token,
            subscribers: Vec::new(),
            blocking: 0,
            signal: Arc::new(FlightSignal::default()),
        };
        match waiter {
            Waiter::Subscriber(subscriber) => flight.subscribers.push(subscriber),
            Waiter::Blocking => flight.blocking = 1,
            Waiter::Prefetch => {}
        }
        let signal = Arc::clone(&flight.signal);

        if self.queue.push(task).is_err() {
            return Join::Stopped;
        }
        tracing::trace!(key = %key, ?priority, "Queued thumbnail generation");
        flights.insert(key, flight);
        Join::Started(signal)
    }

    /// Whether a worker should drop `task` without decoding.
    fn is_task_stale(&self, task: &GenerationTask) -> bool {
        let current = self.reload_token();
        match self.lock_flights().get(&task.key) {
            Some(flight) if flight.task_id == task.id => flight.is_abandoned(current),
            _ => true,
        }
    }

    fn dispatch(&self, results: Receiver<WorkerMessage>) {
        for message in results {
            match message {
                WorkerMessage::Preview { task_id, key, bitmap } => {
                    self.deliver_preview(task_id, &key, bitmap)
                }
                WorkerMessage::Finished { task, outcome } => self.finish(task, outcome),
            }
        }
        tracing::debug!("Thumbnail dispatcher stopped");
    }

    fn deliver_preview(&self, task_id: u64, key: &CacheKey, bitmap: Bitmap) {
        let current = self.reload_token();
        let recipients: Vec<RequestContext> = match self.lock_flights().get(key) {
            Some(flight) if flight.task_id == task_id => flight
                .subscribers
                .iter()
                .filter(|s| s.token == current)
                .map(|s| s.context)
                .collect(),
            _ => return,
        };

        for context in recipients {
            self.emit(ThumbnailEvent::Preview {
                key: key.clone(),
                context,
                token: current,
                bitmap: bitmap.clone(),
            });
        }
    }

    fn finish(&self, task: GenerationTask, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Generated {
                bitmap,
                encoded,
                fingerprint,
            } => {
                bump(&self.stats.generated);
                self.write_through(&task, &bitmap, encoded.map(|data| (data, fingerprint)));
                self.resolve(&task, Ok(bitmap));
            }
            TaskOutcome::Persisted(bitmap) => {
                bump(&self.stats.l2_hits);
                self.write_through(&task, &bitmap, None);
                self.resolve(&task, Ok(bitmap));
            }
            TaskOutcome::Failed(error) => {
                bump(&self.stats.failures);
                match error.kind() {
                    DecodeErrorKind::NotFound | DecodeErrorKind::InvalidRequest => {
                        tracing::error!(key = %task.key, reason = error.reason(), error = %error, "Thumbnail generation failed");
                    }
                    _ => {
                        tracing::warn!(key = %task.key, reason = error.reason(), error = %error, "Thumbnail generation failed");
                    }
                }
                self.resolve(&task, Err(ThumbnailError::Decode(error)));
            }
            TaskOutcome::Skipped => self.retire_skipped(task),
            TaskOutcome::Abandoned => self.resolve(&task, Err(ThumbnailError::Stopped)),
        }
    }

    /// Cache a finished result in both tiers, unless an invalidation ran
    /// since `task` was queued.
    fn write_through(&self, task: &GenerationTask, bitmap: &Bitmap, blob: Option<(Vec<u8>, String)>) {
        let _invalidation = self.lock_invalidation();
        if task.epoch != self.current_epoch() {
            tracing::debug!(key = %task.key, "Source invalidated during generation, result not cached");
            return;
        }

        if let Some((data, fingerprint)) = blob {
            if let Err(e) = self.persistent.put(&task.key, data, fingerprint) {
                bump(&self.stats.l2_write_errors);
                tracing::warn!(key = %task.key, error = %e, "Failed to persist thumbnail, keeping it in memory only");
            }
        }
        self.memory.put(task.key.clone(), bitmap.clone());
    }

    /// A worker skipped `task` as unwanted. Drop the flight, unless a fresh
    /// waiter attached in the meantime, in which case run it again.
    fn retire_skipped(&self, task: GenerationTask) {
        let current = self.reload_token();
        let mut flights = self.lock_flights();
        let Some(flight) = flights
            .get_mut(&task.key)
            .filter(|flight| flight.task_id == task.id)
        else {
            return;
        };

        if flight.is_abandoned(current) {
            let discarded = flight.subscribers.len() as u64;
            flights.remove(&task.key);
            bump(&self.stats.skipped);
            self.stats.stale_discards.fetch_add(discarded, Ordering::Relaxed);
            tracing::debug!(key = %task.key, "Skipped generation nobody is waiting for");
            return;
        }

        let retry = GenerationTask {
            id: self.next_task.fetch_add(1, Ordering::Relaxed),
            priority: flight.priority,
            epoch: self.current_epoch(),
            ..task
        };
        flight.task_id = retry.id;
        if let Err(retry) = self.queue.push(retry) {
            let orphan = flights.remove(&retry.key);
            drop(flights);
            if let Some(flight) = orphan {
                self.settle(&retry.key, flight, Err(ThumbnailError::Stopped));
            }
        }
    }

    fn resolve(&self, task: &GenerationTask, result: Result<Bitmap, ThumbnailError>) {
        let flight = {
            let mut flights = self.lock_flights();
            match flights.get(&task.key) {
                Some(flight) if flight.task_id == task.id => flights.remove(&task.key),
                _ => None,
            }
        };
        if let Some(flight) = flight {
            self.settle(&task.key, flight, result);
        }
    }

    /// Wake blocking waiters and notify each subscriber whose token is current.
    fn settle(&self, key: &CacheKey, flight: Flight, result: Result<Bitmap, ThumbnailError>) {
        flight.signal.complete(result.clone());

        let current = self.reload_token();
        for subscriber in flight.subscribers {
            if subscriber.token != current {
                bump(&self.stats.stale_discards);
                tracing::debug!(key = %key, context = subscriber.context.0, "Discarding result for superseded request");
                continue;
            }

            let event = match &result {
                Ok(bitmap) => ThumbnailEvent::Full {
                    key: key.clone(),
                    context: subscriber.context,
                    token: subscriber.token,
                    bitmap: bitmap.clone(),
                },
                Err(ThumbnailError::Decode(error)) => ThumbnailEvent::Failed {
                    key: key.clone(),
                    context: subscriber.context,
                    token: subscriber.token,
                    error: error.kind(),
                    placeholder: self
                        .placeholders
                        .get(PlaceholderKind::for_error(error.kind()), key.height()),
                },
                // Shutting down; nobody is left to show anything to
                Err(_) => continue,
            };
            self.emit(event);
        }
    }
}

/// Two-tier thumbnail cache with a background generation pool.
///
/// Dropping the service (or calling [`shutdown`](Self::shutdown)) stops the
/// workers, waiting for decodes already running.
pub struct ThumbnailService {
    shared: Arc<Shared>,
    pool: Option<WorkerPool>,
    dispatcher: Option<JoinHandle<()>>,
}

impl ThumbnailService {
    /// Start workers and dispatcher. Events for `request` calls arrive on the
    /// returned receiver.
    ///
    /// The channel is unbounded: callers that never read it should drop the
    /// receiver, otherwise every undelivered bitmap stays queued in it.
    pub fn start(
        config: ThumbnailConfig,
        store: Arc<dyn ThumbnailStore>,
        decoder: Arc<dyn Decoder>,
    ) -> Result<(Self, Receiver<ThumbnailEvent>)> {
        let config = config.validated();
        let (event_tx, event_rx) = mpsc::channel();
        let (result_tx, result_rx) = mpsc::channel();
        let queue = Arc::new(TaskQueue::new());
        let persistent = Arc::new(PersistentCache::new(store, &config));

        let shared = Arc::new(Shared {
            memory: MemoryCache::new(config.l1_capacity, config.l1_max_bytes),
            persistent: Arc::clone(&persistent),
            placeholders: PlaceholderFactory::new(),
            queue: Arc::clone(&queue),
            flights: Mutex::new(HashMap::new()),
            reload: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            invalidation: Mutex::new(()),
            next_task: AtomicU64::new(1),
            events: event_tx,
            stats: Stats::default(),
            config: config.clone(),
        });

        let dispatcher = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("thumb-dispatch".to_string())
                .spawn(move || shared.dispatch(result_rx))
                .context("Failed to start thumbnail dispatcher")?
        };

        let preview_config = config.clone();
        let stale_shared = Arc::clone(&shared);
        let context = WorkerContext {
            decoder,
            persistent,
            decode_timeout: config.decode_timeout(),
            preview_height: Arc::new(move |height| preview_config.preview_height(height)),
            is_stale: Arc::new(move |task| stale_shared.is_task_stale(task)),
        };
        let pool = WorkerPool::start(config.worker_count, queue, context, result_tx)
            .context("Failed to start thumbnail workers")?;

        tracing::info!(
            workers = config.worker_count,
            l1_capacity = config.l1_capacity,
            decode_timeout = ?config.decode_timeout(),
            "Thumbnail service started"
        );

        Ok((
            Self {
                shared,
                pool: Some(pool),
                dispatcher: Some(dispatcher),
            },
            event_rx,
        ))
    }

    pub fn config(&self) -> &ThumbnailConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &Arc<dyn ThumbnailStore> {
        self.shared.persistent.store()
    }

    pub fn reload_token(&self) -> ReloadToken {
        self.shared.reload_token()
    }

    /// Mark everything requested so far as superseded (the view changed).
    pub fn bump_reload_token(&self) -> ReloadToken {
        let previous = self.shared.reload.fetch_add(1, Ordering::SeqCst);
        let token = ReloadToken(previous).next();
        tracing::debug!(token = token.0, "Reload token advanced");
        token
    }

    pub fn placeholder(&self, kind: PlaceholderKind, height: u32) -> Bitmap {
        self.shared.placeholders.get(kind, height)
    }

    /// [`request`](Self::request) with a default context. Its events still go
    /// to the receiver returned by [`start`](Self::start).
    pub fn get_thumbnail(&self, path: &Path, height: u32) -> Bitmap {
        self.request(path, height, RequestContext::default())
    }

    /// Return the cached thumbnail for `path` at `height`, or a loading
    /// placeholder while it is generated in the background. The outcome of
    /// a generation arrives as events tagged with `context`.
    pub fn request(&self, path: &Path, height: u32, context: RequestContext) -> Bitmap {
        bump(&self.shared.stats.requests);
        if height == 0 {
            tracing::warn!(path = %path.display(), "Thumbnail requested with zero height");
            return self.placeholder(PlaceholderKind::Unavailable, 1);
        }

        let key = CacheKey::new(path, height);
        if let Some(bitmap) = self.shared.cached(&key) {
            return bitmap;
        }

        let subscriber = Subscriber {
            context,
            token: self.reload_token(),
        };
        match self
            .shared
            .join_or_start(key, path, Waiter::Subscriber(subscriber))
        {
            Join::Cached(bitmap) => bitmap,
            Join::Started(_) | Join::Attached(_) => self.placeholder(PlaceholderKind::Loading, height),
            Join::Stopped => self.placeholder(PlaceholderKind::Unavailable, height),
        }
    }

    /// Blocking variant: wait for the thumbnail (sharing any in-flight
    /// generation) and report failures as errors.
    pub fn load_thumbnail(&self, path: &Path, height: u32) -> Result<Bitmap, ThumbnailError> {
        bump(&self.shared.stats.requests);
        if height == 0 {
            return Err(DecodeError::InvalidRequest("target height must be positive".into()).into());
        }

        let key = CacheKey::new(path, height);
        if let Some(bitmap) = self.shared.cached(&key) {
            return Ok(bitmap);
        }

        match self.shared.join_or_start(key, path, Waiter::Blocking) {
            Join::Cached(bitmap) => Ok(bitmap),
            Join::Started(signal) | Join::Attached(signal) => signal.wait(),
            Join::Stopped => Err(ThumbnailError::Stopped),
        }
    }

    /// Queue low priority generation for the items within the configured
    /// radius of `center`, nearest first. Returns how many were queued.
    pub fn prefetch(&self, paths: &[PathBuf], center: usize, height: u32) -> usize {
        let radius = self.shared.config.prefetch_radius;
        if paths.is_empty() || height == 0 || radius == 0 {
            return 0;
        }

        let last = paths.len() - 1;
        let center = center.min(last);
        let mut order: Vec<usize> = (center.saturating_sub(radius)..=center.saturating_add(radius).min(last))
            .filter(|&i| i != center)
            .collect();
        order.sort_by_key(|&i| i.abs_diff(center));

        let mut queued = 0;
        for index in order {
            let path = &paths[index];
            let key = CacheKey::new(path, height);
            if self.shared.memory.contains(&key) {
                continue;
            }
            if let Join::Started(_) = self.shared.join_or_start(key, path, Waiter::Prefetch) {
                queued += 1;
            }
        }

        tracing::debug!(center, queued, "Prefetch scheduled");
        queued
    }

    /// Forget every cached thumbnail of `path`, at all heights.
    pub fn invalidate(&self, path: &Path) -> Result<Removed, ThumbnailError> {
        let normalized = normalize_path(path);
        let (memory, persisted) = {
            let _invalidation = self.shared.lock_invalidation();
            self.shared.epoch.fetch_add(1, Ordering::SeqCst);
            let memory = self.shared.memory.remove_path(&normalized);
            (memory, self.shared.persistent.remove_path(&normalized)?)
        };

        tracing::info!(path = %normalized.display(), memory, persisted, "Invalidated thumbnails");
        Ok(Removed { memory, persisted })
    }

    pub fn clear_all(&self, scope: ClearScope) -> Result<Removed, ThumbnailError> {
        let _invalidation = self.shared.lock_invalidation();
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);

        let removed = match &scope {
            ClearScope::All => {
                let memory = self.shared.memory.len();
                self.shared.memory.clear();
                let persisted = self.shared.persistent.clear(None)?;
                Removed { memory, persisted }
            }
            ClearScope::Directory(dir) => {
                let dir = normalize_path(dir);
                let memory = self.shared.memory.remove_under(&dir);
                let persisted = self.shared.persistent.clear(Some(&dir))?;
                Removed { memory, persisted }
            }
        };

        tracing::info!(?scope, memory = removed.memory, persisted = removed.persisted, "Cleared thumbnail cache");
        Ok(removed)
    }

    /// Probe `path` (bounded by the probe timeout) and record its metadata.
    pub fn record_metadata(&self, path: &Path) -> Result<PhotoRecord, ThumbnailError> {
        let metadata = fs::metadata(path).map_err(|e| DecodeError::from_io(path, &e))?;
        let probe = decoder::probe(path, self.shared.config.probe_timeout())?;
        let normalized = normalize_path(path);

        let record = PhotoRecord {
            path: normalized.to_string_lossy().into_owned(),
            filename: normalized
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            directory: normalized
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
            size_bytes: metadata.len() as i64,
            modified_at: metadata
                .modified()
                .ok()
                .map(|t| DateTime::<Utc>::from(t).to_rfc3339()),
            width: Some(probe.width),
            height: Some(probe.height),
            format: probe.format,
            orientation: probe.orientation,
            taken_at: probe.taken_at,
        };

        self.store().upsert_photo(&record)?;
        Ok(record)
    }

    pub fn stats(&self) -> StatsSnapshot {
        let stats = &self.shared.stats;
        StatsSnapshot {
            requests: read(&stats.requests),
            l1_hits: read(&stats.l1_hits),
            l2_hits: read(&stats.l2_hits),
            coalesced: read(&stats.coalesced),
            generated: read(&stats.generated),
            failures: read(&stats.failures),
            skipped: read(&stats.skipped),
            stale_discards: read(&stats.stale_discards),
            l2_write_errors: read(&stats.l2_write_errors),
            in_flight: self.shared.lock_flights().len(),
            queued: self.shared.queue.len(),
            memory_entries: self.shared.memory.len(),
            memory_bytes: self.shared.memory.byte_size(),
        }
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(mut pool) = self.pool.take() else {
            return;
        };

        let leftover = pool.shutdown();
        for task in leftover {
            self.shared.finish(task, TaskOutcome::Abandoned);
        }
        drop(pool);

        // Workers are gone, so the dispatcher drains and exits
        if let Some(handle) = self.dispatcher.take() {
            if handle.join().is_err() {
                tracing::error!("Thumbnail dispatcher panicked");
            }
        }

        let orphans: Vec<(CacheKey, Flight)> = self.shared.lock_flights().drain().collect();
        for (key, flight) in orphans {
            self.shared.settle(&key, flight, Err(ThumbnailError::Stopped));
        }

        tracing::info!("Thumbnail service stopped");
    }
}

impl Drop for ThumbnailService {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteDb;
    use crate::thumbnails::testing::{
        memory_store, write_png, CountingDecoder, FailingDecoder, GatedDecoder, HangingDecoder,
        ScriptedStore,
    };
    use crate::thumbnails::StandardDecoder;
    use std::time::{Duration, Instant};

    fn config() -> ThumbnailConfig {
        ThumbnailConfig {
            worker_count: 2,
            ..Default::default()
        }
    }

    fn start_with(
        config: ThumbnailConfig,
        store: Arc<SqliteDb>,
        decoder: Arc<dyn Decoder>,
    ) -> (ThumbnailService, Receiver<ThumbnailEvent>) {
        ThumbnailService::start(config, store, decoder).unwrap()
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    fn next_terminal(events: &Receiver<ThumbnailEvent>) -> ThumbnailEvent {
        loop {
            let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
            if event.is_terminal() {
                return event;
            }
        }
    }

    #[test]
    fn test_concurrent_misses_share_one_decode() {
        let store = memory_store();
        let decoder = Arc::new(CountingDecoder::with_delay(Duration::from_millis(200)));
        let (service, _events) = start_with(config(), store.clone(), decoder.clone());
        let path = Path::new("/photos/shared.jpg");

        let service = &service;
        let results: Vec<Bitmap> = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(move || service.load_thumbnail(path, 120).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(decoder.calls(), 1);
        assert!(results.iter().all(|b| *b == results[0]));
        assert_eq!(results[0].height(), 120);
        assert_eq!(store.count_thumbnails().unwrap(), 1);
        assert_eq!(service.stats().generated, 1);
    }

    #[test]
    fn test_request_delivers_preview_then_full() {
        let decoder = Arc::new(CountingDecoder::new());
        let (service, events) = start_with(config(), memory_store(), decoder);
        let path = Path::new("/photos/a.jpg");

        let first = service.request(path, 120, RequestContext(7));
        assert_eq!(first, service.placeholder(PlaceholderKind::Loading, 120));

        let preview = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(preview, ThumbnailEvent::Preview { .. }));
        assert_eq!(preview.bitmap().height(), 60);
        assert_eq!(preview.context(), RequestContext(7));

        let full = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(full, ThumbnailEvent::Full { .. }));
        assert_eq!(full.bitmap().height(), 120);
        assert_eq!(full.key(), &CacheKey::new(path, 120));

        // Now a memory hit, no further events
        assert_eq!(&service.get_thumbnail(path, 120), full.bitmap());
        assert!(events.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_persisted_thumbnail_survives_restart() {
        let store = memory_store();
        let path = Path::new("/photos/a.jpg");

        let (service, _events) = start_with(config(), store.clone(), Arc::new(CountingDecoder::new()));
        let original = service.load_thumbnail(path, 100).unwrap();
        service.shutdown();

        let decoder = Arc::new(CountingDecoder::new());
        let (service, _events) = start_with(config(), store, decoder.clone());
        let reloaded = service.get_thumbnail(path, 100);

        assert_eq!(reloaded, original);
        assert_eq!(decoder.calls(), 0);
        assert_eq!(service.stats().l2_hits, 1);
    }

    #[test]
    fn test_repeat_request_after_eviction_is_identical() {
        let config = ThumbnailConfig {
            l1_capacity: 1,
            ..config()
        };
        let decoder = Arc::new(CountingDecoder::new());
        let (service, _events) = start_with(config, memory_store(), decoder.clone());
        let a = Path::new("/photos/a.jpg");
        let b = Path::new("/photos/b.jpg");

        let first = service.load_thumbnail(a, 80).unwrap();
        service.load_thumbnail(b, 80).unwrap();
        let again = service.load_thumbnail(a, 80).unwrap();

        assert_eq!(first, again);
        assert_eq!(decoder.calls(), 2);
        assert_eq!(service.stats().l2_hits, 1);
    }

    #[test]
    fn test_hanging_decode_times_out() {
        let config = ThumbnailConfig {
            decode_timeout_secs: 0.2,
            ..config()
        };
        let store = memory_store();
        let (service, events) = start_with(config, store.clone(), Arc::new(HangingDecoder));
        let path = Path::new("/photos/slow.jpg");

        let started = Instant::now();
        let err = service.load_thumbnail(path, 120).unwrap_err();
        assert!(matches!(err, ThumbnailError::Decode(DecodeError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(2));

        service.request(path, 120, RequestContext(1));
        match next_terminal(&events) {
            ThumbnailEvent::Failed {
                error, placeholder, ..
            } => {
                assert_eq!(error, DecodeErrorKind::Timeout);
                assert_eq!(placeholder, service.placeholder(PlaceholderKind::Unavailable, 120));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(store.count_thumbnails().unwrap(), 0);
    }

    #[test]
    fn test_failures_are_not_cached() {
        let store = memory_store();
        let decoder = Arc::new(FailingDecoder::new(DecodeErrorKind::Corrupt));
        let (service, _events) = start_with(config(), store.clone(), decoder.clone());
        let path = Path::new("/photos/broken.jpg");

        for _ in 0..2 {
            let err = service.load_thumbnail(path, 100).unwrap_err();
            assert!(matches!(err, ThumbnailError::Decode(DecodeError::Corrupt { .. })));
        }

        assert_eq!(decoder.calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.count_thumbnails().unwrap(), 0);
        assert_eq!(service.stats().failures, 2);
    }

    #[test]
    fn test_missing_source_gets_missing_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let (service, events) = start_with(config(), memory_store(), Arc::new(StandardDecoder));
        let path = dir.path().join("gone.jpg");

        service.request(&path, 100, RequestContext(3));
        match next_terminal(&events) {
            ThumbnailEvent::Failed {
                error,
                placeholder,
                context,
                ..
            } => {
                assert_eq!(error, DecodeErrorKind::NotFound);
                assert_eq!(context, RequestContext(3));
                assert_eq!(placeholder, service.placeholder(PlaceholderKind::Missing, 100));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_real_file_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "real.png", 300, 200);
        let store = memory_store();
        let (service, _events) = start_with(config(), store.clone(), Arc::new(StandardDecoder));

        let bitmap = service.load_thumbnail(&path, 100).unwrap();
        assert_eq!((bitmap.width(), bitmap.height()), (150, 100));

        let record = service.record_metadata(&path).unwrap();
        assert_eq!((record.width, record.height), (Some(300), Some(200)));
        assert_eq!(record.filename, "real.png");
        assert_eq!(store.get_photo(&record.path).unwrap(), Some(record));
    }

    #[test]
    fn test_stale_result_is_cached_but_not_delivered() {
        let store = memory_store();
        let decoder = Arc::new(GatedDecoder::new());
        let (service, events) = start_with(config(), store.clone(), decoder.clone());
        let path = Path::new("/photos/a.jpg");

        service.request(path, 100, RequestContext(1));
        assert!(wait_until(|| decoder.calls() == 1));

        service.bump_reload_token();
        decoder.open();

        assert!(wait_until(|| service.stats().stale_discards == 1));
        assert_eq!(store.count_thumbnails().unwrap(), 1);
        assert!(events.recv_timeout(Duration::from_millis(100)).is_err());

        let cached = service.get_thumbnail(path, 100);
        assert_ne!(cached, service.placeholder(PlaceholderKind::Loading, 100));
        assert_eq!(decoder.calls(), 1);
    }

    #[test]
    fn test_superseded_queued_task_is_skipped() {
        let config = ThumbnailConfig {
            worker_count: 1,
            ..config()
        };
        let decoder = Arc::new(GatedDecoder::new());
        let (service, events) = start_with(config, memory_store(), decoder.clone());
        let a = Path::new("/photos/a.jpg");
        let b = Path::new("/photos/b.jpg");

        service.request(a, 100, RequestContext(1));
        assert!(wait_until(|| decoder.calls() == 1));
        service.request(b, 100, RequestContext(2));

        service.bump_reload_token();
        decoder.open();

        assert!(wait_until(|| service.stats().skipped == 1));
        assert!(wait_until(|| service.stats().stale_discards == 2));
        assert_eq!(decoder.calls(), 1);

        // Asked for again under the new token, it is generated normally
        service.request(b, 100, RequestContext(2));
        let event = next_terminal(&events);
        assert!(matches!(event, ThumbnailEvent::Full { .. }));
        assert_eq!(event.key(), &CacheKey::new(b, 100));
        assert_eq!(event.token(), service.reload_token());
        assert_eq!(decoder.calls(), 2);
    }

    #[test]
    fn test_prefetch_warms_neighbours_quietly() {
        let config = ThumbnailConfig {
            prefetch_radius: 2,
            ..config()
        };
        let decoder = Arc::new(CountingDecoder::new());
        let (service, events) = start_with(config, memory_store(), decoder.clone());
        let paths: Vec<PathBuf> = (0..10)
            .map(|i| PathBuf::from(format!("/photos/{}.jpg", i)))
            .collect();

        assert_eq!(service.prefetch(&paths, 5, 80), 4);
        assert!(wait_until(|| service.stats().generated == 4));

        let seen = decoder.seen.lock().unwrap().clone();
        for i in [3, 4, 6, 7] {
            assert!(seen.contains(&paths[i]));
        }
        assert!(!seen.contains(&paths[5]));
        assert!(events.recv_timeout(Duration::from_millis(100)).is_err());

        // Already warm, nothing new to queue
        assert_eq!(service.prefetch(&paths, 5, 80), 0);
        assert_eq!(service.prefetch(&[], 0, 80), 0);
        // Clamped to the last item; only index 8 is still cold
        assert_eq!(service.prefetch(&paths, 99, 80), 1);
    }

    #[test]
    fn test_invalidate_during_write_through_leaves_nothing_cached() {
        let store = Arc::new(ScriptedStore::gated());
        let (service, events) =
            ThumbnailService::start(config(), store.clone(), Arc::new(CountingDecoder::new())).unwrap();
        let path = Path::new("/photos/a.jpg");

        service.request(path, 100, RequestContext(1));
        // Dispatcher is now parked inside the blob write
        assert!(wait_until(|| store.puts() == 1));

        let removed = thread::scope(|scope| {
            let invalidation = scope.spawn(|| service.invalidate(path).unwrap());
            thread::sleep(Duration::from_millis(50));
            store.open();
            invalidation.join().unwrap()
        });

        assert!(matches!(next_terminal(&events), ThumbnailEvent::Full { .. }));
        assert_eq!(removed, Removed { memory: 1, persisted: 1 });
        assert_eq!(store.count_thumbnails().unwrap(), 0);
        assert_eq!(service.stats().memory_entries, 0);
    }

    #[test]
    fn test_persist_failure_still_serves_from_memory() {
        let store = Arc::new(ScriptedStore::failing_puts());
        let decoder = Arc::new(CountingDecoder::new());
        let (service, events) =
            ThumbnailService::start(config(), store.clone(), decoder.clone()).unwrap();
        let path = Path::new("/photos/a.jpg");

        service.request(path, 100, RequestContext(1));
        let full = next_terminal(&events);
        assert!(matches!(full, ThumbnailEvent::Full { .. }));
        assert_eq!(service.stats().l2_write_errors, 1);
        assert_eq!(store.count_thumbnails().unwrap(), 0);

        let again = service.request(path, 100, RequestContext(2));
        assert_eq!(&again, full.bitmap());
        assert_eq!(service.stats().l1_hits, 1);
        assert_eq!(decoder.calls(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_invalidate_deleted_file_behind_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        fs::create_dir(&real).unwrap();
        std::os::unix::fs::symlink(&real, dir.path().join("link")).unwrap();
        let linked = write_png(&dir.path().join("link"), "a.png", 60, 40);

        let store = memory_store();
        let (service, _events) = start_with(config(), store.clone(), Arc::new(StandardDecoder));
        service.load_thumbnail(&linked, 32).unwrap();
        fs::remove_file(&linked).unwrap();

        let removed = service.invalidate(&linked).unwrap();
        assert_eq!(removed, Removed { memory: 1, persisted: 1 });
        assert_eq!(store.count_thumbnails().unwrap(), 0);
    }

    #[test]
    fn test_invalidate_forces_regeneration() {
        let store = memory_store();
        let decoder = Arc::new(CountingDecoder::new());
        let (service, _events) = start_with(config(), store.clone(), decoder.clone());
        let path = Path::new("/photos/a.jpg");

        service.load_thumbnail(path, 100).unwrap();
        service.load_thumbnail(path, 50).unwrap();

        let removed = service.invalidate(path).unwrap();
        assert_eq!(removed, Removed { memory: 2, persisted: 2 });
        assert_eq!(store.count_thumbnails().unwrap(), 0);

        service.load_thumbnail(path, 100).unwrap();
        assert_eq!(decoder.calls(), 3);
    }

    #[test]
    fn test_clear_all_by_scope() {
        let store = memory_store();
        let decoder = Arc::new(CountingDecoder::new());
        let (service, _events) = start_with(config(), store.clone(), decoder.clone());
        let x = Path::new("/trip/x.jpg");
        let y = Path::new("/home/y.jpg");

        service.load_thumbnail(x, 100).unwrap();
        service.load_thumbnail(y, 100).unwrap();

        let removed = service
            .clear_all(ClearScope::Directory(PathBuf::from("/trip")))
            .unwrap();
        assert_eq!(removed, Removed { memory: 1, persisted: 1 });
        assert_eq!(store.count_thumbnails().unwrap(), 1);

        service.clear_all(ClearScope::All).unwrap();
        assert_eq!(store.count_thumbnails().unwrap(), 0);
        assert_eq!(service.stats().memory_entries, 0);

        service.load_thumbnail(y, 100).unwrap();
        assert_eq!(decoder.calls(), 3);
    }

    #[test]
    fn test_zero_height_is_rejected() {
        let decoder = Arc::new(CountingDecoder::new());
        let (service, _events) = start_with(config(), memory_store(), decoder.clone());
        let path = Path::new("/photos/a.jpg");

        assert_eq!(service.get_thumbnail(path, 0).height(), 1);
        assert!(matches!(
            service.load_thumbnail(path, 0),
            Err(ThumbnailError::Decode(DecodeError::InvalidRequest(_)))
        ));
        assert_eq!(decoder.calls(), 0);
    }
}
