//! Background generation pool.
//!
//! Workers pull [`GenerationTask`]s from a two-level queue, decode and scale
//! through the decoder adapter, and report back over a channel. They only
//! read the persistent tier (prefetch lookups); the service's dispatcher
//! applies results.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::decoder::{decode_progressive, Decoder};
use super::key::source_fingerprint;
use super::persistent::{decode_blob, PersistentCache};
use super::{Bitmap, CacheKey};
use crate::error::DecodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Prefetch,
    Visible,
}

/// One unit of background work: generate `key` from `real_path`.
#[derive(Debug, Clone)]
pub struct GenerationTask {
    pub id: u64,
    pub key: CacheKey,
    /// Path as the consumer spelled it; decoding reads from here.
    pub real_path: PathBuf,
    pub priority: Priority,
    /// Consult the persistent tier before decoding (prefetch only; visible
    /// requests already missed it on the caller's thread).
    pub check_persistent: bool,
    /// Invalidation epoch at creation; results from an older epoch are not cached.
    pub epoch: u64,
}

impl GenerationTask {
    pub fn target_height(&self) -> u32 {
        self.key.height()
    }
}

/// Result of a task, as reported to the dispatcher.
#[derive(Debug)]
pub enum TaskOutcome {
    Generated {
        bitmap: Bitmap,
        /// Encoded blob for the persistent tier; `None` when encoding failed.
        encoded: Option<Vec<u8>>,
        fingerprint: String,
    },
    /// Found in the persistent tier, no decode needed.
    Persisted(Bitmap),
    Failed(DecodeError),
    /// Every interested consumer had moved on before decode started.
    Skipped,
    /// The pool shut down before the task ran.
    Abandoned,
}

#[derive(Debug)]
pub enum WorkerMessage {
    Preview {
        task_id: u64,
        key: CacheKey,
        bitmap: Bitmap,
    },
    Finished {
        task: GenerationTask,
        outcome: TaskOutcome,
    },
}

#[derive(Default)]
struct QueueState {
    visible: VecDeque<GenerationTask>,
    prefetch: VecDeque<GenerationTask>,
    closed: bool,
}

/// FIFO per priority; visible tasks always drain before prefetch tasks.
#[derive(Default)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue `task`; hands it back if the queue is closed.
    pub fn push(&self, task: GenerationTask) -> Result<(), GenerationTask> {
        let mut state = self.lock();
        if state.closed {
            return Err(task);
        }
        match task.priority {
            Priority::Visible => state.visible.push_back(task),
            Priority::Prefetch => state.prefetch.push_back(task),
        }
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    /// Block until a task is available; `None` once the queue is closed.
    pub fn pop(&self) -> Option<GenerationTask> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(task) = state.visible.pop_front().or_else(|| state.prefetch.pop_front()) {
                return Some(task);
            }
            state = self.ready.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Move a queued prefetch task for `key` to the back of the visible queue.
    pub fn promote(&self, key: &CacheKey) -> bool {
        let mut state = self.lock();
        let Some(pos) = state.prefetch.iter().position(|t| &t.key == key) else {
            return false;
        };
        if let Some(mut task) = state.prefetch.remove(pos) {
            task.priority = Priority::Visible;
            state.visible.push_back(task);
        }
        true
    }

    /// Close the queue and return every task that never started.
    pub fn close(&self) -> Vec<GenerationTask> {
        let mut state = self.lock();
        state.closed = true;
        let mut leftover: Vec<GenerationTask> = state.visible.drain(..).collect();
        leftover.extend(state.prefetch.drain(..));
        drop(state);
        self.ready.notify_all();
        leftover
    }

    pub fn len(&self) -> usize {
        let state = self.lock();
        state.visible.len() + state.prefetch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Answers whether nobody is waiting for a task's result any more.
pub type StalenessCheck = Arc<dyn Fn(&GenerationTask) -> bool + Send + Sync>;

/// What a worker needs to do its job; all of it is read-only.
#[derive(Clone)]
pub struct WorkerContext {
    pub decoder: Arc<dyn Decoder>,
    pub persistent: Arc<PersistentCache>,
    pub decode_timeout: Duration,
    pub preview_height: Arc<dyn Fn(u32) -> Option<u32> + Send + Sync>,
    pub is_stale: StalenessCheck,
}

pub struct WorkerPool {
    queue: Arc<TaskQueue>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        count: usize,
        queue: Arc<TaskQueue>,
        context: WorkerContext,
        results: mpsc::Sender<WorkerMessage>,
    ) -> std::io::Result<Self> {
        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            let worker_queue = Arc::clone(&queue);
            let context = context.clone();
            let results = results.clone();
            let spawned = thread::Builder::new()
                .name(format!("thumb-worker-{}", index))
                .spawn(move || run_worker(&worker_queue, &context, &results));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Release the workers already started
                    queue.close();
                    return Err(e);
                }
            }
        }

        tracing::debug!(workers = count, "Thumbnail worker pool started");
        Ok(Self { queue, handles })
    }

    /// Close the queue, wait for running tasks, and return tasks never started.
    pub fn shutdown(&mut self) -> Vec<GenerationTask> {
        let leftover = self.queue.close();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("Thumbnail worker panicked");
            }
        }
        leftover
    }
}

fn run_worker(queue: &TaskQueue, context: &WorkerContext, results: &mpsc::Sender<WorkerMessage>) {
    while let Some(task) = queue.pop() {
        let outcome = process(context, &task, results);
        if results.send(WorkerMessage::Finished { task, outcome }).is_err() {
            break;
        }
    }
}

fn process(
    context: &WorkerContext,
    task: &GenerationTask,
    results: &mpsc::Sender<WorkerMessage>,
) -> TaskOutcome {
    if (context.is_stale)(task) {
        return TaskOutcome::Skipped;
    }

    if task.check_persistent {
        match context.persistent.lookup(&task.key) {
            Ok(Some(bitmap)) => return TaskOutcome::Persisted(bitmap),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(key = %task.key, error = %e, "Persisted thumbnail lookup failed");
            }
        }
    }

    // A missing source surfaces as not_found from the decoder itself
    let fingerprint = source_fingerprint(&task.real_path).unwrap_or_default();

    tracing::debug!(key = %task.key, priority = ?task.priority, "Generating thumbnail");
    let target_height = task.target_height();
    let result = decode_progressive(
        &context.decoder,
        &task.real_path,
        target_height,
        (context.preview_height)(target_height),
        context.decode_timeout,
        |bitmap| {
            let _ = results.send(WorkerMessage::Preview {
                task_id: task.id,
                key: task.key.clone(),
                bitmap,
            });
        },
    );

    match result {
        Ok(bitmap) => canonicalize(context, task, bitmap, fingerprint),
        Err(e) => TaskOutcome::Failed(e),
    }
}

/// Encode for storage and hand out the bitmap decoded from those exact bytes,
/// so later persistent hits are pixel-identical to this result.
fn canonicalize(
    context: &WorkerContext,
    task: &GenerationTask,
    bitmap: Bitmap,
    fingerprint: String,
) -> TaskOutcome {
    let data = match context.persistent.encode(&bitmap) {
        Ok(data) => data,
        Err(e) => {
            tracing::warn!(key = %task.key, error = %e, "Thumbnail encoding failed, keeping it in memory only");
            return TaskOutcome::Generated {
                bitmap,
                encoded: None,
                fingerprint,
            };
        }
    };

    match decode_blob(&data) {
        Ok(canonical) => TaskOutcome::Generated {
            bitmap: canonical,
            encoded: Some(data),
            fingerprint,
        },
        Err(e) => {
            tracing::warn!(key = %task.key, error = %e, "Encoded thumbnail does not decode, not persisting");
            TaskOutcome::Generated {
                bitmap,
                encoded: None,
                fingerprint,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn task(id: u64, name: &str, priority: Priority) -> GenerationTask {
        let path = PathBuf::from(format!("/photos/{}", name));
        GenerationTask {
            id,
            key: CacheKey::new(&path, 100),
            real_path: path,
            priority,
            check_persistent: false,
            epoch: 0,
        }
    }

    #[test]
    fn test_visible_before_prefetch() {
        let queue = TaskQueue::new();
        queue.push(task(1, "a.jpg", Priority::Prefetch)).unwrap();
        queue.push(task(2, "b.jpg", Priority::Visible)).unwrap();
        queue.push(task(3, "c.jpg", Priority::Prefetch)).unwrap();
        queue.push(task(4, "d.jpg", Priority::Visible)).unwrap();

        let order: Vec<u64> = (0..4).filter_map(|_| queue.pop()).map(|t| t.id).collect();
        assert_eq!(order, vec![2, 4, 1, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_promote_moves_prefetch_task() {
        let queue = TaskQueue::new();
        queue.push(task(1, "a.jpg", Priority::Prefetch)).unwrap();
        queue.push(task(2, "b.jpg", Priority::Prefetch)).unwrap();

        let key = CacheKey::new(Path::new("/photos/b.jpg"), 100);
        assert!(queue.promote(&key));
        assert!(!queue.promote(&CacheKey::new(Path::new("/photos/zzz.jpg"), 100)));

        let first = queue.pop().unwrap();
        assert_eq!(first.id, 2);
        assert_eq!(first.priority, Priority::Visible);
    }

    #[test]
    fn test_close_returns_leftovers_and_wakes_workers() {
        let queue = Arc::new(TaskQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };

        // Give the waiter a moment to block on the empty queue
        thread::sleep(Duration::from_millis(50));
        assert!(queue.close().is_empty());
        assert!(waiter.join().unwrap().is_none());

        let queue = TaskQueue::new();
        queue.push(task(1, "a.jpg", Priority::Visible)).unwrap();
        queue.push(task(2, "b.jpg", Priority::Prefetch)).unwrap();
        let leftover = queue.close();
        assert_eq!(leftover.len(), 2);
        assert!(queue.push(task(3, "c.jpg", Priority::Visible)).is_err());
        assert!(queue.pop().is_none());
    }
}
