use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{bounded, Sender};
use tracing::{debug, error, info};

use super::RenderContextToken;
use crate::config::WorkerConfig;
use crate::world::terrain::TerrainResult;

pub type BackgroundTask = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;
pub type UploadTask<C> = Box<dyn FnOnce(&mut C) -> anyhow::Result<()> + Send + 'static>;
pub type EmptyHandler = Box<dyn FnOnce() + Send + 'static>;

enum Job {
    Run(BackgroundTask),
    Barrier(Sender<()>),
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    executed: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

/// Task counts for one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub executed: u64,
    pub failed: u64,
    pub discarded: u64,
}

/// Run a task, logging errors and panics instead of propagating them
fn run_guarded<F>(queue: &str, task: F, counters: &Counters)
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(task)) {
        Ok(Ok(())) => {
            counters.executed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Err(e)) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            error!("{} task failed: {:#}", queue, e);
        }
        Err(payload) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            error!("{} task panicked: {}", queue, panic_message(payload.as_ref()));
        }
    }
}

fn run_handler(queue: &str, handler: EmptyHandler) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(handler)) {
        error!("{} queue empty handler panicked: {}", queue, panic_message(payload.as_ref()));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

// =============================================================================
// Background queue
// =============================================================================

struct BackgroundState {
    queue: VecDeque<Job>,
    running: bool,
    cancelled: bool,
    shutdown: bool,
    worker: Option<ThreadId>,
    worker_alive: bool,
    empty_handler: Option<EmptyHandler>,
}

struct BackgroundShared {
    state: Mutex<BackgroundState>,
    wake: Condvar,
    counters: Counters,
}

impl BackgroundShared {
    fn lock(&self) -> MutexGuard<'_, BackgroundState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drop every queued task, keeping barriers so concurrent cancels still wake up
fn discard_tasks(queue: &mut VecDeque<Job>) -> u64 {
    let before = queue.len();
    queue.retain(|job| matches!(job, Job::Barrier(_)));
    (before - queue.len()) as u64
}

/// FIFO queue served by the dedicated worker thread
///
/// Cloning gives another submission handle to the same queue.
#[derive(Clone)]
pub struct BackgroundQueue {
    shared: Arc<BackgroundShared>,
}

impl BackgroundQueue {
    fn new() -> Self {
        Self {
            shared: Arc::new(BackgroundShared {
                state: Mutex::new(BackgroundState {
                    queue: VecDeque::new(),
                    running: false,
                    cancelled: false,
                    shutdown: false,
                    worker: None,
                    worker_alive: true,
                    empty_handler: None,
                }),
                wake: Condvar::new(),
                counters: Counters::default(),
            }),
        }
    }

    /// Append a task and wake the worker. Returns `false` if the queue was
    /// cancelled or shut down, in which case the task is dropped unrun.
    pub fn add<F>(&self, task: F) -> bool
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let mut state = self.shared.lock();
        if state.cancelled || state.shutdown {
            self.shared.counters.discarded.fetch_add(1, Ordering::Relaxed);
            debug!("Dropping background task submitted after cancel");
            return false;
        }
        state.queue.push_back(Job::Run(Box::new(task)));
        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        drop(state);
        self.shared.wake.notify_one();
        true
    }

    /// Drop all queued tasks and block until the task in flight (if any) finishes
    ///
    /// Leaves the queue cancelled: later submissions are dropped until
    /// [`resume`](Self::resume). Must not be called from a background task.
    pub fn cancel(&self) {
        let (done_tx, done_rx) = bounded(1);
        {
            let mut state = self.shared.lock();
            debug_assert_ne!(
                state.worker,
                Some(thread::current().id()),
                "cancel() called from the background worker"
            );
            let dropped = discard_tasks(&mut state.queue);
            self.shared.counters.discarded.fetch_add(dropped, Ordering::Relaxed);
            state.cancelled = true;
            if !state.worker_alive {
                return;
            }
            state.queue.push_back(Job::Barrier(done_tx));
            debug!("Cancelled background queue, {} pending tasks dropped", dropped);
        }
        self.shared.wake.notify_one();
        // A disconnect means the worker exited, which also ends the wait
        let _ = done_rx.recv();
    }

    /// Drop all queued tasks without waiting and without entering the cancelled state
    pub fn clear(&self) -> u64 {
        let mut state = self.shared.lock();
        let dropped = discard_tasks(&mut state.queue);
        self.shared.counters.discarded.fetch_add(dropped, Ordering::Relaxed);
        dropped
    }

    /// Accept submissions again after a [`cancel`](Self::cancel)
    pub fn resume(&self) {
        self.shared.lock().cancelled = false;
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.lock().cancelled
    }

    /// Number of tasks waiting to run
    pub fn len(&self) -> usize {
        self.shared
            .lock()
            .queue
            .iter()
            .filter(|job| matches!(job, Job::Run(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nothing queued and nothing running
    pub fn is_idle(&self) -> bool {
        let state = self.shared.lock();
        state.queue.is_empty() && !state.running
    }

    /// Register a one-shot callback fired on the worker when the queue next
    /// runs dry after a task. Returns `false` if one is already registered.
    pub fn set_empty_handler<F>(&self, handler: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.lock();
        if state.empty_handler.is_some() {
            return false;
        }
        state.empty_handler = Some(Box::new(handler));
        true
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.counters.snapshot()
    }

    fn shutdown(&self) {
        let mut state = self.shared.lock();
        let dropped = discard_tasks(&mut state.queue);
        self.shared.counters.discarded.fetch_add(dropped, Ordering::Relaxed);
        state.shutdown = true;
        drop(state);
        self.shared.wake.notify_all();
    }
}

fn run_worker(shared: Arc<BackgroundShared>) {
    shared.lock().worker = Some(thread::current().id());
    debug!("Background worker started");

    loop {
        let job = {
            let mut state = shared.lock();
            loop {
                if let Some(job) = state.queue.pop_front() {
                    state.running = true;
                    break Some(job);
                }
                if state.shutdown {
                    break None;
                }
                state = shared.wake.wait(state).unwrap_or_else(PoisonError::into_inner);
            }
        };

        match job {
            None => break,
            Some(Job::Barrier(done)) => {
                shared.lock().running = false;
                let _ = done.send(());
            }
            Some(Job::Run(task)) => {
                run_guarded("background", task, &shared.counters);
                let handler = {
                    let mut state = shared.lock();
                    state.running = false;
                    if state.queue.is_empty() {
                        state.empty_handler.take()
                    } else {
                        None
                    }
                };
                if let Some(handler) = handler {
                    run_handler("background", handler);
                }
            }
        }
    }

    let mut state = shared.lock();
    state.worker_alive = false;
    // Release anyone still waiting on a barrier
    state.queue.clear();
    debug!("Background worker stopped");
}

// =============================================================================
// Upload queue
// =============================================================================

struct UploadState<C> {
    queue: VecDeque<UploadTask<C>>,
    owner: Option<ThreadId>,
    empty_handler: Option<EmptyHandler>,
}

struct UploadShared<C> {
    state: Mutex<UploadState<C>>,
    counters: Counters,
}

impl<C> UploadShared<C> {
    fn lock(&self) -> MutexGuard<'_, UploadState<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// FIFO queue of GPU-side work, drained by the render thread
///
/// Tasks receive the render-thread context `C` mutably. Anyone may submit;
/// only the holder of a [`RenderContextToken`] can run them.
pub struct UploadQueue<C> {
    shared: Arc<UploadShared<C>>,
}

impl<C> Clone for UploadQueue<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: 'static> Default for UploadQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: 'static> UploadQueue<C> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(UploadShared {
                state: Mutex::new(UploadState {
                    queue: VecDeque::new(),
                    owner: None,
                    empty_handler: None,
                }),
                counters: Counters::default(),
            }),
        }
    }

    pub fn add<F>(&self, task: F)
    where
        F: FnOnce(&mut C) -> anyhow::Result<()> + Send + 'static,
    {
        self.shared.lock().queue.push_back(Box::new(task));
        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Run the oldest upload task, if any. Returns whether a task ran.
    pub fn upload_one(&self, _token: &RenderContextToken, context: &mut C) -> bool {
        let task = {
            let mut state = self.shared.lock();
            let current = thread::current().id();
            match state.owner {
                None => state.owner = Some(current),
                Some(owner) => debug_assert_eq!(owner, current, "upload queue drained from a second thread"),
            }
            state.queue.pop_front()
        };
        let Some(task) = task else {
            return false;
        };

        run_guarded("upload", || task(context), &self.shared.counters);

        let handler = {
            let mut state = self.shared.lock();
            if state.queue.is_empty() {
                state.empty_handler.take()
            } else {
                None
            }
        };
        if let Some(handler) = handler {
            run_handler("upload", handler);
        }
        true
    }

    /// Run up to `max` upload tasks, returning how many ran
    pub fn drain(&self, token: &RenderContextToken, context: &mut C, max: usize) -> usize {
        let mut ran = 0;
        while ran < max && self.upload_one(token, context) {
            ran += 1;
        }
        ran
    }

    pub fn clear(&self) -> u64 {
        let mut state = self.shared.lock();
        let dropped = state.queue.len() as u64;
        state.queue.clear();
        self.shared.counters.discarded.fetch_add(dropped, Ordering::Relaxed);
        dropped
    }

    pub fn len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One-shot callback fired on the render thread when the queue runs dry
    pub fn set_empty_handler<F>(&self, handler: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.lock();
        if state.empty_handler.is_some() {
            return false;
        }
        state.empty_handler = Some(Box::new(handler));
        true
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.counters.snapshot()
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Background worker thread plus the render-thread upload queue
pub struct TaskScheduler<C: 'static> {
    background: BackgroundQueue,
    upload: UploadQueue<C>,
    worker: Option<JoinHandle<()>>,
}

impl<C: 'static> TaskScheduler<C> {
    pub fn new(config: &WorkerConfig) -> TerrainResult<Self> {
        let background = BackgroundQueue::new();
        let shared = Arc::clone(&background.shared);

        let mut builder = thread::Builder::new().name(config.thread_name.clone());
        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }
        let worker = builder.spawn(move || run_worker(shared))?;

        info!("Started task scheduler worker '{}'", config.thread_name);
        Ok(Self {
            background,
            upload: UploadQueue::new(),
            worker: Some(worker),
        })
    }

    pub fn background(&self) -> &BackgroundQueue {
        &self.background
    }

    pub fn upload(&self) -> &UploadQueue<C> {
        &self.upload
    }

    pub fn add<F>(&self, task: F) -> bool
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.background.add(task)
    }

    pub fn add_upload<F>(&self, task: F)
    where
        F: FnOnce(&mut C) -> anyhow::Result<()> + Send + 'static,
    {
        self.upload.add(task)
    }

    pub fn upload_one(&self, token: &RenderContextToken, context: &mut C) -> bool {
        self.upload.upload_one(token, context)
    }

    pub fn cancel(&self) {
        self.background.cancel()
    }

    pub fn clear(&self) -> u64 {
        self.background.clear()
    }

    /// Stop the worker after its current task and drop everything still queued
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.background.shutdown();
        let dropped = self.upload.clear();
        if worker.join().is_err() {
            error!("Background worker terminated abnormally");
        }
        info!("Task scheduler shut down ({} pending uploads dropped)", dropped);
    }
}

impl<C: 'static> Drop for TaskScheduler<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn scheduler() -> TaskScheduler<Vec<u32>> {
        TaskScheduler::new(&WorkerConfig::default()).unwrap()
    }

    fn wait_idle(queue: &BackgroundQueue) {
        let (tx, rx) = bounded(1);
        queue.add(move || {
            let _ = tx.send(());
            Ok(())
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_background_runs_in_fifo_order() {
        let scheduler = scheduler();
        let (tx, rx) = unbounded();
        for i in 0..10 {
            let tx = tx.clone();
            scheduler.add(move || {
                tx.send(i)?;
                Ok(())
            });
        }
        let order: Vec<i32> = (0..10).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        assert_eq!(order, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_failures_do_not_stop_the_worker() {
        let scheduler = scheduler();
        scheduler.add(|| Err(anyhow::anyhow!("data source unavailable")));
        scheduler.add(|| panic!("task blew up"));
        wait_idle(scheduler.background());

        let stats = scheduler.background().stats();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.executed, 1);
    }

    #[test]
    fn test_cancel_drops_queued_tasks_and_waits_for_running() {
        let scheduler = scheduler();
        let (started_tx, started_rx) = bounded(1);
        let (release_tx, release_rx) = bounded::<()>(1);
        let finished = Arc::new(AtomicUsize::new(0));
        let ran_after = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&finished);
        scheduler.add(move || {
            started_tx.send(())?;
            release_rx.recv()?;
            f.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        for _ in 0..5 {
            let r = Arc::clone(&ran_after);
            scheduler.add(move || {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let _ = release_tx.send(());
        });
        scheduler.cancel();
        releaser.join().unwrap();

        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(ran_after.load(Ordering::SeqCst), 0);
        assert!(scheduler.background().is_cancelled());
        assert!(!scheduler.add(|| Ok(())));

        scheduler.background().resume();
        wait_idle(scheduler.background());
        assert_eq!(ran_after.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_empty_handler_fires_once() {
        let scheduler = scheduler();
        let fired = Arc::new(AtomicUsize::new(0));
        let (gate_tx, gate_rx) = bounded::<()>(1);
        scheduler.add(move || {
            gate_rx.recv()?;
            Ok(())
        });
        scheduler.add(|| Ok(()));

        let f = Arc::clone(&fired);
        assert!(scheduler.background().set_empty_handler(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!scheduler.background().set_empty_handler(|| {}));
        gate_tx.send(()).unwrap();

        wait_idle(scheduler.background());
        wait_idle(scheduler.background());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_upload_queue_runs_on_render_thread_only_when_drained() {
        let scheduler = scheduler();
        let token = RenderContextToken::new();
        let mut uploaded = Vec::new();

        let upload = scheduler.upload().clone();
        let (tx, rx) = bounded(1);
        scheduler.add(move || {
            // Background work hands its result to the render thread
            upload.add(|out: &mut Vec<u32>| {
                out.push(1);
                Ok(())
            });
            upload.add(|out: &mut Vec<u32>| {
                out.push(2);
                Ok(())
            });
            tx.send(())?;
            Ok(())
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert!(uploaded.is_empty());
        assert!(scheduler.upload_one(&token, &mut uploaded));
        assert_eq!(uploaded, vec![1]);
        assert_eq!(scheduler.upload().drain(&token, &mut uploaded, 10), 1);
        assert_eq!(uploaded, vec![1, 2]);
        assert!(!scheduler.upload_one(&token, &mut uploaded));
    }

    #[test]
    fn test_shutdown_discards_pending_work() {
        let mut scheduler = scheduler();
        let (gate_tx, gate_rx) = bounded::<()>(1);
        let ran = Arc::new(AtomicUsize::new(0));
        scheduler.add(move || {
            let _ = gate_rx.recv_timeout(Duration::from_millis(100));
            Ok(())
        });
        for _ in 0..3 {
            let r = Arc::clone(&ran);
            scheduler.add(move || {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        scheduler.add_upload(|out| {
            out.push(9);
            Ok(())
        });
        scheduler.shutdown();
        drop(gate_tx);

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(scheduler.upload().is_empty());
        assert!(!scheduler.add(|| Ok(())));
        // Unlike a cancel, a shut-down queue stays closed
        scheduler.background().resume();
        assert!(!scheduler.add(|| Ok(())));
    }
}
