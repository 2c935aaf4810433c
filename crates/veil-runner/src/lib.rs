//! # veil-runner
//!
//! The single consumer of the durable task journal. A dedicated worker
//! thread blocks until work is signalled, takes the repository-wide lock,
//! drains the journal through a caller-supplied handler, runs a
//! post-processing callback, and releases the lock only once the journal
//! is empty again.
//!
//! State machine: `Idle -> AcquiringLock -> Draining -> PostProcessing ->
//! Idle`, with shutdown observable from every state. Tasks left undrained
//! at shutdown stay in the journal and are picked up on the next start.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, error, info, warn};

use veil_config::{log_runner_info, log_runner_warn, RunnerConfig};
use veil_journal::{FileSystemTask, TaskJournal};
use veil_lock::RepoLock;

/// Handler verdict for one task or one post-processing pass.
///
/// `Fatal` deliberately terminates the process: continuing past a task the
/// handler cannot safely complete risks committing a wrong decision to the
/// durable stores, and journal replay makes a restart cheap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    Retryable,
    Fatal,
}

/// Caller-supplied task execution and completion callbacks.
pub trait TaskHandler: Send + 'static {
    fn execute(&mut self, task: &FileSystemTask) -> TaskOutcome;

    /// Runs after the journal is drained, before the lock is released.
    fn post_process(&mut self) -> TaskOutcome {
        TaskOutcome::Success
    }
}

enum Wake {
    Work,
    Stop,
}

#[derive(PartialEq)]
enum Flow {
    Continue,
    Stop,
}

struct WorkerShared {
    journal: Arc<TaskJournal>,
    lock: Arc<dyn RepoLock>,
    shutdown: Arc<AtomicBool>,
    config: RunnerConfig,
}

/// Owns the background worker thread.
pub struct BackgroundRunner {
    journal: Arc<TaskJournal>,
    wake_tx: Sender<Wake>,
    shutdown: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundRunner {
    /// Spawn the worker. A non-empty journal (backlog from a previous run)
    /// wakes it immediately.
    pub fn start<H: TaskHandler>(
        journal: Arc<TaskJournal>,
        lock: Arc<dyn RepoLock>,
        handler: H,
        config: RunnerConfig,
    ) -> Self {
        let (wake_tx, wake_rx) = unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));

        if !journal.is_empty() {
            let _ = wake_tx.send(Wake::Work);
        }

        let shared = WorkerShared {
            journal: journal.clone(),
            lock,
            shutdown: shutdown.clone(),
            config,
        };
        let worker = thread::Builder::new()
            .name("veil-runner".to_string())
            .spawn(move || run(shared, wake_rx, handler))
            .expect("failed to spawn background runner thread");

        Self {
            journal,
            wake_tx,
            shutdown,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Durably enqueue a task and wake the worker.
    pub fn enqueue(&self, task: &FileSystemTask) -> veil_journal::Result<()> {
        self.journal.enqueue(task)?;
        let _ = self.wake_tx.send(Wake::Work);
        Ok(())
    }

    pub fn journal(&self) -> &Arc<TaskJournal> {
        &self.journal
    }

    /// Request shutdown and join the worker. The current task is finished,
    /// not aborted; everything behind it stays durable in the journal.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.wake_tx.send(Wake::Stop);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
            log_runner_info!("Background runner stopped");
        }
    }
}

impl Drop for BackgroundRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<H: TaskHandler>(shared: WorkerShared, wake_rx: Receiver<Wake>, mut handler: H) {
    log_runner_info!("Background runner started");
    loop {
        // Idle: the only indefinite wait in the pipeline.
        match wake_rx.recv() {
            Ok(Wake::Work) => {}
            Ok(Wake::Stop) | Err(_) => break,
        }
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }
        if shared.journal.is_empty() {
            // Stale wake signal; the work was already drained.
            continue;
        }

        if !acquire_lock(&shared) {
            break;
        }
        debug!(backlog = shared.journal.len(), "repository lock acquired");

        let mut stop = false;
        loop {
            if drain(&shared, &mut handler) == Flow::Stop {
                stop = true;
                break;
            }
            if post_process(&shared, &mut handler) == Flow::Stop {
                stop = true;
                break;
            }
            if shared.journal.is_empty() {
                break;
            }
            // Work arrived during post-processing: drain again rather
            // than release and immediately re-acquire.
        }
        shared.lock.release();
        if stop {
            break;
        }
        debug!("queue empty, repository lock released");
    }

    if !shared.journal.is_empty() {
        info!(
            remaining = shared.journal.len(),
            "runner exiting with tasks still durable in the journal"
        );
    }
}

/// Retry the repository lock with a fixed backoff until held or shutdown.
fn acquire_lock(shared: &WorkerShared) -> bool {
    let backoff = Duration::from_millis(shared.config.lock_backoff_ms);
    let mut failures: u32 = 0;
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            return false;
        }
        if shared.lock.try_acquire() {
            if failures > 0 {
                debug!(attempts = failures + 1, "repository lock acquired after contention");
            }
            return true;
        }
        failures += 1;
        if failures % shared.config.lock_warn_threshold == 0 {
            log_runner_warn!("Still waiting for repository lock", attempts = failures);
        }
        thread::sleep(backoff);
    }
}

fn drain<H: TaskHandler>(shared: &WorkerShared, handler: &mut H) -> Flow {
    let retry_interval = Duration::from_millis(shared.config.retry_interval_ms);
    let mut processed: u64 = 0;
    let mut consecutive_retries: u32 = 0;
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            info!(
                remaining = shared.journal.len(),
                "shutdown requested mid-drain, remaining tasks stay durable"
            );
            return Flow::Stop;
        }
        let Some(task) = shared.journal.try_peek() else {
            return Flow::Continue;
        };
        match handler.execute(&task) {
            TaskOutcome::Success => {
                consecutive_retries = 0;
                if let Err(e) = shared.journal.dequeue(&task) {
                    error!(task = %task, error = %e, "task journal diverged from runner, terminating");
                    std::process::exit(1);
                }
                processed += 1;
                if processed % shared.config.progress_interval == 0 {
                    log_runner_info!(
                        "Background task progress",
                        processed = processed,
                        remaining = shared.journal.len()
                    );
                }
            }
            TaskOutcome::Retryable => {
                consecutive_retries += 1;
                if consecutive_retries % shared.config.retry_warn_threshold == 0 {
                    warn!(
                        task = %task,
                        attempts = consecutive_retries,
                        "task still failing with retryable errors"
                    );
                }
                thread::sleep(retry_interval);
            }
            TaskOutcome::Fatal => {
                error!(task = %task, "task handler reported a fatal error, terminating");
                std::process::exit(1);
            }
        }
    }
}

fn post_process<H: TaskHandler>(shared: &WorkerShared, handler: &mut H) -> Flow {
    let retry_interval = Duration::from_millis(shared.config.retry_interval_ms);
    let mut consecutive_retries: u32 = 0;
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            return Flow::Stop;
        }
        match handler.post_process() {
            TaskOutcome::Success => return Flow::Continue,
            TaskOutcome::Retryable => {
                consecutive_retries += 1;
                if consecutive_retries % shared.config.retry_warn_threshold == 0 {
                    warn!(
                        attempts = consecutive_retries,
                        "post-processing still failing with retryable errors"
                    );
                }
                thread::sleep(retry_interval);
            }
            TaskOutcome::Fatal => {
                error!("post-processing reported a fatal error, terminating");
                std::process::exit(1);
            }
        }
    }
}
