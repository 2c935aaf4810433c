//! Hydration worker pool.
//!
//! Content fetches are network-bound and must stay off the synchronous
//! notification path. A small fixed pool of workers drains an unbounded
//! queue; shutdown closes the queue and lets in-flight and queued jobs
//! finish before the threads join.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

use veil_config::HydrationConfig;
use veil_journal::ContentId;

use crate::platform::PlatformLayer;
use crate::store::ContentStore;

/// Cap on pool size; hydration competes with the user's own workload.
pub const MAX_HYDRATION_THREADS: usize = 4;

const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Default thread count: min(cpu_cores / 2, MAX_HYDRATION_THREADS)
pub fn default_thread_count() -> usize {
    (num_cpus::get() / 2).clamp(1, MAX_HYDRATION_THREADS)
}

/// One deferred materialization.
#[derive(Debug, Clone)]
pub struct HydrationJob {
    pub relative_path: String,
    pub content_id: ContentId,
}

pub struct HydrationPool {
    tx: Option<Sender<HydrationJob>>,
    workers: Vec<JoinHandle<()>>,
}

impl HydrationPool {
    pub fn start(
        store: Arc<dyn ContentStore>,
        platform: Arc<dyn PlatformLayer>,
        config: &HydrationConfig,
    ) -> Self {
        let threads = config.threads.unwrap_or_else(default_thread_count);
        let (tx, rx) = unbounded::<HydrationJob>();

        let workers = (0..threads)
            .map(|i| {
                let rx: Receiver<HydrationJob> = rx.clone();
                let store = store.clone();
                let platform = platform.clone();
                let max_retries = config.max_retries;
                thread::Builder::new()
                    .name(format!("veil-hydrate-{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            hydrate_one(&*store, &*platform, &job, max_retries);
                        }
                    })
                    .expect("failed to spawn hydration worker")
            })
            .collect();

        info!(threads, "hydration pool started");
        Self {
            tx: Some(tx),
            workers,
        }
    }

    pub fn submit(&self, job: HydrationJob) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(job);
        }
    }

    pub fn queued(&self) -> usize {
        self.tx.as_ref().map(|tx| tx.len()).unwrap_or(0)
    }

    /// Close the queue and join the workers. Queued jobs are completed,
    /// not dropped.
    pub fn shutdown(&mut self) {
        self.tx = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        debug!("hydration pool stopped");
    }
}

impl Drop for HydrationPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn hydrate_one(
    store: &dyn ContentStore,
    platform: &dyn PlatformLayer,
    job: &HydrationJob,
    max_retries: u32,
) {
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        match store.fetch(&job.content_id) {
            Ok(bytes) => {
                match platform.write_file_contents(&job.relative_path, &bytes) {
                    Ok(()) => debug!(
                        path = job.relative_path.as_str(),
                        size = bytes.len(),
                        "placeholder hydrated"
                    ),
                    Err(e) => warn!(
                        path = job.relative_path.as_str(),
                        error = %e,
                        "failed to write hydrated content"
                    ),
                }
                return;
            }
            Err(e) if e.is_retryable() && attempts <= max_retries => {
                debug!(
                    path = job.relative_path.as_str(),
                    attempt = attempts,
                    error = %e,
                    "transient store failure, retrying"
                );
                thread::sleep(RETRY_BACKOFF);
            }
            Err(e) => {
                warn!(
                    path = job.relative_path.as_str(),
                    content_id = %job.content_id,
                    error = %e,
                    "hydration failed"
                );
                return;
            }
        }
    }
}
