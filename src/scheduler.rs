//! Best-effort periodic work.
//!
//! A mobile host maps [`BackgroundScheduler`] onto its OS background task
//! API. Hosts without one use [`IntervalScheduler`], and tests use
//! [`ManualScheduler`] to fire jobs by hand. Nothing may rely on a job
//! actually running.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type BackgroundJob = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// Identifier the sync job registers under.
pub const BACKGROUND_SYNC_TASK_ID: &str = "com.mendmyi.repairminder.sync";

pub trait BackgroundScheduler: Send + Sync {
    /// Run `job` roughly every `every`, best-effort.
    fn run_periodically(&self, id: &str, every: Duration, job: BackgroundJob);
}

/// Tokio interval per job, stopped by a shared cancellation token.
pub struct IntervalScheduler {
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl IntervalScheduler {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
        if let Ok(mut handles) = self.handles.lock() {
            for handle in handles.drain(..) {
                handle.abort();
            }
        }
    }
}

impl BackgroundScheduler for IntervalScheduler {
    fn run_periodically(&self, id: &str, every: Duration, job: BackgroundJob) {
        let cancel = self.cancel.clone();
        let id = id.to_string();
        let handle = tokio::spawn(async move {
            info!(task = %id, "Background task scheduled (every {}s)", every.as_secs());
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // first tick completes immediately; the job is for later wakes
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        debug!(task = %id, "background task firing");
                        job().await;
                    }
                }
            }
            info!(task = %id, "Background task stopped");
        });
        if let Ok(mut handles) = self.handles.lock() {
            handles.push(handle);
        }
    }
}

/// Records jobs and runs them only when told to.
#[derive(Default)]
pub struct ManualScheduler {
    jobs: Mutex<Vec<(String, Duration, BackgroundJob)>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registered(&self) -> Vec<(String, Duration)> {
        self.jobs
            .lock()
            .map(|jobs| jobs.iter().map(|(id, every, _)| (id.clone(), *every)).collect())
            .unwrap_or_default()
    }

    /// Run every registered job once, in registration order.
    pub async fn fire(&self) {
        let jobs: Vec<BackgroundJob> = match self.jobs.lock() {
            Ok(jobs) => jobs.iter().map(|(_, _, job)| job.clone()).collect(),
            Err(_) => return,
        };
        for job in jobs {
            job().await;
        }
    }
}

impl BackgroundScheduler for ManualScheduler {
    fn run_periodically(&self, id: &str, every: Duration, job: BackgroundJob) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.push((id.to_string(), every, job));
        }
    }
}
