//! Keeps a job claim fresh from a dedicated thread.
//!
//! Stages may block the worker's runtime (CPU-bound clustering, synchronous
//! provider calls), so the heartbeat cannot share that runtime.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::analysis_db::{AnalysisDatabase, ClaimedJob};
use crate::error::{AnalysisError, AnalysisResult};

const STOP_CHECK: Duration = Duration::from_millis(25);

pub struct LockKeeper {
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl LockKeeper {
    /// Refresh `claim` every `period` until dropped. The receiver yields the
    /// error that ended the heartbeat, normally a lost claim.
    pub fn start(
        db: Arc<AnalysisDatabase>,
        claim: ClaimedJob,
        period: Duration,
    ) -> AnalysisResult<(Self, oneshot::Receiver<AnalysisError>)> {
        let running = Arc::new(AtomicBool::new(true));
        let running_clone = Arc::clone(&running);
        let (lost_tx, lost_rx) = oneshot::channel();

        let thread_handle = thread::Builder::new()
            .name(format!("heartbeat-{}", claim.job_id()))
            .spawn(move || {
                let mut last_beat = Instant::now();
                while running_clone.load(Ordering::Relaxed) {
                    thread::sleep(STOP_CHECK.min(period));
                    if last_beat.elapsed() < period || !running_clone.load(Ordering::Relaxed) {
                        continue;
                    }
                    last_beat = Instant::now();
                    if let Err(e) = db.jobs.heartbeat(&claim) {
                        warn!("Heartbeat for job {} stopped: {}", claim.job_id(), e);
                        let _ = lost_tx.send(e);
                        return;
                    }
                    debug!("Heartbeat for job {}", claim.job_id());
                }
            })
            .map_err(|e| AnalysisError::persistence(format!("Failed to start heartbeat thread: {}", e)))?;

        Ok((
            Self {
                running,
                thread_handle: Some(thread_handle),
            },
            lost_rx,
        ))
    }
}

impl Drop for LockKeeper {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}
