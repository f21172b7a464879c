//! Dispatch: resolves the target printer, creates jobs and runs them.
//!
//! Jobs for the same printer run strictly one after another in submission
//! order; jobs for different printers run concurrently. Each job is one
//! attempt: a failed send marks the job failed and is never retried.

use crate::errors::{BridgeError, DispatchError, SendError};
use crate::events::{BridgeEvent, EventBus};
use crate::registry::PrinterRegistry;
use crate::status::JobStatus;
use crate::transport::TransportSession;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Jobs kept for `job()` / `recent_jobs()` lookups
pub const JOB_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct PrintJob {
    pub id: String,
    pub printer_id: String,
    #[serde(skip)]
    pub payload: Arc<[u8]>,
    pub payload_size: usize,
    pub submitted_at: DateTime<Utc>,
    #[serde(flatten)]
    pub status: JobStatus,
    /// Always zero: jobs are attempted once
    pub retry_count: u32,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PrintJob {
    fn new(printer_id: &str, payload: Arc<[u8]>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            printer_id: printer_id.to_string(),
            payload_size: payload.len(),
            payload,
            submitted_at: Utc::now(),
            status: JobStatus::Pending,
            retry_count: 0,
            finished_at: None,
        }
    }

    /// Move forward to `next`; backward or post-terminal moves are ignored.
    fn advance(&mut self, next: JobStatus) -> bool {
        if !self.status.can_advance_to(&next) {
            warn!(
                "Ignoring job {} transition {} → {}",
                self.id,
                self.status.as_str(),
                next.as_str()
            );
            return false;
        }
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        self.status = next;
        true
    }
}

/// Returned by `send`. Dropping it abandons the wait, not the job.
#[derive(Debug)]
pub struct JobHandle {
    job_id: String,
    printer_id: String,
    task: JoinHandle<PrintJob>,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.job_id
    }

    pub fn printer_id(&self) -> &str {
        &self.printer_id
    }

    /// Wait for the job to reach a terminal status.
    pub async fn wait(self) -> Result<PrintJob, BridgeError> {
        self.task
            .await
            .map_err(|e| BridgeError::Other(anyhow::anyhow!("print job task failed: {}", e)))
    }
}

struct DispatcherInner {
    registry: Arc<PrinterRegistry>,
    events: Arc<EventBus>,
    jobs: Mutex<VecDeque<PrintJob>>,
    /// Completion signal of the most recently submitted job per printer,
    /// tagged with that job's sequence number. Removed once the printer's
    /// queue drains.
    tails: Mutex<HashMap<String, (u64, oneshot::Receiver<()>)>>,
    next_seq: AtomicU64,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(registry: Arc<PrinterRegistry>, events: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                registry,
                events,
                jobs: Mutex::new(VecDeque::new()),
                tails: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Submit a payload to `printer_id`, or to the active printer when none
    /// is given. Fails synchronously when there is no target or the target
    /// is not connected; otherwise the job is queued and its handle returned.
    pub fn send(
        &self,
        payload: impl Into<Arc<[u8]>>,
        printer_id: Option<&str>,
    ) -> Result<JobHandle, DispatchError> {
        let target = match printer_id {
            Some(id) => id.to_string(),
            None => self.inner.registry.active().ok_or(DispatchError::NoTarget)?,
        };

        let session = self
            .inner
            .registry
            .session(&target)
            .ok_or_else(|| DispatchError::NotConnected(target.clone()))?;

        let job = PrintJob::new(&target, payload.into());
        let job_id = job.id.clone();
        debug!(
            "Job {} queued for {} ({} bytes)",
            job_id, target, job.payload_size
        );

        self.inner.remember(job.clone());
        self.inner.events.emit(BridgeEvent::JobUpdated { job: job.clone() });

        // Chain behind the previous job for this printer
        let (done_tx, done_rx) = oneshot::channel();
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .inner
            .tails
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(target.clone(), (seq, done_rx));

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            if let Some((_, previous)) = previous {
                // Err means the previous job's task ended without signalling
                let _ = previous.await;
            }
            let finished = inner.run(job, session).await;
            let _ = done_tx.send(());
            inner.release_tail(&finished.printer_id, seq);
            finished
        });

        Ok(JobHandle {
            job_id,
            printer_id: target,
            task,
        })
    }

    /// Submit and wait for the terminal status.
    pub async fn send_and_wait(
        &self,
        payload: impl Into<Arc<[u8]>>,
        printer_id: Option<&str>,
    ) -> Result<PrintJob, BridgeError> {
        self.send(payload, printer_id)?.wait().await
    }

    pub fn job(&self, id: &str) -> Option<PrintJob> {
        self.inner
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|job| job.id == id)
            .cloned()
    }

    /// Most recent jobs first.
    pub fn recent_jobs(&self, limit: usize) -> Vec<PrintJob> {
        self.inner
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }
}

impl DispatcherInner {
    /// Drop the printer's tail if no later job has chained behind `seq`.
    fn release_tail(&self, printer_id: &str, seq: u64) {
        let mut tails = self.tails.lock().unwrap_or_else(PoisonError::into_inner);
        if tails.get(printer_id).is_some_and(|(tail, _)| *tail == seq) {
            tails.remove(printer_id);
        }
    }

    #[cfg(test)]
    fn pending_printers(&self) -> usize {
        self.tails.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn remember(&self, job: PrintJob) {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        jobs.push_back(job);
        while jobs.len() > JOB_HISTORY_LIMIT {
            // Evict the oldest finished job; fall back to the oldest overall
            match jobs.iter().position(|j| j.status.is_terminal()) {
                Some(index) => {
                    jobs.remove(index);
                }
                None => {
                    jobs.pop_front();
                }
            }
        }
    }

    fn record(&self, job: &PrintJob) {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(stored) = jobs.iter_mut().find(|j| j.id == job.id) {
            *stored = job.clone();
        }
    }

    async fn run(&self, mut job: PrintJob, session: Arc<TransportSession>) -> PrintJob {
        let result = {
            let mut transport = session.transport().lock().await;

            if job.advance(JobStatus::Sending) {
                self.record(&job);
                self.events.emit(BridgeEvent::JobUpdated { job: job.clone() });
            }

            transport.send(&job.payload).await
        };

        match result {
            Ok(()) => {
                info!("Job {} completed on {}", job.id, job.printer_id);
                job.advance(JobStatus::Completed);
                self.record(&job);
                self.events.emit(BridgeEvent::JobCompleted { job: job.clone() });
            }
            Err(e) => {
                warn!("Job {} failed on {}: {}", job.id, job.printer_id, e);
                if e == SendError::NotConnected {
                    self.registry.mark_lost(&job.printer_id, &session).await;
                }
                job.advance(JobStatus::Failed(e.to_string()));
                self.record(&job);
                self.events.emit(BridgeEvent::JobFailed { job: job.clone() });
            }
        }

        job
    }
}
