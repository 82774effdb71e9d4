//! Background job worker.
//!
//! HTTP handlers never run sync work inline; they enqueue a [`SyncJob`] and
//! return. A single consumer task applies jobs one at a time, so at most
//! one poll or bootstrap is active per process. Poll requests coalesce:
//! while a poll is queued and not yet started, further requests are
//! absorbed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::sync::{DocOutcome, Orchestrator};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncJob {
    Poll,
    Bootstrap,
    Reindex(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    /// A poll was already waiting; this request rides along with it.
    Coalesced,
}

/// Cloneable sender side used by the HTTP server.
#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::Sender<SyncJob>,
    poll_pending: Arc<AtomicBool>,
}

impl SyncHandle {
    /// Request a poll without waiting for queue space.
    pub fn request_poll(&self) -> Result<Enqueued> {
        if self.poll_pending.swap(true, Ordering::SeqCst) {
            return Ok(Enqueued::Coalesced);
        }
        match self.tx.try_send(SyncJob::Poll) {
            Ok(()) => Ok(Enqueued::Queued),
            Err(mpsc::error::TrySendError::Full(_)) => {
                // The backlog ends in a poll-equivalent run anyway.
                self.poll_pending.store(false, Ordering::SeqCst);
                Ok(Enqueued::Coalesced)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.poll_pending.store(false, Ordering::SeqCst);
                Err(anyhow!("sync worker is not running"))
            }
        }
    }

    /// Enqueue a job, waiting for queue space.
    pub async fn submit(&self, job: SyncJob) -> Result<()> {
        if job == SyncJob::Poll {
            return self.request_poll().map(|_| ());
        }
        self.tx
            .send(job)
            .await
            .map_err(|_| anyhow!("sync worker is not running"))
    }
}

/// Start the worker task. `poll_interval` adds periodic polls on top of
/// queued jobs.
pub fn spawn_worker(
    orchestrator: Arc<Orchestrator>,
    capacity: usize,
    poll_interval: Option<Duration>,
    cancel: CancellationToken,
) -> (SyncHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let poll_pending = Arc::new(AtomicBool::new(false));
    let handle = SyncHandle {
        tx,
        poll_pending: poll_pending.clone(),
    };

    let ticker = poll_interval.filter(|d| !d.is_zero()).map(|period| {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    let task = tokio::spawn(run(orchestrator, rx, poll_pending, ticker, cancel));
    (handle, task)
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn run(
    orchestrator: Arc<Orchestrator>,
    mut rx: mpsc::Receiver<SyncJob>,
    poll_pending: Arc<AtomicBool>,
    mut ticker: Option<Interval>,
    cancel: CancellationToken,
) {
    tracing::info!("sync worker started");
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
            _ = next_tick(&mut ticker) => SyncJob::Poll,
        };
        if job == SyncJob::Poll {
            poll_pending.store(false, Ordering::SeqCst);
        }
        run_job(&orchestrator, job, &cancel).await;
    }
    tracing::info!("sync worker stopped");
}

/// Execute one job, logging its outcome.
pub async fn run_job(orchestrator: &Orchestrator, job: SyncJob, cancel: &CancellationToken) {
    match job {
        SyncJob::Poll => match orchestrator.poll(cancel).await {
            Ok(report) => tracing::info!(
                seen = report.seen,
                indexed = report.indexed,
                failed = report.failed,
                deleted = report.deleted,
                cursor_advanced = report.cursor_advanced,
                "poll finished"
            ),
            Err(err) => tracing::error!(error = %err, "poll failed"),
        },
        SyncJob::Bootstrap => {
            if let Err(err) = orchestrator.bootstrap(cancel).await {
                tracing::error!(error = %err, "bootstrap failed");
            }
        }
        SyncJob::Reindex(id) => match orchestrator.reindex(&id).await {
            Ok(DocOutcome::Failed(reason)) => {
                tracing::warn!(document_id = %id, %reason, "re-index recorded a failure")
            }
            Ok(outcome) => tracing::info!(document_id = %id, ?outcome, "re-index finished"),
            Err(err) => tracing::error!(document_id = %id, error = %err, "re-index failed"),
        },
    }
}
