//! Work dispatcher: chunks the task list and runs it on a bounded pool of
//! workers, one checkpoint per chunk.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointRow, CheckpointStore};
use crate::model::{partition, Chunk, ChunkId, ExtractionOutcome, WorkItem};
use crate::retry::{retry_io, RetryPolicy};
use crate::worker::{ItemProcessor, ProcessorFactory};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("checkpoint for {chunk} could not be persisted: {source}")]
    CheckpointWrite {
        chunk: ChunkId,
        #[source]
        source: CheckpointError,
    },
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    pub pool_size: usize,
    pub chunk_size: usize,
    /// Crashes tolerated per chunk before it is recorded as failed.
    pub max_chunk_restarts: u32,
    /// Skip chunks that already have a complete checkpoint.
    pub resume: bool,
    pub progress: bool,
    /// Backoff for checkpoint writes.
    pub write_retry: RetryPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub chunks_total: usize,
    pub chunks_skipped: usize,
    pub chunks_written: usize,
    pub chunks_restarted: usize,
    pub items_processed: usize,
    pub cancelled: bool,
}

struct Job {
    chunk: Chunk,
    restarts: u32,
}

type Queue = Arc<Mutex<VecDeque<Job>>>;

enum Event {
    Written { chunk: ChunkId, rows: usize, complete: bool },
    Restarted { chunk: ChunkId },
    WriteFailed { chunk: ChunkId, error: CheckpointError },
}

pub struct Dispatcher<F: ProcessorFactory> {
    factory: Arc<F>,
    store: CheckpointStore,
    config: DispatchConfig,
    cancel: CancellationToken,
}

impl<F: ProcessorFactory> Dispatcher<F> {
    pub fn new(
        factory: F,
        store: CheckpointStore,
        config: DispatchConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            factory: Arc::new(factory),
            store,
            config,
            cancel,
        }
    }

    pub async fn run(&self, items: Vec<WorkItem>) -> Result<DispatchReport, PipelineError> {
        let chunks = partition(items, self.config.chunk_size);
        let mut report = DispatchReport {
            chunks_total: chunks.len(),
            ..DispatchReport::default()
        };

        // Resumed runs keep checkpoints only inside the current partition.
        let first_stale = if self.config.resume { chunks.len() } else { 0 };
        let cleared = self.store.prune(first_stale)?;
        if cleared > 0 {
            info!("Cleared {} checkpoints from a previous run", cleared);
        }

        let mut pending = VecDeque::with_capacity(chunks.len());
        let mut pending_items = 0usize;
        for chunk in chunks {
            if self.config.resume && self.store.covers(&chunk)? {
                debug!(chunk = %chunk.id, "Skipping completed chunk");
                report.chunks_skipped += 1;
                continue;
            }
            pending_items += chunk.items.len();
            pending.push_back(Job { chunk, restarts: 0 });
        }

        info!(
            "Dispatching {} chunks ({} items) on {} workers, {} skipped",
            pending.len(),
            pending_items,
            self.config.pool_size,
            report.chunks_skipped
        );

        let pb = if self.config.progress {
            let pb = ProgressBar::new(pending_items as u64);
            if let Ok(style) =
                ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")
            {
                pb.set_style(style.progress_chars("=> "));
            }
            pb
        } else {
            ProgressBar::hidden()
        };

        let queue: Queue = Arc::new(Mutex::new(pending));
        let run_token = self.cancel.child_token();
        let workers_n = self.config.pool_size.max(1);
        let (tx, mut rx) = mpsc::channel::<Event>(workers_n * 2);

        let mut workers = JoinSet::new();
        for worker_id in 0..workers_n {
            let worker = Worker {
                id: worker_id,
                factory: Arc::clone(&self.factory),
                store: self.store.clone(),
                queue: Arc::clone(&queue),
                events: tx.clone(),
                cancel: run_token.clone(),
                config: self.config,
            };
            workers.spawn(worker.run());
        }
        drop(tx);

        let mut failure = None;
        while let Some(event) = rx.recv().await {
            match event {
                Event::Written {
                    chunk,
                    rows,
                    complete,
                } => {
                    report.chunks_written += 1;
                    report.items_processed += rows;
                    pb.inc(rows as u64);
                    debug!(%chunk, rows, complete, "Chunk checkpointed");
                }
                Event::Restarted { chunk } => {
                    report.chunks_restarted += 1;
                    debug!(%chunk, "Chunk requeued after worker crash");
                }
                Event::WriteFailed { chunk, error } => {
                    error!("Aborting run, checkpoint for {} failed: {}", chunk, error);
                    run_token.cancel();
                    failure.get_or_insert(PipelineError::CheckpointWrite { chunk, source: error });
                }
            }
        }

        while let Some(joined) = workers.join_next().await {
            joined?;
        }
        pb.finish_and_clear();

        report.cancelled = self.cancel.is_cancelled();
        if report.cancelled {
            warn!(
                "Run cancelled after {} of {} items",
                report.items_processed, pending_items
            );
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }
}

struct Worker<F: ProcessorFactory> {
    id: usize,
    factory: Arc<F>,
    store: CheckpointStore,
    queue: Queue,
    events: mpsc::Sender<Event>,
    cancel: CancellationToken,
    config: DispatchConfig,
}

impl<F: ProcessorFactory> Worker<F> {
    fn next_job(&self) -> Option<Job> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.queue.lock().ok()?.pop_front()
    }

    fn requeue(&self, job: Job) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(job);
        }
    }

    async fn run(self) {
        let mut processor = self.factory.create();

        while let Some(mut job) = self.next_job() {
            let attempt = AssertUnwindSafe(run_chunk(&mut processor, &job.chunk, &self.cancel))
                .catch_unwind()
                .await;

            let checkpoint = match attempt {
                Ok(checkpoint) => checkpoint,
                Err(panic) => {
                    let cause = panic_message(&*panic);
                    processor = self.factory.create();
                    job.restarts += 1;
                    if job.restarts <= self.config.max_chunk_restarts {
                        warn!(
                            worker = self.id,
                            chunk = %job.chunk.id,
                            "Worker crashed ({}), requeueing chunk (restart {}/{})",
                            cause,
                            job.restarts,
                            self.config.max_chunk_restarts
                        );
                        let _ = self.events.send(Event::Restarted { chunk: job.chunk.id }).await;
                        self.requeue(job);
                        continue;
                    }
                    error!(
                        worker = self.id,
                        chunk = %job.chunk.id,
                        "Chunk crashed {} times, recording every item as failed: {}",
                        job.restarts,
                        cause
                    );
                    crashed_checkpoint(&job, &cause)
                }
            };

            let store = &self.store;
            let cp = &checkpoint;
            let written = retry_io(&self.config.write_retry, "checkpoint write", move || async move {
                store.write(cp)
            })
            .await;

            let event = match written {
                Ok(_) => Event::Written {
                    chunk: checkpoint.chunk_id,
                    rows: checkpoint.rows.len(),
                    complete: checkpoint.complete,
                },
                Err(error) => Event::WriteFailed {
                    chunk: checkpoint.chunk_id,
                    error,
                },
            };
            let failed = matches!(event, Event::WriteFailed { .. });
            let _ = self.events.send(event).await;
            if failed {
                break;
            }
        }
        debug!(worker = self.id, "Worker finished");
    }
}

/// Process a chunk's items in order. Stops early, with `complete = false`,
/// once cancellation is requested.
async fn run_chunk<P: ItemProcessor>(
    processor: &mut P,
    chunk: &Chunk,
    cancel: &CancellationToken,
) -> Checkpoint {
    let mut rows = Vec::with_capacity(chunk.items.len());
    for item in &chunk.items {
        if cancel.is_cancelled() {
            break;
        }
        let report = processor.process(item).await;
        for attempt in &report.attempts {
            trace!(
                item = %attempt.item_id,
                attempt = attempt.attempt_number,
                phase = ?attempt.phase,
                outcome = %attempt.outcome,
                cause = attempt.cause.as_deref().unwrap_or(""),
                at = %attempt.timestamp,
                "Attempt"
            );
        }
        rows.push(CheckpointRow {
            item: item.clone(),
            outcome: report.outcome,
            attempts: report.attempts.len(),
        });
    }
    let complete = rows.len() == chunk.items.len();
    Checkpoint::new(chunk.id, complete, rows)
}

fn crashed_checkpoint(job: &Job, cause: &str) -> Checkpoint {
    let rows = job
        .chunk
        .items
        .iter()
        .map(|item| CheckpointRow {
            item: item.clone(),
            outcome: ExtractionOutcome::FatalFailure(format!("worker crashed: {}", cause)),
            attempts: 0,
        })
        .collect();
    Checkpoint::new(job.chunk.id, true, rows)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
