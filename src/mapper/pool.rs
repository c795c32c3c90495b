//! Same-machine worker pool.
//!
//! Each worker owns an independent clone of the problem. A batch is split
//! into one contiguous sub-batch per worker and run on a dedicated rayon
//! pool; the call returns once every sub-batch has reported back. A worker
//! that panics is replaced by a fresh clone of the pristine problem and its
//! sub-batch is retried according to the [`RetryPolicy`].

use ndarray::{Array1, Array2};
use rayon::prelude::*;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, warn};

use super::{partition, Mapper, RetryPolicy};
use crate::error::{FitError, Result};
use crate::problem::FitProblem;

/// Per-item outcome of a sub-batch; `Err` holds the panic message of a
/// crashed worker.
type ChunkOutcome = std::result::Result<Vec<std::result::Result<f64, String>>, String>;

pub struct PoolMapper<P> {
    pool: rayon::ThreadPool,
    template: P,
    workers: Vec<P>,
    retry: RetryPolicy,
    batches: u64,
}

impl<P> PoolMapper<P>
where
    P: FitProblem + Clone + Send + Sync,
{
    /// Start `workers` workers, each with its own copy of `problem`.
    pub fn new(problem: P, workers: usize, retry: RetryPolicy) -> Result<Self> {
        if workers == 0 {
            return Err(FitError::invalid_option("workers", 0, "at least 1 worker"));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("reflfit-worker-{}", i))
            .build()
            .map_err(|e| FitError::Transport(format!("cannot start worker pool: {}", e)))?;
        debug!("started pool mapper with {} workers", workers);
        Ok(Self {
            pool,
            workers: (0..workers).map(|_| problem.clone()).collect(),
            template: problem,
            retry,
            batches: 0,
        })
    }

    fn run_chunk(worker: &P, batch: &Array2<f64>, indices: &[usize]) -> ChunkOutcome {
        panic::catch_unwind(AssertUnwindSafe(|| {
            indices
                .iter()
                .map(|&i| {
                    worker
                        .nllf(&batch.row(i).to_owned())
                        .map_err(|e| e.to_string())
                })
                .collect()
        }))
        .map_err(|payload| {
            if let Some(text) = payload.downcast_ref::<&str>() {
                text.to_string()
            } else if let Some(text) = payload.downcast_ref::<String>() {
                text.clone()
            } else {
                "worker panicked".to_string()
            }
        })
    }
}

impl<P> Mapper for PoolMapper<P>
where
    P: FitProblem + Clone + Send + Sync,
{
    fn evaluate_batch(&mut self, batch: &Array2<f64>) -> Result<Array1<f64>> {
        self.batches += 1;
        let n = batch.nrows();
        let mut results: Vec<Option<f64>> = vec![None; n];
        let mut pending: Vec<usize> = (0..n).collect();
        let mut last_error = None;

        for attempt in 0..=self.retry.max_retries {
            if pending.is_empty() {
                break;
            }
            if attempt > 0 {
                warn!(
                    "batch {}: retrying {} items (attempt {})",
                    self.batches,
                    pending.len(),
                    attempt
                );
            }

            let chunks: Vec<Vec<usize>> = partition(pending.len(), self.workers.len())
                .into_iter()
                .map(|range| pending[range].to_vec())
                .collect();

            let workers = &self.workers;
            let outcomes: Vec<ChunkOutcome> = self.pool.install(|| {
                chunks
                    .par_iter()
                    .enumerate()
                    .map(|(w, indices)| Self::run_chunk(&workers[w], batch, indices))
                    .collect()
            });

            let mut failed = Vec::new();
            for (w, (indices, outcome)) in chunks.iter().zip(outcomes).enumerate() {
                match outcome {
                    Ok(items) => {
                        for (&i, item) in indices.iter().zip(items) {
                            match item {
                                Ok(value) => results[i] = Some(value),
                                Err(message) => {
                                    failed.push(i);
                                    last_error = Some(FitError::Evaluation { index: i, message });
                                }
                            }
                        }
                    }
                    Err(message) => {
                        warn!(
                            "batch {}: worker {} crashed ({}); starting a fresh worker",
                            self.batches, w, message
                        );
                        self.workers[w] = self.template.clone();
                        failed.extend_from_slice(indices);
                        last_error = Some(FitError::WorkerCrash { chunk: w, message });
                    }
                }
            }
            failed.sort_unstable();
            pending = failed;
        }

        if !pending.is_empty() {
            if !self.retry.penalize {
                return Err(last_error.unwrap_or_else(|| {
                    FitError::InvalidState("unfinished batch without error".to_string())
                }));
            }
            warn!(
                "batch {}: scoring {} failed items as +inf",
                self.batches,
                pending.len()
            );
            for &i in &pending {
                results[i] = Some(f64::INFINITY);
            }
        }

        Ok(results
            .into_iter()
            .map(|v| v.unwrap_or(f64::INFINITY))
            .collect())
    }

    fn workers(&self) -> usize {
        self.workers.len()
    }

    fn name(&self) -> &'static str {
        "pool"
    }
}
