//! Remote-queue transport.
//!
//! Every vector of a batch becomes one [`EvalRequest`] published on the
//! broker. Standing workers (see [`run_worker`]) take requests, evaluate
//! them on their own copy of the problem, and publish an [`EvalReply`]
//! tagged with the request id. The mapper reassembles replies by id, so
//! reordering and duplicate delivery are harmless.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Mapper, QueueBroker, QueueConfig};
use crate::error::{FitError, Result};
use crate::problem::FitProblem;
use crate::progress::CancelToken;

/// One objective evaluation to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalRequest {
    pub id: Uuid,
    pub batch: u64,
    pub index: usize,
    pub values: Vec<f64>,
}

/// Answer to an [`EvalRequest`].
///
/// A reply without `value` and without `error` stands for a non-finite
/// objective, which JSON cannot carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalReply {
    pub id: Uuid,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl EvalReply {
    fn from_outcome(id: Uuid, outcome: Result<f64>) -> Self {
        match outcome {
            Ok(value) if value.is_finite() => Self {
                id,
                value: Some(value),
                error: None,
            },
            Ok(_) => Self {
                id,
                value: None,
                error: None,
            },
            Err(e) => Self {
                id,
                value: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Mapper that farms evaluations out to queue workers.
pub struct QueueMapper {
    config: QueueConfig,
    cancel: CancelToken,
    batches: u64,
}

impl QueueMapper {
    pub fn new(config: QueueConfig, cancel: CancelToken) -> Self {
        Self {
            config,
            cancel,
            batches: 0,
        }
    }

    fn publish(&self, index: usize, values: Vec<f64>) -> Result<Uuid> {
        let request = EvalRequest {
            id: Uuid::new_v4(),
            batch: self.batches,
            index,
            values,
        };
        self.config
            .broker
            .publish_request(serde_json::to_string(&request)?)?;
        Ok(request.id)
    }
}

impl Mapper for QueueMapper {
    fn evaluate_batch(&mut self, batch: &Array2<f64>) -> Result<Array1<f64>> {
        self.batches += 1;
        let expected = batch.nrows();
        let mut results: Vec<Option<f64>> = vec![None; expected];
        let mut attempts = vec![0usize; expected];
        let mut in_flight: HashMap<Uuid, usize> = HashMap::with_capacity(expected);

        for (i, row) in batch.rows().into_iter().enumerate() {
            let id = self.publish(i, row.to_vec())?;
            in_flight.insert(id, i);
        }
        debug!("batch {}: published {} requests", self.batches, expected);

        let deadline = Instant::now() + self.config.timeout;
        let mut received = 0;
        while received < expected {
            if self.cancel.is_cancelled() {
                return Err(FitError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(FitError::Timeout {
                    batch: self.batches,
                    received,
                    expected,
                });
            }
            let wait = self.config.poll_interval.min(deadline - now);
            let Some(body) = self.config.broker.next_reply(wait)? else {
                continue;
            };
            let reply: EvalReply = match serde_json::from_str(&body) {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("batch {}: ignoring malformed reply: {}", self.batches, e);
                    continue;
                }
            };
            // Unknown ids are stale replies or duplicates of answered requests
            let Some(index) = in_flight.remove(&reply.id) else {
                continue;
            };

            if let Some(message) = reply.error {
                if attempts[index] < self.config.retry.max_retries {
                    attempts[index] += 1;
                    warn!(
                        "batch {} item {} failed ({}); retry {}",
                        self.batches, index, message, attempts[index]
                    );
                    let id = self.publish(index, batch.row(index).to_vec())?;
                    in_flight.insert(id, index);
                    continue;
                }
                if !self.config.retry.penalize {
                    return Err(FitError::Evaluation { index, message });
                }
                warn!(
                    "batch {} item {} failed ({}); scoring as +inf",
                    self.batches, index, message
                );
                results[index] = Some(f64::INFINITY);
            } else {
                results[index] = Some(reply.value.unwrap_or(f64::INFINITY));
            }
            received += 1;
        }

        Ok(results
            .into_iter()
            .map(|v| v.unwrap_or(f64::INFINITY))
            .collect())
    }

    fn workers(&self) -> usize {
        0
    }

    fn name(&self) -> &'static str {
        "queue"
    }
}

/// Serve evaluation requests from `broker` until `stop` is set.
///
/// A panicking objective is answered with an error reply; the worker keeps
/// serving. Returns the number of requests answered.
pub fn run_worker<P: FitProblem>(
    problem: &P,
    broker: &dyn QueueBroker,
    stop: &CancelToken,
    poll_interval: Duration,
) -> Result<usize> {
    let mut served = 0;
    while !stop.is_cancelled() {
        let Some(body) = broker.next_request(poll_interval)? else {
            continue;
        };
        let request: EvalRequest = match serde_json::from_str(&body) {
            Ok(request) => request,
            Err(e) => {
                warn!("worker ignoring malformed request: {}", e);
                continue;
            }
        };
        let values = Array1::from(request.values);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| problem.nllf(&values)))
            .unwrap_or_else(|_| Err(FitError::InvalidState("objective panicked".to_string())));
        let reply = EvalReply::from_outcome(request.id, outcome);
        broker.publish_reply(serde_json::to_string(&reply)?)?;
        served += 1;
    }
    Ok(served)
}

/// A standing worker running on its own thread.
pub struct WorkerHandle {
    stop: CancelToken,
    join: Option<JoinHandle<Result<usize>>>,
}

impl WorkerHandle {
    /// Start a worker thread serving `broker` with `problem`.
    pub fn spawn<P>(problem: P, broker: Arc<dyn QueueBroker>, poll_interval: Duration) -> Self
    where
        P: FitProblem + Send + 'static,
    {
        let stop = CancelToken::new();
        let token = stop.clone();
        let join = thread::spawn(move || {
            let served = run_worker(&problem, broker.as_ref(), &token, poll_interval);
            if let Ok(count) = &served {
                info!("queue worker stopped after {} requests", count);
            }
            served
        });
        Self {
            stop,
            join: Some(join),
        }
    }

    /// Handle with no thread behind it.
    pub fn idle() -> Self {
        Self {
            stop: CancelToken::new(),
            join: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.join.is_none()
    }

    /// Ask the worker to stop after its current request.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Stop the worker and wait for it; returns the number of requests it
    /// answered.
    pub fn join(mut self) -> Result<usize> {
        self.stop();
        match self.join.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| FitError::Transport("queue worker thread panicked".to_string()))?,
            None => Ok(0),
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
