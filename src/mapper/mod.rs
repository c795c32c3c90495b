//! Batch evaluation of the objective.
//!
//! A [`Mapper`] turns a batch of full parameter vectors (one per row) into a
//! vector of objective values with `result[i]` belonging to row `i`, however
//! the work was scheduled. Three transports are provided:
//!
//! - [`SerialMapper`]: in-process, one vector at a time
//! - [`PoolMapper`]: a fixed pool of same-machine workers, each holding its
//!   own copy of the problem
//! - [`QueueMapper`]: requests published to a message queue and answered by
//!   standing remote workers
//!
//! Optimizers never talk to a mapper directly; they go through an
//! [`Evaluator`], which rejects out-of-bounds vectors before dispatch and
//! expands optimization vectors into full parameter vectors.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{FitError, Result};
use crate::parameters::ParameterSpace;
use crate::problem::FitProblem;
use crate::progress::CancelToken;

mod broker;
mod pool;
mod queue;
mod serial;

pub use broker::{ChannelBroker, HttpBroker, QueueBroker};
pub use pool::PoolMapper;
pub use queue::{run_worker, EvalReply, EvalRequest, QueueMapper, WorkerHandle};
pub use serial::SerialMapper;

/// Evaluates batches of full parameter vectors.
pub trait Mapper: Send {
    /// Objective value for every row of `batch`, in row order.
    fn evaluate_batch(&mut self, batch: &Array2<f64>) -> Result<Array1<f64>>;

    /// Number of concurrent evaluators behind this mapper
    fn workers(&self) -> usize {
        1
    }

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// What to do when an evaluation fails.
///
/// Failed items (or the sub-batch of a crashed worker) are retried up to
/// `max_retries` times, each time on a fresh worker. Items that still fail
/// either fail the whole batch or, with `penalize`, are scored `+inf` so the
/// optimizer rejects them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub penalize: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            penalize: false,
        }
    }
}

impl RetryPolicy {
    /// Fail on the first error.
    pub fn fail_fast() -> Self {
        Self {
            max_retries: 0,
            penalize: false,
        }
    }

    pub fn with_max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_penalize(mut self, penalize: bool) -> Self {
        self.penalize = penalize;
        self
    }
}

/// Connection settings for the remote-queue transport.
#[derive(Clone)]
pub struct QueueConfig {
    pub broker: Arc<dyn QueueBroker>,
    /// Longest wait for a complete batch
    pub timeout: Duration,
    /// Interval between cancellation checks while waiting
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
}

impl QueueConfig {
    pub fn new(broker: Arc<dyn QueueBroker>) -> Self {
        Self {
            broker,
            timeout: Duration::from_secs(600),
            poll_interval: Duration::from_millis(50),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl fmt::Debug for QueueConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueConfig")
            .field("timeout", &self.timeout)
            .field("poll_interval", &self.poll_interval)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Scheduling regime for objective evaluations.
#[derive(Debug, Clone)]
pub enum Transport {
    /// Single-threaded, deterministic baseline.
    Serial { retry: RetryPolicy },

    /// Same-machine pool of `workers` independent problem copies.
    Pool { workers: usize, retry: RetryPolicy },

    /// Remote workers behind a message queue.
    Queue(QueueConfig),
}

impl Default for Transport {
    fn default() -> Self {
        Transport::serial()
    }
}

impl Transport {
    pub fn serial() -> Self {
        Transport::Serial {
            retry: RetryPolicy::default(),
        }
    }

    pub fn pool(workers: usize) -> Self {
        Transport::Pool {
            workers,
            retry: RetryPolicy::default(),
        }
    }

    /// Pool sized to the machine.
    pub fn pool_all_cores() -> Self {
        Transport::pool(rayon::current_num_threads())
    }

    pub fn queue(broker: Arc<dyn QueueBroker>) -> Self {
        Transport::Queue(QueueConfig::new(broker))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Transport::Serial { .. } => "serial",
            Transport::Pool { .. } => "pool",
            Transport::Queue(_) => "queue",
        }
    }

    /// True when mappers evaluate a fresh copy of the driver's problem.
    ///
    /// Queue workers keep the problem they were started with and only ever
    /// receive parameter vectors, so resampled data never reaches them.
    pub fn follows_problem_data(&self) -> bool {
        !matches!(self, Transport::Queue(_))
    }

    /// Fail fast on nonsensical connection parameters.
    pub fn validate(&self) -> Result<()> {
        match self {
            Transport::Serial { .. } => Ok(()),
            Transport::Pool { workers, .. } => {
                if *workers == 0 {
                    return Err(FitError::invalid_option(
                        "workers",
                        workers,
                        "at least 1 worker",
                    ));
                }
                Ok(())
            }
            Transport::Queue(config) => {
                if config.timeout.is_zero() {
                    return Err(FitError::invalid_option(
                        "timeout",
                        format!("{:?}", config.timeout),
                        "a positive duration",
                    ));
                }
                Ok(())
            }
        }
    }

    /// Start a mapper for `problem`.
    pub fn start_mapper<P>(&self, problem: &P, cancel: &CancelToken) -> Result<Box<dyn Mapper>>
    where
        P: FitProblem + Clone + Send + Sync + 'static,
    {
        self.validate()?;
        let mapper: Box<dyn Mapper> = match self {
            Transport::Serial { retry } => Box::new(SerialMapper::new(problem.clone(), *retry)),
            Transport::Pool { workers, retry } => {
                Box::new(PoolMapper::new(problem.clone(), *workers, *retry)?)
            }
            Transport::Queue(config) => Box::new(QueueMapper::new(config.clone(), cancel.clone())),
        };
        Ok(mapper)
    }

    /// Start a standing worker for `problem`.
    ///
    /// Only the queue transport has standing workers; the in-process
    /// transports return an idle handle.
    pub fn start_worker<P>(&self, problem: &P) -> Result<WorkerHandle>
    where
        P: FitProblem + Clone + Send + Sync + 'static,
    {
        self.validate()?;
        match self {
            Transport::Queue(config) => Ok(WorkerHandle::spawn(
                problem.clone(),
                Arc::clone(&config.broker),
                config.poll_interval,
            )),
            _ => Ok(WorkerHandle::idle()),
        }
    }
}

/// Gatekeeper between optimizers and a mapper.
pub struct Evaluator<'a> {
    space: &'a ParameterSpace,
    mapper: &'a mut dyn Mapper,
    cancel: CancelToken,
    batches: usize,
    evaluations: usize,
}

impl<'a> Evaluator<'a> {
    pub fn new(space: &'a ParameterSpace, mapper: &'a mut dyn Mapper, cancel: CancelToken) -> Self {
        Self {
            space,
            mapper,
            cancel,
            batches: 0,
            evaluations: 0,
        }
    }

    /// Optimization space the evaluator checks against.
    pub fn space(&self) -> &ParameterSpace {
        self.space
    }

    /// Evaluate a batch of optimization vectors.
    ///
    /// The whole batch is rejected if any row is out of bounds. Non-finite
    /// objective values come back as `+inf`.
    pub fn evaluate(&mut self, batch: &Array2<f64>) -> Result<Array1<f64>> {
        if self.cancel.is_cancelled() {
            return Err(FitError::Cancelled);
        }
        self.space.check_batch(batch)?;
        let full = self.space.expand_batch(batch);
        let values = self.mapper.evaluate_batch(&full)?;
        if values.len() != batch.nrows() {
            return Err(FitError::Transport(format!(
                "{} mapper returned {} values for {} vectors",
                self.mapper.name(),
                values.len(),
                batch.nrows()
            )));
        }
        self.batches += 1;
        self.evaluations += values.len();
        Ok(values.mapv(|v| if v.is_nan() { f64::INFINITY } else { v }))
    }

    /// Evaluate a single optimization vector.
    pub fn evaluate_point(&mut self, point: &Array1<f64>) -> Result<f64> {
        let batch = point.clone().insert_axis(ndarray::Axis(0));
        Ok(self.evaluate(&batch)?[0])
    }

    /// Number of batches evaluated so far
    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Number of objective evaluations so far
    pub fn evaluations(&self) -> usize {
        self.evaluations
    }
}

/// Split `len` items into at most `parts` contiguous, nearly equal ranges.
pub(crate) fn partition(len: usize, parts: usize) -> Vec<std::ops::Range<usize>> {
    let parts = parts.max(1).min(len.max(1));
    let base = len / parts;
    let extra = len % parts;
    let mut ranges = Vec::with_capacity(parts);
    let mut start = 0;
    for i in 0..parts {
        let size = base + usize::from(i < extra);
        ranges.push(start..start + size);
        start += size;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::Parameters;
    use ndarray::array;

    struct Recording {
        seen: Vec<Array2<f64>>,
    }

    impl Mapper for Recording {
        fn evaluate_batch(&mut self, batch: &Array2<f64>) -> Result<Array1<f64>> {
            self.seen.push(batch.clone());
            Ok(batch.rows().into_iter().map(|r| r.sum()).collect())
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    fn space() -> ParameterSpace {
        let mut params = Parameters::new();
        params.add_param_with_bounds("a", 1.0, 0.0, 10.0).unwrap();
        params.add_fixed("b", 100.0).unwrap();
        ParameterSpace::from_parameters(&params).unwrap()
    }

    #[test]
    fn test_partition_covers_everything() {
        let ranges = partition(50, 4);
        assert_eq!(ranges.len(), 4);
        assert_eq!(ranges[0], 0..13);
        assert_eq!(ranges[3], 38..50);
        assert_eq!(partition(2, 4).len(), 2);
        assert_eq!(partition(0, 3), vec![0..0]);
    }

    #[test]
    fn test_evaluator_expands_and_counts() {
        let space = space();
        let mut mapper = Recording { seen: Vec::new() };
        let mut evaluator = Evaluator::new(&space, &mut mapper, CancelToken::new());
        let values = evaluator.evaluate(&array![[1.0], [2.0]]).unwrap();
        assert_eq!(values, array![101.0, 102.0]);
        assert_eq!(evaluator.evaluations(), 2);
        assert_eq!(evaluator.batches(), 1);
        assert_eq!(mapper.seen[0], array![[1.0, 100.0], [2.0, 100.0]]);
    }

    #[test]
    fn test_evaluator_rejects_before_dispatch() {
        let space = space();
        let mut mapper = Recording { seen: Vec::new() };
        {
            let mut evaluator = Evaluator::new(&space, &mut mapper, CancelToken::new());
            assert!(matches!(
                evaluator.evaluate(&array![[1.0], [12.0]]),
                Err(FitError::OutOfBounds { row: 1, .. })
            ));
        }
        assert!(mapper.seen.is_empty());
    }

    #[test]
    fn test_evaluator_honours_cancellation() {
        let space = space();
        let mut mapper = Recording { seen: Vec::new() };
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut evaluator = Evaluator::new(&space, &mut mapper, cancel);
        assert!(matches!(
            evaluator.evaluate_point(&array![1.0]),
            Err(FitError::Cancelled)
        ));
    }

    #[test]
    fn test_transport_validation() {
        assert!(Transport::pool(0).validate().is_err());
        assert!(Transport::pool(2).validate().is_ok());
        assert!(Transport::serial().validate().is_ok());
    }
}
