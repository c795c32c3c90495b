//! In-process sequential evaluation.

use ndarray::{Array1, Array2};
use tracing::warn;

use super::{Mapper, RetryPolicy};
use crate::error::{FitError, Result};
use crate::problem::FitProblem;

/// Evaluates one vector at a time on the calling thread.
///
/// This is the reference transport: no concurrency, fully deterministic.
pub struct SerialMapper<P> {
    problem: P,
    retry: RetryPolicy,
}

impl<P: FitProblem> SerialMapper<P> {
    pub fn new(problem: P, retry: RetryPolicy) -> Self {
        Self { problem, retry }
    }

    fn evaluate_item(&self, index: usize, values: &Array1<f64>) -> Result<f64> {
        let mut attempt = 0;
        loop {
            match self.problem.nllf(values) {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.retry.max_retries => {
                    attempt += 1;
                    warn!("item {} failed ({}); retry {}", index, err, attempt);
                }
                Err(err) if self.retry.penalize => {
                    warn!("item {} failed ({}); scoring as +inf", index, err);
                    return Ok(f64::INFINITY);
                }
                Err(err) => {
                    return Err(FitError::Evaluation {
                        index,
                        message: err.to_string(),
                    })
                }
            }
        }
    }
}

impl<P: FitProblem + Send> Mapper for SerialMapper<P> {
    fn evaluate_batch(&mut self, batch: &Array2<f64>) -> Result<Array1<f64>> {
        let mut out = Array1::zeros(batch.nrows());
        for (i, row) in batch.rows().into_iter().enumerate() {
            out[i] = self.evaluate_item(i, &row.to_owned())?;
        }
        Ok(out)
    }

    fn name(&self) -> &'static str {
        "serial"
    }
}
