//! Fit problem trait and its transport schema.
//!
//! This module defines the [`FitProblem`] trait, the only view the fitting
//! engine has of a physical model, and [`ProblemSpec`], the versioned
//! description used to ship a problem to remote workers.

use ndarray::Array1;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::error::{FitError, Result};
use crate::parameters::{ParameterSpace, Parameters};

/// Version of the [`ProblemSpec`] layout.
pub const PROBLEM_SCHEMA_VERSION: u32 = 1;

/// A model fitted to data by minimizing a negative log-likelihood.
///
/// The objective is a pure function of a full parameter vector (every
/// parameter in declaration order, fixed ones included). The engine never
/// calls [`FitProblem::nllf`] on the driver's own copy while workers are
/// running; workers evaluate independent clones.
pub trait FitProblem {
    /// The problem's parameters in declaration order.
    fn parameters(&self) -> &Parameters;

    /// Mutable access used by the driver to publish the current best.
    fn parameters_mut(&mut self) -> &mut Parameters;

    /// Negative log-likelihood at the given full parameter vector.
    fn nllf(&self, values: &Array1<f64>) -> Result<f64>;

    /// Data points minus fitted parameters.
    fn degrees_of_freedom(&self) -> usize;

    /// Discriminator used by remote workers to pick a decoder.
    fn kind(&self) -> &str {
        "generic"
    }

    /// Human-readable title used for job names and logs.
    fn title(&self) -> String {
        self.kind().to_string()
    }

    /// Problem-specific model description carried in [`ProblemSpec::model`].
    fn model_spec(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Replace the data with a statistically resampled copy.
    fn resynthesize(&mut self, _rng: &mut StdRng) -> Result<()> {
        Err(FitError::NotSupported(format!(
            "problem '{}' cannot resynthesize its data",
            self.kind()
        )))
    }

    /// Restore the data replaced by [`FitProblem::resynthesize`].
    fn restore_data(&mut self) {}

    /// Objective at the current parameter values.
    fn current_nllf(&self) -> Result<f64> {
        self.nllf(&self.parameters().values())
    }

    /// Reduced goodness of fit, `nllf / dof`.
    fn chisq(&self, nllf: f64) -> f64 {
        let dof = self.degrees_of_freedom().max(1);
        nllf / dof as f64
    }

    /// Apply an optimization vector to the live parameters.
    fn set_point(&mut self, space: &ParameterSpace, point: &Array1<f64>) -> Result<()> {
        let full = space.expand(point);
        self.parameters_mut().set_values(&full)?;
        Ok(())
    }
}

/// Versioned, language-neutral description of a problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemSpec {
    pub schema_version: u32,
    pub kind: String,
    pub title: String,
    pub parameters: Parameters,
    #[serde(default)]
    pub model: serde_json::Value,
}

impl ProblemSpec {
    /// Describe a problem at its current parameter values.
    pub fn from_problem<P: FitProblem + ?Sized>(problem: &P) -> Self {
        Self {
            schema_version: PROBLEM_SCHEMA_VERSION,
            kind: problem.kind().to_string(),
            title: problem.title(),
            parameters: problem.parameters().clone(),
            model: problem.model_spec(),
        }
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a spec, rejecting unknown schema versions and bad bounds.
    pub fn from_json(json: &str) -> Result<Self> {
        let spec: ProblemSpec = serde_json::from_str(json)?;
        if spec.schema_version != PROBLEM_SCHEMA_VERSION {
            return Err(FitError::Schema(format!(
                "unsupported problem schema version {} (expected {})",
                spec.schema_version, PROBLEM_SCHEMA_VERSION
            )));
        }
        for param in spec.parameters.iter() {
            param.bounds().validate()?;
        }
        Ok(spec)
    }

    /// Check that the spec describes the expected kind of problem.
    pub fn expect_kind(&self, kind: &str) -> Result<()> {
        if self.kind != kind {
            return Err(FitError::Schema(format!(
                "expected problem kind '{}', found '{}'",
                kind, self.kind
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[derive(Clone)]
    struct Paraboloid {
        params: Parameters,
    }

    impl FitProblem for Paraboloid {
        fn parameters(&self) -> &Parameters {
            &self.params
        }

        fn parameters_mut(&mut self) -> &mut Parameters {
            &mut self.params
        }

        fn nllf(&self, values: &Array1<f64>) -> Result<f64> {
            Ok(values.iter().map(|v| v * v).sum())
        }

        fn degrees_of_freedom(&self) -> usize {
            4
        }

        fn kind(&self) -> &str {
            "paraboloid"
        }
    }

    fn problem() -> Paraboloid {
        let mut params = Parameters::new();
        params.add_param_with_bounds("a", 1.0, -5.0, 5.0).unwrap();
        params.add_fixed("b", 2.0).unwrap();
        Paraboloid { params }
    }

    #[test]
    fn test_set_point_updates_fitted_only() {
        let mut problem = problem();
        let space = ParameterSpace::from_parameters(problem.parameters()).unwrap();
        problem.set_point(&space, &array![3.0]).unwrap();
        assert_eq!(problem.parameters().values(), array![3.0, 2.0]);
        assert_eq!(problem.current_nllf().unwrap(), 13.0);
        assert_eq!(problem.chisq(8.0), 2.0);
    }

    #[test]
    fn test_resynthesize_defaults_to_unsupported() {
        let mut problem = problem();
        let mut rng = <StdRng as rand::SeedableRng>::seed_from_u64(1);
        assert!(matches!(
            problem.resynthesize(&mut rng),
            Err(FitError::NotSupported(_))
        ));
    }

    #[test]
    fn test_spec_round_trip_and_version_check() {
        let spec = ProblemSpec::from_problem(&problem());
        let json = spec.to_json().unwrap();
        let back = ProblemSpec::from_json(&json).unwrap();
        assert_eq!(back, spec);
        assert!(back.expect_kind("paraboloid").is_ok());
        assert!(back.expect_kind("slab").is_err());

        let future = json.replace("\"schema_version\":1", "\"schema_version\":99");
        assert!(matches!(
            ProblemSpec::from_json(&future),
            Err(FitError::Schema(_))
        ));
    }
}
