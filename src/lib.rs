//! # reflfit
//!
//! `reflfit` is the optimization and error-analysis engine behind fits of
//! layered reflectivity models. It knows nothing about reflectivity itself:
//! a model is anything implementing [`FitProblem`], a negative
//! log-likelihood over a list of bounded parameters.
//!
//! The library provides:
//! - Population strategies: differential evolution, a DREAM-style MCMC
//!   sampler, random lines, particle swarm and parallel tempering
//! - Batch evaluation on a single thread, a same-machine worker pool or
//!   remote workers behind a message queue
//! - A fit driver with multi-start campaigns, checkpointing, progress
//!   events, cancellation, resynthesis error analysis and mesh scans
//! - Covariance and sampler diagnostics
//! - Submission of whole campaigns to a remote job queue
//!
//! ## Basic Usage
//!
//! ```rust
//! use ndarray::Array1;
//! use reflfit::{FitConfig, FitDriver, FitProblem, Parameters, Transport};
//!
//! #[derive(Clone)]
//! struct Bowl {
//!     params: Parameters,
//! }
//!
//! impl FitProblem for Bowl {
//!     fn parameters(&self) -> &Parameters {
//!         &self.params
//!     }
//!
//!     fn parameters_mut(&mut self) -> &mut Parameters {
//!         &mut self.params
//!     }
//!
//!     fn nllf(&self, v: &Array1<f64>) -> reflfit::Result<f64> {
//!         Ok((v[0] - 3.0).powi(2) + (v[1] - 7.0).powi(2))
//!     }
//!
//!     fn degrees_of_freedom(&self) -> usize {
//!         10
//!     }
//! }
//!
//! let mut params = Parameters::new();
//! params.add_param_with_bounds("x", 5.0, 0.0, 10.0).unwrap();
//! params.add_param_with_bounds("y", 5.0, 0.0, 10.0).unwrap();
//!
//! let config = FitConfig::new().with_pop(20).with_steps(200).with_seed(42);
//! let mut driver = FitDriver::new(Bowl { params }, config, Transport::serial()).unwrap();
//! let result = driver.fit().unwrap();
//! assert!((result.point[0] - 3.0).abs() < 1e-2);
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod mapper;
pub mod optimizer;
pub mod parameters;
pub mod problem;
pub mod progress;
pub mod remote;
pub mod store;
pub mod uncertainty;

// Re-exports for convenience
pub use config::FitConfig;
pub use driver::{FitDriver, FitResult, MeshScan, ResynthResult, Termination};
pub use error::{FitError, Result};
pub use mapper::{Evaluator, Mapper, RetryPolicy, Transport};
pub use optimizer::{InitMethod, PosteriorTrace, Strategy, StrategyKind};
pub use parameters::{Bounds, Parameter, ParameterSpace, Parameters};
pub use problem::{FitProblem, ProblemSpec};
pub use progress::{CancelToken, ProgressEvent};
pub use remote::{start_remote_fit, HttpJobQueue, JobHandle, JobQueue};
pub use store::FitStore;

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
