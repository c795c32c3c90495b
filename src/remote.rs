//! Remote fit submission.
//!
//! A whole campaign can be handed to a job queue instead of being run
//! locally. The problem and the options are packed into a [`FitPayload`],
//! wrapped in a [`JobRequest`] for the fitter service and submitted; the
//! caller gets a [`JobHandle`] back and nothing more. Polling and result
//! retrieval happen outside this crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::FitConfig;
use crate::error::{FitError, Result};
use crate::parameters::ParameterSpace;
use crate::problem::{FitProblem, ProblemSpec};

/// Package identifier carried in every payload.
pub const PACKAGE: &str = "reflfit";

/// Protocol version of the payload and of the fitter service.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Service tag of the fit job runner.
pub const SERVICE: &str = "fitter";

/// Transport-neutral description of a fit job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitPayload {
    pub package: String,
    pub version: String,
    /// [`ProblemSpec`] as JSON
    pub problem: String,
    /// [`FitConfig`] as JSON
    pub options: String,
}

impl FitPayload {
    pub fn new(spec: &ProblemSpec, config: &FitConfig) -> Result<Self> {
        Ok(Self {
            package: PACKAGE.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            problem: spec.to_json()?,
            options: serde_json::to_string(config)?,
        })
    }

    /// Decode the problem, checking the package first.
    pub fn problem(&self) -> Result<ProblemSpec> {
        self.check_package()?;
        ProblemSpec::from_json(&self.problem)
    }

    /// Decode and validate the options.
    pub fn options(&self) -> Result<FitConfig> {
        self.check_package()?;
        let config: FitConfig = serde_json::from_str(&self.options)?;
        config.validate()?;
        Ok(config)
    }

    fn check_package(&self) -> Result<()> {
        if self.package != PACKAGE {
            return Err(FitError::Schema(format!(
                "payload is for package '{}', not '{}'",
                self.package, PACKAGE
            )));
        }
        Ok(())
    }
}

/// A job as handed to the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub service: String,
    pub version: String,
    /// Address to notify on completion (e-mail or handle)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify: Option<String>,
    /// Display title
    pub name: String,
    pub data: FitPayload,
}

/// Lifecycle of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What the queue returns for an accepted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: String,
    #[serde(default)]
    pub status: JobStatus,
}

/// A job queue accepting fit jobs.
pub trait JobQueue {
    /// Submit a job; errors mean no job was created.
    fn submit(&self, request: &JobRequest) -> Result<JobHandle>;
}

/// Job queue reached over HTTP: `POST {url}/jobs` with the request as JSON,
/// answered by the job handle as JSON.
#[derive(Debug, Clone)]
pub struct HttpJobQueue {
    client: reqwest::blocking::Client,
    url: String,
}

impl HttpJobQueue {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            url: url.into().trim_end_matches('/').to_string(),
        })
    }

    fn jobs_url(&self) -> String {
        format!("{}/jobs", self.url)
    }
}

impl JobQueue for HttpJobQueue {
    fn submit(&self, request: &JobRequest) -> Result<JobHandle> {
        let response = self
            .client
            .post(self.jobs_url())
            .json(request)
            .send()
            .map_err(|e| FitError::Submission(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(FitError::Submission(format!(
                "{} rejected job: {} {}",
                self.url,
                status,
                body.trim()
            )));
        }
        response
            .json::<JobHandle>()
            .map_err(|e| FitError::Submission(format!("malformed job handle: {}", e)))
    }
}

/// Submit a fit of `problem` with `config` to `queue`.
///
/// The options are validated and the objective is evaluated once at the
/// current parameter values; a problem that fails there is not submitted.
///
/// # Arguments
///
/// * `problem` - Problem at its starting values
/// * `config` - Options the remote fitter will run with
/// * `queue` - Destination queue
/// * `notify` - Optional completion notification target
///
/// # Returns
///
/// * The handle of the accepted job
pub fn start_remote_fit<P, Q>(
    problem: &P,
    config: &FitConfig,
    queue: &Q,
    notify: Option<&str>,
) -> Result<JobHandle>
where
    P: FitProblem + ?Sized,
    Q: JobQueue + ?Sized,
{
    config.validate()?;
    ParameterSpace::from_parameters(problem.parameters())?;

    let nllf = problem
        .current_nllf()
        .map_err(|e| FitError::Submission(format!("problem does not evaluate: {}", e)))?;
    if !nllf.is_finite() {
        return Err(FitError::Submission(format!(
            "objective at the starting point is {}",
            nllf
        )));
    }
    debug!("pre-submission nllf {:.6e}", nllf);

    let spec = ProblemSpec::from_problem(problem);
    let request = JobRequest {
        service: SERVICE.to_string(),
        version: PROTOCOL_VERSION.to_string(),
        notify: notify.filter(|n| !n.is_empty()).map(str::to_string),
        name: spec.title.clone(),
        data: FitPayload::new(&spec, config)?,
    };
    let handle = queue.submit(&request)?;
    info!("submitted '{}' as job {}", request.name, handle.id);
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::Parameters;
    use ndarray::Array1;
    use std::cell::RefCell;

    struct Line {
        params: Parameters,
    }

    impl FitProblem for Line {
        fn parameters(&self) -> &Parameters {
            &self.params
        }

        fn parameters_mut(&mut self) -> &mut Parameters {
            &mut self.params
        }

        fn nllf(&self, v: &Array1<f64>) -> Result<f64> {
            Ok(1.0 / v[0])
        }

        fn degrees_of_freedom(&self) -> usize {
            4
        }

        fn kind(&self) -> &str {
            "line"
        }
    }

    fn line(slope: f64) -> Line {
        let mut params = Parameters::new();
        params.add_param_with_bounds("slope", slope, -5.0, 5.0).unwrap();
        Line { params }
    }

    #[derive(Default)]
    struct Recording {
        jobs: RefCell<Vec<JobRequest>>,
    }

    impl JobQueue for Recording {
        fn submit(&self, request: &JobRequest) -> Result<JobHandle> {
            self.jobs.borrow_mut().push(request.clone());
            Ok(JobHandle {
                id: format!("job-{}", self.jobs.borrow().len()),
                status: JobStatus::Pending,
            })
        }
    }

    struct Refusing;

    impl JobQueue for Refusing {
        fn submit(&self, _request: &JobRequest) -> Result<JobHandle> {
            Err(FitError::Submission("queue full".to_string()))
        }
    }

    #[test]
    fn test_submission_payload() {
        let queue = Recording::default();
        let config = FitConfig::new().with_steps(50).with_seed(9);
        let handle = start_remote_fit(&line(2.0), &config, &queue, Some("me@example.org")).unwrap();
        assert_eq!(handle.id, "job-1");

        let jobs = queue.jobs.borrow();
        let job = &jobs[0];
        assert_eq!(job.service, SERVICE);
        assert_eq!(job.notify.as_deref(), Some("me@example.org"));
        assert_eq!(job.name, "line");
        assert_eq!(job.data.package, PACKAGE);
        assert_eq!(job.data.options().unwrap(), config);
        let spec = job.data.problem().unwrap();
        assert_eq!(spec.kind, "line");
        assert_eq!(spec.parameters.get("slope").unwrap().value(), 2.0);
    }

    #[test]
    fn test_failing_problem_is_not_submitted() {
        let queue = Recording::default();
        let err = start_remote_fit(&line(0.0), &FitConfig::new(), &queue, None).unwrap_err();
        assert!(matches!(err, FitError::Submission(_)));
        assert!(queue.jobs.borrow().is_empty());
    }

    #[test]
    fn test_refused_submission_returns_no_handle() {
        let err = start_remote_fit(&line(1.0), &FitConfig::new(), &Refusing, None).unwrap_err();
        assert!(matches!(err, FitError::Submission(_)));

        let bad = FitConfig::new().with_pop(0).with_starts(0);
        assert!(start_remote_fit(&line(1.0), &bad, &Refusing, None)
            .unwrap_err()
            .is_configuration());
    }

    #[test]
    fn test_payload_rejects_other_packages() {
        let spec = ProblemSpec::from_problem(&line(1.0));
        let mut payload = FitPayload::new(&spec, &FitConfig::new()).unwrap();
        payload.package = "other".to_string();
        assert!(matches!(payload.problem(), Err(FitError::Schema(_))));
    }

    #[test]
    fn test_job_handle_json() {
        let handle: JobHandle = serde_json::from_str(r#"{"id": "17"}"#).unwrap();
        assert_eq!(handle.status, JobStatus::Pending);
        let done: JobHandle = serde_json::from_str(r#"{"id": "18", "status": "done"}"#).unwrap();
        assert!(done.status.is_terminal());
        assert_eq!(
            HttpJobQueue::new("http://queue.local/").unwrap().jobs_url(),
            "http://queue.local/jobs"
        );
    }
}
