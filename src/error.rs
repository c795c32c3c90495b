use thiserror::Error;

/// Error types for the reflfit library.
///
/// Variants are grouped the way a fit campaign fails: configuration errors
/// are raised before any evaluation, evaluation and transport errors while a
/// batch is in flight, and submission errors when handing a fit to a remote
/// queue.
#[derive(Error, Debug)]
pub enum FitError {
    /// An option was given a value outside its permitted set.
    #[error("invalid value '{value}' for option '{option}'; expected {allowed}")]
    InvalidOption {
        option: String,
        value: String,
        allowed: String,
    },

    /// The requested optimizer is not one of the known strategies.
    #[error("unknown fitter '{name}'; use {allowed}")]
    UnknownStrategy { name: String, allowed: String },

    /// Error for malformed bounds.
    #[error("Bounds error: {0}")]
    Bounds(#[from] crate::parameters::bounds::BoundsError),

    /// Error for parameter-related problems.
    #[error("Parameter error: {0}")]
    Parameter(#[from] crate::parameters::parameter::ParameterError),

    /// Error indicating a mismatch in vector dimensions.
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// A candidate vector left the feasible region and was not dispatched.
    #[error("row {row}: parameter '{parameter}' = {value} is outside [{lo}, {hi}]")]
    OutOfBounds {
        row: usize,
        parameter: String,
        value: f64,
        lo: f64,
        hi: f64,
    },

    /// The objective failed for one item of a batch.
    #[error("evaluation of batch item {index} failed: {message}")]
    Evaluation { index: usize, message: String },

    /// A worker died while evaluating a sub-batch.
    #[error("worker crashed on sub-batch {chunk}: {message}")]
    WorkerCrash { chunk: usize, message: String },

    /// The transport between mapper and workers failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Not every result of a batch arrived before the deadline.
    #[error("timed out waiting for batch {batch}: received {received} of {expected} results")]
    Timeout {
        batch: u64,
        received: usize,
        expected: usize,
    },

    /// The run was cancelled between or during batches.
    #[error("Fit cancelled")]
    Cancelled,

    /// The remote queue refused a job.
    #[error("Submission error: {0}")]
    Submission(String),

    /// A serialized payload does not follow the expected schema.
    #[error("Schema error: {0}")]
    Schema(String),

    /// The problem cannot perform the requested operation.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Invalid state in the algorithm or data structure.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Linear algebra error.
    #[error("Linear algebra error: {0}")]
    LinearAlgebra(String),

    /// I/O error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl FitError {
    /// Build an [`FitError::InvalidOption`] from displayable pieces.
    pub fn invalid_option(
        option: impl Into<String>,
        value: impl ToString,
        allowed: impl Into<String>,
    ) -> Self {
        FitError::InvalidOption {
            option: option.into(),
            value: value.to_string(),
            allowed: allowed.into(),
        }
    }

    /// True for errors that are raised before any evaluation starts.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            FitError::InvalidOption { .. }
                | FitError::UnknownStrategy { .. }
                | FitError::Bounds(_)
                | FitError::Parameter(_)
        )
    }

    /// True for errors caused by the evaluation transport rather than the
    /// objective itself.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            FitError::Transport(_) | FitError::Timeout { .. } | FitError::Http(_)
        )
    }
}

/// Result type alias for reflfit operations.
pub type Result<T> = std::result::Result<T, FitError>;
