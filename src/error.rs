use thiserror::Error;

/// Convenience type alias for Results with ProbeMeshError
pub type Result<T> = std::result::Result<T, ProbeMeshError>;

/// Main error type for the probemesh control plane
///
/// Each variant maps to one error kind the system distinguishes: client
/// mistakes (`BadRequest`), credential failures (`Unauthorized`), missing
/// rows (`NotFound`), and infrastructure faults that kill the request.
#[derive(Error, Debug)]
pub enum ProbeMeshError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("control plane API error: {0}")]
    ControlPlaneApi(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("job bus error: {message}")]
    Bus { message: String },

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
