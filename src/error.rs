//! Error types for the comparison pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while capturing, diffing or storing screenshots
#[derive(Error, Debug)]
pub enum Error {
    /// A required request field was missing or empty
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The page could not be loaded or never settled
    #[error("Navigation failed: {0}")]
    NavigationError(String),

    /// The screenshot could not be taken or decoded
    #[error("Capture failed: {0}")]
    CaptureError(String),

    /// Reference and test rasters have different sizes
    #[error("Dimension mismatch: reference is {reference_width}x{reference_height}, test is {test_width}x{test_height}")]
    DimensionMismatch {
        reference_width: u32,
        reference_height: u32,
        test_width: u32,
        test_height: u32,
    },

    /// Tolerance outside the normalized [0, 1] range
    #[error("Invalid tolerance {0}: expected a value in [0, 1]")]
    InvalidTolerance(f64),

    /// Result store could not be written
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Requested artifact does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Raster bytes could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// A viewport job failed; wraps the underlying cause
    #[error("Pipeline failed at viewport '{viewport}'")]
    PipelineError {
        viewport: String,
        #[source]
        source: Box<Error>,
    },

    /// The run was cancelled by the caller
    #[error("Comparison cancelled")]
    Cancelled,

    /// Operation timed out
    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// CDP-specific error
    #[cfg(feature = "cdp")]
    #[error("CDP error: {0}")]
    CdpError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wrap `self` as the cause of a failed viewport job.
    ///
    /// Errors that already describe the whole run (cancellation, timeouts,
    /// nested pipeline failures) are passed through unchanged.
    pub fn in_viewport(self, viewport: &str) -> Self {
        match self {
            Error::PipelineError { .. } | Error::Cancelled | Error::Timeout(_) => self,
            other => Error::PipelineError {
                viewport: viewport.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// This error and its causes on one line, for logging.
    pub fn describe(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            out.push_str(": caused by: ");
            out.push_str(&cause.to_string());
            source = cause.source();
        }
        out
    }

    /// Whether the caller is at fault (maps to HTTP 400).
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::InvalidRequest(_))
    }
}

#[cfg(feature = "cdp")]
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::CdpError(err.to_string())
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::Codec(err.to_string())
    }
}
