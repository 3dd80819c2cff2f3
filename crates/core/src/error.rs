//! Typed error hierarchy for the filter core.
//!
//! Library code returns [`Error`]; the CLI wraps it in `anyhow::Result` at
//! call sites. Every error carries a machine-readable [`ErrorKind`] and a
//! human-readable cause.

/// Prefix used for every error surfaced to the host.
pub const HOST_ERROR_PREFIX: &str = "Waifu2x: ";

/// Coarse error category, stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad construction parameters. The filter is never created.
    Configuration,
    /// Model load or backend setup failed. The filter is never created.
    Initialization,
    /// Per-frame inference failure. Only the current frame is lost.
    Inference,
    /// Buffer or size mismatch between collaborators.
    Geometry,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Initialization => "initialization",
            Self::Inference => "inference",
            Self::Geometry => "geometry",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single dispatch through the inference engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InferenceError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("inference engine failure: {0}")]
    EngineFailure(String),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Configuration(String),

    #[error("{0} at initialization")]
    Initialization(String),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error("geometry mismatch: {0}")]
    Geometry(String),
}

impl Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn geometry(message: impl Into<String>) -> Self {
        Self::Geometry(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Initialization(_) => ErrorKind::Initialization,
            Self::Inference(_) => ErrorKind::Inference,
            Self::Geometry(_) => ErrorKind::Geometry,
        }
    }

    /// Machine-readable category string, e.g. `"configuration"`.
    pub fn category(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Message in the form the host shows to the user.
    pub fn host_message(&self) -> String {
        format!("{HOST_ERROR_PREFIX}{self}")
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_are_stable() {
        assert_eq!(Error::configuration("x").category(), "configuration");
        assert_eq!(Error::initialization("x").category(), "initialization");
        assert_eq!(Error::geometry("x").category(), "geometry");
        let inference: Error = InferenceError::EngineFailure("boom".into()).into();
        assert_eq!(inference.category(), "inference");
        assert_eq!(inference.kind(), ErrorKind::Inference);
    }

    #[test]
    fn host_message_carries_prefix_and_cause() {
        let err = Error::configuration("scale must be greater than or equal to 1 and be a power of 2");
        assert_eq!(
            err.host_message(),
            "Waifu2x: scale must be greater than or equal to 1 and be a power of 2"
        );

        let err = Error::initialization("failed open model file");
        assert_eq!(
            err.host_message(),
            "Waifu2x: failed open model file at initialization"
        );
    }

    #[test]
    fn inference_errors_display_their_cause() {
        let err: Error = InferenceError::InvalidParameter("width is zero".into()).into();
        assert_eq!(err.to_string(), "invalid parameter: width is zero");
    }
}
