use thiserror::Error;

/// Failures surfaced by the feed components.
///
/// Internals propagate `anyhow::Error` with context; each component boundary
/// flattens the chain into one of these variants so the control surface can turn
/// it into a `(success, message)` pair.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Artifact fetch failed or produced an empty file. Partial files are removed.
    #[error("failed to provision model artifact {artifact}: {reason}")]
    Provisioning { artifact: String, reason: String },

    /// The artifact was present but the model could not be instantiated.
    #[error("failed to load model {variant}: {reason}")]
    Load { variant: String, reason: String },

    /// Opening or validating a capture source failed.
    #[error("capture setup failed: {0}")]
    Capture(String),

    /// The detection loop ended on an error.
    #[error("detection loop failed: {0}")]
    RuntimeLoop(String),

    /// Invalid input, or an operation refused in the current worker state.
    #[error("{0}")]
    Rejected(String),
}

impl FeedError {
    pub(crate) fn capture(err: anyhow::Error) -> Self {
        Self::Capture(format!("{:#}", err))
    }

    pub(crate) fn runtime(err: anyhow::Error) -> Self {
        Self::RuntimeLoop(format!("{:#}", err))
    }

    pub(crate) fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(message.into())
    }
}

pub type FeedResult<T> = std::result::Result<T, FeedError>;
