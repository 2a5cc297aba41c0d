pub type KilnResult<T> = Result<T, KilnError>;

/// Errors surfaced by the render pipeline and its components.
///
/// The variants follow the failure taxonomy of the pipeline: `Validation`,
/// `Manifest` and `MissingExecutable` are fatal and never retried;
/// `Frame` and `Process` carry exhausted-retry failures up to the phase
/// state machine; `Cancelled` terminates the job at the next checkpoint.
#[derive(thiserror::Error, Debug)]
pub enum KilnError {
    #[error("validation error: {0}")]
    Validation(String),

    /// Manifest hash mismatch between scene creation and render time.
    /// Fatal: the scene on disk does not correspond to the recorded settings.
    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("renderer executable not found: {0}")]
    MissingExecutable(String),

    /// A supervised subprocess failed after its cold-restart budget was spent.
    #[error("process error: {0}")]
    Process(String),

    /// A single frame failed after its retry budget was spent.
    #[error("frame {frame} failed after {attempts} attempts: {message}")]
    Frame {
        frame: u32,
        attempts: u32,
        message: String,
    },

    #[error("assembly error: {0}")]
    Assembly(String),

    #[error("serialization error: {0}")]
    Serde(String),

    #[error("job cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KilnError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn manifest(msg: impl Into<String>) -> Self {
        Self::Manifest(msg.into())
    }

    pub fn process(msg: impl Into<String>) -> Self {
        Self::Process(msg.into())
    }

    pub fn assembly(msg: impl Into<String>) -> Self {
        Self::Assembly(msg.into())
    }

    pub fn serde(msg: impl Into<String>) -> Self {
        Self::Serde(msg.into())
    }

    /// True for errors where retrying the same work cannot succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Manifest(_) | Self::MissingExecutable(_) | Self::Cancelled
        )
    }
}
