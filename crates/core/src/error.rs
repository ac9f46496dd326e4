use thiserror::Error;

/// Pipeline-level error taxonomy.
///
/// Configuration errors are the only fatal kind: they are raised at start
/// and refuse the pipeline. Everything else is self-contained by the stage
/// that hit it, counted, and never propagated across stage boundaries.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed input: {0}")]
    Malformed(String),

    #[error("Random source failure: {0}")]
    Random(String),

    #[error("Shutdown in progress")]
    Cancelled,

    #[error("General error: {0}")]
    General(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn config(msg: impl Into<String>) -> Self {
        PipelineError::Config(msg.into())
    }
}
