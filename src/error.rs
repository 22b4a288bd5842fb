//! Pipeline error taxonomy.
//!
//! Every failure that crosses a pipeline boundary is one of these kinds. The
//! pipelines decide per kind whether to abort the job or skip one frame:
//!
//! | kind                          | batch mode | live mode        |
//! |-------------------------------|------------|------------------|
//! | `Source`                      | fatal      | fatal            |
//! | `Inference`/`InferenceTimeout`| fatal      | skip frame, log  |
//! | `Encoding`                    | fatal      | fatal            |
//! | `Busy`                        | rejected, no state change     |
//! | `Metadata`                    | fatal before the first frame  |
//! | `Config`                      | rejected before the job starts|

use std::time::Duration;

use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum PipelineError {
    /// Camera or file unreadable, or codec unsupported.
    #[error("source error: {0}")]
    Source(String),

    /// One frame's model call failed.
    #[error("inference error: {0}")]
    Inference(String),

    /// One frame's model call exceeded the configured per-frame timeout.
    #[error("inference timed out after {0:?}")]
    InferenceTimeout(Duration),

    /// Writing the output container or live display failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// A job is already running on this pipeline instance.
    #[error("pipeline busy: a job is already running")]
    Busy,

    /// Frame count or frame rate could not be read from the container.
    #[error("metadata error: {0}")]
    Metadata(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PipelineError {
    /// True for errors scoped to a single frame's model call.
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            PipelineError::Inference(_) | PipelineError::InferenceTimeout(_)
        )
    }

    pub(crate) fn source_failure(err: impl std::fmt::Display) -> Self {
        PipelineError::Source(err.to_string())
    }

    pub(crate) fn encoding(err: impl std::fmt::Display) -> Self {
        PipelineError::Encoding(err.to_string())
    }
}
