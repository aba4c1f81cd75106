use crate::error::ApiError;

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("no exec task configured with name {0:?}")]
    UnknownTask(String),

    #[error("template render failed: {0}")]
    RenderFailed(String),

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("exec queue for command {0:?} is closed")]
    QueueClosed(String),
}

impl From<ExecError> for ApiError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::UnknownTask(_) => Self::NotFound(err.to_string()),
            ExecError::RenderFailed(_) => Self::BadRequest(err.to_string()),
            ExecError::Spawn { .. } | ExecError::QueueClosed(_) => Self::Internal(err.into()),
        }
    }
}
