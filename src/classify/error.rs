use crate::error::ApiError;

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("invalid node name {0:?}")]
    InvalidNode(String),

    #[error("Failed to read YAML file for {node}: {source}")]
    NotFound {
        node: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read YAML file for {node}: {source}")]
    Read {
        node: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML file for {node}: {reason}")]
    Parse { node: String, reason: String },

    #[error("git {operation} failed: {detail}")]
    Git {
        operation: &'static str,
        detail: String,
    },

    #[error("Failed to open nodes dir {dir} as git repository: {reason}")]
    NotARepository { dir: String, reason: String },

    #[error("Failed to open private key {path}: {reason}")]
    PrivateKey { path: String, reason: String },

    #[error("classification queue is closed")]
    QueueClosed,
}

impl ClassifyError {
    pub(crate) fn parse(node: &str, reason: impl Into<String>) -> Self {
        Self::Parse {
            node: node.to_owned(),
            reason: reason.into(),
        }
    }
}

impl From<ClassifyError> for ApiError {
    fn from(err: ClassifyError) -> Self {
        match err {
            ClassifyError::NotFound { .. } => Self::NotFound(err.to_string()),
            ClassifyError::InvalidNode(_) | ClassifyError::Parse { .. } => {
                Self::BadRequest(err.to_string())
            }
            ClassifyError::QueueClosed => Self::ServiceUnavailable(err.to_string()),
            _ => Self::Internal(err.into()),
        }
    }
}
