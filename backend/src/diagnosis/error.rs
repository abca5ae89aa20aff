#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Missing files: {0}")]
    MissingInput(String),
    #[error("Malformed request: {0}")]
    MalformedRequest(String),
    #[error("Upload part '{field}' exceeds {limit} bytes")]
    PayloadTooLarge { field: String, limit: usize },
    #[error("Invalid image: {0}")]
    InvalidImage(String),
    #[error("Invalid audio: {0}")]
    InvalidAudio(String),
    #[error("Degenerate audio: {0}")]
    DegenerateAudio(String),
    #[error("Model load error: {0}")]
    ModelLoad(String),
    #[error("Model error: {0}")]
    Model(#[from] tch::TchError),
    #[error("Inference timed out after {0} seconds")]
    Timeout(u64),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl InferenceError {
    /// Errors caused by the request itself rather than the service.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            InferenceError::MissingInput(_)
                | InferenceError::MalformedRequest(_)
                | InferenceError::PayloadTooLarge { .. }
        )
    }

    /// Message safe to return to clients. Library errors can carry source
    /// locations and file paths, so those are replaced by a generic message.
    pub fn public_message(&self) -> String {
        match self {
            InferenceError::Model(_) | InferenceError::ModelLoad(_) | InferenceError::Internal(_) => {
                "Inference failed".to_string()
            }
            other => other.to_string(),
        }
    }
}
