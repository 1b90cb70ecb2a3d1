#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unknown processing status: {0}")]
    UnknownProcessingStatus(String),
}
