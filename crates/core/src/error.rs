#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// One or more environment prerequisites for a build are absent.
    #[error("Missing build prerequisites: {}", .0.join("; "))]
    PrerequisitesMissing(Vec<String>),

    #[error("Internal error: {0}")]
    Internal(String),
}
