use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Failures reported by collaborators while an execution runs.
///
/// The managers themselves (debounce, supervisor, ingestor, dispatcher) never
/// produce these; superseded or cancelled work is an outcome, not an error.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("history error: {0}")]
    History(String),

    #[error("upstream completion error: {0}")]
    Upstream(String),

    #[error("send error: {0}")]
    Send(String),
}
