use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedError {
    #[error("parent task has already completed")]
    ParentGone,

    #[error("bound object is no longer bound to a scheduler")]
    Unbound,

    #[error("failed to set thread affinity: {0}")]
    Affinity(String),
}

pub type Result<T> = std::result::Result<T, SchedError>;
