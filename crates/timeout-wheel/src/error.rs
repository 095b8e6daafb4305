use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WheelError {
    #[error("Invalid wheel configuration: {0}")]
    InvalidConfig(String),

    /// `start` was called while the tick loop is already running.
    #[error("Timeout wheel is already running")]
    AlreadyRunning,

    #[error("Timeout wheel is not running")]
    NotRunning,
}

pub type Result<T> = std::result::Result<T, WheelError>;
