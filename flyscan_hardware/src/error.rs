use thiserror::Error;

#[derive(Debug, Error)]
pub enum HwError {
    #[error("timeout waiting for {0}")]
    Timeout(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("nothing loaded to execute")]
    NotArmed,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HwError>;
