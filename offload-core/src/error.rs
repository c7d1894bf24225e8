use thiserror::Error;

#[derive(Error, Debug)]
pub enum OffloadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid device: {0}")]
    InvalidDevice(String),

    #[error("work area unavailable: {0}")]
    WorkArea(String),

    #[error("watcher failed: {0}")]
    Watch(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, OffloadError>;
