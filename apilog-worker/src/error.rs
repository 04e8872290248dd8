use apilog_common::database::ConnectionError;
use thiserror::Error;

/// Enumeration of errors that stop the worker from starting.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to load configuration from env: {0}")]
    EnvError(#[from] envconfig::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("failed to connect to database: {0}")]
    ConnectionError(#[from] ConnectionError),
    #[error("failed to bind health listener: {0}")]
    BindError(#[from] std::io::Error),
}
