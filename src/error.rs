use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PiIoError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Operation failed: {0}")]
    OperationFailed(String),
    #[error("Feature not implemented: {0}")]
    FeatureNotImplemented(String),
    #[error("Configuration invalid: {0}")]
    ConfigInvalid(String),
    #[error("IO pin invalid: {0}")]
    IoPinInvalid(String),
}

pub type Result<T> = std::result::Result<T, PiIoError>;
