use std::fmt;

use thiserror::Error;

/// Failure modes surfaced by primitive creation and execution.
///
/// `Unsupported` means "try another implementation". It carries no reason; callers cannot
/// tell which creation check rejected the descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConvError {
    #[error("convolution is not supported by this implementation")]
    Unsupported,
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("failed to allocate {bytes} bytes of scratchpad memory")]
    OutOfMemory { bytes: usize },
    #[error("kernel execution failed: {0}")]
    Execution(String),
}

impl ConvError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ConvError::InvalidArguments(message.into())
    }

    pub fn execution(message: impl Into<String>) -> Self {
        ConvError::Execution(message.into())
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, ConvError::Unsupported)
    }

    pub fn status(&self) -> Status {
        match self {
            ConvError::Unsupported => Status::Unsupported,
            ConvError::InvalidArguments(_) => Status::InvalidArguments,
            ConvError::OutOfMemory { .. } => Status::OutOfMemory,
            ConvError::Execution(_) => Status::RuntimeError,
        }
    }
}

pub type ConvResult<T> = Result<T, ConvError>;

/// Flat status code for callers that do not want to match on [`ConvError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    Unsupported,
    InvalidArguments,
    OutOfMemory,
    RuntimeError,
}

impl Status {
    pub fn of<T>(result: &ConvResult<T>) -> Status {
        match result {
            Ok(_) => Status::Success,
            Err(err) => err.status(),
        }
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Status::Success => "success",
            Status::Unsupported => "unimplemented",
            Status::InvalidArguments => "invalid_arguments",
            Status::OutOfMemory => "out_of_memory",
            Status::RuntimeError => "runtime_error",
        };
        f.write_str(label)
    }
}
