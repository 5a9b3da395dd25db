mod path;
mod rpc;
mod naming_api;
mod storage_api;

pub use path::*;
pub use rpc::*;
pub use naming_api::*;
pub use storage_api::*;

use thiserror::Error;

#[macro_use]
extern crate log;

/// Well-known port for the client-facing service interface of the naming
/// server.
pub const SERVICE_PORT: u16 = 6000;
/// Well-known port for the registration interface of the naming server.
pub const REGISTRATION_PORT: u16 = 6001;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DfsError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("out of bounds: {0}")]
    OutOfBounds(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("already registered: {0}")]
    AlreadyRegistered(String),
    #[error("missing argument: {0}")]
    MissingArgument(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl DfsError {
    /// Stable wire tag for the error kind, shared with `from_kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            DfsError::NotFound(_) => "not_found",
            DfsError::OutOfBounds(_) => "out_of_bounds",
            DfsError::InvalidArgument(_) => "invalid_argument",
            DfsError::InvalidState(_) => "invalid_state",
            DfsError::AlreadyRegistered(_) => "already_registered",
            DfsError::MissingArgument(_) => "missing_argument",
            DfsError::IoError(_) => "io_error",
            DfsError::Transport(_) => "transport",
            DfsError::Internal(_) => "internal",
        }
    }

    pub fn from_kind(kind: &str, message: String) -> Self {
        match kind {
            "not_found" => DfsError::NotFound(message),
            "out_of_bounds" => DfsError::OutOfBounds(message),
            "invalid_argument" => DfsError::InvalidArgument(message),
            "invalid_state" => DfsError::InvalidState(message),
            "already_registered" => DfsError::AlreadyRegistered(message),
            "missing_argument" => DfsError::MissingArgument(message),
            "io_error" => DfsError::IoError(message),
            "transport" => DfsError::Transport(message),
            _ => DfsError::Internal(message),
        }
    }

    /// The bare message payload, without the kind prefix `Display` adds.
    pub fn message(&self) -> &str {
        match self {
            DfsError::NotFound(m)
            | DfsError::OutOfBounds(m)
            | DfsError::InvalidArgument(m)
            | DfsError::InvalidState(m)
            | DfsError::AlreadyRegistered(m)
            | DfsError::MissingArgument(m)
            | DfsError::IoError(m)
            | DfsError::Transport(m)
            | DfsError::Internal(m) => m,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DfsError::NotFound(_))
    }
}

pub type DfsResult<T> = std::result::Result<T, DfsError>;

impl From<std::io::Error> for DfsError {
    fn from(err: std::io::Error) -> Self {
        DfsError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for DfsError {
    fn from(err: serde_json::Error) -> Self {
        DfsError::Internal(format!("json encode failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_round_trip() {
        let errs = [
            DfsError::NotFound("a".to_string()),
            DfsError::OutOfBounds("b".to_string()),
            DfsError::InvalidArgument("c".to_string()),
            DfsError::InvalidState("d".to_string()),
            DfsError::AlreadyRegistered("e".to_string()),
            DfsError::MissingArgument("f".to_string()),
            DfsError::IoError("g".to_string()),
            DfsError::Transport("h".to_string()),
            DfsError::Internal("i".to_string()),
        ];
        for err in errs {
            let rebuilt = DfsError::from_kind(err.kind(), err.message().to_string());
            assert_eq!(rebuilt, err);
        }
    }
}
