//! Error taxonomy for the drop pipeline
//!
//! Most of these are expected and recovered locally: the extraction chain
//! swallows `NotFound` and the decoder errors and moves on to the next
//! strategy. Only `HostProtocolFailure` is ever visible to the user, as a
//! drop rejected by the host.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DropError>;

#[derive(Debug, Error)]
pub enum DropError {
    /// Null or malformed input to an entry point. Always a local bug.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("out of memory")]
    OutOfMemory,

    /// The host's drag-target rejected a forwarded call.
    #[error("host drag-target failed: {0}")]
    HostProtocolFailure(String),

    /// No extraction strategy produced a file.
    #[error("no usable content found")]
    NotFound,

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("not a data: URI")]
    NotAStructuredURI,

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DropError {
    /// Errors that just mean "this strategy does not apply". The extraction
    /// chain falls through on anything raised before a file was appended,
    /// but only these pass quietly.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DropError::NotFound
                | DropError::MalformedPayload(_)
                | DropError::NotAStructuredURI
                | DropError::InvalidArgument(_)
        )
    }
}

/// A scripted hook declined to run or failed part way.
#[derive(Debug, Error)]
#[error("hook '{hook}' failed: {message}")]
pub struct HookError {
    pub hook: &'static str,
    pub message: String,
}

impl HookError {
    pub fn new(hook: &'static str, message: impl Into<String>) -> Self {
        Self {
            hook,
            message: message.into(),
        }
    }
}

/// The file-management callback could not relocate a file.
#[derive(Debug, Error)]
pub enum RelocateError {
    #[error("relocation declined: {0}")]
    Declined(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_errors() {
        assert!(DropError::NotFound.is_recoverable());
        assert!(DropError::NotAStructuredURI.is_recoverable());
        assert!(DropError::MalformedPayload("x".into()).is_recoverable());
        assert!(!DropError::OutOfMemory.is_recoverable());
        assert!(!DropError::HostProtocolFailure("E_FAIL".into()).is_recoverable());
        let io: DropError = std::io::Error::other("disk full").into();
        assert!(!io.is_recoverable());
    }
}
