// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crate-level error type.

use crate::service::ServiceError;
use crate::transport::shm::ShmError;
use crate::wire::WireError;
use std::fmt;
use std::io;

/// Errors returned by constructors and lifecycle operations.
///
/// Data-path operations (`send`, `set_receive_callback`, ...) report
/// through `bool` returns instead; see the individual methods.
#[derive(Debug)]
pub enum Error {
    /// The owning context has not been initialized
    NotInitialized,
    /// The owning context was finalized while the entity was alive
    AlreadyFinalized,
    /// Topic or service name is empty or contains NUL
    InvalidTopicName(String),
    /// Configuration value rejected
    InvalidConfig(String),
    /// Socket or thread creation failed
    Io(io::Error),
    /// Shared memory layer failure
    Shm(ShmError),
    /// Malformed wire data
    Wire(WireError),
    /// Service call failure
    Service(ServiceError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotInitialized => write!(f, "Context not initialized"),
            Error::AlreadyFinalized => write!(f, "Context already finalized"),
            Error::InvalidTopicName(name) => write!(f, "Invalid topic name: {:?}", name),
            Error::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Shm(e) => write!(f, "Shared memory error: {}", e),
            Error::Wire(e) => write!(f, "Wire error: {}", e),
            Error::Service(e) => write!(f, "Service error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Shm(e) => Some(e),
            Error::Wire(e) => Some(e),
            Error::Service(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<ShmError> for Error {
    fn from(e: ShmError) -> Self {
        Error::Shm(e)
    }
}

impl From<WireError> for Error {
    fn from(e: WireError) -> Self {
        Error::Wire(e)
    }
}

impl From<ServiceError> for Error {
    fn from(e: ServiceError) -> Self {
        Error::Service(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Reject empty names and names with embedded NUL bytes.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('\0') {
        return Err(Error::InvalidTopicName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("chatter").is_ok());
        assert!(matches!(validate_name(""), Err(Error::InvalidTopicName(_))));
        assert!(validate_name("a\0b").is_err());
    }

    #[test]
    fn test_io_error_source() {
        let err: Error = io::Error::new(io::ErrorKind::AddrInUse, "busy").into();
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("busy"));
    }
}
