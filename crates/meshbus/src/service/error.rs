// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for service calls.

use std::fmt;

/// Result type for service calls
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Why a call did not execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallErrorKind {
    /// The socket closed while the call was pending
    ConnectionClosed,
    /// The server is not (or no longer) known
    UnknownServer,
    /// Malformed frame or unexpected response id
    ProtocolError,
    /// Context finalized or client dropped
    StoppedByUser,
    /// No response within the timeout
    Timeout,
    /// Server has no callback for the method
    MethodNotFound,
    /// Server-side failure (panicking callback, ...)
    Failed,
}

impl CallErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionClosed => "CONNECTION_CLOSED",
            Self::UnknownServer => "UNKNOWN_SERVER",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::StoppedByUser => "STOPPED_BY_USER",
            Self::Timeout => "TIMEOUT",
            Self::MethodNotFound => "METHOD_NOT_FOUND",
            Self::Failed => "FAILED",
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Self::ConnectionClosed => 1,
            Self::UnknownServer => 2,
            Self::ProtocolError => 3,
            Self::StoppedByUser => 4,
            Self::Timeout => 5,
            Self::MethodNotFound => 6,
            Self::Failed => 7,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::ConnectionClosed,
            2 => Self::UnknownServer,
            3 => Self::ProtocolError,
            4 => Self::StoppedByUser,
            5 => Self::Timeout,
            6 => Self::MethodNotFound,
            7 => Self::Failed,
            _ => return None,
        })
    }
}

impl fmt::Display for CallErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceError {
    pub kind: CallErrorKind,
    pub message: Option<String>,
}

impl ServiceError {
    pub fn new(kind: CallErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: CallErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }
}

impl From<CallErrorKind> for ServiceError {
    fn from(kind: CallErrorKind) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(msg) = &self.message {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

impl std::error::Error for ServiceError {}
