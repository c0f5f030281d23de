// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service value types.

use super::error::{CallErrorKind, ServiceError};
use crate::entity::{DataTypeInformation, ServiceId};

/// One method of a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ServiceMethodInformation {
    pub method_name: String,
    pub request_type: DataTypeInformation,
    pub response_type: DataTypeInformation,
}

impl ServiceMethodInformation {
    pub fn new(method_name: impl Into<String>) -> Self {
        Self {
            method_name: method_name.into(),
            ..Self::default()
        }
    }

    pub fn with_types(
        mut self,
        request_type: DataTypeInformation,
        response_type: DataTypeInformation,
    ) -> Self {
        self.request_type = request_type;
        self.response_type = response_type;
        self
    }
}

/// Outcome of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallState {
    #[default]
    None,
    Executed,
    Timeouted,
    Failed,
}

impl CallState {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Executed => 1,
            Self::Timeouted => 2,
            Self::Failed => 3,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::None,
            1 => Self::Executed,
            2 => Self::Timeouted,
            3 => Self::Failed,
            _ => return None,
        })
    }
}

/// Response of one server instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceResponse {
    pub call_state: CallState,
    pub server_id: ServiceId,
    pub method: ServiceMethodInformation,
    /// Value returned by the server's method callback
    pub ret_state: i32,
    pub response: Vec<u8>,
    pub error_msg: String,
    pub error_kind: Option<CallErrorKind>,
}

impl ServiceResponse {
    /// Response standing for a call that never executed.
    pub(crate) fn failure(
        server_id: ServiceId,
        method: ServiceMethodInformation,
        error: &ServiceError,
    ) -> Self {
        let call_state = if error.kind == CallErrorKind::Timeout {
            CallState::Timeouted
        } else {
            CallState::Failed
        };
        Self {
            call_state,
            server_id,
            method,
            ret_state: 0,
            response: Vec::new(),
            error_msg: error.to_string(),
            error_kind: Some(error.kind),
        }
    }

    pub fn is_executed(&self) -> bool {
        self.call_state == CallState::Executed
    }

    /// The failure this response carries, if any.
    pub fn error(&self) -> Option<ServiceError> {
        self.error_kind.map(|kind| {
            if self.error_msg.is_empty() {
                ServiceError::new(kind)
            } else {
                ServiceError::with_message(kind, self.error_msg.clone())
            }
        })
    }
}

/// Server-side session events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Connected { client: std::net::SocketAddr },
    Disconnected { client: std::net::SocketAddr },
}

/// Client-side connection events, one per server instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected { server: ServiceId },
    Disconnected { server: ServiceId },
}
