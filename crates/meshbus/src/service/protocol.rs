// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Request/response frames exchanged on a service connection.
//!
//! ```text
//! +--------+---------+------+------------+----------------------------+
//! | "SVC1" | version | kind | request_id | body                       |
//! +--------+---------+------+------------+----------------------------+
//!   u32      u16       u8     u64
//!
//! request body:  method (str) | request (blob)
//! response body: call_state (u8) | error_kind (u8, 0 = none)
//!                | ret_state (i32) | error_msg (str) | response (blob)
//! ```
//!
//! Each frame travels inside one [`FrameCodec`](crate::transport::tcp::FrameCodec)
//! frame. Requests are pipelined; responses carry the id they answer.

use super::error::CallErrorKind;
use super::types::CallState;
use crate::wire::{WireError, WireReader, WireResult, WireWriter};

const SERVICE_MAGIC: u32 = 0x5356_4331; // "SVC1"
const PROTOCOL_VERSION: u16 = 1;

const KIND_REQUEST: u8 = 1;
const KIND_RESPONSE: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestFrame {
    pub request_id: u64,
    pub method: String,
    pub request: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResponseFrame {
    pub request_id: u64,
    pub call_state: CallState,
    pub error_kind: Option<CallErrorKind>,
    pub ret_state: i32,
    pub error_msg: String,
    pub response: Vec<u8>,
}

fn put_prefix(w: &mut WireWriter, kind: u8, request_id: u64) {
    w.put_u32(SERVICE_MAGIC)
        .put_u16(PROTOCOL_VERSION)
        .put_u8(kind)
        .put_u64(request_id);
}

fn get_prefix(r: &mut WireReader<'_>, expected_kind: u8) -> WireResult<u64> {
    r.expect_magic(SERVICE_MAGIC)?;
    let version = r.get_u16()?;
    if version > PROTOCOL_VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    let kind = r.get_u8()?;
    if kind != expected_kind {
        return Err(WireError::UnknownKind {
            what: "service frame",
            value: kind,
        });
    }
    r.get_u64()
}

impl RequestFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(32 + self.method.len() + self.request.len());
        put_prefix(&mut w, KIND_REQUEST, self.request_id);
        w.put_str(&self.method).put_blob(&self.request);
        w.into_inner()
    }

    pub fn decode(buf: &[u8]) -> WireResult<Self> {
        let mut r = WireReader::new(buf);
        let request_id = get_prefix(&mut r, KIND_REQUEST)?;
        Ok(Self {
            request_id,
            method: r.get_string()?,
            request: r.get_blob()?.to_vec(),
        })
    }
}

impl ResponseFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(40 + self.error_msg.len() + self.response.len());
        put_prefix(&mut w, KIND_RESPONSE, self.request_id);
        w.put_u8(self.call_state.to_u8())
            .put_u8(self.error_kind.map_or(0, CallErrorKind::to_u8))
            .put_i32(self.ret_state)
            .put_str(&self.error_msg)
            .put_blob(&self.response);
        w.into_inner()
    }

    pub fn decode(buf: &[u8]) -> WireResult<Self> {
        let mut r = WireReader::new(buf);
        let request_id = get_prefix(&mut r, KIND_RESPONSE)?;
        let state = r.get_u8()?;
        let call_state = CallState::from_u8(state).ok_or(WireError::UnknownKind {
            what: "call state",
            value: state,
        })?;
        let error_kind = match r.get_u8()? {
            0 => None,
            value => Some(CallErrorKind::from_u8(value).ok_or(WireError::UnknownKind {
                what: "call error",
                value,
            })?),
        };
        Ok(Self {
            request_id,
            call_state,
            error_kind,
            ret_state: r.get_i32()?,
            error_msg: r.get_string()?,
            response: r.get_blob()?.to_vec(),
        })
    }
}

/// Response id of a frame without decoding the rest.
pub(crate) fn peek_request_id(buf: &[u8]) -> WireResult<u64> {
    get_prefix(&mut WireReader::new(buf), KIND_RESPONSE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_with_error_kind() {
        let frame = ResponseFrame {
            request_id: 42,
            call_state: CallState::Failed,
            error_kind: Some(CallErrorKind::MethodNotFound),
            ret_state: -1,
            error_msg: "no method 'mul'".to_string(),
            response: Vec::new(),
        };
        let bytes = frame.encode();
        assert_eq!(peek_request_id(&bytes).expect("Failed to peek"), 42);
        assert_eq!(ResponseFrame::decode(&bytes).expect("Failed to decode"), frame);
    }

    #[test]
    fn test_request_is_not_a_response() {
        let req = RequestFrame {
            request_id: 1,
            method: "echo".to_string(),
            request: b"hi".to_vec(),
        };
        let bytes = req.encode();
        assert_eq!(RequestFrame::decode(&bytes).expect("Failed to decode"), req);
        assert!(matches!(
            ResponseFrame::decode(&bytes),
            Err(WireError::UnknownKind { .. })
        ));
    }

    #[test]
    fn test_newer_version_rejected() {
        let mut bytes = RequestFrame {
            request_id: 1,
            method: String::new(),
            request: Vec::new(),
        }
        .encode();
        bytes[4] = 9;
        assert_eq!(
            RequestFrame::decode(&bytes),
            Err(WireError::UnsupportedVersion(9))
        );
    }
}
