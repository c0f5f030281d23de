// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message serializer contract.
//!
//! The core never looks inside a message: typed publishers and
//! subscribers call exactly the four operations of [`MessageSerializer`].
//! Codec adapters (protobuf, flatbuffers, ...) live outside this crate.

use crate::entity::DataTypeInformation;
use std::marker::PhantomData;

pub trait MessageSerializer: Send + Sync + 'static {
    type Message;

    /// Type announced in registrations.
    fn data_type_information(&self) -> DataTypeInformation;

    /// Exact serialized size of `msg`.
    fn message_size(&self, msg: &Self::Message) -> usize;

    /// Fill `buf`, which is exactly `message_size(msg)` bytes long.
    fn serialize(&self, msg: &Self::Message, buf: &mut [u8]) -> bool;

    /// Decode one received payload; `None` drops the sample.
    fn deserialize(&self, buf: &[u8], data_type: &DataTypeInformation) -> Option<Self::Message>;
}

/// UTF-8 text, encoding `utf-8`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerializer;

impl MessageSerializer for StringSerializer {
    type Message = String;

    fn data_type_information(&self) -> DataTypeInformation {
        DataTypeInformation::new("std::string", "utf-8")
    }

    fn message_size(&self, msg: &String) -> usize {
        msg.len()
    }

    fn serialize(&self, msg: &String, buf: &mut [u8]) -> bool {
        if buf.len() != msg.len() {
            return false;
        }
        buf.copy_from_slice(msg.as_bytes());
        true
    }

    fn deserialize(&self, buf: &[u8], _data_type: &DataTypeInformation) -> Option<String> {
        match std::str::from_utf8(buf) {
            Ok(s) => Some(s.to_string()),
            Err(e) => {
                log::debug!("[SUB] dropping non UTF-8 payload: {}", e);
                None
            }
        }
    }
}

/// Opaque bytes, encoding `raw`.
///
/// The type name is configurable so several raw streams can still be
/// told apart in the directory.
#[derive(Debug, Clone, Default)]
pub struct BytesSerializer {
    type_name: String,
}

impl BytesSerializer {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
        }
    }
}

impl MessageSerializer for BytesSerializer {
    type Message = Vec<u8>;

    fn data_type_information(&self) -> DataTypeInformation {
        DataTypeInformation::new(self.type_name.clone(), "raw")
    }

    fn message_size(&self, msg: &Vec<u8>) -> usize {
        msg.len()
    }

    fn serialize(&self, msg: &Vec<u8>, buf: &mut [u8]) -> bool {
        if buf.len() != msg.len() {
            return false;
        }
        buf.copy_from_slice(msg);
        true
    }

    fn deserialize(&self, buf: &[u8], _data_type: &DataTypeInformation) -> Option<Vec<u8>> {
        Some(buf.to_vec())
    }
}

/// Serializer built from four closures, for one-off message types.
pub struct FnSerializer<M, S, D> {
    data_type: DataTypeInformation,
    size_and_write: S,
    read: D,
    _message: PhantomData<fn() -> M>,
}

impl<M, S, D> FnSerializer<M, S, D>
where
    S: Fn(&M, Option<&mut [u8]>) -> usize,
    D: Fn(&[u8]) -> Option<M>,
{
    /// `size_and_write(msg, None)` returns the size; with `Some(buf)` it
    /// fills `buf` and returns the bytes written.
    pub fn new(data_type: DataTypeInformation, size_and_write: S, read: D) -> Self {
        Self {
            data_type,
            size_and_write,
            read,
            _message: PhantomData,
        }
    }
}

impl<M, S, D> MessageSerializer for FnSerializer<M, S, D>
where
    M: 'static,
    S: Fn(&M, Option<&mut [u8]>) -> usize + Send + Sync + 'static,
    D: Fn(&[u8]) -> Option<M> + Send + Sync + 'static,
{
    type Message = M;

    fn data_type_information(&self) -> DataTypeInformation {
        self.data_type.clone()
    }

    fn message_size(&self, msg: &M) -> usize {
        (self.size_and_write)(msg, None)
    }

    fn serialize(&self, msg: &M, buf: &mut [u8]) -> bool {
        let expected = buf.len();
        (self.size_and_write)(msg, Some(buf)) == expected
    }

    fn deserialize(&self, buf: &[u8], _data_type: &DataTypeInformation) -> Option<M> {
        (self.read)(buf)
    }
}
