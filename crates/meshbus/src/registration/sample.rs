// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Registration sample: the descriptor every entity (re-)broadcasts.

use crate::entity::{DataTypeInformation, EntityId, ServiceId, TopicId};
use crate::process;
use crate::service::ServiceMethodInformation;
use crate::transport::{Layer, LayerSet};
use crate::wire::{WireError, WireReader, WireResult, WireWriter};

const SAMPLE_MAGIC: u32 = 0x4D42_5231; // "MBR1"
const SAMPLE_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RegistrationCmd {
    Register = 1,
    Unregister = 2,
}

impl RegistrationCmd {
    fn from_u8(v: u8) -> WireResult<Self> {
        match v {
            1 => Ok(Self::Register),
            2 => Ok(Self::Unregister),
            value => Err(WireError::UnknownKind {
                what: "registration cmd",
                value,
            }),
        }
    }
}

/// Role of a registered entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntityKind {
    Publisher = 1,
    Subscriber = 2,
    Server = 3,
    Client = 4,
}

impl EntityKind {
    fn from_u8(v: u8) -> WireResult<Self> {
        match v {
            1 => Ok(Self::Publisher),
            2 => Ok(Self::Subscriber),
            3 => Ok(Self::Server),
            4 => Ok(Self::Client),
            value => Err(WireError::UnknownKind {
                what: "entity kind",
                value,
            }),
        }
    }

    /// Role this one matches against.
    pub fn opposite(self) -> Self {
        match self {
            Self::Publisher => Self::Subscriber,
            Self::Subscriber => Self::Publisher,
            Self::Server => Self::Client,
            Self::Client => Self::Server,
        }
    }

    pub fn is_topic(self) -> bool {
        matches!(self, Self::Publisher | Self::Subscriber)
    }
}

/// Service method as advertised, with its call counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRegistration {
    pub info: ServiceMethodInformation,
    pub call_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationSample {
    pub cmd: RegistrationCmd,
    pub kind: EntityKind,
    pub entity: EntityId,
    pub unit_name: String,
    /// Topic name for publishers/subscribers, service name otherwise
    pub name: String,
    pub data_type: DataTypeInformation,
    pub layers: LayerSet,
    /// SHM memfile names (publishers)
    pub shm_memfiles: Vec<String>,
    /// TCP data port (publishers), 0 when TCP is off
    pub tcp_port: u16,
    /// Request/response port (servers)
    pub service_port: u16,
    pub methods: Vec<MethodRegistration>,
    /// Messages a subscriber detected as missing
    pub drop_count: u64,
    /// Number of matched peers
    pub connections: u32,
    pub timestamp_us: i64,
}

impl RegistrationSample {
    pub fn new(kind: EntityKind, entity: EntityId, name: impl Into<String>) -> Self {
        Self {
            cmd: RegistrationCmd::Register,
            kind,
            entity,
            unit_name: String::new(),
            name: name.into(),
            data_type: DataTypeInformation::default(),
            layers: LayerSet::empty(),
            shm_memfiles: Vec::new(),
            tcp_port: 0,
            service_port: 0,
            methods: Vec::new(),
            drop_count: 0,
            connections: 0,
            timestamp_us: process::now_us(),
        }
    }

    /// Same descriptor turned into an unregistration.
    pub fn to_unregister(&self) -> Self {
        let mut sample = self.clone();
        sample.cmd = RegistrationCmd::Unregister;
        sample.timestamp_us = process::now_us();
        sample
    }

    pub fn topic_id(&self) -> TopicId {
        TopicId::new(self.entity.clone(), self.name.clone())
    }

    pub fn service_id(&self) -> ServiceId {
        ServiceId::new(self.entity.clone(), self.name.clone())
    }

    pub fn has_layer(&self, layer: Layer) -> bool {
        self.layers.contains(layer)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(256);
        w.put_u32(SAMPLE_MAGIC)
            .put_u16(SAMPLE_VERSION)
            .put_u8(self.cmd as u8)
            .put_u8(self.kind as u8)
            .put_u64(self.entity.entity_id)
            .put_i32(self.entity.process_id)
            .put_str(&self.entity.host_name)
            .put_str(&self.unit_name)
            .put_str(&self.name);
        put_data_type(&mut w, &self.data_type);
        w.put_u8(self.layers.bits())
            .put_u32(self.shm_memfiles.len() as u32);
        for memfile in &self.shm_memfiles {
            w.put_str(memfile);
        }
        w.put_u16(self.tcp_port)
            .put_u16(self.service_port)
            .put_u32(self.methods.len() as u32);
        for method in &self.methods {
            w.put_str(&method.info.method_name);
            put_data_type(&mut w, &method.info.request_type);
            put_data_type(&mut w, &method.info.response_type);
            w.put_u64(method.call_count);
        }
        w.put_u64(self.drop_count)
            .put_u32(self.connections)
            .put_i64(self.timestamp_us);
        w.into_inner()
    }

    pub fn decode(buf: &[u8]) -> WireResult<Self> {
        let mut r = WireReader::new(buf);
        r.expect_magic(SAMPLE_MAGIC)?;
        let version = r.get_u16()?;
        if version > SAMPLE_VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }
        let cmd = RegistrationCmd::from_u8(r.get_u8()?)?;
        let kind = EntityKind::from_u8(r.get_u8()?)?;
        let entity_id = r.get_u64()?;
        let process_id = r.get_i32()?;
        let host_name = r.get_string()?;
        let unit_name = r.get_string()?;
        let name = r.get_string()?;
        let data_type = get_data_type(&mut r)?;
        let layers = LayerSet::from_bits(r.get_u8()?);

        let memfile_count = bounded_count(&mut r)?;
        let mut shm_memfiles = Vec::with_capacity(memfile_count);
        for _ in 0..memfile_count {
            shm_memfiles.push(r.get_string()?);
        }
        let tcp_port = r.get_u16()?;
        let service_port = r.get_u16()?;

        let method_count = bounded_count(&mut r)?;
        let mut methods = Vec::with_capacity(method_count);
        for _ in 0..method_count {
            let method_name = r.get_string()?;
            let request_type = get_data_type(&mut r)?;
            let response_type = get_data_type(&mut r)?;
            let call_count = r.get_u64()?;
            methods.push(MethodRegistration {
                info: ServiceMethodInformation {
                    method_name,
                    request_type,
                    response_type,
                },
                call_count,
            });
        }

        Ok(Self {
            cmd,
            kind,
            entity: EntityId::new(entity_id, process_id, host_name),
            unit_name,
            name,
            data_type,
            layers,
            shm_memfiles,
            tcp_port,
            service_port,
            methods,
            drop_count: r.get_u64()?,
            connections: r.get_u32()?,
            timestamp_us: r.get_i64()?,
        })
    }
}

fn put_data_type(w: &mut WireWriter, dti: &DataTypeInformation) {
    w.put_str(&dti.name)
        .put_str(&dti.encoding)
        .put_blob(&dti.descriptor);
}

fn get_data_type(r: &mut WireReader<'_>) -> WireResult<DataTypeInformation> {
    Ok(DataTypeInformation {
        name: r.get_string()?,
        encoding: r.get_string()?,
        descriptor: r.get_blob()?.to_vec(),
    })
}

/// Element count that cannot exceed what the remaining bytes could hold.
fn bounded_count(r: &mut WireReader<'_>) -> WireResult<usize> {
    let count = r.get_u32()? as usize;
    // every element needs at least a 4-byte length prefix
    let max = r.remaining() / 4;
    if count > max {
        return Err(WireError::TooLarge { len: count, max });
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publisher_sample() -> RegistrationSample {
        let mut s = RegistrationSample::new(
            EntityKind::Publisher,
            EntityId::new(11, 4242, "node-a"),
            "camera/front",
        );
        s.unit_name = "vision".to_string();
        s.data_type =
            DataTypeInformation::new("Image", "proto").with_descriptor(vec![0u8, 1, 2, 255]);
        s.layers = LayerSet::from_layers(&[Layer::Shm, Layer::Tcp]);
        s.shm_memfiles = vec!["/mb_4242_11_0".to_string(), "/mb_4242_11_1".to_string()];
        s.tcp_port = 40_123;
        s
    }

    #[test]
    fn test_publisher_sample_wire_format() {
        let sample = publisher_sample();
        let decoded = RegistrationSample::decode(&sample.encode()).expect("Failed to decode");
        assert_eq!(decoded, sample);
        assert_eq!(decoded.entity.process_id, 4242);
        assert_eq!(decoded.shm_memfiles.len(), 2);
    }

    #[test]
    fn test_server_sample_carries_methods() {
        let mut s =
            RegistrationSample::new(EntityKind::Server, EntityId::new(5, 1, "h"), "math");
        s.service_port = 5555;
        s.methods.push(MethodRegistration {
            info: ServiceMethodInformation::new("add"),
            call_count: 3,
        });
        let decoded = RegistrationSample::decode(&s.encode()).expect("Failed to decode");
        assert_eq!(decoded.methods[0].info.method_name, "add");
        assert_eq!(decoded.methods[0].call_count, 3);
        assert_eq!(decoded.service_id().service_name, "math");
    }

    #[test]
    fn test_unregister_keeps_identity() {
        let sample = publisher_sample();
        let un = sample.to_unregister();
        assert_eq!(un.cmd, RegistrationCmd::Unregister);
        assert_eq!(un.entity, sample.entity);
    }

    #[test]
    fn test_decode_rejects_bad_kind_and_huge_counts() {
        let mut bytes = publisher_sample().encode();
        bytes[7] = 9; // kind byte after magic(4) version(2) cmd(1)
        assert!(matches!(
            RegistrationSample::decode(&bytes),
            Err(WireError::UnknownKind { .. })
        ));

        let truncated = &publisher_sample().encode()[..20];
        assert!(RegistrationSample::decode(truncated).is_err());
    }

    #[test]
    fn test_kind_opposite() {
        assert_eq!(EntityKind::Publisher.opposite(), EntityKind::Subscriber);
        assert_eq!(EntityKind::Client.opposite(), EntityKind::Server);
        assert!(!EntityKind::Server.is_topic());
    }
}
