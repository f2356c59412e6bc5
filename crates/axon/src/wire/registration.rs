// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 axon contributors

//! Registration sample encoding.
//!
//! The broadcaster serializes all local entities into one
//! [`RegistrationBatch`] per refresh tick. Each sample inside the batch is
//! length-delimited; decoders parse the fields they know and skip the
//! rest, which is how newer peers add fields without breaking older ones.
//!
//! # Layout
//!
//! ```text
//! Batch:  "AXRG" | version u8 | context_id u64 | count u16 | sample*
//! Sample: len u32 | kind u8 | retract u8 | clock u64
//!         | host str | process_id u32 | entity str | instance_id u64
//!         | encoding str | type_name str | schema blob
//!         | reliability u8 | history u8 | depth u32
//!         | layer_flags u8 | shm_segment str | tcp_host str | tcp_port u16
//! ```

use super::{put_bytes, put_string, Cursor, WireError, WIRE_VERSION};
use crate::types::{DataTypeDescriptor, EntityId, EntityKind, History, QoS, Reliability};

const BATCH_MAGIC: &[u8; 4] = b"AXRG";

/// Layer availability flags advertised by publishers/servers.
pub const LAYER_SHM: u8 = 0b001;
pub const LAYER_UDP: u8 = 0b010;
pub const LAYER_TCP: u8 = 0b100;

/// One entity snapshot as carried on the discovery channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationSample {
    pub kind: EntityKind,
    /// Graceful unregistration: peers expire the entity immediately
    pub retract: bool,
    /// Liveliness clock, bumped every broadcast
    pub clock: u64,
    pub entity_id: EntityId,
    pub descriptor: DataTypeDescriptor,
    pub qos: QoS,
    /// Which layers the announcing endpoint offers (`LAYER_*` bits)
    pub layer_flags: u8,
    /// SHM segment name a publisher currently writes to (empty = none)
    pub shm_segment: String,
    /// Address peers dial to reach `tcp_port` (primary interface IP)
    pub tcp_host: String,
    /// TCP port a publisher/service listens on (0 = none)
    pub tcp_port: u16,
}

impl RegistrationSample {
    /// Sample for a bare process announcement.
    pub fn process(entity_id: EntityId, clock: u64) -> Self {
        Self {
            kind: EntityKind::Process,
            retract: false,
            clock,
            entity_id,
            descriptor: DataTypeDescriptor::raw(),
            qos: QoS::default(),
            layer_flags: 0,
            shm_segment: String::new(),
            tcp_host: String::new(),
            tcp_port: 0,
        }
    }

    /// Turn this sample into its retraction.
    #[must_use]
    pub fn retracted(mut self) -> Self {
        self.retract = true;
        self
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        let len_pos = out.len();
        out.extend_from_slice(&0u32.to_le_bytes()); // patched below

        out.push(self.kind as u8);
        out.push(u8::from(self.retract));
        out.extend_from_slice(&self.clock.to_le_bytes());

        put_string(out, &self.entity_id.host_name);
        out.extend_from_slice(&self.entity_id.process_id.to_le_bytes());
        put_string(out, &self.entity_id.entity);
        out.extend_from_slice(&self.entity_id.instance_id.to_le_bytes());

        put_string(out, &self.descriptor.encoding);
        put_string(out, &self.descriptor.type_name);
        put_bytes(out, &self.descriptor.schema);

        out.push(self.qos.reliability as u8);
        let (history, depth) = match self.qos.history {
            History::KeepLast(d) => (0u8, d),
            History::KeepAll => (1u8, 0),
        };
        out.push(history);
        out.extend_from_slice(&depth.to_le_bytes());

        out.push(self.layer_flags);
        put_string(out, &self.shm_segment);
        put_string(out, &self.tcp_host);
        out.extend_from_slice(&self.tcp_port.to_le_bytes());

        let body_len = (out.len() - len_pos - 4) as u32;
        out[len_pos..len_pos + 4].copy_from_slice(&body_len.to_le_bytes());
    }

    fn decode(body: &[u8]) -> Result<Self, WireError> {
        let mut cur = Cursor::new(body);

        let kind =
            EntityKind::from_u8(cur.u8()?).ok_or(WireError::Malformed("unknown entity kind"))?;
        let retract = cur.u8()? != 0;
        let clock = cur.u64()?;

        let host_name = cur.string()?;
        let process_id = cur.u32()?;
        let entity = cur.string()?;
        let instance_id = cur.u64()?;

        let encoding = cur.string()?;
        let type_name = cur.string()?;
        let schema = cur.bytes()?;

        let reliability = match cur.u8()? {
            0 => Reliability::BestEffort,
            1 => Reliability::Reliable,
            _ => return Err(WireError::Malformed("unknown reliability")),
        };
        let history_kind = cur.u8()?;
        let depth = cur.u32()?;
        let history = match history_kind {
            0 => History::KeepLast(depth),
            1 => History::KeepAll,
            _ => return Err(WireError::Malformed("unknown history kind")),
        };

        let layer_flags = cur.u8()?;
        let shm_segment = cur.string()?;
        let tcp_host = cur.string()?;
        let tcp_port = cur.u16()?;

        // Anything left is a field from a newer peer; ignore it.

        Ok(Self {
            kind,
            retract,
            clock,
            entity_id: EntityId {
                host_name,
                process_id,
                entity,
                instance_id,
            },
            descriptor: DataTypeDescriptor {
                encoding,
                type_name,
                schema,
            },
            qos: QoS {
                reliability,
                history,
            },
            layer_flags,
            shm_segment,
            tcp_host,
            tcp_port,
        })
    }
}

/// All samples of one broadcast tick, plus the sender's context id used
/// for loopback filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationBatch {
    /// Id of the sending middleware context (not the process: several
    /// contexts can share one process in tests)
    pub context_id: u64,
    pub samples: Vec<RegistrationSample>,
}

impl RegistrationBatch {
    pub fn new(context_id: u64) -> Self {
        Self {
            context_id,
            samples: Vec::new(),
        }
    }

    /// Serialize the batch for the discovery channel.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.samples.len() * 128);
        out.extend_from_slice(BATCH_MAGIC);
        out.push(WIRE_VERSION);
        out.extend_from_slice(&self.context_id.to_le_bytes());
        out.extend_from_slice(&(self.samples.len() as u16).to_le_bytes());
        for sample in &self.samples {
            sample.encode_into(&mut out);
        }
        out
    }

    /// Decode a batch. Individual samples that fail to parse are skipped
    /// and counted in `malformed`; the rest of the batch still applies.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), WireError> {
        let mut cur = Cursor::new(buf);
        if cur.take(4)? != BATCH_MAGIC {
            return Err(WireError::Malformed("bad batch magic"));
        }
        let version = cur.u8()?;
        if version != WIRE_VERSION {
            return Err(WireError::Version(version));
        }
        let context_id = cur.u64()?;
        let count = cur.u16()? as usize;

        let mut samples = Vec::with_capacity(count);
        let mut malformed = 0usize;
        for _ in 0..count {
            let len = cur.u32()? as usize;
            let body = cur.take(len)?;
            match RegistrationSample::decode(body) {
                Ok(sample) => samples.push(sample),
                Err(err) => {
                    log::debug!("[REG] dropping malformed sample: {err}");
                    malformed += 1;
                }
            }
        }

        Ok((
            Self {
                context_id,
                samples,
            },
            malformed,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(kind: EntityKind, topic: &str) -> RegistrationSample {
        RegistrationSample {
            kind,
            retract: false,
            clock: 7,
            entity_id: EntityId {
                host_name: "hostA".into(),
                process_id: 4242,
                entity: topic.into(),
                instance_id: 0xdead_beef_cafe_0001,
            },
            descriptor: DataTypeDescriptor {
                encoding: "proto".into(),
                type_name: "pkg.Temperature".into(),
                schema: vec![1, 2, 3, 4],
            },
            qos: QoS::reliable(8),
            layer_flags: LAYER_SHM | LAYER_TCP,
            shm_segment: "/axon_hostA_temp_01".into(),
            tcp_host: "192.168.1.20".into(),
            tcp_port: 40123,
        }
    }

    #[test]
    fn test_batch_roundtrip() {
        let mut batch = RegistrationBatch::new(99);
        batch.samples.push(sample(EntityKind::Publisher, "t/a"));
        batch
            .samples
            .push(sample(EntityKind::Subscriber, "t/b").retracted());

        let encoded = batch.encode();
        let (decoded, malformed) = RegistrationBatch::decode(&encoded).expect("decode");
        assert_eq!(malformed, 0);
        assert_eq!(decoded, batch);
    }

    #[test]
    fn test_truncated_batch_rejected() {
        let encoded = {
            let mut batch = RegistrationBatch::new(1);
            batch.samples.push(sample(EntityKind::Publisher, "t"));
            batch.encode()
        };
        let cut = &encoded[..encoded.len() - 3];
        assert!(RegistrationBatch::decode(cut).is_err());
    }

    #[test]
    fn test_unknown_trailing_fields_ignored() {
        // Simulate a newer peer appending a field to each sample record:
        // rebuild the batch with extra bytes inside the length prefix.
        let s = sample(EntityKind::Publisher, "t");
        let mut body = Vec::new();
        s.encode_into(&mut body);

        // Extend the single sample record by 4 unknown bytes
        let declared = u32::from_le_bytes([body[0], body[1], body[2], body[3]]) as usize;
        body.extend_from_slice(&[0xAA; 4]);
        body[0..4].copy_from_slice(&((declared + 4) as u32).to_le_bytes());

        let mut encoded = Vec::new();
        encoded.extend_from_slice(b"AXRG");
        encoded.push(WIRE_VERSION);
        encoded.extend_from_slice(&5u64.to_le_bytes());
        encoded.extend_from_slice(&1u16.to_le_bytes());
        encoded.extend_from_slice(&body);

        let (decoded, malformed) = RegistrationBatch::decode(&encoded).expect("decode");
        assert_eq!(malformed, 0);
        assert_eq!(decoded.samples[0], s);
    }

    #[test]
    fn test_bad_kind_counted_not_fatal() {
        let good = sample(EntityKind::Publisher, "t/good");
        let mut batch = RegistrationBatch::new(3);
        batch.samples.push(good.clone());
        let mut encoded = batch.encode();

        // Corrupt the entity kind of the (only) sample, then append a
        // pristine copy so the batch holds one bad and one good record.
        let kind_offset = 4 + 1 + 8 + 2 + 4; // magic+version+ctx+count+len
        encoded[kind_offset] = 0xEE;
        let mut body = Vec::new();
        good.encode_into(&mut body);
        encoded.extend_from_slice(&body);
        let count_offset = 4 + 1 + 8;
        encoded[count_offset..count_offset + 2].copy_from_slice(&2u16.to_le_bytes());

        let (decoded, malformed) = RegistrationBatch::decode(&encoded).expect("decode");
        assert_eq!(malformed, 1);
        assert_eq!(decoded.samples.len(), 1);
        assert_eq!(decoded.samples[0], good);
    }

    #[test]
    fn test_wrong_version_rejected() {
        let batch = RegistrationBatch::new(1);
        let mut encoded = batch.encode();
        encoded[4] = 250;
        assert_eq!(
            RegistrationBatch::decode(&encoded),
            Err(WireError::Version(250))
        );
    }
}
