// Copyright 2024 The docdb-core Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Stored-value primitives: control fields, payload encoding, and TTL/expiration
//! arithmetic. Mirrors the split between `ValueControlFields` and
//! `docdb::Value` in the teacher's value encoding, collapsed into one module
//! since this crate only reads values, never writes them.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{DocDbError, Result};
use crate::key::{EncodedHybridTime, HybridTime, KeyEntryValue};

mod control_tag {
    pub const USER_TIMESTAMP: u8 = 0x21;
    pub const TTL: u8 = 0x22;
    pub const INTENT_HYBRID_TIME: u8 = 0x23;
}

mod entry_tag {
    pub const TOMBSTONE: u8 = 0x30;
    pub const PACKED_ROW: u8 = 0x31;
    pub const PRIMITIVE: u8 = 0x32;
}

/// TTL in microseconds. `MAX` means "no expiry". A negative value is the
/// sentinel for "inherit the table/parent default, flip sign when a child
/// that isn't otherwise overridden activates it".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ttl(pub i64);

impl Ttl {
    pub const MAX: Ttl = Ttl(i64::MAX);

    pub fn is_infinite(self) -> bool {
        self == Ttl::MAX
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }
}

/// Per-user-visible-value metadata decoded from the leading bytes of a stored
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValueControlFields {
    pub timestamp: Option<i64>,
    pub ttl: Option<Ttl>,
    /// Legacy corruption artifact: a hybrid time that was mistakenly prefixed
    /// onto some packed-column payloads. Tracked here but never acted on by
    /// this module directly -- see `crate::reader` for where it is stripped.
    pub intent_hybrid_time: Option<EncodedHybridTime>,
}

impl ValueControlFields {
    pub fn has_timestamp(&self) -> bool {
        self.timestamp.is_some()
    }

    /// Effective ttl, defaulting to "no expiry" when absent.
    pub fn ttl_or_max(&self) -> Ttl {
        self.ttl.unwrap_or(Ttl::MAX)
    }

    pub fn decode(buf: &mut &[u8]) -> Result<Self> {
        let mut fields = ValueControlFields::default();
        loop {
            match buf.first() {
                Some(&control_tag::USER_TIMESTAMP) => {
                    let mut rest = &buf[1..];
                    if rest.len() < 8 {
                        return Err(DocDbError::corruption("truncated user timestamp"));
                    }
                    fields.timestamp = Some(rest.get_i64());
                    *buf = rest;
                }
                Some(&control_tag::TTL) => {
                    let mut rest = &buf[1..];
                    if rest.len() < 8 {
                        return Err(DocDbError::corruption("truncated ttl"));
                    }
                    fields.ttl = Some(Ttl(rest.get_i64()));
                    *buf = rest;
                }
                Some(&control_tag::INTENT_HYBRID_TIME) => {
                    let mut rest = &buf[1..];
                    fields.intent_hybrid_time = Some(EncodedHybridTime::consume_from(&mut rest)?);
                    *buf = rest;
                }
                _ => break,
            }
        }
        Ok(fields)
    }

    pub fn append_to(&self, buf: &mut BytesMut) {
        if let Some(ts) = self.timestamp {
            buf.put_u8(control_tag::USER_TIMESTAMP);
            buf.put_i64(ts);
        }
        if let Some(ttl) = self.ttl {
            buf.put_u8(control_tag::TTL);
            buf.put_i64(ttl.0);
        }
        if let Some(iht) = self.intent_hybrid_time {
            buf.put_u8(control_tag::INTENT_HYBRID_TIME);
            buf.put_slice(iht.as_bytes());
        }
    }
}

/// The decoded form of what follows the control fields in a stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Tombstone,
    PackedRow { schema_version: u32, blob: Bytes },
    Value(KeyEntryValue),
}

impl Payload {
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Payload::Tombstone)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        match buf.first() {
            None => Err(DocDbError::corruption("empty value payload")),
            Some(&entry_tag::TOMBSTONE) => Ok(Payload::Tombstone),
            Some(&entry_tag::PACKED_ROW) => {
                let mut rest = &buf[1..];
                if rest.len() < 4 {
                    return Err(DocDbError::corruption("truncated packed row schema version"));
                }
                let schema_version = rest.get_u32();
                Ok(Payload::PackedRow {
                    schema_version,
                    blob: Bytes::copy_from_slice(rest),
                })
            }
            Some(&entry_tag::PRIMITIVE) => {
                let mut rest = &buf[1..];
                let value = KeyEntryValue::consume_from(&mut rest)?;
                Ok(Payload::Value(value))
            }
            Some(other) => Err(DocDbError::corruption(format!(
                "unknown value entry tag {other:#x}"
            ))),
        }
    }

    pub fn append_to(&self, buf: &mut BytesMut) {
        match self {
            Payload::Tombstone => buf.put_u8(entry_tag::TOMBSTONE),
            Payload::PackedRow { schema_version, blob } => {
                buf.put_u8(entry_tag::PACKED_ROW);
                buf.put_u32(*schema_version);
                buf.put_slice(blob);
            }
            Payload::Value(v) => {
                buf.put_u8(entry_tag::PRIMITIVE);
                v.append_to(buf);
            }
        }
    }
}

/// `(write_ht, ttl)`. `write_ht == HybridTime::MIN` is the "not yet set"
/// sentinel, matching the original's use of `HybridTime::kMin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expiration {
    pub write_ht: HybridTime,
    pub ttl: Ttl,
}

impl Expiration {
    pub fn none() -> Self {
        Expiration {
            write_ht: HybridTime::MIN,
            ttl: Ttl::MAX,
        }
    }

    pub fn new(write_ht: HybridTime, ttl: Ttl) -> Self {
        Expiration { write_ht, ttl }
    }

    /// Derives the expiration a child subkey inherits, given its own ttl (if
    /// any) and write time. See SPEC_FULL.md 4.1 "TTL inheritance".
    pub fn inherit(&self, child_ttl: Ttl, new_write_ht: HybridTime) -> Expiration {
        let mut new_exp = *self;
        if new_write_ht >= new_exp.write_ht {
            if !child_ttl.is_infinite() {
                new_exp = Expiration::new(new_write_ht, child_ttl);
            } else if new_exp.ttl.is_negative() {
                new_exp.ttl = Ttl(-new_exp.ttl.0);
            }
        }
        if new_exp.write_ht == HybridTime::MIN {
            new_exp.write_ht = new_write_ht;
        }
        new_exp
    }

    /// `true` iff a value written under this expiration is invisible at
    /// `read_ht`.
    pub fn is_expired_at(&self, read_ht: HybridTime) -> bool {
        if self.ttl.is_infinite() {
            return false;
        }
        let ttl_micros = self.ttl.0.max(0) as u64;
        read_ht.physical_micros().saturating_sub(self.write_ht.physical_micros()) >= ttl_micros
    }

    /// Seconds remaining before expiry at `read_ht`, or `None` if the
    /// expiration carries no ttl.
    pub fn remaining_seconds(&self, read_ht: HybridTime) -> Option<i64> {
        if self.ttl.is_infinite() {
            return None;
        }
        let expiration_us = self.write_ht.physical_micros() as i64 + self.ttl.0;
        let remaining_us = expiration_us - read_ht.physical_micros() as i64;
        Some((remaining_us.max(0)) / 1_000_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_fields_round_trip() {
        let fields = ValueControlFields {
            timestamp: Some(123),
            ttl: Some(Ttl(5_000_000)),
            intent_hybrid_time: None,
        };
        let mut buf = BytesMut::new();
        fields.append_to(&mut buf);
        let mut cursor: &[u8] = &buf;
        let decoded = ValueControlFields::decode(&mut cursor).unwrap();
        assert_eq!(decoded, fields);
        assert!(cursor.is_empty());
    }

    #[test]
    fn packed_row_payload_round_trips() {
        let payload = Payload::PackedRow {
            schema_version: 3,
            blob: Bytes::from_static(b"hello"),
        };
        let mut buf = BytesMut::new();
        payload.append_to(&mut buf);
        let decoded = Payload::decode(&buf).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn ttl_expiry_boundary() {
        let exp = Expiration::new(HybridTime::new(1_000_000, 0), Ttl(1_000_000));
        assert!(!exp.is_expired_at(HybridTime::new(1_500_000, 0)));
        assert!(exp.is_expired_at(HybridTime::new(2_000_000, 0)));
        assert!(exp.is_expired_at(HybridTime::new(2_500_000, 0)));
    }

    #[test]
    fn inherit_activates_default_ttl() {
        let parent = Expiration::new(HybridTime::new(10, 0), Ttl(-50));
        let child = parent.inherit(Ttl::MAX, HybridTime::new(20, 0));
        assert_eq!(child.ttl, Ttl(50));
    }

    #[test]
    fn inherit_overrides_with_explicit_child_ttl() {
        let parent = Expiration::new(HybridTime::new(10, 0), Ttl::MAX);
        let child = parent.inherit(Ttl(30), HybridTime::new(20, 0));
        assert_eq!(child.ttl, Ttl(30));
        assert_eq!(child.write_ht, HybridTime::new(20, 0));
    }
}
