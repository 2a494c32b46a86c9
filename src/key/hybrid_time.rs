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

//! Hybrid timestamps: physical microseconds plus a logical tie-breaker,
//! packed so that byte-wise comparison of the encoded form matches
//! chronological order.

use std::cell::Cell;
use std::cmp::Ordering;

use crate::error::{DocDbError, Result};

const LOGICAL_BITS: u32 = 12;
const LOGICAL_MASK: u64 = (1 << LOGICAL_BITS) - 1;

/// A decoded (physical_micros, logical) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HybridTime {
    physical_micros: u64,
    logical: u16,
}

impl HybridTime {
    pub const MIN: HybridTime = HybridTime {
        physical_micros: 0,
        logical: 0,
    };

    pub const MAX: HybridTime = HybridTime {
        physical_micros: (1 << (64 - LOGICAL_BITS)) - 1,
        logical: LOGICAL_MASK as u16,
    };

    pub fn new(physical_micros: u64, logical: u16) -> Self {
        debug_assert!((logical as u64) <= LOGICAL_MASK);
        Self {
            physical_micros,
            logical,
        }
    }

    pub fn physical_micros(self) -> u64 {
        self.physical_micros
    }

    pub fn logical(self) -> u16 {
        self.logical
    }

    fn packed(self) -> u64 {
        (self.physical_micros << LOGICAL_BITS) | (self.logical as u64 & LOGICAL_MASK)
    }

    fn from_packed(packed: u64) -> Self {
        Self {
            physical_micros: packed >> LOGICAL_BITS,
            logical: (packed & LOGICAL_MASK) as u16,
        }
    }

    pub fn encode(self) -> EncodedHybridTime {
        EncodedHybridTime(self.packed().to_be_bytes())
    }
}

/// Opaque byte-comparable timestamp. Comparison never decodes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncodedHybridTime([u8; 8]);

impl EncodedHybridTime {
    pub const MIN: EncodedHybridTime = EncodedHybridTime([0; 8]);
    pub const MAX: EncodedHybridTime = EncodedHybridTime([0xff; 8]);

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Parses the encoded form from the front of `buf`, consuming 8 bytes.
    pub fn consume_from(buf: &mut &[u8]) -> Result<Self> {
        if buf.len() < 8 {
            return Err(DocDbError::corruption("truncated hybrid time"));
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&buf[..8]);
        *buf = &buf[8..];
        Ok(Self(bytes))
    }

    pub fn decode(&self) -> HybridTime {
        HybridTime::from_packed(u64::from_be_bytes(self.0))
    }
}

impl std::fmt::Debug for EncodedHybridTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncodedHybridTime({:?})", self.decode())
    }
}

impl PartialOrd for EncodedHybridTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EncodedHybridTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

/// Stores encoded bytes, decodes on demand, caches the decoded form.
/// Comparison uses the encoded bytes and never triggers a decode.
#[derive(Clone)]
pub struct LazyHybridTime {
    encoded: EncodedHybridTime,
    decoded: Cell<Option<HybridTime>>,
}

impl LazyHybridTime {
    pub fn new(encoded: EncodedHybridTime) -> Self {
        Self {
            encoded,
            decoded: Cell::new(None),
        }
    }

    pub fn min() -> Self {
        Self::new(EncodedHybridTime::MIN)
    }

    pub fn assign(&mut self, encoded: EncodedHybridTime) {
        self.encoded = encoded;
        self.decoded.set(None);
    }

    pub fn encoded(&self) -> EncodedHybridTime {
        self.encoded
    }

    pub fn decoded(&self) -> HybridTime {
        if let Some(ht) = self.decoded.get() {
            return ht;
        }
        let ht = self.encoded.decode();
        self.decoded.set(Some(ht));
        ht
    }
}

impl std::fmt::Debug for LazyHybridTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_preserves_order() {
        let a = HybridTime::new(100, 0).encode();
        let b = HybridTime::new(100, 1).encode();
        let c = HybridTime::new(101, 0).encode();
        assert!(a < b);
        assert!(b < c);
        assert!(EncodedHybridTime::MIN < a);
        assert!(c < EncodedHybridTime::MAX);
    }

    #[test]
    fn decode_round_trips() {
        let ht = HybridTime::new(1_500_000, 42);
        let encoded = ht.encode();
        assert_eq!(encoded.decode(), ht);
    }

    #[test]
    fn lazy_caches_decode() {
        let ht = HybridTime::new(5, 6);
        let lazy = LazyHybridTime::new(ht.encode());
        assert_eq!(lazy.decoded(), ht);
        assert_eq!(lazy.decoded(), ht);
    }
}
