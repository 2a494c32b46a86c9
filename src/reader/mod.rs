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

//! Row reconstruction for one document key. Shared between the two
//! strategies: iteration over the record stream, projection alignment,
//! packed-row handling, TTL inheritance, and liveness detection.

pub mod flat;
pub mod generic;

use std::time::Instant;

use bytes::Bytes;

use crate::error::{DocDbError, Result};
use crate::key::{HybridTime, SubKey, SubKeyElement, HYBRID_TIME_SUFFIX_LEN, LEGACY_HYBRID_TIME_VALUE_TAG};
use crate::schema_packing::{SchemaPacking, SchemaPackingProvider};
use crate::value::{Expiration, Payload, Ttl};

pub use flat::FlatDocReader;
pub use generic::GenericDocReader;

/// Sorted, liveness-prepended list of subkeys to materialize. Column order
/// here is the order `column_index` walks during a read.
#[derive(Debug, Clone)]
pub struct Projection {
    columns: Vec<SubKey>,
}

impl Projection {
    pub fn new(mut columns: Vec<SubKey>) -> Self {
        if !columns.iter().any(SubKey::is_liveness) {
            columns.push(SubKey::liveness());
        }
        columns.sort();
        columns.dedup();
        Projection { columns }
    }

    pub fn columns(&self) -> &[SubKey] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// True when the only projected column is the synthetic liveness one,
    /// i.e. this is an existence probe.
    pub fn is_existence_probe(&self) -> bool {
        self.columns.len() == 1
    }

    pub fn liveness_index(&self) -> usize {
        self.columns
            .iter()
            .position(SubKey::is_liveness)
            .expect("liveness column always present in a built Projection")
    }
}

/// Per-call read parameters threaded through both strategies.
pub struct ReadContext<'a> {
    pub read_time: HybridTime,
    pub table_tombstone_time: HybridTime,
    pub deadline: Option<Instant>,
    pub schema: &'a dyn SchemaPackingProvider,
}

pub(crate) fn check_deadline(deadline: Option<Instant>) -> Result<()> {
    if let Some(d) = deadline {
        if Instant::now() >= d {
            return Err(DocDbError::DeadlineExceeded);
        }
    }
    Ok(())
}

/// Strips a fetched record's trailing hybrid-time tag and encoded hybrid
/// time, giving the `doc_key ‖ sub_key` boundary every version of this
/// record shares -- the argument `IntentAwareIterator::seek_past_sub_key`
/// needs to skip past all of them at once rather than just the one version
/// currently under the cursor.
pub(crate) fn sub_key_boundary(key: &[u8]) -> &[u8] {
    &key[..key.len().saturating_sub(HYBRID_TIME_SUFFIX_LEN)]
}

/// Decodes the `SubKey` elements between the doc-key prefix and the trailing
/// hybrid-time tag plus encoded hybrid time of a fetched record's logical
/// key.
pub(crate) fn decode_record_subkey(doc_key_size: usize, key: &[u8]) -> Result<Vec<SubKeyElement>> {
    if key.len() < doc_key_size + HYBRID_TIME_SUFFIX_LEN {
        return Err(DocDbError::corruption(
            "record key shorter than doc key plus hybrid time",
        ));
    }
    let mut cursor = &key[doc_key_size..key.len() - HYBRID_TIME_SUFFIX_LEN];
    let mut elements = Vec::new();
    while !cursor.is_empty() {
        elements.push(SubKeyElement::consume_from(&mut cursor)?);
    }
    Ok(elements)
}

/// State captured once a `PackedRow` record is found at the document's root
/// position (zero subkey bytes).
pub(crate) struct PackedRowState {
    pub schema: SchemaPacking,
    pub blob: Bytes,
    pub write_time: HybridTime,
    pub expiration: Expiration,
}

impl PackedRowState {
    /// Decodes `subkey`'s packed value, honoring the table tombstone and TTL
    /// expiration. `strip_legacy_prefix` applies the issue #16650 workaround
    /// (flat strategy only, per 4.1.1).
    pub fn decode_column(
        &self,
        subkey_column_id: u32,
        read_time: HybridTime,
        table_tombstone_time: HybridTime,
        strip_legacy_prefix: bool,
    ) -> Result<Option<crate::key::KeyEntryValue>> {
        if self.write_time <= table_tombstone_time {
            return Ok(None);
        }
        if self.expiration.is_expired_at(read_time) {
            return Ok(None);
        }
        let Some(raw) = self.schema.raw_slice(&self.blob, subkey_column_id)? else {
            return Ok(None);
        };
        let mut slice = raw;
        if strip_legacy_prefix && slice.first() == Some(&LEGACY_HYBRID_TIME_VALUE_TAG) {
            slice = &slice[1..];
            if slice.len() < 8 {
                return Err(DocDbError::corruption("truncated legacy hybrid time prefix"));
            }
            slice = &slice[8..];
        }
        Ok(Some(crate::key::KeyEntryValue::consume_from(&mut slice)?))
    }
}

/// Per-column TTL inheritance, per SPEC_FULL.md 4.1.
pub(crate) fn inherit_expiration(parent: &Expiration, child_ttl: Option<Ttl>, write_ht: HybridTime) -> Expiration {
    parent.inherit(child_ttl.unwrap_or(Ttl::MAX), write_ht)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::SubKey;

    #[test]
    fn projection_prepends_and_sorts_liveness() {
        let projection = Projection::new(vec![SubKey::column(5), SubKey::column(1)]);
        assert!(projection.columns()[0].is_liveness());
        assert_eq!(projection.len(), 3);
    }

    #[test]
    fn empty_projection_is_existence_probe() {
        let projection = Projection::new(vec![]);
        assert!(projection.is_existence_probe());
    }
}
