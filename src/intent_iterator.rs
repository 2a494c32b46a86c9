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

//! The intent-aware iterator contract consumed from the underlying store,
//! plus an in-memory mock used by this crate's own tests. The real merge of
//! committed records with open-transaction intents lives outside this crate.

use bytes::Bytes;

use crate::error::Result;
use crate::key::{doc_key_sizes, HybridTime, SubKey, HYBRID_TIME_SUFFIX_LEN, RECORD_HYBRID_TIME_TAG};

/// One fetched key/value pair: the full logical key (`DocKey ‖ SubKey ‖
/// EncodedHybridTime`) and its decoded write time.
#[derive(Debug, Clone)]
pub struct FetchedRecord {
    pub key: Bytes,
    pub write_time: HybridTime,
}

/// Operations `RowIterator`, `DocReader`, and `FetchState` drive against the
/// underlying store. Implemented elsewhere in the system; this crate only
/// consumes it.
pub trait IntentAwareIterator {
    fn seek(&mut self, key: &[u8]) -> Result<()>;
    fn seek_forward(&mut self, key: &[u8]) -> Result<()>;
    fn seek_past_sub_key(&mut self, key: &[u8]) -> Result<()>;
    fn seek_out_of_sub_doc(&mut self, key: &[u8]) -> Result<()>;
    fn seek_to_last_doc_key(&mut self) -> Result<()>;
    fn prev_doc_key(&mut self, key: &[u8]) -> Result<()>;

    /// The record currently under the cursor, or `None` if out of records or
    /// past the upperbound.
    fn fetch_key(&mut self) -> Result<Option<FetchedRecord>>;
    /// Raw value bytes for the record `fetch_key` last returned.
    fn value(&self) -> &[u8];

    fn is_out_of_records(&self) -> bool;
    fn set_upperbound(&mut self, key: &[u8]);

    /// Finds the newest record with the given prefix without disturbing the
    /// main cursor's forward-progress state.
    fn find_latest_record(&mut self, prefix: &[u8]) -> Result<Option<FetchedRecord>>;

    fn read_time(&self) -> HybridTime;
    /// A higher read time the caller should retry at, if the store
    /// determined the original read time was unsafe. Pass-through only; the
    /// core never re-interprets this.
    fn restart_read_ht(&self) -> Option<HybridTime>;

    #[cfg(test)]
    fn test_max_seen_ht(&self) -> HybridTime;
}

fn invert(bytes: [u8; 8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    for (o, b) in out.iter_mut().zip(bytes.iter()) {
        *o = !b;
    }
    out
}

struct StoredEntry {
    /// `doc_key ‖ sub_key ‖ hybrid_time_tag ‖ reversed(encoded_ht)`: sorting
    /// ascending on this byte string yields newest-version-first within a
    /// `doc_key‖sub_key` group, and -- because the tag byte sorts below every
    /// subkey tag -- an entry terminating its path at a given depth always
    /// sorts before any entry continuing deeper under the same prefix.
    storage_key: Vec<u8>,
    logical_key: Bytes,
    write_time: HybridTime,
    value: Bytes,
}

/// In-memory stand-in for the real store's intent-aware iterator, used only
/// by this crate's own test suite.
pub struct MockIntentAwareIterator {
    records: Vec<StoredEntry>,
    pos: usize,
    upperbound: Option<Vec<u8>>,
    read_time: HybridTime,
    max_seen_ht: HybridTime,
}

impl MockIntentAwareIterator {
    /// `rows`: `(doc_key, sub_key, write_time, value)` tuples, any order.
    pub fn new(read_time: HybridTime, rows: Vec<(Vec<u8>, SubKey, HybridTime, Vec<u8>)>) -> Self {
        let mut records: Vec<StoredEntry> = rows
            .into_iter()
            .map(|(doc_key, sub_key, write_time, value)| {
                let sub_key_bytes = sub_key.encode();
                let encoded_ht = write_time.encode();
                let mut storage_key = Vec::with_capacity(doc_key.len() + sub_key_bytes.len() + HYBRID_TIME_SUFFIX_LEN);
                storage_key.extend_from_slice(&doc_key);
                storage_key.extend_from_slice(&sub_key_bytes);
                // The un-inverted tag byte sorts below every subkey tag, so a
                // record that ends its path here always sorts before one that
                // continues deeper with the same doc_key/sub_key prefix.
                storage_key.push(RECORD_HYBRID_TIME_TAG);
                storage_key.extend_from_slice(&invert(*encoded_ht.as_bytes()));

                let mut logical_key = Vec::with_capacity(doc_key.len() + sub_key_bytes.len() + HYBRID_TIME_SUFFIX_LEN);
                logical_key.extend_from_slice(&doc_key);
                logical_key.extend_from_slice(&sub_key_bytes);
                logical_key.push(RECORD_HYBRID_TIME_TAG);
                logical_key.extend_from_slice(encoded_ht.as_bytes());

                StoredEntry {
                    storage_key,
                    logical_key: Bytes::from(logical_key),
                    write_time,
                    value: Bytes::from(value),
                }
            })
            .collect();
        records.sort_by(|a, b| a.storage_key.cmp(&b.storage_key));
        let max_seen_ht = records
            .iter()
            .map(|r| r.write_time)
            .max()
            .unwrap_or(HybridTime::MIN);
        let mut iter = MockIntentAwareIterator {
            records,
            pos: 0,
            upperbound: None,
            read_time,
            max_seen_ht,
        };
        iter.skip_invisible();
        iter
    }

    fn lower_bound(&self, key: &[u8]) -> usize {
        self.records.partition_point(|e| e.storage_key.as_slice() < key)
    }

    fn past_upperbound(&self, pos: usize) -> bool {
        match &self.upperbound {
            None => false,
            Some(bound) => pos >= self.records.len() || self.records[pos].storage_key.as_slice() >= bound.as_slice(),
        }
    }

    /// Advances `self.pos` past any record written strictly after
    /// `self.read_time` -- those versions aren't visible at this read time,
    /// so the cursor must land on the newest visible version of whatever
    /// group it's in (or past the whole group, if none of its versions
    /// qualify), never on a too-new one.
    fn skip_invisible(&mut self) {
        while self.pos < self.records.len() && self.records[self.pos].write_time > self.read_time {
            self.pos += 1;
        }
    }
}

impl IntentAwareIterator for MockIntentAwareIterator {
    fn seek(&mut self, key: &[u8]) -> Result<()> {
        self.pos = self.lower_bound(key);
        self.skip_invisible();
        Ok(())
    }

    fn seek_forward(&mut self, key: &[u8]) -> Result<()> {
        let bound = self.lower_bound(key);
        if bound > self.pos {
            self.pos = bound;
        }
        self.skip_invisible();
        Ok(())
    }

    fn seek_past_sub_key(&mut self, key: &[u8]) -> Result<()> {
        if self.pos < self.records.len() && self.records[self.pos].storage_key.as_slice() < key {
            self.pos = self.lower_bound(key);
        }
        while self.pos < self.records.len() && self.records[self.pos].storage_key.starts_with(key) {
            self.pos += 1;
        }
        self.skip_invisible();
        Ok(())
    }

    fn seek_out_of_sub_doc(&mut self, key: &[u8]) -> Result<()> {
        self.seek_past_sub_key(key)
    }

    fn seek_to_last_doc_key(&mut self) -> Result<()> {
        if self.records.is_empty() {
            self.pos = 0;
            return Ok(());
        }
        let last = self.records.len() - 1;
        let doc_key_end = doc_key_sizes(&self.records[last].storage_key)?.doc_key_size;
        let prefix = self.records[last].storage_key[..doc_key_end].to_vec();
        let mut p = last;
        while p > 0 && self.records[p - 1].storage_key.starts_with(&prefix) {
            p -= 1;
        }
        self.pos = p;
        self.skip_invisible();
        Ok(())
    }

    fn prev_doc_key(&mut self, key: &[u8]) -> Result<()> {
        let doc_key_size = doc_key_sizes(key)?.doc_key_size;
        let boundary = key[..doc_key_size].to_vec();
        let mut p = self.pos.min(self.records.len());
        while p > 0 && self.records[p - 1].storage_key.as_slice() >= boundary.as_slice() {
            p -= 1;
        }
        if p == 0 {
            self.pos = self.records.len();
            return Ok(());
        }
        let prev_doc_key_end = doc_key_sizes(&self.records[p - 1].storage_key)?.doc_key_size;
        let prev_prefix = self.records[p - 1].storage_key[..prev_doc_key_end].to_vec();
        let mut q = p;
        while q > 0 && self.records[q - 1].storage_key.starts_with(&prev_prefix) {
            q -= 1;
        }
        self.pos = q;
        self.skip_invisible();
        Ok(())
    }

    fn fetch_key(&mut self) -> Result<Option<FetchedRecord>> {
        if self.is_out_of_records() {
            return Ok(None);
        }
        let entry = &self.records[self.pos];
        Ok(Some(FetchedRecord {
            key: entry.logical_key.clone(),
            write_time: entry.write_time,
        }))
    }

    fn value(&self) -> &[u8] {
        if self.pos >= self.records.len() {
            return &[];
        }
        &self.records[self.pos].value
    }

    fn is_out_of_records(&self) -> bool {
        self.pos >= self.records.len() || self.past_upperbound(self.pos)
    }

    fn set_upperbound(&mut self, key: &[u8]) {
        self.upperbound = Some(key.to_vec());
    }

    fn find_latest_record(&mut self, prefix: &[u8]) -> Result<Option<FetchedRecord>> {
        let mut pos = self.lower_bound(prefix);
        while pos < self.records.len() && self.records[pos].storage_key.starts_with(prefix) {
            if self.records[pos].write_time <= self.read_time {
                let entry = &self.records[pos];
                return Ok(Some(FetchedRecord {
                    key: entry.logical_key.clone(),
                    write_time: entry.write_time,
                }));
            }
            pos += 1;
        }
        Ok(None)
    }

    fn read_time(&self) -> HybridTime {
        self.read_time
    }

    fn restart_read_ht(&self) -> Option<HybridTime> {
        None
    }

    #[cfg(test)]
    fn test_max_seen_ht(&self) -> HybridTime {
        self.max_seen_ht
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{encode_doc_key, KeyEntryValue, TablePrefix};

    fn doc_key(n: i64) -> Vec<u8> {
        encode_doc_key(TablePrefix::None, None, &[], &[KeyEntryValue::Int64(n)]).to_vec()
    }

    #[test]
    fn seek_and_fetch_newest_version_first() {
        let mut iter = MockIntentAwareIterator::new(
            HybridTime::new(100, 0),
            vec![
                (doc_key(1), SubKey::column(1), HybridTime::new(10, 0), b"old".to_vec()),
                (doc_key(1), SubKey::column(1), HybridTime::new(20, 0), b"new".to_vec()),
            ],
        );
        iter.seek(&doc_key(1)).unwrap();
        let fetched = iter.fetch_key().unwrap().unwrap();
        assert_eq!(fetched.write_time, HybridTime::new(20, 0));
        assert_eq!(iter.value(), b"new");
    }

    #[test]
    fn read_time_filters_out_versions_written_later() {
        let mut iter = MockIntentAwareIterator::new(
            HybridTime::new(12, 0),
            vec![
                (doc_key(1), SubKey::column(1), HybridTime::new(7, 0), b"old".to_vec()),
                (doc_key(1), SubKey::column(1), HybridTime::new(20, 0), b"new".to_vec()),
            ],
        );
        iter.seek(&doc_key(1)).unwrap();
        let fetched = iter.fetch_key().unwrap().unwrap();
        assert_eq!(fetched.write_time, HybridTime::new(7, 0));
        assert_eq!(iter.value(), b"old");
    }

    #[test]
    fn read_time_before_every_version_finds_nothing() {
        let mut iter = MockIntentAwareIterator::new(
            HybridTime::new(5, 0),
            vec![(doc_key(1), SubKey::column(1), HybridTime::new(7, 0), b"new".to_vec())],
        );
        iter.seek(&doc_key(1)).unwrap();
        assert!(iter.is_out_of_records());
        assert!(iter.fetch_key().unwrap().is_none());
    }

    #[test]
    fn seek_past_sub_key_skips_all_versions() {
        let mut iter = MockIntentAwareIterator::new(
            HybridTime::new(100, 0),
            vec![
                (doc_key(1), SubKey::column(1), HybridTime::new(10, 0), b"a".to_vec()),
                (doc_key(1), SubKey::column(1), HybridTime::new(20, 0), b"b".to_vec()),
                (doc_key(1), SubKey::column(2), HybridTime::new(15, 0), b"c".to_vec()),
            ],
        );
        let prefix = {
            let mut p = doc_key(1);
            p.extend_from_slice(&SubKey::column(1).encode());
            p
        };
        iter.seek(&doc_key(1)).unwrap();
        iter.seek_past_sub_key(&prefix).unwrap();
        let fetched = iter.fetch_key().unwrap().unwrap();
        assert_eq!(iter.value(), b"c");
        assert_eq!(fetched.write_time, HybridTime::new(15, 0));
    }

    #[test]
    fn out_of_records_when_exhausted() {
        let mut iter = MockIntentAwareIterator::new(HybridTime::new(1, 0), vec![]);
        iter.seek(&doc_key(1)).unwrap();
        assert!(iter.is_out_of_records());
        assert_eq!(iter.fetch_key().unwrap().map(|r| r.write_time), None);
    }
}
