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

//! Drives forward/backward scans over a key range: repositions the
//! underlying iterator, confirms scan bounds, invokes `DocReader`, and
//! projects primary-key columns straight from the `DocKey` bytes.

use std::time::Instant;

use bytes::BytesMut;

use crate::config::ReaderConfig;
use crate::document::SubDocument;
use crate::error::{DocDbError, Result};
use crate::intent_iterator::IntentAwareIterator;
use crate::key::{decode_doc_key, doc_key_sizes, DocKeyColumns, HybridTime, KeyEntryValue, TablePrefix};
use crate::reader::{check_deadline, FlatDocReader, GenericDocReader, Projection, ReadContext};
use crate::schema_packing::SchemaPackingProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// External driver enumerating the next desired key within scan bounds,
/// given inequalities/IN-lists on key columns.
pub trait ScanChoices {
    fn matches(&self, key: &[u8]) -> bool;
    fn skip_targets_up_to(&mut self, key: &[u8]);
    /// Next key to re-seek to, or `None` if targets are exhausted.
    fn seek_to_current_target(&self) -> Option<Vec<u8>>;
    fn done_with_current_target(&mut self);
}

pub enum InitMode {
    /// Seek directly to the given (sub-)document key.
    SingleDocKey(Vec<u8>),
    /// `None` bounds are unbounded in that direction.
    Scan {
        lower: Option<Vec<u8>>,
        upper: Option<Vec<u8>>,
        direction: Direction,
    },
}

pub enum ReaderOutput {
    Flat(Vec<Option<KeyEntryValue>>),
    Nested(SubDocument),
}

pub struct MaterializedRow {
    pub primary_key: DocKeyColumns,
    pub output: ReaderOutput,
}

enum InitialSeek {
    /// Seek directly to this key.
    Direct(Vec<u8>),
    /// Position just before this key (used to start a backward scan at an
    /// exclusive upper bound).
    BeforeKey(Vec<u8>),
}

pub struct RowIterator<'s, I: IntentAwareIterator> {
    iter: I,
    schema: &'s dyn SchemaPackingProvider,
    config: ReaderConfig,
    projection: Projection,
    direction: Direction,
    bound_key: Option<Vec<u8>>,
    scan_choices: Option<Box<dyn ScanChoices>>,
    read_time: HybridTime,
    table_tombstone_time: HybridTime,
    deadline: Option<Instant>,
    has_static_columns: bool,
    bloom_hint: bool,

    pending_initial_seek: Option<InitialSeek>,
    started: bool,
    skip_advance_once: bool,
    row_ready: bool,
    row_key: Option<Vec<u8>>,
    row_hash_key: Option<Vec<u8>>,
    last_emitted_key: Option<Vec<u8>>,
    has_next_status: Option<DocDbError>,
    materialized: Option<MaterializedRow>,

    pub keys_found: u64,
    pub obsolete_keys_found: u64,
    pub obsolete_keys_found_past_cutoff: u64,
    history_cutoff: Option<HybridTime>,
}

impl<'s, I: IntentAwareIterator> RowIterator<'s, I> {
    pub fn new(
        iter: I,
        schema: &'s dyn SchemaPackingProvider,
        config: ReaderConfig,
        projection: Projection,
        mode: InitMode,
        read_time: HybridTime,
        table_tombstone_time: HybridTime,
        deadline: Option<Instant>,
        has_static_columns: bool,
        scan_choices: Option<Box<dyn ScanChoices>>,
    ) -> Self {
        let (bound_key, direction, bloom_hint, pending_initial_seek) = match mode {
            InitMode::SingleDocKey(key) => (None, Direction::Forward, true, Some(InitialSeek::Direct(key))),
            InitMode::Scan { lower, upper, direction } => match direction {
                Direction::Forward => (upper, direction, false, lower.map(InitialSeek::Direct)),
                Direction::Backward => (lower, direction, false, upper.map(InitialSeek::BeforeKey)),
            },
        };
        RowIterator {
            iter,
            schema,
            config,
            projection,
            direction,
            bound_key,
            scan_choices,
            read_time,
            table_tombstone_time,
            deadline,
            has_static_columns,
            bloom_hint,
            pending_initial_seek,
            started: false,
            skip_advance_once: false,
            row_ready: false,
            row_key: None,
            row_hash_key: None,
            last_emitted_key: None,
            has_next_status: None,
            materialized: None,
            keys_found: 0,
            obsolete_keys_found: 0,
            obsolete_keys_found_past_cutoff: 0,
            history_cutoff: None,
        }
    }

    pub fn uses_bloom_filter_hint(&self) -> bool {
        self.bloom_hint
    }

    pub fn set_history_cutoff(&mut self, cutoff: HybridTime) {
        self.history_cutoff = Some(cutoff);
    }

    #[tracing::instrument(level = "trace", skip_all)]
    pub fn has_next(&mut self) -> Result<bool> {
        if self.row_ready {
            return Ok(true);
        }
        if let Some(err) = self.has_next_status.clone() {
            return Err(err);
        }
        match self.has_next_inner() {
            Ok(v) => Ok(v),
            Err(e) => {
                self.has_next_status = Some(e.clone());
                Err(e)
            }
        }
    }

    fn has_next_inner(&mut self) -> Result<bool> {
        loop {
            check_deadline(self.deadline)?;

            if !self.started {
                self.started = true;
                self.seek_initial()?;
            } else if self.skip_advance_once {
                self.skip_advance_once = false;
            } else {
                self.advance_to_next_desired_row()?;
            }

            let Some(fetched) = self.iter.fetch_key()? else {
                return Ok(false);
            };
            let sizes = doc_key_sizes(&fetched.key)?;
            let row_key = fetched.key[..sizes.doc_key_size].to_vec();
            let row_hash_key = fetched.key[..sizes.hash_part_size].to_vec();

            if let Some(bound) = &self.bound_key {
                let past_bound = match self.direction {
                    Direction::Forward => row_key.as_slice() >= bound.as_slice(),
                    Direction::Backward => row_key.as_slice() < bound.as_slice(),
                };
                if past_bound {
                    return Ok(false);
                }
            }

            let is_static = self.has_static_columns && row_hash_key.len() + 1 == row_key.len();
            if !is_static {
                if let Some(choices) = &mut self.scan_choices {
                    if !choices.matches(&row_key) {
                        choices.skip_targets_up_to(&row_key);
                        match choices.seek_to_current_target() {
                            Some(target) => {
                                self.iter.seek(&target)?;
                                continue;
                            }
                            None => return Ok(false),
                        }
                    }
                }
            }

            self.row_key = Some(row_key.clone());
            self.row_hash_key = Some(row_hash_key);
            let (found, output) = self.read_row(&row_key)?;

            self.keys_found += 1;
            if !found {
                self.obsolete_keys_found += 1;
                if let Some(cutoff) = self.history_cutoff {
                    if fetched.write_time < cutoff {
                        self.obsolete_keys_found_past_cutoff += 1;
                    }
                }
            }

            if let Some(last) = &self.last_emitted_key {
                let advanced = match self.direction {
                    Direction::Forward => row_key.as_slice() > last.as_slice(),
                    Direction::Backward => row_key.as_slice() < last.as_slice(),
                };
                if !advanced {
                    return Err(DocDbError::corruption("infinite loop"));
                }
            }

            if let Some(choices) = &mut self.scan_choices {
                choices.done_with_current_target();
            }

            if found {
                self.last_emitted_key = Some(row_key.clone());
                let (primary_key, _) = decode_doc_key(&row_key, None)?;
                self.materialized = Some(MaterializedRow { primary_key, output });
                self.row_ready = true;
                return Ok(true);
            }
        }
    }

    pub fn next_row(&mut self) -> Result<MaterializedRow> {
        if !self.row_ready {
            return Err(DocDbError::internal("NextRow called without a successful HasNext"));
        }
        self.row_ready = false;
        self.materialized
            .take()
            .ok_or_else(|| DocDbError::internal("row marked ready but no materialized row stored"))
    }

    fn seek_initial(&mut self) -> Result<()> {
        match self.pending_initial_seek.take() {
            Some(InitialSeek::Direct(key)) => self.iter.seek(&key),
            Some(InitialSeek::BeforeKey(key)) => self.iter.prev_doc_key(&key),
            None => match self.direction {
                Direction::Forward => self.iter.seek(&[]),
                Direction::Backward => self.iter.seek_to_last_doc_key(),
            },
        }
    }

    fn advance_to_next_desired_row(&mut self) -> Result<()> {
        let Some(row_key) = self.row_key.clone() else {
            return Ok(());
        };
        match self.direction {
            Direction::Forward => self.iter.seek_out_of_sub_doc(&row_key),
            Direction::Backward => self.iter.prev_doc_key(&row_key),
        }
    }

    /// The hash-key-only prefix of the current row's `DocKey`, cached
    /// alongside `row_key` at the same time so rows that colocate by hash
    /// group can be grouped without redecoding the key.
    pub fn row_hash_key(&self) -> Option<&[u8]> {
        self.row_hash_key.as_deref()
    }

    /// True iff the schema declares static columns and the current row key
    /// is exactly the hash-key prefix plus the group-end byte -- i.e. this
    /// row has no range-key bytes, so it addresses a hash group's static
    /// columns rather than one particular row within it.
    pub fn is_next_static_column(&self) -> bool {
        match (&self.row_hash_key, &self.row_key) {
            (Some(hash_key), Some(row_key)) => self.has_static_columns && hash_key.len() + 1 == row_key.len(),
            _ => false,
        }
    }

    fn read_row(&mut self, row_key: &[u8]) -> Result<(bool, ReaderOutput)> {
        let ctx = ReadContext {
            read_time: self.read_time,
            table_tombstone_time: self.table_tombstone_time,
            deadline: self.deadline,
            schema: self.schema,
        };
        if self.config.use_flat_doc_reader {
            let reader = FlatDocReader::new(self.schema);
            let mut out = vec![None; self.projection.len()];
            let found = reader.get(&mut self.iter, row_key, &self.projection, &ctx, &mut out)?;
            Ok((found, ReaderOutput::Flat(out)))
        } else {
            let reader = GenericDocReader::new(self.schema);
            let mut out = SubDocument::new();
            let found = reader.get(&mut self.iter, row_key, &self.projection, &ctx, &mut out)?;
            Ok((found, ReaderOutput::Nested(out)))
        }
    }

    pub fn liveness_column_exists(&self) -> bool {
        let Some(materialized) = &self.materialized else {
            return false;
        };
        match &materialized.output {
            ReaderOutput::Flat(values) => values[self.projection.liveness_index()].is_some(),
            ReaderOutput::Nested(doc) => doc
                .get_child(&crate::key::SubKeyElement::column_id(crate::key::LIVENESS_COLUMN_ID))
                .map(|c| !c.is_null())
                .unwrap_or(false),
        }
    }

    /// The current `DocKey` with any leading cotable/colocation prefix
    /// stripped.
    pub fn get_tuple_id(&self) -> Result<Option<Vec<u8>>> {
        let Some(row_key) = &self.row_key else {
            return Ok(None);
        };
        let (columns, _) = decode_doc_key(row_key, None)?;
        let prefix_len = columns.prefix.map(|p| p.encoded_len()).unwrap_or(0);
        Ok(Some(row_key[prefix_len..].to_vec()))
    }

    /// Re-prepends `table_prefix` (if any) to `tuple_id` and re-seeks,
    /// confirming the fetched tuple matches the requested one. A mismatch
    /// (e.g. the row was deleted) returns `Ok(false)`, not an error.
    pub fn seek_tuple(&mut self, table_prefix: TablePrefix, tuple_id: &[u8]) -> Result<bool> {
        let mut full = BytesMut::new();
        table_prefix.append_to(&mut full);
        full.extend_from_slice(tuple_id);

        self.started = true;
        self.skip_advance_once = true;
        self.row_ready = false;
        self.row_key = None;
        self.iter.seek(&full)?;

        if !self.has_next()? {
            return Ok(false);
        }
        let fetched_tuple = self.get_tuple_id()?.unwrap_or_default();
        Ok(fetched_tuple == tuple_id)
    }

    pub fn restart_read_ht(&self) -> Option<HybridTime> {
        self.iter.restart_read_ht()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent_iterator::MockIntentAwareIterator;
    use crate::key::{encode_doc_key, KeyEntryValue, SubKey};
    use crate::schema_packing::SchemaPacking;
    use crate::value::{Payload, ValueControlFields};

    struct NoPackedRows;
    impl SchemaPackingProvider for NoPackedRows {
        fn lookup(&self, _schema_version: u32) -> Result<SchemaPacking> {
            Err(DocDbError::internal("no packed rows in this test"))
        }
    }

    fn doc_key(n: i64) -> Vec<u8> {
        encode_doc_key(TablePrefix::None, None, &[], &[KeyEntryValue::Int64(n)]).to_vec()
    }

    fn liveness_row(doc: Vec<u8>, ht: HybridTime) -> (Vec<u8>, SubKey, HybridTime, Vec<u8>) {
        let mut value = BytesMut::new();
        ValueControlFields::default().append_to(&mut value);
        Payload::Value(KeyEntryValue::Null).append_to(&mut value);
        (doc, SubKey::liveness(), ht, value.to_vec())
    }

    #[test]
    fn forward_scan_visits_rows_in_order() {
        let iter = MockIntentAwareIterator::new(
            HybridTime::new(100, 0),
            vec![
                liveness_row(doc_key(1), HybridTime::new(10, 0)),
                liveness_row(doc_key(2), HybridTime::new(10, 0)),
                liveness_row(doc_key(3), HybridTime::new(10, 0)),
            ],
        );
        let schema = NoPackedRows;
        let mut row_iter = RowIterator::new(
            iter,
            &schema,
            ReaderConfig { use_flat_doc_reader: true, ..Default::default() },
            Projection::new(vec![]),
            InitMode::Scan { lower: None, upper: None, direction: Direction::Forward },
            HybridTime::new(100, 0),
            HybridTime::MIN,
            None,
            false,
            None,
        );

        let mut seen = Vec::new();
        while row_iter.has_next().unwrap() {
            let row = row_iter.next_row().unwrap();
            seen.push(row.primary_key.range[0].clone());
        }
        assert_eq!(
            seen,
            vec![KeyEntryValue::Int64(1), KeyEntryValue::Int64(2), KeyEntryValue::Int64(3)]
        );
    }

    #[test]
    fn backward_scan_visits_rows_in_reverse() {
        let iter = MockIntentAwareIterator::new(
            HybridTime::new(100, 0),
            vec![
                liveness_row(doc_key(1), HybridTime::new(10, 0)),
                liveness_row(doc_key(2), HybridTime::new(10, 0)),
            ],
        );
        let schema = NoPackedRows;
        let mut row_iter = RowIterator::new(
            iter,
            &schema,
            ReaderConfig { use_flat_doc_reader: true, ..Default::default() },
            Projection::new(vec![]),
            InitMode::Scan { lower: None, upper: None, direction: Direction::Backward },
            HybridTime::new(100, 0),
            HybridTime::MIN,
            None,
            false,
            None,
        );

        let mut seen = Vec::new();
        while row_iter.has_next().unwrap() {
            let row = row_iter.next_row().unwrap();
            seen.push(row.primary_key.range[0].clone());
        }
        assert_eq!(seen, vec![KeyEntryValue::Int64(2), KeyEntryValue::Int64(1)]);
    }

    #[test]
    fn static_column_detected_for_hash_only_row_key() {
        let hash_only_key = encode_doc_key(TablePrefix::None, Some(3), &[KeyEntryValue::Int64(1)], &[]).to_vec();
        let iter = MockIntentAwareIterator::new(
            HybridTime::new(100, 0),
            vec![liveness_row(hash_only_key.clone(), HybridTime::new(10, 0))],
        );
        let schema = NoPackedRows;
        let mut row_iter = RowIterator::new(
            iter,
            &schema,
            ReaderConfig { use_flat_doc_reader: true, ..Default::default() },
            Projection::new(vec![]),
            InitMode::SingleDocKey(hash_only_key.clone()),
            HybridTime::new(100, 0),
            HybridTime::MIN,
            None,
            true,
            None,
        );

        assert!(row_iter.has_next().unwrap());
        assert!(row_iter.is_next_static_column());
        assert_eq!(row_iter.row_hash_key(), Some(&hash_only_key[..hash_only_key.len() - 1]));
    }

    #[test]
    fn seek_tuple_mismatch_returns_false_without_error() {
        let iter = MockIntentAwareIterator::new(
            HybridTime::new(100, 0),
            vec![liveness_row(doc_key(1), HybridTime::new(10, 0))],
        );
        let schema = NoPackedRows;
        let mut row_iter = RowIterator::new(
            iter,
            &schema,
            ReaderConfig { use_flat_doc_reader: true, ..Default::default() },
            Projection::new(vec![]),
            InitMode::SingleDocKey(doc_key(1)),
            HybridTime::new(100, 0),
            HybridTime::MIN,
            None,
            false,
            None,
        );
        let missing_tuple = encode_doc_key(TablePrefix::None, None, &[], &[KeyEntryValue::Int64(5)]).to_vec();
        let found = row_iter.seek_tuple(TablePrefix::None, &missing_tuple).unwrap();
        assert!(!found);
    }
}
