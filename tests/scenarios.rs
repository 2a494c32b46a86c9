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

//! End-to-end read-path scenarios driven entirely through the crate's public
//! API, exercising `RowIterator` and `RestorePatch` against
//! `MockIntentAwareIterator` the way a caller outside this crate would.

use std::time::{Duration, Instant};

use bytes::BytesMut;

use docdb_core::config::ReaderConfig;
use docdb_core::error::DocDbError;
use docdb_core::intent_iterator::MockIntentAwareIterator;
use docdb_core::key::{encode_doc_key, HybridTime, KeyEntryValue, SubKey, TablePrefix};
use docdb_core::reader::Projection;
use docdb_core::restore::{RestorePatch, RestorePatchHooks, Ticker, WriteOp};
use docdb_core::row_iterator::{InitMode, ReaderOutput, RowIterator};
use docdb_core::schema_packing::{PackedColumnSchema, PackedColumnSize, SchemaPacking, SchemaPackingProvider};
use docdb_core::value::{Payload, Ttl, ValueControlFields};

struct NoSchema;
impl SchemaPackingProvider for NoSchema {
    fn lookup(&self, _schema_version: u32) -> Result<SchemaPacking, DocDbError> {
        Err(DocDbError::internal("schema not needed in this scenario"))
    }
}

struct OneColumnSchema(SchemaPacking);
impl SchemaPackingProvider for OneColumnSchema {
    fn lookup(&self, schema_version: u32) -> Result<SchemaPacking, DocDbError> {
        if schema_version == self.0.schema_version {
            Ok(self.0.clone())
        } else {
            Err(DocDbError::corruption("unknown schema version"))
        }
    }
}

fn doc_key(n: i64) -> Vec<u8> {
    encode_doc_key(TablePrefix::None, None, &[], &[KeyEntryValue::Int64(n)]).to_vec()
}

fn plain_value(payload: Payload) -> Vec<u8> {
    let mut buf = BytesMut::new();
    ValueControlFields::default().append_to(&mut buf);
    payload.append_to(&mut buf);
    buf.to_vec()
}

fn ttl_value(payload: Payload, ttl: Ttl) -> Vec<u8> {
    let mut buf = BytesMut::new();
    ValueControlFields { ttl: Some(ttl), ..Default::default() }.append_to(&mut buf);
    payload.append_to(&mut buf);
    buf.to_vec()
}

fn column1_index(projection: &Projection) -> usize {
    projection.columns().iter().position(|c| *c == SubKey::column(1)).unwrap()
}

/// Scenario A: a single packed row is read back in full through `RowIterator`.
#[test]
fn scenario_single_packed_row() {
    let key = doc_key(1);
    let schema_version = 1;
    let schema = OneColumnSchema(SchemaPacking::new(
        schema_version,
        vec![PackedColumnSchema { column_id: 1, size: PackedColumnSize::Fixed(9) }],
    ));
    let mut blob = BytesMut::new();
    KeyEntryValue::Int64(42).append_to(&mut blob);

    let iter = MockIntentAwareIterator::new(
        HybridTime::new(100, 0),
        vec![
            (key.clone(), SubKey(vec![]), HybridTime::new(10, 0), plain_value(Payload::PackedRow { schema_version, blob: blob.freeze() })),
            (key.clone(), SubKey::liveness(), HybridTime::new(10, 0), plain_value(Payload::Value(KeyEntryValue::Null))),
        ],
    );

    let projection = Projection::new(vec![SubKey::column(1)]);
    let idx = column1_index(&projection);
    let mut row_iter = RowIterator::new(
        iter,
        &schema,
        ReaderConfig { use_flat_doc_reader: true, ..Default::default() },
        projection,
        InitMode::SingleDocKey(key),
        HybridTime::new(100, 0),
        HybridTime::MIN,
        None,
        false,
        None,
    );

    assert!(row_iter.has_next().unwrap());
    let row = row_iter.next_row().unwrap();
    let ReaderOutput::Flat(values) = row.output else { panic!("expected flat output") };
    assert_eq!(values[idx], Some(KeyEntryValue::Int64(42)));
    assert!(!row_iter.has_next().unwrap());
}

/// Scenario B: a later column-split write overrides the packed value for
/// that column, leaving the rest of the packed row intact.
#[test]
fn scenario_column_override_wins_over_packed_row() {
    let key = doc_key(2);
    let schema_version = 1;
    let schema = OneColumnSchema(SchemaPacking::new(
        schema_version,
        vec![PackedColumnSchema { column_id: 1, size: PackedColumnSize::Fixed(9) }],
    ));
    let mut blob = BytesMut::new();
    KeyEntryValue::Int64(1).append_to(&mut blob);

    let iter = MockIntentAwareIterator::new(
        HybridTime::new(100, 0),
        vec![
            (key.clone(), SubKey(vec![]), HybridTime::new(10, 0), plain_value(Payload::PackedRow { schema_version, blob: blob.freeze() })),
            (key.clone(), SubKey::liveness(), HybridTime::new(10, 0), plain_value(Payload::Value(KeyEntryValue::Null))),
            (key.clone(), SubKey::column(1), HybridTime::new(20, 0), plain_value(Payload::Value(KeyEntryValue::Int64(999)))),
        ],
    );

    let projection = Projection::new(vec![SubKey::column(1)]);
    let idx = column1_index(&projection);
    let mut row_iter = RowIterator::new(
        iter,
        &schema,
        ReaderConfig { use_flat_doc_reader: true, ..Default::default() },
        projection,
        InitMode::SingleDocKey(key),
        HybridTime::new(100, 0),
        HybridTime::MIN,
        None,
        false,
        None,
    );

    assert!(row_iter.has_next().unwrap());
    let row = row_iter.next_row().unwrap();
    let ReaderOutput::Flat(values) = row.output else { panic!("expected flat output") };
    assert_eq!(values[idx], Some(KeyEntryValue::Int64(999)));

    // Reading before the column-split write existed still sees the packed value.
    let key = doc_key(2);
    let mut blob = BytesMut::new();
    KeyEntryValue::Int64(1).append_to(&mut blob);
    let iter = MockIntentAwareIterator::new(
        HybridTime::new(12, 0),
        vec![
            (key.clone(), SubKey(vec![]), HybridTime::new(10, 0), plain_value(Payload::PackedRow { schema_version, blob: blob.freeze() })),
            (key.clone(), SubKey::liveness(), HybridTime::new(10, 0), plain_value(Payload::Value(KeyEntryValue::Null))),
            (key.clone(), SubKey::column(1), HybridTime::new(20, 0), plain_value(Payload::Value(KeyEntryValue::Int64(999)))),
        ],
    );
    let projection = Projection::new(vec![SubKey::column(1)]);
    let idx = column1_index(&projection);
    let mut row_iter = RowIterator::new(
        iter,
        &schema,
        ReaderConfig { use_flat_doc_reader: true, ..Default::default() },
        projection,
        InitMode::SingleDocKey(key),
        HybridTime::new(12, 0),
        HybridTime::MIN,
        None,
        false,
        None,
    );
    assert!(row_iter.has_next().unwrap());
    let row = row_iter.next_row().unwrap();
    let ReaderOutput::Flat(values) = row.output else { panic!("expected flat output") };
    assert_eq!(values[idx], Some(KeyEntryValue::Int64(1)));
}

/// Scenario C: a tombstoned column reads back as absent even though an
/// older write for that column exists underneath it.
#[test]
fn scenario_tombstone_hides_older_write() {
    let key = doc_key(3);
    let schema = NoSchema;

    let iter = MockIntentAwareIterator::new(
        HybridTime::new(100, 0),
        vec![
            (key.clone(), SubKey::liveness(), HybridTime::new(10, 0), plain_value(Payload::Value(KeyEntryValue::Null))),
            (key.clone(), SubKey::column(1), HybridTime::new(10, 0), plain_value(Payload::Value(KeyEntryValue::Text("old".to_string())))),
            (key.clone(), SubKey::column(1), HybridTime::new(20, 0), plain_value(Payload::Tombstone)),
        ],
    );

    let projection = Projection::new(vec![SubKey::column(1)]);
    let idx = column1_index(&projection);
    let mut row_iter = RowIterator::new(
        iter,
        &schema,
        ReaderConfig { use_flat_doc_reader: true, ..Default::default() },
        projection,
        InitMode::SingleDocKey(key),
        HybridTime::new(100, 0),
        HybridTime::MIN,
        None,
        false,
        None,
    );

    assert!(row_iter.has_next().unwrap());
    let row = row_iter.next_row().unwrap();
    let ReaderOutput::Flat(values) = row.output else { panic!("expected flat output") };
    assert_eq!(values[idx], None);
}

/// Scenario D: a column written with a short ttl is invisible once the read
/// time passes its expiry.
#[test]
fn scenario_ttl_expiry_hides_value() {
    let key = doc_key(4);
    let schema = NoSchema;

    let iter = MockIntentAwareIterator::new(
        HybridTime::new(2_000_000, 0),
        vec![
            (key.clone(), SubKey::liveness(), HybridTime::new(10, 0), plain_value(Payload::Value(KeyEntryValue::Null))),
            (
                key.clone(),
                SubKey::column(1),
                HybridTime::new(1_000_000, 0),
                ttl_value(Payload::Value(KeyEntryValue::Text("short-lived".to_string())), Ttl(500_000)),
            ),
        ],
    );

    let projection = Projection::new(vec![SubKey::column(1)]);
    let idx = column1_index(&projection);
    let mut row_iter = RowIterator::new(
        iter,
        &schema,
        ReaderConfig { use_flat_doc_reader: true, ..Default::default() },
        projection,
        InitMode::SingleDocKey(key),
        HybridTime::new(2_000_000, 0),
        HybridTime::MIN,
        None,
        false,
        None,
    );

    assert!(row_iter.has_next().unwrap());
    let row = row_iter.next_row().unwrap();
    let ReaderOutput::Flat(values) = row.output else { panic!("expected flat output") };
    assert_eq!(values[idx], None);
}

struct DiffHooks;
impl RestorePatchHooks for DiffHooks {
    fn process_common_entry(&mut self, key: &[u8], existing_value: &[u8], restoring_value: &[u8]) -> Result<Option<WriteOp>, DocDbError> {
        if existing_value == restoring_value {
            Ok(None)
        } else {
            Ok(Some(WriteOp::Put { key: key.to_vec(), value: restoring_value.to_vec() }))
        }
    }

    fn process_restoring_only_entry(&mut self, key: &[u8], restoring_value: &[u8]) -> Result<Option<WriteOp>, DocDbError> {
        Ok(Some(WriteOp::Put { key: key.to_vec(), value: restoring_value.to_vec() }))
    }

    fn process_existing_only_entry(&mut self, key: &[u8], _existing_value: &[u8]) -> Result<Option<WriteOp>, DocDbError> {
        Ok(Some(WriteOp::Delete { key: key.to_vec() }))
    }
}

/// Scenario E: restoring a snapshot onto a live table produces a patch that
/// deletes a row dropped from the snapshot and inserts one added to it.
#[test]
fn scenario_restore_diff_produces_expected_patch() {
    let kept = doc_key(10);
    let dropped = doc_key(11);
    let added = doc_key(12);

    let existing = MockIntentAwareIterator::new(
        HybridTime::new(100, 0),
        vec![
            (kept.clone(), SubKey::liveness(), HybridTime::new(10, 0), plain_value(Payload::Value(KeyEntryValue::Null))),
            (dropped.clone(), SubKey::liveness(), HybridTime::new(10, 0), plain_value(Payload::Value(KeyEntryValue::Null))),
        ],
    );
    let restoring = MockIntentAwareIterator::new(
        HybridTime::new(100, 0),
        vec![
            (kept.clone(), SubKey::liveness(), HybridTime::new(10, 0), plain_value(Payload::Value(KeyEntryValue::Null))),
            (added.clone(), SubKey::liveness(), HybridTime::new(10, 0), plain_value(Payload::Value(KeyEntryValue::Null))),
        ],
    );

    let mut patch = RestorePatch::new(existing, restoring, DiffHooks);
    let batch = patch.run(&[]).unwrap();

    assert_eq!(batch.len(), 2);
    assert!(batch.iter().any(|op| matches!(op, WriteOp::Delete { key } if key.starts_with(&dropped))));
    assert!(batch.iter().any(|op| matches!(op, WriteOp::Put { key, .. } if key.starts_with(&added))));
    assert_eq!(patch.tickers().get(Ticker::Deletes), 1);
    assert_eq!(patch.tickers().get(Ticker::Inserts), 1);
    assert_eq!(patch.tickers().get(Ticker::Updates), 0);
}

/// Scenario F: a deadline that has already elapsed is reported before any
/// record is fetched.
#[test]
fn scenario_deadline_exceeded_on_first_record() {
    let key = doc_key(20);
    let schema = NoSchema;

    let iter = MockIntentAwareIterator::new(
        HybridTime::new(100, 0),
        vec![(key.clone(), SubKey::liveness(), HybridTime::new(10, 0), plain_value(Payload::Value(KeyEntryValue::Null)))],
    );

    let past_deadline = Instant::now() - Duration::from_secs(1);
    let mut row_iter = RowIterator::new(
        iter,
        &schema,
        ReaderConfig { use_flat_doc_reader: true, ..Default::default() },
        Projection::new(vec![SubKey::column(1)]),
        InitMode::SingleDocKey(key),
        HybridTime::new(100, 0),
        HybridTime::MIN,
        Some(past_deadline),
        false,
        None,
    );

    let err = row_iter.has_next().unwrap_err();
    assert!(matches!(err, DocDbError::DeadlineExceeded));
    // A second call returns the same cached error without re-running the scan.
    let err2 = row_iter.has_next().unwrap_err();
    assert!(matches!(err2, DocDbError::DeadlineExceeded));
}
