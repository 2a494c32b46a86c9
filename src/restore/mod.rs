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

//! `FetchState`: a prefix-scoped cursor over one ordered key stream, tracking
//! a stack of (path segment, write time) levels so a write at a shallow
//! level can be recognized as shadowing everything beneath it. `RestorePatch`
//! drives two `FetchState`s in lockstep to diff a live state against a
//! snapshot and produce the write batch that turns one into the other.

use bytes::Bytes;
use smallvec::SmallVec;

use crate::error::Result;
use crate::intent_iterator::IntentAwareIterator;
use crate::key::{doc_key_sizes, HybridTime, SubKeyElement, HYBRID_TIME_SUFFIX_LEN};
use crate::value::Payload;

/// One level of a record's decomposed key path: the doc key itself (the
/// root, compared as raw bytes since two different doc keys may otherwise
/// decode to coincidentally equal subkey suffixes), then its subkey
/// elements in order.
#[derive(Clone, PartialEq, Eq)]
enum PathSegment {
    DocKey(Vec<u8>),
    Sub(SubKeyElement),
}

struct StackLevel {
    segment: PathSegment,
    /// Most recent write time seen at this depth or any shallower one.
    max_write_time: HybridTime,
}

fn decode_path(key: &[u8]) -> Result<Vec<PathSegment>> {
    let doc_key_size = doc_key_sizes(key)?.doc_key_size;
    let mut path = vec![PathSegment::DocKey(key[..doc_key_size].to_vec())];
    for elem in crate::reader::decode_record_subkey(doc_key_size, key)? {
        path.push(PathSegment::Sub(elem));
    }
    Ok(path)
}

fn common_prefix_len(stack: &[StackLevel], path: &[PathSegment]) -> usize {
    stack
        .iter()
        .zip(path.iter())
        .take_while(|(lvl, seg)| lvl.segment == **seg)
        .count()
}

/// Wraps an intent-aware iterator with a prefix-scoped fetch discipline.
pub struct FetchState<I: IntentAwareIterator> {
    iter: I,
    prefix: Vec<u8>,
    stack: SmallVec<[StackLevel; 4]>,
    /// `doc_key ‖ sub_key`, i.e. the fetched record's full key with its
    /// trailing encoded hybrid time stripped off -- the granularity at which
    /// the two sides of a `RestorePatch` are compared.
    current_key: Option<Vec<u8>>,
    current_value: Option<Bytes>,
    exhausted: bool,
}

impl<I: IntentAwareIterator> FetchState<I> {
    pub fn new(iter: I) -> Self {
        FetchState {
            iter,
            prefix: Vec::new(),
            stack: SmallVec::new(),
            current_key: None,
            current_value: None,
            exhausted: true,
        }
    }

    /// Restricts the cursor to keys with the given prefix and loads the
    /// first entry, if any.
    pub fn set_prefix(&mut self, prefix: &[u8]) -> Result<bool> {
        self.prefix = prefix.to_vec();
        self.stack.clear();
        self.current_key = None;
        self.current_value = None;
        self.exhausted = false;
        self.iter.seek(prefix)?;
        self.next(false)
    }

    /// Advances to the next record (unless `move_forward` is false, in which
    /// case the entry already under the cursor is re-run through the stack
    /// logic) and returns whether the stream still has a current entry.
    /// Entries shadowed by an ancestor path segment written at a later
    /// hybrid time are skipped internally -- they never surface as "the
    /// current entry", so a caller never needs to check for shadowing itself.
    pub fn next(&mut self, move_forward: bool) -> Result<bool> {
        let mut move_forward = move_forward;
        loop {
            if self.exhausted {
                return Ok(false);
            }
            if move_forward {
                if let Some(prev_key) = self.current_key.clone() {
                    self.iter.seek_past_sub_key(&prev_key)?;
                }
            }

            let Some(fetched) = self.iter.fetch_key()? else {
                self.exhausted = true;
                self.current_key = None;
                self.current_value = None;
                return Ok(false);
            };
            if !fetched.key.starts_with(self.prefix.as_slice()) {
                self.exhausted = true;
                self.current_key = None;
                self.current_value = None;
                return Ok(false);
            }

            let path = decode_path(&fetched.key)?;
            let shadowed = self.update_stack(&path, fetched.write_time);
            let entity_key_end = fetched.key.len().saturating_sub(HYBRID_TIME_SUFFIX_LEN);
            self.current_key = Some(fetched.key[..entity_key_end].to_vec());
            self.current_value = Some(Bytes::copy_from_slice(self.iter.value()));
            if !shadowed {
                return Ok(true);
            }
            move_forward = true;
        }
    }

    /// Returns `true` (shadowed) if an ancestor path segment was written at a
    /// strictly later time than the entry just processed.
    ///
    /// Only this entry's own leaf level (the last element of `path`) ever
    /// records `write_time`; levels above it are pass-through ancestors and
    /// keep whatever time they already carry. Without that distinction, two
    /// sibling columns under the same row would contaminate each other's
    /// shadow check through a shared ancestor level that neither of them
    /// actually wrote.
    fn update_stack(&mut self, path: &[PathSegment], write_time: HybridTime) -> bool {
        let leaf_index = path.len() - 1;
        let keep = common_prefix_len(&self.stack, path).min(leaf_index);
        self.stack.truncate(keep);
        let ancestor_max = self.stack.last().map(|l| l.max_write_time).unwrap_or(HybridTime::MIN);
        let shadowed = write_time < ancestor_max;
        let effective = if write_time > ancestor_max { write_time } else { ancestor_max };
        for segment in &path[keep..leaf_index] {
            self.stack.push(StackLevel {
                segment: segment.clone(),
                max_write_time: ancestor_max,
            });
        }
        self.stack.push(StackLevel {
            segment: path[leaf_index].clone(),
            max_write_time: effective,
        });
        shadowed
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn current_key(&self) -> Option<&[u8]> {
        self.current_key.as_deref()
    }

    pub fn current_value(&self) -> Option<&[u8]> {
        self.current_value.as_deref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ticker {
    Updates,
    Inserts,
    Deletes,
}

pub const TOTAL_TICKER_COUNT: usize = 3;

#[derive(Debug, Clone, Copy, Default)]
pub struct TickerCounts([u64; TOTAL_TICKER_COUNT]);

impl TickerCounts {
    pub fn increment(&mut self, ticker: Ticker) {
        self.0[ticker as usize] += 1;
    }

    pub fn get(&self, ticker: Ticker) -> u64 {
        self.0[ticker as usize]
    }

    pub fn total(&self) -> u64 {
        self.0.iter().sum()
    }
}

/// One entry in the write batch `RestorePatch` produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Subclass hook point: filters entries and decides how each diff outcome
/// becomes a write (or no write at all).
pub trait RestorePatchHooks {
    /// Checked once per entry, from either side, before it is dispatched.
    /// Default never skips.
    fn should_skip_entry(&mut self, _key: &[u8], _value: &[u8]) -> bool {
        false
    }

    fn process_common_entry(
        &mut self,
        key: &[u8],
        existing_value: &[u8],
        restoring_value: &[u8],
    ) -> Result<Option<WriteOp>>;

    fn process_restoring_only_entry(&mut self, key: &[u8], restoring_value: &[u8]) -> Result<Option<WriteOp>>;

    fn process_existing_only_entry(&mut self, key: &[u8], existing_value: &[u8]) -> Result<Option<WriteOp>>;

    /// Called once after the dual-stream walk completes.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Drives an `existing` and a `restoring` `FetchState` in lockstep, producing
/// the write batch that transforms `existing` into `restoring`.
pub struct RestorePatch<IE: IntentAwareIterator, IR: IntentAwareIterator, H: RestorePatchHooks> {
    existing: FetchState<IE>,
    restoring: FetchState<IR>,
    hooks: H,
    last_packed_row_restoring_state: Option<(Vec<u8>, Vec<u8>)>,
    tickers: TickerCounts,
}

impl<IE: IntentAwareIterator, IR: IntentAwareIterator, H: RestorePatchHooks> RestorePatch<IE, IR, H> {
    pub fn new(existing: IE, restoring: IR, hooks: H) -> Self {
        RestorePatch {
            existing: FetchState::new(existing),
            restoring: FetchState::new(restoring),
            hooks,
            last_packed_row_restoring_state: None,
            tickers: TickerCounts::default(),
        }
    }

    pub fn tickers(&self) -> &TickerCounts {
        &self.tickers
    }

    pub fn last_packed_row_restoring_state(&self) -> Option<(&[u8], &[u8])> {
        self.last_packed_row_restoring_state
            .as_ref()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    fn try_update_last_packed_row(&mut self, key: &[u8], value: &[u8]) {
        if let Ok(payload) = Payload::decode(skip_control_fields(value)) {
            if matches!(payload, Payload::PackedRow { .. }) {
                self.last_packed_row_restoring_state = Some((key.to_vec(), value.to_vec()));
            }
        }
    }

    /// Runs the diff over both streams restricted to `prefix`, returning the
    /// write batch that turns `existing` into `restoring`.
    #[tracing::instrument(level = "trace", skip_all)]
    pub fn run(&mut self, prefix: &[u8]) -> Result<Vec<WriteOp>> {
        self.existing.set_prefix(prefix)?;
        self.restoring.set_prefix(prefix)?;
        let mut batch = Vec::new();

        loop {
            let existing_entry = self.existing.current_key().map(|k| k.to_vec());
            let restoring_entry = self.restoring.current_key().map(|k| k.to_vec());

            match (existing_entry, restoring_entry) {
                (None, None) => break,
                (Some(ek), None) => {
                    self.handle_existing_only(&ek, &mut batch)?;
                    self.existing.next(true)?;
                }
                (None, Some(rk)) => {
                    self.handle_restoring_only(&rk, &mut batch)?;
                    self.restoring.next(true)?;
                }
                (Some(ek), Some(rk)) => {
                    use std::cmp::Ordering::*;
                    match ek.as_slice().cmp(rk.as_slice()) {
                        Less => {
                            self.handle_existing_only(&ek, &mut batch)?;
                            self.existing.next(true)?;
                        }
                        Greater => {
                            self.handle_restoring_only(&rk, &mut batch)?;
                            self.restoring.next(true)?;
                        }
                        Equal => {
                            let existing_value = self.existing.current_value().unwrap_or(&[]).to_vec();
                            let restoring_value = self.restoring.current_value().unwrap_or(&[]).to_vec();
                            self.try_update_last_packed_row(&rk, &restoring_value);
                            if !self.hooks.should_skip_entry(&rk, &restoring_value) {
                                if let Some(op) =
                                    self.hooks.process_common_entry(&rk, &existing_value, &restoring_value)?
                                {
                                    self.tickers.increment(Ticker::Updates);
                                    batch.push(op);
                                }
                            }
                            self.existing.next(true)?;
                            self.restoring.next(true)?;
                        }
                    }
                }
            }
        }

        self.hooks.finish()?;
        Ok(batch)
    }

    fn handle_existing_only(&mut self, key: &[u8], batch: &mut Vec<WriteOp>) -> Result<()> {
        let value = self.existing.current_value().unwrap_or(&[]).to_vec();
        if !self.hooks.should_skip_entry(key, &value) {
            if let Some(op) = self.hooks.process_existing_only_entry(key, &value)? {
                self.tickers.increment(Ticker::Deletes);
                batch.push(op);
            }
        }
        Ok(())
    }

    fn handle_restoring_only(&mut self, key: &[u8], batch: &mut Vec<WriteOp>) -> Result<()> {
        let value = self.restoring.current_value().unwrap_or(&[]).to_vec();
        self.try_update_last_packed_row(key, &value);
        if !self.hooks.should_skip_entry(key, &value) {
            if let Some(op) = self.hooks.process_restoring_only_entry(key, &value)? {
                self.tickers.increment(Ticker::Inserts);
                batch.push(op);
            }
        }
        Ok(())
    }
}

/// Skips the `ValueControlFields` prefix of a stored value without
/// allocating, for the narrow case of peeking at the payload tag.
fn skip_control_fields(value: &[u8]) -> &[u8] {
    let mut cursor = value;
    let _ = crate::value::ValueControlFields::decode(&mut cursor);
    cursor
}
