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

//! Generic/nested `DocReader`: supports arbitrary nested subkeys (list
//! indices, map keys, further column ids) by maintaining a small stack of
//! active path segments. Because records arrive in key order, any ancestor
//! of a given path is always seen before its descendants, so the stack only
//! ever grows at the tail and pops back to the common prefix.
//!
//! The output tree is addressed by replaying the decoded path through
//! `SubDocument::allocate_child` rather than holding a live pointer into the
//! tree across loop iterations -- simpler to get right under the borrow
//! checker, at the cost of an O(depth) walk per record (depth is bounded by
//! `smallvec`'s inline capacity in the common case).

use smallvec::SmallVec;

use crate::document::SubDocument;
use crate::error::{DocDbError, Result};
use crate::intent_iterator::IntentAwareIterator;
use crate::key::{decode_doc_key, HybridTime, SubKey, SubKeyElement, LIVENESS_COLUMN_ID};
use crate::schema_packing::SchemaPackingProvider;
use crate::value::{Expiration, Payload, Ttl, ValueControlFields};

use super::{check_deadline, decode_record_subkey, sub_key_boundary, PackedRowState, Projection, ReadContext};

struct StackLevel {
    element: SubKeyElement,
    expiration: Expiration,
}

pub struct GenericDocReader<'s> {
    schema: &'s dyn SchemaPackingProvider,
}

impl<'s> GenericDocReader<'s> {
    pub fn new(schema: &'s dyn SchemaPackingProvider) -> Self {
        GenericDocReader { schema }
    }

    fn fill_from_packed(
        &self,
        idx: usize,
        projection: &Projection,
        packed: &Option<PackedRowState>,
        ctx: &ReadContext<'_>,
        table_tombstone_time: HybridTime,
        out: &mut SubDocument,
    ) -> Result<()> {
        let Some(packed) = packed else { return Ok(()) };
        let Some(col_id) = projection.columns()[idx].column_id() else {
            return Ok(());
        };
        if let Some(v) = packed.decode_column(col_id, ctx.read_time, table_tombstone_time, false)? {
            out.allocate_child(&SubKeyElement::column_id(col_id)).set_primitive(v);
        }
        Ok(())
    }

    fn row_expiration(packed: &Option<PackedRowState>) -> Expiration {
        packed.as_ref().map(|p| p.expiration).unwrap_or_else(Expiration::none)
    }

    #[tracing::instrument(level = "trace", skip_all)]
    pub fn get(
        &self,
        iter: &mut dyn IntentAwareIterator,
        root_doc_key: &[u8],
        projection: &Projection,
        ctx: &ReadContext<'_>,
        out: &mut SubDocument,
    ) -> Result<bool> {
        let _ = decode_doc_key(root_doc_key, None)?;
        iter.seek(root_doc_key)?;

        let mut column_index = 0usize;
        let mut packed: Option<PackedRowState> = None;
        let mut table_tombstone_time = ctx.table_tombstone_time;
        let mut stack: SmallVec<[StackLevel; 4]> = SmallVec::new();
        let mut cannot_scan_columns = false;
        let mut any_value_found = false;

        loop {
            check_deadline(ctx.deadline)?;
            let Some(fetched) = iter.fetch_key()? else {
                break;
            };
            if !fetched.key.starts_with(root_doc_key) {
                break;
            }
            let elements = decode_record_subkey(root_doc_key.len(), &fetched.key)?;

            if elements.is_empty() {
                let mut value_buf = iter.value();
                let control = ValueControlFields::decode(&mut value_buf)?;
                let payload = Payload::decode(value_buf)?;
                match payload {
                    Payload::Tombstone => {
                        if fetched.write_time > table_tombstone_time {
                            table_tombstone_time = fetched.write_time;
                        }
                    }
                    Payload::PackedRow { schema_version, blob } => {
                        let schema = self.schema.lookup(schema_version)?;
                        let expiration = Expiration::none().inherit(control.ttl_or_max(), fetched.write_time);
                        packed = Some(PackedRowState {
                            schema,
                            blob,
                            write_time: fetched.write_time,
                            expiration,
                        });
                    }
                    Payload::Value(v) => {
                        if !cannot_scan_columns {
                            out.set_primitive(v);
                            cannot_scan_columns = true;
                            any_value_found = true;
                        }
                    }
                }
                iter.seek_past_sub_key(sub_key_boundary(&fetched.key))?;
                continue;
            }

            if cannot_scan_columns {
                iter.seek_past_sub_key(sub_key_boundary(&fetched.key))?;
                continue;
            }
            if fetched.write_time <= table_tombstone_time {
                iter.seek_past_sub_key(sub_key_boundary(&fetched.key))?;
                continue;
            }

            let top_changed = stack.first().map(|lvl| lvl.element != elements[0]).unwrap_or(true);
            if top_changed {
                stack.clear();
                let top = SubKey(vec![elements[0].clone()]);
                while column_index < projection.len() && projection.columns()[column_index] < top {
                    self.fill_from_packed(column_index, projection, &packed, ctx, table_tombstone_time, out)?;
                    column_index += 1;
                }
                if !(column_index < projection.len() && projection.columns()[column_index] == top) {
                    iter.seek_out_of_sub_doc(&fetched.key[..root_doc_key.len() + top.encode().len()])?;
                    continue;
                }
            }

            let mut value_buf = iter.value();
            let control = ValueControlFields::decode(&mut value_buf)?;
            let payload = Payload::decode(value_buf)?;

            let common = common_prefix_len(&stack, &elements);
            stack.truncate(common);
            for (i, element) in elements.iter().enumerate().skip(common) {
                let is_leaf = i == elements.len() - 1;
                let parent_expiration = if i == 0 {
                    Self::row_expiration(&packed)
                } else {
                    stack[i - 1].expiration
                };
                let expiration = if is_leaf {
                    parent_expiration.inherit(control.ttl_or_max(), fetched.write_time)
                } else {
                    parent_expiration.inherit(Ttl::MAX, fetched.write_time)
                };
                stack.push(StackLevel {
                    element: element.clone(),
                    expiration,
                });
            }

            let leaf_expiration = stack.last().expect("just pushed at least one level").expiration;
            let node = navigate(out, &elements);
            match payload {
                Payload::Tombstone => {
                    delete_leaf(out, &elements);
                }
                Payload::Value(v) => {
                    if !leaf_expiration.is_expired_at(ctx.read_time) {
                        node.set_primitive(v);
                        any_value_found = true;
                    } else {
                        delete_leaf(out, &elements);
                    }
                }
                Payload::PackedRow { .. } => {
                    return Err(DocDbError::corruption("packed row payload at a non-root subkey"));
                }
            }

            iter.seek_past_sub_key(sub_key_boundary(&fetched.key))?;
        }

        if !cannot_scan_columns {
            while column_index < projection.len() {
                self.fill_from_packed(column_index, projection, &packed, ctx, table_tombstone_time, out)?;
                column_index += 1;
            }
        }

        let liveness_present = out
            .get_child(&SubKeyElement::column_id(LIVENESS_COLUMN_ID))
            .map(|c| !c.is_null())
            .unwrap_or(false);

        if !liveness_present && !any_value_found && !projection.is_existence_probe() {
            return self.check_existence_only(iter, root_doc_key, ctx, table_tombstone_time);
        }

        Ok(liveness_present || any_value_found)
    }

    /// Re-seeks to the root key and checks only whether any live record
    /// exists under it, without materializing columns. Mirrors the second
    /// pass in the original when the first pass found nothing projected.
    fn check_existence_only(
        &self,
        iter: &mut dyn IntentAwareIterator,
        root_doc_key: &[u8],
        ctx: &ReadContext<'_>,
        table_tombstone_time: HybridTime,
    ) -> Result<bool> {
        iter.seek(root_doc_key)?;
        loop {
            check_deadline(ctx.deadline)?;
            let Some(fetched) = iter.fetch_key()? else {
                return Ok(false);
            };
            if !fetched.key.starts_with(root_doc_key) {
                return Ok(false);
            }
            if fetched.write_time <= table_tombstone_time {
                iter.seek_past_sub_key(sub_key_boundary(&fetched.key))?;
                continue;
            }
            let mut value_buf = iter.value();
            let _control = ValueControlFields::decode(&mut value_buf)?;
            let payload = Payload::decode(value_buf)?;
            if !payload.is_tombstone() {
                return Ok(true);
            }
            iter.seek_past_sub_key(sub_key_boundary(&fetched.key))?;
        }
    }
}

fn common_prefix_len(stack: &SmallVec<[StackLevel; 4]>, elements: &[SubKeyElement]) -> usize {
    stack
        .iter()
        .zip(elements.iter())
        .take_while(|(lvl, elem)| lvl.element == **elem)
        .count()
}

fn navigate<'d>(root: &'d mut SubDocument, elements: &[SubKeyElement]) -> &'d mut SubDocument {
    let mut node = root;
    for element in elements {
        node = node.allocate_child(element);
    }
    node
}

fn delete_leaf(root: &mut SubDocument, elements: &[SubKeyElement]) {
    if elements.is_empty() {
        return;
    }
    let mut node = root;
    for element in &elements[..elements.len() - 1] {
        node = node.allocate_child(element);
    }
    node.delete_child(&elements[elements.len() - 1]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent_iterator::MockIntentAwareIterator;
    use crate::key::{encode_doc_key, KeyEntryValue, TablePrefix};
    use crate::schema_packing::SchemaPacking;

    struct EmptySchemaProvider;
    impl SchemaPackingProvider for EmptySchemaProvider {
        fn lookup(&self, _schema_version: u32) -> Result<SchemaPacking> {
            Err(DocDbError::internal("no packed rows in this test"))
        }
    }

    fn doc_key(n: i64) -> Vec<u8> {
        encode_doc_key(TablePrefix::None, None, &[], &[KeyEntryValue::Int64(n)]).to_vec()
    }

    fn value_bytes(payload: Payload) -> Vec<u8> {
        let mut buf = bytes::BytesMut::new();
        ValueControlFields::default().append_to(&mut buf);
        payload.append_to(&mut buf);
        buf.to_vec()
    }

    #[test]
    fn nested_list_elements_land_under_their_column() {
        let key = doc_key(1);
        let schema = EmptySchemaProvider;
        let column = SubKeyElement::column_id(3);
        let list_item = SubKeyElement::ListIndex(0);

        let mut iter = MockIntentAwareIterator::new(
            HybridTime::new(20, 0),
            vec![
                (
                    key.clone(),
                    SubKey::liveness(),
                    HybridTime::new(10, 0),
                    value_bytes(Payload::Value(KeyEntryValue::Null)),
                ),
                (
                    key.clone(),
                    SubKey(vec![column.clone(), list_item.clone()]),
                    HybridTime::new(10, 0),
                    value_bytes(Payload::Value(KeyEntryValue::Int64(5))),
                ),
            ],
        );

        let ctx = ReadContext {
            read_time: HybridTime::new(20, 0),
            table_tombstone_time: HybridTime::MIN,
            deadline: None,
            schema: &schema,
        };
        let projection = Projection::new(vec![SubKey::column(3)]);
        let reader = GenericDocReader::new(&schema);
        let mut out = SubDocument::new();
        let found = reader.get(&mut iter, &key, &projection, &ctx, &mut out).unwrap();
        assert!(found);
        let col_node = out.get_child(&column).unwrap();
        let item_node = col_node.get_child(&list_item).unwrap();
        assert_eq!(
            item_node.value(),
            &crate::document::SubDocumentValue::Primitive(KeyEntryValue::Int64(5))
        );
    }

    #[test]
    fn tombstoned_leaf_is_removed() {
        let key = doc_key(2);
        let schema = EmptySchemaProvider;
        let column = SubKeyElement::column_id(4);
        let mut iter = MockIntentAwareIterator::new(
            HybridTime::new(30, 0),
            vec![
                (
                    key.clone(),
                    SubKey::liveness(),
                    HybridTime::new(10, 0),
                    value_bytes(Payload::Value(KeyEntryValue::Null)),
                ),
                (
                    key.clone(),
                    SubKey(vec![column.clone()]),
                    HybridTime::new(20, 0),
                    value_bytes(Payload::Tombstone),
                ),
            ],
        );
        let ctx = ReadContext {
            read_time: HybridTime::new(30, 0),
            table_tombstone_time: HybridTime::MIN,
            deadline: None,
            schema: &schema,
        };
        let projection = Projection::new(vec![SubKey::column(4)]);
        let reader = GenericDocReader::new(&schema);
        let mut out = SubDocument::new();
        let found = reader.get(&mut iter, &key, &projection, &ctx, &mut out).unwrap();
        assert!(found);
        assert!(out.get_child(&column).is_none());
    }
}
