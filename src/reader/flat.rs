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

//! Fast-path `DocReader`: assumes at most one subkey (a single column id) per
//! record, writes straight into a dense `column_index`-addressed slot. No
//! scan stack.

use tracing::trace;

use crate::error::{DocDbError, Result};
use crate::intent_iterator::IntentAwareIterator;
use crate::key::{decode_doc_key, KeyEntryValue, SubKey, SubKeyElement};
use crate::schema_packing::SchemaPackingProvider;
use crate::value::{Expiration, Payload, ValueControlFields};

use super::{check_deadline, decode_record_subkey, sub_key_boundary, PackedRowState, Projection, ReadContext};

pub struct FlatDocReader<'s> {
    schema: &'s dyn SchemaPackingProvider,
}

impl<'s> FlatDocReader<'s> {
    pub fn new(schema: &'s dyn SchemaPackingProvider) -> Self {
        FlatDocReader { schema }
    }

    fn fill_from_packed(
        &self,
        idx: usize,
        projection: &Projection,
        packed: &Option<PackedRowState>,
        ctx: &ReadContext<'_>,
        table_tombstone_time: crate::key::HybridTime,
        out: &mut [Option<KeyEntryValue>],
    ) -> Result<()> {
        let Some(packed) = packed else { return Ok(()) };
        let Some(col_id) = projection.columns()[idx].column_id() else {
            return Ok(());
        };
        if let Some(v) = packed.decode_column(col_id, ctx.read_time, table_tombstone_time, true)? {
            out[idx] = Some(v);
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip_all)]
    pub fn get(
        &self,
        iter: &mut dyn IntentAwareIterator,
        root_doc_key: &[u8],
        projection: &Projection,
        ctx: &ReadContext<'_>,
        out: &mut [Option<KeyEntryValue>],
    ) -> Result<bool> {
        if out.len() != projection.len() {
            return Err(DocDbError::invalid_argument(
                "output slice length does not match projection length",
            ));
        }
        let _ = decode_doc_key(root_doc_key, None)?; // validates the key decodes cleanly before scanning
        iter.seek(root_doc_key)?;

        let mut column_index = 0usize;
        let mut packed: Option<PackedRowState> = None;
        let mut table_tombstone_time = ctx.table_tombstone_time;

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
                    Payload::Value(_) => {
                        // Flat rows never have a non-packed root value; SetRootValue is a no-op here.
                        trace!("ignoring non-packed root value on flat row");
                    }
                }
                iter.seek_past_sub_key(sub_key_boundary(&fetched.key))?;
                continue;
            }

            if elements.len() != 1 {
                return Err(DocDbError::corruption(
                    "flat doc reader encountered a nested subkey",
                ));
            }
            let column_id = match &elements[0] {
                SubKeyElement::ColumnId(id) => *id,
                other => {
                    return Err(DocDbError::corruption(format!(
                        "flat doc reader expected a column id subkey, got {other:?}"
                    )))
                }
            };

            if fetched.write_time <= table_tombstone_time {
                iter.seek_past_sub_key(sub_key_boundary(&fetched.key))?;
                continue;
            }

            let record_subkey = SubKey::column(column_id);
            while column_index < projection.len() && projection.columns()[column_index] < record_subkey {
                self.fill_from_packed(column_index, projection, &packed, ctx, table_tombstone_time, out)?;
                column_index += 1;
            }

            if column_index < projection.len() && projection.columns()[column_index] == record_subkey {
                let mut value_buf = iter.value();
                let control = ValueControlFields::decode(&mut value_buf)?;
                let payload = Payload::decode(value_buf)?;
                match payload {
                    Payload::Tombstone => {
                        out[column_index] = None;
                    }
                    Payload::Value(v) => {
                        let expiration = Expiration::none().inherit(control.ttl_or_max(), fetched.write_time);
                        if !expiration.is_expired_at(ctx.read_time) {
                            out[column_index] = Some(v);
                        }
                    }
                    Payload::PackedRow { .. } => {
                        return Err(DocDbError::corruption("packed row payload at a non-root subkey"));
                    }
                }
                iter.seek_past_sub_key(sub_key_boundary(&fetched.key))?;
                column_index += 1;
            } else {
                // Record's subkey sorts before the current projection column: the
                // store returned a key older than our cursor. Skip it rather than
                // reinterpret the projection position (see the Open Question on
                // this ambiguity).
                iter.seek_past_sub_key(sub_key_boundary(&fetched.key))?;
            }
        }

        while column_index < projection.len() {
            self.fill_from_packed(column_index, projection, &packed, ctx, table_tombstone_time, out)?;
            column_index += 1;
        }

        let liveness_idx = projection.liveness_index();
        Ok(out[liveness_idx].is_some())
    }
}
