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

//! Maps a column id to its byte range inside a packed-row blob. The
//! descriptor itself is schema metadata and lives outside this crate; we only
//! consume it through `SchemaPackingProvider`.

use bytes::Bytes;

use crate::error::{DocDbError, Result};
use crate::key::KeyEntryValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackedColumnSize {
    Fixed(usize),
    Variable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedColumnSchema {
    pub column_id: u32,
    pub size: PackedColumnSize,
}

/// A packed-row blob lays out its variable-length columns' end offsets as a
/// big-endian `u32` header, one per variable column in schema order, followed
/// by every column's encoded value (fixed and variable interleaved in schema
/// order). A column absent from `columns` is simply never written into a
/// blob built against this schema version.
#[derive(Debug, Clone)]
pub struct SchemaPacking {
    pub schema_version: u32,
    columns: Vec<PackedColumnSchema>,
}

impl SchemaPacking {
    pub fn new(schema_version: u32, columns: Vec<PackedColumnSchema>) -> Self {
        SchemaPacking {
            schema_version,
            columns,
        }
    }

    fn variable_count(&self) -> usize {
        self.columns
            .iter()
            .filter(|c| matches!(c.size, PackedColumnSize::Variable))
            .count()
    }

    /// Byte range of `column_id` within `blob`, or `None` if the column was
    /// not written into this blob's schema version.
    fn locate(&self, blob: &[u8], column_id: u32) -> Result<Option<(usize, usize)>> {
        let varlen_count = self.variable_count();
        let header_len = varlen_count * 4;
        if blob.len() < header_len {
            return Err(DocDbError::corruption("truncated packed row offset header"));
        }
        let mut varlen_end_offsets = Vec::with_capacity(varlen_count);
        for i in 0..varlen_count {
            let start = i * 4;
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&blob[start..start + 4]);
            varlen_end_offsets.push(u32::from_be_bytes(raw) as usize);
        }

        let mut fixed_cursor = header_len;
        let mut varlen_index = 0;
        let mut varlen_cursor = header_len;
        for column in &self.columns {
            let (start, end) = match column.size {
                PackedColumnSize::Fixed(size) => {
                    let start = fixed_cursor;
                    let end = start + size;
                    fixed_cursor = end;
                    (start, end)
                }
                PackedColumnSize::Variable => {
                    let end = header_len + varlen_end_offsets[varlen_index];
                    let start = varlen_cursor;
                    varlen_cursor = end;
                    varlen_index += 1;
                    (start, end)
                }
            };
            if column.column_id == column_id {
                if end > blob.len() {
                    return Err(DocDbError::corruption("packed row column range out of bounds"));
                }
                return Ok(Some((start, end)));
            }
        }
        Ok(None)
    }

    /// Decodes the value stored for `column_id`, or `None` if it was never
    /// packed for this row's schema version.
    pub fn decode_column(&self, blob: &Bytes, column_id: u32) -> Result<Option<KeyEntryValue>> {
        match self.raw_slice(blob, column_id)? {
            None => Ok(None),
            Some(slice) => {
                let mut slice = slice;
                let value = KeyEntryValue::consume_from(&mut slice)?;
                Ok(Some(value))
            }
        }
    }

    /// Raw encoded bytes for `column_id`, before any legacy stripping.
    pub fn raw_slice<'b>(&self, blob: &'b [u8], column_id: u32) -> Result<Option<&'b [u8]>> {
        Ok(self.locate(blob, column_id)?.map(|(start, end)| &blob[start..end]))
    }
}

/// Schema definitions live outside this crate; callers supply a lookup for
/// the schema-version id carried by every packed-row payload.
pub trait SchemaPackingProvider {
    fn lookup(&self, schema_version: u32) -> Result<SchemaPacking>;
}
