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

//! Encoded key primitives: `DocKey` (the primary row identifier), `SubKey`
//! (the column/nested-position suffix), and the lexicographic-but-self-delimited
//! codec shared by both.

pub mod hybrid_time;

use bytes::{BufMut, BytesMut};

use crate::error::{DocDbError, Result};

pub use hybrid_time::{EncodedHybridTime, HybridTime, LazyHybridTime};

/// Column id reserved for the synthetic liveness marker. Chosen below every
/// real user column id so that, once prepended to a projection and sorted by
/// subkey, it always scans first.
pub const LIVENESS_COLUMN_ID: u32 = 0;

/// Legacy corruption artifact (issue #16650): some packed-column payloads
/// are prefixed with an encoded hybrid time under this tag. Exposed so
/// `crate::reader` can detect and strip it without reaching into `tag`.
pub const LEGACY_HYBRID_TIME_VALUE_TAG: u8 = 0x05;

/// Marks the boundary between a record's `doc_key ‖ sub_key` path and its
/// trailing encoded hybrid time on a fetched key. Every subkey tag
/// (`SUBKEY_COLUMN_ID` and friends) sorts above this value, so a record that
/// terminates its path here always sorts before any record that continues
/// deeper with the same prefix -- without it, an ancestor entry (a write to
/// a whole row or sub-document) could sort *after* its own descendants,
/// which would break forward-scan shadow detection over nested writes.
/// Exposed so `crate::intent_iterator` and `crate::reader` agree on where
/// the hybrid time suffix starts without reaching into `tag`.
pub const RECORD_HYBRID_TIME_TAG: u8 = tag::HYBRID_TIME;

/// Total length of the `RECORD_HYBRID_TIME_TAG` byte plus the 8-byte encoded
/// hybrid time that follows it on a fetched record's logical key.
pub const HYBRID_TIME_SUFFIX_LEN: usize = 9;

mod tag {
    pub const TABLE_ID: u8 = 0x01;
    pub const COLOCATION_ID: u8 = 0x02;
    pub const HASH_CODE: u8 = 0x03;
    pub const GROUP_END: u8 = 0x04;
    pub const HYBRID_TIME: u8 = 0x05;

    pub const VALUE_NULL: u8 = 0x00;
    pub const VALUE_INT64: u8 = 0x01;
    pub const VALUE_TEXT: u8 = 0x02;
    pub const VALUE_BYTES: u8 = 0x03;

    pub const SUBKEY_COLUMN_ID: u8 = 0x10;
    pub const SUBKEY_LIST_INDEX: u8 = 0x11;
    pub const SUBKEY_MAP_KEY: u8 = 0x12;
}

/// A decoded primitive key-column value: a hashed/range key column, or a map
/// key inside a nested subkey path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyEntryValue {
    Null,
    Int64(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl KeyEntryValue {
    pub fn append_to(&self, buf: &mut BytesMut) {
        match self {
            KeyEntryValue::Null => buf.put_u8(tag::VALUE_NULL),
            KeyEntryValue::Int64(v) => {
                buf.put_u8(tag::VALUE_INT64);
                // Flip the sign bit so big-endian byte order matches numeric order.
                buf.put_u64((*v as u64) ^ (1 << 63));
            }
            KeyEntryValue::Text(s) => {
                buf.put_u8(tag::VALUE_TEXT);
                append_escaped(buf, s.as_bytes());
            }
            KeyEntryValue::Bytes(b) => {
                buf.put_u8(tag::VALUE_BYTES);
                append_escaped(buf, b);
            }
        }
    }

    /// Decodes one value from the front of `buf`, consuming its bytes.
    pub fn consume_from(buf: &mut &[u8]) -> Result<Self> {
        let tag = *buf
            .first()
            .ok_or_else(|| DocDbError::corruption("empty key entry value"))?;
        *buf = &buf[1..];
        match tag {
            tag::VALUE_NULL => Ok(KeyEntryValue::Null),
            tag::VALUE_INT64 => {
                if buf.len() < 8 {
                    return Err(DocDbError::corruption("truncated int64 key entry"));
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buf[..8]);
                *buf = &buf[8..];
                let v = (u64::from_be_bytes(raw) ^ (1 << 63)) as i64;
                Ok(KeyEntryValue::Int64(v))
            }
            tag::VALUE_TEXT => {
                let bytes = consume_escaped(buf)?;
                let s = String::from_utf8(bytes)
                    .map_err(|_| DocDbError::corruption("invalid utf8 in key entry"))?;
                Ok(KeyEntryValue::Text(s))
            }
            tag::VALUE_BYTES => Ok(KeyEntryValue::Bytes(consume_escaped(buf)?)),
            other => Err(DocDbError::corruption(format!(
                "unknown key entry tag {other:#x}"
            ))),
        }
    }
}

/// Escapes `0x00` as `0x00 0xff` and terminates with `0x00 0x00`, so the
/// encoded length never needs to be known up front and byte comparison still
/// matches lexicographic order of the original bytes.
fn append_escaped(buf: &mut BytesMut, raw: &[u8]) {
    for &b in raw {
        if b == 0x00 {
            buf.put_u8(0x00);
            buf.put_u8(0xff);
        } else {
            buf.put_u8(b);
        }
    }
    buf.put_u8(0x00);
    buf.put_u8(0x00);
}

fn consume_escaped(buf: &mut &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        match buf.first() {
            None => return Err(DocDbError::corruption("unterminated escaped key entry")),
            Some(0x00) => {
                let next = *buf
                    .get(1)
                    .ok_or_else(|| DocDbError::corruption("unterminated escaped key entry"))?;
                *buf = &buf[2..];
                match next {
                    0x00 => return Ok(out),
                    0xff => out.push(0x00),
                    other => {
                        return Err(DocDbError::corruption(format!(
                            "bad escape sequence 0x00 {other:#x}"
                        )))
                    }
                }
            }
            Some(&b) => {
                out.push(b);
                *buf = &buf[1..];
            }
        }
    }
}

/// One element of a (possibly nested) `SubKey` path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubKeyElement {
    ColumnId(u32),
    ListIndex(u32),
    MapKey(KeyEntryValue),
}

impl SubKeyElement {
    pub fn column_id(id: u32) -> Self {
        SubKeyElement::ColumnId(id)
    }

    pub fn append_to(&self, buf: &mut BytesMut) {
        match self {
            SubKeyElement::ColumnId(id) => {
                buf.put_u8(tag::SUBKEY_COLUMN_ID);
                buf.put_u32(*id);
            }
            SubKeyElement::ListIndex(idx) => {
                buf.put_u8(tag::SUBKEY_LIST_INDEX);
                buf.put_u32(*idx);
            }
            SubKeyElement::MapKey(v) => {
                buf.put_u8(tag::SUBKEY_MAP_KEY);
                v.append_to(buf);
            }
        }
    }

    pub fn consume_from(buf: &mut &[u8]) -> Result<Self> {
        let tag = *buf
            .first()
            .ok_or_else(|| DocDbError::corruption("empty subkey element"))?;
        *buf = &buf[1..];
        match tag {
            tag::SUBKEY_COLUMN_ID | tag::SUBKEY_LIST_INDEX => {
                if buf.len() < 4 {
                    return Err(DocDbError::corruption("truncated subkey element"));
                }
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&buf[..4]);
                *buf = &buf[4..];
                let v = u32::from_be_bytes(raw);
                Ok(if tag == tag::SUBKEY_COLUMN_ID {
                    SubKeyElement::ColumnId(v)
                } else {
                    SubKeyElement::ListIndex(v)
                })
            }
            tag::SUBKEY_MAP_KEY => Ok(SubKeyElement::MapKey(KeyEntryValue::consume_from(buf)?)),
            other => Err(DocDbError::corruption(format!(
                "unknown subkey tag {other:#x}"
            ))),
        }
    }

    pub fn is_liveness_column(&self) -> bool {
        matches!(self, SubKeyElement::ColumnId(id) if *id == LIVENESS_COLUMN_ID)
    }
}

/// A `SubKey` is a path of one or more `SubKeyElement`s: a single column id
/// for flat rows, or a deeper list/map/column path for nested rows.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubKey(pub Vec<SubKeyElement>);

impl SubKey {
    pub fn column(id: u32) -> Self {
        SubKey(vec![SubKeyElement::ColumnId(id)])
    }

    pub fn liveness() -> Self {
        Self::column(LIVENESS_COLUMN_ID)
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        for element in &self.0 {
            element.append_to(&mut buf);
        }
        buf
    }

    pub fn is_liveness(&self) -> bool {
        self.0.len() == 1 && self.0[0].is_liveness_column()
    }

    pub fn column_id(&self) -> Option<u32> {
        match self.0.first() {
            Some(SubKeyElement::ColumnId(id)) if self.0.len() == 1 => Some(*id),
            _ => None,
        }
    }
}

impl PartialOrd for SubKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SubKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.encode().cmp(&other.encode())
    }
}

/// Optional table-disambiguation prefix carried by a `DocKey`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TablePrefix {
    None,
    Cotable([u8; 16]),
    Colocation(u32),
}

impl TablePrefix {
    pub fn append_to(&self, buf: &mut BytesMut) {
        match self {
            TablePrefix::None => {}
            TablePrefix::Cotable(uuid) => {
                buf.put_u8(tag::TABLE_ID);
                buf.put_slice(uuid);
            }
            TablePrefix::Colocation(id) => {
                buf.put_u8(tag::COLOCATION_ID);
                buf.put_u32(*id);
            }
        }
    }

    fn consume_from(buf: &mut &[u8]) -> Result<Self> {
        match buf.first() {
            Some(&tag::TABLE_ID) => {
                if buf.len() < 17 {
                    return Err(DocDbError::corruption("truncated cotable id"));
                }
                let mut uuid = [0u8; 16];
                uuid.copy_from_slice(&buf[1..17]);
                *buf = &buf[17..];
                Ok(TablePrefix::Cotable(uuid))
            }
            Some(&tag::COLOCATION_ID) => {
                if buf.len() < 5 {
                    return Err(DocDbError::corruption("truncated colocation id"));
                }
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&buf[1..5]);
                *buf = &buf[5..];
                Ok(TablePrefix::Colocation(u32::from_be_bytes(raw)))
            }
            _ => Ok(TablePrefix::None),
        }
    }

    /// Byte length this prefix occupies when encoded.
    pub fn encoded_len(&self) -> usize {
        match self {
            TablePrefix::None => 0,
            TablePrefix::Cotable(_) => 17,
            TablePrefix::Colocation(_) => 5,
        }
    }
}

/// The decoded primary-key columns of one `DocKey`: the table prefix, the
/// hashed key columns (if any), and the range key columns.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DocKeyColumns {
    pub prefix: Option<TablePrefix>,
    pub hash_code: Option<u16>,
    pub hashed: Vec<KeyEntryValue>,
    pub range: Vec<KeyEntryValue>,
}

/// Byte offsets of a decoded `DocKey`, used to split `row_hash_key` from
/// `row_key` without redoing the decode (mirrors the original's cached
/// `doc_key_offsets`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocKeySizes {
    /// Length of the prefix + hash code + hashed columns + their group-end,
    /// i.e. everything up to (and not including) the range key columns.
    pub hash_part_size: usize,
    /// Total length of the encoded `DocKey`, group-end included.
    pub doc_key_size: usize,
}

/// Encodes a `DocKey` from its constituent parts.
pub fn encode_doc_key(prefix: TablePrefix, hash_code: Option<u16>, hashed: &[KeyEntryValue], range: &[KeyEntryValue]) -> BytesMut {
    let mut buf = BytesMut::new();
    prefix.append_to(&mut buf);
    if let Some(code) = hash_code {
        buf.put_u8(tag::HASH_CODE);
        buf.put_u16(code);
        for v in hashed {
            v.append_to(&mut buf);
        }
        buf.put_u8(tag::GROUP_END);
    }
    for v in range {
        v.append_to(&mut buf);
    }
    buf.put_u8(tag::GROUP_END);
    buf
}

/// Decodes a `DocKey` and reports both its structure and its byte sizes.
///
/// `end_referenced_key_column_index` bounds how many leading key columns
/// (hashed followed by range, in schema order) the caller intends to
/// reference -- the tuple-id style partial decodes that only need a prefix
/// of the key columns. `None` means "decode everything, no limit requested".
/// When given, it must not exceed the number of key columns this `DocKey`
/// actually carries; spec.md's open question about this index exceeding
/// `num_key_columns` is resolved by failing fast with `InvalidArgument`
/// rather than asserting.
pub fn decode_doc_key(key: &[u8], end_referenced_key_column_index: Option<usize>) -> Result<(DocKeyColumns, DocKeySizes)> {
    let mut cursor = key;
    let prefix = TablePrefix::consume_from(&mut cursor)?;
    let prefix_len = prefix.encoded_len();

    let mut columns = DocKeyColumns {
        prefix: Some(prefix),
        ..Default::default()
    };

    let mut hash_part_size = prefix_len;
    if cursor.first() == Some(&tag::HASH_CODE) {
        if cursor.len() < 3 {
            return Err(DocDbError::corruption("truncated hash code"));
        }
        let mut raw = [0u8; 2];
        raw.copy_from_slice(&cursor[1..3]);
        cursor = &cursor[3..];
        columns.hash_code = Some(u16::from_be_bytes(raw));

        while cursor.first() != Some(&tag::GROUP_END) {
            if cursor.is_empty() {
                return Err(DocDbError::corruption("missing group-end after hash columns"));
            }
            columns.hashed.push(KeyEntryValue::consume_from(&mut cursor)?);
        }
        cursor = &cursor[1..]; // consume GROUP_END
        hash_part_size = key.len() - cursor.len();
    }

    while cursor.first() != Some(&tag::GROUP_END) {
        if cursor.is_empty() {
            return Err(DocDbError::corruption("missing group-end terminating doc key"));
        }
        columns.range.push(KeyEntryValue::consume_from(&mut cursor)?);
    }
    cursor = &cursor[1..]; // consume final GROUP_END

    let doc_key_size = key.len() - cursor.len();

    if let Some(end_idx) = end_referenced_key_column_index {
        let num_key_columns = columns.hashed.len() + columns.range.len();
        if end_idx > num_key_columns {
            return Err(DocDbError::invalid_argument(format!(
                "end_referenced_key_column_index {end_idx} is higher than num_key_columns {num_key_columns}"
            )));
        }
    }

    Ok((columns, DocKeySizes {
        hash_part_size,
        doc_key_size,
    }))
}

/// Returns the byte offsets of a `DocKey` without materializing the decoded
/// column values, for the common case where only the split point is needed.
pub fn doc_key_sizes(key: &[u8]) -> Result<DocKeySizes> {
    decode_doc_key(key, None).map(|(_, sizes)| sizes)
}
