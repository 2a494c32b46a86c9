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

//! Reader-construction configuration. Plain fields the caller sets up front,
//! not process-wide flags: mirrors how the teacher threads `TableOption`/
//! `ReadOptions` through `StorageTable` construction.

/// Toggles read by `RowIterator`/`DocReader` construction. Changing a field
/// only affects readers built afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderConfig {
    /// Use the flat (single-subkey-per-record) `DocReader` strategy instead
    /// of the generic/nested one.
    pub use_flat_doc_reader: bool,
    /// Split `DocKey` bytes using a cached schema offsets descriptor instead
    /// of decoding segment-by-segment.
    pub use_offset_based_key_decoding: bool,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        ReaderConfig {
            use_flat_doc_reader: false,
            use_offset_based_key_decoding: false,
        }
    }
}
