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

//! MVCC read path over a log-structured, key-ordered document store:
//! encoded keys and values, the two document-read strategies, the
//! forward/backward row scan built on top of them, and the restore-diff
//! engine that turns one key range into another.

pub mod config;
pub mod document;
pub mod error;
pub mod intent_iterator;
pub mod key;
pub mod reader;
pub mod restore;
pub mod row_iterator;
pub mod schema_packing;
pub mod value;

pub use config::ReaderConfig;
pub use error::{DocDbError, Result};
pub use intent_iterator::{FetchedRecord, IntentAwareIterator};
pub use reader::{FlatDocReader, GenericDocReader, Projection, ReadContext};
pub use row_iterator::{Direction, InitMode, MaterializedRow, ReaderOutput, RowIterator, ScanChoices};
