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

//! The destination the generic/nested `DocReader` strategy writes into: a
//! tree of `SubDocument`s, one level per active subkey segment. Mirrors the
//! original's `SubDocument` output type without the parent-pointer cycle --
//! children are owned by their parent, looked up by encoded subkey segment.

use std::collections::BTreeMap;

use crate::key::{KeyEntryValue, SubKeyElement};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubDocumentValue {
    Null,
    Primitive(KeyEntryValue),
    Object,
}

/// A node in the nested-document output tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubDocument {
    value: SubDocumentValue,
    children: BTreeMap<Vec<u8>, SubDocument>,
}

impl Default for SubDocument {
    fn default() -> Self {
        SubDocument {
            value: SubDocumentValue::Null,
            children: BTreeMap::new(),
        }
    }
}

impl SubDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self) -> &SubDocumentValue {
        &self.value
    }

    pub fn is_null(&self) -> bool {
        matches!(self.value, SubDocumentValue::Null) && self.children.is_empty()
    }

    pub fn set_primitive(&mut self, value: KeyEntryValue) {
        self.value = SubDocumentValue::Primitive(value);
        self.children.clear();
    }

    fn element_key(element: &SubKeyElement) -> Vec<u8> {
        let mut buf = bytes::BytesMut::new();
        element.append_to(&mut buf);
        buf.to_vec()
    }

    /// Returns the child for `element`, creating an empty object node if
    /// absent. Marks this node as an object (non-leaf) if it was `Null`.
    pub fn allocate_child(&mut self, element: &SubKeyElement) -> &mut SubDocument {
        if matches!(self.value, SubDocumentValue::Null) {
            self.value = SubDocumentValue::Object;
        }
        self.children.entry(Self::element_key(element)).or_default()
    }

    pub fn get_child(&self, element: &SubKeyElement) -> Option<&SubDocument> {
        self.children.get(&Self::element_key(element))
    }

    pub fn delete_child(&mut self, element: &SubKeyElement) {
        self.children.remove(&Self::element_key(element));
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }
}
