// Copyright 2026 Developers of the converge project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The local object store consumed by a [`Bucket`](crate::Bucket).

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;

/// An object of a bucket: its id, object-shaped data, and the last
/// server-acknowledged version (0 until first acknowledgment).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BucketObject {
    pub id: String,
    pub data: Map<String, Value>,
    pub version: u64,
}

/// One object as held by the local store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    pub id: String,
    pub data: Map<String, Value>,
    pub is_indexing: bool,
}

/// Persistence for bucket objects, supplied by the embedding application.
/// Queries are opaque to the engine and interpreted by the implementation.
#[async_trait]
pub trait BucketStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<StoredObject>, StoreError>;
    async fn update(
        &self,
        id: &str,
        data: Map<String, Value>,
        is_indexing: bool,
    ) -> Result<StoredObject, StoreError>;
    async fn remove(&self, id: &str) -> Result<(), StoreError>;
    async fn find(&self, query: &Value) -> Result<Vec<StoredObject>, StoreError>;
}

/// In-memory [`BucketStore`] used by tests and demos. `find` ignores the
/// query and returns every object.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BucketStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<StoredObject>, StoreError> {
        Ok(self.objects.lock().get(id).cloned())
    }

    async fn update(
        &self,
        id: &str,
        data: Map<String, Value>,
        is_indexing: bool,
    ) -> Result<StoredObject, StoreError> {
        let object = StoredObject {
            id: id.to_string(),
            data,
            is_indexing,
        };
        self.objects.lock().insert(id.to_string(), object.clone());
        Ok(object)
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.objects.lock().remove(id);
        Ok(())
    }

    async fn find(&self, _query: &Value) -> Result<Vec<StoredObject>, StoreError> {
        Ok(self.objects.lock().values().cloned().collect())
    }
}
