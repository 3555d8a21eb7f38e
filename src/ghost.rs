// Copyright 2026 Developers of the converge project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Ghosts: the last server-acknowledged state of each object.
//!
//! Every remote change is a diff from ghost version N to ghost version N+1,
//! and every outbound diff is computed against the ghost, so the ghost store
//! is the anchor of convergence for a bucket.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;

/// The last server-confirmed `{version, data}` of one object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ghost {
    pub key: String,
    pub version: u64,
    pub data: Map<String, Value>,
}

/// Persistence for ghosts, supplied by the embedding application.
#[async_trait]
pub trait GhostStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Ghost>, StoreError>;
    async fn put(&self, ghost: Ghost) -> Result<(), StoreError>;
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
    async fn each_key(&self) -> Result<Vec<String>, StoreError>;
}

/// In-memory [`GhostStore`] used by tests and demos.
#[derive(Debug, Default)]
pub struct MemoryGhostStore {
    ghosts: Mutex<HashMap<String, Ghost>>,
}

impl MemoryGhostStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GhostStore for MemoryGhostStore {
    async fn get(&self, key: &str) -> Result<Option<Ghost>, StoreError> {
        Ok(self.ghosts.lock().get(key).cloned())
    }

    async fn put(&self, ghost: Ghost) -> Result<(), StoreError> {
        self.ghosts.lock().insert(ghost.key.clone(), ghost);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.ghosts.lock().remove(key);
        Ok(())
    }

    async fn each_key(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.ghosts.lock().keys().cloned().collect())
    }
}

/// Channel-side view over the ghost store.
#[derive(Clone)]
pub(crate) struct Ghosts {
    store: Arc<dyn GhostStore>,
}

impl Ghosts {
    pub fn new(store: Arc<dyn GhostStore>) -> Self {
        Ghosts { store }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Ghost>, StoreError> {
        self.store.get(key).await
    }

    /// The ghost for `key`, or an empty version-0 ghost when the server has
    /// never acknowledged the object.
    pub async fn get_or_empty(&self, key: &str) -> Result<Ghost, StoreError> {
        Ok(self.store.get(key).await?.unwrap_or_else(|| Ghost {
            key: key.to_string(),
            version: 0,
            data: Map::new(),
        }))
    }

    pub async fn put(&self, ghost: Ghost) -> Result<(), StoreError> {
        self.store.put(ghost).await
    }

    pub async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.store.remove(key).await
    }

    pub async fn version(&self, key: &str) -> Result<u64, StoreError> {
        Ok(self.store.get(key).await?.map(|g| g.version).unwrap_or(0))
    }

    pub async fn each_key(&self) -> Result<Vec<String>, StoreError> {
        self.store.each_key().await
    }
}
