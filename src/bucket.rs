// Copyright 2026 Developers of the converge project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The application-facing view of one synchronized bucket.
//!
//! A bucket owns the local store and a handle to its protocol channel. Local
//! mutations are written to the store first and then forwarded to the channel
//! for submission; remote mutations flow back through the same store and are
//! announced on the bucket's event bus.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::channel::Channel;
use crate::error::{DiffError, SyncError};
use crate::jsondiff::ObjectOperationSet;
use crate::store::{BucketObject, BucketStore, StoredObject};

/// Presentation context attached to updates that came over the network.
#[derive(Clone, Debug)]
pub struct RemoteInfo {
    /// The local-known value before the change, as supplied by the change
    /// resolver (or the store when no resolver is installed).
    pub original: Option<Map<String, Value>>,
    /// The operations the change carried.
    pub patch: ObjectOperationSet,
    pub is_indexing: bool,
}

/// Lifecycle events of a bucket.
#[derive(Clone, Debug)]
pub enum BucketEvent {
    /// The initial index download started.
    Indexing,
    /// The initial index download completed.
    Index,
    /// An object changed; `remote` is present for network-driven updates.
    Update {
        id: String,
        data: Map<String, Value>,
        remote: Option<RemoteInfo>,
    },
    Remove {
        id: String,
    },
    Unauthorized,
    Error(String),
}

/// Hook invoked before a remote change is applied; returns the local-known
/// value to present alongside the change, or `None` to use the store's.
pub type ChangeResolver =
    Box<dyn Fn(&str, Option<&Map<String, Value>>) -> Option<Map<String, Value>> + Send + Sync>;

/// Options for [`Bucket::update_with`].
#[derive(Clone, Copy, Debug)]
pub struct UpdateOptions {
    /// Submit the change to the server. Defaults to true.
    pub sync: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        UpdateOptions { sync: true }
    }
}

/// One synchronized bucket of JSON objects.
pub struct Bucket {
    name: String,
    store: Arc<dyn BucketStore>,
    channel: Channel,
    events: broadcast::Sender<BucketEvent>,
}

impl Bucket {
    pub(crate) fn new(
        name: &str,
        store: Arc<dyn BucketStore>,
        channel: Channel,
        events: broadcast::Sender<BucketEvent>,
    ) -> Self {
        Bucket {
            name: name.to_string(),
            store,
            channel,
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BucketEvent> {
        self.events.subscribe()
    }

    /// Create an object under a fresh id.
    pub async fn add(&self, data: Value) -> Result<BucketObject, SyncError> {
        let id = Uuid::new_v4().simple().to_string();
        self.update(&id, data).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<BucketObject>, SyncError> {
        let Some(stored) = self.store.get(id).await? else {
            return Ok(None);
        };
        let version = self.channel.version(id).await?;
        Ok(Some(BucketObject {
            id: stored.id,
            data: stored.data,
            version,
        }))
    }

    pub async fn update(&self, id: &str, data: Value) -> Result<BucketObject, SyncError> {
        self.update_with(id, data, UpdateOptions::default()).await
    }

    /// Write an object locally and, when `options.sync` holds, queue the
    /// change for submission. Top-level data must be a JSON object.
    pub async fn update_with(
        &self,
        id: &str,
        data: Value,
        options: UpdateOptions,
    ) -> Result<BucketObject, SyncError> {
        let Value::Object(data) = data else {
            return Err(DiffError::MalformedOperation(
                "bucket data must be a JSON object".to_string(),
            )
            .into());
        };
        self.store.update(id, data.clone(), false).await?;
        if options.sync {
            self.channel.enqueue_update(id, data.clone()).await;
        }
        let _ = self.events.send(BucketEvent::Update {
            id: id.to_string(),
            data: data.clone(),
            remote: None,
        });
        let version = self.channel.version(id).await?;
        Ok(BucketObject {
            id: id.to_string(),
            data,
            version,
        })
    }

    pub async fn remove(&self, id: &str) -> Result<(), SyncError> {
        self.store.remove(id).await?;
        let _ = self.events.send(BucketEvent::Remove { id: id.to_string() });
        self.channel.enqueue_remove(id).await;
        Ok(())
    }

    /// Query the local store. The query shape is opaque to the engine.
    pub async fn find(&self, query: &Value) -> Result<Vec<StoredObject>, SyncError> {
        Ok(self.store.find(query).await?)
    }

    /// The last server-acknowledged version of `id` (0 when unacknowledged).
    pub async fn get_version(&self, id: &str) -> Result<u64, SyncError> {
        self.channel.version(id).await
    }

    /// Fetch the past revisions of `id` from the server.
    pub async fn revisions(&self, id: &str) -> Result<Vec<(u64, Map<String, Value>)>, SyncError> {
        self.channel.revisions(id).await
    }

    /// Submit the object as-is to force a version bump.
    pub async fn touch(&self, id: &str) {
        self.channel.enqueue_touch(id).await;
    }

    /// Discard the change-version checkpoint and re-download the index.
    pub async fn reload(&self) {
        self.channel.reload().await;
    }

    /// Install the resolver consulted before each inbound remote change.
    pub async fn before_network_change(&self, resolver: ChangeResolver) {
        self.channel.set_resolver(resolver).await;
    }

    /// Whether any local change is still waiting for acknowledgment.
    pub async fn has_local_changes(&self) -> bool {
        self.channel.has_local_changes().await
    }
}
