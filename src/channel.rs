// Copyright 2026 Developers of the converge project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The per-bucket protocol state machine.
//!
//! A channel authenticates, downloads the bucket index, applies inbound
//! changes against the ghost store, rebases outstanding local changes over
//! them, and drives the per-key send queue. One channel exists per bucket and
//! is owned by the [`Client`](crate::Client); the bucket reaches it through a
//! cloneable handle.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{debug, trace, warn};

use crate::bucket::{BucketEvent, ChangeResolver, RemoteInfo};
use crate::change::{Change, ChangeState, ChangeTarget, LocalQueue, TimeoutWheel};
use crate::client::{ClientConfig, Outbox};
use crate::error::SyncError;
use crate::ghost::{Ghost, Ghosts};
use crate::jsondiff::{
    apply_object_diff, object_diff, transform_object_diff, ObjectOperationSet,
};
use crate::protocol::{
    self, AuthResult, ChangeOp, ChannelMessage, IndexPage, LocalChangeWire, RemoteChange,
};
use crate::store::BucketStore;

/// How long a sent change may stay unacknowledged before it is re-sent.
const CHANGE_RESEND_SECONDS: i64 = 12;
/// How long a revision fetch may wait for its entity response.
const REVISION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ChannelState {
    Disconnected,
    Authorizing,
    Indexing,
    Ready,
    Unauthorized,
}

enum EntityWaiter {
    ResetGhost,
    Revision(oneshot::Sender<Option<Map<String, Value>>>),
}

/// Cloneable handle to one bucket's protocol state machine.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Mutex<ChannelCore>>,
}

impl Channel {
    pub(crate) fn new(
        name: &str,
        config: Arc<ClientConfig>,
        outbox: Outbox,
        store: Arc<dyn BucketStore>,
        ghosts: Ghosts,
        events: broadcast::Sender<BucketEvent>,
    ) -> Self {
        Channel {
            inner: Arc::new(Mutex::new(ChannelCore {
                name: name.to_string(),
                config,
                state: ChannelState::Disconnected,
                outbox,
                store,
                ghosts,
                events,
                resolver: None,
                queue: LocalQueue::default(),
                resend: TimeoutWheel::new(),
                deferred: Vec::new(),
                indexed: HashSet::new(),
                change_version: None,
                pending_entities: HashMap::new(),
                log_level: 0,
            })),
        }
    }

    pub(crate) async fn connected(&self) {
        self.inner.lock().await.connected();
    }

    pub(crate) async fn disconnected(&self) {
        self.inner.lock().await.disconnected();
    }

    pub(crate) async fn handle_message(&self, message: &str) {
        self.inner.lock().await.handle_message(message).await;
    }

    pub(crate) async fn check_timeouts(&self) {
        self.inner.lock().await.check_timeouts().await;
    }

    pub(crate) async fn enqueue_update(&self, id: &str, data: Map<String, Value>) {
        self.inner.lock().await.enqueue_update(id, data).await;
    }

    pub(crate) async fn enqueue_remove(&self, id: &str) {
        self.inner.lock().await.enqueue_remove(id).await;
    }

    pub(crate) async fn enqueue_touch(&self, id: &str) {
        self.inner.lock().await.enqueue_touch(id).await;
    }

    pub(crate) async fn reload(&self) {
        self.inner.lock().await.reload();
    }

    pub(crate) async fn set_resolver(&self, resolver: ChangeResolver) {
        self.inner.lock().await.resolver = Some(resolver);
    }

    pub(crate) async fn has_local_changes(&self) -> bool {
        self.inner.lock().await.queue.has_changes()
    }

    pub(crate) async fn version(&self, id: &str) -> Result<u64, SyncError> {
        Ok(self.inner.lock().await.ghosts.version(id).await?)
    }

    /// Fetch every past revision of `id` below the current ghost version.
    pub(crate) async fn revisions(
        &self,
        id: &str,
    ) -> Result<Vec<(u64, Map<String, Value>)>, SyncError> {
        let waiters = {
            let mut core = self.inner.lock().await;
            let current = core.ghosts.version(id).await?;
            let mut waiters = Vec::new();
            for version in 1..current {
                let (tx, rx) = oneshot::channel();
                core.request_entity(id, version, EntityWaiter::Revision(tx));
                waiters.push((version, rx));
            }
            waiters
        };
        let mut revisions = Vec::new();
        for (version, rx) in waiters {
            match tokio::time::timeout(REVISION_TIMEOUT, rx).await {
                Ok(Ok(Some(data))) => revisions.push((version, data)),
                Ok(Ok(None)) => {}
                Ok(Err(_)) | Err(_) => {
                    return Err(SyncError::Protocol(format!(
                        "revision fetch timed out for {id}.{version}"
                    )));
                }
            }
        }
        Ok(revisions)
    }
}

struct ChannelCore {
    name: String,
    config: Arc<ClientConfig>,
    state: ChannelState,
    outbox: Outbox,
    store: Arc<dyn BucketStore>,
    ghosts: Ghosts,
    events: broadcast::Sender<BucketEvent>,
    resolver: Option<ChangeResolver>,
    queue: LocalQueue,
    resend: TimeoutWheel<String>,
    deferred: Vec<RemoteChange>,
    indexed: HashSet<String>,
    change_version: Option<String>,
    pending_entities: HashMap<(String, u64), Vec<EntityWaiter>>,
    log_level: i64,
}

enum SendOutcome {
    Sent(String),
    DropHead,
    QueueEmpty,
    AlreadySent,
}

impl ChannelCore {
    fn connected(&mut self) {
        debug!("channel {} connected; authorizing", self.name);
        self.state = ChannelState::Authorizing;
        self.queue.reset_sent();
        self.resend.clear();
        self.pending_entities.clear();
        self.outbox
            .send(protocol::init_message(&self.config, &self.name));
    }

    fn disconnected(&mut self) {
        self.state = ChannelState::Disconnected;
        self.queue.reset_sent();
        self.resend.clear();
    }

    async fn handle_message(&mut self, message: &str) {
        let parsed = match protocol::parse_channel_message(message) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!("ignoring malformed frame on {}: {err}", self.name);
                return;
            }
        };
        match parsed {
            ChannelMessage::Auth(result) => self.handle_auth(result).await,
            ChannelMessage::Index(page) => self.handle_index(page).await,
            ChannelMessage::Changes(changes) => {
                for change in changes {
                    if self.state == ChannelState::Indexing && !self.indexed.contains(&change.id)
                    {
                        // Changes for ids we have not indexed yet wait until
                        // the index completes.
                        self.deferred.push(change);
                    } else {
                        self.apply_remote_change(change).await;
                    }
                }
            }
            ChannelMessage::ChangeRejected => {
                self.emit_error(&SyncError::Protocol(
                    "change rejected by server".to_string(),
                ));
            }
            ChannelMessage::Entity { id, version, data } => {
                self.handle_entity(id, version, data).await;
            }
            ChannelMessage::UnknownChangeVersion => {
                debug!("checkpoint of {} unknown to server; reindexing", self.name);
                self.change_version = None;
                self.begin_index();
            }
            ChannelMessage::LogLevel(level) => {
                debug!("server set log level {level} on {}", self.name);
                self.log_level = level;
            }
        }
    }

    async fn handle_auth(&mut self, result: AuthResult) {
        match result {
            AuthResult::Expired => {
                warn!("authorization for {} expired", self.name);
                self.state = ChannelState::Unauthorized;
                let _ = self.events.send(BucketEvent::Unauthorized);
            }
            AuthResult::User(user) => {
                debug!("{} authorized as {user}", self.name);
                match self.change_version.clone() {
                    Some(cv) => {
                        // Resume from the checkpoint; the server streams the
                        // changes we missed, or answers `cv:?`.
                        self.outbox.send(protocol::change_version_request(&cv));
                        self.state = ChannelState::Ready;
                        self.send_all_pending().await;
                    }
                    None => self.begin_index(),
                }
            }
        }
    }

    fn begin_index(&mut self) {
        self.state = ChannelState::Indexing;
        self.indexed.clear();
        self.deferred.clear();
        self.outbox.send(protocol::index_request(
            None,
            self.config.index_page_limit,
        ));
        let _ = self.events.send(BucketEvent::Indexing);
    }

    async fn handle_index(&mut self, page: IndexPage) {
        if self.state != ChannelState::Indexing {
            debug!("ignoring index page for {} outside indexing", self.name);
            return;
        }
        for entry in page.index {
            match entry.d {
                Some(data) => self.index_entry(entry.id, entry.v, data).await,
                None => self.request_entity(&entry.id, entry.v, EntityWaiter::ResetGhost),
            }
        }
        match page.mark.filter(|mark| !mark.is_empty()) {
            Some(mark) => self.outbox.send(protocol::index_request(
                Some(&mark),
                self.config.index_page_limit,
            )),
            None => {
                if let Some(current) = page.current {
                    self.change_version = Some(current);
                }
                self.finish_index().await;
            }
        }
    }

    async fn index_entry(&mut self, id: String, version: u64, data: Map<String, Value>) {
        if let Err(err) = self
            .ghosts
            .put(Ghost {
                key: id.clone(),
                version,
                data: data.clone(),
            })
            .await
        {
            self.emit_error(&err);
            return;
        }
        if let Err(err) = self.store.update(&id, data.clone(), true).await {
            self.emit_error(&err);
        }
        self.indexed.insert(id.clone());
        let _ = self.events.send(BucketEvent::Update {
            id,
            data,
            remote: Some(RemoteInfo {
                original: None,
                patch: ObjectOperationSet::new(),
                is_indexing: true,
            }),
        });
    }

    async fn finish_index(&mut self) {
        debug!("index of {} complete: {} objects", self.name, self.indexed.len());
        self.state = ChannelState::Ready;
        self.purge_unlisted_ghosts().await;
        let deferred = std::mem::take(&mut self.deferred);
        for change in deferred {
            self.apply_remote_change(change).await;
        }
        let _ = self.events.send(BucketEvent::Index);
        self.send_all_pending().await;
    }

    /// Drop ghosts for objects a completed index no longer lists. Entries
    /// still being fetched as entities are not up for removal, and neither
    /// are keys with unacknowledged local creates (those have no ghost yet).
    async fn purge_unlisted_ghosts(&mut self) {
        let keys = match self.ghosts.each_key().await {
            Ok(keys) => keys,
            Err(err) => return self.emit_error(&err),
        };
        for key in keys {
            if self.indexed.contains(&key)
                || self.pending_entities.keys().any(|(id, _)| id == &key)
            {
                continue;
            }
            debug!("purging ghost {key} absent from the index of {}", self.name);
            if let Err(err) = self.ghosts.remove(&key).await {
                self.emit_error(&err);
            }
            if let Err(err) = self.store.remove(&key).await {
                self.emit_error(&err);
            }
            let _ = self.events.send(BucketEvent::Remove { id: key });
        }
    }

    async fn apply_remote_change(&mut self, change: RemoteChange) {
        if let Some(ccid) = &change.ccid {
            let is_ack = self
                .queue
                .head(&change.id)
                .map_or(false, |c| c.state == ChangeState::Sent && &c.ccid == ccid);
            if is_ack {
                return self.acknowledge(change).await;
            }
        }

        let key = change.id.clone();
        let ghost = match self.ghosts.get_or_empty(&key).await {
            Ok(ghost) => ghost,
            Err(err) => return self.emit_error(&err),
        };
        if change.ev <= ghost.version {
            trace!("discarding replayed change for {key} (ev {} <= ghost {})", change.ev, ghost.version);
            return;
        }
        if let Some(cv) = change.cv.clone() {
            self.change_version = Some(cv);
        }

        match change.o {
            ChangeOp::Remove => {
                if let Err(err) = self.ghosts.remove(&key).await {
                    self.emit_error(&err);
                }
                if let Err(err) = self.store.remove(&key).await {
                    self.emit_error(&err);
                }
                let _ = self.events.send(BucketEvent::Remove { id: key });
            }
            ChangeOp::Modify => {
                let source_ok = match change.sv {
                    Some(sv) => sv == ghost.version,
                    None => ghost.version == 0,
                };
                if !source_ok {
                    debug!(
                        "source version mismatch for {key}: ghost at {}, change from {:?}; fetching entity",
                        ghost.version, change.sv
                    );
                    self.request_entity(&key, change.ev, EntityWaiter::ResetGhost);
                    return;
                }
                let ops = change.v.clone().unwrap_or_default();
                let upstream_applied = match apply_object_diff(&ops, &ghost.data) {
                    Ok(data) => data,
                    Err(err) => {
                        warn!("dropping unappliable change for {key}: {err}");
                        self.emit_error(&err);
                        self.request_entity(&key, change.ev, EntityWaiter::ResetGhost);
                        return;
                    }
                };
                let current = match self.store.get(&key).await {
                    Ok(stored) => stored.map(|o| o.data),
                    Err(err) => {
                        self.emit_error(&err);
                        None
                    }
                };
                let original = match &self.resolver {
                    Some(resolve) => resolve(&key, current.as_ref()).or(current),
                    None => current,
                };
                self.rebase_queue(&key, &ops, &ghost, change.ev, &upstream_applied);
                if let Err(err) = self
                    .ghosts
                    .put(Ghost {
                        key: key.clone(),
                        version: change.ev,
                        data: upstream_applied.clone(),
                    })
                    .await
                {
                    self.emit_error(&err);
                }
                let is_indexing = self.state == ChannelState::Indexing;
                if let Err(err) = self
                    .store
                    .update(&key, upstream_applied.clone(), is_indexing)
                    .await
                {
                    self.emit_error(&err);
                }
                let _ = self.events.send(BucketEvent::Update {
                    id: key.clone(),
                    data: upstream_applied,
                    remote: Some(RemoteInfo {
                        original,
                        patch: ops,
                        is_indexing,
                    }),
                });
                self.maybe_send_next(&key).await;
            }
        }
    }

    async fn acknowledge(&mut self, change: RemoteChange) {
        let key = change.id.clone();
        self.resend.remove(&key);
        let Some(local) = self.queue.pop_head(&key) else {
            return;
        };
        debug!("change {} for {key} acknowledged at version {}", local.ccid, change.ev);
        match change.o {
            ChangeOp::Remove => {
                if let Err(err) = self.ghosts.remove(&key).await {
                    self.emit_error(&err);
                }
            }
            ChangeOp::Modify => {
                let ghost = match self.ghosts.get_or_empty(&key).await {
                    Ok(ghost) => ghost,
                    Err(err) => return self.emit_error(&err),
                };
                let data = match change.d {
                    Some(data) => data,
                    None => {
                        let ops = change.v.as_ref().unwrap_or(&local.operations);
                        match apply_object_diff(ops, &ghost.data) {
                            Ok(data) => data,
                            Err(err) => {
                                warn!("acknowledgment for {key} did not apply: {err}");
                                self.emit_error(&err);
                                self.request_entity(&key, change.ev, EntityWaiter::ResetGhost);
                                return;
                            }
                        }
                    }
                };
                if let Err(err) = self
                    .ghosts
                    .put(Ghost {
                        key: key.clone(),
                        version: change.ev,
                        data: data.clone(),
                    })
                    .await
                {
                    self.emit_error(&err);
                }
                // Once the queue for this key drains, the store must show the
                // acknowledged state (an interleaved upstream change may have
                // overwritten the optimistic local write).
                if self.queue.head(&key).is_none() {
                    let stale = match self.store.get(&key).await {
                        Ok(Some(stored)) => stored.data != data,
                        Ok(None) => true,
                        Err(_) => false,
                    };
                    if stale {
                        if let Err(err) = self.store.update(&key, data.clone(), false).await {
                            self.emit_error(&err);
                        }
                        let _ = self.events.send(BucketEvent::Update {
                            id: key.clone(),
                            data,
                            remote: None,
                        });
                    }
                }
            }
        }
        if let Some(cv) = change.cv {
            self.change_version = Some(cv);
        }
        self.maybe_send_next(&key).await;
    }

    /// Rebase every queued local change for `key` onto an upstream change,
    /// dropping the ones the transform reduces to nothing.
    fn rebase_queue(
        &mut self,
        key: &str,
        upstream: &ObjectOperationSet,
        ghost: &Ghost,
        ev: u64,
        upstream_applied: &Map<String, Value>,
    ) {
        let mut dropped = Vec::new();
        let name = self.name.clone();
        for local in self.queue.changes_mut(key) {
            if local.is_remove() {
                local.source_version = ev;
                local.state = ChangeState::Pending;
                continue;
            }
            match transform_object_diff(&local.operations, upstream, &ghost.data) {
                Ok(rebased) if rebased.is_empty() && !local.force => {
                    debug!("local change {} for {key} superseded upstream", local.ccid);
                    dropped.push(local.ccid.clone());
                }
                Ok(rebased) => match apply_object_diff(&rebased, upstream_applied) {
                    Ok(target) => {
                        local.operations = rebased;
                        local.source_version = ev;
                        local.target = ChangeTarget::Data(target);
                        // An in-flight copy is stale now; re-send the rebase.
                        local.state = ChangeState::Pending;
                    }
                    Err(err) => {
                        warn!("dropping unrebasable local change for {key}: {err}");
                        dropped.push(local.ccid.clone());
                    }
                },
                Err(err) => {
                    warn!("dropping unrebasable local change for {key}: {err}");
                    dropped.push(local.ccid.clone());
                }
            }
        }
        if !dropped.is_empty() {
            self.queue.remove_by_ccid(key, &dropped);
        }
    }

    async fn handle_entity(&mut self, id: String, version: u64, data: Option<Map<String, Value>>) {
        let waiters = self
            .pending_entities
            .remove(&(id.clone(), version))
            .unwrap_or_default();
        if waiters.is_empty() {
            trace!("unsolicited entity response {id}.{version} on {}", self.name);
            return;
        }
        match data {
            None => {
                warn!("entity {id}.{version} unavailable on {}", self.name);
                let ghost_version = self.ghosts.version(&id).await.unwrap_or(0);
                if let Err(err) = self.ghosts.remove(&id).await {
                    self.emit_error(&err);
                }
                self.emit_error(&SyncError::VersionMismatch {
                    key: id.clone(),
                    ghost: ghost_version,
                    source_version: version,
                });
                for waiter in waiters {
                    if let EntityWaiter::Revision(tx) = waiter {
                        let _ = tx.send(None);
                    }
                }
            }
            Some(map) => {
                let mut reset = false;
                for waiter in waiters {
                    match waiter {
                        EntityWaiter::ResetGhost => reset = true,
                        EntityWaiter::Revision(tx) => {
                            let _ = tx.send(Some(map.clone()));
                        }
                    }
                }
                if reset {
                    if let Err(err) = self
                        .ghosts
                        .put(Ghost {
                            key: id.clone(),
                            version,
                            data: map.clone(),
                        })
                        .await
                    {
                        self.emit_error(&err);
                    }
                    let is_indexing = self.state == ChannelState::Indexing;
                    if is_indexing {
                        self.indexed.insert(id.clone());
                    }
                    if let Err(err) = self.store.update(&id, map.clone(), is_indexing).await {
                        self.emit_error(&err);
                    }
                    let _ = self.events.send(BucketEvent::Update {
                        id: id.clone(),
                        data: map,
                        remote: Some(RemoteInfo {
                            original: None,
                            patch: ObjectOperationSet::new(),
                            is_indexing,
                        }),
                    });
                    self.maybe_send_next(&id).await;
                }
            }
        }
    }

    fn request_entity(&mut self, id: &str, version: u64, waiter: EntityWaiter) {
        let waiters = self
            .pending_entities
            .entry((id.to_string(), version))
            .or_default();
        if waiters.is_empty() {
            self.outbox.send(protocol::entity_request(id, version));
        }
        waiters.push(waiter);
    }

    async fn enqueue_update(&mut self, id: &str, data: Map<String, Value>) {
        let ghost = match self.ghosts.get_or_empty(id).await {
            Ok(ghost) => ghost,
            Err(err) => return self.emit_error(&err),
        };
        let operations = object_diff(&ghost.data, &data);
        self.queue
            .push(Change::modify(id, ghost.version, operations, data));
        self.maybe_send_next(id).await;
    }

    async fn enqueue_remove(&mut self, id: &str) {
        self.queue.cancel_pending_modifies(id);
        let version = match self.ghosts.version(id).await {
            Ok(version) => version,
            Err(err) => {
                self.emit_error(&err);
                0
            }
        };
        self.queue.push(Change::remove(id, version));
        self.maybe_send_next(id).await;
    }

    async fn enqueue_touch(&mut self, id: &str) {
        let ghost = match self.ghosts.get_or_empty(id).await {
            Ok(ghost) => ghost,
            Err(err) => return self.emit_error(&err),
        };
        let data = match self.store.get(id).await {
            Ok(Some(stored)) => stored.data,
            _ => ghost.data.clone(),
        };
        let mut change = Change::modify(id, ghost.version, ObjectOperationSet::new(), data);
        change.force = true;
        self.queue.push(change);
        self.maybe_send_next(id).await;
    }

    fn reload(&mut self) {
        debug!("reloading index of {}", self.name);
        self.change_version = None;
        if self.state == ChannelState::Ready || self.state == ChannelState::Indexing {
            self.begin_index();
        }
    }

    async fn send_all_pending(&mut self) {
        for key in self.queue.keys() {
            self.maybe_send_next(&key).await;
        }
    }

    /// Put the next pending change for `key` on the wire, refreshing its
    /// source version and operations against the current ghost.
    async fn maybe_send_next(&mut self, key: &str) {
        if self.state != ChannelState::Ready {
            return;
        }
        loop {
            let ghost = match self.ghosts.get_or_empty(key).await {
                Ok(ghost) => ghost,
                Err(err) => return self.emit_error(&err),
            };
            let outcome = {
                match self.queue.head_mut(key) {
                    None => SendOutcome::QueueEmpty,
                    Some(head) if head.state == ChangeState::Sent => SendOutcome::AlreadySent,
                    Some(head) => {
                        head.source_version = ghost.version;
                        let op = match &head.target {
                            ChangeTarget::Data(data) => {
                                head.operations = object_diff(&ghost.data, data);
                                if head.operations.is_empty() && !head.force {
                                    None
                                } else {
                                    Some(ChangeOp::Modify)
                                }
                            }
                            ChangeTarget::Remove => Some(ChangeOp::Remove),
                        };
                        match op {
                            None => SendOutcome::DropHead,
                            Some(op) => {
                                let wire = LocalChangeWire {
                                    clientid: &self.config.client_id,
                                    id: key,
                                    o: op,
                                    v: matches!(op, ChangeOp::Modify)
                                        .then_some(&head.operations),
                                    sv: head.source_version,
                                    ccid: &head.ccid,
                                };
                                match protocol::change_message(&wire) {
                                    Ok(frame) => {
                                        head.state = ChangeState::Sent;
                                        SendOutcome::Sent(frame)
                                    }
                                    Err(_) => SendOutcome::DropHead,
                                }
                            }
                        }
                    }
                }
            };
            match outcome {
                SendOutcome::QueueEmpty => {
                    self.resend.remove(&key.to_string());
                    return;
                }
                SendOutcome::AlreadySent => return,
                SendOutcome::DropHead => {
                    trace!("dropping no-op change for {key}");
                    self.queue.pop_head(key);
                }
                SendOutcome::Sent(frame) => {
                    self.outbox.send(frame);
                    self.resend.insert(
                        key.to_string(),
                        Utc::now() + chrono::Duration::seconds(CHANGE_RESEND_SECONDS),
                    );
                    return;
                }
            }
        }
    }

    async fn check_timeouts(&mut self) {
        while let Some(key) = self.resend.pop_expired() {
            if let Some(head) = self.queue.head_mut(&key) {
                if head.state == ChangeState::Sent {
                    debug!("change for {key} timed out; resending");
                    head.state = ChangeState::Pending;
                }
            }
            self.maybe_send_next(&key).await;
        }
    }

    fn emit_error(&self, err: &dyn Display) {
        warn!("channel {} error: {err}", self.name);
        let _ = self.events.send(BucketEvent::Error(err.to_string()));
    }
}
