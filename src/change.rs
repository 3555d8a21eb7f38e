// Copyright 2026 Developers of the converge project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! In-flight local changes: per-key FIFO queues and resend deadlines.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::Hash;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::jsondiff::ObjectOperationSet;

/// State of an in-flight local change.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChangeState {
    Pending,
    Sent,
    Acknowledged,
}

/// The intended outcome of a local change, kept so a re-send can recompute
/// its operations against a ghost that advanced in the meantime.
#[derive(Clone, Debug, PartialEq)]
pub enum ChangeTarget {
    Data(Map<String, Value>),
    Remove,
}

/// One local mutation on its way to the server.
#[derive(Clone, Debug)]
pub struct Change {
    pub ccid: String,
    pub key: String,
    pub source_version: u64,
    pub operations: ObjectOperationSet,
    pub target: ChangeTarget,
    pub state: ChangeState,
    /// Sent even when the diff is empty, to force a version bump.
    pub force: bool,
}

impl Change {
    pub fn modify(
        key: &str,
        source_version: u64,
        operations: ObjectOperationSet,
        target: Map<String, Value>,
    ) -> Self {
        Change {
            ccid: fresh_ccid(),
            key: key.to_string(),
            source_version,
            operations,
            target: ChangeTarget::Data(target),
            state: ChangeState::Pending,
            force: false,
        }
    }

    pub fn remove(key: &str, source_version: u64) -> Self {
        Change {
            ccid: fresh_ccid(),
            key: key.to_string(),
            source_version,
            operations: ObjectOperationSet::new(),
            target: ChangeTarget::Remove,
            state: ChangeState::Pending,
            force: false,
        }
    }

    pub fn is_remove(&self) -> bool {
        matches!(self.target, ChangeTarget::Remove)
    }
}

fn fresh_ccid() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Per-key FIFO queues of local changes. The head of a queue is the only
/// change that may be on the wire for its key.
#[derive(Debug, Default)]
pub struct LocalQueue {
    queues: HashMap<String, VecDeque<Change>>,
}

impl LocalQueue {
    pub fn push(&mut self, change: Change) {
        self.queues
            .entry(change.key.clone())
            .or_default()
            .push_back(change);
    }

    pub fn head(&self, key: &str) -> Option<&Change> {
        self.queues.get(key).and_then(|q| q.front())
    }

    pub fn head_mut(&mut self, key: &str) -> Option<&mut Change> {
        self.queues.get_mut(key).and_then(|q| q.front_mut())
    }

    pub fn pop_head(&mut self, key: &str) -> Option<Change> {
        let queue = self.queues.get_mut(key)?;
        let change = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(key);
        }
        change
    }

    /// Cancel queued non-remove changes for `key`. A change already on the
    /// wire stays until its acknowledgment or timeout.
    pub fn cancel_pending_modifies(&mut self, key: &str) {
        if let Some(queue) = self.queues.get_mut(key) {
            queue.retain(|c| c.state == ChangeState::Sent || c.is_remove());
            if queue.is_empty() {
                self.queues.remove(key);
            }
        }
    }

    pub fn remove_by_ccid(&mut self, key: &str, ccids: &[String]) {
        if let Some(queue) = self.queues.get_mut(key) {
            queue.retain(|c| !ccids.contains(&c.ccid));
            if queue.is_empty() {
                self.queues.remove(key);
            }
        }
    }

    pub fn changes_mut(&mut self, key: &str) -> impl Iterator<Item = &mut Change> + '_ {
        self.queues.get_mut(key).into_iter().flatten()
    }

    pub fn has_changes(&self) -> bool {
        !self.queues.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.queues.keys().cloned().collect()
    }

    /// Return every sent change to pending, e.g. after losing the socket.
    pub fn reset_sent(&mut self) {
        for queue in self.queues.values_mut() {
            for change in queue.iter_mut() {
                if change.state == ChangeState::Sent {
                    change.state = ChangeState::Pending;
                }
            }
        }
    }
}

/// Deadline index over in-flight changes, keyed by object key.
#[derive(Debug, Default)]
pub(crate) struct TimeoutWheel<T: Clone + Hash + Eq> {
    wheel: BTreeMap<(DateTime<Utc>, u64), T>,
    map: HashMap<T, (DateTime<Utc>, u64)>,
    seq: u64,
}

impl<T: Clone + Hash + Eq> TimeoutWheel<T> {
    pub fn new() -> Self {
        TimeoutWheel {
            wheel: BTreeMap::new(),
            map: HashMap::new(),
            seq: 0,
        }
    }

    pub fn insert(&mut self, e: T, deadline: DateTime<Utc>) {
        self.seq += 1;
        let stamp = (deadline, self.seq);
        if let Some(old) = self.map.insert(e.clone(), stamp) {
            self.wheel.remove(&old);
        }
        self.wheel.insert(stamp, e);
    }

    pub fn pop_expired(&mut self) -> Option<T> {
        let entry = self.wheel.first_entry()?;
        if entry.key().0 >= Utc::now() {
            return None;
        }
        let value = entry.remove();
        self.map.remove(&value);
        Some(value)
    }

    pub fn remove(&mut self, value: &T) -> Option<T> {
        self.map
            .remove(value)
            .and_then(|stamp| self.wheel.remove(&stamp))
    }

    pub fn clear(&mut self) {
        self.wheel.clear();
        self.map.clear();
    }
}
