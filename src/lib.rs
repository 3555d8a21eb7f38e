// Copyright 2026 Developers of the converge project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! This crate provides the client half of a hosted object-sync service: it
//! keeps named [`Bucket`]s of JSON objects consistent with the server's
//! authoritative copy across disconnections and concurrent edits.

//! Changes travel as JSON operational diffs relative to a per-object
//! [`Ghost`] (the last state both sides agreed on), computed, applied, and
//! three-way rebased by the [`jsondiff`] algebra. One [`Client`] multiplexes
//! any number of bucket channels over a single reconnecting duplex socket.

//! The local object store and the ghost store are pluggable ([`BucketStore`]
//! and [`GhostStore`]); in-memory implementations are bundled for tests and
//! demos, as is a plain TCP line transport behind the [`Connector`] seam.

pub mod auth;
pub mod bucket;
pub mod change;
pub mod channel;
pub mod client;
pub mod error;
pub mod ghost;
pub mod jsondiff;
pub mod protocol;
pub mod store;
pub mod textdiff;
pub mod transport;

pub use auth::{Auth, Credentials};
pub use bucket::{Bucket, BucketEvent, ChangeResolver, RemoteInfo, UpdateOptions};
pub use change::{Change, ChangeState};
pub use channel::Channel;
pub use client::{Client, ClientConfig, ClientEvent};
pub use error::{DiffError, StoreError, SyncError};
pub use ghost::{Ghost, GhostStore, MemoryGhostStore};
pub use jsondiff::{
    apply_object_diff, object_diff, transform_object_diff, ObjectOperationSet, Operation,
};
pub use store::{BucketObject, BucketStore, MemoryStore, StoredObject};
pub use transport::{Connector, FrameSink, FrameSource, TcpConnector};
