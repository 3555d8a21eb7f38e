// Copyright 2026 Developers of the converge project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Error kinds of the synchronization engine.

use thiserror::Error;

/// Errors produced by the diff/patch/transform algebra.
#[derive(Debug, Error)]
pub enum DiffError {
    /// An operation tag or payload the algebra does not understand.
    #[error("malformed operation: {0}")]
    MalformedOperation(String),
    /// An operation whose precondition does not hold on the target value.
    #[error("operation precondition violated: {0}")]
    OperationPreconditionViolated(String),
    /// The text sub-diff could not parse or apply a patch.
    #[error("text patch: {0}")]
    TextPatch(String),
}

/// Opaque failure of an external store implementation.
#[derive(Debug, Error)]
#[error("store: {0}")]
pub struct StoreError(pub String);

/// Top-level error type of the engine.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),
    /// A frame or command that does not fit the current protocol state.
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("unauthorized: {0}")]
    Auth(String),
    #[error(transparent)]
    Diff(#[from] DiffError),
    /// A remote change whose source version does not match the local ghost.
    #[error("version mismatch on {key}: ghost at {ghost}, change from {source_version}")]
    VersionMismatch {
        key: String,
        ghost: u64,
        source_version: u64,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}
