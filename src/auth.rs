// Copyright 2026 Developers of the converge project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Credential acquisition, consumed from the embedding application.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Result of a successful credential exchange; the access token goes into
/// [`ClientConfig`](crate::ClientConfig).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Credentials {
    pub access_token: String,
    pub userid: String,
}

/// How the application exchanges a username and password for an access
/// token. The engine never performs this exchange itself.
#[async_trait]
pub trait Auth: Send + Sync {
    async fn authorize(&self, username: &str, password: &str) -> Result<Credentials, SyncError>;
}
