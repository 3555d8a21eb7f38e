// Copyright 2026 Developers of the converge project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The wire grammar: frames multiplexed by channel index, and the command
//! vocabulary spoken on each channel.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::client::ClientConfig;
use crate::error::SyncError;
use crate::jsondiff::ObjectOperationSet;

pub const API_VERSION: &str = "1.1";
pub const LIBRARY: &str = env!("CARGO_PKG_NAME");
pub const LIBRARY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A client-level frame: either the heartbeat or a channel-addressed message.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Heartbeat(u64),
    Channel { index: usize, message: String },
}

impl Frame {
    pub fn parse(line: &str) -> Result<Frame, SyncError> {
        if let Some(body) = line.strip_prefix("h:") {
            let beat = body
                .trim()
                .parse()
                .map_err(|_| SyncError::Protocol(format!("bad heartbeat {body:?}")))?;
            return Ok(Frame::Heartbeat(beat));
        }
        let (index, message) = line
            .split_once(':')
            .ok_or_else(|| SyncError::Protocol(format!("frame without a prefix: {line:?}")))?;
        let index = index
            .parse()
            .map_err(|_| SyncError::Protocol(format!("bad channel index {index:?}")))?;
        Ok(Frame::Channel {
            index,
            message: message.to_string(),
        })
    }

    pub fn heartbeat(beat: u64) -> String {
        format!("h:{beat}")
    }

    pub fn channel(index: usize, message: &str) -> String {
        format!("{index}:{message}")
    }
}

/// A parsed channel command, as received from the server.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelMessage {
    Auth(AuthResult),
    Index(IndexPage),
    Changes(Vec<RemoteChange>),
    /// `c:?`: the server rejected a submitted change.
    ChangeRejected,
    Entity {
        id: String,
        version: u64,
        data: Option<Map<String, Value>>,
    },
    /// `cv:?`: the server does not know the requested checkpoint.
    UnknownChangeVersion,
    LogLevel(i64),
}

#[derive(Clone, Debug, PartialEq)]
pub enum AuthResult {
    User(String),
    Expired,
}

/// One page of the initial index download.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct IndexPage {
    #[serde(default)]
    pub index: Vec<IndexEntry>,
    #[serde(default)]
    pub mark: Option<String>,
    #[serde(default)]
    pub current: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub v: u64,
    #[serde(default)]
    pub d: Option<Map<String, Value>>,
}

/// Direction-independent change operation marker.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ChangeOp {
    #[serde(rename = "M")]
    Modify,
    #[serde(rename = "-")]
    Remove,
}

/// One inbound change for an object, either a peer's edit or the
/// acknowledgment of our own (matched by `ccid`).
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct RemoteChange {
    #[serde(default)]
    pub clientid: Option<String>,
    pub id: String,
    pub o: ChangeOp,
    #[serde(default)]
    pub v: Option<ObjectOperationSet>,
    /// Source version; absent for creates.
    #[serde(default)]
    pub sv: Option<u64>,
    /// End version the change produces.
    pub ev: u64,
    #[serde(default)]
    pub ccid: Option<String>,
    /// Change-version checkpoint reached by this change.
    #[serde(default)]
    pub cv: Option<String>,
    /// Full data echo, trusted over re-applying `v` when present.
    #[serde(default)]
    pub d: Option<Map<String, Value>>,
}

/// An outbound change submission.
#[derive(Debug, Serialize)]
pub struct LocalChangeWire<'a> {
    pub clientid: &'a str,
    pub id: &'a str,
    pub o: ChangeOp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v: Option<&'a ObjectOperationSet>,
    pub sv: u64,
    pub ccid: &'a str,
}

pub fn parse_channel_message(message: &str) -> Result<ChannelMessage, SyncError> {
    let (command, body) = message
        .split_once(':')
        .ok_or_else(|| SyncError::Protocol(format!("command without a body: {message:?}")))?;
    match command {
        "auth" => {
            // Failures arrive either as the literal `expired` or as a JSON
            // error object; anything else is the authorized username.
            if body == "expired" || body.starts_with('{') {
                Ok(ChannelMessage::Auth(AuthResult::Expired))
            } else {
                Ok(ChannelMessage::Auth(AuthResult::User(body.to_string())))
            }
        }
        "i" => {
            let page = serde_json::from_str(body)
                .map_err(|err| SyncError::Protocol(format!("bad index page: {err}")))?;
            Ok(ChannelMessage::Index(page))
        }
        "c" => {
            if body == "?" {
                return Ok(ChannelMessage::ChangeRejected);
            }
            let changes = if body.starts_with('[') {
                serde_json::from_str::<Vec<RemoteChange>>(body)
            } else {
                serde_json::from_str::<RemoteChange>(body).map(|c| vec![c])
            }
            .map_err(|err| SyncError::Protocol(format!("bad change payload: {err}")))?;
            Ok(ChannelMessage::Changes(changes))
        }
        "e" => {
            let (header, payload) = body
                .split_once('\n')
                .ok_or_else(|| SyncError::Protocol("entity without a payload".to_string()))?;
            let (id, version) = header
                .rsplit_once('.')
                .ok_or_else(|| SyncError::Protocol(format!("bad entity header {header:?}")))?;
            let version = version
                .parse()
                .map_err(|_| SyncError::Protocol(format!("bad entity version {version:?}")))?;
            let data = if payload == "?" {
                None
            } else {
                Some(serde_json::from_str(payload).map_err(|err| {
                    SyncError::Protocol(format!("bad entity payload: {err}"))
                })?)
            };
            Ok(ChannelMessage::Entity {
                id: id.to_string(),
                version,
                data,
            })
        }
        "cv" => {
            if body == "?" {
                Ok(ChannelMessage::UnknownChangeVersion)
            } else {
                Err(SyncError::Protocol(format!(
                    "unexpected change-version reply {body:?}"
                )))
            }
        }
        "log" => {
            let level = body
                .trim()
                .parse()
                .map_err(|_| SyncError::Protocol(format!("bad log level {body:?}")))?;
            Ok(ChannelMessage::LogLevel(level))
        }
        other => Err(SyncError::Protocol(format!("unknown command {other:?}"))),
    }
}

pub fn init_message(config: &ClientConfig, bucket: &str) -> String {
    let payload = serde_json::json!({
        "clientid": config.client_id,
        "api": API_VERSION,
        "app_id": config.app_id,
        "token": config.access_token,
        "name": bucket,
        "library": LIBRARY,
        "version": LIBRARY_VERSION,
    });
    format!("init:{payload}")
}

pub fn index_request(mark: Option<&str>, limit: usize) -> String {
    format!("i:1::{}::{}", mark.unwrap_or(""), limit)
}

pub fn entity_request(id: &str, version: u64) -> String {
    format!("e:{id}.{version}")
}

pub fn change_version_request(cv: &str) -> String {
    format!("cv:{cv}")
}

pub fn change_message(change: &LocalChangeWire<'_>) -> Result<String, SyncError> {
    let payload = serde_json::to_string(change)
        .map_err(|err| SyncError::Protocol(format!("unencodable change: {err}")))?;
    Ok(format!("c:{payload}"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn frame_grammar() {
        assert_eq!(Frame::parse("h:42").unwrap(), Frame::Heartbeat(42));
        assert_eq!(
            Frame::parse("3:auth:user@example.com").unwrap(),
            Frame::Channel {
                index: 3,
                message: "auth:user@example.com".to_string()
            }
        );
        assert!(Frame::parse("nonsense").is_err());
        assert_eq!(Frame::channel(0, "i:1::::100"), "0:i:1::::100");
    }

    #[test]
    fn index_request_shape() {
        assert_eq!(index_request(None, 100), "i:1::::100");
        assert_eq!(index_request(Some("m3"), 50), "i:1::m3::50");
    }

    #[test]
    fn parses_auth_results() {
        assert_eq!(
            parse_channel_message("auth:user@example.com").unwrap(),
            ChannelMessage::Auth(AuthResult::User("user@example.com".to_string()))
        );
        assert_eq!(
            parse_channel_message("auth:expired").unwrap(),
            ChannelMessage::Auth(AuthResult::Expired)
        );
        assert_eq!(
            parse_channel_message("auth:{\"msg\":\"token invalid\",\"code\":401}").unwrap(),
            ChannelMessage::Auth(AuthResult::Expired)
        );
    }

    #[test]
    fn parses_single_and_batched_changes() {
        let single = r#"c:{"id":"note-1","o":"M","ev":3,"sv":2,"ccid":"abc","v":{}}"#;
        let ChannelMessage::Changes(changes) = parse_channel_message(single).unwrap() else {
            panic!("expected changes");
        };
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].id, "note-1");
        assert_eq!(changes[0].ev, 3);

        let batched = r#"c:[{"id":"a","o":"-","ev":4},{"id":"b","o":"M","ev":1,"v":{}}]"#;
        let ChannelMessage::Changes(changes) = parse_channel_message(batched).unwrap() else {
            panic!("expected changes");
        };
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].o, ChangeOp::Remove);
    }

    #[test]
    fn parses_entities() {
        let message = "e:note-1.4\n{\"title\":\"hi\"}";
        let ChannelMessage::Entity { id, version, data } =
            parse_channel_message(message).unwrap()
        else {
            panic!("expected entity");
        };
        assert_eq!(id, "note-1");
        assert_eq!(version, 4);
        assert_eq!(serde_json::to_value(data.unwrap()).unwrap(), json!({"title": "hi"}));

        let ChannelMessage::Entity { data, .. } =
            parse_channel_message("e:note-1.9\n?").unwrap()
        else {
            panic!("expected entity");
        };
        assert!(data.is_none());
    }
}
