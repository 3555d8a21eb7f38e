// Copyright 2026 Developers of the converge project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The client multiplexer: one socket, many channels.
//!
//! The client owns the connection lifecycle. It dials through a
//! [`Connector`], fans inbound frames out to the registered channels, writes
//! heartbeats, and reconnects with jittered exponential backoff when the
//! socket dies. Exactly one task writes to the socket; channels enqueue their
//! frames through a per-connection [`Outbox`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::bucket::Bucket;
use crate::channel::Channel;
use crate::ghost::{GhostStore, Ghosts, MemoryGhostStore};
use crate::protocol::{Frame, LIBRARY};
use crate::store::BucketStore;
use crate::transport::{Connector, FrameSink, FrameSource};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Missing this many heartbeat intervals in a row forces a reconnect.
const HEARTBEAT_GRACE: u32 = 3;

/// Configuration of one client connection.
///
/// The client id tags every outbound change so the server can echo
/// acknowledgments back to their origin; it is explicit configuration here,
/// never process-global state.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub app_id: String,
    pub access_token: String,
    pub client_id: String,
    pub heartbeat_interval: Duration,
    pub index_page_limit: usize,
}

impl ClientConfig {
    pub fn new(app_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        ClientConfig {
            app_id: app_id.into(),
            access_token: access_token.into(),
            client_id: format!("{LIBRARY}-{}", uuid::Uuid::new_v4().simple()),
            heartbeat_interval: Duration::from_secs(20),
            index_page_limit: 100,
        }
    }
}

/// Connection lifecycle events.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    Connect,
    Disconnect,
    Reconnect { attempt: u32 },
}

type SharedSink = Arc<RwLock<Option<mpsc::UnboundedSender<String>>>>;

/// A channel's stamp on the shared outbound queue. Sending while disconnected
/// drops the frame; the owning channel re-derives its traffic on reconnect.
#[derive(Clone)]
pub(crate) struct Outbox {
    index: usize,
    sink: SharedSink,
}

impl Outbox {
    pub fn send(&self, message: String) {
        let guard = self.sink.read();
        match guard.as_ref() {
            Some(tx) => {
                if tx.send(Frame::channel(self.index, &message)).is_err() {
                    trace!("outbound frame dropped: writer gone");
                }
            }
            None => trace!("outbound frame dropped: disconnected"),
        }
    }
}

/// A reconnecting multiplexer over one duplex socket.
#[derive(Clone)]
pub struct Client {
    config: Arc<ClientConfig>,
    channels: Arc<RwLock<Vec<Channel>>>,
    sink: SharedSink,
    events: broadcast::Sender<ClientEvent>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let (events, _) = broadcast::channel(16);
        Client {
            config: Arc::new(config),
            channels: Arc::new(RwLock::new(Vec::new())),
            sink: Arc::new(RwLock::new(None)),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Register a bucket backed by the given local store and an in-memory
    /// ghost store.
    pub fn bucket(&self, name: &str, store: Arc<dyn BucketStore>) -> Bucket {
        self.bucket_with_ghosts(name, store, Arc::new(MemoryGhostStore::new()))
    }

    /// Register a bucket with explicit object and ghost stores.
    pub fn bucket_with_ghosts(
        &self,
        name: &str,
        store: Arc<dyn BucketStore>,
        ghosts: Arc<dyn GhostStore>,
    ) -> Bucket {
        let mut channels = self.channels.write();
        let outbox = Outbox {
            index: channels.len(),
            sink: self.sink.clone(),
        };
        let (events, _) = broadcast::channel(256);
        let channel = Channel::new(
            name,
            self.config.clone(),
            outbox,
            store.clone(),
            Ghosts::new(ghosts),
            events.clone(),
        );
        channels.push(channel.clone());
        Bucket::new(name, store, channel, events)
    }

    /// Drive the connection until the task is dropped: dial, pump frames,
    /// and reconnect with backoff on every failure.
    pub async fn run<C: Connector>(&self, connector: C) {
        let mut attempt: u32 = 0;
        loop {
            let (sink, source) = match connector.connect().await {
                Ok(halves) => halves,
                Err(err) => {
                    attempt += 1;
                    let delay = backoff_delay(attempt, &mut rand::thread_rng());
                    warn!("connect failed (attempt {attempt}): {err}; retrying in {delay:?}");
                    let _ = self.events.send(ClientEvent::Reconnect { attempt });
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };
            attempt = 0;
            debug!("connected");
            let _ = self.events.send(ClientEvent::Connect);

            let (tx, rx) = mpsc::unbounded_channel();
            *self.sink.write() = Some(tx);
            let writer = tokio::spawn(write_loop(sink, rx));

            let channels: Vec<Channel> = self.channels.read().clone();
            for channel in &channels {
                channel.connected().await;
            }

            self.read_loop(source, &channels).await;

            *self.sink.write() = None;
            writer.abort();
            let _ = self.events.send(ClientEvent::Disconnect);
            for channel in &channels {
                channel.disconnected().await;
            }
        }
    }

    async fn read_loop(&self, mut source: Box<dyn FrameSource>, channels: &[Channel]) {
        let heartbeat = self.config.heartbeat_interval;
        let mut beat_ticker = tokio::time::interval(heartbeat);
        beat_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut resend_ticker = tokio::time::interval(Duration::from_secs(1));
        resend_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_beat: u64 = 0;
        let mut last_seen = Instant::now();
        // An entity header whose JSON payload arrives on the following line.
        let mut pending_entity: Option<(usize, String)> = None;

        loop {
            tokio::select! {
                frame = source.next_frame() => {
                    match frame {
                        Ok(Some(line)) => {
                            self.dispatch(
                                line,
                                channels,
                                &mut pending_entity,
                                &mut last_beat,
                                &mut last_seen,
                            )
                            .await;
                        }
                        Ok(None) => {
                            debug!("connection closed by server");
                            return;
                        }
                        Err(err) => {
                            warn!("read failed: {err}");
                            return;
                        }
                    }
                }
                _ = beat_ticker.tick() => {
                    if last_seen.elapsed() > heartbeat * HEARTBEAT_GRACE {
                        warn!("missed server heartbeats; reconnecting");
                        return;
                    }
                    self.send_raw(Frame::heartbeat(last_beat + 1));
                }
                _ = resend_ticker.tick() => {
                    for channel in channels {
                        channel.check_timeouts().await;
                    }
                }
            }
        }
    }

    async fn dispatch(
        &self,
        line: String,
        channels: &[Channel],
        pending_entity: &mut Option<(usize, String)>,
        last_beat: &mut u64,
        last_seen: &mut Instant,
    ) {
        if let Some((index, header)) = pending_entity.take() {
            let message = format!("{header}\n{line}");
            match channels.get(index) {
                Some(channel) => channel.handle_message(&message).await,
                None => warn!("entity payload for unknown channel {index}"),
            }
            return;
        }
        match Frame::parse(&line) {
            Ok(Frame::Heartbeat(beat)) => {
                trace!("server heartbeat {beat}");
                *last_beat = beat;
                *last_seen = Instant::now();
            }
            Ok(Frame::Channel { index, message }) => {
                // On line transports an entity download spans two lines:
                // the `e:<id>.<version>` header, then the JSON payload.
                if message.starts_with("e:") && !message.contains('\n') {
                    *pending_entity = Some((index, message));
                    return;
                }
                match channels.get(index) {
                    Some(channel) => channel.handle_message(&message).await,
                    None => warn!("frame for unknown channel {index}"),
                }
            }
            Err(err) => warn!("ignoring malformed frame: {err}"),
        }
    }

    fn send_raw(&self, frame: String) {
        if let Some(tx) = self.sink.read().as_ref() {
            let _ = tx.send(frame);
        }
    }
}

async fn write_loop(mut sink: Box<dyn FrameSink>, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(frame) = rx.recv().await {
        trace!("=> {frame}");
        if let Err(err) = sink.send(&frame).await {
            warn!("write failed: {err}");
            return;
        }
    }
}

/// Exponential backoff from 1 s doubling to a 30 s cap, with ±20% jitter.
fn backoff_delay<R: Rng>(attempt: u32, rng: &mut R) -> Duration {
    let exponent = attempt.saturating_sub(1).min(5);
    let base = BACKOFF_BASE
        .saturating_mul(1u32 << exponent)
        .min(BACKOFF_CAP);
    base.mul_f64(rng.gen_range(0.8..=1.2))
}
