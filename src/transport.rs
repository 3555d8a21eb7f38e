// Copyright 2026 Developers of the converge project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The transport seam: how frames reach the wire.
//!
//! The engine only needs a way to obtain, per connection attempt, a pair of
//! frame halves. The bundled [`TcpConnector`] speaks newline-delimited UTF-8
//! over a plain `TcpStream`; TLS or websocket transports implement the same
//! traits outside this crate.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Write half of one connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: &str) -> std::io::Result<()>;
}

/// Read half of one connection. `Ok(None)` means the peer closed.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> std::io::Result<Option<String>>;
}

/// Dials the server; called once per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> std::io::Result<(Box<dyn FrameSink>, Box<dyn FrameSource>)>;
}

/// Plain TCP line transport.
#[derive(Clone, Debug)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        TcpConnector { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> std::io::Result<(Box<dyn FrameSink>, Box<dyn FrameSource>)> {
        let stream = TcpStream::connect(&self.addr).await?;
        let (read, write) = stream.into_split();
        Ok((
            Box::new(TcpFrameSink { write }),
            Box::new(TcpFrameSource {
                lines: BufReader::new(read).lines(),
            }),
        ))
    }
}

struct TcpFrameSink {
    write: OwnedWriteHalf,
}

#[async_trait]
impl FrameSink for TcpFrameSink {
    async fn send(&mut self, frame: &str) -> std::io::Result<()> {
        self.write.write_all(frame.as_bytes()).await?;
        self.write.write_all(b"\n").await?;
        self.write.flush().await
    }
}

struct TcpFrameSource {
    lines: Lines<BufReader<OwnedReadHalf>>,
}

#[async_trait]
impl FrameSource for TcpFrameSource {
    async fn next_frame(&mut self) -> std::io::Result<Option<String>> {
        self.lines.next_line().await
    }
}
