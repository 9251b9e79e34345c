// SPDX-License-Identifier: Apache-2.0

//! Client endpoints: how components attach to bridges.
//!
//! All receiving endpoints expose bounded-timeout variants so that
//! component loops can observe termination latches between pulls.

use crate::error::Error;
use crate::frame::{read_frame, write_frame};
use crate::pubsub::{SubscribeAck, SubscribeHandshake};
use pilotflow_state::Envelope;
use serde::Serialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

/// How long a client endpoint waits for a bridge to accept.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

async fn connect(addr: &str) -> Result<TcpStream, Error> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::Connect {
            addr: addr.to_owned(),
            details: "connect timed out".to_owned(),
        })?
        .map_err(|e| Error::Connect {
            addr: addr.to_owned(),
            details: e.to_string(),
        })?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Spawns a task that pumps frames from `stream` into a bounded channel.
fn spawn_reader(stream: TcpStream) -> (tokio::sync::mpsc::Receiver<Vec<u8>>, JoinHandle<()>) {
    let (tx, rx) = tokio::sync::mpsc::channel(64);
    let task = tokio::spawn(async move {
        let mut stream = stream;
        loop {
            match read_frame(&mut stream).await {
                Ok(Some(frame)) => {
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
                _ => break,
            }
        }
    });
    (rx, task)
}

/// Producer end of a queue bridge.
#[derive(Debug)]
pub struct QueuePutter {
    stream: TcpStream,
}

impl QueuePutter {
    /// Connects to a queue bridge's ingress address.
    pub async fn connect(addr: &str) -> Result<Self, Error> {
        Ok(Self {
            stream: connect(addr).await?,
        })
    }

    /// Enqueues one JSON-serialized message.
    pub async fn put<T: Serialize>(&mut self, msg: &T) -> Result<(), Error> {
        let payload = serde_json::to_vec(msg)?;
        write_frame(&mut self.stream, &payload).await
    }

    /// Enqueues one pre-serialized message.
    pub async fn put_raw(&mut self, payload: &[u8]) -> Result<(), Error> {
        write_frame(&mut self.stream, payload).await
    }
}

/// Consumer end of a queue bridge.
#[derive(Debug)]
pub struct QueueGetter {
    rx: tokio::sync::mpsc::Receiver<Vec<u8>>,
    reader: JoinHandle<()>,
}

impl QueueGetter {
    /// Connects to a queue bridge's egress address.
    pub async fn connect(addr: &str) -> Result<Self, Error> {
        let stream = connect(addr).await?;
        let (rx, reader) = spawn_reader(stream);
        Ok(Self { rx, reader })
    }

    /// Pulls the next message, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` when the timeout lapses and `Err(Closed)` once
    /// the bridge is gone.
    pub async fn get_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, Error> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => Err(Error::Closed),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for QueueGetter {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Publisher end of a pubsub bridge.
#[derive(Debug)]
pub struct Publisher {
    stream: TcpStream,
}

impl Publisher {
    /// Connects to a pubsub bridge's ingress address.
    pub async fn connect(addr: &str) -> Result<Self, Error> {
        Ok(Self {
            stream: connect(addr).await?,
        })
    }

    /// Publishes one message on the given topic.
    pub async fn put<T: Serialize>(&mut self, topic: &str, msg: &T) -> Result<(), Error> {
        let envelope = Envelope {
            topic: topic.to_owned(),
            payload: serde_json::to_value(msg)?,
        };
        let payload = serde_json::to_vec(&envelope)?;
        write_frame(&mut self.stream, &payload).await
    }
}

/// Subscriber end of a pubsub bridge.
#[derive(Debug)]
pub struct Subscriber {
    rx: tokio::sync::mpsc::Receiver<Vec<u8>>,
    reader: JoinHandle<()>,
}

impl Subscriber {
    /// Connects, subscribes to `topics`, and waits for the bridge to
    /// acknowledge. Messages published after this returns are received.
    pub async fn connect(addr: &str, topics: &[&str]) -> Result<Self, Error> {
        let mut stream = connect(addr).await?;
        let handshake = SubscribeHandshake {
            topics: topics.iter().map(|t| (*t).to_owned()).collect(),
        };
        let payload = serde_json::to_vec(&handshake)?;
        write_frame(&mut stream, &payload).await?;

        let ack = tokio::time::timeout(CONNECT_TIMEOUT, read_frame(&mut stream))
            .await
            .map_err(|_| Error::Handshake {
                details: "subscription ack timed out".to_owned(),
            })??
            .ok_or(Error::Closed)?;
        let _: SubscribeAck = serde_json::from_slice(&ack).map_err(|e| Error::Handshake {
            details: e.to_string(),
        })?;

        let (rx, reader) = spawn_reader(stream);
        Ok(Self { rx, reader })
    }

    /// Receives the next envelope, waiting at most `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Envelope>, Error> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(frame)) => Ok(Some(serde_json::from_slice(&frame)?)),
            Ok(None) => Err(Error::Closed),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
