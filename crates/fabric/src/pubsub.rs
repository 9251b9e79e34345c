// SPDX-License-Identifier: Apache-2.0

//! The pubsub bridge: fan-out to all subscribers of a topic.
//!
//! Publishers connect to `addr_in` and stream `{topic, payload}` envelopes.
//! Subscribers connect to `addr_out`, send one handshake frame naming their
//! topics, and receive every matching envelope published after the bridge
//! acknowledges the handshake. There is no replay.
//!
//! A slow subscriber does not stall the topic: its per-connection buffer
//! overflows and the overflowing frames are counted and dropped.

use crate::error::Error;
use crate::frame::{read_frame, write_frame};
use crate::BridgeTasks;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Per-subscriber buffer between the publish path and the subscriber socket.
const SUBSCRIBER_BUFFER: usize = 1024;

/// The handshake a subscriber sends on connect.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SubscribeHandshake {
    /// Topics to receive.
    pub topics: Vec<String>,
}

/// The acknowledgement the bridge returns once the subscription is live.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SubscribeAck {
    /// Always `true`.
    pub ack: bool,
}

#[derive(Deserialize)]
struct TopicOnly {
    topic: String,
}

struct SubEntry {
    topics: HashSet<String>,
    tx: tokio::sync::mpsc::Sender<Arc<Vec<u8>>>,
}

type SubTable = Arc<Mutex<Vec<SubEntry>>>;

/// A started pubsub bridge.
#[derive(Debug)]
pub struct PubSubBridge {
    name: String,
    addr_in: String,
    addr_out: String,
    drops: Arc<AtomicU64>,
    tasks: BridgeTasks,
}

impl PubSubBridge {
    /// Binds both endpoints and starts the accept loops.
    pub async fn start(name: &str) -> Result<Self, Error> {
        let in_listener = bind_any().await?;
        let out_listener = bind_any().await?;
        let host = crate::external_ip();
        let addr_in = format!("{host}:{}", local_port(&in_listener)?);
        let addr_out = format!("{host}:{}", local_port(&out_listener)?);

        let shutdown = CancellationToken::new();
        let subs: SubTable = Arc::new(Mutex::new(Vec::new()));
        let drops = Arc::new(AtomicU64::new(0));
        let mut tasks = BridgeTasks::new(shutdown.clone());

        tasks.tasks.push(tokio::spawn(accept_publishers(
            in_listener,
            subs.clone(),
            drops.clone(),
            shutdown.clone(),
        )));
        tasks.tasks.push(tokio::spawn(accept_subscribers(
            out_listener,
            subs,
            shutdown,
        )));

        tracing::debug!(bridge = name, %addr_in, %addr_out, "pubsub bridge up");
        Ok(Self {
            name: name.to_owned(),
            addr_in,
            addr_out,
            drops,
            tasks,
        })
    }

    /// The bridge name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address publishers connect to.
    #[must_use]
    pub fn addr_in(&self) -> &str {
        &self.addr_in
    }

    /// Address subscribers connect to.
    #[must_use]
    pub fn addr_out(&self) -> &str {
        &self.addr_out
    }

    /// Frames dropped on overflowing subscriber buffers.
    #[must_use]
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Liveness probe: `None` while alive.
    #[must_use]
    pub fn poll(&self) -> Option<String> {
        self.tasks.poll()
    }

    /// Stops accepting and forwarding.
    pub fn stop(&self) {
        self.tasks.stop();
    }

    /// Waits for the accept loops to finish.
    pub async fn join(&mut self) {
        self.tasks.join().await;
    }
}

async fn bind_any() -> Result<TcpListener, Error> {
    TcpListener::bind(("0.0.0.0", 0))
        .await
        .map_err(|e| Error::Bind {
            addr: "0.0.0.0:0".to_owned(),
            details: e.to_string(),
        })
}

fn local_port(listener: &TcpListener) -> Result<u16, Error> {
    Ok(listener.local_addr().map_err(Error::from)?.port())
}

async fn accept_publishers(
    listener: TcpListener,
    subs: SubTable,
    drops: Arc<AtomicU64>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let _ = tokio::spawn(publisher_conn(
                        stream,
                        subs.clone(),
                        drops.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "pubsub publisher accept failed");
                }
            }
        }
    }
}

async fn publisher_conn(
    mut stream: TcpStream,
    subs: SubTable,
    drops: Arc<AtomicU64>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = read_frame(&mut stream) => match frame {
                Ok(Some(payload)) => {
                    let topic = match serde_json::from_slice::<TopicOnly>(&payload) {
                        Ok(envelope) => envelope.topic,
                        Err(e) => {
                            tracing::warn!(error = %e, "dropping unparsable envelope");
                            continue;
                        }
                    };
                    fan_out(&subs, &drops, &topic, Arc::new(payload));
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "pubsub publisher connection dropped");
                    break;
                }
            }
        }
    }
}

fn fan_out(subs: &SubTable, drops: &AtomicU64, topic: &str, frame: Arc<Vec<u8>>) {
    let mut table = subs.lock();
    table.retain(|entry| {
        if entry.tx.is_closed() {
            return false;
        }
        if !entry.topics.contains(topic) {
            return true;
        }
        match entry.tx.try_send(frame.clone()) {
            Ok(()) => true,
            Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => {
                let _ = drops.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => false,
        }
    });
}

async fn accept_subscribers(listener: TcpListener, subs: SubTable, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let _ = tokio::spawn(subscriber_conn(stream, subs.clone(), shutdown.clone()));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "pubsub subscriber accept failed");
                }
            }
        }
    }
}

async fn subscriber_conn(mut stream: TcpStream, subs: SubTable, shutdown: CancellationToken) {
    let handshake = match read_frame(&mut stream).await {
        Ok(Some(payload)) => match serde_json::from_slice::<SubscribeHandshake>(&payload) {
            Ok(handshake) => handshake,
            Err(e) => {
                tracing::warn!(error = %e, "invalid subscription handshake");
                return;
            }
        },
        _ => return,
    };

    let (tx, mut rx) = tokio::sync::mpsc::channel(SUBSCRIBER_BUFFER);
    subs.lock().push(SubEntry {
        topics: handshake.topics.into_iter().collect(),
        tx,
    });

    // only acknowledge once the table holds the entry, so nothing published
    // after the ack can be missed
    let ack = match serde_json::to_vec(&SubscribeAck { ack: true }) {
        Ok(ack) => ack,
        Err(_) => return,
    };
    if write_frame(&mut stream, &ack).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = write_frame(&mut stream, &frame).await {
                    tracing::debug!(error = %e, "pubsub subscriber connection dropped");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Publisher, Subscriber};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[tokio::test]
    async fn fan_out_respects_topics() {
        let mut bridge = PubSubBridge::start("ps").await.unwrap();
        let mut control_a = Subscriber::connect(bridge.addr_out(), &["control"])
            .await
            .unwrap();
        let mut control_b = Subscriber::connect(bridge.addr_out(), &["control"])
            .await
            .unwrap();
        let mut state_only = Subscriber::connect(bridge.addr_out(), &["state"])
            .await
            .unwrap();

        let mut publisher = Publisher::connect(bridge.addr_in()).await.unwrap();
        publisher.put("control", &42u32).await.unwrap();

        for sub in [&mut control_a, &mut control_b] {
            let envelope = sub
                .recv_timeout(Duration::from_secs(2))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(envelope.topic, "control");
            assert_eq!(envelope.payload, serde_json::json!(42));
        }
        assert!(state_only
            .recv_timeout(Duration::from_millis(200))
            .await
            .unwrap()
            .is_none());

        bridge.stop();
        bridge.join().await;
    }

    #[tokio::test]
    async fn late_subscribers_miss_earlier_messages() {
        let mut bridge = PubSubBridge::start("ps").await.unwrap();
        let mut publisher = Publisher::connect(bridge.addr_in()).await.unwrap();
        publisher.put("control", &"early").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut sub = Subscriber::connect(bridge.addr_out(), &["control"])
            .await
            .unwrap();
        publisher.put("control", &"late").await.unwrap();

        let envelope = sub
            .recv_timeout(Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.payload, serde_json::json!("late"));
        assert!(sub
            .recv_timeout(Duration::from_millis(200))
            .await
            .unwrap()
            .is_none());

        bridge.stop();
        bridge.join().await;
    }
}
