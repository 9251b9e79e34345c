// SPDX-License-Identifier: Apache-2.0

//! The queue bridge: many producers, one consumer per message.
//!
//! Producers connect to `addr_in` and stream frames; consumers connect to
//! `addr_out` and receive frames as they become available. Each buffered
//! frame is handed to exactly one consumer. Ordering is FIFO per producer,
//! not globally.
//!
//! The internal buffer is bounded. With `lossy = false` a full buffer stops
//! the bridge from reading producer sockets, which surfaces to producers as
//! TCP backpressure. With `lossy = true` the oldest frame is dropped and a
//! drop counter incremented.

use crate::error::Error;
use crate::frame::{read_frame, write_frame};
use crate::BridgeTasks;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// The bounded frame buffer between producer and consumer connections.
#[derive(Debug)]
pub(crate) struct QueueBuffer {
    deque: Mutex<VecDeque<Vec<u8>>>,
    capacity: usize,
    lossy: bool,
    drops: AtomicU64,
    readable: tokio::sync::Notify,
    writable: tokio::sync::Notify,
}

impl QueueBuffer {
    pub(crate) fn new(capacity: usize, lossy: bool) -> Self {
        Self {
            deque: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            lossy,
            drops: AtomicU64::new(0),
            readable: tokio::sync::Notify::new(),
            writable: tokio::sync::Notify::new(),
        }
    }

    pub(crate) fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Enqueues one frame, waiting for space unless the buffer is lossy.
    pub(crate) async fn push(
        &self,
        frame: Vec<u8>,
        shutdown: &CancellationToken,
    ) -> Result<(), Error> {
        let mut frame = Some(frame);
        loop {
            let notified = self.writable.notified();
            {
                let mut deque = self.deque.lock();
                if deque.len() < self.capacity {
                    deque.push_back(frame.take().unwrap_or_default());
                    self.readable.notify_one();
                    return Ok(());
                }
                if self.lossy {
                    let _ = deque.pop_front();
                    let _ = self.drops.fetch_add(1, Ordering::Relaxed);
                    deque.push_back(frame.take().unwrap_or_default());
                    self.readable.notify_one();
                    return Ok(());
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = shutdown.cancelled() => return Err(Error::Closed),
            }
        }
    }

    fn try_pop(&self) -> Option<Vec<u8>> {
        let mut deque = self.deque.lock();
        let frame = deque.pop_front();
        if frame.is_some() {
            self.writable.notify_one();
            // wake further consumers while frames remain
            if !deque.is_empty() {
                self.readable.notify_one();
            }
        }
        frame
    }

    /// Dequeues one frame, or `None` once the bridge shuts down.
    pub(crate) async fn pop(&self, shutdown: &CancellationToken) -> Option<Vec<u8>> {
        loop {
            let notified = self.readable.notified();
            if let Some(frame) = self.try_pop() {
                return Some(frame);
            }
            tokio::select! {
                _ = notified => {}
                _ = shutdown.cancelled() => return None,
            }
        }
    }
}

/// A started queue bridge.
#[derive(Debug)]
pub struct QueueBridge {
    name: String,
    addr_in: String,
    addr_out: String,
    buffer: Arc<QueueBuffer>,
    tasks: BridgeTasks,
}

impl QueueBridge {
    /// Binds both endpoints and starts the accept loops. Returns only once
    /// both addresses are known; the advertised host is the externally
    /// reachable IP.
    pub async fn start(name: &str, capacity: usize, lossy: bool) -> Result<Self, Error> {
        let in_listener = bind_any().await?;
        let out_listener = bind_any().await?;
        let host = crate::external_ip();
        let addr_in = format!("{host}:{}", local_port(&in_listener)?);
        let addr_out = format!("{host}:{}", local_port(&out_listener)?);

        let shutdown = CancellationToken::new();
        let buffer = Arc::new(QueueBuffer::new(capacity, lossy));
        let mut tasks = BridgeTasks::new(shutdown.clone());

        tasks.tasks.push(tokio::spawn(accept_producers(
            in_listener,
            buffer.clone(),
            shutdown.clone(),
        )));
        tasks.tasks.push(tokio::spawn(accept_consumers(
            out_listener,
            buffer.clone(),
            shutdown,
        )));

        tracing::debug!(bridge = name, %addr_in, %addr_out, "queue bridge up");
        Ok(Self {
            name: name.to_owned(),
            addr_in,
            addr_out,
            buffer,
            tasks,
        })
    }

    /// The bridge name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address producers connect to.
    #[must_use]
    pub fn addr_in(&self) -> &str {
        &self.addr_in
    }

    /// Address consumers connect to.
    #[must_use]
    pub fn addr_out(&self) -> &str {
        &self.addr_out
    }

    /// Frames dropped so far (lossy bridges only).
    #[must_use]
    pub fn drops(&self) -> u64 {
        self.buffer.drops()
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

async fn accept_producers(
    listener: TcpListener,
    buffer: Arc<QueueBuffer>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let _ = tokio::spawn(producer_conn(stream, buffer.clone(), shutdown.clone()));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "queue producer accept failed");
                }
            }
        }
    }
}

async fn producer_conn(mut stream: TcpStream, buffer: Arc<QueueBuffer>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = read_frame(&mut stream) => match frame {
                Ok(Some(payload)) => {
                    if buffer.push(payload, &shutdown).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "queue producer connection dropped");
                    break;
                }
            }
        }
    }
}

async fn accept_consumers(
    listener: TcpListener,
    buffer: Arc<QueueBuffer>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let _ = tokio::spawn(consumer_conn(stream, buffer.clone(), shutdown.clone()));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "queue consumer accept failed");
                }
            }
        }
    }
}

async fn consumer_conn(stream: TcpStream, buffer: Arc<QueueBuffer>, shutdown: CancellationToken) {
    let (mut rd, mut wr) = stream.into_split();
    let mut probe = [0u8; 1];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            // consumers never send; any read completion means the peer is gone
            _ = rd.read(&mut probe) => break,
            frame = buffer.pop(&shutdown) => {
                let Some(frame) = frame else { break };
                if let Err(e) = write_frame(&mut wr, &frame).await {
                    // at-most-once: the frame is lost with the consumer
                    tracing::debug!(error = %e, "queue consumer connection dropped");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{QueueGetter, QueuePutter};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[tokio::test]
    async fn fifo_per_producer() {
        let mut bridge = QueueBridge::start("q", 16, false).await.unwrap();
        let mut putter = QueuePutter::connect(bridge.addr_in()).await.unwrap();
        let mut getter = QueueGetter::connect(bridge.addr_out()).await.unwrap();

        for i in 0..5u32 {
            putter.put(&i).await.unwrap();
        }
        for i in 0..5u32 {
            let raw = getter
                .get_timeout(Duration::from_secs(2))
                .await
                .unwrap()
                .unwrap();
            let got: u32 = serde_json::from_slice(&raw).unwrap();
            assert_eq!(got, i);
        }

        bridge.stop();
        bridge.join().await;
    }

    #[tokio::test]
    async fn each_message_reaches_exactly_one_consumer() {
        let mut bridge = QueueBridge::start("q", 64, false).await.unwrap();
        let mut putter = QueuePutter::connect(bridge.addr_in()).await.unwrap();
        let mut g1 = QueueGetter::connect(bridge.addr_out()).await.unwrap();
        let mut g2 = QueueGetter::connect(bridge.addr_out()).await.unwrap();

        for i in 0..10u32 {
            putter.put(&i).await.unwrap();
        }

        let mut seen = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while seen.len() < 10 && tokio::time::Instant::now() < deadline {
            if let Ok(Some(raw)) = g1.get_timeout(Duration::from_millis(100)).await {
                seen.push(serde_json::from_slice::<u32>(&raw).unwrap());
            }
            if let Ok(Some(raw)) = g2.get_timeout(Duration::from_millis(100)).await {
                seen.push(serde_json::from_slice::<u32>(&raw).unwrap());
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());

        bridge.stop();
        bridge.join().await;
    }

    #[tokio::test]
    async fn lossy_buffer_drops_oldest() {
        let shutdown = CancellationToken::new();
        let buffer = QueueBuffer::new(2, true);
        buffer.push(vec![1], &shutdown).await.unwrap();
        buffer.push(vec![2], &shutdown).await.unwrap();
        buffer.push(vec![3], &shutdown).await.unwrap();

        assert_eq!(buffer.drops(), 1);
        assert_eq!(buffer.pop(&shutdown).await.unwrap(), vec![2]);
        assert_eq!(buffer.pop(&shutdown).await.unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn full_buffer_blocks_producers() {
        let shutdown = CancellationToken::new();
        let buffer = Arc::new(QueueBuffer::new(1, false));
        buffer.push(vec![1], &shutdown).await.unwrap();

        let blocked = {
            let buffer = buffer.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { buffer.push(vec![2], &shutdown).await })
        };
        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());
        assert_eq!(buffer.drops(), 0);

        assert_eq!(buffer.pop(&shutdown).await.unwrap(), vec![1]);
        blocked.await.unwrap().unwrap();
        assert_eq!(buffer.pop(&shutdown).await.unwrap(), vec![2]);
    }
}
