// Copyright The PilotFlow Authors
// SPDX-License-Identifier: Apache-2.0

//! Message fabric: the bridges wiring components together.
//!
//! Two bridge kinds exist. A [`queue::QueueBridge`] is a point-to-fan-in
//! channel: many producers enqueue, and each buffered message is handed to
//! exactly one consumer. A [`pubsub::PubSubBridge`] is a fan-out topic:
//! every subscriber receives every message published after its subscription
//! handshake.
//!
//! Bridges are standalone TCP listeners with two endpoints. Startup blocks
//! until both endpoints are bound, and the advertised addresses carry the
//! externally reachable host, not a loopback. Components connect through
//! the client endpoints in [`client`].
//!
//! Delivery is at-most-once; messages are length-prefixed JSON frames.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod client;
pub mod error;
pub mod frame;
pub mod pubsub;
pub mod queue;

pub use client::{Publisher, QueueGetter, QueuePutter, Subscriber};
pub use pubsub::PubSubBridge;
pub use queue::QueueBridge;

/// The externally reachable address of this host.
///
/// Determined with the UDP connect trick (no packets are sent); falls back
/// to the loopback address when the host has no route at all.
#[must_use]
pub fn external_ip() -> std::net::IpAddr {
    std::net::UdpSocket::bind(("0.0.0.0", 0))
        .and_then(|socket| {
            socket.connect(("10.255.255.255", 1))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST))
}

/// A started bridge of either kind, as owned by a controller.
#[derive(Debug)]
pub enum Bridge {
    /// A queue bridge.
    Queue(QueueBridge),
    /// A pubsub bridge.
    Pubsub(PubSubBridge),
}

impl Bridge {
    /// The bridge name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Bridge::Queue(b) => b.name(),
            Bridge::Pubsub(b) => b.name(),
        }
    }

    /// Ingress address producers/publishers connect to.
    #[must_use]
    pub fn addr_in(&self) -> &str {
        match self {
            Bridge::Queue(b) => b.addr_in(),
            Bridge::Pubsub(b) => b.addr_in(),
        }
    }

    /// Egress address consumers/subscribers connect to.
    #[must_use]
    pub fn addr_out(&self) -> &str {
        match self {
            Bridge::Queue(b) => b.addr_out(),
            Bridge::Pubsub(b) => b.addr_out(),
        }
    }

    /// Liveness probe: `None` while alive, a reason once dead.
    #[must_use]
    pub fn poll(&self) -> Option<String> {
        match self {
            Bridge::Queue(b) => b.poll(),
            Bridge::Pubsub(b) => b.poll(),
        }
    }

    /// Asks the bridge to stop accepting and forwarding.
    pub fn stop(&self) {
        match self {
            Bridge::Queue(b) => b.stop(),
            Bridge::Pubsub(b) => b.stop(),
        }
    }

    /// Waits for the bridge tasks to finish.
    pub async fn join(&mut self) {
        match self {
            Bridge::Queue(b) => b.join().await,
            Bridge::Pubsub(b) => b.join().await,
        }
    }
}

/// Listener-side task bookkeeping shared by both bridge kinds.
#[derive(Debug)]
pub(crate) struct BridgeTasks {
    pub(crate) shutdown: CancellationToken,
    pub(crate) tasks: Vec<JoinHandle<()>>,
}

impl BridgeTasks {
    pub(crate) fn new(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            tasks: Vec::new(),
        }
    }

    /// `None` while every task still runs or shutdown was requested.
    pub(crate) fn poll(&self) -> Option<String> {
        if self.shutdown.is_cancelled() {
            return None;
        }
        self.tasks
            .iter()
            .any(JoinHandle::is_finished)
            .then(|| "bridge task exited unexpectedly".to_owned())
    }

    pub(crate) fn stop(&self) {
        self.shutdown.cancel();
    }

    pub(crate) async fn join(&mut self) {
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}
