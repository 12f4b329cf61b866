//! Event bus transports.
//!
//! A connection is a [`Link`]: an ordered outbound sender and an ordered
//! inbound receiver. Dropping the outbound sender closes the connection; the
//! peer then sees its inbound receiver end. The server receives one `Link`
//! per accepted connection, clients obtain theirs from a [`Connector`].
//!
//! Two transports share these semantics:
//! - [`tcp`]: newline-delimited JSON over `tokio::net`
//! - [`memory`]: in-process channels, for tests and single-process runs

pub mod client;
pub mod memory;
pub mod tcp;

use crate::error::AppResult;
use crate::protocol::Event;
use async_trait::async_trait;
use tokio::sync::mpsc;

pub use client::ClientLink;
pub use memory::MemoryHub;
pub use tcp::TcpConnector;

/// One bidirectional connection.
#[derive(Debug)]
pub struct Link {
    /// Events to the peer
    pub outbound: mpsc::UnboundedSender<Event>,
    /// Events from the peer, ends when the peer disconnects
    pub inbound: mpsc::UnboundedReceiver<Event>,
}

impl Link {
    /// Two connected ends.
    pub fn pair() -> (Link, Link) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Link {
                outbound: a_tx,
                inbound: b_rx,
            },
            Link {
                outbound: b_tx,
                inbound: a_rx,
            },
        )
    }
}

/// Establishes client connections to the server.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a new connection.
    async fn connect(&self) -> AppResult<Link>;

    /// Where this connector points, for logs.
    fn describe(&self) -> String;
}

/// Sender half the server uses to receive accepted connections.
pub type AcceptSender = mpsc::UnboundedSender<Link>;

/// Receiver half the server drains to accept connections.
pub type AcceptReceiver = mpsc::UnboundedReceiver<Link>;
