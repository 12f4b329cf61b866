//! In-process transport.

use super::{AcceptReceiver, AcceptSender, Connector, Link};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Hands client connections straight to a server in the same process.
#[derive(Debug, Clone)]
pub struct MemoryHub {
    accept: AcceptSender,
}

impl MemoryHub {
    /// Creates the hub and the receiver the server accepts from.
    pub fn new() -> (Self, AcceptReceiver) {
        let (accept, rx) = mpsc::unbounded_channel();
        (Self { accept }, rx)
    }
}

#[async_trait]
impl Connector for MemoryHub {
    async fn connect(&self) -> AppResult<Link> {
        let (client, server) = Link::pair();
        self.accept
            .send(server)
            .map_err(|_| DaqError::Transport("in-memory server is not running".to_string()))?;
        Ok(client)
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
