//! Client side handle on the current connection.

use crate::error::{AppResult, DaqError};
use crate::error_recovery::Recoverable;
use crate::protocol::{ClientIdentity, Event};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

#[derive(Debug, Default)]
struct Attachment {
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<Event>>,
}

/// Emits events on whatever connection the client currently has.
///
/// The client event loop attaches each new connection and detaches it when
/// the inbound side ends. Cloning shares the same connection.
#[derive(Debug, Clone)]
pub struct ClientLink {
    identity: Arc<ClientIdentity>,
    attachment: Arc<Mutex<Attachment>>,
    connected: Arc<watch::Sender<bool>>,
    reconnect_timeout: Duration,
}

impl ClientLink {
    /// Creates a detached link for `identity`.
    ///
    /// `reconnect_timeout` bounds how long [`Recoverable::recover`] waits for
    /// the event loop to bring up a new connection.
    pub fn new(identity: ClientIdentity, reconnect_timeout: Duration) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            identity: Arc::new(identity),
            attachment: Arc::new(Mutex::new(Attachment::default())),
            connected: Arc::new(connected),
            reconnect_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Attachment> {
        self.attachment.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Identity announced with `idn`.
    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    /// Makes `outbound` the current connection. Returns its generation.
    pub fn attach(&self, outbound: mpsc::UnboundedSender<Event>) -> u64 {
        let generation = {
            let mut attachment = self.lock();
            attachment.generation += 1;
            attachment.outbound = Some(outbound);
            attachment.generation
        };
        self.connected.send_replace(true);
        debug!(generation, "link attached");
        generation
    }

    /// Drops the connection of `generation` if it is still the current one.
    pub fn detach(&self, generation: u64) {
        let mut attachment = self.lock();
        if attachment.generation == generation && attachment.outbound.take().is_some() {
            self.connected.send_replace(false);
            debug!(generation, "link detached");
        }
    }

    /// Drops the current connection, whatever its generation.
    ///
    /// The peer sees the disconnect and closes its side, which ends the
    /// event loop's inbound stream and makes it reconnect.
    pub fn cycle(&self) {
        let dropped = self.lock().outbound.take().is_some();
        self.connected.send_replace(false);
        if dropped {
            info!(identity = %self.identity, "cycling connection");
        }
    }

    /// Whether a connection is attached.
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Sends `event` on the current connection.
    pub fn emit(&self, event: Event) -> AppResult<()> {
        let attachment = self.lock();
        let outbound = attachment.outbound.as_ref().ok_or(DaqError::NotConnected)?;
        let name = event.name();
        outbound.send(event).map_err(|_| DaqError::NotConnected)?;
        debug!(event = name, "emitted");
        Ok(())
    }

    /// Waits until a connection is attached.
    pub async fn wait_connected(&self, timeout: Duration) -> AppResult<()> {
        let mut rx = self.connected.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|connected| *connected)).await;
        match waited {
            Ok(Ok(_)) => Ok(()),
            _ => Err(DaqError::NotConnected),
        }
    }
}

#[async_trait]
impl Recoverable<DaqError> for ClientLink {
    async fn recover(&mut self) -> AppResult<()> {
        self.cycle();
        self.wait_connected(self.reconnect_timeout).await
    }
}
