//! The central event server.
//!
//! Clients connect over a [`transport`](crate::transport), identify with
//! `idn`, and are routed by role. The [`StepDispatcher`] sequences the steps
//! of the current sweep across both coordinators; [`http`] exposes read-only
//! views of the store.

pub mod actor;
pub mod dispatcher;
pub mod http;
pub mod router;

pub use actor::{serve_links, ServerActor, ServerCommand, ServerHandle, COMMAND_CHANNEL_CAPACITY};
pub use dispatcher::StepDispatcher;
pub use http::{serve_http, HttpState};
pub use router::EventRouter;

use crate::experiment::MAX_SWEEP_STEPS;
use crate::storage::Database;
use crate::transport::AcceptReceiver;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A running server: the actor plus the task feeding it connections.
#[derive(Debug)]
pub struct Server {
    handle: ServerHandle,
    actor: JoinHandle<()>,
    links: JoinHandle<()>,
}

impl Server {
    /// Spawns the actor over `db`, accepting connections from `accept`.
    pub fn start(db: Database, accept: AcceptReceiver) -> Self {
        Self::start_with_limit(db, accept, MAX_SWEEP_STEPS)
    }

    /// Like [`start`](Self::start), rejecting sweeps over `max_sweep_steps`.
    pub fn start_with_limit(db: Database, accept: AcceptReceiver, max_sweep_steps: usize) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let actor = ServerActor::new(db).with_max_sweep_steps(max_sweep_steps);
        let actor = tokio::spawn(actor.run(rx));
        let links = tokio::spawn(serve_links(accept, tx.clone()));
        Self {
            handle: ServerHandle::new(tx),
            actor,
            links,
        }
    }

    /// Handle for commands.
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Stops accepting and waits for the actor to exit.
    pub async fn shutdown(self) {
        self.links.abort();
        if self.handle.shutdown().await.is_ok() {
            let _ = self.actor.await;
        }
    }
}
