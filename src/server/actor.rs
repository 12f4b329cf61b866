//! The server actor.
//!
//! Connection bookkeeping, routing and step sequencing all happen on a single
//! task that owns the [`EventRouter`] and the [`StepDispatcher`]. Connection
//! tasks and the HTTP surface talk to it with [`ServerCommand`]s; commands
//! that need an answer carry a oneshot responder.

use super::dispatcher::StepDispatcher;
use super::router::EventRouter;
use crate::error::{AppResult, DaqError};
use crate::experiment::{Step, SweepConfiguration};
use crate::protocol::{ConnectionId, Event, Role};
use crate::storage::{Database, NewSweep};
use crate::transport::AcceptReceiver;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Capacity of the actor's command channel.
pub const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Commands the server actor processes in order.
#[derive(Debug)]
pub enum ServerCommand {
    /// A transport accepted a connection
    Connected {
        connection: ConnectionId,
        outbound: mpsc::UnboundedSender<Event>,
    },
    /// An event arrived on a connection
    Inbound {
        connection: ConnectionId,
        event: Event,
    },
    /// The peer closed the connection
    Disconnected { connection: ConnectionId },
    /// Store a sweep submitted outside the event bus
    SubmitSweep {
        config: SweepConfiguration,
        response: oneshot::Sender<AppResult<NewSweep>>,
    },
    /// Query the step being measured
    ActiveStep {
        response: oneshot::Sender<Option<Step>>,
    },
    /// Stop the actor
    Shutdown { response: oneshot::Sender<()> },
}

/// Owner of all server-side protocol state.
#[derive(Debug)]
pub struct ServerActor {
    router: EventRouter,
    dispatcher: StepDispatcher,
    db: Database,
}

impl ServerActor {
    /// Actor over `db` with no connections.
    pub fn new(db: Database) -> Self {
        Self {
            router: EventRouter::new(),
            dispatcher: StepDispatcher::new(db.clone()),
            db,
        }
    }

    /// Caps the size of sweeps clients may submit.
    pub fn with_max_sweep_steps(mut self, max_steps: usize) -> Self {
        self.dispatcher = self.dispatcher.with_max_sweep_steps(max_steps);
        self
    }

    /// Processes commands until shutdown or until every sender is gone.
    pub async fn run(mut self, mut command_rx: mpsc::Receiver<ServerCommand>) {
        info!("server actor started");

        // pick up steps left pending by a previous run
        if let Err(err) = self.dispatcher.dispatch_next(&self.router).await {
            error!(error = %err, "could not resume pending steps");
        }

        while let Some(command) = command_rx.recv().await {
            match command {
                ServerCommand::Connected {
                    connection,
                    outbound,
                } => {
                    self.router.register(connection, outbound);
                    self.router.send_to(connection, Event::Idn(None));
                }
                ServerCommand::Inbound { connection, event } => {
                    let name = event.name();
                    if let Err(err) = self.handle_inbound(connection, event).await {
                        error!(%connection, event = name, error = %err, "event handling failed");
                    }
                }
                ServerCommand::Disconnected { connection } => {
                    if let Some(identity) = self.router.disconnect(connection) {
                        if let Err(err) = self
                            .db
                            .release_session(identity.to_string(), connection)
                            .await
                        {
                            warn!(%connection, error = %err, "could not release session");
                        }
                    }
                }
                ServerCommand::SubmitSweep { config, response } => {
                    let result = self.dispatcher.submit_sweep(&self.router, config, None).await;
                    let _ = response.send(result);
                }
                ServerCommand::ActiveStep { response } => {
                    let _ = response.send(self.dispatcher.active_step().cloned());
                }
                ServerCommand::Shutdown { response } => {
                    info!("server actor shutting down");
                    let _ = response.send(());
                    break;
                }
            }
        }

        info!("server actor stopped");
    }

    async fn identify(&mut self, connection: ConnectionId, idn: &str) -> AppResult<()> {
        let identity = match self.router.identify(connection, idn) {
            Ok(identity) => identity,
            Err(err) => {
                warn!(%connection, error = %err, "rejected identification");
                return Ok(());
            }
        };
        self.db
            .upsert_session(identity.to_string(), identity.role, connection)
            .await?;

        if identity.role.is_coordinator() {
            self.dispatcher
                .on_coordinator_identified(&self.router, identity.role, connection)
                .await
        } else {
            let progress = self.dispatcher.progress().await?;
            self.router.send_to(connection, Event::Progress(progress));
            Ok(())
        }
    }

    async fn handle_inbound(&mut self, connection: ConnectionId, event: Event) -> AppResult<()> {
        if let Event::Idn(Some(idn)) = &event {
            return self.identify(connection, idn).await;
        }
        let Some(identity) = self.router.identity(connection).cloned() else {
            debug!(%connection, event = event.name(), "unidentified connection, asking again");
            self.router.send_to(connection, Event::Idn(None));
            return Ok(());
        };
        let role = identity.role;
        let name = event.name();

        match event {
            Event::Idn(_) => {}

            Event::IsStepReady(_)
            | Event::MarkStepAsDone(_)
            | Event::GotStepResults(_)
            | Event::StepFailed(_)
                if !role.is_coordinator() =>
            {
                warn!(%identity, event = name, "step signal from a non-coordinator dropped");
            }
            Event::IsStepReady(step_id) => {
                self.dispatcher.on_client_ready(&self.router, step_id, role);
            }
            Event::MarkStepAsDone(step) => {
                self.dispatcher
                    .on_client_done(&self.router, step.id, role)
                    .await?;
            }
            Event::GotStepResults(report) => {
                self.dispatcher.on_step_results(role, report).await?;
            }
            Event::StepFailed(failure) => {
                self.dispatcher.on_step_failed(&self.router, failure).await?;
            }

            Event::SetExperimentConfig(config) => {
                if let Err(err) = self
                    .dispatcher
                    .submit_sweep(&self.router, config, Some(identity.to_string()))
                    .await
                {
                    warn!(%identity, error = %err, "sweep rejected");
                }
            }
            Event::GetLatestExperimentConfig => {
                let config = self
                    .db
                    .latest_sweep()
                    .await?
                    .map(|(_, config)| config)
                    .unwrap_or_default();
                self.router
                    .send_to(connection, Event::LatestExperimentConfig(config));
            }
            Event::GetProgress => {
                let progress = self.dispatcher.progress().await?;
                self.router.send_to(connection, Event::Progress(progress));
            }

            event @ Event::GetTemperatures => {
                self.forward(Role::Cryo, &event);
            }
            event @ (Event::GetMagnetTrace
            | Event::GetDcField
            | Event::SetMagnetField(_)
            | Event::SetSignalGenerator(_)
            | Event::SetLockIn(_)
            | Event::GetInstrumentConfig) => {
                self.forward(Role::Magnetism, &event);
            }
            event @ Event::GetQueueSize => {
                for role in Role::COORDINATORS {
                    self.forward(role, &event);
                }
            }

            event @ (Event::CryoTelemetry(_)
            | Event::MagnetTrace(_)
            | Event::MagnetRms(_)
            | Event::DcField(_)
            | Event::InstrumentConfig(_)
            | Event::QueueSize(_)) => {
                self.router.route_to_role(Role::Browser, &event);
            }

            _ => {
                debug!(%identity, event = name, "event not expected from clients");
            }
        }
        Ok(())
    }

    fn forward(&self, role: Role, event: &Event) {
        if self.router.route_to_role(role, event) == 0 {
            debug!(%role, event = event.name(), "no client of that role connected");
        }
    }
}

/// Handle on a running [`ServerActor`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    commands: mpsc::Sender<ServerCommand>,
}

impl ServerHandle {
    /// Wraps the command sender of an actor.
    pub fn new(commands: mpsc::Sender<ServerCommand>) -> Self {
        Self { commands }
    }

    /// Sender used by connection tasks.
    pub fn commands(&self) -> mpsc::Sender<ServerCommand> {
        self.commands.clone()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> ServerCommand,
    ) -> AppResult<T> {
        let (response, rx) = oneshot::channel();
        self.commands
            .send(command(response))
            .await
            .map_err(|_| DaqError::ServerStopped)?;
        rx.await.map_err(|_| DaqError::ServerStopped)
    }

    /// Stores a sweep and starts it, as `set_experiment_config` does.
    pub async fn submit_sweep(&self, config: SweepConfiguration) -> AppResult<NewSweep> {
        self.request(|response| ServerCommand::SubmitSweep { config, response })
            .await?
    }

    /// The step being measured.
    pub async fn active_step(&self) -> AppResult<Option<Step>> {
        self.request(|response| ServerCommand::ActiveStep { response })
            .await
    }

    /// Stops the actor.
    pub async fn shutdown(&self) -> AppResult<()> {
        self.request(|response| ServerCommand::Shutdown { response })
            .await
    }
}

/// Turns accepted links into actor commands until the accept channel closes.
pub async fn serve_links(mut accept: AcceptReceiver, commands: mpsc::Sender<ServerCommand>) {
    let mut next_id = 0;
    while let Some(link) = accept.recv().await {
        next_id += 1;
        let connection = ConnectionId(next_id);
        if commands
            .send(ServerCommand::Connected {
                connection,
                outbound: link.outbound,
            })
            .await
            .is_err()
        {
            break;
        }

        let commands = commands.clone();
        let mut inbound = link.inbound;
        tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                if commands
                    .send(ServerCommand::Inbound { connection, event })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            let _ = commands
                .send(ServerCommand::Disconnected { connection })
                .await;
        });
    }
    debug!("accept channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{StepId, SweepRange};
    use crate::transport::{Connector, Link, MemoryHub};

    async fn connect(hub: &MemoryHub, idn: &str) -> Link {
        let mut link = hub.connect().await.unwrap();
        assert_eq!(link.inbound.recv().await, Some(Event::Idn(None)));
        link.outbound.send(Event::Idn(Some(idn.into()))).unwrap();
        link
    }

    async fn next_matching(link: &mut Link, pred: impl Fn(&Event) -> bool) -> Event {
        loop {
            let event = link.inbound.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    }

    fn start() -> (MemoryHub, ServerHandle) {
        let db = Database::open_in_memory().unwrap();
        let (hub, accept) = MemoryHub::new();
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        tokio::spawn(ServerActor::new(db).run(rx));
        tokio::spawn(serve_links(accept, tx.clone()));
        (hub, ServerHandle::new(tx))
    }

    #[tokio::test]
    async fn browser_requests_reach_the_right_coordinator() {
        let (hub, _handle) = start();
        let mut cryo = connect(&hub, "cryo_fridge").await;
        let mut magnetism = connect(&hub, "magnetism_bench").await;
        let mut browser = connect(&hub, "webbrowser_1").await;
        next_matching(&mut browser, |e| matches!(e, Event::Progress(_))).await;

        browser.outbound.send(Event::GetTemperatures).unwrap();
        browser.outbound.send(Event::SetMagnetField(0.25)).unwrap();
        assert_eq!(cryo.inbound.recv().await, Some(Event::GetTemperatures));
        assert_eq!(magnetism.inbound.recv().await, Some(Event::SetMagnetField(0.25)));

        magnetism.outbound.send(Event::DcField(0.1)).unwrap();
        assert_eq!(browser.inbound.recv().await, Some(Event::DcField(0.1)));
    }

    #[tokio::test]
    async fn unidentified_clients_are_asked_again() {
        let (hub, _handle) = start();
        let mut anonymous = hub.connect().await.unwrap();
        assert_eq!(anonymous.inbound.recv().await, Some(Event::Idn(None)));
        anonymous.outbound.send(Event::IsStepReady(StepId(1))).unwrap();
        assert_eq!(anonymous.inbound.recv().await, Some(Event::Idn(None)));
    }

    #[tokio::test]
    async fn sweep_submitted_through_the_handle_is_broadcast() {
        let (hub, handle) = start();
        let mut cryo = connect(&hub, "cryo_fridge").await;
        let mut magnetism = connect(&hub, "magnetism_bench").await;

        let mut config = SweepConfiguration::default();
        config.magnet_field = SweepRange::new(0.0, 1.0, 2);
        let created = handle.submit_sweep(config).await.unwrap();
        assert_eq!(created.steps, 2);

        let is_step = |e: &Event| matches!(e, Event::NextStep(_));
        let Event::NextStep(step) = next_matching(&mut cryo, is_step).await else {
            unreachable!()
        };
        assert_eq!(next_matching(&mut magnetism, is_step).await, Event::NextStep(step.clone()));
        assert_eq!(handle.active_step().await.unwrap(), Some(step));

        handle.shutdown().await.unwrap();
        assert!(handle.active_step().await.is_err());
    }

    #[tokio::test]
    async fn oversized_sweep_from_a_browser_is_rejected() {
        let (hub, handle) = start();
        let mut browser = connect(&hub, "webbrowser_1").await;
        next_matching(&mut browser, |e| matches!(e, Event::Progress(_))).await;

        let huge = SweepRange::new(0.0, 1.0, 3_000_000);
        let config = SweepConfiguration {
            magnet_field: huge,
            signal_amplitude: huge,
            signal_frequency: huge,
            ..SweepConfiguration::default()
        };
        browser.outbound.send(Event::SetExperimentConfig(config)).unwrap();

        // the actor is still serving requests and nothing was stored
        browser.outbound.send(Event::GetProgress).unwrap();
        let Event::Progress(progress) =
            next_matching(&mut browser, |e| matches!(e, Event::Progress(_))).await
        else {
            unreachable!()
        };
        assert_eq!(progress.total, 0);
        assert_eq!(handle.active_step().await.unwrap(), None);
    }
}
