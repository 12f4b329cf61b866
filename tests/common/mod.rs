//! Shared fixtures: a full lab (server plus both coordinators) over the
//! in-memory transport.

#![allow(dead_code)]

use cryomag_daq::config::Settings;
use cryomag_daq::coordinator::{run_client, CryoCoordinator, MagnetismCoordinator};
use cryomag_daq::experiment::{SweepConfiguration, SweepProgress, SweepRange};
use cryomag_daq::protocol::{ClientIdentity, Event, Role};
use cryomag_daq::server::{Server, ServerHandle};
use cryomag_daq::station::{CryoStation, MagnetismStation};
use cryomag_daq::storage::Database;
use cryomag_daq::transport::{ClientLink, Connector, Link, MemoryHub};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;

/// Settings with no simulated latency and no background telemetry.
pub fn fast_settings(data_dir: &std::path::Path) -> Settings {
    let mut settings = Settings::default();
    settings.application.data_dir = data_dir.to_path_buf();
    settings.simulation.latency_ms = 0;
    settings.simulation.overrange_every = 0;
    settings.protocol.telemetry_interval_secs = 0.0;
    settings.protocol.previous_step_timeout_secs = 5.0;
    settings.protocol.ready_timeout_secs = 5.0;
    settings.queue.initial_backoff_ms = 1;
    settings.queue.max_backoff_ms = 10;
    settings.cryo.bridge_retry_delay_ms = 0;
    settings.client.reconnect_delay_ms = 10;
    settings.client.reconnect_timeout_secs = 1.0;
    settings
}

/// A sweep over `fields` magnet values that measures in milliseconds.
pub fn quick_sweep(fields: u32, points: u32) -> SweepConfiguration {
    SweepConfiguration {
        lockin_frequency: 4096.0,
        lockin_buffer_size: 8,
        signal_frequency: SweepRange::fixed(1000.0),
        signal_amplitude: SweepRange::fixed(0.5),
        magnet_field: SweepRange::new(0.0, 1.0, fields),
        data_wait_before_measuring: 0.0,
        data_points_per_measurement: points,
        ..SweepConfiguration::default()
    }
}

/// Server and both coordinators wired together in one process.
pub struct Lab {
    pub hub: MemoryHub,
    pub server: ServerHandle,
    pub db: Database,
    pub cryo: Arc<CryoCoordinator>,
    pub magnetism: Arc<MagnetismCoordinator>,
    pub settings: Settings,
    server_task: Server,
    clients: Vec<JoinHandle<()>>,
    _data_dir: TempDir,
}

impl Lab {
    /// Starts the server and both coordinators and waits until both
    /// coordinators have identified.
    pub async fn start() -> Self {
        let data_dir = TempDir::new().unwrap();
        let settings = fast_settings(data_dir.path());
        let db = Database::open_in_memory().unwrap();
        let (hub, accept) = MemoryHub::new();
        let server_task = Server::start(db.clone(), accept);

        let cryo_link = link(&settings, Role::Cryo);
        let cryo = Arc::new(CryoCoordinator::start(
            Arc::new(CryoStation::simulated(&settings)),
            cryo_link.clone(),
            &settings,
        ));
        let magnetism_link = link(&settings, Role::Magnetism);
        let magnetism = Arc::new(MagnetismCoordinator::start(
            Arc::new(MagnetismStation::simulated(&settings)),
            magnetism_link.clone(),
            &settings,
        ));

        let delay = settings.client.reconnect_delay();
        let clients = vec![
            tokio::spawn(run_client(
                Arc::new(hub.clone()) as Arc<dyn Connector>,
                cryo_link,
                cryo.clone(),
                delay,
            )),
            tokio::spawn(run_client(
                Arc::new(hub.clone()) as Arc<dyn Connector>,
                magnetism_link,
                magnetism.clone(),
                delay,
            )),
        ];

        let lab = Self {
            hub,
            server: server_task.handle(),
            db,
            cryo,
            magnetism,
            settings,
            server_task,
            clients,
            _data_dir: data_dir,
        };
        lab.wait_for_sessions(&["cryo_test", "magnetism_test"]).await;
        lab
    }

    /// Waits until every idn in `idns` has a live session.
    pub async fn wait_for_sessions(&self, idns: &[&str]) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let sessions = self.db.sessions().await.unwrap();
            let live = |idn: &&str| {
                sessions
                    .iter()
                    .any(|s| s.idn == *idn && s.connection_id.is_some())
            };
            if idns.iter().all(live) {
                return;
            }
            assert!(tokio::time::Instant::now() < deadline, "clients did not connect");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Connects and identifies a dashboard; returns once the server has
    /// greeted it with the current progress.
    pub async fn browser(&self) -> Link {
        let mut link = self.hub.connect().await.unwrap();
        assert_eq!(link.inbound.recv().await, Some(Event::Idn(None)));
        link.outbound
            .send(Event::Idn(Some("webbrowser_test".into())))
            .unwrap();
        next_matching(&mut link, |e| matches!(e, Event::Progress(_))).await;
        link
    }

    /// Polls progress until `done` holds or `timeout` passes.
    pub async fn wait_for_progress(
        &self,
        timeout: Duration,
        done: impl Fn(&SweepProgress) -> bool,
    ) -> SweepProgress {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let progress = self.db.sweep_progress(None).await.unwrap();
            if done(&progress) || tokio::time::Instant::now() >= deadline {
                return progress;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stops everything.
    pub async fn stop(self) {
        for client in &self.clients {
            client.abort();
        }
        self.server_task.shutdown().await;
    }
}

fn link(settings: &Settings, role: Role) -> ClientLink {
    ClientLink::new(
        ClientIdentity::new(role, "test"),
        settings.client.reconnect_timeout(),
    )
}

/// Next inbound event satisfying `pred`, skipping the rest.
pub async fn next_matching(link: &mut Link, pred: impl Fn(&Event) -> bool) -> Event {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), link.inbound.recv())
            .await
            .unwrap()
            .unwrap();
        if pred(&event) {
            return event;
        }
    }
}
