//! Dispatcher behaviour seen from the wire, with scripted coordinators.

mod common;

use common::{next_matching, quick_sweep};
use cryomag_daq::experiment::{
    ChannelReading, CryoSample, MagnetismSample, Step, StepOutcome, StepResults,
};
use cryomag_daq::protocol::{Event, StepResultsReport};
use cryomag_daq::server::{Server, ServerHandle};
use cryomag_daq::storage::Database;
use cryomag_daq::transport::{Connector, Link, MemoryHub};
use std::time::Duration;

struct Bench {
    hub: MemoryHub,
    db: Database,
    server: ServerHandle,
    _server: Server,
}

impl Bench {
    fn start() -> Self {
        let db = Database::open_in_memory().unwrap();
        let (hub, accept) = MemoryHub::new();
        let server = Server::start(db.clone(), accept);
        Self {
            hub,
            db,
            server: server.handle(),
            _server: server,
        }
    }

    async fn connect(&self, idn: &str) -> Link {
        let mut link = self.hub.connect().await.unwrap();
        assert_eq!(link.inbound.recv().await, Some(Event::Idn(None)));
        link.outbound.send(Event::Idn(Some(idn.into()))).unwrap();
        // wait until the server has filed the connection under its role
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !self
            .db
            .sessions()
            .await
            .unwrap()
            .iter()
            .any(|s| s.idn == idn && s.connection_id.is_some())
        {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        link
    }
}

async fn next_step(link: &mut Link) -> Step {
    match next_matching(link, |e| matches!(e, Event::NextStep(_))).await {
        Event::NextStep(step) => step,
        _ => unreachable!(),
    }
}

fn cryo_results(step: &Step) -> Event {
    Event::GotStepResults(StepResultsReport {
        step_id: step.id,
        results: StepResults::Cryogenics {
            samples: vec![CryoSample {
                elapsed_secs: 1.0,
                timestamp: chrono::Utc::now(),
                pressures: vec![1e-3; 3],
                temperatures: vec![ChannelReading {
                    channel: 1,
                    resistance: Some(1500.0),
                    temperature: Some(0.05),
                    stale: false,
                }],
            }],
        },
    })
}

fn magnetism_results(step: &Step) -> Event {
    Event::GotStepResults(StepResultsReport {
        step_id: step.id,
        results: StepResults::Magnetism {
            samples: vec![MagnetismSample {
                ac_rms_field: 0.2,
                dc_field: step.settings.magnet_field,
                lockin_amplitude: 1e-6,
                lockin_phase: 12.0,
            }],
        },
    })
}

fn done(step: &Step) -> Event {
    Event::MarkStepAsDone(Step {
        done: true,
        outcome: StepOutcome::Completed,
        ..step.clone()
    })
}

#[tokio::test]
async fn test_ready_needs_both_coordinators() {
    let bench = Bench::start();
    let mut cryo = bench.connect("cryo_a").await;
    let mut magnetism = bench.connect("magnetism_a").await;
    bench.server.submit_sweep(quick_sweep(1, 1)).await.unwrap();

    let step = next_step(&mut cryo).await;
    assert_eq!(next_step(&mut magnetism).await, step);

    magnetism.outbound.send(Event::IsStepReady(step.id)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(cryo.inbound.try_recv().is_err());
    assert!(magnetism.inbound.try_recv().is_err());

    cryo.outbound.send(Event::IsStepReady(step.id)).unwrap();
    let ready = |e: &Event| matches!(e, Event::StepReadyForMeasurement(_));
    assert_eq!(
        next_matching(&mut cryo, ready).await,
        Event::StepReadyForMeasurement(step.id)
    );
    assert_eq!(
        next_matching(&mut magnetism, ready).await,
        Event::StepReadyForMeasurement(step.id)
    );
}

#[tokio::test]
async fn test_reconnect_redelivers_only_unfinished_work() {
    let bench = Bench::start();
    let mut cryo = bench.connect("cryo_a").await;
    let mut magnetism = bench.connect("magnetism_a").await;
    let created = bench.server.submit_sweep(quick_sweep(2, 1)).await.unwrap();

    let first = next_step(&mut cryo).await;
    next_step(&mut magnetism).await;

    // cryo finishes, reporting its results twice
    cryo.outbound.send(cryo_results(&first)).unwrap();
    cryo.outbound.send(cryo_results(&first)).unwrap();
    cryo.outbound.send(done(&first)).unwrap();

    // magnetism drops out before finishing and comes back
    drop(magnetism);
    let mut magnetism = bench.connect("magnetism_a").await;
    assert_eq!(next_step(&mut magnetism).await, first);

    // cryo reconnecting does not get the step it already finished
    drop(cryo);
    let mut cryo = bench.connect("cryo_a").await;

    magnetism.outbound.send(magnetism_results(&first)).unwrap();
    magnetism.outbound.send(done(&first)).unwrap();

    let second = next_step(&mut cryo).await;
    assert_ne!(second.id, first.id);
    assert_eq!(next_step(&mut magnetism).await, second);

    let export = bench.db.export_sweep(created.sweep_id).await.unwrap().unwrap();
    let data_point = export.steps[0].data_point.as_ref().unwrap();
    assert_eq!(data_point.cryogenics.len(), 1);
    assert_eq!(data_point.magnetism.len(), 1);
    assert_eq!(export.steps[0].step.outcome, StepOutcome::Completed);
    assert!(!export.steps[1].step.done);
}

#[tokio::test]
async fn test_failed_step_is_reported_and_skipped() {
    let bench = Bench::start();
    let mut cryo = bench.connect("cryo_a").await;
    let mut magnetism = bench.connect("magnetism_a").await;
    let mut browser = bench.connect("webbrowser_ui").await;
    bench.server.submit_sweep(quick_sweep(2, 1)).await.unwrap();

    let first = next_step(&mut cryo).await;
    next_step(&mut magnetism).await;

    magnetism
        .outbound
        .send(Event::StepFailed(cryomag_daq::protocol::StepFailure {
            step_id: first.id,
            role: cryomag_daq::protocol::Role::Magnetism,
            reason: "lock-in buffer empty".into(),
        }))
        .unwrap();

    let Event::StepFailed(failure) =
        next_matching(&mut browser, |e| matches!(e, Event::StepFailed(_))).await
    else {
        unreachable!()
    };
    assert_eq!(failure.step_id, first.id);

    let second = next_step(&mut cryo).await;
    assert_ne!(second.id, first.id);
    let stored = bench.db.step(first.id).await.unwrap().unwrap();
    assert_eq!(stored.outcome, StepOutcome::Failed);
}
