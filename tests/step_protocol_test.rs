//! End-to-end runs of the step protocol over the in-memory transport.

mod common;

use common::{next_matching, quick_sweep, Lab};
use cryomag_daq::experiment::{StepOutcome, SweepId};
use cryomag_daq::protocol::{Event, Role};
use std::time::Duration;

#[tokio::test]
async fn test_sweep_runs_to_completion() {
    let lab = Lab::start().await;
    let mut browser = lab.browser().await;

    let created = lab.server.submit_sweep(quick_sweep(2, 2)).await.unwrap();
    assert_eq!(created.steps, 2);
    assert_eq!(
        next_matching(&mut browser, |e| matches!(e, Event::ExperimentConfigurationSaved(_))).await,
        Event::ExperimentConfigurationSaved(cryomag_daq::protocol::SweepSaved {
            sweep_id: created.sweep_id,
            steps: 2,
        })
    );

    let progress = lab
        .wait_for_progress(Duration::from_secs(10), |p| p.taken == p.total && p.total > 0)
        .await;
    assert_eq!((progress.taken, progress.total), (2, 2));
    assert_eq!(lab.server.active_step().await.unwrap(), None);

    let export = lab.db.export_sweep(created.sweep_id).await.unwrap().unwrap();
    assert_eq!(export.steps.len(), 2);
    for step in &export.steps {
        assert!(step.step.done);
        assert_eq!(step.step.outcome, StepOutcome::Completed);
        let data_point = step.data_point.as_ref().unwrap();
        assert_eq!(data_point.magnetism.len(), 2);
        assert_eq!(data_point.cryogenics.len(), 2);
    }

    // the browser hears about the finished sweep
    let Event::Progress(last) = next_matching(&mut browser, |e| {
        matches!(e, Event::Progress(p) if p.taken == 2)
    })
    .await
    else {
        unreachable!()
    };
    assert_eq!(last.sweep_id, Some(created.sweep_id));

    // both coordinators kept local copies
    let data_dir = &lab.settings.application.data_dir;
    for kind in ["cryo_samples", "magnetism_fields", "magnetism_lockin"] {
        let path = data_dir.join(format!("{kind}_experiment_{}.csv", created.sweep_id));
        assert!(path.exists(), "{} missing", path.display());
    }

    lab.stop().await;
}

#[tokio::test]
async fn test_steps_are_measured_in_order() {
    let lab = Lab::start().await;
    let created = lab.server.submit_sweep(quick_sweep(3, 1)).await.unwrap();
    lab.wait_for_progress(Duration::from_secs(10), |p| p.taken == 3)
        .await;

    let export = lab.db.export_sweep(created.sweep_id).await.unwrap().unwrap();
    let fields: Vec<f64> = export
        .steps
        .iter()
        .map(|s| s.step.settings.magnet_field)
        .collect();
    assert_eq!(fields, vec![0.0, 0.5, 1.0]);
    assert!(lab.cryo.tracker().has_completed(export.steps[2].step.id));
    assert!(lab.magnetism.tracker().has_completed(export.steps[2].step.id));

    lab.stop().await;
}

#[tokio::test]
async fn test_idle_server_dispatches_nothing() {
    let lab = Lab::start().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(lab.server.active_step().await.unwrap(), None);
    assert_eq!(lab.cryo.queue_size(), 0);

    let progress = lab.db.sweep_progress(Some(SweepId(1))).await.unwrap();
    assert_eq!((progress.taken, progress.total), (0, 0));
    lab.stop().await;
}

#[tokio::test]
async fn test_dashboard_requests_are_answered() {
    let lab = Lab::start().await;
    let mut browser = lab.browser().await;

    browser.outbound.send(Event::GetTemperatures).unwrap();
    let Event::CryoTelemetry(sample) =
        next_matching(&mut browser, |e| matches!(e, Event::CryoTelemetry(_))).await
    else {
        unreachable!()
    };
    assert_eq!(sample.temperatures.len(), lab.settings.cryo.bridge_channels.len());

    browser.outbound.send(Event::SetMagnetField(0.75)).unwrap();
    let Event::InstrumentConfig(config) =
        next_matching(&mut browser, |e| matches!(e, Event::InstrumentConfig(_))).await
    else {
        unreachable!()
    };
    assert_eq!(config.magnet_field, 0.75);

    browser.outbound.send(Event::GetQueueSize).unwrap();
    let mut roles = Vec::new();
    for _ in 0..2 {
        if let Event::QueueSize(report) =
            next_matching(&mut browser, |e| matches!(e, Event::QueueSize(_))).await
        {
            roles.push(report.role);
        }
    }
    roles.sort();
    assert_eq!(roles, vec![Role::Cryo, Role::Magnetism]);

    lab.stop().await;
}

#[tokio::test]
async fn test_latest_config_is_served_to_browsers() {
    let lab = Lab::start().await;
    let mut browser = lab.browser().await;

    let sweep = quick_sweep(2, 1);
    browser
        .outbound
        .send(Event::SetExperimentConfig(sweep.clone()))
        .unwrap();
    next_matching(&mut browser, |e| matches!(e, Event::ExperimentConfigurationSaved(_))).await;

    browser.outbound.send(Event::GetLatestExperimentConfig).unwrap();
    assert_eq!(
        next_matching(&mut browser, |e| matches!(e, Event::LatestExperimentConfig(_))).await,
        Event::LatestExperimentConfig(sweep)
    );

    // the dashboard has a session of its own
    let sessions = lab.db.sessions().await.unwrap();
    assert!(sessions.iter().any(|s| s.idn == "webbrowser_test"));

    lab.stop().await;
}
