//! Step sequencing across both coordinators.
//!
//! At most one step is active. It is broadcast to both coordinators, the
//! ready signal is relayed once both sides configured their instruments, and
//! the step is completed once both sides reported done. Signals that refer to
//! any other step are logged and dropped.

use super::router::EventRouter;
use crate::error::AppResult;
use crate::experiment::{
    Step, StepId, StepOutcome, StepResults, SweepConfiguration, SweepProgress, MAX_SWEEP_STEPS,
};
use crate::protocol::{ConnectionId, Event, Role, StepFailure, StepResultsReport, SweepSaved};
use crate::storage::{Database, NewSweep};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct ActiveStep {
    step: Step,
    ready: BTreeSet<Role>,
    done: BTreeSet<Role>,
    ready_relayed: bool,
}

impl ActiveStep {
    fn new(step: Step) -> Self {
        Self {
            step,
            ready: BTreeSet::new(),
            done: BTreeSet::new(),
            ready_relayed: false,
        }
    }

    fn all(roles: &BTreeSet<Role>) -> bool {
        Role::COORDINATORS.iter().all(|role| roles.contains(role))
    }
}

/// Server-side step sequencer.
#[derive(Debug)]
pub struct StepDispatcher {
    db: Database,
    active: Option<ActiveStep>,
    max_sweep_steps: usize,
}

impl StepDispatcher {
    /// Dispatcher over `db`; nothing is active until [`dispatch_next`](Self::dispatch_next).
    pub fn new(db: Database) -> Self {
        Self {
            db,
            active: None,
            max_sweep_steps: MAX_SWEEP_STEPS,
        }
    }

    /// Rejects submitted sweeps larger than `max_steps`.
    pub fn with_max_sweep_steps(mut self, max_steps: usize) -> Self {
        self.max_sweep_steps = max_steps;
        self
    }

    /// The step being measured.
    pub fn active_step(&self) -> Option<&Step> {
        self.active.as_ref().map(|a| &a.step)
    }

    fn active_for(&mut self, step_id: StepId, signal: &str, role: Role) -> Option<&mut ActiveStep> {
        match self.active.as_mut() {
            Some(active) if active.step.id == step_id => Some(active),
            other => {
                debug!(
                    %step_id,
                    %role,
                    signal,
                    active = ?other.map(|a| a.step.id),
                    "signal for inactive step dropped"
                );
                None
            }
        }
    }

    /// Stores a sweep, abandoning what was pending, and dispatches its first step.
    pub async fn submit_sweep(
        &mut self,
        router: &EventRouter,
        config: SweepConfiguration,
        created_by: Option<String>,
    ) -> AppResult<NewSweep> {
        config.validate_within(self.max_sweep_steps)?;
        let created = self.db.create_sweep(config, created_by).await?;
        info!(
            sweep_id = %created.sweep_id,
            steps = created.steps,
            abandoned = created.abandoned,
            "sweep submitted"
        );
        if let Some(previous) = self.active.take() {
            info!(step_id = %previous.step.id, "active step abandoned by new sweep");
            abandon(router, previous.step.id);
        }
        router.route_to_role(
            Role::Browser,
            &Event::ExperimentConfigurationSaved(SweepSaved {
                sweep_id: created.sweep_id,
                steps: created.steps,
            }),
        );
        self.dispatch_next(router).await?;
        self.publish_progress(router).await?;
        Ok(created)
    }

    /// Broadcasts the oldest pending step, unless a step is already active.
    ///
    /// Returns the active step afterwards; `None` means the sweep is idle.
    pub async fn dispatch_next(&mut self, router: &EventRouter) -> AppResult<Option<StepId>> {
        if let Some(active) = &self.active {
            debug!(step_id = %active.step.id, "step already active");
            return Ok(Some(active.step.id));
        }
        let Some(step) = self.db.next_pending_step().await? else {
            info!("no pending steps, sweep idle");
            return Ok(None);
        };
        self.db.ensure_data_point(step.id).await?;

        let event = Event::NextStep(step.clone());
        for role in Role::COORDINATORS {
            if router.route_to_role(role, &event) == 0 {
                debug!(step_id = %step.id, %role, "coordinator offline, step sent when it connects");
            }
        }
        info!(step_id = %step.id, sweep_id = %step.sweep_id, "step dispatched");
        let step_id = step.id;
        self.active = Some(ActiveStep::new(step));
        Ok(Some(step_id))
    }

    /// Records `is_step_ready`; relays the release once both sides are ready.
    pub fn on_client_ready(&mut self, router: &EventRouter, step_id: StepId, role: Role) {
        let Some(active) = self.active_for(step_id, "is_step_ready", role) else {
            return;
        };
        active.ready.insert(role);
        let release = Event::StepReadyForMeasurement(step_id);

        if active.ready_relayed {
            debug!(%step_id, %role, "repeated ready, releasing that side again");
            router.route_to_role(role, &release);
        } else if ActiveStep::all(&active.ready) {
            active.ready_relayed = true;
            info!(%step_id, "both sides ready, releasing step");
            for role in Role::COORDINATORS {
                router.route_to_role(role, &release);
            }
        } else {
            debug!(%step_id, %role, "waiting for the other side to be ready");
        }
    }

    /// Stores reported samples of the active step.
    pub async fn on_step_results(&mut self, role: Role, report: StepResultsReport) -> AppResult<()> {
        if self.active_for(report.step_id, "got_step_results", role).is_none() {
            return Ok(());
        }
        let step_id = report.step_id;
        let inserted = match (role, report.results) {
            (Role::Magnetism, StepResults::Magnetism { samples }) => {
                self.db.save_magnetism_results(step_id, samples).await?
            }
            (Role::Cryo, StepResults::Cryogenics { samples }) => {
                self.db.save_cryogenics_results(step_id, samples).await?
            }
            (role, results) => {
                warn!(%step_id, %role, kind = ?results, "results of the wrong kind dropped");
                return Ok(());
            }
        };
        info!(%step_id, %role, inserted, "step results stored");
        Ok(())
    }

    /// Records `mark_step_as_done`; completes the step once both sides are done.
    pub async fn on_client_done(
        &mut self,
        router: &EventRouter,
        step_id: StepId,
        role: Role,
    ) -> AppResult<()> {
        let Some(active) = self.active_for(step_id, "mark_step_as_done", role) else {
            return Ok(());
        };
        if !active.done.insert(role) {
            debug!(%step_id, %role, "repeated done ignored");
            return Ok(());
        }
        if !ActiveStep::all(&active.done) {
            debug!(%step_id, %role, "waiting for the other side to finish");
            return Ok(());
        }

        self.active = None;
        if self.db.complete_step(step_id, StepOutcome::Completed).await? {
            info!(%step_id, "step completed");
        }
        self.publish_progress(router).await?;
        self.dispatch_next(router).await?;
        Ok(())
    }

    /// A coordinator gave up on the active step: mark it failed and move on.
    pub async fn on_step_failed(&mut self, router: &EventRouter, failure: StepFailure) -> AppResult<()> {
        if self
            .active_for(failure.step_id, "step_failed", failure.role)
            .is_none()
        {
            return Ok(());
        }
        self.active = None;
        warn!(step_id = %failure.step_id, role = %failure.role, reason = %failure.reason, "step failed");
        abandon(router, failure.step_id);
        self.db
            .complete_step(failure.step_id, StepOutcome::Failed)
            .await?;
        router.route_to_role(Role::Browser, &Event::StepFailed(failure));
        self.publish_progress(router).await?;
        self.dispatch_next(router).await?;
        Ok(())
    }

    /// A coordinator (re)connected: resend the active step it has not finished,
    /// or start on steps left pending.
    pub async fn on_coordinator_identified(
        &mut self,
        router: &EventRouter,
        role: Role,
        connection: ConnectionId,
    ) -> AppResult<()> {
        match &self.active {
            Some(active) if !active.done.contains(&role) => {
                info!(step_id = %active.step.id, %role, "resending active step");
                router.send_to(connection, Event::NextStep(active.step.clone()));
                Ok(())
            }
            Some(_) => Ok(()),
            None => self.dispatch_next(router).await.map(|_| ()),
        }
    }

    /// Progress of the latest sweep.
    pub async fn progress(&self) -> AppResult<SweepProgress> {
        self.db.sweep_progress(None).await
    }

    async fn publish_progress(&self, router: &EventRouter) -> AppResult<()> {
        let progress = self.progress().await?;
        router.route_to_role(Role::Browser, &Event::Progress(progress));
        Ok(())
    }
}

/// Releases coordinators still waiting on a step that will never complete.
fn abandon(router: &EventRouter, step_id: StepId) {
    let event = Event::StepAbandoned(step_id);
    for role in Role::COORDINATORS {
        router.route_to_role(role, &event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{MagnetismSample, SweepRange};
    use tokio::sync::mpsc::{self, UnboundedReceiver};
    use tracing_test::traced_test;

    struct Harness {
        router: EventRouter,
        dispatcher: StepDispatcher,
        cryo: UnboundedReceiver<Event>,
        magnetism: UnboundedReceiver<Event>,
        db: Database,
    }

    fn harness() -> Harness {
        let db = Database::open_in_memory().unwrap();
        let mut router = EventRouter::new();
        let (cryo_tx, cryo) = mpsc::unbounded_channel();
        let (magnetism_tx, magnetism) = mpsc::unbounded_channel();
        router.register(ConnectionId(1), cryo_tx);
        router.register(ConnectionId(2), magnetism_tx);
        router.identify(ConnectionId(1), "cryo_a").unwrap();
        router.identify(ConnectionId(2), "magnetism_a").unwrap();
        Harness {
            router,
            dispatcher: StepDispatcher::new(db.clone()),
            cryo,
            magnetism,
            db,
        }
    }

    fn sweep(fields: u32) -> SweepConfiguration {
        SweepConfiguration {
            magnet_field: SweepRange::new(0.0, 1.0, fields),
            ..SweepConfiguration::default()
        }
    }

    fn drain(rx: &mut UnboundedReceiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn next_steps(events: &[Event]) -> Vec<StepId> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::NextStep(step) => Some(step.id),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn only_one_step_is_active() {
        let mut h = harness();
        h.dispatcher.submit_sweep(&h.router, sweep(3), None).await.unwrap();
        let first = h.dispatcher.active_step().unwrap().id;
        for _ in 0..3 {
            assert_eq!(h.dispatcher.dispatch_next(&h.router).await.unwrap(), Some(first));
        }
        assert_eq!(next_steps(&drain(&mut h.cryo)), vec![first]);
        assert_eq!(next_steps(&drain(&mut h.magnetism)), vec![first]);
    }

    #[tokio::test]
    async fn ready_is_relayed_once_both_sides_are_ready() {
        let mut h = harness();
        h.dispatcher.submit_sweep(&h.router, sweep(1), None).await.unwrap();
        let id = h.dispatcher.active_step().unwrap().id;
        drain(&mut h.cryo);
        drain(&mut h.magnetism);

        h.dispatcher.on_client_ready(&h.router, id, Role::Magnetism);
        assert!(drain(&mut h.cryo).is_empty());
        assert!(drain(&mut h.magnetism).is_empty());

        h.dispatcher.on_client_ready(&h.router, id, Role::Cryo);
        assert_eq!(drain(&mut h.cryo), vec![Event::StepReadyForMeasurement(id)]);
        assert_eq!(drain(&mut h.magnetism), vec![Event::StepReadyForMeasurement(id)]);

        // a repeat only goes back to the side that asked
        h.dispatcher.on_client_ready(&h.router, id, Role::Cryo);
        assert_eq!(drain(&mut h.cryo), vec![Event::StepReadyForMeasurement(id)]);
        assert!(drain(&mut h.magnetism).is_empty());
    }

    #[tokio::test]
    async fn done_in_either_order_completes_once() {
        for order in [[Role::Cryo, Role::Magnetism], [Role::Magnetism, Role::Cryo]] {
            let mut h = harness();
            let created = h.dispatcher.submit_sweep(&h.router, sweep(2), None).await.unwrap();
            let first = h.dispatcher.active_step().unwrap().id;
            drain(&mut h.cryo);

            h.dispatcher.on_client_done(&h.router, first, order[0]).await.unwrap();
            h.dispatcher.on_client_done(&h.router, first, order[0]).await.unwrap();
            assert_eq!(h.dispatcher.active_step().map(|s| s.id), Some(first));
            assert!(next_steps(&drain(&mut h.cryo)).is_empty());

            h.dispatcher.on_client_done(&h.router, first, order[1]).await.unwrap();
            let second = h.dispatcher.active_step().unwrap().id;
            assert_ne!(second, first);
            assert_eq!(next_steps(&drain(&mut h.cryo)), vec![second]);

            // late duplicates for the finished step change nothing
            h.dispatcher.on_client_done(&h.router, first, order[1]).await.unwrap();
            assert_eq!(h.dispatcher.active_step().unwrap().id, second);
            let progress = h.db.sweep_progress(Some(created.sweep_id)).await.unwrap();
            assert_eq!((progress.taken, progress.total), (1, 2));
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn stale_ready_is_logged_and_ignored() {
        let mut h = harness();
        h.dispatcher.submit_sweep(&h.router, sweep(1), None).await.unwrap();
        drain(&mut h.cryo);
        h.dispatcher.on_client_ready(&h.router, StepId(999), Role::Cryo);
        assert!(drain(&mut h.cryo).is_empty());
        assert!(logs_contain("signal for inactive step dropped"));
    }

    #[tokio::test]
    async fn results_for_inactive_steps_are_dropped() {
        let mut h = harness();
        h.dispatcher.submit_sweep(&h.router, sweep(1), None).await.unwrap();
        let id = h.dispatcher.active_step().unwrap().id;
        let report = |step_id| StepResultsReport {
            step_id,
            results: StepResults::Magnetism {
                samples: vec![MagnetismSample {
                    ac_rms_field: 0.1,
                    dc_field: 0.0,
                    lockin_amplitude: 1.0,
                    lockin_phase: 2.0,
                }],
            },
        };
        h.dispatcher
            .on_step_results(Role::Magnetism, report(StepId(999)))
            .await
            .unwrap();
        // wrong kind for the role
        h.dispatcher.on_step_results(Role::Cryo, report(id)).await.unwrap();
        h.dispatcher.on_step_results(Role::Magnetism, report(id)).await.unwrap();

        let export = h.db.export_sweep(h.dispatcher.active_step().unwrap().sweep_id)
            .await
            .unwrap()
            .unwrap();
        let data_point = export.steps[0].data_point.as_ref().unwrap();
        assert_eq!(data_point.magnetism.len(), 1);
        assert!(data_point.cryogenics.is_empty());
    }

    #[tokio::test]
    async fn failed_step_moves_on() {
        let mut h = harness();
        h.dispatcher.submit_sweep(&h.router, sweep(2), None).await.unwrap();
        let first = h.dispatcher.active_step().unwrap().clone();
        h.dispatcher
            .on_step_failed(
                &h.router,
                StepFailure {
                    step_id: first.id,
                    role: Role::Cryo,
                    reason: "handshake timeout".into(),
                },
            )
            .await
            .unwrap();
        assert_ne!(h.dispatcher.active_step().unwrap().id, first.id);
        let stored = h.db.step(first.id).await.unwrap().unwrap();
        assert_eq!(stored.outcome, StepOutcome::Failed);

        // the side still waiting on the failed step is released
        assert!(drain(&mut h.magnetism).contains(&Event::StepAbandoned(first.id)));
    }

    #[tokio::test]
    async fn superseded_step_is_abandoned_on_both_sides() {
        let mut h = harness();
        h.dispatcher.submit_sweep(&h.router, sweep(2), None).await.unwrap();
        let first = h.dispatcher.active_step().unwrap().id;
        drain(&mut h.cryo);
        drain(&mut h.magnetism);

        h.dispatcher.submit_sweep(&h.router, sweep(2), None).await.unwrap();
        let second = h.dispatcher.active_step().unwrap().id;
        for events in [drain(&mut h.cryo), drain(&mut h.magnetism)] {
            assert_eq!(events[0], Event::StepAbandoned(first));
            assert_eq!(next_steps(&events), vec![second]);
        }
    }

    #[tokio::test]
    async fn sweeps_over_the_limit_are_rejected() {
        let mut h = harness();
        h.dispatcher = StepDispatcher::new(h.db.clone()).with_max_sweep_steps(2);
        let err = h
            .dispatcher
            .submit_sweep(&h.router, sweep(3), None)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::DaqError::Configuration(_)));
        assert!(h.dispatcher.active_step().is_none());
        assert!(drain(&mut h.cryo).is_empty());

        h.dispatcher.submit_sweep(&h.router, sweep(2), None).await.unwrap();
        assert!(h.dispatcher.active_step().is_some());
    }

    #[tokio::test]
    async fn reconnecting_coordinator_gets_the_active_step() {
        let mut h = harness();
        h.dispatcher.submit_sweep(&h.router, sweep(1), None).await.unwrap();
        let id = h.dispatcher.active_step().unwrap().id;
        drain(&mut h.cryo);
        drain(&mut h.magnetism);

        h.dispatcher.on_client_done(&h.router, id, Role::Magnetism).await.unwrap();
        h.dispatcher
            .on_coordinator_identified(&h.router, Role::Magnetism, ConnectionId(2))
            .await
            .unwrap();
        assert!(drain(&mut h.magnetism).is_empty());

        h.dispatcher
            .on_coordinator_identified(&h.router, Role::Cryo, ConnectionId(1))
            .await
            .unwrap();
        assert_eq!(next_steps(&drain(&mut h.cryo)), vec![id]);
    }
}
