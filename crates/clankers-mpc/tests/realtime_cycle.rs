//! Integration test: receding-horizon cycles through `RealtimeMpc`.
//!
//! Covers the cycle contract end to end:
//! 1. Nothing is solved before a reset provides a target
//! 2. The initialization hook runs once per reset, synchronized modules once per cycle
//! 3. A reset discards solves that are still running or waiting for publication
//! 4. Timeline and target overrides reach the next solve

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clankers_core::config::MpcStackConfig;
use clankers_core::error::TimelineError;
use clankers_core::types::{Mode, Observation, TargetTrajectory};
use clankers_mpc::ddp::SolverStatus;
use clankers_mpc::publisher::Submission;
use clankers_mpc::realtime::{
    CycleOutcome, ModeSequenceInitializer, MpcControl, MpcPhase, RealtimeMpc, SynchronizedModule,
    TemplateInitializer, TimelineOverride,
};
use clankers_mpc::solution::PrimalSolution;
use clankers_mpc::terrain::PlanarTerrain;
use clankers_mpc::timeline::{GaitSchedule, GaitTemplate, GaitType, ModeTimeline};
use clankers_test_utils::{LinearSystem, PublishLog, RecordingTransport};
use nalgebra::{DVector, dvector};

fn config() -> MpcStackConfig {
    let mut config = MpcStackConfig::default();
    config.ddp.time_step = 0.02;
    config.mpc.time_horizon = 1.0;
    config.mpc.num_partitions = 2;
    config
}

fn target() -> TargetTrajectory {
    TargetTrajectory::constant(0.0, DVector::zeros(2), DVector::zeros(1))
}

fn observation(time: f64) -> Observation {
    Observation::new(time, dvector![0.5, 0.0], dvector![0.0], Mode::STANCE)
}

fn mpc() -> (RealtimeMpc, PublishLog) {
    mpc_with_transport(RecordingTransport::new())
}

fn mpc_with_transport((transport, log): (RecordingTransport, PublishLog)) -> (RealtimeMpc, PublishLog) {
    let mpc = RealtimeMpc::new(
        &config(),
        Arc::new(LinearSystem::double_integrator()),
        Arc::new(PlanarTerrain::default()),
        transport,
    )
    .unwrap();
    (mpc, log)
}

#[derive(Default)]
struct Counters {
    pre: AtomicUsize,
    post: AtomicUsize,
    init: AtomicUsize,
}

struct CountingModule {
    counters: Arc<Counters>,
    /// Request a reset from inside the cycle on this pre-solve call.
    reset_on_call: Option<(usize, Arc<MpcControl>)>,
}

impl SynchronizedModule for CountingModule {
    fn pre_solve(
        &mut self,
        init_time: f64,
        final_time: f64,
        _observation: &Observation,
        _gait: &mut GaitSchedule,
    ) -> Result<(), TimelineError> {
        assert!(final_time > init_time);
        let call = self.counters.pre.fetch_add(1, Ordering::SeqCst);
        if let Some((when, control)) = &self.reset_on_call {
            if *when == call {
                control.request_reset(target());
            }
        }
        Ok(())
    }

    fn post_solve(&mut self, primal: &PrimalSolution) {
        assert!(!primal.times.is_empty());
        self.counters.post.fetch_add(1, Ordering::SeqCst);
    }
}

struct CountingInitializer {
    counters: Arc<Counters>,
    inner: TemplateInitializer,
}

impl ModeSequenceInitializer for CountingInitializer {
    fn initialize(
        &mut self,
        observation: &Observation,
        target: &TargetTrajectory,
        gait: &mut GaitSchedule,
    ) -> Result<(), TimelineError> {
        self.counters.init.fetch_add(1, Ordering::SeqCst);
        self.inner.initialize(observation, target, gait)
    }
}

#[test]
fn no_solve_before_reset() {
    let (mut mpc, log) = mpc();
    assert_eq!(mpc.on_observation(&observation(0.0)).unwrap(), CycleOutcome::AwaitingReset);
    assert_eq!(mpc.control().phase(), MpcPhase::Idle);
    std::thread::sleep(Duration::from_millis(20));
    assert!(log.records().is_empty());
}

#[test]
fn cycles_publish_in_order_and_hooks_run_once() {
    let counters = Arc::new(Counters::default());
    let (mpc, log) = mpc();
    let mut mpc = mpc.with_initializer(CountingInitializer {
        counters: Arc::clone(&counters),
        inner: TemplateInitializer::new(GaitTemplate::from_gait(GaitType::Trot), 2.0),
    });
    mpc.add_module(CountingModule {
        counters: Arc::clone(&counters),
        reset_on_call: None,
    });
    let epoch = mpc.control().request_reset(target());
    assert_eq!(epoch, 1);

    for cycle in 0..3u32 {
        let outcome = mpc.on_observation(&observation(0.05 * f64::from(cycle))).unwrap();
        let CycleOutcome::Submitted {
            solve_id,
            submission,
            report,
        } = outcome
        else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(solve_id, u64::from(cycle));
        assert_ne!(submission, Submission::Stale);
        assert_ne!(report.status, SolverStatus::Stalled);
        assert_eq!(mpc.control().phase(), MpcPhase::Ready);
    }

    assert_eq!(counters.init.load(Ordering::SeqCst), 1);
    assert_eq!(counters.pre.load(Ordering::SeqCst), 3);
    assert_eq!(counters.post.load(Ordering::SeqCst), 3);
    assert!(mpc.gait().timeline().event_times().len() > 2);

    assert!(log.wait_until(Duration::from_secs(5), |records| {
        records.last().is_some_and(|r| r.solve_id == 2)
    }));
    let updates = log.updates();
    assert!(updates.windows(2).all(|w| w[0].solve_id < w[1].solve_id));
    assert!(updates.iter().all(|r| r.epoch == 1 && r.num_events > 0));
}

#[test]
fn reset_during_solve_discards_the_result() {
    let counters = Arc::new(Counters::default());
    let (mut mpc, log) = mpc();
    let control = mpc.control();
    mpc.add_module(CountingModule {
        counters: Arc::clone(&counters),
        reset_on_call: Some((1, Arc::clone(&control))),
    });
    control.request_reset(target());

    let first = mpc.on_observation(&observation(0.0)).unwrap();
    assert!(matches!(first, CycleOutcome::Submitted { solve_id: 0, .. }));

    // The module requests a reset while cycle 1 is solving.
    let second = mpc.on_observation(&observation(0.05)).unwrap();
    assert_eq!(second, CycleOutcome::Discarded { solve_id: 1 });
    assert_eq!(control.phase(), MpcPhase::Idle);

    let third = mpc.on_observation(&observation(0.1)).unwrap();
    assert!(matches!(third, CycleOutcome::Submitted { solve_id: 2, .. }));

    assert!(log.wait_until(Duration::from_secs(5), |records| {
        records.last().is_some_and(|r| r.solve_id == 2)
    }));
    let published: Vec<(u64, u64)> = log.updates().iter().map(|r| (r.solve_id, r.epoch)).collect();
    assert!(!published.iter().any(|&(id, _)| id == 1));
    assert_eq!(published.last(), Some(&(2, 2)));
}

#[test]
fn reset_drops_solve_waiting_for_publication() {
    let (mut mpc, log) = mpc_with_transport(RecordingTransport::with_delay(Duration::from_millis(500)));
    let control = mpc.control();
    control.request_reset(target());

    mpc.on_observation(&observation(0.0)).unwrap();
    // Solve 0 occupies the slow transport, so solve 1 stays pending.
    let second = mpc.on_observation(&observation(0.05)).unwrap();
    assert!(matches!(
        second,
        CycleOutcome::Submitted {
            solve_id: 1,
            submission: Submission::Queued,
            ..
        }
    ));
    assert!(mpc.publisher().has_pending());

    assert_eq!(control.request_reset(target()), 2);
    assert!(!mpc.publisher().has_pending());
    assert!(mpc.publisher().current().is_none());

    std::thread::sleep(Duration::from_millis(1200));
    let published: Vec<(u64, u64)> = log.records().iter().map(|r| (r.solve_id, r.epoch)).collect();
    assert_eq!(published, vec![(0, 1)]);
}

#[test]
fn overrides_apply_before_the_next_solve() {
    let (mut mpc, _log) = mpc();
    let control = mpc.control();
    control.request_reset(target());
    mpc.on_observation(&observation(0.0)).unwrap();

    let timeline = ModeTimeline::new(vec![0.3, 0.6], vec![Mode::STANCE, Mode::FL_RR, Mode::STANCE]).unwrap();
    control.override_timeline(TimelineOverride::Replace(timeline.clone()));
    let shifted = TargetTrajectory::constant(0.0, dvector![0.2, 0.0], DVector::zeros(1));
    control.override_target(shifted.clone());

    let outcome = mpc.on_observation(&observation(0.1)).unwrap();
    assert!(matches!(outcome, CycleOutcome::Submitted { solve_id: 1, .. }));
    assert_eq!(mpc.gait().timeline(), &timeline);

    let deadline = Instant::now() + Duration::from_secs(5);
    let packet = loop {
        if let Some(packet) = mpc.publisher().current().filter(|p| p.solve_id == 1) {
            break packet;
        }
        assert!(Instant::now() < deadline, "solve 1 was not published");
        std::thread::sleep(Duration::from_millis(1));
    };
    assert_eq!(packet.command.target, shifted);
    assert_eq!(packet.command.timeline, timeline);
    assert_eq!(packet.primal.timeline, timeline);
    assert_eq!(packet.command.observation.time, 0.1);
}

#[test]
fn malformed_template_override_is_reported() {
    let (mut mpc, _log) = mpc();
    let control = mpc.control();
    control.request_reset(target());
    control.override_timeline(TimelineOverride::Template {
        template: GaitTemplate::new(vec![Mode::STANCE], vec![0.0]),
        start_time: 0.0,
        final_time: 1.0,
    });
    let err = mpc.on_observation(&observation(0.0)).unwrap_err();
    assert!(err.to_string().contains("Gait template"));
    assert_eq!(control.phase(), MpcPhase::Idle);
    assert!(mpc.on_observation(&observation(0.05)).is_ok());
}
