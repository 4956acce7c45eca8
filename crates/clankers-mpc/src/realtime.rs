//! Real-time MPC wrapper.
//!
//! [`RealtimeMpc::on_observation`] runs one receding-horizon cycle on the calling
//! thread: apply a pending reset and overrides, synchronize the hybrid-system
//! collaborators, solve, and hand the result to the [`PolicyPublisher`].
//! [`MpcControl`] is the thread-safe handle for everything arriving asynchronously:
//! reset requests, mode-sequence overrides and target overrides. They take effect at
//! the start of the next cycle.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use clankers_core::config::{MpcSettings, MpcStackConfig};
use clankers_core::error::{MpcError, SolverError, TimelineError};
use clankers_core::types::{Observation, TargetTrajectory};
use tracing::{debug, info, warn};

use crate::ddp::{DdpSolver, Partitioning, Problem, SolverReport};
use crate::foothold::FootholdPlanner;
use crate::model::SystemModel;
use crate::publisher::{CancellationToken, PolicyPublisher, PolicyTransport, PublisherGate, Submission};
use crate::schedule::ModeSchedule;
use crate::solution::{CommandData, PolicyPacket, PrimalSolution};
use crate::terrain::TerrainModel;
use crate::timeline::{GaitSchedule, GaitTemplate, ModeTimeline};

/// Cycle state, readable from any thread through [`MpcControl::phase`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MpcPhase {
    Idle = 0,
    Solving = 1,
    Ready = 2,
}

impl MpcPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Solving,
            2 => Self::Ready,
            _ => Self::Idle,
        }
    }
}

/// Asynchronous mode-sequence edit applied before the next solve.
#[derive(Clone, Debug, PartialEq)]
pub enum TimelineOverride {
    /// Replace the whole timeline.
    Replace(ModeTimeline),
    /// Insert a gait template, as [`GaitSchedule::insert_template`].
    Template {
        template: GaitTemplate,
        start_time: f64,
        final_time: f64,
    },
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Thread-safe control surface of a [`RealtimeMpc`].
#[derive(Debug)]
pub struct MpcControl {
    gate: PublisherGate,
    reset: Mutex<Option<TargetTrajectory>>,
    epoch: AtomicU64,
    timeline_override: Mutex<Option<TimelineOverride>>,
    target_override: Mutex<Option<TargetTrajectory>>,
    phase: AtomicU8,
}

impl MpcControl {
    fn new(gate: PublisherGate) -> Self {
        Self {
            gate,
            reset: Mutex::default(),
            epoch: AtomicU64::new(0),
            timeline_override: Mutex::default(),
            target_override: Mutex::default(),
            phase: AtomicU8::new(MpcPhase::Idle as u8),
        }
    }

    /// Request a reset with a new initial target. Returns the new epoch as the
    /// acknowledgement.
    ///
    /// Solves of older epochs waiting for publication are dropped immediately and
    /// later ones are refused, so only a publication already in progress can still
    /// reach the transport.
    pub fn request_reset(&self, target: TargetTrajectory) -> u64 {
        let mut reset = lock(&self.reset);
        *reset = Some(target);
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.gate.retire(epoch);
        self.phase.store(MpcPhase::Idle as u8, Ordering::Release);
        info!(epoch, "mpc reset requested");
        epoch
    }

    /// Latest-wins: a newer override replaces one not yet applied.
    pub fn override_timeline(&self, edit: TimelineOverride) {
        *lock(&self.timeline_override) = Some(edit);
    }

    pub fn override_target(&self, target: TargetTrajectory) {
        *lock(&self.target_override) = Some(target);
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> MpcPhase {
        MpcPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: MpcPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Pending reset together with the epoch it belongs to.
    fn take_reset(&self) -> Option<(TargetTrajectory, u64)> {
        let mut reset = lock(&self.reset);
        reset.take().map(|target| (target, self.epoch()))
    }

    fn take_timeline_override(&self) -> Option<TimelineOverride> {
        lock(&self.timeline_override).take()
    }

    fn take_target_override(&self) -> Option<TargetTrajectory> {
        lock(&self.target_override).take()
    }
}

/// Hybrid-system collaborator kept consistent with each solve.
///
/// Both hooks run exactly once per cycle on the cycle thread.
pub trait SynchronizedModule: Send {
    fn pre_solve(
        &mut self,
        init_time: f64,
        final_time: f64,
        observation: &Observation,
        gait: &mut GaitSchedule,
    ) -> Result<(), TimelineError>;

    fn post_solve(&mut self, _primal: &PrimalSolution) {}
}

/// Seeds the mode sequence once after every reset.
pub trait ModeSequenceInitializer: Send {
    fn initialize(
        &mut self,
        observation: &Observation,
        target: &TargetTrajectory,
        gait: &mut GaitSchedule,
    ) -> Result<(), TimelineError>;
}

/// Initializer inserting a fixed gait template from the observation time onward.
#[derive(Clone, Debug)]
pub struct TemplateInitializer {
    template: GaitTemplate,
    horizon: f64,
}

impl TemplateInitializer {
    pub fn new(template: GaitTemplate, horizon: f64) -> Self {
        Self { template, horizon }
    }
}

impl ModeSequenceInitializer for TemplateInitializer {
    fn initialize(
        &mut self,
        observation: &Observation,
        _target: &TargetTrajectory,
        gait: &mut GaitSchedule,
    ) -> Result<(), TimelineError> {
        let start = gait
            .timeline()
            .last_event_time()
            .map_or(observation.time, |t| t.max(observation.time));
        gait.insert_template(self.template.clone(), start, start + self.horizon)
    }
}

/// Result of one [`RealtimeMpc::on_observation`] call.
#[derive(Clone, Debug, PartialEq)]
pub enum CycleOutcome {
    /// No reset has provided a target yet; nothing was solved.
    AwaitingReset,
    /// A reset arrived while solving; the result was thrown away.
    Discarded { solve_id: u64 },
    /// Handed to the publisher.
    Submitted {
        solve_id: u64,
        submission: Submission,
        report: SolverReport,
    },
}

/// Receding-horizon MPC loop around a [`DdpSolver`].
pub struct RealtimeMpc {
    solver: DdpSolver,
    model: Arc<dyn SystemModel>,
    planner: FootholdPlanner,
    gait: GaitSchedule,
    settings: MpcSettings,
    control: Arc<MpcControl>,
    publisher: PolicyPublisher,
    modules: Vec<Box<dyn SynchronizedModule>>,
    initializer: Option<Box<dyn ModeSequenceInitializer>>,
    target: Option<TargetTrajectory>,
    warm_start: Option<PrimalSolution>,
    epoch: u64,
    needs_init: bool,
    next_solve_id: u64,
}

impl std::fmt::Debug for RealtimeMpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeMpc")
            .field("solver", &self.solver)
            .field("settings", &self.settings)
            .field("epoch", &self.epoch)
            .field("next_solve_id", &self.next_solve_id)
            .finish_non_exhaustive()
    }
}

impl RealtimeMpc {
    /// Build the wrapper and spawn its publishing thread.
    pub fn new<T: PolicyTransport>(
        config: &MpcStackConfig,
        model: Arc<dyn SystemModel>,
        terrain: Arc<dyn TerrainModel>,
        transport: T,
    ) -> Result<Self, MpcError> {
        config.validate()?;
        let solver = DdpSolver::new(config.ddp.clone())?;
        let heartbeat = config.mpc.publish_heartbeat_ms.map(Duration::from_millis);
        let publisher = PolicyPublisher::spawn(transport, heartbeat, CancellationToken::new())
            .map_err(|e| SolverError::WorkerPool(e.to_string()))?;
        Ok(Self {
            solver,
            model,
            planner: FootholdPlanner::new(terrain, config.swing.clone(), config.stance.clone()),
            gait: GaitSchedule::new(&config.gait),
            settings: config.mpc.clone(),
            control: Arc::new(MpcControl::new(publisher.gate())),
            publisher,
            modules: Vec::new(),
            initializer: None,
            target: None,
            warm_start: None,
            epoch: 0,
            needs_init: false,
            next_solve_id: 0,
        })
    }

    #[must_use]
    pub fn with_initializer(mut self, initializer: impl ModeSequenceInitializer + 'static) -> Self {
        self.initializer = Some(Box::new(initializer));
        self
    }

    pub fn add_module(&mut self, module: impl SynchronizedModule + 'static) {
        self.modules.push(Box::new(module));
    }

    pub fn control(&self) -> Arc<MpcControl> {
        Arc::clone(&self.control)
    }

    pub fn gait(&self) -> &GaitSchedule {
        &self.gait
    }

    pub fn publisher(&self) -> &PolicyPublisher {
        &self.publisher
    }

    pub fn solver(&self) -> &DdpSolver {
        &self.solver
    }

    /// Run one MPC cycle for `observation`.
    ///
    /// Errors are contract violations (bad dimensions, malformed overrides); the
    /// cycle state returns to idle and nothing is published.
    pub fn on_observation(&mut self, observation: &Observation) -> Result<CycleOutcome, MpcError> {
        let result = self.run_cycle(observation);
        if result.is_err() {
            self.control.set_phase(MpcPhase::Idle);
        }
        result
    }

    fn run_cycle(&mut self, observation: &Observation) -> Result<CycleOutcome, MpcError> {
        if let Some((target, epoch)) = self.control.take_reset() {
            info!(epoch, "mpc reset applied");
            self.publisher.clear(epoch);
            self.target = Some(target);
            self.warm_start = None;
            self.epoch = epoch;
            self.needs_init = true;
        }
        self.apply_overrides()?;

        let Some(target) = self.target.clone() else {
            return Ok(CycleOutcome::AwaitingReset);
        };
        let epoch = self.epoch;

        if self.needs_init {
            if let Some(initializer) = self.initializer.as_mut() {
                initializer.initialize(observation, &target, &mut self.gait)?;
                info!(time = observation.time, "mode sequence initialized");
            }
            self.needs_init = false;
        }

        self.control.set_phase(MpcPhase::Solving);
        let init_time = observation.time;
        let final_time = init_time + self.settings.time_horizon;
        self.gait.rewind(init_time, final_time)?;
        for module in &mut self.modules {
            module.pre_solve(init_time, final_time, observation, &mut self.gait)?;
        }

        let solve_id = self.next_solve_id;
        self.next_solve_id += 1;
        let timeline = self.gait.timeline().clone();
        let schedule = ModeSchedule::new(
            timeline.clone(),
            self.planner.clone(),
            self.model.body_reference(observation),
        );
        let problem = Problem {
            init_time,
            final_time,
            init_state: &observation.state,
            schedule: &schedule,
            target: &target,
        };
        let warm = self.warm_start.as_ref().map(|p| &p.controller);
        let solution = self.solver.solve(
            self.model.as_ref(),
            &problem,
            &Partitioning::Even(self.settings.num_partitions),
            warm,
        )?;
        debug!(
            solve_id,
            status = ?solution.report.status,
            iterations = solution.report.iterations,
            cost = solution.report.cost,
            "mpc solve finished"
        );

        for module in &mut self.modules {
            module.post_solve(&solution.primal);
        }

        if self.control.epoch() != epoch {
            warn!(solve_id, "solve superseded by reset, discarding");
            self.control.set_phase(MpcPhase::Idle);
            return Ok(CycleOutcome::Discarded { solve_id });
        }

        self.warm_start = Some(solution.primal.clone());
        let packet = Arc::new(PolicyPacket {
            solve_id,
            epoch,
            primal: solution.primal,
            command: CommandData {
                observation: observation.clone(),
                target,
                timeline,
            },
        });
        let submission = self.publisher.submit(packet);
        self.control.set_phase(MpcPhase::Ready);
        Ok(CycleOutcome::Submitted {
            solve_id,
            submission,
            report: solution.report,
        })
    }

    fn apply_overrides(&mut self) -> Result<(), MpcError> {
        if let Some(target) = self.control.take_target_override() {
            debug!("target trajectory override applied");
            self.target = Some(target);
        }
        match self.control.take_timeline_override() {
            Some(TimelineOverride::Replace(timeline)) => {
                debug!(phases = timeline.num_phases(), "timeline replaced");
                self.gait.set_timeline(timeline);
            }
            Some(TimelineOverride::Template {
                template,
                start_time,
                final_time,
            }) => {
                self.gait.insert_template(template, start_time, final_time)?;
            }
            None => {}
        }
        Ok(())
    }
}
