//! Switched-system DDP/ILQR and real-time MPC for legged robots.
//!
//! The crate is organized around one receding-horizon cycle:
//!
//! 1. **Gait Scheduler**: a [`ModeTimeline`] of contact modes edited by
//!    [`GaitSchedule::insert_template`] and [`GaitSchedule::rewind`]
//! 2. **Foot Phase Planner**: per-leg [`FootPhase`] references (stance constraints,
//!    swing splines), planned lazily per timeline slot by a [`ModeSchedule`]
//! 3. **Riccati Backward Pass**: discrete or continuous-time value-function
//!    recursion with PSD correction and constraint-projected gains
//! 4. **Forward Pass**: nonlinear rollout with backtracking line search inside
//!    [`DdpSolver`]
//! 5. **Real-Time Wrapper**: [`RealtimeMpc`] drives cycles and hands results to a
//!    [`PolicyPublisher`] thread that publishes only the latest solve
//!
//! # Architecture
//!
//! The solver never looks at physics. A [`SystemModel`] supplies flow map, cost and
//! their linear-quadratic approximation; it can query the active mode and foot
//! references through the [`NodeContext`] it receives. The horizon is split into
//! partitions aligned to mode switches; the backward pass visits partitions from
//! last to first and parallelizes per-node work inside each on a rayon pool.

pub mod continuous;
pub mod ddp;
pub mod foot_phase;
pub mod foothold;
pub mod model;
pub mod partition;
pub mod publisher;
pub mod realtime;
pub mod riccati;
pub mod schedule;
pub mod solution;
pub mod terrain;
pub mod timeline;

pub use ddp::{DdpSolution, DdpSolver, Partitioning, Problem, SolverReport, SolverStatus};
pub use foot_phase::{
    FootNormalConstraint, FootPhase, FootTangentialConstraint, StancePhase, SwingEvent, SwingPhase,
};
pub use foothold::{BodyReference, FootholdPlanner, LegPhases, raibert_foot_target};
pub use model::{
    LinearConstraint, LinearQuadraticApproximation, NodeContext, QuadraticCost, SystemModel,
};
pub use partition::{PartitionPlan, TimeGrid};
pub use publisher::{CancellationToken, PolicyPublisher, PolicyTransport, PublisherGate, Submission};
pub use realtime::{
    CycleOutcome, ModeSequenceInitializer, MpcControl, MpcPhase, RealtimeMpc, SynchronizedModule,
    TemplateInitializer, TimelineOverride,
};
pub use riccati::{NodePolicy, ValueFunction, psd_correction};
pub use schedule::{ModeSchedule, PhaseView};
pub use solution::{CommandData, LinearController, PolicyPacket, PrimalSolution, SharedPacket};
pub use terrain::{ConvexTerrain, PlanarTerrain, TerrainModel, TerrainPlane};
pub use timeline::{GaitSchedule, GaitTemplate, GaitType, ModeTimeline};
