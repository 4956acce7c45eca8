//! System model collaborator: dynamics, cost and constraints of the switched system.
//!
//! The solver never inspects the physics. It evaluates the model along the nominal
//! trajectory and asks for a linear-quadratic approximation at each node.

use clankers_core::error::TimelineError;
use clankers_core::types::{Mode, Observation, TargetTrajectory};
use nalgebra::{DMatrix, DVector};

use crate::foothold::{BodyReference, LegPhases};
use crate::schedule::ModeSchedule;

/// Everything a model may depend on at one time node.
#[derive(Clone, Copy, Debug)]
pub struct NodeContext<'a> {
    pub time: f64,
    pub mode: Mode,
    pub phase_index: usize,
    pub target: &'a TargetTrajectory,
    schedule: &'a ModeSchedule,
}

impl<'a> NodeContext<'a> {
    /// Context at `time`, with the mode taken from `schedule`.
    pub fn new(time: f64, schedule: &'a ModeSchedule, target: &'a TargetTrajectory) -> Self {
        let phase_index = schedule.timeline().phase_index_at(time);
        Self {
            time,
            mode: schedule.timeline().modes()[phase_index],
            phase_index,
            target,
            schedule,
        }
    }

    /// Foot references of the active phase, planned on first use.
    pub fn foot_phases(&self) -> Result<&'a LegPhases, TimelineError> {
        self.schedule.phase(self.phase_index).map(|view| view.legs)
    }

    pub fn schedule(&self) -> &'a ModeSchedule {
        self.schedule
    }
}

/// Linear state-input equality constraint `C·δx + D·δu + e = 0`.
#[derive(Clone, Debug, PartialEq)]
pub struct LinearConstraint {
    pub c: DMatrix<f64>,
    pub d: DMatrix<f64>,
    /// Constraint value at the linearization point.
    pub e: DVector<f64>,
}

impl LinearConstraint {
    pub fn num_constraints(&self) -> usize {
        self.e.len()
    }
}

/// Linear-quadratic approximation around one nominal node.
///
/// Dynamics: `δẋ = A·δx + B·δu`. Cost rate:
/// `q + Qvᵀδx + Rvᵀδu + ½δxᵀQm·δx + ½δuᵀRm·δu + δuᵀPm·δx`.
#[derive(Clone, Debug, PartialEq)]
pub struct LinearQuadraticApproximation {
    pub a: DMatrix<f64>,
    pub b: DMatrix<f64>,
    pub q: f64,
    pub qv: DVector<f64>,
    pub qm: DMatrix<f64>,
    pub rv: DVector<f64>,
    pub rm: DMatrix<f64>,
    pub pm: DMatrix<f64>,
    pub constraint: Option<LinearConstraint>,
}

impl LinearQuadraticApproximation {
    /// Zero dynamics and cost with the given dimensions.
    pub fn zeros(state_dim: usize, input_dim: usize) -> Self {
        Self {
            a: DMatrix::zeros(state_dim, state_dim),
            b: DMatrix::zeros(state_dim, input_dim),
            q: 0.0,
            qv: DVector::zeros(state_dim),
            qm: DMatrix::zeros(state_dim, state_dim),
            rv: DVector::zeros(input_dim),
            rm: DMatrix::zeros(input_dim, input_dim),
            pm: DMatrix::zeros(input_dim, state_dim),
            constraint: None,
        }
    }

    /// Euler discretization over `dt`: `A_d = I + A·dt`, `B_d = B·dt`, cost terms scaled by `dt`.
    #[must_use]
    pub fn discretize(&self, dt: f64) -> Self {
        let n = self.a.nrows();
        Self {
            a: DMatrix::identity(n, n) + &self.a * dt,
            b: &self.b * dt,
            q: self.q * dt,
            qv: &self.qv * dt,
            qm: &self.qm * dt,
            rv: &self.rv * dt,
            rm: &self.rm * dt,
            pm: &self.pm * dt,
            constraint: self.constraint.clone(),
        }
    }
}

/// Quadratic terminal cost `s + Svᵀδx + ½δxᵀSm·δx`.
#[derive(Clone, Debug, PartialEq)]
pub struct QuadraticCost {
    pub s: f64,
    pub sv: DVector<f64>,
    pub sm: DMatrix<f64>,
}

/// Dynamics, cost and constraints of the controlled system.
///
/// Implementations must be deterministic: the solver treats every method as a pure
/// function of its arguments.
pub trait SystemModel: Send + Sync {
    fn state_dim(&self) -> usize;

    fn input_dim(&self) -> usize;

    /// Continuous-time flow `ẋ = f(x, u)` in the active mode.
    fn flow_map(&self, ctx: &NodeContext<'_>, state: &DVector<f64>, input: &DVector<f64>) -> DVector<f64>;

    /// Running cost rate.
    fn cost(&self, ctx: &NodeContext<'_>, state: &DVector<f64>, input: &DVector<f64>) -> f64;

    fn terminal_cost(&self, ctx: &NodeContext<'_>, state: &DVector<f64>) -> f64;

    /// Linear-quadratic approximation of flow, cost and equality constraints.
    fn linearize(
        &self,
        ctx: &NodeContext<'_>,
        state: &DVector<f64>,
        input: &DVector<f64>,
    ) -> LinearQuadraticApproximation;

    fn terminal_quadratic(&self, ctx: &NodeContext<'_>, state: &DVector<f64>) -> QuadraticCost;

    /// Input used where no previous policy is available.
    fn operating_input(&self, ctx: &NodeContext<'_>, _state: &DVector<f64>) -> DVector<f64> {
        ctx.target.input_at(ctx.time)
    }

    /// Body state used to plan footholds for a new observation.
    fn body_reference(&self, observation: &Observation) -> BodyReference;
}
