//! Test systems implementing [`SystemModel`].

use std::sync::Arc;

use clankers_core::types::{NUM_LEGS, Observation};
use clankers_mpc::foothold::{BodyReference, FootholdPlanner};
use clankers_mpc::model::{LinearConstraint, LinearQuadraticApproximation, NodeContext, QuadraticCost, SystemModel};
use clankers_mpc::schedule::ModeSchedule;
use clankers_mpc::timeline::ModeTimeline;
use nalgebra::{DMatrix, DVector, Vector3, dmatrix};

/// Hip positions of a small quadruped standing at the origin, ordered [FL, FR, RL, RR].
pub fn default_hips() -> [Vector3<f64>; NUM_LEGS] {
    [
        Vector3::new(0.2, 0.1, 0.3),
        Vector3::new(0.2, -0.1, 0.3),
        Vector3::new(-0.2, 0.1, 0.3),
        Vector3::new(-0.2, -0.1, 0.3),
    ]
}

/// Snapshot of `timeline` planned with `planner` around a standing body.
pub fn schedule_for(timeline: ModeTimeline, planner: FootholdPlanner, time: f64) -> Arc<ModeSchedule> {
    ModeSchedule::new(timeline, planner, BodyReference::standing(time, default_hips(), 0.3))
}

/// Positive root of the scalar DARE `b²S² + (r - qb² - a²r)S - qr = 0`.
pub fn scalar_dare(a: f64, b: f64, q: f64, r: f64) -> f64 {
    let c1 = r - q * b * b - a * a * r;
    (-c1 + (c1 * c1 + 4.0 * b * b * q * r).sqrt()) / (2.0 * b * b)
}

/// Positive root of the scalar CARE `2aS - b²S²/r + q = 0`.
pub fn scalar_care(a: f64, b: f64, q: f64, r: f64) -> f64 {
    r * (a + (a * a + b * b * q / r).sqrt()) / (b * b)
}

// ---------------------------------------------------------------------------
// LinearSystem
// ---------------------------------------------------------------------------

/// Time-invariant `ẋ = Ax + Bu` tracking the target with cost
/// `½δxᵀQδx + ½δuᵀRδu` and terminal cost `½δxᵀQfδx`.
#[derive(Clone, Debug)]
pub struct LinearSystem {
    pub a: DMatrix<f64>,
    pub b: DMatrix<f64>,
    pub q: DMatrix<f64>,
    pub r: DMatrix<f64>,
    pub qf: DMatrix<f64>,
}

impl LinearSystem {
    pub fn scalar(a: f64, b: f64, q: f64, r: f64) -> Self {
        Self {
            a: dmatrix![a],
            b: dmatrix![b],
            q: dmatrix![q],
            r: dmatrix![r],
            qf: dmatrix![0.0],
        }
    }

    /// Unit-mass double integrator with position and velocity state.
    pub fn double_integrator() -> Self {
        Self {
            a: dmatrix![0.0, 1.0; 0.0, 0.0],
            b: dmatrix![0.0; 1.0],
            q: DMatrix::from_diagonal(&DVector::from_vec(vec![10.0, 1.0])),
            r: dmatrix![0.1],
            qf: DMatrix::from_diagonal(&DVector::from_vec(vec![10.0, 1.0])),
        }
    }

    fn deviations(
        &self,
        ctx: &NodeContext<'_>,
        state: &DVector<f64>,
        input: &DVector<f64>,
    ) -> (DVector<f64>, DVector<f64>) {
        (state - ctx.target.state_at(ctx.time), input - ctx.target.input_at(ctx.time))
    }
}

impl SystemModel for LinearSystem {
    fn state_dim(&self) -> usize {
        self.a.nrows()
    }

    fn input_dim(&self) -> usize {
        self.b.ncols()
    }

    fn flow_map(&self, _ctx: &NodeContext<'_>, state: &DVector<f64>, input: &DVector<f64>) -> DVector<f64> {
        &self.a * state + &self.b * input
    }

    fn cost(&self, ctx: &NodeContext<'_>, state: &DVector<f64>, input: &DVector<f64>) -> f64 {
        let (dx, du) = self.deviations(ctx, state, input);
        0.5 * dx.dot(&(&self.q * &dx)) + 0.5 * du.dot(&(&self.r * &du))
    }

    fn terminal_cost(&self, ctx: &NodeContext<'_>, state: &DVector<f64>) -> f64 {
        let dx = state - ctx.target.state_at(ctx.time);
        0.5 * dx.dot(&(&self.qf * &dx))
    }

    fn linearize(
        &self,
        ctx: &NodeContext<'_>,
        state: &DVector<f64>,
        input: &DVector<f64>,
    ) -> LinearQuadraticApproximation {
        let (dx, du) = self.deviations(ctx, state, input);
        LinearQuadraticApproximation {
            a: self.a.clone(),
            b: self.b.clone(),
            q: self.cost(ctx, state, input),
            qv: &self.q * dx,
            qm: self.q.clone(),
            rv: &self.r * du,
            rm: self.r.clone(),
            pm: DMatrix::zeros(self.b.ncols(), self.a.nrows()),
            constraint: None,
        }
    }

    fn terminal_quadratic(&self, ctx: &NodeContext<'_>, state: &DVector<f64>) -> QuadraticCost {
        let dx = state - ctx.target.state_at(ctx.time);
        QuadraticCost {
            s: self.terminal_cost(ctx, state),
            sv: &self.qf * dx,
            sm: self.qf.clone(),
        }
    }

    fn body_reference(&self, observation: &Observation) -> BodyReference {
        BodyReference::standing(observation.time, default_hips(), 0.3)
    }
}

// ---------------------------------------------------------------------------
// PointFootModel
// ---------------------------------------------------------------------------

/// Front-left foot as a velocity-controlled point: state `p ∈ R³`, input `v ∈ R³`.
///
/// Tracks the planned foot position and velocity of leg 0 and carries its
/// normal-direction constraint as a state-input equality constraint.
#[derive(Clone, Debug)]
pub struct PointFootModel {
    pub position_weight: f64,
    pub velocity_weight: f64,
}

impl Default for PointFootModel {
    fn default() -> Self {
        Self {
            position_weight: 10.0,
            velocity_weight: 1.0,
        }
    }
}

impl PointFootModel {
    const LEG: usize = 0;

    fn references(&self, ctx: &NodeContext<'_>) -> (DVector<f64>, DVector<f64>) {
        match ctx.foot_phases() {
            Ok(legs) => {
                let leg = &legs[Self::LEG];
                let p = leg.position(ctx.time);
                let v = leg.velocity(ctx.time);
                (DVector::from_column_slice(p.as_slice()), DVector::from_column_slice(v.as_slice()))
            }
            Err(_) => (DVector::zeros(3), DVector::zeros(3)),
        }
    }
}

impl SystemModel for PointFootModel {
    fn state_dim(&self) -> usize {
        3
    }

    fn input_dim(&self) -> usize {
        3
    }

    fn flow_map(&self, _ctx: &NodeContext<'_>, _state: &DVector<f64>, input: &DVector<f64>) -> DVector<f64> {
        input.clone()
    }

    fn cost(&self, ctx: &NodeContext<'_>, state: &DVector<f64>, input: &DVector<f64>) -> f64 {
        let (p_ref, v_ref) = self.references(ctx);
        0.5 * self.position_weight * (state - p_ref).norm_squared()
            + 0.5 * self.velocity_weight * (input - v_ref).norm_squared()
    }

    fn terminal_cost(&self, ctx: &NodeContext<'_>, state: &DVector<f64>) -> f64 {
        let (p_ref, _) = self.references(ctx);
        0.5 * self.position_weight * (state - p_ref).norm_squared()
    }

    fn linearize(
        &self,
        ctx: &NodeContext<'_>,
        state: &DVector<f64>,
        input: &DVector<f64>,
    ) -> LinearQuadraticApproximation {
        let (p_ref, v_ref) = self.references(ctx);
        let mut lq = LinearQuadraticApproximation::zeros(3, 3);
        lq.b = DMatrix::identity(3, 3);
        lq.q = self.cost(ctx, state, input);
        lq.qv = (state - p_ref) * self.position_weight;
        lq.qm = DMatrix::identity(3, 3) * self.position_weight;
        lq.rv = (input - v_ref) * self.velocity_weight;
        lq.rm = DMatrix::identity(3, 3) * self.velocity_weight;

        if let Ok(legs) = ctx.foot_phases() {
            let constraint = legs[Self::LEG].normal_constraint(ctx.time);
            let p = Vector3::new(state[0], state[1], state[2]);
            let v = Vector3::new(input[0], input[1], input[2]);
            lq.constraint = Some(LinearConstraint {
                c: DMatrix::from_row_slice(1, 3, constraint.position_matrix.as_slice()),
                d: DMatrix::from_row_slice(1, 3, constraint.velocity_matrix.as_slice()),
                e: DVector::from_element(1, constraint.value(&p, &v)),
            });
        }
        lq
    }

    fn terminal_quadratic(&self, ctx: &NodeContext<'_>, state: &DVector<f64>) -> QuadraticCost {
        let (p_ref, _) = self.references(ctx);
        QuadraticCost {
            s: self.terminal_cost(ctx, state),
            sv: (state - p_ref) * self.position_weight,
            sm: DMatrix::identity(3, 3) * self.position_weight,
        }
    }

    fn operating_input(&self, _ctx: &NodeContext<'_>, _state: &DVector<f64>) -> DVector<f64> {
        DVector::zeros(3)
    }

    /// Standing body whose front-left foot is at the observed point.
    fn body_reference(&self, observation: &Observation) -> BodyReference {
        let mut reference = BodyReference::standing(observation.time, default_hips(), 0.3);
        if observation.state.len() == 3 {
            reference.foot_positions[Self::LEG] =
                Vector3::new(observation.state[0], observation.state[1], observation.state[2]);
        }
        reference
    }
}
