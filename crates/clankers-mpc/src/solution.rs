//! Solver output: nominal trajectory, feedback policy and the packets handed to transport.

use std::sync::Arc;

use clankers_core::types::{Observation, TargetTrajectory, interpolate};
use nalgebra::{DMatrix, DVector};

use crate::timeline::ModeTimeline;

/// Time-varying affine feedback `u(t, x) = u_k + K_k·(x - x_k)`, held constant
/// between nodes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LinearController {
    times: Vec<f64>,
    states: Vec<DVector<f64>>,
    inputs: Vec<DVector<f64>>,
    gains: Vec<DMatrix<f64>>,
}

impl LinearController {
    /// All vectors are indexed by node and must have equal length.
    pub fn new(
        times: Vec<f64>,
        states: Vec<DVector<f64>>,
        inputs: Vec<DVector<f64>>,
        gains: Vec<DMatrix<f64>>,
    ) -> Self {
        debug_assert!(states.len() == times.len() && inputs.len() == times.len() && gains.len() == times.len());
        Self {
            times,
            states,
            inputs,
            gains,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn gains(&self) -> &[DMatrix<f64>] {
        &self.gains
    }

    pub fn input_dim(&self) -> usize {
        self.inputs.first().map_or(0, DVector::len)
    }

    /// Node whose hold interval contains `time`, clamped to the horizon.
    fn node_at(&self, time: f64) -> usize {
        self.times.partition_point(|&t| t <= time).saturating_sub(1)
    }

    /// Evaluate the policy. An empty controller returns an empty input.
    pub fn compute_input(&self, time: f64, state: &DVector<f64>) -> DVector<f64> {
        if self.is_empty() {
            return DVector::zeros(0);
        }
        let k = self.node_at(time);
        &self.inputs[k] + &self.gains[k] * (state - &self.states[k])
    }
}

/// Optimized trajectory of one solve.
#[derive(Clone, Debug, PartialEq)]
pub struct PrimalSolution {
    pub times: Vec<f64>,
    pub states: Vec<DVector<f64>>,
    /// Input applied from each node; the last entry repeats the final interval's input.
    pub inputs: Vec<DVector<f64>>,
    pub controller: LinearController,
    /// Mode timeline the trajectory was optimized against.
    pub timeline: ModeTimeline,
}

impl PrimalSolution {
    pub fn init_time(&self) -> f64 {
        self.times.first().copied().unwrap_or(0.0)
    }

    pub fn final_time(&self) -> f64 {
        self.times.last().copied().unwrap_or(0.0)
    }

    pub fn state_at(&self, time: f64) -> DVector<f64> {
        interpolate(&self.times, &self.states, time)
    }

    /// Feedback input at `(time, state)`.
    pub fn input(&self, time: f64, state: &DVector<f64>) -> DVector<f64> {
        self.controller.compute_input(time, state)
    }
}

/// Inputs the solve was computed from.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandData {
    pub observation: Observation,
    pub target: TargetTrajectory,
    pub timeline: ModeTimeline,
}

/// Published unit: a solution and the command it answers, never split.
#[derive(Clone, Debug)]
pub struct PolicyPacket {
    /// Monotonic solve counter, assigned when the solve starts.
    pub solve_id: u64,
    /// Reset epoch the solve belongs to.
    pub epoch: u64,
    pub primal: PrimalSolution,
    pub command: CommandData,
}

pub type SharedPacket = Arc<PolicyPacket>;
