//! DDP/ILQR solver for the switched system.
//!
//! Each iteration linearizes the model along the nominal trajectory, runs the
//! Riccati backward pass over the partitions from last to first, and rolls the
//! nonlinear dynamics forward under the new policy with a backtracking line search.
//! A step is accepted when the actual cost reduction reaches a fraction of the
//! reduction the quadratic model predicts. Rejected steps raise the Levenberg-Marquardt
//! regularization of the input Hessian; accepted ones lower it.

use clankers_core::config::{BackwardPassKind, DdpSettings};
use clankers_core::error::{MpcError, SolverError};
use clankers_core::types::TargetTrajectory;
use nalgebra::{DMatrix, DVector};
use rayon::ThreadPool;
use rayon::prelude::*;
use tracing::{debug, trace, warn};

use crate::continuous::integrate_segment;
use crate::model::{LinearQuadraticApproximation, NodeContext, QuadraticCost, SystemModel};
use crate::partition::{PartitionPlan, TimeGrid};
use crate::riccati::{NodePolicy, ValueFunction, riccati_step};
use crate::schedule::ModeSchedule;
use crate::solution::{LinearController, PrimalSolution};

/// First non-zero regularization tried when the configured minimum is zero.
const MIN_REGULARIZATION_STEP: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Problem and report types
// ---------------------------------------------------------------------------

/// One optimal control problem over `[init_time, final_time]`.
#[derive(Clone, Copy, Debug)]
pub struct Problem<'a> {
    pub init_time: f64,
    pub final_time: f64,
    pub init_state: &'a DVector<f64>,
    pub schedule: &'a ModeSchedule,
    pub target: &'a TargetTrajectory,
}

/// How the horizon is split for the backward pass.
#[derive(Clone, Debug, PartialEq)]
pub enum Partitioning {
    /// Up to this many partitions, snapped to mode switches.
    Even(usize),
    /// Explicit boundary times; interior ones must be mode switches.
    Boundaries(Vec<f64>),
}

/// Outcome quality of a solve. Every status carries a usable policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolverStatus {
    /// Predicted improvement and constraint violation are within tolerance.
    Converged,
    /// The iteration budget ran out; the best iterate is returned.
    IterationLimit,
    /// Regularization exceeded its maximum without finding an acceptable step.
    Stalled,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SolverReport {
    pub status: SolverStatus,
    pub iterations: usize,
    /// Cost of the returned nominal trajectory.
    pub cost: f64,
    /// Cost-to-go at the initial node predicted by the last backward pass.
    pub predicted_cost: f64,
    /// Largest equality-constraint violation along the returned trajectory.
    pub constraint_violation: f64,
    /// Order in which the last backward pass processed the partitions.
    pub partition_order: Vec<usize>,
    /// Regularization in effect at exit.
    pub regularization: f64,
}

#[derive(Clone, Debug)]
pub struct DdpSolution {
    pub primal: PrimalSolution,
    pub report: SolverReport,
}

// ---------------------------------------------------------------------------
// Internal iterates
// ---------------------------------------------------------------------------

/// Nominal trajectory: `states` per node, `inputs` per interval.
#[derive(Clone, Debug)]
struct Rollout {
    states: Vec<DVector<f64>>,
    inputs: Vec<DVector<f64>>,
    cost: f64,
}

impl Rollout {
    fn is_finite(&self) -> bool {
        self.cost.is_finite() && self.states.iter().all(|x| x.iter().all(|v| v.is_finite()))
    }
}

/// Model approximation along one nominal trajectory.
struct Linearization {
    /// Continuous-time approximation per interval.
    continuous: Vec<LinearQuadraticApproximation>,
    /// Euler-discretized approximation per interval.
    discrete: Vec<LinearQuadraticApproximation>,
    terminal: QuadraticCost,
    constraint_violation: f64,
}

struct BackwardPass {
    values: Vec<ValueFunction>,
    policies: Vec<NodePolicy>,
    d1: f64,
    d2: f64,
    partition_order: Vec<usize>,
}

impl BackwardPass {
    /// Cost reduction predicted by the quadratic model for step length `alpha`.
    fn expected_reduction(&self, alpha: f64) -> f64 {
        -(alpha * self.d1 + 0.5 * alpha * alpha * self.d2)
    }
}

// ---------------------------------------------------------------------------
// Solver
// ---------------------------------------------------------------------------

/// DDP/ILQR solver owning a bounded worker pool.
pub struct DdpSolver {
    settings: DdpSettings,
    pool: ThreadPool,
}

impl std::fmt::Debug for DdpSolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DdpSolver")
            .field("settings", &self.settings)
            .field("threads", &self.pool.current_num_threads())
            .finish()
    }
}

impl DdpSolver {
    pub fn new(settings: DdpSettings) -> Result<Self, MpcError> {
        settings.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.num_threads)
            .thread_name(|i| format!("ddp-worker-{i}"))
            .build()
            .map_err(|e| SolverError::WorkerPool(e.to_string()))?;
        Ok(Self { settings, pool })
    }

    pub fn settings(&self) -> &DdpSettings {
        &self.settings
    }

    /// Worker pool shared by the backward pass and foot-phase prefetching.
    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }

    /// Node grid of `problem`, including every mode switch inside the horizon.
    pub fn time_grid(&self, problem: &Problem<'_>) -> Result<TimeGrid, SolverError> {
        let events = problem
            .schedule
            .timeline()
            .event_times_between(problem.init_time, problem.final_time);
        TimeGrid::new(problem.init_time, problem.final_time, self.settings.time_step, events)
    }

    /// Optimize `problem`, starting from `warm_start` when it matches the input dimension.
    ///
    /// Only fails on malformed input or when the initial rollout is not finite.
    /// Running out of iterations or regularization still returns the best iterate.
    pub fn solve(
        &self,
        model: &dyn SystemModel,
        problem: &Problem<'_>,
        partitioning: &Partitioning,
        warm_start: Option<&LinearController>,
    ) -> Result<DdpSolution, MpcError> {
        let nx = model.state_dim();
        let nu = model.input_dim();
        check_dim("initial state", nx, problem.init_state.len())?;
        check_dim("target state", nx, problem.target.state_dim())?;
        check_dim("target input", nu, problem.target.input_dim())?;

        let grid = self.time_grid(problem)?;
        let plan = match partitioning {
            Partitioning::Even(n) => PartitionPlan::aligned(&grid, *n),
            Partitioning::Boundaries(b) => PartitionPlan::new(b.clone(), &grid)?,
        };
        let contexts: Vec<NodeContext<'_>> = grid
            .times()
            .iter()
            .map(|&t| NodeContext::new(t, problem.schedule, problem.target))
            .collect();

        let mut phases: Vec<usize> = contexts.iter().map(|c| c.phase_index).collect();
        phases.dedup();
        problem.schedule.prefetch(&self.pool, &phases)?;

        let warm_start = warm_start.filter(|c| !c.is_empty() && c.input_dim() == nu);
        let mut nominal = initial_rollout(model, &contexts, &grid, problem.init_state, warm_start);
        if !nominal.is_finite() {
            return Err(SolverError::Diverged.into());
        }

        let reg = &self.settings.regularization;
        let ls = &self.settings.line_search;
        let mut mu = reg.initial;
        let mut status = SolverStatus::IterationLimit;
        let mut iterations = 0;
        let mut gains: Vec<DMatrix<f64>> = vec![DMatrix::zeros(nu, nx); grid.len() - 1];
        let mut predicted_cost = nominal.cost;
        let mut partition_order = Vec::new();
        let mut violation = f64::INFINITY;

        while iterations < self.settings.max_iterations {
            iterations += 1;
            let linear = self.linearize(model, &contexts, &grid, &plan, &nominal)?;
            violation = linear.constraint_violation;

            let Some(backward) = self.regularized_backward_pass(&linear, &grid, &plan, &contexts, &mut mu) else {
                status = SolverStatus::Stalled;
                break;
            };
            gains = backward.policies.iter().map(|p| p.gain.clone()).collect();
            predicted_cost = backward.values[0].s;
            partition_order.clone_from(&backward.partition_order);

            let expected = backward.expected_reduction(1.0);
            if expected.abs() <= self.settings.min_relative_cost * nominal.cost.abs().max(1.0)
                && violation <= self.settings.constraint_tolerance
            {
                status = SolverStatus::Converged;
                break;
            }

            let mut alpha = 1.0;
            let mut accepted = None;
            while alpha >= ls.min_step_length {
                let candidate = rollout(model, &contexts, &grid, problem.init_state, &nominal, &backward, alpha);
                if candidate.is_finite() {
                    let actual = nominal.cost - candidate.cost;
                    let expected = backward.expected_reduction(alpha);
                    trace!(alpha, actual, expected, "line search");
                    if expected <= 0.0 {
                        if actual >= 0.0 {
                            accepted = Some((alpha, candidate));
                        }
                        break;
                    }
                    if actual >= ls.armijo_coefficient * expected {
                        accepted = Some((alpha, candidate));
                        break;
                    }
                }
                alpha *= ls.contraction_rate;
            }

            match accepted {
                Some((alpha, candidate)) => {
                    debug!(
                        iteration = iterations,
                        cost = candidate.cost,
                        step_length = alpha,
                        regularization = mu,
                        "ddp step accepted"
                    );
                    nominal = candidate;
                    mu = (mu / reg.factor).max(reg.min);
                }
                None => {
                    mu = self.increased_regularization(mu);
                    debug!(iteration = iterations, regularization = mu, "ddp step rejected");
                    if !self.regularization_in_range(mu) {
                        status = SolverStatus::Stalled;
                        break;
                    }
                }
            }
        }

        match status {
            SolverStatus::Converged => {}
            SolverStatus::IterationLimit => warn!(iterations, cost = nominal.cost, "ddp iteration limit reached"),
            SolverStatus::Stalled => warn!(iterations, regularization = mu, "ddp stalled"),
        }

        let primal = assemble_primal(&grid, nominal.clone(), gains, problem.schedule);
        Ok(DdpSolution {
            primal,
            report: SolverReport {
                status,
                iterations,
                cost: nominal.cost,
                predicted_cost,
                constraint_violation: violation,
                partition_order,
                regularization: mu,
            },
        })
    }

    /// Linearize and discretize every interval, partition by partition from last to
    /// first, in parallel within each partition.
    fn linearize(
        &self,
        model: &dyn SystemModel,
        contexts: &[NodeContext<'_>],
        grid: &TimeGrid,
        plan: &PartitionPlan,
        nominal: &Rollout,
    ) -> Result<Linearization, SolverError> {
        let nx = model.state_dim();
        let nu = model.input_dim();
        let intervals = grid.len() - 1;
        let mut continuous: Vec<Option<LinearQuadraticApproximation>> = vec![None; intervals];

        for p in (0..plan.num_partitions()).rev() {
            let (start, end) = plan.node_range(p);
            let block: Vec<LinearQuadraticApproximation> = self.pool.install(|| {
                (start..end)
                    .into_par_iter()
                    .map(|k| {
                        let lq = model.linearize(&contexts[k], &nominal.states[k], &nominal.inputs[k]);
                        check_lq(&lq, nx, nu).map(|()| lq)
                    })
                    .collect::<Result<Vec<_>, SolverError>>()
            })?;
            for (slot, lq) in continuous[start..end].iter_mut().zip(block) {
                *slot = Some(lq);
            }
        }

        let continuous: Vec<LinearQuadraticApproximation> = continuous.into_iter().flatten().collect();
        let discrete: Vec<LinearQuadraticApproximation> = self.pool.install(|| {
            continuous
                .par_iter()
                .enumerate()
                .map(|(k, lq)| lq.discretize(grid.step(k)))
                .collect()
        });
        let constraint_violation = continuous
            .iter()
            .filter_map(|lq| lq.constraint.as_ref())
            .map(|c| c.e.amax())
            .fold(0.0, f64::max);
        let last = grid.len() - 1;
        let terminal = model.terminal_quadratic(&contexts[last], &nominal.states[last]);
        check_dim("terminal hessian", nx, terminal.sm.nrows())?;

        Ok(Linearization {
            continuous,
            discrete,
            terminal,
            constraint_violation,
        })
    }

    fn increased_regularization(&self, mu: f64) -> f64 {
        let reg = &self.settings.regularization;
        if mu > 0.0 {
            mu * reg.factor
        } else {
            reg.min.max(MIN_REGULARIZATION_STEP)
        }
    }

    /// False for a non-finite `mu` too, so a bad update can never retry forever.
    fn regularization_in_range(&self, mu: f64) -> bool {
        mu.is_finite() && mu <= self.settings.regularization.max
    }

    /// Backward pass, raising `mu` until the input Hessian is positive definite.
    /// Returns `None` once `mu` exceeds its maximum.
    fn regularized_backward_pass(
        &self,
        linear: &Linearization,
        grid: &TimeGrid,
        plan: &PartitionPlan,
        contexts: &[NodeContext<'_>],
        mu: &mut f64,
    ) -> Option<BackwardPass> {
        loop {
            let pass = match self.settings.backward_pass {
                BackwardPassKind::Discrete => self.discrete_backward_pass(linear, plan, *mu),
                BackwardPassKind::Continuous => self.continuous_backward_pass(linear, grid, plan, contexts, *mu),
            };
            if pass.is_some() {
                return pass;
            }
            *mu = self.increased_regularization(*mu);
            debug!(regularization = *mu, "input hessian not positive definite");
            if !self.regularization_in_range(*mu) {
                return None;
            }
        }
    }

    /// Discrete Riccati recursion. Partition `p` starts from the boundary value handed
    /// down by partition `p + 1`.
    fn discrete_backward_pass(&self, linear: &Linearization, plan: &PartitionPlan, mu: f64) -> Option<BackwardPass> {
        let num_nodes = linear.discrete.len() + 1;
        let mut values = vec![None; num_nodes];
        let mut policies = vec![None; num_nodes - 1];
        values[num_nodes - 1] = Some(ValueFunction::from_terminal(linear.terminal.clone()));
        let (mut d1, mut d2) = (0.0, 0.0);
        let mut partition_order = Vec::with_capacity(plan.num_partitions());

        for p in (0..plan.num_partitions()).rev() {
            let (start, end) = plan.node_range(p);
            let mut next = values[end].clone()?;
            for k in (start..end).rev() {
                let step = riccati_step(&linear.discrete[k], &next, mu)?;
                d1 += step.d1;
                d2 += step.d2;
                policies[k] = Some(step.policy);
                next = step.value;
                values[k] = Some(next.clone());
            }
            partition_order.push(p);
        }

        Some(BackwardPass {
            values: values.into_iter().collect::<Option<_>>()?,
            policies: policies.into_iter().collect::<Option<_>>()?,
            d1,
            d2,
            partition_order,
        })
    }

    /// Continuous-time Riccati ODE, integrated per mode segment inside each partition.
    fn continuous_backward_pass(
        &self,
        linear: &Linearization,
        grid: &TimeGrid,
        plan: &PartitionPlan,
        contexts: &[NodeContext<'_>],
        mu: f64,
    ) -> Option<BackwardPass> {
        let num_nodes = grid.len();
        let mut values = vec![None; num_nodes];
        let mut policies = vec![None; num_nodes - 1];
        values[num_nodes - 1] = Some(ValueFunction::from_terminal(linear.terminal.clone()));
        let (mut d1, mut d2) = (0.0, 0.0);
        let mut partition_order = Vec::with_capacity(plan.num_partitions());

        for p in (0..plan.num_partitions()).rev() {
            let (start, end) = plan.node_range(p);
            // Segment boundaries: mode switches strictly inside the partition.
            let mut cuts: Vec<usize> = (start + 1..end)
                .filter(|&k| contexts[k].phase_index != contexts[k - 1].phase_index)
                .collect();
            cuts.insert(0, start);
            cuts.push(end);

            for seg in cuts.windows(2).rev() {
                let (a, b) = (seg[0], seg[1]);
                let terminal = values[b].clone()?;
                let solution = integrate_segment(
                    &grid.times()[a..=b],
                    &linear.continuous[a..b],
                    &terminal,
                    self.settings.continuous_steps,
                    mu,
                )?;
                d1 += solution.d1;
                d2 += solution.d2;
                for (offset, value) in solution.values.into_iter().enumerate().take(b - a) {
                    values[a + offset] = Some(value);
                }
                for (offset, policy) in solution.policies.into_iter().enumerate() {
                    policies[a + offset] = Some(policy);
                }
            }
            partition_order.push(p);
        }

        Some(BackwardPass {
            values: values.into_iter().collect::<Option<_>>()?,
            policies: policies.into_iter().collect::<Option<_>>()?,
            d1,
            d2,
            partition_order,
        })
    }
}

// ---------------------------------------------------------------------------
// Rollouts
// ---------------------------------------------------------------------------

fn check_dim(what: &'static str, expected: usize, got: usize) -> Result<(), SolverError> {
    if expected == got {
        Ok(())
    } else {
        Err(SolverError::DimensionMismatch { what, expected, got })
    }
}

fn check_lq(lq: &LinearQuadraticApproximation, nx: usize, nu: usize) -> Result<(), SolverError> {
    check_dim("A rows", nx, lq.a.nrows())?;
    check_dim("A cols", nx, lq.a.ncols())?;
    check_dim("B cols", nu, lq.b.ncols())?;
    check_dim("Rm rows", nu, lq.rm.nrows())?;
    if let Some(c) = &lq.constraint {
        check_dim("constraint D cols", nu, c.d.ncols())?;
        check_dim("constraint C cols", nx, c.c.ncols())?;
    }
    Ok(())
}

/// Euler step over interval `k`, accumulating running cost into `cost`.
fn advance(
    model: &dyn SystemModel,
    ctx: &NodeContext<'_>,
    dt: f64,
    state: &DVector<f64>,
    input: &DVector<f64>,
    cost: &mut f64,
) -> DVector<f64> {
    *cost += dt * model.cost(ctx, state, input);
    state + model.flow_map(ctx, state, input) * dt
}

fn initial_rollout(
    model: &dyn SystemModel,
    contexts: &[NodeContext<'_>],
    grid: &TimeGrid,
    init_state: &DVector<f64>,
    warm_start: Option<&LinearController>,
) -> Rollout {
    let mut states = Vec::with_capacity(grid.len());
    let mut inputs = Vec::with_capacity(grid.len() - 1);
    let mut cost = 0.0;
    let mut x = init_state.clone();
    for (k, ctx) in contexts.iter().enumerate().take(grid.len() - 1) {
        let u = match warm_start {
            Some(controller) => controller.compute_input(ctx.time, &x),
            None => model.operating_input(ctx, &x),
        };
        let next = advance(model, ctx, grid.step(k), &x, &u, &mut cost);
        states.push(std::mem::replace(&mut x, next));
        inputs.push(u);
    }
    cost += model.terminal_cost(&contexts[grid.len() - 1], &x);
    states.push(x);
    Rollout { states, inputs, cost }
}

/// Closed-loop rollout `u = u_nom + α·u_ff + K·(x - x_nom)`.
fn rollout(
    model: &dyn SystemModel,
    contexts: &[NodeContext<'_>],
    grid: &TimeGrid,
    init_state: &DVector<f64>,
    nominal: &Rollout,
    backward: &BackwardPass,
    alpha: f64,
) -> Rollout {
    let mut states = Vec::with_capacity(grid.len());
    let mut inputs = Vec::with_capacity(grid.len() - 1);
    let mut cost = 0.0;
    let mut x = init_state.clone();
    for (k, policy) in backward.policies.iter().enumerate() {
        let u = &nominal.inputs[k] + &policy.feedforward * alpha + &policy.gain * (&x - &nominal.states[k]);
        let next = advance(model, &contexts[k], grid.step(k), &x, &u, &mut cost);
        states.push(std::mem::replace(&mut x, next));
        inputs.push(u);
    }
    cost += model.terminal_cost(&contexts[grid.len() - 1], &x);
    states.push(x);
    Rollout { states, inputs, cost }
}

fn assemble_primal(
    grid: &TimeGrid,
    nominal: Rollout,
    mut gains: Vec<DMatrix<f64>>,
    schedule: &ModeSchedule,
) -> PrimalSolution {
    let Rollout { states, mut inputs, .. } = nominal;
    if let Some(last) = inputs.last().cloned() {
        inputs.push(last);
    }
    if let Some(last) = gains.last().cloned() {
        gains.push(last);
    }
    let times = grid.times().to_vec();
    let controller = LinearController::new(times.clone(), states.clone(), inputs.clone(), gains);
    PrimalSolution {
        times,
        states,
        inputs,
        controller,
        timeline: schedule.timeline().clone(),
    }
}
