//! Integration test: equality constraints from the foot phase planner.
//!
//! A velocity-controlled point foot carries the normal-direction constraint of
//! leg 0. The projected Riccati gains must keep the rolled-out trajectory on the
//! constraint manifold, in stance (position feedback toward the ground plane) and
//! in swing (tracking the swing spline's normal velocity).

use std::sync::Arc;

use clankers_core::config::{DdpSettings, StanceSettings, SwingProfile};
use clankers_core::types::{Mode, Observation, TargetTrajectory};
use clankers_mpc::ddp::{DdpSolution, DdpSolver, Partitioning, Problem, SolverStatus};
use clankers_mpc::foothold::FootholdPlanner;
use clankers_mpc::model::SystemModel;
use clankers_mpc::schedule::ModeSchedule;
use clankers_mpc::terrain::PlanarTerrain;
use clankers_mpc::timeline::ModeTimeline;
use clankers_test_utils::PointFootModel;
use nalgebra::{DVector, Vector3, dvector};

const POSITION_GAIN: f64 = 10.0;

fn planner() -> FootholdPlanner {
    let stance = StanceSettings {
        position_gain: POSITION_GAIN,
        ..StanceSettings::default()
    };
    FootholdPlanner::new(Arc::new(PlanarTerrain::flat(0.0)), SwingProfile::default(), stance)
}

fn solve(timeline: ModeTimeline, x0: DVector<f64>) -> (DdpSolution, Arc<ModeSchedule>) {
    let model = PointFootModel::default();
    let observation = Observation::new(0.0, x0.clone(), DVector::zeros(3), timeline.mode_at(0.0));
    let schedule = ModeSchedule::new(timeline, planner(), model.body_reference(&observation));
    let target = TargetTrajectory::constant(0.0, DVector::zeros(3), DVector::zeros(3));
    let mut settings = DdpSettings {
        time_step: 0.01,
        ..DdpSettings::default()
    };
    settings.regularization.initial = 0.0;
    settings.regularization.min = 0.0;
    let solver = DdpSolver::new(settings).unwrap();
    let problem = Problem {
        init_time: 0.0,
        final_time: 1.0,
        init_state: &x0,
        schedule: schedule.as_ref(),
        target: &target,
    };
    let solution = solver.solve(&model, &problem, &Partitioning::Even(2), None).unwrap();
    (solution, schedule)
}

fn max_residual(solution: &DdpSolution, schedule: &ModeSchedule) -> f64 {
    let primal = &solution.primal;
    (0..primal.times.len() - 1)
        .map(|k| {
            let t = primal.times[k];
            let leg = &schedule.phase_at(t).unwrap().legs[0];
            let p = Vector3::new(primal.states[k][0], primal.states[k][1], primal.states[k][2]);
            let v = Vector3::new(primal.inputs[k][0], primal.inputs[k][1], primal.inputs[k][2]);
            leg.normal_constraint(t).value(&p, &v).abs()
        })
        .fold(0.0, f64::max)
}

#[test]
fn stance_constraint_pulls_foot_to_ground() {
    let (solution, schedule) = solve(ModeTimeline::default(), dvector![0.2, 0.1, 0.05]);
    assert_eq!(solution.report.status, SolverStatus::Converged);
    assert!(solution.report.constraint_violation < 1e-6);
    assert!(max_residual(&solution, &schedule) < 1e-8);

    // ż = -gain·z under the constraint: height decays geometrically.
    let heights: Vec<f64> = solution.primal.states.iter().map(|x| x[2]).collect();
    assert!(heights.windows(2).all(|w| w[1] <= w[0] + 1e-12));
    assert!(heights.last().copied().unwrap() < 1e-3);
}

#[test]
fn swing_constraint_tracks_the_swing_height() {
    let timeline = ModeTimeline::new(vec![0.2, 0.6], vec![Mode::STANCE, Mode::swing_leg(0), Mode::STANCE]).unwrap();
    let (solution, schedule) = solve(timeline, dvector![0.2, 0.1, 0.0]);
    assert!(solution.report.constraint_violation < 1e-6);
    assert!(max_residual(&solution, &schedule) < 1e-8);

    let peak = solution
        .primal
        .times
        .iter()
        .zip(&solution.primal.states)
        .filter(|&(&t, _)| (0.2..=0.6).contains(&t))
        .map(|(_, x)| x[2])
        .fold(f64::MIN, f64::max);
    let height = SwingProfile::default().swing_height;
    assert!((peak - height).abs() < 0.2 * height, "peak {peak}");
}
