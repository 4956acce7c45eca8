//! Time discretization of the horizon and its split into backward-pass partitions.

use clankers_core::error::SolverError;

/// Relative distance (in units of the time step) under which a uniform node is
/// merged into a nearby event node.
const MERGE_FRACTION: f64 = 0.1;

/// Tolerance for matching a partition boundary to an event time.
const BOUNDARY_TOLERANCE: f64 = 1e-9;

/// Node times of one solve: a uniform grid plus every mode switch inside the horizon.
#[derive(Clone, Debug, PartialEq)]
pub struct TimeGrid {
    times: Vec<f64>,
    event_nodes: Vec<usize>,
}

impl TimeGrid {
    /// Uniform nodes every `time_step` on `[init_time, final_time]`, merged with the
    /// `event_times` strictly inside the horizon. Uniform nodes closer than a tenth of
    /// a step to an event are dropped in favor of the event. An event close to either
    /// end of the horizon still gets its own node, so every interval starts in the
    /// mode it is solved with.
    pub fn new(init_time: f64, final_time: f64, time_step: f64, event_times: &[f64]) -> Result<Self, SolverError> {
        if !(final_time > init_time) || !init_time.is_finite() || !final_time.is_finite() {
            return Err(SolverError::EmptyHorizon { init_time, final_time });
        }
        let eps = MERGE_FRACTION * time_step;
        let events: Vec<f64> = event_times
            .iter()
            .copied()
            .filter(|&t| t > init_time + BOUNDARY_TOLERANCE && t < final_time - BOUNDARY_TOLERANCE)
            .collect();
        let near_event = |t: f64| events.iter().any(|&e| (e - t).abs() < eps);

        let mut uniform = Vec::new();
        let mut k = 1usize;
        loop {
            let t = init_time + k as f64 * time_step;
            if t >= final_time - eps {
                break;
            }
            if !near_event(t) {
                uniform.push(t);
            }
            k += 1;
        }

        let mut times = Vec::with_capacity(uniform.len() + events.len() + 2);
        times.push(init_time);
        times.extend(uniform);
        times.extend(events.iter().copied());
        times.push(final_time);
        times.sort_by(f64::total_cmp);
        times.dedup();

        let event_nodes = events
            .iter()
            .filter_map(|e| times.iter().position(|t| t == e))
            .collect();
        Ok(Self { times, event_nodes })
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn init_time(&self) -> f64 {
        self.times[0]
    }

    pub fn final_time(&self) -> f64 {
        self.times[self.times.len() - 1]
    }

    /// Length of interval `k`.
    pub fn step(&self, k: usize) -> f64 {
        self.times[k + 1] - self.times[k]
    }

    /// Indices of the nodes that sit on a mode switch.
    pub fn event_nodes(&self) -> &[usize] {
        &self.event_nodes
    }

    pub fn event_times(&self) -> Vec<f64> {
        self.event_nodes.iter().map(|&k| self.times[k]).collect()
    }

    pub fn is_event(&self, node: usize) -> bool {
        self.event_nodes.contains(&node)
    }
}

/// Contiguous node blocks processed as units by the backward pass.
///
/// Partition `p` spans nodes `start..=end`; neighbouring partitions share their
/// boundary node. Interior boundaries always sit on mode switches.
#[derive(Clone, Debug, PartialEq)]
pub struct PartitionPlan {
    boundaries: Vec<f64>,
    node_bounds: Vec<usize>,
}

impl PartitionPlan {
    /// Partitions delimited by `boundaries`, which must start at the first node, end at
    /// the last one and otherwise consist of event times of `grid`.
    pub fn new(boundaries: Vec<f64>, grid: &TimeGrid) -> Result<Self, SolverError> {
        if boundaries.len() < 2 {
            return Err(SolverError::InvalidPartition(format!(
                "need at least two boundaries, got {}",
                boundaries.len()
            )));
        }
        if let Some(w) = boundaries.windows(2).position(|w| w[1] <= w[0]) {
            return Err(SolverError::InvalidPartition(format!(
                "boundaries not increasing at index {}",
                w + 1
            )));
        }
        let first = boundaries[0];
        let last = boundaries[boundaries.len() - 1];
        if (first - grid.init_time()).abs() > BOUNDARY_TOLERANCE || (last - grid.final_time()).abs() > BOUNDARY_TOLERANCE {
            return Err(SolverError::InvalidPartition(format!(
                "boundaries [{first}, {last}] do not cover the horizon [{}, {}]",
                grid.init_time(),
                grid.final_time()
            )));
        }

        let mut node_bounds = Vec::with_capacity(boundaries.len());
        node_bounds.push(0);
        for &boundary in &boundaries[1..boundaries.len() - 1] {
            let node = grid
                .event_nodes()
                .iter()
                .copied()
                .find(|&k| (grid.times()[k] - boundary).abs() <= BOUNDARY_TOLERANCE)
                .ok_or(SolverError::PartitionMisaligned { boundary })?;
            node_bounds.push(node);
        }
        node_bounds.push(grid.len() - 1);
        Ok(Self { boundaries, node_bounds })
    }

    /// Up to `num_partitions` partitions: evenly spaced boundaries snapped to the
    /// nearest mode switch. Without switches inside the horizon there is one partition.
    pub fn aligned(grid: &TimeGrid, num_partitions: usize) -> Self {
        let events = grid.event_times();
        let t0 = grid.init_time();
        let tf = grid.final_time();
        let mut boundaries = vec![t0];
        if !events.is_empty() {
            for p in 1..num_partitions {
                let ideal = t0 + (tf - t0) * p as f64 / num_partitions as f64;
                let snapped = events
                    .iter()
                    .copied()
                    .min_by(|a, b| (a - ideal).abs().total_cmp(&(b - ideal).abs()))
                    .unwrap_or(ideal);
                if boundaries.last().is_some_and(|&prev| snapped > prev) {
                    boundaries.push(snapped);
                }
            }
        }
        boundaries.push(tf);

        let mut node_bounds = vec![0];
        for &boundary in &boundaries[1..boundaries.len() - 1] {
            if let Some(k) = grid.event_nodes().iter().copied().find(|&k| grid.times()[k] == boundary) {
                node_bounds.push(k);
            }
        }
        node_bounds.push(grid.len() - 1);
        Self { boundaries, node_bounds }
    }

    pub fn num_partitions(&self) -> usize {
        self.node_bounds.len() - 1
    }

    pub fn boundaries(&self) -> &[f64] {
        &self.boundaries
    }

    /// First and last node of partition `p`.
    pub fn node_range(&self, p: usize) -> (usize, usize) {
        (self.node_bounds[p], self.node_bounds[p + 1])
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn grid_contains_events_and_endpoints() {
        let grid = TimeGrid::new(0.0, 1.0, 0.1, &[0.25, 0.6, 1.5]).unwrap();
        let times = grid.times();
        assert_relative_eq!(times[0], 0.0);
        assert_relative_eq!(times[times.len() - 1], 1.0);
        assert!(times.contains(&0.25));
        assert!(times.contains(&0.6));
        assert!(times.windows(2).all(|w| w[1] > w[0]));
        assert_eq!(grid.event_times(), vec![0.25, 0.6]);
    }

    #[test]
    fn uniform_nodes_near_events_are_merged() {
        let grid = TimeGrid::new(0.0, 1.0, 0.1, &[0.305]).unwrap();
        assert!(grid.times().iter().all(|&t| (t - 0.3).abs() > 1e-3));
        assert!((0..grid.len() - 1).all(|k| grid.step(k) > 0.0));
    }

    #[test]
    fn events_next_to_the_horizon_ends_keep_their_nodes() {
        let grid = TimeGrid::new(0.0, 1.0, 0.1, &[0.004, 0.997]).unwrap();
        assert_eq!(grid.event_times(), vec![0.004, 0.997]);
        assert_eq!(grid.event_nodes()[0], 1);
        assert_relative_eq!(grid.step(0), 0.004);
        assert_relative_eq!(grid.times()[2], 0.1);
        assert_relative_eq!(grid.final_time(), 1.0);
        assert!((0..grid.len() - 1).all(|k| grid.step(k) > 0.0));
    }

    #[test]
    fn empty_horizon_is_rejected() {
        let err = TimeGrid::new(1.0, 1.0, 0.1, &[]).unwrap_err();
        assert!(matches!(err, SolverError::EmptyHorizon { .. }));
    }

    #[test]
    fn aligned_plan_snaps_to_events() {
        let grid = TimeGrid::new(0.0, 1.0, 0.05, &[0.2, 0.45, 0.8]).unwrap();
        let plan = PartitionPlan::aligned(&grid, 2);
        assert_eq!(plan.boundaries(), &[0.0, 0.45, 1.0]);
        let (start, end) = plan.node_range(0);
        assert_eq!(start, 0);
        assert_relative_eq!(grid.times()[end], 0.45);
        assert_eq!(plan.node_range(1).0, end);
        assert_eq!(plan.node_range(1).1, grid.len() - 1);
    }

    #[test]
    fn aligned_plan_without_events_is_single() {
        let grid = TimeGrid::new(0.0, 1.0, 0.1, &[]).unwrap();
        let plan = PartitionPlan::aligned(&grid, 4);
        assert_eq!(plan.num_partitions(), 1);
    }

    #[test]
    fn aligned_plan_never_repeats_a_boundary() {
        let grid = TimeGrid::new(0.0, 1.0, 0.05, &[0.5]).unwrap();
        let plan = PartitionPlan::aligned(&grid, 4);
        assert_eq!(plan.boundaries(), &[0.0, 0.5, 1.0]);
    }

    #[test]
    fn misaligned_boundary_is_fatal() {
        let grid = TimeGrid::new(0.0, 1.0, 0.1, &[0.35]).unwrap();
        let err = PartitionPlan::new(vec![0.0, 0.5, 1.0], &grid).unwrap_err();
        assert!(matches!(err, SolverError::PartitionMisaligned { boundary } if boundary == 0.5));
        assert!(PartitionPlan::new(vec![0.0, 0.35, 1.0], &grid).is_ok());
    }

    #[test]
    fn boundaries_must_cover_horizon() {
        let grid = TimeGrid::new(0.0, 1.0, 0.1, &[0.35]).unwrap();
        assert!(matches!(
            PartitionPlan::new(vec![0.1, 1.0], &grid),
            Err(SolverError::InvalidPartition(_))
        ));
        assert!(matches!(
            PartitionPlan::new(vec![0.0, 0.35, 0.35, 1.0], &grid),
            Err(SolverError::InvalidPartition(_))
        ));
    }
}
