//! Immutable timeline snapshot with lazily planned foot references.
//!
//! Each phase slot is planned at most once, on first query. Queries for an
//! already-planned slot only perform an atomic read; concurrent first queries
//! for the same slot block until the single planner run finishes.

use std::sync::{Arc, OnceLock};

use clankers_core::error::TimelineError;
use clankers_core::types::Mode;
use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::trace;

use crate::foothold::{BodyReference, FootholdPlanner, LegPhases};
use crate::timeline::ModeTimeline;

/// Mode and foot references of one timeline slot.
#[derive(Clone, Copy, Debug)]
pub struct PhaseView<'a> {
    pub index: usize,
    pub mode: Mode,
    pub legs: &'a LegPhases,
}

/// Timeline snapshot shared read-only by solver workers for one solve.
pub struct ModeSchedule {
    timeline: ModeTimeline,
    planner: FootholdPlanner,
    reference: BodyReference,
    slots: Vec<OnceLock<Result<LegPhases, TimelineError>>>,
}

impl std::fmt::Debug for ModeSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModeSchedule")
            .field("timeline", &self.timeline)
            .field("planned", &self.num_planned())
            .finish_non_exhaustive()
    }
}

impl ModeSchedule {
    pub fn new(timeline: ModeTimeline, planner: FootholdPlanner, reference: BodyReference) -> Arc<Self> {
        let slots = (0..timeline.num_phases()).map(|_| OnceLock::new()).collect();
        Arc::new(Self {
            timeline,
            planner,
            reference,
            slots,
        })
    }

    pub fn timeline(&self) -> &ModeTimeline {
        &self.timeline
    }

    pub fn reference(&self) -> &BodyReference {
        &self.reference
    }

    /// Mode and foot references of slot `index`, planning them on first access.
    pub fn phase(&self, index: usize) -> Result<PhaseView<'_>, TimelineError> {
        let slot = self.slots.get(index).ok_or(TimelineError::PhaseIndexOutOfBounds {
            index,
            len: self.slots.len(),
        })?;
        let planned = slot.get_or_init(|| {
            trace!(index, "planning foot phases");
            self.planner.plan_phase(&self.timeline, index, &self.reference)
        });
        match planned {
            Ok(legs) => Ok(PhaseView {
                index,
                mode: self.timeline.modes()[index],
                legs,
            }),
            Err(err) => Err(*err),
        }
    }

    /// Slot active at `time`.
    pub fn phase_at(&self, time: f64) -> Result<PhaseView<'_>, TimelineError> {
        self.phase(self.timeline.phase_index_at(time))
    }

    /// Number of slots whose references have been planned so far.
    pub fn num_planned(&self) -> usize {
        self.slots.iter().filter(|s| s.get().is_some()).count()
    }

    /// Plan the slots in `indices` concurrently on `pool`.
    pub fn prefetch(&self, pool: &ThreadPool, indices: &[usize]) -> Result<(), TimelineError> {
        pool.install(|| {
            indices
                .par_iter()
                .try_for_each(|&index| self.phase(index).map(|_| ()))
        })
    }
}
