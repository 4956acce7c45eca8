//! Mode timeline and gait scheduler for switched legged systems.
//!
//! A [`ModeTimeline`] stores strictly increasing event times `t_0 < … < t_{n-1}`
//! and `n + 1` modes: mode `i` is active on `[t_{i-1}, t_i)`, with the first
//! mode extending to `-∞` and the last one to `+∞`.
//!
//! A [`GaitTemplate`] is a relative mode pattern that the [`GaitSchedule`] tiles
//! onto the timeline. Gaits are defined the usual way:
//! - Phase offsets per foot (when in the cycle each foot lifts)
//! - Duty factor (fraction of cycle spent in stance)
//! - Cycle time (total gait period)

use clankers_core::error::TimelineError;
use clankers_core::types::{ContactFlags, Mode, NUM_LEGS};
use clankers_core::GaitSettings;
use tracing::debug;

/// Transition stance phases shorter than this are skipped.
const MIN_TRANSITION_TIME: f64 = 0.001;

/// Breakpoints closer than this are merged when expanding gait presets.
const BREAKPOINT_EPS: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Gait presets
// ---------------------------------------------------------------------------

/// Supported gait patterns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GaitType {
    /// All feet on ground (static balance).
    Stand,
    /// Diagonal pairs alternate: FL+RR and FR+RL.
    Trot,
    /// One foot lifts at a time, in sequence.
    Walk,
    /// Front pair and rear pair alternate.
    Bound,
}

impl GaitType {
    /// Per-leg phase offsets, duty factor and cycle time of the preset.
    pub fn parameters(self) -> ([f64; NUM_LEGS], f64, f64) {
        match self {
            Self::Stand => ([0.0; 4], 1.0, 1.0),
            Self::Trot => ([0.0, 0.5, 0.5, 0.0], 0.5, 0.35),
            Self::Walk => ([0.0, 0.5, 0.25, 0.75], 0.75, 0.8),
            Self::Bound => ([0.0, 0.0, 0.5, 0.5], 0.5, 0.4),
        }
    }
}

// ---------------------------------------------------------------------------
// GaitTemplate
// ---------------------------------------------------------------------------

/// Relative mode pattern: `modes[i]` is active between `switching_times[i]`
/// and `switching_times[i + 1]`.
#[derive(Clone, Debug, PartialEq)]
pub struct GaitTemplate {
    pub modes: Vec<Mode>,
    pub switching_times: Vec<f64>,
}

impl GaitTemplate {
    pub fn new(modes: Vec<Mode>, switching_times: Vec<f64>) -> Self {
        Self {
            modes,
            switching_times,
        }
    }

    /// Expand a gait preset into one cycle of modes.
    pub fn from_gait(gait: GaitType) -> Self {
        let (offsets, duty_factor, cycle_time) = gait.parameters();
        Self::from_phase_offsets(&offsets, duty_factor, cycle_time)
    }

    /// Expand per-leg phase offsets into one cycle of modes.
    ///
    /// A leg is in contact at normalized phase `φ` when `(φ + offset) % 1 < duty_factor`.
    pub fn from_phase_offsets(offsets: &[f64; NUM_LEGS], duty_factor: f64, cycle_time: f64) -> Self {
        let contact = |phase: f64| -> Mode {
            let flags: ContactFlags = std::array::from_fn(|leg| {
                duty_factor >= 1.0 || (phase + offsets[leg]).rem_euclid(1.0) < duty_factor
            });
            Mode::from_contact_flags(flags)
        };

        let mut breakpoints = vec![0.0, 1.0];
        if duty_factor < 1.0 {
            for &offset in offsets {
                breakpoints.push((duty_factor - offset).rem_euclid(1.0));
                breakpoints.push((-offset).rem_euclid(1.0));
            }
        }
        breakpoints.sort_by(f64::total_cmp);
        breakpoints.dedup_by(|a, b| (*a - *b).abs() < BREAKPOINT_EPS);

        let mut modes: Vec<Mode> = Vec::new();
        let mut switching_times = vec![0.0];
        for window in breakpoints.windows(2) {
            let mode = contact(0.5 * (window[0] + window[1]));
            if modes.last() == Some(&mode) {
                if let Some(end) = switching_times.last_mut() {
                    *end = window[1] * cycle_time;
                }
            } else {
                modes.push(mode);
                switching_times.push(window[1] * cycle_time);
            }
        }
        Self {
            modes,
            switching_times,
        }
    }

    /// Total duration of one tile.
    pub fn duration(&self) -> f64 {
        match (self.switching_times.first(), self.switching_times.last()) {
            (Some(first), Some(last)) => last - first,
            _ => 0.0,
        }
    }

    /// Check the template contract: `modes + 1` strictly increasing switching times.
    pub fn validate(&self) -> Result<(), TimelineError> {
        if self.switching_times.len() != self.modes.len() + 1 {
            return Err(TimelineError::TemplateSizeMismatch {
                modes: self.modes.len(),
                switching_times: self.switching_times.len(),
            });
        }
        if let Some(&t) = self.switching_times.iter().find(|t| !t.is_finite()) {
            return Err(TimelineError::NonFiniteTime(t));
        }
        if self.switching_times.windows(2).any(|w| w[1] <= w[0]) {
            return Err(TimelineError::NonIncreasingTemplate);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ModeTimeline
// ---------------------------------------------------------------------------

/// Ordered mode sequence with strictly increasing switching times.
#[derive(Clone, Debug, PartialEq)]
pub struct ModeTimeline {
    times: Vec<f64>,
    modes: Vec<Mode>,
}

impl Default for ModeTimeline {
    fn default() -> Self {
        Self::seeded(Mode::STANCE)
    }
}

impl ModeTimeline {
    /// Timeline with a single mode active for all time.
    pub fn seeded(mode: Mode) -> Self {
        Self {
            times: Vec::new(),
            modes: vec![mode],
        }
    }

    /// Build a timeline from explicit events.
    pub fn new(times: Vec<f64>, modes: Vec<Mode>) -> Result<Self, TimelineError> {
        if modes.len() != times.len() + 1 {
            return Err(TimelineError::ModeCountMismatch {
                modes: modes.len(),
                times: times.len(),
            });
        }
        if let Some(&t) = times.iter().find(|t| !t.is_finite()) {
            return Err(TimelineError::NonFiniteTime(t));
        }
        if let Some(index) = times.windows(2).position(|w| w[1] <= w[0]) {
            return Err(TimelineError::TimesNotIncreasing { index: index + 1 });
        }
        Ok(Self { times, modes })
    }

    pub fn event_times(&self) -> &[f64] {
        &self.times
    }

    pub fn modes(&self) -> &[Mode] {
        &self.modes
    }

    /// Number of phases (modes) in the timeline.
    pub fn num_phases(&self) -> usize {
        self.modes.len()
    }

    pub fn last_event_time(&self) -> Option<f64> {
        self.times.last().copied()
    }

    /// Index of the phase active at `time`. Event times belong to the phase they start.
    pub fn phase_index_at(&self, time: f64) -> usize {
        self.times.partition_point(|&t| t <= time)
    }

    /// Mode active at `time`.
    pub fn mode_at(&self, time: f64) -> Mode {
        self.modes[self.phase_index_at(time)]
    }

    /// Mode of phase `index`.
    pub fn mode(&self, index: usize) -> Result<Mode, TimelineError> {
        self.modes
            .get(index)
            .copied()
            .ok_or(TimelineError::PhaseIndexOutOfBounds {
                index,
                len: self.modes.len(),
            })
    }

    /// `[start, end)` of phase `index`; the outer phases are unbounded.
    pub fn phase_interval(&self, index: usize) -> Result<(f64, f64), TimelineError> {
        if index >= self.modes.len() {
            return Err(TimelineError::PhaseIndexOutOfBounds {
                index,
                len: self.modes.len(),
            });
        }
        let start = if index == 0 {
            f64::NEG_INFINITY
        } else {
            self.times[index - 1]
        };
        let end = self.times.get(index).copied().unwrap_or(f64::INFINITY);
        Ok((start, end))
    }

    /// Event times strictly inside `(start, end)`.
    pub fn event_times_between(&self, start: f64, end: f64) -> &[f64] {
        let lo = self.times.partition_point(|&t| t <= start);
        let hi = self.times.partition_point(|&t| t < end);
        if lo >= hi { &[] } else { &self.times[lo..hi] }
    }

    /// Contact flags of every phase.
    pub fn contact_flags_sequence(&self) -> Vec<ContactFlags> {
        self.modes.iter().map(|m| m.contact_flags()).collect()
    }

    /// Drop every event at or after `time` together with the modes they start.
    fn truncate_from(&mut self, time: f64) {
        let index = self.times.partition_point(|&t| t < time);
        if index < self.times.len() {
            self.times.truncate(index);
            self.modes.truncate(index + 1);
        }
    }

    /// Tile `template` from `start_time` until the last event reaches `final_time`,
    /// then close with a terminal stance mode.
    ///
    /// An empty template leaves the timeline untouched: its last mode continues forever.
    pub fn append_template(
        &mut self,
        template: &GaitTemplate,
        start_time: f64,
        final_time: f64,
    ) -> Result<(), TimelineError> {
        template.validate()?;
        if template.modes.is_empty() {
            return Ok(());
        }
        for t in [start_time, final_time] {
            if !t.is_finite() {
                return Err(TimelineError::NonFiniteTime(t));
            }
        }
        if let Some(last_event) = self.last_event_time() {
            if start_time <= last_event {
                return Err(TimelineError::NonMonotonicStart {
                    start: start_time,
                    last_event,
                });
            }
        }

        self.times.push(start_time);
        let mut last = start_time;
        while last < final_time {
            for (i, &mode) in template.modes.iter().enumerate() {
                last += template.switching_times[i + 1] - template.switching_times[i];
                self.modes.push(mode);
                self.times.push(last);
            }
        }
        self.modes.push(Mode::STANCE);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// GaitSchedule
// ---------------------------------------------------------------------------

/// Gait scheduler: owns the mode timeline and the last inserted template.
///
/// Edits are transactional: a failed operation leaves the schedule unchanged.
#[derive(Clone, Debug)]
pub struct GaitSchedule {
    timeline: ModeTimeline,
    template: Option<GaitTemplate>,
    phase_transition_stance_time: f64,
}

impl Default for GaitSchedule {
    fn default() -> Self {
        Self::new(&GaitSettings::default())
    }
}

impl GaitSchedule {
    pub fn new(settings: &GaitSettings) -> Self {
        Self {
            timeline: ModeTimeline::default(),
            template: None,
            phase_transition_stance_time: settings.phase_transition_stance_time,
        }
    }

    /// Schedule seeded with an explicit timeline.
    pub fn with_timeline(settings: &GaitSettings, timeline: ModeTimeline) -> Self {
        Self {
            timeline,
            ..Self::new(settings)
        }
    }

    pub fn timeline(&self) -> &ModeTimeline {
        &self.timeline
    }

    pub fn template(&self) -> Option<&GaitTemplate> {
        self.template.as_ref()
    }

    /// Replace the whole timeline. The stored template is kept for later rewinds.
    pub fn set_timeline(&mut self, timeline: ModeTimeline) {
        self.timeline = timeline;
    }

    /// Truncate at `start_time`, optionally insert a transition stance phase, then tile
    /// `template` out to `final_time`.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed template or a tiling start that does not lie
    /// strictly after the remaining events.
    pub fn insert_template(
        &mut self,
        template: GaitTemplate,
        start_time: f64,
        final_time: f64,
    ) -> Result<(), TimelineError> {
        template.validate()?;
        let mut next = self.timeline.clone();
        next.truncate_from(start_time);

        let mut transition = self.phase_transition_stance_time;
        if next.modes.last().is_some_and(|m| m.is_stance()) {
            transition = 0.0;
        }
        if transition > MIN_TRANSITION_TIME {
            next.times.push(start_time);
            next.modes.push(Mode::STANCE);
        } else {
            transition = 0.0;
        }

        next.append_template(&template, start_time + transition, final_time)?;
        debug!(
            start_time,
            final_time,
            phases = next.num_phases(),
            "inserted gait template"
        );
        self.timeline = next;
        self.template = Some(template);
        Ok(())
    }

    /// Drop elapsed phases before `lower_bound`, keeping one phase before it and forcing
    /// that phase to stance, then re-tile the last template out to `upper_bound`.
    ///
    /// Without a stored template or without events the timeline is only truncated at the front.
    pub fn rewind(&mut self, lower_bound: f64, upper_bound: f64) -> Result<(), TimelineError> {
        let mut next = self.timeline.clone();
        let index = next.times.partition_point(|&t| t < lower_bound);
        if index > 0 {
            next.times.drain(..index - 1);
            next.modes.drain(..index - 1);
            next.modes[0] = Mode::STANCE;
        }

        if let (Some(template), Some(tiling_start)) = (&self.template, next.last_event_time()) {
            next.times.pop();
            next.modes.pop();
            next.append_template(template, tiling_start, upper_bound)?;
        }
        self.timeline = next;
        Ok(())
    }
}
