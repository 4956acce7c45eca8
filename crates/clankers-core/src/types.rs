//! Shared vocabulary of the MPC stack: contact modes, observations and target
//! trajectories.

use std::fmt;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Number of legs of the quadruped.
pub const NUM_LEGS: usize = 4;

/// Leg names, ordered [FL, FR, RL, RR]. Leg `i` corresponds to bit `i` of a [`Mode`].
pub const LEG_NAMES: [&str; NUM_LEGS] = ["FL", "FR", "RL", "RR"];

/// Per-leg contact flags, ordered like [`LEG_NAMES`].
pub type ContactFlags = [bool; NUM_LEGS];

// ---------------------------------------------------------------------------
// Mode
// ---------------------------------------------------------------------------

/// Discrete contact configuration: bit `i` is set when leg `i` touches the ground.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Mode(u8);

impl Mode {
    /// No leg in contact.
    pub const FLY: Self = Self(0b0000);
    /// All legs in contact. The safe fallback mode.
    pub const STANCE: Self = Self(0b1111);
    /// Trot diagonal: FL and RR in contact.
    pub const FL_RR: Self = Self(0b1001);
    /// Trot diagonal: FR and RL in contact.
    pub const FR_RL: Self = Self(0b0110);
    /// Bound: both front legs in contact.
    pub const FRONT: Self = Self(0b0011);
    /// Bound: both rear legs in contact.
    pub const REAR: Self = Self(0b1100);

    /// Build a mode from its bit mask. Returns `None` for masks wider than [`NUM_LEGS`] bits.
    pub const fn from_bits(bits: u8) -> Option<Self> {
        if bits >> NUM_LEGS == 0 {
            Some(Self(bits))
        } else {
            None
        }
    }

    /// Raw bit mask.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Mode with every leg in contact except `leg`.
    ///
    /// # Panics
    ///
    /// Panics if `leg >= NUM_LEGS`.
    pub const fn swing_leg(leg: usize) -> Self {
        assert!(leg < NUM_LEGS, "leg index out of range");
        Self(Self::STANCE.0 & !(1 << leg))
    }

    /// Build a mode from per-leg contact flags.
    pub fn from_contact_flags(flags: ContactFlags) -> Self {
        let bits = flags
            .iter()
            .enumerate()
            .fold(0u8, |acc, (leg, &c)| if c { acc | (1 << leg) } else { acc });
        Self(bits)
    }

    /// Per-leg contact flags.
    pub fn contact_flags(self) -> ContactFlags {
        std::array::from_fn(|leg| self.in_contact(leg))
    }

    /// Whether `leg` is in contact in this mode.
    pub const fn in_contact(self, leg: usize) -> bool {
        leg < NUM_LEGS && self.0 & (1 << leg) != 0
    }

    /// Number of legs in contact.
    pub const fn num_contacts(self) -> u32 {
        self.0.count_ones()
    }

    pub const fn is_stance(self) -> bool {
        self.0 == Self::STANCE.0
    }
}

impl Default for Mode {
    fn default() -> Self {
        Self::STANCE
    }
}

impl TryFrom<u8> for Mode {
    type Error = ValidationError;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        Self::from_bits(bits).ok_or(ValidationError::InvalidMode(bits))
    }
}

impl From<Mode> for u8 {
    fn from(mode: Mode) -> Self {
        mode.0
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("FLY");
        }
        let names: Vec<&str> = (0..NUM_LEGS)
            .filter(|&leg| self.in_contact(leg))
            .map(|leg| LEG_NAMES[leg])
            .collect();
        f.write_str(&names.join("+"))
    }
}

// ---------------------------------------------------------------------------
// Observation
// ---------------------------------------------------------------------------

/// Measured system state handed to one MPC cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    /// Measurement time (seconds).
    pub time: f64,
    /// Measured state.
    pub state: DVector<f64>,
    /// Last applied input.
    pub input: DVector<f64>,
    /// Active contact mode.
    pub mode: Mode,
}

impl Observation {
    pub fn new(time: f64, state: DVector<f64>, input: DVector<f64>, mode: Mode) -> Self {
        Self {
            time,
            state,
            input,
            mode,
        }
    }
}

// ---------------------------------------------------------------------------
// TargetTrajectory
// ---------------------------------------------------------------------------

/// Desired state/input trajectory tracked by the cost.
///
/// Queries outside the time span clamp to the first or last sample.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetTrajectory {
    times: Vec<f64>,
    states: Vec<DVector<f64>>,
    inputs: Vec<DVector<f64>>,
}

impl TargetTrajectory {
    /// Build a target from matching samples.
    ///
    /// # Errors
    ///
    /// Fails when the sample counts differ, the trajectory is empty, times are
    /// not sorted, or the state/input dimensions are inconsistent.
    pub fn new(
        times: Vec<f64>,
        states: Vec<DVector<f64>>,
        inputs: Vec<DVector<f64>>,
    ) -> Result<Self, ValidationError> {
        if times.len() != states.len() || times.len() != inputs.len() {
            return Err(ValidationError::TrajectoryLengthMismatch {
                times: times.len(),
                states: states.len(),
                inputs: inputs.len(),
            });
        }
        if times.is_empty() {
            return Err(ValidationError::EmptyTrajectory);
        }
        if let Some(index) = times.windows(2).position(|w| w[1] < w[0]) {
            return Err(ValidationError::TimesNotSorted { index: index + 1 });
        }
        let (nx, nu) = (states[0].len(), inputs[0].len());
        if let Some(x) = states.iter().find(|x| x.len() != nx) {
            return Err(ValidationError::StateDimMismatch {
                expected: nx,
                got: x.len(),
            });
        }
        if let Some(u) = inputs.iter().find(|u| u.len() != nu) {
            return Err(ValidationError::InputDimMismatch {
                expected: nu,
                got: u.len(),
            });
        }
        Ok(Self {
            times,
            states,
            inputs,
        })
    }

    /// A single-sample target held constant over all time.
    pub fn constant(time: f64, state: DVector<f64>, input: DVector<f64>) -> Self {
        Self {
            times: vec![time],
            states: vec![state],
            inputs: vec![input],
        }
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn states(&self) -> &[DVector<f64>] {
        &self.states
    }

    pub fn inputs(&self) -> &[DVector<f64>] {
        &self.inputs
    }

    pub fn state_dim(&self) -> usize {
        self.states[0].len()
    }

    pub fn input_dim(&self) -> usize {
        self.inputs[0].len()
    }

    /// Linearly interpolated desired state.
    pub fn state_at(&self, time: f64) -> DVector<f64> {
        interpolate(&self.times, &self.states, time)
    }

    /// Linearly interpolated desired input.
    pub fn input_at(&self, time: f64) -> DVector<f64> {
        interpolate(&self.times, &self.inputs, time)
    }
}

/// Linear interpolation of `values` sampled at sorted `times`, clamped at both ends.
///
/// # Panics
///
/// Panics if `times` is empty or shorter than `values`.
pub fn interpolate(times: &[f64], values: &[DVector<f64>], time: f64) -> DVector<f64> {
    let upper = times.partition_point(|&t| t <= time);
    if upper == 0 {
        return values[0].clone();
    }
    if upper == times.len() {
        return values[times.len() - 1].clone();
    }
    let (t0, t1) = (times[upper - 1], times[upper]);
    let span = t1 - t0;
    if span <= f64::EPSILON {
        return values[upper].clone();
    }
    let alpha = (time - t0) / span;
    &values[upper - 1] * (1.0 - alpha) + &values[upper] * alpha
}
