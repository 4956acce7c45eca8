//! Foothold planning: turns one timeline phase into per-leg [`FootPhase`]s.
//!
//! Stance phases that are active at (or before) the reference time are pinned at
//! the measured foot position. Future stance phases use the Raibert heuristic with
//! capture-point velocity correction. Swing phases connect the surrounding stance
//! footholds.

use std::sync::Arc;

use clankers_core::error::TimelineError;
use clankers_core::types::NUM_LEGS;
use clankers_core::{StanceSettings, SwingProfile};
use nalgebra::{Vector2, Vector3};

use crate::foot_phase::{FootPhase, StancePhase, SwingEvent, SwingPhase};
use crate::terrain::{PlanarTerrain, TerrainModel, TerrainPlane};
use crate::timeline::ModeTimeline;

/// Foot references of all legs for one phase.
pub type LegPhases = [FootPhase; NUM_LEGS];

/// Body state the footholds are planned from.
#[derive(Clone, Debug, PartialEq)]
pub struct BodyReference {
    /// Time at which the positions below were measured.
    pub time: f64,
    /// Hip positions in world frame, ordered [FL, FR, RL, RR].
    pub hip_positions: [Vector3<f64>; NUM_LEGS],
    /// Measured foot positions in world frame.
    pub foot_positions: [Vector3<f64>; NUM_LEGS],
    pub body_velocity: Vector3<f64>,
    pub desired_velocity: Vector3<f64>,
    /// Base height above ground, used by the capture-point gain.
    pub body_height: f64,
}

impl BodyReference {
    /// Standing body with feet directly below the hips.
    pub fn standing(time: f64, hip_positions: [Vector3<f64>; NUM_LEGS], body_height: f64) -> Self {
        let foot_positions = hip_positions.map(|hip| Vector3::new(hip.x, hip.y, hip.z - body_height));
        Self {
            time,
            hip_positions,
            foot_positions,
            body_velocity: Vector3::zeros(),
            desired_velocity: Vector3::zeros(),
            body_height,
        }
    }
}

/// Compute the target landing position for a foot using the Raibert heuristic
/// with capture-point velocity correction.
///
/// ```text
/// hip_at_td = hip_now + v_body * T_swing       // predicted hip at touchdown
/// kv = cp_gain * sqrt(z_com / g)               // capture-point feedback gain
/// target = hip_at_td + v_body * T_stance/2 + kv * (v_body - v_desired)
/// ```
///
/// The horizontal offset from the predicted hip is clamped to `max_reach`.
/// The returned height is left at the hip height; callers project onto terrain.
pub fn raibert_foot_target(
    hip_position: &Vector3<f64>,
    body_velocity: &Vector3<f64>,
    desired_velocity: &Vector3<f64>,
    stance_duration: f64,
    time_to_touchdown: f64,
    body_height: f64,
    settings: &StanceSettings,
) -> Vector3<f64> {
    let hip_at_touchdown = hip_position + body_velocity * time_to_touchdown;
    let vel_offset = body_velocity * (stance_duration * 0.5);
    let kv = settings.cp_gain * (body_height / settings.gravity).max(0.0).sqrt();
    let vel_correction = (body_velocity - desired_velocity) * kv;

    let mut target = hip_at_touchdown + vel_offset + vel_correction;
    let offset = Vector2::new(target.x - hip_at_touchdown.x, target.y - hip_at_touchdown.y);
    let dist = offset.norm();
    if dist > settings.max_reach {
        let scale = settings.max_reach / dist;
        target.x = hip_at_touchdown.x + offset.x * scale;
        target.y = hip_at_touchdown.y + offset.y * scale;
    }
    target
}

/// Plans per-leg foot phases for timeline slots.
#[derive(Clone)]
pub struct FootholdPlanner {
    terrain: Arc<dyn TerrainModel>,
    swing: SwingProfile,
    stance: StanceSettings,
}

impl std::fmt::Debug for FootholdPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FootholdPlanner")
            .field("swing", &self.swing)
            .field("stance", &self.stance)
            .finish_non_exhaustive()
    }
}

impl Default for FootholdPlanner {
    fn default() -> Self {
        Self::new(
            Arc::new(PlanarTerrain::default()),
            SwingProfile::default(),
            StanceSettings::default(),
        )
    }
}

impl FootholdPlanner {
    pub fn new(terrain: Arc<dyn TerrainModel>, swing: SwingProfile, stance: StanceSettings) -> Self {
        Self {
            terrain,
            swing,
            stance,
        }
    }

    pub fn terrain(&self) -> &dyn TerrainModel {
        self.terrain.as_ref()
    }

    /// Plan all legs for phase `index` of `timeline`.
    pub fn plan_phase(
        &self,
        timeline: &ModeTimeline,
        index: usize,
        reference: &BodyReference,
    ) -> Result<LegPhases, TimelineError> {
        let mode = timeline.mode(index)?;
        let [fl, fr, rl, rr] = std::array::from_fn(|leg| {
            if mode.in_contact(leg) {
                let plane = self.stance_plane(timeline, index, leg, reference)?;
                let region = self.terrain.convex_support_region(&plane.position);
                Ok(FootPhase::Stance(StancePhase::new(
                    &region,
                    self.stance.position_gain,
                    self.stance.terrain_margin,
                )))
            } else {
                self.swing_phase(timeline, index, leg, reference)
                    .map(FootPhase::Swing)
            }
        });
        Ok([fl?, fr?, rl?, rr?])
    }

    /// Terrain plane under the stance foothold of `leg` in phase `index`.
    fn stance_plane(
        &self,
        timeline: &ModeTimeline,
        index: usize,
        leg: usize,
        reference: &BodyReference,
    ) -> Result<TerrainPlane, TimelineError> {
        let (start, end) = timeline.phase_interval(index)?;
        let foothold = if start <= reference.time {
            reference.foot_positions[leg]
        } else {
            let stance_duration = if end.is_finite() {
                end - start
            } else {
                self.stance.nominal_phase_duration
            };
            raibert_foot_target(
                &reference.hip_positions[leg],
                &reference.body_velocity,
                &reference.desired_velocity,
                stance_duration,
                start - reference.time,
                reference.body_height,
                &self.stance,
            )
        };
        let xy = Vector2::new(foothold.x, foothold.y);
        let plane = self.terrain.plane_at(&xy);
        if start <= reference.time {
            // Measured footholds keep their position; only the orientation comes from terrain.
            Ok(TerrainPlane {
                position: plane.project(&foothold),
                orientation: plane.orientation,
            })
        } else {
            Ok(plane)
        }
    }

    fn swing_phase(
        &self,
        timeline: &ModeTimeline,
        index: usize,
        leg: usize,
        reference: &BodyReference,
    ) -> Result<SwingPhase, TimelineError> {
        let modes = timeline.modes();
        let mut first = index;
        while first > 0 && !modes[first - 1].in_contact(leg) {
            first -= 1;
        }
        let mut last = index;
        while last + 1 < modes.len() && !modes[last + 1].in_contact(leg) {
            last += 1;
        }

        let (liftoff_time, _) = timeline.phase_interval(first)?;
        let (_, touchdown_time) = timeline.phase_interval(last)?;
        let nominal = self.stance.nominal_phase_duration;
        let (liftoff_time, touchdown_time) = match (liftoff_time.is_finite(), touchdown_time.is_finite()) {
            (true, true) => (liftoff_time, touchdown_time),
            (true, false) => (liftoff_time, liftoff_time + nominal),
            (false, true) => (touchdown_time - nominal, touchdown_time),
            (false, false) => (reference.time, reference.time + nominal),
        };

        let liftoff_plane = if first > 0 {
            Some(self.stance_plane(timeline, first - 1, leg, reference)?)
        } else {
            None
        };
        let touchdown_plane = if last + 1 < modes.len() {
            Some(self.stance_plane(timeline, last + 1, leg, reference)?)
        } else {
            None
        };

        Ok(SwingPhase::new(
            &SwingEvent {
                time: liftoff_time,
                velocity: self.swing.liftoff_velocity,
                plane: liftoff_plane,
            },
            &SwingEvent {
                time: touchdown_time,
                velocity: self.swing.touchdown_velocity,
                plane: touchdown_plane,
            },
            &self.swing,
            Some(self.terrain.as_ref()),
            self.stance.position_gain,
        ))
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use clankers_core::types::Mode;

    use super::*;

    fn hips() -> [Vector3<f64>; NUM_LEGS] {
        [
            Vector3::new(0.2, 0.1, 0.3),
            Vector3::new(0.2, -0.1, 0.3),
            Vector3::new(-0.2, 0.1, 0.3),
            Vector3::new(-0.2, -0.1, 0.3),
        ]
    }

    fn swing_leg1_timeline() -> ModeTimeline {
        ModeTimeline::new(vec![0.2, 0.6], vec![Mode::STANCE, Mode::swing_leg(1), Mode::STANCE]).unwrap()
    }

    #[test]
    fn raibert_stationary_targets_hip() {
        let hip = Vector3::new(0.15, 0.08, 0.35);
        let target = raibert_foot_target(
            &hip,
            &Vector3::zeros(),
            &Vector3::zeros(),
            0.2,
            0.2,
            0.32,
            &StanceSettings::default(),
        );
        assert_relative_eq!(target.x, hip.x, epsilon = 1e-10);
        assert_relative_eq!(target.y, hip.y, epsilon = 1e-10);
    }

    #[test]
    fn raibert_capture_point_correction() {
        let hip = Vector3::new(0.15, 0.08, 0.35);
        let vel = Vector3::new(0.5, 0.0, 0.0);
        let des_vel = Vector3::new(0.3, 0.0, 0.0);
        let settings = StanceSettings::default();
        let target = raibert_foot_target(&hip, &vel, &des_vel, 0.2, 0.2, 0.32, &settings);

        let kv = settings.cp_gain * (0.32 / settings.gravity).sqrt();
        // hip_at_td_x = 0.15 + 0.5*0.2 = 0.25
        let expected_x = 0.25 + 0.05 + kv * 0.2;
        assert_relative_eq!(target.x, expected_x, epsilon = 1e-10);
    }

    #[test]
    fn raibert_reach_clamping() {
        let settings = StanceSettings {
            max_reach: 0.2,
            ..StanceSettings::default()
        };
        let hip = Vector3::new(0.0, 0.0, 0.35);
        let vel = Vector3::new(5.0, 0.0, 0.0);
        let target = raibert_foot_target(&hip, &vel, &Vector3::zeros(), 0.2, 0.0, 0.32, &settings);
        let offset = ((target.x - hip.x).powi(2) + (target.y - hip.y).powi(2)).sqrt();
        assert!(offset <= settings.max_reach + 1e-10, "offset {offset}");
    }

    #[test]
    fn current_stance_is_pinned_at_measured_foot() {
        let planner = FootholdPlanner::default();
        let mut reference = BodyReference::standing(0.0, hips(), 0.3);
        reference.foot_positions[0] = Vector3::new(0.25, 0.12, 0.0);
        let phases = planner.plan_phase(&swing_leg1_timeline(), 0, &reference).unwrap();

        assert!(phases.iter().all(FootPhase::contact_flag));
        assert_relative_eq!(phases[0].nominal_foothold(), Vector3::new(0.25, 0.12, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn swing_leg_connects_surrounding_footholds() {
        let planner = FootholdPlanner::default();
        let mut reference = BodyReference::standing(0.0, hips(), 0.3);
        reference.body_velocity = Vector3::new(0.4, 0.0, 0.0);
        reference.desired_velocity = reference.body_velocity;
        let phases = planner.plan_phase(&swing_leg1_timeline(), 1, &reference).unwrap();

        assert!(phases[0].contact_flag());
        assert!(!phases[1].contact_flag());
        let FootPhase::Swing(swing) = &phases[1] else {
            panic!("leg 1 should swing");
        };
        assert_relative_eq!(swing.liftoff_time(), 0.2);
        assert_relative_eq!(swing.touchdown_time(), 0.6, epsilon = 1e-12);

        // Liftoff from the measured foot, touchdown at the Raibert target of the next stance.
        assert_relative_eq!(phases[1].position(0.2), reference.foot_positions[1], epsilon = 1e-12);
        let touchdown = phases[1].nominal_foothold();
        let open_stance = StanceSettings::default().nominal_phase_duration;
        let expected_x = 0.2 + 0.4 * 0.6 + 0.4 * open_stance * 0.5;
        assert_relative_eq!(touchdown.x, expected_x, epsilon = 1e-12);
        assert_relative_eq!(touchdown.z, 0.0, epsilon = 1e-12);
        assert_relative_eq!(phases[1].position(0.4).z, 0.1, epsilon = 1e-12);
    }

    #[test]
    fn open_ended_swing_uses_nominal_duration() {
        let planner = FootholdPlanner::default();
        let reference = BodyReference::standing(0.0, hips(), 0.3);
        let timeline = ModeTimeline::new(vec![0.5], vec![Mode::STANCE, Mode::swing_leg(2)]).unwrap();
        let phases = planner.plan_phase(&timeline, 1, &reference).unwrap();
        let FootPhase::Swing(swing) = &phases[2] else {
            panic!("leg 2 should swing");
        };
        let nominal = StanceSettings::default().nominal_phase_duration;
        assert_relative_eq!(swing.touchdown_time() - swing.liftoff_time(), nominal, epsilon = 1e-12);
    }

    #[test]
    fn out_of_bounds_phase_is_an_error() {
        let planner = FootholdPlanner::default();
        let reference = BodyReference::standing(0.0, hips(), 0.3);
        let err = planner.plan_phase(&swing_leg1_timeline(), 3, &reference).unwrap_err();
        assert_eq!(err, TimelineError::PhaseIndexOutOfBounds { index: 3, len: 3 });
    }
}
