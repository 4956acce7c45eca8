//! Per-leg reference motion for one contact phase: stance or swing.
//!
//! A stance phase pins the foot to a terrain plane. A swing phase follows a 3-D
//! spline made of two cubic Hermite halves that meet at the apex, at the temporal
//! midpoint of the swing:
//! - endpoints match liftoff/touchdown position and vertical velocity
//! - apex height is `swing_height` above the interpolated terrain
//! - horizontal apex velocity is `apex_velocity_factor · distance / duration`
//!
//! Both variants expose the same query surface, including the linear normal-direction
//! equality constraint `A_p·p + A_v·v + b = 0` consumed by the system model.

use clankers_core::SwingProfile;
use nalgebra::{DVector, MatrixXx3, RowVector3, Vector2, Vector3};

use crate::terrain::{ConvexTerrain, TerrainModel, TerrainPlane};

/// Swing phases shorter than this are stretched to avoid degenerate splines.
const MIN_SWING_DURATION: f64 = 1e-3;

// ---------------------------------------------------------------------------
// Constraints
// ---------------------------------------------------------------------------

/// Linear equality constraint `A_p·p + A_v·v + b = 0` in world frame.
#[derive(Clone, Debug, PartialEq)]
pub struct FootNormalConstraint {
    pub position_matrix: RowVector3<f64>,
    pub velocity_matrix: RowVector3<f64>,
    pub constant: f64,
}

impl FootNormalConstraint {
    /// Constraint residual for a foot at `position` moving with `velocity`.
    pub fn value(&self, position: &Vector3<f64>, velocity: &Vector3<f64>) -> f64 {
        (self.position_matrix * position)[0] + (self.velocity_matrix * velocity)[0] + self.constant
    }
}

/// Linear inequality constraints `A·p + b ≥ 0` in world frame.
#[derive(Clone, Debug, PartialEq)]
pub struct FootTangentialConstraint {
    pub a: MatrixXx3<f64>,
    pub b: DVector<f64>,
}

impl FootTangentialConstraint {
    /// One half-space per polygon edge, shrunk inwards by `margin`.
    /// Zero-length edges (repeated vertices) contribute no row.
    ///
    /// Returns `None` for an unbounded region.
    pub fn from_convex_terrain(terrain: &ConvexTerrain, margin: f64) -> Option<Self> {
        let n = terrain.boundary.len();
        let plane = &terrain.plane;
        // Rows of R^T selecting the in-plane terrain axes.
        let world_to_local = plane.orientation.inverse();
        let local_origin = world_to_local * plane.position;

        let mut rows = Vec::with_capacity(n);
        let mut offsets = Vec::with_capacity(n);
        for i in 0..n {
            let start = terrain.boundary[i];
            let edge = terrain.boundary[(i + 1) % n] - start;
            let Some(inward) = Vector2::new(-edge.y, edge.x).try_normalize(1e-12) else {
                continue;
            };
            let lifted = Vector3::new(inward.x, inward.y, 0.0);
            // inward · (S R^T (p - p0) - start) - margin >= 0
            rows.push((world_to_local.matrix().transpose() * lifted).transpose());
            offsets.push(-lifted.dot(&local_origin) - inward.dot(&start) - margin);
        }
        if rows.len() < 3 {
            return None;
        }
        let a = MatrixXx3::from_fn(rows.len(), |r, c| rows[r][c]);
        Some(Self {
            a,
            b: DVector::from_vec(offsets),
        })
    }

    /// Constraint values; all entries are non-negative inside the region.
    pub fn value(&self, position: &Vector3<f64>) -> DVector<f64> {
        &self.a * position + &self.b
    }
}

// ---------------------------------------------------------------------------
// Cubic Hermite segments
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq)]
struct CubicSegment {
    t0: f64,
    duration: f64,
    p0: f64,
    v0: f64,
    p1: f64,
    v1: f64,
}

impl CubicSegment {
    fn normalized(&self, time: f64) -> f64 {
        ((time - self.t0) / self.duration).clamp(0.0, 1.0)
    }

    fn position(&self, time: f64) -> f64 {
        let s = self.normalized(time);
        let (s2, s3) = (s * s, s * s * s);
        let d = self.duration;
        (2.0 * s3 - 3.0 * s2 + 1.0) * self.p0
            + (s3 - 2.0 * s2 + s) * d * self.v0
            + (-2.0 * s3 + 3.0 * s2) * self.p1
            + (s3 - s2) * d * self.v1
    }

    fn velocity(&self, time: f64) -> f64 {
        let s = self.normalized(time);
        let s2 = s * s;
        (6.0 * s2 - 6.0 * s) * (self.p0 - self.p1) / self.duration
            + (3.0 * s2 - 4.0 * s + 1.0) * self.v0
            + (3.0 * s2 - 2.0 * s) * self.v1
    }

    fn acceleration(&self, time: f64) -> f64 {
        let s = self.normalized(time);
        let d = self.duration;
        (12.0 * s - 6.0) * (self.p0 - self.p1) / (d * d)
            + ((6.0 * s - 4.0) * self.v0 + (6.0 * s - 2.0) * self.v1) / d
    }
}

/// Two Hermite halves per axis, joined at `mid_time`.
#[derive(Clone, Debug, PartialEq)]
struct SwingSpline {
    mid_time: f64,
    rise: [CubicSegment; 3],
    fall: [CubicSegment; 3],
}

impl SwingSpline {
    fn segments(&self, time: f64) -> &[CubicSegment; 3] {
        if time < self.mid_time { &self.rise } else { &self.fall }
    }

    fn position(&self, time: f64) -> Vector3<f64> {
        let s = self.segments(time);
        Vector3::new(s[0].position(time), s[1].position(time), s[2].position(time))
    }

    fn velocity(&self, time: f64) -> Vector3<f64> {
        let s = self.segments(time);
        Vector3::new(s[0].velocity(time), s[1].velocity(time), s[2].velocity(time))
    }

    fn acceleration(&self, time: f64) -> Vector3<f64> {
        let s = self.segments(time);
        Vector3::new(
            s[0].acceleration(time),
            s[1].acceleration(time),
            s[2].acceleration(time),
        )
    }
}

/// Scalar rise-then-fall profile used for the clearance margin.
#[derive(Clone, Debug, PartialEq)]
struct ClearanceProfile {
    rise: CubicSegment,
    fall: CubicSegment,
}

impl ClearanceProfile {
    fn value(&self, time: f64) -> f64 {
        if time < self.fall.t0 {
            self.rise.position(time)
        } else {
            self.fall.position(time)
        }
    }
}

// ---------------------------------------------------------------------------
// StancePhase
// ---------------------------------------------------------------------------

/// Foot pinned to a terrain plane.
///
/// The normal constraint drives the foot onto the plane when `position_gain > 0`
/// and reduces to a zero normal velocity constraint otherwise.
#[derive(Clone, Debug, PartialEq)]
pub struct StancePhase {
    foothold: Vector3<f64>,
    normal: Vector3<f64>,
    normal_constraint: FootNormalConstraint,
    tangential_constraint: Option<FootTangentialConstraint>,
}

impl StancePhase {
    pub fn new(terrain: &ConvexTerrain, position_gain: f64, terrain_margin: f64) -> Self {
        let foothold = terrain.plane.position;
        let normal = terrain.plane.normal();
        let normal_constraint = FootNormalConstraint {
            position_matrix: position_gain * normal.transpose(),
            velocity_matrix: normal.transpose(),
            constant: -position_gain * normal.dot(&foothold),
        };
        Self {
            foothold,
            normal,
            normal_constraint,
            tangential_constraint: FootTangentialConstraint::from_convex_terrain(terrain, terrain_margin),
        }
    }
}

// ---------------------------------------------------------------------------
// SwingPhase
// ---------------------------------------------------------------------------

/// Liftoff or touchdown event of a swing.
///
/// `plane` is `None` when the event lies outside the planned horizon.
#[derive(Clone, Debug, PartialEq)]
pub struct SwingEvent {
    pub time: f64,
    /// Vertical foot velocity at the event.
    pub velocity: f64,
    pub plane: Option<TerrainPlane>,
}

/// Foot moving between a liftoff and a touchdown plane.
#[derive(Clone, Debug, PartialEq)]
pub struct SwingPhase {
    liftoff_time: f64,
    touchdown_time: f64,
    liftoff_normal: Vector3<f64>,
    touchdown_normal: Vector3<f64>,
    foothold: Vector3<f64>,
    position_gain: f64,
    motion: SwingSpline,
    clearance: Option<ClearanceProfile>,
}

impl SwingPhase {
    /// Build a swing between two events.
    ///
    /// When one event has no plane, both ends use the available one ("half swing").
    /// Without any plane the swing happens in place above the world origin plane.
    /// The clearance profile is only built when `terrain` provides a signed distance.
    pub fn new(
        liftoff: &SwingEvent,
        touchdown: &SwingEvent,
        profile: &SwingProfile,
        terrain: Option<&dyn TerrainModel>,
        position_gain: f64,
    ) -> Self {
        let (start_plane, end_plane) = match (&liftoff.plane, &touchdown.plane) {
            (Some(start), Some(end)) => (start.clone(), end.clone()),
            (Some(known), None) | (None, Some(known)) => (known.clone(), known.clone()),
            (None, None) => {
                let origin = TerrainPlane::horizontal(Vector3::zeros());
                (origin.clone(), origin)
            }
        };

        let t0 = liftoff.time;
        let duration = (touchdown.time - t0).max(MIN_SWING_DURATION);
        let t1 = t0 + duration;
        let mid_time = t0 + 0.5 * duration;
        let half = 0.5 * duration;

        let start = start_plane.position;
        let end = end_plane.position;
        let apex = Vector3::new(
            0.5 * (start.x + end.x),
            0.5 * (start.y + end.y),
            0.5 * (start.z + end.z) + profile.swing_height,
        );
        let apex_velocity = (end - start) * (profile.apex_velocity_factor / duration);

        let axis = |i: usize| -> (CubicSegment, CubicSegment) {
            let (v_start, v_apex, v_end) = if i == 2 {
                (liftoff.velocity, 0.0, touchdown.velocity)
            } else {
                (0.0, apex_velocity[i], 0.0)
            };
            let rise = CubicSegment {
                t0,
                duration: half,
                p0: start[i],
                v0: v_start,
                p1: apex[i],
                v1: v_apex,
            };
            let fall = CubicSegment {
                t0: mid_time,
                duration: half,
                p0: apex[i],
                v0: v_apex,
                p1: end[i],
                v1: v_end,
            };
            (rise, fall)
        };
        let (x, y, z) = (axis(0), axis(1), axis(2));
        let motion = SwingSpline {
            mid_time,
            rise: [x.0, y.0, z.0],
            fall: [x.1, y.1, z.1],
        };

        let clearance = terrain
            .and_then(|t| t.signed_distance(&start))
            .map(|_| ClearanceProfile {
                rise: CubicSegment {
                    t0,
                    duration: half,
                    p0: profile.sdf_start_end_margin,
                    v0: 0.0,
                    p1: profile.sdf_midswing_margin,
                    v1: 0.0,
                },
                fall: CubicSegment {
                    t0: mid_time,
                    duration: half,
                    p0: profile.sdf_midswing_margin,
                    v0: 0.0,
                    p1: profile.sdf_start_end_margin,
                    v1: 0.0,
                },
            });

        Self {
            liftoff_time: t0,
            touchdown_time: t1,
            liftoff_normal: start_plane.normal(),
            touchdown_normal: end_plane.normal(),
            foothold: end,
            position_gain,
            motion,
            clearance,
        }
    }

    pub fn liftoff_time(&self) -> f64 {
        self.liftoff_time
    }

    pub fn touchdown_time(&self) -> f64 {
        self.touchdown_time
    }

    fn normal(&self, time: f64) -> Vector3<f64> {
        let s = ((time - self.liftoff_time) / (self.touchdown_time - self.liftoff_time)).clamp(0.0, 1.0);
        let blended = self.liftoff_normal * (1.0 - s) + self.touchdown_normal * s;
        blended.try_normalize(f64::EPSILON).unwrap_or(self.touchdown_normal)
    }
}

// ---------------------------------------------------------------------------
// FootPhase
// ---------------------------------------------------------------------------

/// Planned reference for one leg during one phase of the timeline.
#[derive(Clone, Debug, PartialEq)]
pub enum FootPhase {
    Stance(StancePhase),
    Swing(SwingPhase),
}

impl FootPhase {
    /// `true` for stance, `false` for swing.
    pub fn contact_flag(&self) -> bool {
        matches!(self, Self::Stance(_))
    }

    /// Unit normal of the surface the constraint is formulated against.
    pub fn normal(&self, time: f64) -> Vector3<f64> {
        match self {
            Self::Stance(stance) => stance.normal,
            Self::Swing(swing) => swing.normal(time),
        }
    }

    /// Current foothold for stance legs, upcoming foothold for swing legs.
    pub fn nominal_foothold(&self) -> Vector3<f64> {
        match self {
            Self::Stance(stance) => stance.foothold,
            Self::Swing(swing) => swing.foothold,
        }
    }

    pub fn position(&self, time: f64) -> Vector3<f64> {
        match self {
            Self::Stance(stance) => stance.foothold,
            Self::Swing(swing) => swing.motion.position(time),
        }
    }

    pub fn velocity(&self, time: f64) -> Vector3<f64> {
        match self {
            Self::Stance(_) => Vector3::zeros(),
            Self::Swing(swing) => swing.motion.velocity(time),
        }
    }

    pub fn acceleration(&self, time: f64) -> Vector3<f64> {
        match self {
            Self::Stance(_) => Vector3::zeros(),
            Self::Swing(swing) => swing.motion.acceleration(time),
        }
    }

    /// Normal-direction equality constraint at `time`.
    ///
    /// For swing legs this tracks the reference velocity along the normal, plus
    /// position feedback when the gain is positive.
    pub fn normal_constraint(&self, time: f64) -> FootNormalConstraint {
        match self {
            Self::Stance(stance) => stance.normal_constraint.clone(),
            Self::Swing(swing) => {
                let n = swing.normal(time);
                let mut constraint = FootNormalConstraint {
                    position_matrix: RowVector3::zeros(),
                    velocity_matrix: n.transpose(),
                    constant: -n.dot(&swing.motion.velocity(time)),
                };
                if swing.position_gain > 0.0 {
                    constraint.position_matrix = swing.position_gain * n.transpose();
                    constraint.constant -= swing.position_gain * n.dot(&swing.motion.position(time));
                }
                constraint
            }
        }
    }

    /// Tangential foothold constraints; only stance phases on bounded regions have them.
    pub fn tangential_constraint(&self) -> Option<&FootTangentialConstraint> {
        match self {
            Self::Stance(stance) => stance.tangential_constraint.as_ref(),
            Self::Swing(_) => None,
        }
    }

    /// Required signed distance to obstacles, when the terrain provides one.
    pub fn minimum_clearance(&self, time: f64) -> Option<f64> {
        match self {
            Self::Stance(_) => None,
            Self::Swing(swing) => swing.clearance.as_ref().map(|c| c.value(time)),
        }
    }
}
