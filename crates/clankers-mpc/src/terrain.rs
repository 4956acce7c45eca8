//! Local terrain description used for foothold planning.

use std::f64::consts::PI;

use nalgebra::{Rotation3, Vector2, Vector3};

/// Locally planar ground patch.
///
/// `orientation` maps terrain-frame vectors to world frame; the terrain z-axis is the
/// surface normal.
#[derive(Clone, Debug, PartialEq)]
pub struct TerrainPlane {
    pub position: Vector3<f64>,
    pub orientation: Rotation3<f64>,
}

impl TerrainPlane {
    /// Horizontal plane through `position`.
    pub fn horizontal(position: Vector3<f64>) -> Self {
        Self {
            position,
            orientation: Rotation3::identity(),
        }
    }

    /// Plane through `position` with the given (not necessarily unit) normal.
    pub fn from_normal(position: Vector3<f64>, normal: &Vector3<f64>) -> Self {
        let orientation = Rotation3::rotation_between(&Vector3::z(), normal)
            .unwrap_or_else(|| Rotation3::from_axis_angle(&Vector3::x_axis(), PI));
        Self {
            position,
            orientation,
        }
    }

    /// Unit surface normal in world frame.
    pub fn normal(&self) -> Vector3<f64> {
        self.orientation * Vector3::z()
    }

    /// Signed distance of `point` along the normal.
    pub fn signed_distance(&self, point: &Vector3<f64>) -> f64 {
        self.normal().dot(&(point - self.position))
    }

    /// Orthogonal projection of `point` onto the plane.
    pub fn project(&self, point: &Vector3<f64>) -> Vector3<f64> {
        point - self.normal() * self.signed_distance(point)
    }

    /// World point expressed in the terrain frame.
    pub fn to_local(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.orientation.inverse() * (point - self.position)
    }

    /// In-plane terrain coordinates mapped to world frame.
    pub fn to_world(&self, local: &Vector2<f64>) -> Vector3<f64> {
        self.position + self.orientation * Vector3::new(local.x, local.y, 0.0)
    }
}

/// Convex foothold region: a plane plus a counter-clockwise boundary in plane coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct ConvexTerrain {
    pub plane: TerrainPlane,
    pub boundary: Vec<Vector2<f64>>,
}

impl ConvexTerrain {
    /// Square region of half-width `half_extent` centred on the plane origin.
    pub fn square(plane: TerrainPlane, half_extent: f64) -> Self {
        let h = half_extent;
        Self {
            plane,
            boundary: vec![
                Vector2::new(-h, -h),
                Vector2::new(h, -h),
                Vector2::new(h, h),
                Vector2::new(-h, h),
            ],
        }
    }

    /// Unbounded region on `plane`.
    pub fn unbounded(plane: TerrainPlane) -> Self {
        Self {
            plane,
            boundary: Vec::new(),
        }
    }
}

/// Terrain collaborator queried by the foot planner.
pub trait TerrainModel: Send + Sync {
    /// Ground height and unit normal below the horizontal position `xy`.
    fn height_and_normal(&self, xy: &Vector2<f64>) -> (f64, Vector3<f64>);

    /// Signed distance to the closest obstacle surface, if the model carries one.
    fn signed_distance(&self, _point: &Vector3<f64>) -> Option<f64> {
        None
    }

    /// Convex support region containing the foothold candidate `query`.
    fn convex_support_region(&self, query: &Vector3<f64>) -> ConvexTerrain;

    /// Plane tangent to the terrain below `xy`.
    fn plane_at(&self, xy: &Vector2<f64>) -> TerrainPlane {
        let (height, normal) = self.height_and_normal(xy);
        TerrainPlane::from_normal(Vector3::new(xy.x, xy.y, height), &normal)
    }
}

/// Infinite plane with square support regions around each foothold.
#[derive(Clone, Debug)]
pub struct PlanarTerrain {
    plane: TerrainPlane,
    half_extent: f64,
    with_sdf: bool,
}

impl PlanarTerrain {
    pub fn new(plane: TerrainPlane, half_extent: f64) -> Self {
        Self {
            plane,
            half_extent,
            with_sdf: true,
        }
    }

    /// Flat ground at `height`.
    pub fn flat(height: f64) -> Self {
        Self::new(TerrainPlane::horizontal(Vector3::new(0.0, 0.0, height)), 0.5)
    }

    /// Disable the signed-distance query, as for terrain without obstacle data.
    #[must_use]
    pub fn without_sdf(mut self) -> Self {
        self.with_sdf = false;
        self
    }
}

impl Default for PlanarTerrain {
    fn default() -> Self {
        Self::flat(0.0)
    }
}

impl TerrainModel for PlanarTerrain {
    fn height_and_normal(&self, xy: &Vector2<f64>) -> (f64, Vector3<f64>) {
        let n = self.plane.normal();
        let p0 = &self.plane.position;
        let height = if n.z.abs() > f64::EPSILON {
            p0.z - (n.x * (xy.x - p0.x) + n.y * (xy.y - p0.y)) / n.z
        } else {
            p0.z
        };
        (height, n)
    }

    fn signed_distance(&self, point: &Vector3<f64>) -> Option<f64> {
        self.with_sdf.then(|| self.plane.signed_distance(point))
    }

    fn convex_support_region(&self, query: &Vector3<f64>) -> ConvexTerrain {
        let anchor = self.plane.project(query);
        let plane = TerrainPlane {
            position: anchor,
            orientation: self.plane.orientation,
        };
        ConvexTerrain::square(plane, self.half_extent)
    }
}
