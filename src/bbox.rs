///
/// Axis aligned bounding box

use crate::utils::{fast_mul_add, max_real, min_real, Real};
use crate::vector::{vec3, Vec3r};

///
/// ### Bounding Box
/// Axis aligned bounding box type. The empty box spans from positive
/// to negative infinity, so that extending it with anything yields
/// that thing, and a NaN coordinate poisons the box instead of being
/// silently dropped.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bbox {
    pub min: Vec3r,
    pub max: Vec3r,
}

impl Bbox {
    ///
    /// Create a new bounding box including nothing
    pub fn new() -> Bbox {
        Self {
            min: vec3(Real::INFINITY, Real::INFINITY, Real::INFINITY),
            max: vec3(Real::NEG_INFINITY, Real::NEG_INFINITY, Real::NEG_INFINITY),
        }
    }

    ///
    /// Create a bounding box covering a single point
    pub fn from_point(p: Vec3r) -> Bbox {
        Self { min: p, max: p }
    }

    ///
    /// Create a bounding box from a given triangle
    pub fn from_triangle(v0: Vec3r, v1: Vec3r, v2: Vec3r) -> Bbox {
        let mut bbox = Bbox::from_point(v0);
        bbox.include_vertex(v1);
        bbox.include_vertex(v2);
        bbox
    }

    /// Extend the bounding box to include the given vertex
    pub fn include_vertex(&mut self, v: Vec3r) {
        self.min.0 = min_real(self.min.0, v.0);
        self.min.1 = min_real(self.min.1, v.1);
        self.min.2 = min_real(self.min.2, v.2);

        self.max.0 = max_real(self.max.0, v.0);
        self.max.1 = max_real(self.max.1, v.1);
        self.max.2 = max_real(self.max.2, v.2);
    }

    /// Extend the bounding box to include the given bounding box
    pub fn include_bbox(&mut self, other: &Bbox) {
        self.min.0 = min_real(self.min.0, other.min.0);
        self.min.1 = min_real(self.min.1, other.min.1);
        self.min.2 = min_real(self.min.2, other.min.2);

        self.max.0 = max_real(self.max.0, other.max.0);
        self.max.1 = max_real(self.max.1, other.max.1);
        self.max.2 = max_real(self.max.2, other.max.2);
    }

    /// Union of two bounding boxes
    pub fn union(mut self, other: &Bbox) -> Bbox {
        self.include_bbox(other);
        self
    }

    /// Get the center of the bounding box
    pub fn center(&self) -> Vec3r {
        (self.min + self.max) * 0.5
    }

    /// Get the extents of the bounding box
    /// also called the diagonal
    pub fn extent(&self) -> Vec3r {
        self.max - self.min
    }

    /// Get half of the surface area of the bounding box.
    /// The extent is clamped to zero so that an empty box has no area.
    pub fn half_area(&self) -> Real {
        let d = self.extent();
        let dx = max_real(d.0, 0.0);
        let dy = max_real(d.1, 0.0);
        let dz = max_real(d.2, 0.0);
        fast_mul_add(dx, dy, fast_mul_add(dx, dz, dy * dz))
    }

    /// Check if the bounding box fully contains the other bounding box
    pub fn contains(&self, other: &Bbox) -> bool {
        self.max.0 >= other.max.0
            && self.min.0 <= other.min.0
            && self.max.1 >= other.max.1
            && self.min.1 <= other.min.1
            && self.max.2 >= other.max.2
            && self.min.2 <= other.min.2
    }

    pub fn is_finite(&self) -> bool {
        self.min.is_finite() && self.max.is_finite()
    }
}

impl Default for Bbox {
    fn default() -> Self {
        Self::new()
    }
}
