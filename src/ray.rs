use crate::utils::{fast_mul_add, Real};
use crate::vector::{vec2, vec3, Vec2r, Vec3r};

/// Primitive index reported when no intersection has been found
pub const INVALID_PRIMITIVE_INDEX: usize = usize::MAX;

///
/// Ray with a parametric range. Traversal shrinks `t_max` to the
/// distance of the closest intersection found so far.
#[derive(Debug, Clone, Copy)]
pub struct Ray {
    pub org: Vec3r,
    pub dir: Vec3r,
    pub t_min: Real,
    pub t_max: Real,
}

impl Ray {
    pub fn new(org: Vec3r, dir: Vec3r, t_min: Real, t_max: Real) -> Self {
        Self {
            org,
            dir,
            t_min,
            t_max,
        }
    }

    /// Point on the ray at parameter `t`
    pub fn point_at(&self, t: Real) -> Vec3r {
        vec3(
            fast_mul_add(self.dir.0, t, self.org.0),
            fast_mul_add(self.dir.1, t, self.org.1),
            fast_mul_add(self.dir.2, t, self.org.2),
        )
    }
}

///
/// Intersection record. The meaning of `primitive_index` depends on the
/// caller: [`crate::bvh::intersect_bvh`] reports indices into the BVH's
/// leaf order, while [`crate::mesh::MeshAccel`] remaps them back to the
/// original primitive order of the mesh.
#[derive(Debug, Clone, Copy)]
pub struct Hit {
    pub primitive_index: usize,
    pub uv: Vec2r,
}

impl Hit {
    /// Hit record with the sentinel index, meaning "no intersection"
    pub fn none() -> Self {
        Self {
            primitive_index: INVALID_PRIMITIVE_INDEX,
            uv: vec2(0.0, 0.0),
        }
    }

    pub fn is_hit(&self) -> bool {
        self.primitive_index != INVALID_PRIMITIVE_INDEX
    }
}

#[cfg(test)]
mod ray_test {

    use super::*;

    #[test]
    fn point_at_interpolates() {
        let ray = Ray::new(vec3(1.0, 2.0, 3.0), vec3(0.0, 0.0, 2.0), 0.0, 10.0);
        let p = ray.point_at(0.5);
        assert_eq!(p, vec3(1.0, 2.0, 4.0));
    }

    #[test]
    fn empty_hit_is_not_a_hit() {
        assert!(!Hit::none().is_hit());
    }
}
