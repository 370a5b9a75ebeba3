///
/// Ray-primitive intersection for triangles and quads.
///
/// Primitives are stored in a precomputed form: a base vertex, edge
/// vectors, and the (unnormalized) geometric normal, so that the
/// Moeller-style test below needs no per-ray setup. All comparisons
/// reject NaNs, so degenerate primitives and rays simply miss.

use crate::bbox::Bbox;
use crate::ray::{Hit, Ray};
use crate::vector::{cross, dot, vec2, Vec3r};

///
/// Triangle stored as a base point with two edges and the normal:
/// `e1 = p0 - p1`, `e2 = p2 - p0`, `n = e1 x e2`
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Tri {
    pub p0: Vec3r,
    pub e1: Vec3r,
    pub e2: Vec3r,
    pub n: Vec3r,
}

impl Tri {
    pub fn new(p0: Vec3r, p1: Vec3r, p2: Vec3r) -> Self {
        let e1 = p0 - p1;
        let e2 = p2 - p0;
        Self {
            p0,
            e1,
            e2,
            n: cross(e1, e2),
        }
    }

    pub fn p1(&self) -> Vec3r {
        self.p0 - self.e1
    }

    pub fn p2(&self) -> Vec3r {
        self.p0 + self.e2
    }

    pub fn bbox(&self) -> Bbox {
        Bbox::from_triangle(self.p0, self.p1(), self.p2())
    }

    pub fn center(&self) -> Vec3r {
        (self.p0 + self.p1() + self.p2()) / 3.0
    }
}

///
/// Quad with corners in cyclic order `p0, p1, p2, p3`, interpreted as
/// the two triangles `(p0, p1, p3)` and `(p2, p3, p1)` sharing the
/// diagonal, intersected as a disjoint pair in a single routine.
/// Stored as the front triangle's edges (`e1 = p0 - p1`,
/// `e2 = p3 - p0`) and normal, plus the back triangle's edges
/// (`e3 = p2 - p3`, `e4 = p1 - p2`).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Quad {
    pub p0: Vec3r,
    pub e1: Vec3r,
    pub e2: Vec3r,
    pub e3: Vec3r,
    pub e4: Vec3r,
    pub n: Vec3r,
}

impl Quad {
    pub fn new(p0: Vec3r, p1: Vec3r, p2: Vec3r, p3: Vec3r) -> Self {
        let e1 = p0 - p1;
        let e2 = p3 - p0;
        let e3 = p2 - p3;
        let e4 = p1 - p2;
        Self {
            p0,
            e1,
            e2,
            e3,
            e4,
            n: cross(e1, e2),
        }
    }

    pub fn p1(&self) -> Vec3r {
        self.p0 - self.e1
    }

    pub fn p2(&self) -> Vec3r {
        self.p3() + self.e3
    }

    pub fn p3(&self) -> Vec3r {
        self.p0 + self.e2
    }

    pub fn bbox(&self) -> Bbox {
        let mut bbox = Bbox::from_triangle(self.p0, self.p1(), self.p2());
        bbox.include_vertex(self.p3());
        bbox
    }

    pub fn center(&self) -> Vec3r {
        (self.p0 + self.p1() + self.p2() + self.p3()) / 4.0
    }
}

/// Intersects a ray with a triangle. On a hit, `ray.t_max` is shrunk
/// to the intersection distance and the barycentric coordinates are
/// written into `hit.uv` (the primitive index is left to the caller).
pub fn intersect_ray_tri(ray: &mut Ray, tri: &Tri, hit: &mut Hit) -> bool {
    let c = tri.p0 - ray.org;
    let r = cross(ray.dir, c);

    let inv_det = 1.0 / dot(tri.n, ray.dir);
    let u = dot(r, tri.e2) * inv_det;
    let v = dot(r, tri.e1) * inv_det;
    let w = 1.0 - u - v;

    // These comparisons are designed to return false
    // when one of t, u, or v is a NaN
    if u >= 0.0 && v >= 0.0 && w >= 0.0 {
        let t = dot(tri.n, c) * inv_det;
        if t >= ray.t_min && t <= ray.t_max {
            ray.t_max = t;
            hit.uv = vec2(u, v);
            return true;
        }
    }

    false
}

/// Intersects a ray with a quad, testing its two triangles in turn.
/// The triangles are disjoint except for the shared diagonal, so the
/// first accepted intersection is the only one. A hit on the back
/// triangle maps its coordinates to the far corner of the unit square,
/// so that `uv` spans the whole quad consistently.
pub fn intersect_ray_quad(ray: &mut Ray, quad: &Quad, hit: &mut Hit) -> bool {
    let front = Tri {
        p0: quad.p0,
        e1: quad.e1,
        e2: quad.e2,
        n: quad.n,
    };
    if intersect_ray_tri(ray, &front, hit) {
        return true;
    }

    let back = Tri {
        p0: quad.p2(),
        e1: quad.e3,
        e2: quad.e4,
        n: cross(quad.e3, quad.e4),
    };
    if intersect_ray_tri(ray, &back, hit) {
        hit.uv = vec2(1.0 - hit.uv.0, 1.0 - hit.uv.1);
        return true;
    }

    false
}
