///
/// Mesh type containing vertices and a flat index buffer, and the
/// acceleration structure built over it.
///
/// The accelerator owns a copy of the mesh's primitives, physically
/// permuted into BVH leaf order so that leaf traversal touches them
/// sequentially. The BVH's primitive index array is kept around to map
/// hits back to the mesh's original primitive order.

use crate::bvh::{intersect_bvh, Bvh};
use crate::parallel::{parallel_for, UnsafeSlice};
use crate::primitives::{intersect_ray_quad, intersect_ray_tri, Quad, Tri};
use crate::ray::{Hit, Ray};
use crate::thread_pool::ThreadPool;
use crate::utils::Real;
use crate::vector::Vec3r;

/// Traversal cost used when collapsing leaves of a triangle mesh BVH
pub const TRI_TRAVERSAL_COST: Real = 1.5;
/// Traversal cost used when collapsing leaves of a quad mesh BVH
pub const QUAD_TRAVERSAL_COST: Real = 1.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshType {
    Tri,
    Quad,
}

impl MeshType {
    fn index_stride(self) -> usize {
        match self {
            MeshType::Tri => 3,
            MeshType::Quad => 4,
        }
    }
}

///
/// Indexed mesh. Triangle meshes use three indices per primitive,
/// quad meshes four (corners in cyclic order).
pub struct Mesh {
    pub vertices: Vec<Vec3r>,
    pub indices: Vec<u32>,
    pub mesh_type: MeshType,
}

impl Mesh {
    pub fn new(vertices: Vec<Vec3r>, indices: Vec<u32>, mesh_type: MeshType) -> Self {
        assert_eq!(indices.len() % mesh_type.index_stride(), 0);
        debug_assert!(indices.iter().all(|&i| (i as usize) < vertices.len()));
        Self {
            vertices,
            indices,
            mesh_type,
        }
    }

    pub fn new_tris(vertices: Vec<Vec3r>, indices: Vec<u32>) -> Self {
        Self::new(vertices, indices, MeshType::Tri)
    }

    pub fn new_quads(vertices: Vec<Vec3r>, indices: Vec<u32>) -> Self {
        Self::new(vertices, indices, MeshType::Quad)
    }

    pub fn primitive_count(&self) -> usize {
        self.indices.len() / self.mesh_type.index_stride()
    }

    pub fn tri(&self, index: usize) -> Tri {
        debug_assert_eq!(self.mesh_type, MeshType::Tri);
        let i = index * 3;
        Tri::new(
            self.vertices[self.indices[i] as usize],
            self.vertices[self.indices[i + 1] as usize],
            self.vertices[self.indices[i + 2] as usize],
        )
    }

    pub fn quad(&self, index: usize) -> Quad {
        debug_assert_eq!(self.mesh_type, MeshType::Quad);
        let i = index * 4;
        Quad::new(
            self.vertices[self.indices[i] as usize],
            self.vertices[self.indices[i + 1] as usize],
            self.vertices[self.indices[i + 2] as usize],
            self.vertices[self.indices[i + 3] as usize],
        )
    }
}

// Evaluate `make` for every primitive index, in parallel
fn init_primitives<T, F>(pool: &ThreadPool, count: usize, make: F) -> Vec<T>
where
    T: Copy + Default + Send + Sync,
    F: Fn(usize) -> T + Sync,
{
    let mut primitives = vec![T::default(); count];
    let view = UnsafeSlice::new(&mut primitives);
    parallel_for(pool, 0..count, |range, _| {
        for i in range {
            // Safety: tiles are disjoint
            unsafe { view.write(i, make(i)) };
        }
    });
    primitives
}

// Reorder the primitives so that `dst[i] = src[primitive_indices[i]]`,
// making every BVH leaf a contiguous, sequential run
fn permute_primitives<T>(pool: &ThreadPool, primitive_indices: &[usize], src: &[T]) -> Vec<T>
where
    T: Copy + Default + Send + Sync,
{
    init_primitives(pool, src.len(), |i| src[primitive_indices[i]])
}

///
/// Acceleration structure over a mesh (or a sub-range of one).
/// Reported hit indices are the mesh's original primitive indices,
/// offset by the sub-range start.
pub enum MeshAccel {
    Tri {
        bvh: Bvh,
        tris: Vec<Tri>,
        begin: usize,
    },
    Quad {
        bvh: Bvh,
        quads: Vec<Quad>,
        begin: usize,
    },
}

impl MeshAccel {
    pub fn new(pool: &ThreadPool, mesh: &Mesh) -> Self {
        Self::new_submesh(pool, mesh, 0, mesh.primitive_count())
    }

    /// Builds an accelerator over the primitives `[begin, end)` of the
    /// mesh
    pub fn new_submesh(pool: &ThreadPool, mesh: &Mesh, begin: usize, end: usize) -> Self {
        assert!(begin < end && end <= mesh.primitive_count());
        let count = end - begin;
        match mesh.mesh_type {
            MeshType::Tri => {
                let tris = init_primitives(pool, count, |i| mesh.tri(begin + i));
                let bvh = Bvh::new(
                    pool,
                    count,
                    |i| tris[i].bbox(),
                    |i| tris[i].center(),
                    TRI_TRAVERSAL_COST,
                );
                let tris = permute_primitives(pool, &bvh.primitive_indices, &tris);
                MeshAccel::Tri { bvh, tris, begin }
            }
            MeshType::Quad => {
                let quads = init_primitives(pool, count, |i| mesh.quad(begin + i));
                let bvh = Bvh::new(
                    pool,
                    count,
                    |i| quads[i].bbox(),
                    |i| quads[i].center(),
                    QUAD_TRAVERSAL_COST,
                );
                let quads = permute_primitives(pool, &bvh.primitive_indices, &quads);
                MeshAccel::Quad { bvh, quads, begin }
            }
        }
    }

    pub fn bvh(&self) -> &Bvh {
        match self {
            MeshAccel::Tri { bvh, .. } => bvh,
            MeshAccel::Quad { bvh, .. } => bvh,
        }
    }

    /// Intersects the given ray with the mesh. If `any` is set, the
    /// first intersection found is returned; otherwise the closest one.
    /// On a hit, `hit.primitive_index` is the original mesh primitive
    /// index and `ray.t_max` the intersection distance.
    pub fn intersect_ray(&self, ray: &mut Ray, hit: &mut Hit, any: bool) -> bool {
        let found = match self {
            MeshAccel::Tri { bvh, tris, .. } => {
                intersect_bvh(bvh, ray, hit, any, |leaf, ray, hit, any| {
                    let first = leaf.first_child_or_primitive as usize;
                    let mut found = false;
                    for i in first..first + leaf.primitive_count as usize {
                        if intersect_ray_tri(ray, &tris[i], hit) {
                            hit.primitive_index = i;
                            found = true;
                            if any {
                                return true;
                            }
                        }
                    }
                    found
                })
            }
            MeshAccel::Quad { bvh, quads, .. } => {
                intersect_bvh(bvh, ray, hit, any, |leaf, ray, hit, any| {
                    let first = leaf.first_child_or_primitive as usize;
                    let mut found = false;
                    for i in first..first + leaf.primitive_count as usize {
                        if intersect_ray_quad(ray, &quads[i], hit) {
                            hit.primitive_index = i;
                            found = true;
                            if any {
                                return true;
                            }
                        }
                    }
                    found
                })
            }
        };
        if found {
            // Map the leaf-order index back to the mesh's own order
            let (bvh, begin) = match self {
                MeshAccel::Tri { bvh, begin, .. } => (bvh, *begin),
                MeshAccel::Quad { bvh, begin, .. } => (bvh, *begin),
            };
            hit.primitive_index = begin + bvh.primitive_indices[hit.primitive_index];
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod mesh_test {

    use super::*;
    use crate::ray::INVALID_PRIMITIVE_INDEX;
    use crate::vector::{vec2, vec3};
    use rand::Rng;
    use rand_pcg::Pcg32;

    fn make_pool() -> ThreadPool {
        ThreadPool::new(4).unwrap()
    }

    fn unit_tri_mesh() -> Mesh {
        Mesh::new_tris(
            vec![
                vec3(0.0, 0.0, 0.0),
                vec3(1.0, 0.0, 0.0),
                vec3(0.0, 1.0, 0.0),
            ],
            vec![0, 1, 2],
        )
    }

    // Two copies of the unit triangle, the second translated to z = 1
    fn stacked_tri_mesh() -> Mesh {
        Mesh::new_tris(
            vec![
                vec3(0.0, 0.0, 0.0),
                vec3(1.0, 0.0, 0.0),
                vec3(0.0, 1.0, 0.0),
                vec3(0.0, 0.0, 1.0),
                vec3(1.0, 0.0, 1.0),
                vec3(0.0, 1.0, 1.0),
            ],
            vec![0, 1, 2, 3, 4, 5],
        )
    }

    fn random_tri_mesh(count: usize, seed: u64) -> Mesh {
        let mut rng = Pcg32::new(seed, 0xa02bdbf7bb3c0a7);
        let mut vertices = Vec::with_capacity(count * 3);
        let mut indices = Vec::with_capacity(count * 3);
        for i in 0..count {
            let center = vec3(
                rng.gen_range(-5.0..5.0),
                rng.gen_range(-5.0..5.0),
                rng.gen_range(-5.0..5.0),
            );
            for _ in 0..3 {
                vertices.push(
                    center
                        + vec3(
                            rng.gen_range(-0.5..0.5),
                            rng.gen_range(-0.5..0.5),
                            rng.gen_range(-0.5..0.5),
                        ),
                );
            }
            indices.extend([3 * i as u32, 3 * i as u32 + 1, 3 * i as u32 + 2]);
        }
        Mesh::new_tris(vertices, indices)
    }

    fn random_ray(rng: &mut Pcg32) -> Ray {
        let org = vec3(
            rng.gen_range(-8.0..8.0),
            rng.gen_range(-8.0..8.0),
            rng.gen_range(-8.0..8.0),
        );
        let dir = vec3(
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-1.0..1.0),
        );
        Ray::new(org, dir, 0.0, 1.0e9)
    }

    // Reference intersector: test every primitive in order
    fn brute_force_closest(mesh: &Mesh, ray: &Ray) -> (bool, Ray, Hit) {
        let mut ray = *ray;
        let mut hit = Hit::none();
        let mut found = false;
        for i in 0..mesh.primitive_count() {
            if intersect_ray_tri(&mut ray, &mesh.tri(i), &mut hit) {
                hit.primitive_index = i;
                found = true;
            }
        }
        (found, ray, hit)
    }

    #[test]
    fn unit_triangle_hit() {
        let pool = make_pool();
        let mesh = unit_tri_mesh();
        let accel = MeshAccel::new(&pool, &mesh);
        let mut ray = Ray::new(vec3(0.25, 0.25, -1.0), vec3(0.0, 0.0, 1.0), 0.0, 10.0);
        let mut hit = Hit::none();
        assert!(accel.intersect_ray(&mut ray, &mut hit, false));
        assert_eq!(ray.t_max, 1.0);
        assert_eq!(hit.uv, vec2(0.25, 0.25));
        assert_eq!(hit.primitive_index, 0);
    }

    #[test]
    fn closest_hit_picks_the_nearer_triangle() {
        let pool = make_pool();
        let mesh = stacked_tri_mesh();
        let accel = MeshAccel::new(&pool, &mesh);
        let mut ray = Ray::new(vec3(0.25, 0.25, -1.0), vec3(0.0, 0.0, 1.0), 0.0, 10.0);
        let mut hit = Hit::none();
        assert!(accel.intersect_ray(&mut ray, &mut hit, false));
        assert_eq!(ray.t_max, 1.0);
        assert_eq!(hit.primitive_index, 0);
    }

    #[test]
    fn any_hit_stops_at_either_triangle() {
        let pool = make_pool();
        let mesh = stacked_tri_mesh();
        let accel = MeshAccel::new(&pool, &mesh);
        let mut ray = Ray::new(vec3(0.25, 0.25, -1.0), vec3(0.0, 0.0, 1.0), 0.0, 10.0);
        let mut hit = Hit::none();
        assert!(accel.intersect_ray(&mut ray, &mut hit, true));
        assert!(hit.primitive_index < 2);
        assert!(ray.t_max == 1.0 || ray.t_max == 2.0);
    }

    #[test]
    fn matches_brute_force_on_random_scenes() {
        let pool = make_pool();
        let mesh = random_tri_mesh(200, 23);
        let accel = MeshAccel::new(&pool, &mesh);
        let mut rng = Pcg32::new(99, 0xda3e39cb94b95bdb);
        for _ in 0..200 {
            let ray = random_ray(&mut rng);
            let (expected_found, expected_ray, expected_hit) = brute_force_closest(&mesh, &ray);

            let mut closest_ray = ray;
            let mut closest_hit = Hit::none();
            let found = accel.intersect_ray(&mut closest_ray, &mut closest_hit, false);
            assert_eq!(found, expected_found);
            if found {
                assert_eq!(closest_ray.t_max, expected_ray.t_max);
                assert_eq!(closest_hit.primitive_index, expected_hit.primitive_index);
            }

            let mut any_ray = ray;
            let mut any_hit = Hit::none();
            let any_found = accel.intersect_ray(&mut any_ray, &mut any_hit, true);
            assert_eq!(any_found, expected_found);
        }
    }

    #[test]
    fn sixteen_coincident_triangles() {
        let pool = make_pool();
        let base = unit_tri_mesh();
        let mut indices = Vec::new();
        for _ in 0..16 {
            indices.extend([0u32, 1, 2]);
        }
        let mesh = Mesh::new_tris(base.vertices.clone(), indices);
        let accel = MeshAccel::new(&pool, &mesh);
        assert_eq!(
            accel.bvh().root().bbox(),
            crate::bbox::Bbox::from_triangle(
                vec3(0.0, 0.0, 0.0),
                vec3(1.0, 0.0, 0.0),
                vec3(0.0, 1.0, 0.0)
            )
        );
        let mut ray = Ray::new(vec3(0.25, 0.25, -1.0), vec3(0.0, 0.0, 1.0), 0.0, 10.0);
        let mut hit = Hit::none();
        assert!(accel.intersect_ray(&mut ray, &mut hit, false));
        assert!(hit.primitive_index < 16);
    }

    #[test]
    fn submesh_reports_mesh_level_indices() {
        let pool = make_pool();
        // Triangles along the x axis: triangle i sits at x = 2i
        let count = 10;
        let mut vertices = Vec::new();
        let mut indices = Vec::new();
        for i in 0..count {
            let x = 2.0 * i as Real;
            vertices.push(vec3(x, 0.0, 0.0));
            vertices.push(vec3(x + 1.0, 0.0, 0.0));
            vertices.push(vec3(x, 1.0, 0.0));
            indices.extend([3 * i as u32, 3 * i as u32 + 1, 3 * i as u32 + 2]);
        }
        let mesh = Mesh::new_tris(vertices, indices);
        let accel = MeshAccel::new_submesh(&pool, &mesh, 4, 8);

        // A ray at triangle 5 hits it, reported with its mesh index
        let mut ray = Ray::new(vec3(10.25, 0.25, -1.0), vec3(0.0, 0.0, 1.0), 0.0, 10.0);
        let mut hit = Hit::none();
        assert!(accel.intersect_ray(&mut ray, &mut hit, false));
        assert_eq!(hit.primitive_index, 5);

        // A ray at triangle 1 is outside the sub-range
        let mut ray = Ray::new(vec3(2.25, 0.25, -1.0), vec3(0.0, 0.0, 1.0), 0.0, 10.0);
        let mut hit = Hit::none();
        assert!(!accel.intersect_ray(&mut ray, &mut hit, false));
        assert_eq!(hit.primitive_index, INVALID_PRIMITIVE_INDEX);
    }

    #[test]
    fn quad_mesh_hits_both_halves() {
        let pool = make_pool();
        let mesh = Mesh::new_quads(
            vec![
                vec3(0.0, 0.0, 0.0),
                vec3(1.0, 0.0, 0.0),
                vec3(1.0, 1.0, 0.0),
                vec3(0.0, 1.0, 0.0),
                vec3(2.0, 0.0, 1.0),
                vec3(3.0, 0.0, 1.0),
                vec3(3.0, 1.0, 1.0),
                vec3(2.0, 1.0, 1.0),
            ],
            vec![0, 1, 2, 3, 4, 5, 6, 7],
        );
        let accel = MeshAccel::new(&pool, &mesh);

        let mut ray = Ray::new(vec3(0.25, 0.25, -1.0), vec3(0.0, 0.0, 1.0), 0.0, 10.0);
        let mut hit = Hit::none();
        assert!(accel.intersect_ray(&mut ray, &mut hit, false));
        assert_eq!(hit.primitive_index, 0);
        assert_eq!(hit.uv, vec2(0.25, 0.25));

        let mut ray = Ray::new(vec3(2.75, 0.75, -1.0), vec3(0.0, 0.0, 1.0), 0.0, 10.0);
        let mut hit = Hit::none();
        assert!(accel.intersect_ray(&mut ray, &mut hit, false));
        assert_eq!(hit.primitive_index, 1);
        assert_eq!(hit.uv, vec2(0.75, 0.75));
        assert_eq!(ray.t_max, 2.0);
    }

    #[test]
    fn traversal_agrees_before_and_after_collapse() {
        use crate::bvh::{build_bvh, collapse_leaves};
        let pool = make_pool();
        let mesh = random_tri_mesh(64, 7);
        let tris: Vec<Tri> = (0..mesh.primitive_count()).map(|i| mesh.tri(i)).collect();
        let mut bvh = build_bvh(
            &pool,
            tris.len(),
            |i| tris[i].bbox(),
            |i| tris[i].center(),
        );
        let uncollapsed_nodes = bvh.node_count();
        let ray = Ray::new(vec3(-8.0, 0.1, 0.2), vec3(1.0, 0.0, 0.0), 0.0, 1.0e9);

        let intersect = |bvh: &Bvh, ray: &Ray| {
            let mut ray = *ray;
            let mut hit = Hit::none();
            let found = intersect_bvh(bvh, &mut ray, &mut hit, false, |leaf, ray, hit, any| {
                let first = leaf.first_child_or_primitive as usize;
                let mut found = false;
                for i in first..first + leaf.primitive_count as usize {
                    if intersect_ray_tri(ray, &tris[bvh.primitive_indices[i]], hit) {
                        hit.primitive_index = bvh.primitive_indices[i];
                        found = true;
                        if any {
                            return true;
                        }
                    }
                }
                found
            });
            (found, ray.t_max, hit.primitive_index)
        };

        let before = intersect(&bvh, &ray);
        collapse_leaves(&pool, &mut bvh, TRI_TRAVERSAL_COST);
        assert!(bvh.node_count() <= uncollapsed_nodes);
        let after = intersect(&bvh, &ray);
        assert_eq!(before, after);
    }

    #[cfg(feature = "robust-traversal")]
    #[test]
    fn shared_edge_is_watertight() {
        // Two triangles sharing the diagonal of the unit square; a ray
        // aimed exactly at the shared edge must not slip through
        let pool = make_pool();
        let mesh = Mesh::new_tris(
            vec![
                vec3(0.0, 0.0, 0.0),
                vec3(1.0, 0.0, 0.0),
                vec3(0.0, 1.0, 0.0),
                vec3(1.0, 1.0, 0.0),
            ],
            vec![0, 1, 2, 1, 3, 2],
        );
        let accel = MeshAccel::new(&pool, &mesh);
        for k in 1..8 {
            let s = k as Real / 8.0;
            let mut ray = Ray::new(vec3(s, 1.0 - s, -1.0), vec3(0.0, 0.0, 1.0), 0.0, 10.0);
            let mut hit = Hit::none();
            assert!(
                accel.intersect_ray(&mut ray, &mut hit, false),
                "ray slipped through the shared edge at s = {s}"
            );
        }
    }
}
