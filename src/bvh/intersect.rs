///
/// Branch-and-bound front-to-back BVH traversal.
///
/// The robust variant is inspired from T. Ize's "Robust BVH Ray
/// Traversal" article. It is only enabled when the `robust-traversal`
/// feature is set, and guarantees that rays grazing the edge shared by
/// two boxes cannot slip between them.

use smallvec::SmallVec;

use super::{Bvh, BvhNode};
use crate::ray::{Hit, Ray};
use crate::utils::{max_real, min_real, safe_inverse, Real};
#[cfg(not(feature = "robust-traversal"))]
use crate::utils::fast_mul_add;
#[cfg(feature = "robust-traversal")]
use crate::utils::add_ulp_magnitude;
use crate::vector::{vec3, Vec3r};

// Inline capacity of the traversal stack; enough for any realistic
// tree depth, spilling to the heap otherwise
const STACK_DEPTH: usize = 64;

#[cfg(feature = "robust-traversal")]
struct RayData {
    inv_dir: Vec3r,
    padded_inv_dir: Vec3r,
    octant: [usize; 3],
}

#[cfg(not(feature = "robust-traversal"))]
struct RayData {
    inv_dir: Vec3r,
    scaled_org: Vec3r,
    octant: [usize; 3],
}

impl RayData {
    #[cfg(feature = "robust-traversal")]
    fn new(ray: &Ray) -> Self {
        let inv_dir = vec3(
            safe_inverse(ray.dir.0),
            safe_inverse(ray.dir.1),
            safe_inverse(ray.dir.2),
        );
        Self {
            inv_dir,
            padded_inv_dir: vec3(
                add_ulp_magnitude(inv_dir.0, 2),
                add_ulp_magnitude(inv_dir.1, 2),
                add_ulp_magnitude(inv_dir.2, 2),
            ),
            octant: octant(ray),
        }
    }

    #[cfg(not(feature = "robust-traversal"))]
    fn new(ray: &Ray) -> Self {
        let inv_dir = vec3(
            safe_inverse(ray.dir.0),
            safe_inverse(ray.dir.1),
            safe_inverse(ray.dir.2),
        );
        Self {
            inv_dir,
            scaled_org: vec3(
                -ray.org.0 * inv_dir.0,
                -ray.org.1 * inv_dir.1,
                -ray.org.2 * inv_dir.2,
            ),
            octant: octant(ray),
        }
    }

    #[cfg(feature = "robust-traversal")]
    #[inline(always)]
    fn intersect_axis_min(&self, axis: u32, p: Real, ray: &Ray) -> Real {
        (p - ray.org[axis]) * self.inv_dir[axis]
    }

    #[cfg(feature = "robust-traversal")]
    #[inline(always)]
    fn intersect_axis_max(&self, axis: u32, p: Real, ray: &Ray) -> Real {
        (p - ray.org[axis]) * self.padded_inv_dir[axis]
    }

    #[cfg(not(feature = "robust-traversal"))]
    #[inline(always)]
    fn intersect_axis_min(&self, axis: u32, p: Real, _ray: &Ray) -> Real {
        fast_mul_add(p, self.inv_dir[axis], self.scaled_org[axis])
    }

    #[cfg(not(feature = "robust-traversal"))]
    #[inline(always)]
    fn intersect_axis_max(&self, axis: u32, p: Real, ray: &Ray) -> Real {
        self.intersect_axis_min(axis, p, ray)
    }
}

fn octant(ray: &Ray) -> [usize; 3] {
    [
        usize::from(ray.dir.0.is_sign_negative()),
        usize::from(ray.dir.1.is_sign_negative()),
        usize::from(ray.dir.2.is_sign_negative()),
    ]
}

// Slab test against the node bounds, selecting the near and far plane
// of each axis from the ray octant. Returns the entry distance if the
// slab interval overlaps `[t_min, t_max]`.
#[inline]
fn intersect_node(ray: &Ray, ray_data: &RayData, node: &BvhNode) -> Option<Real> {
    let tmin_x = ray_data.intersect_axis_min(0, node.bounds[ray_data.octant[0]], ray);
    let tmin_y = ray_data.intersect_axis_min(1, node.bounds[2 + ray_data.octant[1]], ray);
    let tmin_z = ray_data.intersect_axis_min(2, node.bounds[4 + ray_data.octant[2]], ray);
    let tmax_x = ray_data.intersect_axis_max(0, node.bounds[1 - ray_data.octant[0]], ray);
    let tmax_y = ray_data.intersect_axis_max(1, node.bounds[2 + 1 - ray_data.octant[1]], ray);
    let tmax_z = ray_data.intersect_axis_max(2, node.bounds[4 + 1 - ray_data.octant[2]], ray);

    let tmin = max_real(max_real(tmin_x, tmin_y), max_real(tmin_z, ray.t_min));
    let tmax = min_real(min_real(tmax_x, tmax_y), min_real(tmax_z, ray.t_max));

    (tmin <= tmax).then_some(tmin)
}

/// Intersects a BVH with a ray, using the given callback to intersect
/// the primitives in a leaf. If `any` is set, the traversal terminates
/// as soon as an intersection is found; otherwise it searches for the
/// closest one. The callback must shrink `ray.t_max` and fill `hit`
/// for every accepted intersection, and report whether it found one.
///
/// Returns true iff `hit` holds an intersection on return.
pub fn intersect_bvh<F>(
    bvh: &Bvh,
    ray: &mut Ray,
    hit: &mut Hit,
    any: bool,
    mut intersect_leaf: F,
) -> bool
where
    F: FnMut(&BvhNode, &mut Ray, &mut Hit, bool) -> bool,
{
    let ray_data = RayData::new(ray);

    // Special case when the root node is a leaf
    let root = bvh.root();
    if root.primitive_count > 0 {
        return intersect_node(ray, &ray_data, root).is_some()
            && intersect_leaf(root, ray, hit, any);
    }

    // General case
    let mut stack: SmallVec<[usize; STACK_DEPTH]> = SmallVec::new();
    let mut left_index = root.first_child_or_primitive as usize;
    loop {
        let left = &bvh.nodes[left_index];
        let right = &bvh.nodes[left_index + 1];

        // Intersect the two children together
        let t_left = intersect_node(ray, &ray_data, left);
        let t_right = intersect_node(ray, &ray_data, right);

        // Leaves are resolved immediately; inner children stay
        // candidates for the descent below
        let mut candidate_left = None;
        if t_left.is_some() {
            if left.primitive_count > 0 {
                if intersect_leaf(left, ray, hit, any) && any {
                    return true;
                }
            } else {
                candidate_left = t_left.map(|t| (left_index, t));
            }
        }
        let mut candidate_right = None;
        if t_right.is_some() {
            if right.primitive_count > 0 {
                if intersect_leaf(right, ray, hit, any) && any {
                    return true;
                }
            } else {
                candidate_right = t_right.map(|t| (left_index + 1, t));
            }
        }

        match (candidate_left, candidate_right) {
            (Some((left, t_left)), Some((right, t_right))) => {
                // Both children are inner nodes: visit the nearer one
                // first (only worth it in closest intersection mode)
                let (near, far) = if !any && t_left > t_right {
                    (right, left)
                } else {
                    (left, right)
                };
                stack.push(bvh.nodes[far].first_child_or_primitive as usize);
                left_index = bvh.nodes[near].first_child_or_primitive as usize;
            }
            (Some((index, _)), None) | (None, Some((index, _))) => {
                left_index = bvh.nodes[index].first_child_or_primitive as usize;
            }
            (None, None) => match stack.pop() {
                Some(index) => left_index = index,
                None => break,
            },
        }
    }

    hit.is_hit()
}
