///
/// Bounding Volume Hierarchy: a binary tree of axis-aligned boxes in a
/// flat node array, with primitives referenced from the leaves through
/// a separate index array

pub mod build;
pub mod collapse;
pub mod intersect;

pub use build::build_bvh;
pub use collapse::collapse_leaves;
pub use intersect::intersect_bvh;

use crate::bbox::Bbox;
use crate::utils::{Bits, Real};
use crate::vector::{vec3, Vec3r};
use crate::thread_pool::ThreadPool;

///
/// Compact BVH node. The six bounding planes are interleaved as
/// `[min_x, max_x, min_y, max_y, min_z, max_z]` so that traversal can
/// select the near/far plane per axis from the ray octant alone.
/// A primitive count of 0 marks an inner node whose left child lives at
/// `first_child_or_primitive` (the right child always directly after);
/// otherwise the node is a leaf addressing a contiguous run of the
/// BVH's primitive index array.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Zeroable, bytemuck::Pod)]
pub struct BvhNode {
    pub bounds: [Real; 6],
    pub primitive_count: Bits,
    pub first_child_or_primitive: Bits,
}

#[cfg(not(feature = "f64"))]
static_assertions::assert_eq_size!(BvhNode, [u8; 32]);
#[cfg(feature = "f64")]
static_assertions::assert_eq_size!(BvhNode, [u8; 64]);

impl Default for BvhNode {
    fn default() -> Self {
        bytemuck::Zeroable::zeroed()
    }
}

impl BvhNode {
    pub fn bbox(&self) -> Bbox {
        Bbox {
            min: vec3(self.bounds[0], self.bounds[2], self.bounds[4]),
            max: vec3(self.bounds[1], self.bounds[3], self.bounds[5]),
        }
    }

    pub fn set_bbox(&mut self, bbox: &Bbox) {
        self.bounds[0] = bbox.min.0;
        self.bounds[1] = bbox.max.0;
        self.bounds[2] = bbox.min.1;
        self.bounds[3] = bbox.max.1;
        self.bounds[4] = bbox.min.2;
        self.bounds[5] = bbox.max.2;
    }

    pub fn is_leaf(&self) -> bool {
        self.primitive_count > 0
    }
}

///
/// BVH container. The root is located at `nodes[0]`; leaves index into
/// `primitive_indices`, which reorders the caller's primitives so that
/// each leaf covers a contiguous run.
#[derive(Debug)]
pub struct Bvh {
    pub nodes: Vec<BvhNode>,
    pub primitive_indices: Vec<usize>,
}

impl Bvh {
    /// Builds a BVH for a set of primitives with the given bounding
    /// boxes and centers, then collapses leaves according to the SAH.
    /// The traversal cost is expressed as a ratio of the cost of
    /// traversing a node vs. the cost of intersecting a primitive.
    pub fn new<B, C>(
        pool: &ThreadPool,
        primitive_count: usize,
        bbox_fn: B,
        center_fn: C,
        traversal_cost: Real,
    ) -> Self
    where
        B: Fn(usize) -> Bbox + Sync,
        C: Fn(usize) -> Vec3r + Sync,
    {
        let mut bvh = build_bvh(pool, primitive_count, bbox_fn, center_fn);
        collapse_leaves(pool, &mut bvh, traversal_cost);
        bvh
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn primitive_count(&self) -> usize {
        self.primitive_indices.len()
    }

    pub fn root(&self) -> &BvhNode {
        &self.nodes[0]
    }
}

#[cfg(test)]
pub(crate) mod validation {

    use super::*;

    /// Checks the structural invariants of a BVH over `primitive_count`
    /// primitives: parent boxes contain child boxes, children are
    /// adjacent, every primitive sits in exactly one leaf.
    pub fn check_tree(bvh: &Bvh, primitive_count: usize) {
        assert!(!bvh.nodes.is_empty());
        assert_eq!(bvh.primitive_indices.len(), primitive_count);

        let mut primitive_seen = vec![0usize; primitive_count];
        let mut node_seen = vec![false; bvh.node_count()];
        let mut stack = vec![0usize];
        while let Some(index) = stack.pop() {
            assert!(!node_seen[index], "node {index} reached twice");
            node_seen[index] = true;
            let node = &bvh.nodes[index];
            if node.is_leaf() {
                let first = node.first_child_or_primitive as usize;
                let count = node.primitive_count as usize;
                assert!(count >= 1);
                for i in first..first + count {
                    primitive_seen[bvh.primitive_indices[i]] += 1;
                }
            } else {
                let left = node.first_child_or_primitive as usize;
                assert!(left > index && left + 1 < bvh.node_count());
                assert!(
                    node.bbox().contains(&bvh.nodes[left].bbox()),
                    "node {index} does not contain its left child"
                );
                assert!(
                    node.bbox().contains(&bvh.nodes[left + 1].bbox()),
                    "node {index} does not contain its right child"
                );
                stack.push(left);
                stack.push(left + 1);
            }
        }
        for (primitive, &count) in primitive_seen.iter().enumerate() {
            assert_eq!(count, 1, "primitive {primitive} is in {count} leaves");
        }
    }
}
