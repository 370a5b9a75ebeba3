///
/// Parallel BVH construction.
///
/// The construction algorithm is based on "Parallel Locally-Ordered
/// Clustering for Bounding Volume Hierarchy Construction", by D. Meister
/// and J. Bittner. Primitives are sorted along a Morton curve and then
/// merged level by level: each node searches a small window of its
/// Morton-order neighbors for the partner that minimizes the surface
/// area of their union, and mutually-nearest pairs are merged. The
/// output node array is filled back to front, so that the two children
/// of every merged pair land in adjacent slots and the root ends up at
/// index 0.

use log::{debug, trace};

use super::{Bvh, BvhNode};
use crate::bbox::Bbox;
use crate::morton::{morton_encode, MortonCode, MORTON_GRID_DIM};
use crate::parallel::{
    compute_chunk_begin, compute_chunk_end, compute_chunk_size, parallel_for, reduce, UnsafeSlice,
    CHUNK_TASKS_PER_THREAD,
};
use crate::radix_sort::radix_sort_pairs;
use crate::thread_pool::ThreadPool;
use crate::utils::{Bits, Real};
use crate::vector::{vec3, Vec3r};

/// Window of Morton-order neighbors examined on each side of a node
/// during the nearest-neighbor search. Tuned; guarantees a partner
/// exists whenever two or more nodes remain.
pub const SEARCH_RADIUS: usize = 14;

fn search_begin(i: usize) -> usize {
    i.saturating_sub(SEARCH_RADIUS)
}

fn search_end(i: usize, node_count: usize) -> usize {
    usize::min(i + SEARCH_RADIUS + 1, node_count)
}

fn compute_centers<C>(
    pool: &ThreadPool,
    center_fn: &C,
    centers: &mut [Vec3r],
) -> Bbox
where
    C: Fn(usize) -> Vec3r + Sync,
{
    let primitive_count = centers.len();
    let centers_view = UnsafeSlice::new(centers);
    reduce(
        pool,
        0..primitive_count,
        Bbox::new(),
        |center_bbox, range, _| {
            for i in range {
                let center = center_fn(i);
                // Safety: tiles are disjoint
                unsafe { centers_view.write(i, center) };
                center_bbox.include_vertex(center);
            }
        },
        |left, right| left.union(&right),
    )
}

// Map a grid-space coordinate to [0, MORTON_GRID_DIM - 1]. Negative
// values and NaNs (coincident centers make the grid scale infinite)
// clamp to cell 0, values on or past the upper boundary to the last
// cell.
#[inline]
fn grid_coordinate(value: Real) -> MortonCode {
    u64::min(value as u64, MORTON_GRID_DIM - 1) as MortonCode
}

fn compute_morton_codes<C>(
    pool: &ThreadPool,
    center_fn: &C,
    primitive_count: usize,
) -> (Vec<MortonCode>, Vec<usize>)
where
    C: Fn(usize) -> Vec3r + Sync,
{
    let mut centers = vec![Vec3r::default(); primitive_count];
    let center_bbox = compute_centers(pool, center_fn, &mut centers);
    assert!(
        center_bbox.is_finite(),
        "primitive centers produced a non-finite bounding box"
    );

    let mut morton_codes = vec![0 as MortonCode; primitive_count];
    let mut primitive_indices = vec![0usize; primitive_count];
    let extent = center_bbox.extent();
    let center_to_grid = vec3(
        MORTON_GRID_DIM as Real / extent.0,
        MORTON_GRID_DIM as Real / extent.1,
        MORTON_GRID_DIM as Real / extent.2,
    );
    let codes_view = UnsafeSlice::new(&mut morton_codes);
    let indices_view = UnsafeSlice::new(&mut primitive_indices);
    let centers: &[Vec3r] = &centers;
    parallel_for(pool, 0..primitive_count, |range, _| {
        for i in range {
            let x = grid_coordinate((centers[i].0 - center_bbox.min.0) * center_to_grid.0);
            let y = grid_coordinate((centers[i].1 - center_bbox.min.1) * center_to_grid.1);
            let z = grid_coordinate((centers[i].2 - center_bbox.min.2) * center_to_grid.2);
            // Safety: tiles are disjoint
            unsafe {
                codes_view.write(i, morton_encode(x, y, z));
                indices_view.write(i, i);
            }
        }
    });
    (morton_codes, primitive_indices)
}

fn sort_morton_codes(
    pool: &ThreadPool,
    morton_codes: &mut Vec<MortonCode>,
    primitive_indices: &mut Vec<usize>,
) {
    let count = morton_codes.len();
    let mut codes_scratch = vec![0 as MortonCode; count];
    let mut indices_scratch = vec![0usize; count];
    radix_sort_pairs(
        pool,
        morton_codes,
        primitive_indices,
        &mut codes_scratch,
        &mut indices_scratch,
    );
}

fn build_leaves<B>(
    pool: &ThreadPool,
    bbox_fn: &B,
    primitive_indices: &[usize],
    leaves: &mut [BvhNode],
) where
    B: Fn(usize) -> Bbox + Sync,
{
    let leaves_view = UnsafeSlice::new(leaves);
    parallel_for(pool, 0..primitive_indices.len(), |range, _| {
        for i in range {
            let bbox = bbox_fn(primitive_indices[i]);
            let mut leaf = BvhNode::default();
            leaf.set_bbox(&bbox);
            leaf.primitive_count = 1;
            leaf.first_child_or_primitive = i as Bits;
            // Safety: tiles are disjoint
            unsafe { leaves_view.write(i, leaf) };
        }
    });
}

// Fill `neighbors[i]` with the index of the window node whose union
// with node `i` has the smallest half-area
fn compute_neighbors(pool: &ThreadPool, nodes: &[BvhNode], neighbors: &mut [usize]) {
    let node_count = nodes.len();
    let neighbors_view = UnsafeSlice::new(neighbors);
    parallel_for(pool, 0..node_count, |range, _| {
        for i in range {
            let mut best_neighbor = usize::MAX;
            let mut best_distance = Real::MAX;
            for j in search_begin(i)..search_end(i, node_count) {
                if j == i {
                    continue;
                }
                let distance = nodes[i].bbox().union(&nodes[j].bbox()).half_area();
                if distance < best_distance {
                    best_distance = distance;
                    best_neighbor = j;
                }
            }
            debug_assert!(best_neighbor != usize::MAX, "node {i} found no neighbor");
            debug_assert!(best_distance.is_finite());
            // Safety: tiles are disjoint
            unsafe { neighbors_view.write(i, best_neighbor) };
        }
    });
}

// Merge mutually-nearest pairs. Children are copied into the merged
// array at `merged_index` and up; each new parent (and every unmerged
// node) goes to the next level's unmerged array. Returns the size of
// the next level.
fn merge_nodes(
    pool: &ThreadPool,
    src_unmerged: &[BvhNode],
    dst_unmerged: &mut [BvhNode],
    merged: &mut [BvhNode],
    neighbors: &[usize],
    merged_index: &mut usize,
    level: usize,
) -> usize {
    let unmerged_count = src_unmerged.len();
    let task_count = pool.thread_count() * CHUNK_TASKS_PER_THREAD;
    let chunk_size = compute_chunk_size(unmerged_count, task_count);

    // Count how many nodes each chunk merges, and how many it passes
    // through, so that every chunk knows its output offsets
    let mut counts = vec![(0usize, 0usize); task_count];
    pool.scope(|scope| {
        for (k, count) in counts.iter_mut().enumerate() {
            let begin = compute_chunk_begin(chunk_size, k, unmerged_count);
            let end = compute_chunk_end(chunk_size, k, unmerged_count);
            scope.submit(move |_| {
                for i in begin..end {
                    let j = neighbors[i];
                    if neighbors[j] == i {
                        // Count each mutual pair once, at its lower index
                        if i < j {
                            count.0 += 1;
                        }
                    } else {
                        count.1 += 1;
                    }
                }
            });
        }
        scope.wait(0);
    });

    let total_merged: usize = counts.iter().map(|count| count.0).sum();
    assert!(
        total_merged > 0,
        "no mutually-nearest pair among {unmerged_count} nodes at level {level}"
    );

    *merged_index -= 2 * total_merged;

    let dst_view = UnsafeSlice::new(dst_unmerged);
    let merged_view = UnsafeSlice::new(merged);
    let mut chunk_merged_index = *merged_index;
    let mut chunk_unmerged_index = 0;
    pool.scope(|scope| {
        for (k, count) in counts.iter().enumerate() {
            let begin = compute_chunk_begin(chunk_size, k, unmerged_count);
            let end = compute_chunk_end(chunk_size, k, unmerged_count);
            let mut merged_idx = chunk_merged_index;
            let mut unmerged_idx = chunk_unmerged_index;
            chunk_merged_index += 2 * count.0;
            chunk_unmerged_index += count.0 + count.1;
            let dst_view = &dst_view;
            let merged_view = &merged_view;
            scope.submit(move |_| {
                for i in begin..end {
                    let j = neighbors[i];
                    if neighbors[j] == i {
                        if i < j {
                            let mut parent = BvhNode::default();
                            parent.set_bbox(
                                &src_unmerged[i].bbox().union(&src_unmerged[j].bbox()),
                            );
                            parent.primitive_count = 0;
                            parent.first_child_or_primitive = merged_idx as Bits;
                            // Safety: the offsets computed from the count
                            // phase make all writes disjoint
                            unsafe {
                                merged_view.write(merged_idx, src_unmerged[i]);
                                merged_view.write(merged_idx + 1, src_unmerged[j]);
                                dst_view.write(unmerged_idx, parent);
                            }
                            merged_idx += 2;
                            unmerged_idx += 1;
                        }
                        // The partner at the higher index is emitted by
                        // the chunk owning the lower one
                    } else {
                        // Safety: see above
                        unsafe { dst_view.write(unmerged_idx, src_unmerged[i]) };
                        unmerged_idx += 1;
                    }
                }
            });
        }
        scope.wait(0);
    });

    trace!(
        "level {level}: merged {total_merged} pairs, {chunk_unmerged_index} nodes remain"
    );
    chunk_unmerged_index
}

/// Builds a BVH with one leaf per primitive, using the given bounding
/// box and center callbacks. The resulting tree has exactly
/// `2 * primitive_count - 1` nodes; its leaves reference the BVH's
/// `primitive_indices` array, which holds the primitives in Morton
/// order. Leaves can be fused afterwards with
/// [`super::collapse_leaves`].
pub fn build_bvh<B, C>(
    pool: &ThreadPool,
    primitive_count: usize,
    bbox_fn: B,
    center_fn: C,
) -> Bvh
where
    B: Fn(usize) -> Bbox + Sync,
    C: Fn(usize) -> Vec3r + Sync,
{
    assert!(primitive_count > 0, "cannot build a BVH over zero primitives");

    // Sort primitives by morton code
    let (mut morton_codes, mut primitive_indices) =
        compute_morton_codes(pool, &center_fn, primitive_count);
    sort_morton_codes(pool, &mut morton_codes, &mut primitive_indices);
    drop(morton_codes);

    // Construct one leaf per primitive, in Morton order
    let mut src_unmerged = vec![BvhNode::default(); primitive_count];
    build_leaves(pool, &bbox_fn, &primitive_indices, &mut src_unmerged);

    // Merge nodes, level by level
    let node_count = 2 * primitive_count - 1;
    let mut dst_unmerged = vec![BvhNode::default(); primitive_count];
    let mut merged = vec![BvhNode::default(); node_count];
    let mut neighbors = vec![0usize; primitive_count];

    let mut unmerged_count = primitive_count;
    let mut merged_index = node_count;
    let mut level = 0;
    while unmerged_count > 1 {
        compute_neighbors(
            pool,
            &src_unmerged[..unmerged_count],
            &mut neighbors[..unmerged_count],
        );
        unmerged_count = merge_nodes(
            pool,
            &src_unmerged[..unmerged_count],
            &mut dst_unmerged,
            &mut merged,
            &neighbors[..unmerged_count],
            &mut merged_index,
            level,
        );
        std::mem::swap(&mut src_unmerged, &mut dst_unmerged);
        level += 1;
    }
    merged[0] = src_unmerged[0];
    // Every level's writes stop exactly one slot above the previous
    // level's, so the last pair lands at slots 1 and 2
    debug_assert_eq!(merged_index, if primitive_count > 1 { 1 } else { node_count });

    debug!("built BVH over {primitive_count} primitives: {node_count} nodes, {level} merge levels");
    Bvh {
        nodes: merged,
        primitive_indices,
    }
}

#[cfg(test)]
mod build_test {

    use super::*;
    use crate::bvh::validation::check_tree;
    use rand::Rng;
    use rand_pcg::Pcg32;

    fn make_pool() -> ThreadPool {
        ThreadPool::new(4).unwrap()
    }

    fn random_boxes(count: usize, seed: u64) -> Vec<Bbox> {
        let mut rng = Pcg32::new(seed, 0xa02bdbf7bb3c0a7);
        (0..count)
            .map(|_| {
                let center = vec3(
                    rng.gen_range(-10.0..10.0),
                    rng.gen_range(-10.0..10.0),
                    rng.gen_range(-10.0..10.0),
                );
                let half = vec3(
                    rng.gen_range(0.01..0.5),
                    rng.gen_range(0.01..0.5),
                    rng.gen_range(0.01..0.5),
                );
                let mut bbox = Bbox::from_point(center - half);
                bbox.include_vertex(center + half);
                bbox
            })
            .collect()
    }

    fn build_over_boxes(pool: &ThreadPool, boxes: &[Bbox]) -> Bvh {
        build_bvh(
            pool,
            boxes.len(),
            |i| boxes[i],
            |i| boxes[i].center(),
        )
    }

    #[test]
    fn single_primitive_is_a_leaf_root() {
        let pool = make_pool();
        let boxes = random_boxes(1, 1);
        let bvh = build_over_boxes(&pool, &boxes);
        assert_eq!(bvh.node_count(), 1);
        assert!(bvh.root().is_leaf());
        assert_eq!(bvh.root().primitive_count, 1);
        check_tree(&bvh, 1);
    }

    #[test]
    fn two_primitives_make_three_nodes() {
        let pool = make_pool();
        let boxes = random_boxes(2, 2);
        let bvh = build_over_boxes(&pool, &boxes);
        assert_eq!(bvh.node_count(), 3);
        assert!(!bvh.root().is_leaf());
        let left = bvh.root().first_child_or_primitive as usize;
        assert!(bvh.nodes[left].is_leaf());
        assert!(bvh.nodes[left + 1].is_leaf());
        check_tree(&bvh, 2);
    }

    #[test]
    fn node_count_is_full_binary_tree() {
        let pool = make_pool();
        for count in [3, 7, 30, 257, 1000] {
            let boxes = random_boxes(count, count as u64);
            let bvh = build_over_boxes(&pool, &boxes);
            assert_eq!(bvh.node_count(), 2 * count - 1);
            check_tree(&bvh, count);
        }
    }

    #[test]
    fn coincident_primitives_still_build() {
        let pool = make_pool();
        let bbox = Bbox::from_triangle(
            vec3(0.0, 0.0, 0.0),
            vec3(1.0, 0.0, 0.0),
            vec3(0.0, 1.0, 0.0),
        );
        let count = 16;
        let bvh = build_bvh(&pool, count, |_| bbox, |_| bbox.center());
        assert_eq!(bvh.node_count(), 2 * count - 1);
        assert_eq!(bvh.root().bbox(), bbox);
        check_tree(&bvh, count);
    }

    #[test]
    fn root_bbox_covers_all_primitives() {
        let pool = make_pool();
        let boxes = random_boxes(128, 77);
        let bvh = build_over_boxes(&pool, &boxes);
        let root = bvh.root().bbox();
        for bbox in &boxes {
            assert!(root.contains(bbox));
        }
    }

    #[test]
    #[should_panic(expected = "non-finite")]
    fn non_finite_center_is_rejected() {
        let pool = make_pool();
        let bbox = Bbox::from_point(vec3(0.0, 0.0, 0.0));
        build_bvh(&pool, 2, |_| bbox, |i| {
            if i == 0 {
                vec3(Real::INFINITY, 0.0, 0.0)
            } else {
                vec3(0.0, 0.0, 0.0)
            }
        });
    }

    #[test]
    fn works_with_a_single_worker() {
        let pool = ThreadPool::new(1).unwrap();
        let boxes = random_boxes(100, 5);
        let bvh = build_over_boxes(&pool, &boxes);
        check_tree(&bvh, 100);
    }
}
