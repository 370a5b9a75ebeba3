///
/// SAH leaf collapse.
///
/// Post-processes a freshly built BVH, fusing subtrees into
/// multi-primitive leaves wherever the surface-area heuristic says a
/// single bigger leaf is cheaper than keeping the inner node. The
/// sweep is bottom-up with an atomic per-node flag, in the manner of
/// T. Karras's "Maximizing Parallelism in the Construction of BVHs,
/// Octrees, and k-d Trees": every leaf walks towards the root, and at
/// each inner node only the second child to arrive continues.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use log::debug;

use super::{Bvh, BvhNode};
use crate::parallel::{
    compute_chunk_begin, compute_chunk_end, compute_chunk_size, parallel_for, UnsafeSlice,
    CHUNK_TASKS_PER_THREAD,
};
use crate::thread_pool::ThreadPool;
use crate::utils::{Bits, Real};

const NO_PARENT: usize = usize::MAX;

// Initialize parent links and per-node counters. Every node starts out
// kept (node count 1) and unvisited (flag 0).
fn init_parents(
    pool: &ThreadPool,
    nodes: &[BvhNode],
    parents: &mut [usize],
    node_counts: &[AtomicUsize],
    flags: &[AtomicU8],
) {
    let parents_view = UnsafeSlice::new(parents);
    parallel_for(pool, 0..nodes.len(), |range, _| {
        for i in range {
            let node = &nodes[i];
            node_counts[i].store(1, Ordering::Relaxed);
            flags[i].store(0, Ordering::Relaxed);
            if node.primitive_count == 0 {
                let first_child = node.first_child_or_primitive as usize;
                // Safety: each node has exactly one parent, so these
                // writes never collide across tiles
                unsafe {
                    parents_view.write(first_child, i);
                    parents_view.write(first_child + 1, i);
                }
            }
        }
    });
    parents[0] = NO_PARENT;
}

// Walk up from every leaf, deciding at each fully-reported inner node
// whether to fuse its two leaf children. A collapsed node keeps the
// total primitive count; its children are marked for removal by
// zeroing their entries.
fn bottom_up_sweep(
    pool: &ThreadPool,
    nodes: &[BvhNode],
    parents: &[usize],
    primitive_counts: &[AtomicUsize],
    node_counts: &[AtomicUsize],
    flags: &[AtomicU8],
    traversal_cost: Real,
) {
    parallel_for(pool, 0..nodes.len(), |range, _| {
        for i in range {
            let node = &nodes[i];
            if node.primitive_count == 0 {
                continue;
            }

            primitive_counts[i].store(node.primitive_count as usize, Ordering::Relaxed);

            // Walk up the parents of this node towards the root
            let mut j = parents[i];
            while j != NO_PARENT {
                // Terminate this path if the sibling has not reported yet;
                // the second visitor performs the check below
                if flags[j].fetch_add(1, Ordering::Relaxed) == 0 {
                    break;
                }
                let parent = &nodes[j];
                debug_assert!(parent.primitive_count == 0);

                let first_child = parent.first_child_or_primitive as usize;
                let left_count = primitive_counts[first_child].load(Ordering::Relaxed);
                let right_count = primitive_counts[first_child + 1].load(Ordering::Relaxed);
                // Both children must be (possibly fused) leaves
                if left_count == 0 || right_count == 0 {
                    break;
                }

                let left = &nodes[first_child];
                let right = &nodes[first_child + 1];
                let total_count = left_count + right_count;
                let collapse_cost =
                    parent.bbox().half_area() * (total_count as Real - traversal_cost);
                let keep_cost = left.bbox().half_area() * left_count as Real
                    + right.bbox().half_area() * right_count as Real;
                if collapse_cost < keep_cost {
                    primitive_counts[j].store(total_count, Ordering::Relaxed);
                    primitive_counts[first_child].store(0, Ordering::Relaxed);
                    primitive_counts[first_child + 1].store(0, Ordering::Relaxed);
                    node_counts[first_child].store(0, Ordering::Relaxed);
                    node_counts[first_child + 1].store(0, Ordering::Relaxed);
                } else {
                    // This subtree is cheaper as it is; nothing above it
                    // can collapse either
                    break;
                }

                j = parents[j];
            }
        }
    });
}

/// Collapses the leaves of the given BVH according to the SAH, fusing
/// subtrees into leaves whenever
/// `half_area(parent) * (count - traversal_cost)` is cheaper than the
/// children kept separate. The node and primitive-index arrays are
/// rewritten in place; surviving nodes keep their relative order.
pub fn collapse_leaves(pool: &ThreadPool, bvh: &mut Bvh, traversal_cost: Real) {
    let node_count = bvh.node_count();

    let mut parents = vec![0usize; node_count];
    let node_counts: Vec<AtomicUsize> = (0..node_count).map(|_| AtomicUsize::new(0)).collect();
    let flags: Vec<AtomicU8> = (0..node_count).map(|_| AtomicU8::new(0)).collect();
    init_parents(pool, &bvh.nodes, &mut parents, &node_counts, &flags);

    // Traverse the BVH from bottom to top, collapsing leaves on the way
    let primitive_counts: Vec<AtomicUsize> =
        (0..node_count).map(|_| AtomicUsize::new(0)).collect();
    bottom_up_sweep(
        pool,
        &bvh.nodes,
        &parents,
        &primitive_counts,
        &node_counts,
        &flags,
        traversal_cost,
    );

    // Sum the nodes and primitives kept in each chunk of the array.
    // Leaves are likely to cluster in small parts of the BVH, so use
    // more chunks than workers to balance the load.
    let task_count = pool.thread_count() * CHUNK_TASKS_PER_THREAD;
    let chunk_size = compute_chunk_size(node_count, task_count);
    let mut sums = vec![(0usize, 0usize); task_count];
    pool.scope(|scope| {
        for (k, sum) in sums.iter_mut().enumerate() {
            let begin = compute_chunk_begin(chunk_size, k, node_count);
            let end = compute_chunk_end(chunk_size, k, node_count);
            let node_counts = &node_counts;
            let primitive_counts = &primitive_counts;
            scope.submit(move |_| {
                for i in begin..end {
                    sum.0 += node_counts[i].load(Ordering::Relaxed);
                    sum.1 += primitive_counts[i].load(Ordering::Relaxed);
                }
            });
        }
        scope.wait(0);
    });

    let kept_node_count: usize = sums.iter().map(|sum| sum.0).sum();
    let total_primitive_count: usize = sums.iter().map(|sum| sum.1).sum();
    debug_assert_eq!(total_primitive_count, bvh.primitive_indices.len());

    // Rewrite the nodes and the primitive indices based on the sums.
    // Collapsed subtrees are flattened in prefix order so every new
    // leaf covers a contiguous run of the new index array.
    let mut dst_nodes = vec![BvhNode::default(); kept_node_count];
    let mut dst_primitive_indices = vec![0usize; total_primitive_count];
    {
        let nodes: &[BvhNode] = &bvh.nodes;
        let src_primitive_indices: &[usize] = &bvh.primitive_indices;
        let parents: &[usize] = &parents;
        let dst_nodes_view = UnsafeSlice::new(&mut dst_nodes);
        let dst_indices_view = UnsafeSlice::new(&mut dst_primitive_indices);
        let mut first_node = 0;
        let mut first_primitive = 0;
        pool.scope(|scope| {
            for (k, sum) in sums.iter().enumerate() {
                let begin = compute_chunk_begin(chunk_size, k, node_count);
                let end = compute_chunk_end(chunk_size, k, node_count);
                let mut next_node = first_node;
                let mut next_primitive = first_primitive;
                first_node += sum.0;
                first_primitive += sum.1;
                let node_counts = &node_counts;
                let primitive_counts = &primitive_counts;
                let dst_nodes_view = &dst_nodes_view;
                let dst_indices_view = &dst_indices_view;
                scope.submit(move |_| {
                    for i in begin..end {
                        if node_counts[i].load(Ordering::Relaxed) == 0 {
                            continue;
                        }
                        // Reuse the node-count entry as the remap table
                        // from old to new node indices
                        let new_index = next_node;
                        next_node += 1;
                        node_counts[i].store(new_index, Ordering::Relaxed);

                        let mut node = nodes[i];
                        let fused_count = primitive_counts[i].load(Ordering::Relaxed);
                        if fused_count != 0 {
                            node.primitive_count = fused_count as Bits;
                            node.first_child_or_primitive = next_primitive as Bits;

                            // Flatten the subtree in prefix order, using
                            // the parent links instead of a stack
                            let mut j = i;
                            'walk: loop {
                                let current = &nodes[j];
                                if current.primitive_count > 0 {
                                    let first = current.first_child_or_primitive as usize;
                                    for p in first..first + current.primitive_count as usize {
                                        // Safety: destination ranges are
                                        // disjoint by the offset sums
                                        unsafe {
                                            dst_indices_view.write(
                                                next_primitive,
                                                src_primitive_indices[p],
                                            );
                                        }
                                        next_primitive += 1;
                                    }
                                    // Ascend until a left child lets us
                                    // step into its right sibling
                                    loop {
                                        if j == i {
                                            break 'walk;
                                        }
                                        let parent = parents[j];
                                        let first_child =
                                            nodes[parent].first_child_or_primitive as usize;
                                        if j == first_child {
                                            j = first_child + 1;
                                            continue 'walk;
                                        }
                                        j = parent;
                                    }
                                } else {
                                    j = current.first_child_or_primitive as usize;
                                }
                            }
                        }
                        // Safety: see above
                        unsafe { dst_nodes_view.write(new_index, node) };
                    }
                });
            }
            scope.wait(0);
        });
    }

    // Remap the children of the kept inner nodes to their new indices
    {
        let node_counts: &[AtomicUsize] = &node_counts;
        let dst_nodes_view = UnsafeSlice::new(&mut dst_nodes);
        parallel_for(pool, 0..kept_node_count, |range, _| {
            for i in range {
                // Safety: tiles are disjoint
                let mut node = unsafe { dst_nodes_view.read(i) };
                if node.primitive_count == 0 {
                    let first_child = node.first_child_or_primitive as usize;
                    node.first_child_or_primitive =
                        node_counts[first_child].load(Ordering::Relaxed) as Bits;
                    unsafe { dst_nodes_view.write(i, node) };
                }
            }
        });
    }

    debug!(
        "collapsed BVH from {} to {} nodes (traversal cost {})",
        node_count, kept_node_count, traversal_cost
    );
    bvh.nodes = dst_nodes;
    bvh.primitive_indices = dst_primitive_indices;
}

#[cfg(test)]
mod collapse_test {

    use super::*;
    use crate::bbox::Bbox;
    use crate::bvh::build::build_bvh;
    use crate::bvh::validation::check_tree;
    use crate::vector::vec3;
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

    fn build_over_boxes(pool: &ThreadPool, boxes: &[Bbox]) -> crate::bvh::Bvh {
        build_bvh(pool, boxes.len(), |i| boxes[i], |i| boxes[i].center())
    }

    #[test]
    fn zero_cost_keeps_the_tree() {
        // With a zero traversal cost a collapse can never pay off, so
        // the sweep must keep every node
        let pool = make_pool();
        let boxes = random_boxes(200, 11);
        let mut bvh = build_over_boxes(&pool, &boxes);
        let node_count = bvh.node_count();
        collapse_leaves(&pool, &mut bvh, 0.0);
        assert_eq!(bvh.node_count(), node_count);
        check_tree(&bvh, boxes.len());
    }

    #[test]
    fn huge_cost_collapses_to_one_leaf() {
        let pool = make_pool();
        let boxes = random_boxes(64, 13);
        let mut bvh = build_over_boxes(&pool, &boxes);
        collapse_leaves(&pool, &mut bvh, 1.0e9);
        assert_eq!(bvh.node_count(), 1);
        assert!(bvh.root().is_leaf());
        assert_eq!(bvh.root().primitive_count as usize, boxes.len());
        check_tree(&bvh, boxes.len());
    }

    #[test]
    fn two_tight_pairs_become_two_leaves() {
        // Two pairs of coincident boxes, far apart. At traversal cost
        // 1.5 each pair's parent is cheaper as a two-primitive leaf,
        // but the root must stay an inner node.
        let pool = make_pool();
        let near = Bbox::from_triangle(
            vec3(0.0, 0.0, 0.0),
            vec3(1.0, 0.0, 0.0),
            vec3(0.0, 1.0, 0.0),
        );
        let far = Bbox::from_triangle(
            vec3(100.0, 0.0, 0.0),
            vec3(101.0, 0.0, 0.0),
            vec3(100.0, 1.0, 0.0),
        );
        let boxes = [near, near, far, far];
        let mut bvh = build_over_boxes(&pool, &boxes);
        assert_eq!(bvh.node_count(), 7);
        collapse_leaves(&pool, &mut bvh, 1.5);
        assert_eq!(bvh.node_count(), 3);
        assert!(!bvh.root().is_leaf());
        let left = bvh.root().first_child_or_primitive as usize;
        assert_eq!(bvh.nodes[left].primitive_count, 2);
        assert_eq!(bvh.nodes[left + 1].primitive_count, 2);
        check_tree(&bvh, 4);
    }

    #[test]
    fn collapse_only_shrinks() {
        let pool = make_pool();
        for cost in [0.5, 1.2, 1.5, 3.0] {
            let boxes = random_boxes(300, 17);
            let mut bvh = build_over_boxes(&pool, &boxes);
            let node_count = bvh.node_count();
            collapse_leaves(&pool, &mut bvh, cost);
            assert!(bvh.node_count() <= node_count);
            check_tree(&bvh, boxes.len());
        }
    }

    #[test]
    fn single_leaf_bvh_is_untouched() {
        let pool = make_pool();
        let boxes = random_boxes(1, 3);
        let mut bvh = build_over_boxes(&pool, &boxes);
        collapse_leaves(&pool, &mut bvh, 1.5);
        assert_eq!(bvh.node_count(), 1);
        check_tree(&bvh, 1);
    }
}
