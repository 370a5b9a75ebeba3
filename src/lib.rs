/// CPU ray-tracing accelerator: a parallel builder and traverser for
/// bounding volume hierarchies over triangle and quad meshes.
///
/// The construction pipeline runs entirely on a caller-owned worker
/// pool: Morton encoding, a parallel radix sort, locally-ordered
/// agglomerative clustering, and an SAH leaf collapse pass. Per-ray
/// queries answer closest-hit or any-hit questions through a small
/// explicit traversal stack.

pub mod bbox;
pub mod bvh;
pub mod mesh;
pub mod morton;
pub mod parallel;
pub mod primitives;
pub mod radix_sort;
pub mod ray;
pub mod thread_pool;
pub mod utils;
pub mod vector;

pub use bbox::Bbox;
pub use bvh::{build_bvh, collapse_leaves, intersect_bvh, Bvh, BvhNode};
pub use mesh::{Mesh, MeshAccel, MeshType};
pub use primitives::{Quad, Tri};
pub use ray::{Hit, Ray, INVALID_PRIMITIVE_INDEX};
pub use thread_pool::{detect_system_thread_count, ThreadPool};
pub use utils::Real;
