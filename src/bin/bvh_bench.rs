use rt_accel::bvh::{build_bvh, collapse_leaves};
use rt_accel::mesh::{Mesh, MeshAccel, TRI_TRAVERSAL_COST};
use rt_accel::ray::{Hit, Ray};
use rt_accel::thread_pool::{detect_system_thread_count, ThreadPool};
use rt_accel::utils::Real;
use rt_accel::vector::vec3;

use rand::Rng;
use rand_pcg::Pcg32;
use std::ops::{AddAssign, DivAssign};
use std::time::{Duration, Instant};

/// Benchmark binary for the BVH accelerator

fn main() {
    env_logger::init();

    let runs = 20;
    println!("Benchmarking with {runs} samples.\n");

    let grid_small = wavy_grid(60); // 6,962 triangles
    let grid_medium = wavy_grid(180); // 64,082 triangles
    let grid_large = wavy_grid(640); // 816,642 triangles
    let threads = detect_system_thread_count();

    println!("Performance scaling with triangles ({threads} workers):");
    run_bvh(&grid_small, threads, runs).display(&format!(
        "BVH: wavy grid ({})",
        grid_small.primitive_count()
    ));
    run_bvh(&grid_medium, threads, runs).display(&format!(
        "BVH: wavy grid ({})",
        grid_medium.primitive_count()
    ));
    let large_mt = run_bvh(&grid_large, threads, runs).display(&format!(
        "BVH: wavy grid ({})",
        grid_large.primitive_count()
    ));
    println!("----------------------------------");

    println!("\nMultithreaded scaling on the large grid:");
    run_bvh(&grid_large, 1, runs).display("BVH: wavy grid, 1 worker");
    large_mt.display(&format!("BVH: wavy grid, {threads} workers"));
    println!("----------------------------------");

    println!("\nTriangle soup (random scene):");
    let soup = random_soup(100_000, 42);
    run_bvh(&soup, threads, runs).display("BVH: soup (100,000)");
    println!("----------------------------------");

    println!("\nAll done.");
}

fn run_bvh(mesh: &Mesh, threads: usize, runs: u32) -> BvhConstructionTime {
    let pool = ThreadPool::new(threads).expect("failed to create the thread pool");
    let mut total = BvhConstructionTime::default();
    for _ in 0..runs {
        let mut current = BvhConstructionTime::default();
        let tris: Vec<_> = (0..mesh.primitive_count()).map(|i| mesh.tri(i)).collect();

        let mut now = Instant::now();
        let mut bvh = build_bvh(
            &pool,
            tris.len(),
            |i| tris[i].bbox(),
            |i| tris[i].center(),
        );
        current.build = now.elapsed();

        now = Instant::now();
        collapse_leaves(&pool, &mut bvh, TRI_TRAVERSAL_COST);
        current.collapse = now.elapsed();

        now = Instant::now();
        let accel = MeshAccel::new(&pool, mesh);
        current.accel = now.elapsed();

        now = Instant::now();
        let hits = trace_grid(&accel, mesh, 256);
        current.trace = now.elapsed();
        assert!(hits > 0);

        total += current;
    }
    total /= runs;
    total
}

// Shoot an orthographic grid of rays down onto the scene and count
// the hits
fn trace_grid(accel: &MeshAccel, mesh: &Mesh, resolution: usize) -> usize {
    let mut bound = rt_accel::Bbox::new();
    for vertex in &mesh.vertices {
        bound.include_vertex(*vertex);
    }
    let extent = bound.extent();
    let mut hits = 0;
    for y in 0..resolution {
        for x in 0..resolution {
            let fx = bound.min.0 + extent.0 * (x as Real + 0.5) / resolution as Real;
            let fy = bound.min.1 + extent.1 * (y as Real + 0.5) / resolution as Real;
            let mut ray = Ray::new(
                vec3(fx, fy, bound.max.2 + 1.0),
                vec3(0.0, 0.0, -1.0),
                0.0,
                1.0e9,
            );
            let mut hit = Hit::none();
            if accel.intersect_ray(&mut ray, &mut hit, false) {
                hits += 1;
            }
        }
    }
    hits
}

// Heightfield over an n x n vertex grid, two triangles per cell
fn wavy_grid(n: usize) -> Mesh {
    let mut vertices = Vec::with_capacity(n * n);
    for y in 0..n {
        for x in 0..n {
            let fx = x as Real / (n - 1) as Real * 10.0;
            let fy = y as Real / (n - 1) as Real * 10.0;
            vertices.push(vec3(fx, fy, fx.sin() * fy.cos()));
        }
    }
    let mut indices = Vec::with_capacity((n - 1) * (n - 1) * 6);
    for y in 0..n - 1 {
        for x in 0..n - 1 {
            let v0 = (y * n + x) as u32;
            let v1 = v0 + 1;
            let v2 = v0 + n as u32;
            let v3 = v2 + 1;
            indices.extend([v0, v1, v2, v2, v1, v3]);
        }
    }
    Mesh::new_tris(vertices, indices)
}

fn random_soup(count: usize, seed: u64) -> Mesh {
    let mut rng = Pcg32::new(seed, 0xa02bdbf7bb3c0a7);
    let mut vertices = Vec::with_capacity(count * 3);
    let mut indices = Vec::with_capacity(count * 3);
    for i in 0..count {
        let center = vec3(
            rng.gen_range(-10.0..10.0),
            rng.gen_range(-10.0..10.0),
            rng.gen_range(-10.0..10.0),
        );
        for _ in 0..3 {
            vertices.push(
                center
                    + vec3(
                        rng.gen_range(-0.2..0.2),
                        rng.gen_range(-0.2..0.2),
                        rng.gen_range(-0.2..0.2),
                    ),
            );
        }
        indices.extend([3 * i as u32, 3 * i as u32 + 1, 3 * i as u32 + 2]);
    }
    Mesh::new_tris(vertices, indices)
}

/// Wrapper type for accumulating per-phase construction timings

#[derive(Debug, Copy, Clone, Default)]
pub struct BvhConstructionTime {
    pub build: Duration,
    pub collapse: Duration,
    pub accel: Duration,
    pub trace: Duration,
}

impl BvhConstructionTime {
    pub fn total(&self) -> Duration {
        self.build + self.collapse + self.accel + self.trace
    }

    pub fn display(&self, text: &str) -> Self {
        println!("{}", text);
        println!("  build:      {:?}", self.build);
        println!("  collapse:   {:?}", self.collapse);
        println!("  full accel: {:?}", self.accel);
        println!("  trace:      {:?}", self.trace);
        println!("  total:      {:?}", self.total());
        *self
    }
}

impl AddAssign<BvhConstructionTime> for BvhConstructionTime {
    fn add_assign(&mut self, rhs: Self) {
        self.build += rhs.build;
        self.collapse += rhs.collapse;
        self.accel += rhs.accel;
        self.trace += rhs.trace;
    }
}

impl DivAssign<u32> for BvhConstructionTime {
    fn div_assign(&mut self, rhs: u32) {
        self.build /= rhs;
        self.collapse /= rhs;
        self.accel /= rhs;
        self.trace /= rhs;
    }
}
