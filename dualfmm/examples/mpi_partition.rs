//! Partition check: the rank sub-boxes tile the global box and the body
//! counts stay within tolerance of `N/P`. Run with e.g.
//! `mpirun -n 4 cargo run --example mpi_partition --features mpi`.
#[cfg(feature = "mpi")]
fn main() {
    use dualfmm::tree::bounds::{allreduce_bounds, BoundBox};
    use dualfmm::tree::helpers::bodies_fixture;
    use dualfmm::tree::partition::Partition;
    use dualfmm::Bounds;
    use mpi::collective::SystemOperation;
    use mpi::traits::{Communicator, CommunicatorCollectives, Root};

    let universe = mpi::initialize().unwrap();
    let world = universe.world();
    let rank = world.rank();
    let size = world.size();

    let n_local = 25_000;
    let mut bodies = bodies_fixture::<f64>(n_local, Some(-1.0), Some(1.0), Some(7 + rank as u64));

    let bound_box = BoundBox::new(1000);
    let local_bounds = bound_box.bounds(&bodies, None);
    let global_bounds = allreduce_bounds(&world, &local_bounds);
    let partition = Partition::new(&world);
    let my_box = partition.octsection(&mut bodies, &global_bounds).unwrap();

    // Each body landed in its owner's box.
    for b in bodies.iter() {
        assert!(my_box.contains(&b.position));
    }

    // No body was lost and the shares are balanced.
    let mut n_global = 0i64;
    world.all_reduce_into(&(bodies.len() as i64), &mut n_global, SystemOperation::sum());
    assert_eq!(n_global, n_local as i64 * size as i64);
    let share = n_global as f64 / size as f64;
    assert!(
        (bodies.len() as f64 - share).abs() < 0.05 * share + 8.0,
        "rank {} holds {} bodies, expected about {}",
        rank,
        bodies.len(),
        share
    );

    // The sub-boxes are pairwise disjoint and their union is the global
    // box: gather them at the root rank and check.
    let root = world.process_at_rank(0);
    let mut boxes = vec![Bounds::<f64>::empty(); size as usize];
    if rank == 0 {
        root.gather_into_root(&my_box, &mut boxes[..]);
        let mut volume = 0.0;
        for (i, a) in boxes.iter().enumerate() {
            volume += (0..3).map(|d| a.max[d] - a.min[d]).product::<f64>();
            for b in boxes.iter().skip(i + 1) {
                let overlap: f64 = (0..3)
                    .map(|d| (a.max[d].min(b.max[d]) - a.min[d].max(b.min[d])).max(0.0))
                    .product();
                assert!(overlap < 1e-12, "rank boxes overlap");
            }
        }
        let global_volume: f64 = (0..3)
            .map(|d| global_bounds.max[d] - global_bounds.min[d])
            .product();
        assert!((volume - global_volume).abs() < 1e-9 * global_volume);
        println!("octsection over {} ranks: boxes tile the domain", size);
    } else {
        root.gather_into(&my_box);
    }

    println!("rank {}: {} bodies in {:?}", rank, bodies.len(), my_box.min);
}

#[cfg(not(feature = "mpi"))]
fn main() {}
