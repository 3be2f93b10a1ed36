//! Distributed driver: partition, local tree, LET exchange, local and
//! remote traversals, dipole correction. Run with e.g.
//! `mpirun -n 4 cargo run --example mpi_fmm --features mpi`.
#[cfg(feature = "mpi")]
fn main() {
    use dualfmm::fmm::let_exchange::TreeMpi;
    use dualfmm::fmm::traversal::Traversal;
    use dualfmm::fmm::up_down_pass::UpDownPass;
    use dualfmm::tree::bounds::{allreduce_bounds, BoundBox};
    use dualfmm::tree::build::TreeBuilder;
    use dualfmm::tree::helpers::bodies_fixture;
    use dualfmm::tree::partition::Partition;
    use dualfmm::{KernelParams, LaplaceKernel};
    use mpi::collective::SystemOperation;
    use mpi::traits::{Communicator, CommunicatorCollectives};

    let (universe, _threading) =
        mpi::initialize_with_threading(mpi::Threading::Funneled).unwrap();
    let world = universe.world();
    let rank = world.rank();
    let size = world.size();

    // Parameters
    let n_local = 10_000;
    let ncrit = 64;
    let nspawn = 1000;
    let order = 4;
    let theta = 0.4;
    let images = 0;
    let cycle = [2.0 * std::f64::consts::PI; 3];
    let graft = true;

    let mut bodies = bodies_fixture::<f64>(n_local, Some(0.0), Some(1.0), Some(rank as u64));

    // Partition the global domain and move bodies to their owners.
    let bound_box = BoundBox::new(nspawn);
    let local_bounds = bound_box.bounds(&bodies, None);
    let global_bounds = allreduce_bounds(&world, &local_bounds);
    let partition = Partition::new(&world);
    let local_bounds = partition.octsection(&mut bodies, &global_bounds).unwrap();

    // Every body now lies in this rank's sub-box, and the counts stay
    // balanced.
    for b in bodies.iter() {
        assert!(local_bounds.contains(&b.position));
    }
    let mut n_global = 0i64;
    world.all_reduce_into(&(bodies.len() as i64), &mut n_global, SystemOperation::sum());
    assert_eq!(n_global, n_local as i64 * size as i64);
    let share = n_global as f64 / size as f64;
    assert!(
        (bodies.len() as f64 - share).abs() < 0.05 * share + 8.0,
        "rank {} holds {} of {} bodies",
        rank,
        bodies.len(),
        n_global
    );

    // Local tree and upward pass.
    let builder = TreeBuilder::new(ncrit, nspawn).unwrap();
    let mut buffer = Vec::new();
    let mut tree = builder.build(&mut bodies, &mut buffer, &local_bounds);
    let kernel = LaplaceKernel::new(order, KernelParams::default()).unwrap();
    let pass = UpDownPass::new(&kernel, theta, false, false);
    let mut expansions = pass.upward_pass(&mut tree, &bodies);

    // Build and exchange the Local Essential Trees.
    let mut tree_mpi = TreeMpi::new(&world, images);
    tree_mpi.allgather_bounds(&local_bounds);
    tree_mpi.set_let(&tree, &expansions, &bodies, cycle).unwrap();
    tree_mpi.comm_let().unwrap();

    // Local traversal, then the remote contributions.
    let traversal = Traversal::new(&kernel, nspawn, images);
    let mut trg = vec![[0.0f64; 4]; bodies.len()];
    let stats = traversal
        .traverse(
            &tree,
            &mut expansions,
            &bodies,
            &mut trg,
            None,
            cycle,
            true,
            false,
        )
        .unwrap();
    let mut m2l_total = stats.m2l_total();
    let mut p2p_total = stats.p2p_total();

    if size > 1 {
        if graft {
            if let Some((gtree, gexp)) =
                tree_mpi.graft(&kernel, nspawn, &global_bounds).unwrap()
            {
                let stats = traversal
                    .traverse(
                        &tree,
                        &mut expansions,
                        &bodies,
                        &mut trg,
                        Some((&gtree, &gexp, tree_mpi.recv_bodies())),
                        cycle,
                        true,
                        false,
                    )
                    .unwrap();
                m2l_total += stats.m2l_total();
                p2p_total += stats.p2p_total();
            }
        } else {
            for irank in 1..size {
                let r = ((rank + irank) % size) as usize;
                let (let_tree, let_expansions) = tree_mpi.get_let(r).unwrap();
                let stats = traversal
                    .traverse(
                        &tree,
                        &mut expansions,
                        &bodies,
                        &mut trg,
                        Some((&let_tree, &let_expansions, tree_mpi.recv_bodies())),
                        cycle,
                        true,
                        false,
                    )
                    .unwrap();
                m2l_total += stats.m2l_total();
                p2p_total += stats.p2p_total();
            }
        }
    }

    pass.downward_pass(&tree, &mut expansions, &bodies, &mut trg);
    for (b, t) in bodies.iter_mut().zip(trg.iter()) {
        b.potential = t[0];
        b.gradient = [t[1], t[2], t[3]];
    }

    // Periodic surface correction over the global dipole.
    if images > 0 {
        let local_dipole = pass.dipole(&bodies, global_bounds.center());
        let mut global_dipole = [0.0f64; 3];
        world.all_reduce_into(
            &local_dipole[..],
            &mut global_dipole[..],
            SystemOperation::sum(),
        );
        pass.dipole_correction(&mut bodies, global_dipole, n_global as usize, cycle);
    }

    println!(
        "rank {}: {} bodies, {} cells, depth {}, {} M2L pairs, {} P2P pairs, {} LET bodies",
        rank,
        bodies.len(),
        tree.cells.len(),
        tree.depth(),
        m2l_total,
        p2p_total,
        tree_mpi.recv_bodies().len()
    );
}

#[cfg(not(feature = "mpi"))]
fn main() {}
