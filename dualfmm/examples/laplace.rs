//! Single-process driver: build, evaluate, and verify against a sampled
//! direct sum.
use dualfmm::fmm::traversal::Traversal;
use dualfmm::tree::helpers::{bodies_fixture, sample_bodies};
use dualfmm::{FmmBuilder, FmmParameters, KernelParams, LaplaceKernel};

fn main() {
    let n_bodies = 20_000;
    let n_targets = 100;
    let order = 4;
    let repeat = 2;
    let params = FmmParameters::<f64> {
        ncrit: 64,
        nspawn: 1000,
        theta: 0.4,
        ..FmmParameters::default()
    };

    let kernel = LaplaceKernel::new(order, KernelParams::default()).unwrap();
    let mut fmm = FmmBuilder::new()
        .parameters(params)
        .unwrap()
        .kernel(kernel)
        .build()
        .unwrap();

    let two_pi = 2.0 * std::f64::consts::PI;
    let mut bodies = bodies_fixture::<f64>(n_bodies, Some(0.0), Some(two_pi), Some(0));

    for step in 0..repeat {
        let stats = fmm.evaluate(&mut bodies).unwrap();
        println!(
            "step {}: {} bodies, {} M2L pairs, {} P2P pairs",
            step,
            bodies.len(),
            stats.m2l_total(),
            stats.p2p_total()
        );
    }

    // Compare a sample of targets against brute force; the sample strides
    // the permuted body array the same way `sample_bodies` does.
    let targets = sample_bodies(&bodies, n_targets);
    let traversal = Traversal::new(fmm.kernel(), params.nspawn, params.images);
    let mut exact = vec![[0.0f64; 4]; targets.len()];
    traversal.direct(&targets, &mut exact, &bodies, params.cycle);

    let stride = (bodies.len() / n_targets).max(1);
    let mut pot_dif = 0.0;
    let mut pot_nrm = 0.0;
    let mut acc_dif = 0.0;
    let mut acc_nrm = 0.0;
    for (b, e) in bodies
        .iter()
        .step_by(stride)
        .take(n_targets)
        .zip(exact.iter())
    {
        pot_dif += (b.potential - e[0]).powi(2);
        pot_nrm += e[0] * e[0];
        for d in 0..3 {
            acc_dif += (b.gradient[d] - e[d + 1]).powi(2);
            acc_nrm += e[d + 1] * e[d + 1];
        }
    }
    println!("Rel. L2 error (pot): {:.3e}", (pot_dif / pot_nrm).sqrt());
    println!("Rel. L2 error (acc): {:.3e}", (acc_dif / acc_nrm).sqrt());
}
