use criterion::{criterion_group, criterion_main, Criterion};
use dualfmm::tree::helpers::bodies_fixture;
use dualfmm::{FmmBuilder, FmmParameters, KernelParams, LaplaceKernel};

fn laplace_uniform(c: &mut Criterion) {
    let n = 10_000;
    let params = FmmParameters::<f64> {
        ncrit: 64,
        theta: 0.4,
        ..FmmParameters::default()
    };
    let kernel = LaplaceKernel::new(4, KernelParams::default()).unwrap();
    let mut fmm = FmmBuilder::new()
        .parameters(params)
        .unwrap()
        .kernel(kernel)
        .build()
        .unwrap();
    let mut bodies = bodies_fixture::<f64>(n, Some(0.0), Some(1.0), Some(0));

    c.bench_function("laplace_fmm_10000", |b| {
        b.iter(|| fmm.evaluate(&mut bodies).unwrap())
    });
}

fn laplace_clustered(c: &mut Criterion) {
    use dualfmm::tree::helpers::bodies_fixture_plummer;

    let n = 10_000;
    let params = FmmParameters::<f64> {
        ncrit: 64,
        theta: 0.4,
        ..FmmParameters::default()
    };
    let kernel = LaplaceKernel::new(4, KernelParams::default()).unwrap();
    let mut fmm = FmmBuilder::new()
        .parameters(params)
        .unwrap()
        .kernel(kernel)
        .build()
        .unwrap();
    let mut bodies = bodies_fixture_plummer::<f64>(n, Some(0));

    c.bench_function("laplace_fmm_plummer_10000", |b| {
        b.iter(|| fmm.evaluate(&mut bodies).unwrap())
    });
}

criterion_group!(benches, laplace_uniform, laplace_clustered);
criterion_main!(benches);
