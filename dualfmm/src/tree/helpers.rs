//! Helper functions used in testing and driver code: deterministic body
//! distributions, target sampling for verification, and periodic position
//! wrapping.
use num::Float;
use rand::prelude::*;

use crate::tree::types::Body;

/// Bit position of the periodic wrap flags inside [`Body::key`].
pub const WRAP_SHIFT: u32 = 58;

/// Body fixture for testing, uniformly samples positions in each axis from
/// `min` to `max` and charges from `(0, 1)` scaled by `1/n`.
///
/// # Arguments
/// * `n` - The number of bodies to sample.
/// * `min` - The minimum coordinate value along each axis, defaults to 0.
/// * `max` - The maximum coordinate value along each axis, defaults to 1.
/// * `seed` - Random seed, defaults to 0.
pub fn bodies_fixture<T>(n: usize, min: Option<T>, max: Option<T>, seed: Option<u64>) -> Vec<Body<T>>
where
    T: Float + rand::distributions::uniform::SampleUniform,
{
    let seed = seed.unwrap_or(0);
    let mut rng = StdRng::seed_from_u64(seed);

    let between = match (min, max) {
        (Some(min), Some(max)) => rand::distributions::Uniform::from(min..max),
        _ => rand::distributions::Uniform::from(T::zero()..T::one()),
    };
    let charges = rand::distributions::Uniform::from(T::zero()..T::one());
    let scale = T::from(n.max(1)).unwrap().recip();

    (0..n)
        .map(|i| {
            let position = [
                between.sample(&mut rng),
                between.sample(&mut rng),
                between.sample(&mut rng),
            ];
            let mut body = Body::new(position, charges.sample(&mut rng) * scale);
            body.index = i as u64;
            body
        })
        .collect()
}

/// Body fixture for testing, uniformly samples positions on the surface of a
/// sphere of diameter 1 centred at (0.5, 0.5, 0.5).
///
/// # Arguments
/// * `n` - The number of bodies to sample.
pub fn bodies_fixture_sphere<T>(n: usize) -> Vec<Body<T>>
where
    T: Float + rand::distributions::uniform::SampleUniform,
{
    let mut rng = StdRng::seed_from_u64(0);
    let pi = T::from(std::f64::consts::PI).unwrap();
    let two = T::from(2.0).unwrap();
    let half = T::from(0.5).unwrap();

    let between = rand::distributions::Uniform::from(T::zero()..T::one());
    let scale = T::from(n.max(1)).unwrap().recip();

    (0..n)
        .map(|i| {
            let phi = between.sample(&mut rng) * two * pi;
            let theta = ((between.sample(&mut rng) - half) * two).acos();
            let position = [
                half * theta.sin() * phi.cos() + half,
                half * theta.sin() * phi.sin() + half,
                half * theta.cos() + half,
            ];
            let mut body = Body::new(position, between.sample(&mut rng) * scale);
            body.index = i as u64;
            body
        })
        .collect()
}

/// Body fixture for testing, samples a Plummer model projected into the unit
/// cube: strongly clustered around the centre with a sparse halo, the classic
/// stress case for adaptive refinement.
///
/// # Arguments
/// * `n` - The number of bodies to sample.
/// * `seed` - Random seed, defaults to 0.
pub fn bodies_fixture_plummer<T>(n: usize, seed: Option<u64>) -> Vec<Body<T>>
where
    T: Float + rand::distributions::uniform::SampleUniform,
{
    let mut rng = StdRng::seed_from_u64(seed.unwrap_or(0));
    let between = rand::distributions::Uniform::from(T::zero()..T::one());
    let half = T::from(0.5).unwrap();
    let scale = T::from(n.max(1)).unwrap().recip();
    let rmax = T::from(10.0).unwrap();

    let mut bodies = Vec::with_capacity(n);
    while bodies.len() < n {
        let u = between.sample(&mut rng);
        if u == T::zero() {
            continue;
        }
        // Inverse-transform sampled Plummer radius, truncated at the halo.
        let denom = u.powf(-T::from(2.0 / 3.0).unwrap()) - T::one();
        if denom <= T::zero() {
            continue;
        }
        let r = denom.sqrt().recip();
        if r > rmax {
            continue;
        }
        let costheta = between.sample(&mut rng) * T::from(2.0).unwrap() - T::one();
        let sintheta = (T::one() - costheta * costheta).sqrt();
        let phi = between.sample(&mut rng) * T::from(2.0 * std::f64::consts::PI).unwrap();
        let r01 = r / (rmax + rmax);
        let position = [
            half + r01 * sintheta * phi.cos(),
            half + r01 * sintheta * phi.sin(),
            half + r01 * costheta,
        ];
        let mut body = Body::new(position, between.sample(&mut rng) * scale);
        body.index = bodies.len() as u64;
        bodies.push(body);
    }
    bodies
}

/// Decimate `bodies` to at most `n` evenly strided samples with cleared
/// accumulators, for brute-force verification against a direct sum.
pub fn sample_bodies<T>(bodies: &[Body<T>], n: usize) -> Vec<Body<T>>
where
    T: Float,
{
    let stride = (bodies.len() / n.max(1)).max(1);
    bodies
        .iter()
        .step_by(stride)
        .take(n)
        .map(|b| {
            let mut b = *b;
            b.clear_targets();
            b
        })
        .collect()
}

/// Wrap a position into the periodic cell `[-cycle/2, cycle/2)` per axis and
/// return the wrap flags, one bit per axis, suitable for packing into
/// [`Body::key`] at [`WRAP_SHIFT`].
pub fn wrap<T>(position: &mut [T; 3], cycle: &[T; 3]) -> u64
where
    T: Float,
{
    let half = T::from(0.5).unwrap();
    let mut iwrap = 0u64;
    for d in 0..3 {
        if position[d] < -cycle[d] * half {
            position[d] = position[d] + cycle[d];
            iwrap |= 1 << d;
        }
        if position[d] > cycle[d] * half {
            position[d] = position[d] - cycle[d];
            iwrap |= 1 << d;
        }
    }
    iwrap
}

/// Undo [`wrap`], restoring a position to the side of the cell it came from.
pub fn unwrap<T>(position: &mut [T; 3], cycle: &[T; 3], iwrap: u64)
where
    T: Float,
{
    for d in 0..3 {
        if (iwrap >> d) & 1 == 1 {
            if position[d] > T::zero() {
                position[d] = position[d] - cycle[d];
            } else {
                position[d] = position[d] + cycle[d];
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fixture_deterministic() {
        let a = bodies_fixture::<f64>(100, None, None, Some(7));
        let b = bodies_fixture::<f64>(100, None, None, Some(7));
        assert_eq!(a, b);
        assert_eq!(a.len(), 100);
        assert!(a.iter().all(|b| b.charge > 0.0));
    }

    #[test]
    fn test_sphere_fixture_on_surface() {
        let bodies = bodies_fixture_sphere::<f64>(1000);
        for b in bodies.iter() {
            let r2: f64 = b
                .position
                .iter()
                .map(|x| (x - 0.5) * (x - 0.5))
                .sum();
            assert!((r2.sqrt() - 0.5).abs() < 1e-12);
        }
    }

    #[test]
    fn test_sample_bodies_clears_targets() {
        let mut bodies = bodies_fixture::<f64>(1000, None, None, None);
        for b in bodies.iter_mut() {
            b.potential = 1.0;
        }
        let sampled = sample_bodies(&bodies, 100);
        assert_eq!(sampled.len(), 100);
        assert!(sampled.iter().all(|b| b.potential == 0.0));
    }

    #[test]
    fn test_wrap_roundtrip() {
        let cycle = [2.0f64, 2.0, 2.0];
        let mut x = [1.4, -1.2, 0.3];
        let original = x;
        let iwrap = wrap(&mut x, &cycle);
        assert_eq!(iwrap, 0b011);
        for d in 0..3 {
            assert!(x[d] >= -1.0 && x[d] <= 1.0);
        }
        unwrap(&mut x, &cycle, iwrap);
        for d in 0..3 {
            assert!((x[d] - original[d]).abs() < 1e-12);
        }
    }
}
