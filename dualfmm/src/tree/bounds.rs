//! Smallest enclosing cube of a body set.
use num::Float;
use rayon::prelude::*;

use crate::tree::types::{Body, Bounds};

/// Computes the bounds of a body distribution, optionally merged with an
/// existing box. Scans run as a rayon min/max reduction once the body count
/// exceeds the fan-out threshold.
#[derive(Debug, Clone, Copy)]
pub struct BoundBox {
    nspawn: usize,
}

impl BoundBox {
    /// A bounds computer that goes parallel above `nspawn` bodies.
    pub fn new(nspawn: usize) -> Self {
        BoundBox {
            nspawn: nspawn.max(1),
        }
    }

    /// The smallest box enclosing `bodies` and, when given, `existing`. An
    /// empty body set yields `existing`, or a zero-extent box when there is
    /// nothing to enclose; this never fails.
    pub fn bounds<T>(&self, bodies: &[Body<T>], existing: Option<Bounds<T>>) -> Bounds<T>
    where
        T: Float + Send + Sync,
    {
        if bodies.is_empty() {
            return existing.unwrap_or_else(Bounds::empty);
        }

        let of_body = |b: &Body<T>| Bounds {
            min: b.position,
            max: b.position,
        };

        let scanned = if bodies.len() > self.nspawn {
            bodies
                .par_iter()
                .fold_with(of_body(&bodies[0]), |acc, b| acc.union(&of_body(b)))
                .reduce(|| of_body(&bodies[0]), |a, b| a.union(&b))
        } else {
            bodies
                .iter()
                .fold(of_body(&bodies[0]), |acc, b| acc.union(&of_body(b)))
        };

        match existing {
            Some(prior) => scanned.union(&prior),
            None => scanned,
        }
    }
}

#[cfg(feature = "mpi")]
mod mpi_bounds {
    use super::{Bounds, Float};
    use mpi::{
        collective::SystemOperation,
        traits::{Communicator, CommunicatorCollectives, Equivalence},
    };

    /// Reduce per-rank bounds to the global box shared by every rank.
    pub fn allreduce_bounds<T, C>(comm: &C, local: &Bounds<T>) -> Bounds<T>
    where
        T: Float + Equivalence,
        C: Communicator,
    {
        let mut min = [T::zero(); 3];
        let mut max = [T::zero(); 3];
        comm.all_reduce_into(&local.min[..], &mut min[..], SystemOperation::min());
        comm.all_reduce_into(&local.max[..], &mut max[..], SystemOperation::max());
        Bounds { min, max }
    }
}

#[cfg(feature = "mpi")]
pub use mpi_bounds::allreduce_bounds;

#[cfg(test)]
mod test {
    use super::*;
    use crate::tree::helpers::bodies_fixture;

    #[test]
    fn test_bounds_contains_all_bodies() {
        let bodies = bodies_fixture::<f64>(10000, Some(-1.0), Some(1.0), Some(0));
        // Exercise both the sequential and the parallel reduction.
        for nspawn in [100, 1_000_000] {
            let bounds = BoundBox::new(nspawn).bounds(&bodies, None);
            for b in bodies.iter() {
                assert!(bounds.contains(&b.position));
            }
        }
    }

    #[test]
    fn test_bounds_merges_existing() {
        let bodies = bodies_fixture::<f64>(100, Some(0.0), Some(1.0), Some(0));
        let prior = Bounds {
            min: [-4.0, 0.0, 0.0],
            max: [0.0, 1.0, 1.0],
        };
        let bounds = BoundBox::new(1000).bounds(&bodies, Some(prior));
        assert_eq!(bounds.min[0], -4.0);
        assert!(bounds.contains(&prior.min));
        for b in bodies.iter() {
            assert!(bounds.contains(&b.position));
        }
    }

    #[test]
    fn test_empty_bodies_never_fail() {
        let bounds = BoundBox::new(1000).bounds::<f64>(&[], None);
        assert_eq!(bounds, Bounds::empty());
        let prior = Bounds {
            min: [0.0f64; 3],
            max: [1.0; 3],
        };
        assert_eq!(BoundBox::new(1000).bounds(&[], Some(prior)), prior);
    }
}
