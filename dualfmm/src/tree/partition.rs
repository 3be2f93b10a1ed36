//! Domain decomposition by recursive coordinate bisection.
//!
//! The global box is bisected along alternating axes for ⌈log2 P⌉ levels.
//! At each level every active rank group fixes its split plane with a
//! collective bisection search over allreduced body counts, targeting a
//! body share proportional to the ranks on each side; bodies exactly on a
//! plane deterministically go to the lower side, which keeps the globally
//! shared planes consistent across ranks. Bodies move once, at the end,
//! through a single all-to-all keyed on destination rank.
use itertools::Itertools;
use mpi::{
    collective::SystemOperation,
    datatype::{Partition as BufferPartition, PartitionMut as BufferPartitionMut},
    traits::{Communicator, CommunicatorCollectives, Equivalence},
    Count,
};
use num::Float;
use superslice::Ext;

use crate::traits::types::FmmError;
use crate::tree::helpers::WRAP_SHIFT;
use crate::tree::types::{Body, Bounds};

/// Low bits of [`Body::key`] available to the bisection path; the top bits
/// belong to the periodic wrap flags.
const PATH_MASK: u64 = (1 << WRAP_SHIFT) - 1;

/// Fixed upper bound on plane-search iterations; the search stops earlier
/// once the interval midpoint stops moving.
const MAX_BISECT_ITERS: usize = 128;

/// One rank group during the bisection: a contiguous rank range and its
/// sub-box.
#[derive(Debug, Clone, Copy)]
struct Group<T>
where
    T: Float,
{
    lo: usize,
    hi: usize,
    bounds: Bounds<T>,
}

/// Bisection search for the plane putting `nl/ranks` of the bodies on the
/// lower (inclusive) side. `count_left` reports how many bodies lie at or
/// below a candidate plane; in the distributed setting it hides an
/// allreduce, so every rank must run the identical iteration sequence.
pub(crate) fn bisect_plane<T, F>(
    mut lo: T,
    mut hi: T,
    total: i64,
    nl: i64,
    ranks: i64,
    mut count_left: F,
) -> T
where
    T: Float,
    F: FnMut(T) -> i64,
{
    let half = T::from(0.5).unwrap();
    if total > 0 {
        for _ in 0..MAX_BISECT_ITERS {
            let mid = (lo + hi) * half;
            if mid <= lo || mid >= hi {
                break;
            }
            if count_left(mid) * ranks < total * nl {
                lo = mid;
            } else {
                hi = mid;
            }
        }
    }
    (lo + hi) * half
}

/// Decomposes the global domain across the ranks of a communicator.
pub struct Partition<'c, C>
where
    C: Communicator,
{
    comm: &'c C,
}

impl<'c, C> Partition<'c, C>
where
    C: Communicator,
{
    /// A partitioner over `comm`.
    pub fn new(comm: &'c C) -> Self {
        Partition { comm }
    }

    /// Recursively bisect `global` so each rank owns a contiguous sub-box
    /// with approximately `N/P` bodies, exchange the bodies to their owning
    /// ranks, and return this rank's sub-box. The per-level path of every
    /// body is recorded in the low bits of its key.
    pub fn octsection<T>(
        &self,
        bodies: &mut Vec<Body<T>>,
        global: &Bounds<T>,
    ) -> Result<Bounds<T>, FmmError>
    where
        T: Float + Equivalence,
    {
        let size = self.comm.size() as usize;
        let rank = self.comm.rank() as usize;
        if size <= 1 {
            return Ok(*global);
        }
        let levels = usize::BITS - (size - 1).leading_zeros();
        if levels as u64 >= WRAP_SHIFT as u64 {
            return Err(FmmError::Communication(format!(
                "rank count {} exceeds the bisection path capacity",
                size
            )));
        }

        for b in bodies.iter_mut() {
            b.key &= !PATH_MASK;
        }
        let mut groups = vec![Group {
            lo: 0,
            hi: size,
            bounds: *global,
        }];

        for level in 0..levels {
            let axis = (level as usize) % 3;
            let mut planes: Vec<Option<T>> = vec![None; groups.len()];
            let mut next = Vec::with_capacity(groups.len() * 2);

            for (g_idx, g) in groups.iter().enumerate() {
                let ranks = g.hi - g.lo;
                if ranks < 2 {
                    next.push(*g);
                    next.push(*g);
                    continue;
                }
                let nl = (ranks + 1) / 2;

                let in_group = |b: &Body<T>| (b.key & PATH_MASK) as usize == g_idx;
                let local_total = bodies.iter().filter(|b| in_group(b)).count() as i64;
                let total = self.allreduce_sum(local_total);

                let plane = bisect_plane(
                    g.bounds.min[axis],
                    g.bounds.max[axis],
                    total,
                    nl as i64,
                    ranks as i64,
                    |mid| {
                        let local = bodies
                            .iter()
                            .filter(|b| in_group(b) && b.position[axis] <= mid)
                            .count() as i64;
                        self.allreduce_sum(local)
                    },
                );
                planes[g_idx] = Some(plane);

                let mut left = *g;
                left.hi = g.lo + nl;
                left.bounds.max[axis] = plane;
                let mut right = *g;
                right.lo = g.lo + nl;
                right.bounds.min[axis] = plane;
                next.push(left);
                next.push(right);
            }

            for b in bodies.iter_mut() {
                let path = b.key & PATH_MASK;
                let side = match planes[path as usize] {
                    Some(plane) => (b.position[axis] > plane) as u64,
                    None => 0,
                };
                b.key = (b.key & !PATH_MASK) | (path << 1 | side);
            }
            groups = next;
        }

        // The path orders bodies by destination rank: lower sides hold the
        // lower rank halves.
        bodies.sort_unstable_by_key(|b| b.key & PATH_MASK);
        let dest = |b: &Body<T>| groups[(b.key & PATH_MASK) as usize].lo;
        let counts_snd = (0..size)
            .map(|r| bodies.equal_range_by_key(&r, |b| dest(b)).len() as Count)
            .collect_vec();

        let displs_snd = counts_snd
            .iter()
            .scan(0, |acc, &x| {
                let tmp = *acc;
                *acc += x;
                Some(tmp)
            })
            .collect_vec();

        let mut counts_recv = vec![0 as Count; size];
        self.comm.all_to_all_into(&counts_snd, &mut counts_recv);

        let displs_recv = counts_recv
            .iter()
            .scan(0, |acc, &x| {
                let tmp = *acc;
                *acc += x;
                Some(tmp)
            })
            .collect_vec();

        let total = counts_recv.iter().sum::<Count>();
        let mut received = vec![Body::<T>::default(); total as usize];
        {
            let partition_snd = BufferPartition::new(&bodies[..], counts_snd, &displs_snd[..]);
            let mut partition_recv =
                BufferPartitionMut::new(&mut received[..], counts_recv, &displs_recv[..]);
            self.comm
                .all_to_all_varcount_into(&partition_snd, &mut partition_recv);
        }
        *bodies = received;

        groups
            .iter()
            .find(|g| g.lo == rank)
            .map(|g| g.bounds)
            .ok_or_else(|| {
                FmmError::Communication(format!("rank {} missing from the bisection", rank))
            })
    }

    fn allreduce_sum(&self, local: i64) -> i64 {
        let mut global = 0i64;
        self.comm
            .all_reduce_into(&local, &mut global, SystemOperation::sum());
        global
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_bisect_plane_finds_median() {
        let values: Vec<f64> = (0..1000).map(|i| i as f64 / 1000.0).collect();
        let count = |mid: f64| values.iter().filter(|&&v| v <= mid).count() as i64;
        let plane = bisect_plane(0.0, 1.0, 1000, 1, 2, count);
        let left = count(plane);
        assert!((left - 500).abs() <= 1, "left = {}", left);
    }

    #[test]
    fn test_bisect_plane_proportional_split() {
        // Three ranks: the lower side takes two of them.
        let values: Vec<f64> = (0..900).map(|i| i as f64 / 900.0).collect();
        let count = |mid: f64| values.iter().filter(|&&v| v <= mid).count() as i64;
        let plane = bisect_plane(0.0, 1.0, 900, 2, 3, count);
        let left = count(plane);
        assert!((left - 600).abs() <= 1, "left = {}", left);
    }

    #[test]
    fn test_bisect_plane_coincident_values_go_low() {
        // Every body on the split plane: all land on the lower side and the
        // search still terminates.
        let values = vec![0.5f64; 100];
        let count = |mid: f64| values.iter().filter(|&&v| v <= mid).count() as i64;
        let plane = bisect_plane(0.0, 1.0, 100, 1, 2, count);
        assert_eq!(count(plane), 100);
    }

    #[test]
    fn test_bisect_plane_empty_group() {
        let plane = bisect_plane(0.0, 1.0, 0, 1, 2, |_| 0);
        assert_eq!(plane, 0.5);
    }
}
