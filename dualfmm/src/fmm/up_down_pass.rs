//! Upward and downward expansion passes.
//!
//! Both passes run level by level: the upward pass walks the levels deepest
//! first so children are aggregated before their parents (post-order), the
//! downward pass walks root first so parents are distributed before their
//! children (pre-order). Within a level every cell owns a disjoint chunk of
//! the coefficient array, so the work parallelises without coordination.
use num::Float;
use rayon::prelude::*;

use crate::fmm::types::Expansions;
use crate::traits::kernel::Kernel;
use crate::tree::types::{norm3, sub3, Accumulator, Body, CellTree};

/// Runs the upward (P2M/M2M) and downward (L2L/L2P) passes and maintains the
/// acceptance radii consumed by the traversal.
pub struct UpDownPass<'a, T, K>
where
    T: Float,
{
    kernel: &'a K,
    theta: T,
    use_rmax: bool,
    use_ropt: bool,
}

impl<'a, T, K> UpDownPass<'a, T, K>
where
    T: Float + Send + Sync,
    K: Kernel<T>,
{
    /// A pass driver for the given kernel and opening angle.
    pub fn new(kernel: &'a K, theta: T, use_rmax: bool, use_ropt: bool) -> Self {
        UpDownPass {
            kernel,
            theta,
            use_rmax,
            use_ropt,
        }
    }

    /// Aggregate multipole expansions leaf to root and fix each cell's
    /// acceptance radius.
    pub fn upward_pass(&self, tree: &mut CellTree<T>, bodies: &[Body<T>]) -> Expansions<T> {
        let ncoef = self.kernel.ncoef();
        let mut expansions = Expansions::new(tree, ncoef);
        let depth = tree.depth();

        for level in (0..=depth).rev() {
            let (current, lower) = expansions.multipole_level_pair(level);
            let level_cells = &tree.levels[level];
            let cells = &tree.cells;
            current
                .par_chunks_mut(ncoef)
                .enumerate()
                .for_each(|(i, chunk)| {
                    let cell = &cells[level_cells[i]];
                    if cell.is_leaf() {
                        self.kernel.p2m(cell.center, &bodies[cell.bodies()], chunk);
                    } else {
                        let lower = lower.expect("interior cells have a deeper level");
                        for j in cell.children() {
                            let child = &cells[j];
                            let child_multipole =
                                &lower[child.level_index * ncoef..][..ncoef];
                            self.kernel.m2m(
                                sub3(&child.center, &cell.center),
                                chunk,
                                child_multipole,
                            );
                        }
                    }
                });
        }

        self.set_rcrit(tree, &expansions, bodies);
        expansions
    }

    /// Fix every cell's acceptance radius: `rcrit = R_eff / θ`, where
    /// `R_eff` is the geometric half-width, optionally tightened to the
    /// measured body extent (`use_rmax`) and rescaled by the error-optimised
    /// estimate solved from the cell monopole (`use_ropt`). A non-positive
    /// opening angle makes every radius infinite, demoting all interactions
    /// to direct evaluation.
    fn set_rcrit(&self, tree: &mut CellTree<T>, expansions: &Expansions<T>, bodies: &[Body<T>]) {
        let n = tree.cells.len();

        if self.theta <= T::zero() {
            for c in tree.cells.iter_mut() {
                c.rcrit = T::infinity();
            }
            return;
        }

        let mut rmax = vec![T::zero(); n];
        if self.use_rmax {
            // Children precede parents in reverse arena order.
            for i in (0..n).rev() {
                let c = tree.cells[i];
                rmax[i] = if c.is_leaf() {
                    bodies[c.bodies()]
                        .iter()
                        .map(|b| norm3(&sub3(&b.position, &c.center)).sqrt())
                        .fold(T::zero(), |a, b| a.max(b))
                } else {
                    c.children()
                        .map(|j| {
                            let child = &tree.cells[j];
                            norm3(&sub3(&child.center, &c.center)).sqrt() + rmax[j]
                        })
                        .fold(T::zero(), |a, b| a.max(b))
                };
            }
        }

        let inv_theta = self.theta.recip();
        let order = self.kernel.order() as i32;
        let root_monopole = expansions.multipole(tree.root())[0].abs();
        let use_ropt = self.use_ropt && root_monopole > T::zero();
        let one = T::one();
        let two = T::from(2.0).unwrap();
        let ropt_scale = if use_ropt {
            (one - self.theta) * (one - self.theta) / self.theta.powi(order + 2)
                / root_monopole.cbrt()
        } else {
            T::zero()
        };

        for i in 0..n {
            let r_eff = if self.use_rmax {
                tree.cells[i].radius.min(rmax[i])
            } else {
                tree.cells[i].radius
            };
            let x = if use_ropt {
                // Newton iterations on x^P (x - 1)^2 = a, seeded at 1/θ.
                let monopole = {
                    let c = &tree.cells[i];
                    expansions.multipole(c)[0].abs()
                };
                let a = ropt_scale * monopole.cbrt();
                let mut x = inv_theta;
                for _ in 0..5 {
                    let f = x.powi(order + 2) - two * x.powi(order + 1) + x.powi(order) - a;
                    let df = T::from(order + 2).unwrap() * x.powi(order + 1)
                        - two * T::from(order + 1).unwrap() * x.powi(order)
                        + T::from(order).unwrap() * x.powi(order - 1);
                    x = x - f / df;
                }
                x.max(one)
            } else {
                inv_theta
            };
            tree.cells[i].rcrit = r_eff * x;
        }
    }

    /// Distribute local expansions root to leaf and evaluate them at the
    /// bodies, accumulating into `trg`.
    pub fn downward_pass(
        &self,
        tree: &CellTree<T>,
        expansions: &mut Expansions<T>,
        bodies: &[Body<T>],
        trg: &mut [Accumulator<T>],
    ) {
        let ncoef = self.kernel.ncoef();
        let depth = tree.depth();

        for level in 1..=depth {
            let (current, parent_level) = expansions.local_level_pair(level);
            let level_cells = &tree.levels[level];
            let cells = &tree.cells;
            current
                .par_chunks_mut(ncoef)
                .enumerate()
                .for_each(|(i, chunk)| {
                    let cell = &cells[level_cells[i]];
                    let parent = &cells[cell.parent];
                    let parent_local = &parent_level[parent.level_index * ncoef..][..ncoef];
                    self.kernel
                        .l2l(sub3(&cell.center, &parent.center), chunk, parent_local);
                });
        }

        // Leaves get disjoint chunks of the accumulator, sorted by body
        // range so the scratch can be split in one sweep.
        let mut leaves: Vec<usize> = tree.leaves().filter(|&i| tree.cells[i].n_bodies > 0).collect();
        leaves.sort_unstable_by_key(|&i| tree.cells[i].body_offset);
        let mut tasks = Vec::with_capacity(leaves.len());
        let mut rest = trg;
        let mut covered = 0;
        for &i in leaves.iter() {
            let cell = &tree.cells[i];
            let (_, tail) = rest.split_at_mut(cell.body_offset - covered);
            let (chunk, tail) = tail.split_at_mut(cell.n_bodies);
            rest = tail;
            covered = cell.body_offset + cell.n_bodies;
            tasks.push((i, chunk));
        }
        let expansions = &*expansions;
        tasks.into_par_iter().for_each(|(i, chunk)| {
            let cell = &tree.cells[i];
            self.kernel.l2p(
                cell.center,
                &bodies[cell.bodies()],
                chunk,
                expansions.local(cell),
            );
        });
    }

    /// Net dipole moment of `bodies` about `origin`.
    pub fn dipole(&self, bodies: &[Body<T>], origin: [T; 3]) -> [T; 3] {
        let mut dipole = [T::zero(); 3];
        for b in bodies.iter() {
            for d in 0..3 {
                dipole[d] = dipole[d] + (b.position[d] - origin[d]) * b.charge;
            }
        }
        dipole
    }

    /// Periodic surface-term correction for a non-neutral net dipole,
    /// applied to the written-back body targets. `n_total` is the global
    /// body count (allreduced in the distributed setting). A neutral system
    /// has a zero dipole and this is a no-op.
    pub fn dipole_correction(
        &self,
        bodies: &mut [Body<T>],
        dipole: [T; 3],
        n_total: usize,
        cycle: [T; 3],
    ) {
        let volume = cycle[0] * cycle[1] * cycle[2];
        if volume <= T::zero() || n_total == 0 {
            return;
        }
        let four_pi = T::from(4.0 * std::f64::consts::PI).unwrap();
        let coef = four_pi / (T::from(3.0).unwrap() * volume);
        let norm = norm3(&dipole);
        let n = T::from(n_total).unwrap();
        for b in bodies.iter_mut() {
            if b.charge != T::zero() {
                b.potential = b.potential - coef * norm / n / b.charge;
            }
            for d in 0..3 {
                b.gradient[d] = b.gradient[d] - coef * dipole[d];
            }
        }
    }
}
