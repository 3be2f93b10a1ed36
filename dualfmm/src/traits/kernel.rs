//! The kernel capability surface consumed by the tree and traversal engines.
use num::Float;

use crate::tree::types::{neg3, Accumulator, Body};

/// The six-operation interface between the spatial engine and the expansion
/// mathematics of one physical equation.
///
/// The tree build, the upward/downward passes and the dual-tree traversal are
/// written purely against this trait; swapping the physical equation
/// (Laplace-like, oscillatory, vortex) means supplying another
/// implementation. Translation operations take the displacement between the
/// two expansion centres rather than the cells themselves; particle
/// operations take body slices plus a separate accumulator slice so that
/// source data can be read while target data is written.
///
/// The two `*_mutual` variants realise the symmetric-update optimisation of
/// the traversal: the default implementations fall back to two one-way calls,
/// concrete kernels may override them to share work between the directions.
pub trait Kernel<T>: Send + Sync
where
    T: Float,
{
    /// Expansion order: the highest retained multipole degree.
    fn order(&self) -> usize;

    /// Number of coefficients in one multipole or local expansion.
    fn ncoef(&self) -> usize;

    /// Accumulate the multipole expansion of `bodies` about `center`.
    fn p2m(&self, center: [T; 3], bodies: &[Body<T>], multipole: &mut [T]);

    /// Translate a child multipole into its parent. `dx` is the child centre
    /// minus the parent centre.
    fn m2m(&self, dx: [T; 3], parent: &mut [T], child: &[T]);

    /// Convert a source multipole into a target local expansion. `dx` is the
    /// target centre minus the (periodically shifted) source centre.
    fn m2l(&self, dx: [T; 3], local: &mut [T], multipole: &[T]);

    /// Translate a parent local expansion into a child. `dx` is the child
    /// centre minus the parent centre.
    fn l2l(&self, dx: [T; 3], child: &mut [T], parent: &[T]);

    /// Evaluate a local expansion about `center` at each body, accumulating
    /// into `trg`.
    fn l2p(&self, center: [T; 3], bodies: &[Body<T>], trg: &mut [Accumulator<T>], local: &[T]);

    /// Direct particle-to-particle evaluation. Sources are displaced by
    /// `shift` (the periodic image vector); a zero-distance pair contributes
    /// nothing, which also covers the self-interaction inside a leaf's own
    /// pair.
    fn p2p(&self, targets: &[Body<T>], trg: &mut [Accumulator<T>], sources: &[Body<T>], shift: [T; 3]);

    /// Symmetric multipole-to-local between two cells of the same tree,
    /// updating both local expansions in one pass. Only meaningful for
    /// non-periodic self-interaction, hence no shift.
    fn m2l_mutual(
        &self,
        dx: [T; 3],
        target_local: &mut [T],
        source_local: &mut [T],
        target_multipole: &[T],
        source_multipole: &[T],
    ) {
        self.m2l(dx, target_local, source_multipole);
        self.m2l(neg3(&dx), source_local, target_multipole);
    }

    /// Symmetric particle-to-particle between two disjoint leaves of the same
    /// tree, updating both accumulator slices in one pass.
    fn p2p_mutual(
        &self,
        bodies_i: &[Body<T>],
        trg_i: &mut [Accumulator<T>],
        bodies_j: &[Body<T>],
        trg_j: &mut [Accumulator<T>],
    ) {
        let zero = [T::zero(); 3];
        self.p2p(bodies_i, trg_i, bodies_j, zero);
        self.p2p(bodies_j, trg_j, bodies_i, zero);
    }
}
