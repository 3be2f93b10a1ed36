//! Engine data types: coefficient storage, configuration, diagnostics, and
//! the single-process facade.
use num::Float;

use crate::fmm::traversal::Traversal;
use crate::fmm::up_down_pass::UpDownPass;
use crate::traits::kernel::Kernel;
use crate::traits::types::FmmError;
use crate::tree::bounds::BoundBox;
use crate::tree::build::TreeBuilder;
use crate::tree::types::{Body, Cell, CellTree};

/// Multipole and local expansion coefficients for one tree.
///
/// Coefficients are stored as one flat array per level, addressed by a
/// cell's `(level, level_index)`; the arena cells themselves stay plain
/// data. Splitting by level gives the upward and downward passes disjoint
/// parent/child borrows, and splitting multipoles from locals lets the
/// traversal read source multipoles while writing target locals, even when
/// source and target are the same tree.
#[derive(Debug, Clone)]
pub struct Expansions<T>
where
    T: Float,
{
    ncoef: usize,
    multipoles: Vec<Vec<T>>,
    locals: Vec<Vec<T>>,
}

impl<T> Expansions<T>
where
    T: Float,
{
    /// Zero-initialised coefficient storage shaped after `tree`.
    pub fn new(tree: &CellTree<T>, ncoef: usize) -> Self {
        let multipoles = tree
            .levels
            .iter()
            .map(|l| vec![T::zero(); l.len() * ncoef])
            .collect::<Vec<_>>();
        let locals = multipoles.clone();
        Expansions {
            ncoef,
            multipoles,
            locals,
        }
    }

    /// Multipole-only storage from per-level coefficient arrays, used when
    /// reconstructing a received remote tree whose locals are never needed.
    pub fn from_multipoles(multipoles: Vec<Vec<T>>, ncoef: usize) -> Self {
        let locals = multipoles.iter().map(|l| vec![T::zero(); l.len()]).collect();
        Expansions {
            ncoef,
            multipoles,
            locals,
        }
    }

    /// Coefficients per expansion.
    pub fn ncoef(&self) -> usize {
        self.ncoef
    }

    /// The multipole expansion of `cell`.
    pub fn multipole(&self, cell: &Cell<T>) -> &[T] {
        &self.multipoles[cell.level][cell.level_index * self.ncoef..][..self.ncoef]
    }

    /// The local expansion of `cell`.
    pub fn local(&self, cell: &Cell<T>) -> &[T] {
        &self.locals[cell.level][cell.level_index * self.ncoef..][..self.ncoef]
    }

    /// Mutable multipole expansion of `cell`.
    pub fn multipole_mut(&mut self, cell: &Cell<T>) -> &mut [T] {
        &mut self.multipoles[cell.level][cell.level_index * self.ncoef..][..self.ncoef]
    }

    /// Mutable local expansion of `cell`.
    pub fn local_mut(&mut self, cell: &Cell<T>) -> &mut [T] {
        &mut self.locals[cell.level][cell.level_index * self.ncoef..][..self.ncoef]
    }

    /// Per-level multipole arrays.
    pub(crate) fn multipole_levels(&self) -> &[Vec<T>] {
        &self.multipoles
    }

    /// Mutable level array together with the level below it, for the upward
    /// pass: parents are written while children are read.
    pub(crate) fn multipole_level_pair(&mut self, level: usize) -> (&mut [T], Option<&[T]>) {
        let (head, tail) = self.multipoles.split_at_mut(level + 1);
        (&mut head[level], tail.first().map(|v| v.as_slice()))
    }

    /// Mutable level array together with the level above it, for the
    /// downward pass: children are written while parents are read.
    pub(crate) fn local_level_pair(&mut self, level: usize) -> (&mut [T], &[T]) {
        let (head, tail) = self.locals.split_at_mut(level);
        (&mut tail[0], head[level - 1].as_slice())
    }

    /// Shared multipole levels alongside mutable local levels, for the
    /// traversal application phase.
    pub(crate) fn parts_mut(&mut self) -> (&[Vec<T>], &mut [Vec<T>]) {
        (&self.multipoles, &mut self.locals)
    }
}

/// Interaction-list counters recorded by a traversal, per target cell.
/// Purely diagnostic.
#[derive(Debug, Clone, Default)]
pub struct TraversalStats {
    /// Multipole-to-local evaluations received per target cell.
    pub m2l_count: Vec<usize>,

    /// Direct (particle-to-particle) cell pairs per target cell.
    pub p2p_count: Vec<usize>,
}

impl TraversalStats {
    /// Zeroed counters for `n_cells` target cells.
    pub fn new(n_cells: usize) -> Self {
        TraversalStats {
            m2l_count: vec![0; n_cells],
            p2p_count: vec![0; n_cells],
        }
    }

    /// Total number of multipole evaluations.
    pub fn m2l_total(&self) -> usize {
        self.m2l_count.iter().sum()
    }

    /// Total number of direct cell pairs.
    pub fn p2p_total(&self) -> usize {
        self.p2p_count.iter().sum()
    }
}

/// Plain-value configuration surface of the engine.
#[derive(Debug, Clone, Copy)]
pub struct FmmParameters<T>
where
    T: Float,
{
    /// Maximum bodies per leaf cell.
    pub ncrit: usize,

    /// Body count below which recursive fan-out runs inline instead of
    /// spawning.
    pub nspawn: usize,

    /// Multipole acceptance opening angle. Non-positive values degrade
    /// every interaction to direct evaluation.
    pub theta: T,

    /// Number of periodic image shells; zero for a free-space problem.
    pub images: usize,

    /// Periodic cell extent per axis, used when `images > 0`.
    pub cycle: [T; 3],

    /// Split both cells of a rejected pair at once instead of the larger
    /// one.
    pub dual: bool,

    /// Apply the symmetric contribution of each pair in one pass. Valid
    /// only for non-periodic self-interaction.
    pub mutual: bool,

    /// Tighten acceptance radii to the measured body extent of each cell.
    pub use_rmax: bool,

    /// Tighten acceptance radii with the error-optimised estimate from the
    /// cell monopole.
    pub use_ropt: bool,
}

impl<T> Default for FmmParameters<T>
where
    T: Float,
{
    fn default() -> Self {
        let two_pi = T::from(2.0 * std::f64::consts::PI).unwrap();
        FmmParameters {
            ncrit: 64,
            nspawn: 1000,
            theta: T::from(0.4).unwrap(),
            images: 0,
            cycle: [two_pi; 3],
            dual: true,
            mutual: false,
            use_rmax: false,
            use_ropt: false,
        }
    }
}

/// Single-process FMM facade owning a kernel, a configuration, and the
/// scratch buffer reused across repeated evaluations.
pub struct Fmm<T, K>
where
    T: Float,
{
    pub(crate) kernel: K,
    pub(crate) params: FmmParameters<T>,
    pub(crate) buffer: Vec<Body<T>>,
}

impl<T, K> Fmm<T, K>
where
    T: Float + Send + Sync,
    K: Kernel<T>,
{
    /// The configured parameters.
    pub fn parameters(&self) -> &FmmParameters<T> {
        &self.params
    }

    /// The kernel in use.
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Run one full evaluation cycle over `bodies`.
    ///
    /// Bodies are permuted by the tree build (their `index` field carries
    /// the original slot); potentials and gradients are overwritten with
    /// this cycle's results. The tree, expansions and interaction lists are
    /// rebuilt from scratch on every call and discarded afterwards.
    pub fn evaluate(&mut self, bodies: &mut [Body<T>]) -> Result<TraversalStats, FmmError> {
        let p = self.params;
        let bounds = BoundBox::new(p.nspawn).bounds(bodies, None);
        let builder = TreeBuilder::new(p.ncrit, p.nspawn)?;
        let mut tree = builder.build(bodies, &mut self.buffer, &bounds);

        let up_down = UpDownPass::new(&self.kernel, p.theta, p.use_rmax, p.use_ropt);
        let mut expansions = up_down.upward_pass(&mut tree, bodies);

        let traversal = Traversal::new(&self.kernel, p.nspawn, p.images);
        let mut trg = vec![[T::zero(); 4]; bodies.len()];
        let stats = traversal.traverse(
            &tree,
            &mut expansions,
            bodies,
            &mut trg,
            None,
            p.cycle,
            p.dual,
            p.mutual,
        )?;
        up_down.downward_pass(&tree, &mut expansions, bodies, &mut trg);

        for (b, t) in bodies.iter_mut().zip(trg.iter()) {
            b.potential = t[0];
            b.gradient = [t[1], t[2], t[3]];
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tree::bounds::BoundBox;
    use crate::tree::build::TreeBuilder;
    use crate::tree::helpers::bodies_fixture;

    #[test]
    fn test_expansions_addressing() {
        let mut bodies = bodies_fixture::<f64>(500, None, None, Some(0));
        let mut buffer = Vec::new();
        let bounds = BoundBox::new(1000).bounds(&bodies, None);
        let tree = TreeBuilder::new(16, 1000)
            .unwrap()
            .build(&mut bodies, &mut buffer, &bounds);

        let ncoef = 20;
        let mut exp = Expansions::new(&tree, ncoef);
        for c in tree.cells.iter() {
            assert_eq!(exp.multipole(c).len(), ncoef);
            assert_eq!(exp.local(c).len(), ncoef);
        }

        // Writes through the per-cell views land in disjoint slots.
        for (i, c) in tree.cells.iter().enumerate() {
            exp.multipole_mut(c)[0] = i as f64;
        }
        for (i, c) in tree.cells.iter().enumerate() {
            assert_eq!(exp.multipole(c)[0], i as f64);
        }
    }

}
