//! Plain data structures shared by the tree and FMM engines.
use num::Float;

/// Per-body accumulator written by the evaluation: potential followed by the
/// three gradient components of the potential.
pub type Accumulator<T> = [T; 4];

/// A point source/target record.
///
/// Bodies are the unit of exchange between the caller and the engine: the
/// caller supplies `position` and `charge`, the engine writes `potential` and
/// `gradient` back. The `index` field carries the caller's original slot so
/// results can be matched up after the tree build (and, in the distributed
/// setting, after repartitioning) has permuted the array. The `key` field
/// packs spatial bits: the partition records its per-level bisection path in
/// the low bits, and periodic wrapping flags occupy the top bits (see
/// [`crate::tree::helpers::wrap`]).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Body<T>
where
    T: Float,
{
    /// Position in Cartesian space.
    pub position: [T; 3],

    /// Source strength.
    pub charge: T,

    /// Accumulated potential at this body.
    pub potential: T,

    /// Accumulated potential gradient at this body.
    pub gradient: [T; 3],

    /// Original index in the caller's array.
    pub index: u64,

    /// Packed spatial bits (bisection path, periodic wrap flags).
    pub key: u64,
}

impl<T> Default for Body<T>
where
    T: Float,
{
    fn default() -> Self {
        Body::new([T::zero(); 3], T::zero())
    }
}

impl<T> Body<T>
where
    T: Float,
{
    /// A body with the given position and charge and cleared accumulators.
    pub fn new(position: [T; 3], charge: T) -> Self {
        Body {
            position,
            charge,
            potential: T::zero(),
            gradient: [T::zero(); 3],
            index: 0,
            key: 0,
        }
    }

    /// Reset the target accumulators.
    pub fn clear_targets(&mut self) {
        self.potential = T::zero();
        self.gradient = [T::zero(); 3];
    }
}

/// An axis-aligned box described by its minimum and maximum corners.
///
/// Bounds are rectangular in general: the distributed partition assigns each
/// rank a rectangular sub-box. The tree is always built over the cubic hull,
/// obtained from [`Bounds::cube`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds<T>
where
    T: Float,
{
    /// Minimum corner.
    pub min: [T; 3],

    /// Maximum corner.
    pub max: [T; 3],
}

impl<T> Bounds<T>
where
    T: Float,
{
    /// A zero-extent box at the origin.
    pub fn empty() -> Self {
        Bounds {
            min: [T::zero(); 3],
            max: [T::zero(); 3],
        }
    }

    /// The smallest box containing both operands.
    pub fn union(&self, other: &Self) -> Self {
        let mut min = [T::zero(); 3];
        let mut max = [T::zero(); 3];
        for d in 0..3 {
            min[d] = self.min[d].min(other.min[d]);
            max[d] = self.max[d].max(other.max[d]);
        }
        Bounds { min, max }
    }

    /// Geometric centre of the box.
    pub fn center(&self) -> [T; 3] {
        let half = T::from(0.5).unwrap();
        let mut x = [T::zero(); 3];
        for d in 0..3 {
            x[d] = (self.min[d] + self.max[d]) * half;
        }
        x
    }

    /// Cubic hull as a centre and half-width. The half-width is inflated by a
    /// small relative margin so bodies on the boundary bin strictly inside.
    pub fn cube(&self) -> ([T; 3], T) {
        let half = T::from(0.5).unwrap();
        let center = self.center();
        let mut radius = T::zero();
        for d in 0..3 {
            radius = radius.max((self.max[d] - self.min[d]) * half);
        }
        let margin = T::from(1.0 + 1.0e-5).unwrap();
        (center, radius * margin)
    }

    /// Whether the point lies inside the box (boundary inclusive).
    pub fn contains(&self, x: &[T; 3]) -> bool {
        (0..3).all(|d| self.min[d] <= x[d] && x[d] <= self.max[d])
    }

    /// Distance from a point to the nearest point of the box, zero inside.
    pub fn distance(&self, x: &[T; 3]) -> T {
        let mut d2 = T::zero();
        for d in 0..3 {
            let lo = self.min[d] - x[d];
            let hi = x[d] - self.max[d];
            let dx = lo.max(hi).max(T::zero());
            d2 = d2 + dx * dx;
        }
        d2.sqrt()
    }
}

/// A node of the cell arena.
///
/// Cells reference bodies by a contiguous range into the shared body array
/// and their children by a contiguous range into the cell arena; both ranges
/// are fixed at build time. Expansion coefficients are stored outside the
/// arena in [`crate::fmm::types::Expansions`], addressed by `(level,
/// level_index)`, and interaction counters in
/// [`crate::fmm::types::TraversalStats`], addressed by arena index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cell<T>
where
    T: Float,
{
    /// Cell centre.
    pub center: [T; 3],

    /// Geometric half-width of the cell cube.
    pub radius: T,

    /// Acceptance radius used by the multipole acceptance test, written by
    /// the upward pass. Infinite when the opening angle disables multipole
    /// acceptance altogether.
    pub rcrit: T,

    /// First body owned by this cell's subtree.
    pub body_offset: usize,

    /// Number of bodies in this cell's subtree.
    pub n_bodies: usize,

    /// Arena index of the first child; children are contiguous.
    pub child_offset: usize,

    /// Number of children. Zero marks a leaf.
    pub n_children: usize,

    /// Arena index of the parent; the root points at itself.
    pub parent: usize,

    /// Refinement level, zero at the root.
    pub level: usize,

    /// Position of this cell within its level, used to address coefficient
    /// storage.
    pub level_index: usize,
}

impl<T> Default for Cell<T>
where
    T: Float,
{
    fn default() -> Self {
        Cell {
            center: [T::zero(); 3],
            radius: T::zero(),
            rcrit: T::zero(),
            body_offset: 0,
            n_bodies: 0,
            child_offset: 0,
            n_children: 0,
            parent: 0,
            level: 0,
            level_index: 0,
        }
    }
}

impl<T> Cell<T>
where
    T: Float,
{
    /// Whether the cell has no children.
    pub fn is_leaf(&self) -> bool {
        self.n_children == 0
    }

    /// Range of this cell's bodies in the shared body array.
    pub fn bodies(&self) -> std::ops::Range<usize> {
        self.body_offset..self.body_offset + self.n_bodies
    }

    /// Range of this cell's children in the arena.
    pub fn children(&self) -> std::ops::Range<usize> {
        self.child_offset..self.child_offset + self.n_children
    }
}

/// An adaptive octree over a body array.
///
/// `cells[0]` is the root and spans the full cubic hull of the bounds the
/// tree was built over. `levels[l]` lists the arena indices of the cells at
/// level `l` in ascending order; a cell's `level_index` is its position in
/// that list.
#[derive(Debug, Clone)]
pub struct CellTree<T>
where
    T: Float,
{
    /// Cell arena. Index 0 is the root.
    pub cells: Vec<Cell<T>>,

    /// Arena indices grouped by level.
    pub levels: Vec<Vec<usize>>,

    /// Bounds the tree was built over.
    pub bounds: Bounds<T>,
}

impl<T> CellTree<T>
where
    T: Float,
{
    /// Deepest level present in the tree.
    pub fn depth(&self) -> usize {
        self.levels.len().saturating_sub(1)
    }

    /// The root cell.
    pub fn root(&self) -> &Cell<T> {
        &self.cells[0]
    }

    /// Arena indices of all leaves, in ascending order.
    pub fn leaves(&self) -> impl Iterator<Item = usize> + '_ {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_leaf())
            .map(|(i, _)| i)
    }
}

pub(crate) fn sub3<T: Float>(a: &[T; 3], b: &[T; 3]) -> [T; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

pub(crate) fn add3<T: Float>(a: &[T; 3], b: &[T; 3]) -> [T; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

pub(crate) fn neg3<T: Float>(a: &[T; 3]) -> [T; 3] {
    [-a[0], -a[1], -a[2]]
}

pub(crate) fn norm3<T: Float>(a: &[T; 3]) -> T {
    a[0] * a[0] + a[1] * a[1] + a[2] * a[2]
}

#[cfg(feature = "mpi")]
mod mpi_types {
    use super::{Body, Bounds};
    use memoffset::offset_of;
    use mpi::{
        datatype::{UncommittedUserDatatype, UserDatatype},
        traits::Equivalence,
        Address,
    };
    use num::Float;

    unsafe impl<T> Equivalence for Bounds<T>
    where
        T: Float + Equivalence,
    {
        type Out = UserDatatype;
        fn equivalent_datatype() -> Self::Out {
            UserDatatype::structured(
                &[1, 1],
                &[
                    offset_of!(Bounds<T>, min) as Address,
                    offset_of!(Bounds<T>, max) as Address,
                ],
                &[
                    UncommittedUserDatatype::contiguous(3, &T::equivalent_datatype()).as_ref(),
                    UncommittedUserDatatype::contiguous(3, &T::equivalent_datatype()).as_ref(),
                ],
            )
        }
    }

    unsafe impl<T> Equivalence for Body<T>
    where
        T: Float + Equivalence,
    {
        type Out = UserDatatype;
        fn equivalent_datatype() -> Self::Out {
            UserDatatype::structured(
                &[1, 1, 1, 1, 1, 1],
                &[
                    offset_of!(Body<T>, position) as Address,
                    offset_of!(Body<T>, charge) as Address,
                    offset_of!(Body<T>, potential) as Address,
                    offset_of!(Body<T>, gradient) as Address,
                    offset_of!(Body<T>, index) as Address,
                    offset_of!(Body<T>, key) as Address,
                ],
                &[
                    UncommittedUserDatatype::contiguous(3, &T::equivalent_datatype()).as_ref(),
                    UncommittedUserDatatype::contiguous(1, &T::equivalent_datatype()).as_ref(),
                    UncommittedUserDatatype::contiguous(1, &T::equivalent_datatype()).as_ref(),
                    UncommittedUserDatatype::contiguous(3, &T::equivalent_datatype()).as_ref(),
                    UncommittedUserDatatype::contiguous(1, &u64::equivalent_datatype()).as_ref(),
                    UncommittedUserDatatype::contiguous(1, &u64::equivalent_datatype()).as_ref(),
                ],
            )
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_bounds_cube_is_cubic_and_contains() {
        let bounds = Bounds {
            min: [0.0f64, -1.0, 2.0],
            max: [4.0, 1.0, 3.0],
        };
        let (center, radius) = bounds.cube();
        assert_eq!(center, [2.0, 0.0, 2.5]);
        // Largest extent is 4 along x, inflated half-width just above 2.
        assert!(radius > 2.0 && radius < 2.001);
        for corner in [bounds.min, bounds.max] {
            for d in 0..3 {
                assert!((corner[d] - center[d]).abs() <= radius);
            }
        }
    }

    #[test]
    fn test_bounds_distance() {
        let bounds = Bounds {
            min: [0.0f64; 3],
            max: [1.0; 3],
        };
        assert_eq!(bounds.distance(&[0.5, 0.5, 0.5]), 0.0);
        assert_eq!(bounds.distance(&[2.0, 0.5, 0.5]), 1.0);
        let d = bounds.distance(&[2.0, 2.0, 0.5]);
        assert!((d - 2.0f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_bounds_union() {
        let a = Bounds {
            min: [0.0f64; 3],
            max: [1.0; 3],
        };
        let b = Bounds {
            min: [-2.0, 0.5, 0.0],
            max: [0.5, 3.0, 0.5],
        };
        let u = a.union(&b);
        assert_eq!(u.min, [-2.0, 0.0, 0.0]);
        assert_eq!(u.max, [1.0, 3.0, 1.0]);
    }
}
