//! Local Essential Tree (LET) exchange.
//!
//! Each rank selects, per remote rank, the minimal frontier of its tree
//! whose multipole data could be needed by that rank's traversal: descent
//! stops once a subtree is provably admissible for every observer in the
//! remote bounding box, and leaf bodies travel only where a direct
//! interaction remains possible. Payload sizes are exchanged before the
//! payloads themselves; received trees are reconstructed with indices
//! remapped into local arrays. An optional graft mode merges all received
//! trees under one auxiliary tree built with a leaf size of one.
//!
//! Selection, reconstruction and grafting are pure; only the exchange
//! itself ([`TreeMpi`]) needs a communicator and the `mpi` feature.
use std::collections::VecDeque;

use itertools::Itertools;
use num::Float;

#[cfg(feature = "mpi")]
pub use mpi_exchange::TreeMpi;

use crate::fmm::types::Expansions;
use crate::traits::kernel::Kernel;
use crate::traits::types::FmmError;
use crate::tree::build::TreeBuilder;
use crate::tree::types::{sub3, Body, Bounds, Cell, CellTree};

/// Serialized cell of a Local Essential Tree. Child and body offsets are
/// relative to the payload they travel in and remapped on receipt.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LetCell<T>
where
    T: Float,
{
    /// Cell centre.
    pub center: [T; 3],

    /// Geometric half-width.
    pub radius: T,

    /// Acceptance radius.
    pub rcrit: T,

    /// Shipped body count; zero when the leaf's bodies stay home.
    pub n_bodies: u64,

    /// Offset of the shipped bodies within the payload body array.
    pub body_offset: u64,

    /// Number of children shipped.
    pub n_children: u64,

    /// Offset of the first child within the payload cell array.
    pub child_offset: u64,
}

impl<T> Default for LetCell<T>
where
    T: Float,
{
    fn default() -> Self {
        LetCell {
            center: [T::zero(); 3],
            radius: T::zero(),
            rcrit: T::zero(),
            n_bodies: 0,
            body_offset: 0,
            n_children: 0,
            child_offset: 0,
        }
    }
}

/// One rank's outgoing LET.
#[derive(Debug, Clone)]
pub struct LetPayload<T>
where
    T: Float,
{
    /// Serialized cells, breadth first, root first.
    pub cells: Vec<LetCell<T>>,

    /// Multipole coefficients, one expansion per cell in cell order.
    pub multipoles: Vec<T>,

    /// Bodies of the near leaves.
    pub bodies: Vec<Body<T>>,
}

impl<T> Default for LetPayload<T>
where
    T: Float,
{
    fn default() -> Self {
        LetPayload {
            cells: Vec::new(),
            multipoles: Vec::new(),
            bodies: Vec::new(),
        }
    }
}

/// Minimum distance from a point to the remote box over the periodic images.
fn min_distance<T>(center: [T; 3], remote: &Bounds<T>, cycle: [T; 3], images: usize) -> T
where
    T: Float,
{
    if images == 0 {
        return remote.distance(&center);
    }
    let mut best = T::infinity();
    for ix in -1i32..=1 {
        for iy in -1i32..=1 {
            for iz in -1i32..=1 {
                let shifted = [
                    center[0] - cycle[0] * T::from(ix).unwrap(),
                    center[1] - cycle[1] * T::from(iy).unwrap(),
                    center[2] - cycle[2] * T::from(iz).unwrap(),
                ];
                best = best.min(remote.distance(&shifted));
            }
        }
    }
    best
}

/// Select the LET frontier of a local tree for one remote bounding box.
///
/// A subtree is descended only while some observer in the remote box could
/// reject the acceptance test against it (`d_min ≤ 2·rcrit`, taking the
/// worst admissible observer size); past that frontier its multipole alone
/// is provably sufficient. Leaf bodies ship on the same criterion. A remote
/// box beyond every cell's interaction radius therefore receives just the
/// root cell and no bodies.
pub fn select_let<T>(
    tree: &CellTree<T>,
    expansions: &Expansions<T>,
    bodies: &[Body<T>],
    remote: &Bounds<T>,
    cycle: [T; 3],
    images: usize,
) -> LetPayload<T>
where
    T: Float,
{
    let two = T::from(2.0).unwrap();
    let mut payload = LetPayload::default();
    if tree.cells.is_empty() {
        return payload;
    }

    let push = |payload: &mut LetPayload<T>, cell: &Cell<T>| {
        payload.cells.push(LetCell {
            center: cell.center,
            radius: cell.radius,
            rcrit: cell.rcrit,
            n_bodies: 0,
            body_offset: 0,
            n_children: 0,
            child_offset: 0,
        });
        payload
            .multipoles
            .extend_from_slice(expansions.multipole(cell));
    };

    push(&mut payload, tree.root());
    let mut queue = VecDeque::new();
    queue.push_back((0usize, 0usize));

    while let Some((ci, mi)) = queue.pop_front() {
        let cell = &tree.cells[ci];
        let near = min_distance(cell.center, remote, cycle, images) <= two * cell.rcrit;
        if !near {
            continue;
        }
        if cell.is_leaf() {
            if cell.n_bodies > 0 {
                payload.cells[mi].n_bodies = cell.n_bodies as u64;
                payload.cells[mi].body_offset = payload.bodies.len() as u64;
                payload.bodies.extend_from_slice(&bodies[cell.bodies()]);
            }
        } else {
            payload.cells[mi].n_children = cell.n_children as u64;
            payload.cells[mi].child_offset = payload.cells.len() as u64;
            for j in cell.children() {
                let child_msg = payload.cells.len();
                push(&mut payload, &tree.cells[j]);
                queue.push_back((j, child_msg));
            }
        }
    }
    payload
}

/// Rebuild a received LET into a cell tree and multipole expansions. Body
/// offsets become absolute by `body_base` into the shared received-body
/// array.
pub fn reconstruct_let<T>(
    cells_msg: &[LetCell<T>],
    multipoles: &[T],
    body_base: usize,
    ncoef: usize,
) -> Result<(CellTree<T>, Expansions<T>), FmmError>
where
    T: Float,
{
    if cells_msg.is_empty() || multipoles.len() != cells_msg.len() * ncoef {
        return Err(FmmError::Communication(format!(
            "received {} expansion coefficients for {} cells",
            multipoles.len(),
            cells_msg.len()
        )));
    }

    let mut cells: Vec<Cell<T>> = cells_msg
        .iter()
        .map(|m| Cell {
            center: m.center,
            radius: m.radius,
            rcrit: m.rcrit,
            body_offset: body_base + m.body_offset as usize,
            n_bodies: m.n_bodies as usize,
            child_offset: m.child_offset as usize,
            n_children: m.n_children as usize,
            parent: 0,
            level: 0,
            level_index: 0,
        })
        .collect();

    // Serialization is breadth first, so parents precede children.
    for i in 0..cells.len() {
        for j in cells[i].children() {
            if j >= cells.len() || j <= i {
                return Err(FmmError::Communication(
                    "received tree references a cell outside its payload".to_string(),
                ));
            }
            let parent_level = cells[i].level;
            cells[j].parent = i;
            cells[j].level = parent_level + 1;
        }
    }
    let depth = cells.iter().map(|c| c.level).max().unwrap_or(0);
    let mut levels = vec![Vec::new(); depth + 1];
    for (i, c) in cells.iter().enumerate() {
        levels[c.level].push(i);
    }
    for list in levels.iter() {
        for (j, &i) in list.iter().enumerate() {
            cells[i].level_index = j;
        }
    }

    let mut multipole_levels = vec![Vec::new(); depth + 1];
    for (i, c) in cells.iter().enumerate() {
        multipole_levels[c.level].extend_from_slice(&multipoles[i * ncoef..][..ncoef]);
    }

    let root = &cells[0];
    let bounds = Bounds {
        min: [
            root.center[0] - root.radius,
            root.center[1] - root.radius,
            root.center[2] - root.radius,
        ],
        max: [
            root.center[0] + root.radius,
            root.center[1] + root.radius,
            root.center[2] + root.radius,
        ],
    };
    Ok((
        CellTree {
            cells,
            levels,
            bounds,
        },
        Expansions::from_multipoles(multipole_levels, ncoef),
    ))
}

/// Merge several received LETs into one auxiliary tree: every remote root
/// becomes a pseudo-body, an octree with a leaf size of one is built over
/// them, each auxiliary leaf is replaced by the remote root it holds, and
/// the auxiliary interior is re-aggregated with M2M. Returns `None` when
/// there is nothing to graft.
#[allow(clippy::type_complexity)]
pub fn graft_let<T, K>(
    kernel: &K,
    nspawn: usize,
    global: &Bounds<T>,
    lets: &[(&[LetCell<T>], &[T], usize)],
) -> Result<Option<(CellTree<T>, Expansions<T>)>, FmmError>
where
    T: Float + Send + Sync,
    K: Kernel<T>,
{
    let ncoef = kernel.ncoef();
    let lets = lets
        .iter()
        .copied()
        .filter(|(cells, _, _)| !cells.is_empty())
        .collect_vec();
    if lets.is_empty() {
        return Ok(None);
    }

    // Pseudo-bodies at the remote root centres, tagged with the payload
    // index.
    let mut pseudo: Vec<Body<T>> = lets
        .iter()
        .enumerate()
        .map(|(i, (cells, _, _))| {
            let mut b = Body::new(cells[0].center, T::zero());
            b.index = i as u64;
            b
        })
        .collect();
    let mut buffer = Vec::new();
    let aux = TreeBuilder::new(1, nspawn)?.build(&mut pseudo, &mut buffer, global);
    for i in aux.leaves() {
        if aux.cells[i].n_bodies > 1 {
            return Err(FmmError::Failed(
                "cannot graft remote trees with coincident roots".to_string(),
            ));
        }
    }

    // Merged arena: auxiliary cells first, every payload's cells appended
    // with rebased child offsets. `mult_of[i]` remembers where a merged
    // cell's multipole lives in its payload.
    let aux_len = aux.cells.len();
    let mut cells = aux.cells.clone();
    let mut mult_of: Vec<Option<(usize, usize)>> = vec![None; aux_len];
    let mut bases = Vec::with_capacity(lets.len());
    for (li, &(cells_msg, _, body_base)) in lets.iter().enumerate() {
        let base = cells.len();
        bases.push(base);
        for (msg_idx, m) in cells_msg.iter().enumerate() {
            cells.push(Cell {
                center: m.center,
                radius: m.radius,
                rcrit: m.rcrit,
                body_offset: body_base + m.body_offset as usize,
                n_bodies: m.n_bodies as usize,
                child_offset: base + m.child_offset as usize,
                n_children: m.n_children as usize,
                parent: 0,
                level: 0,
                level_index: 0,
            });
            mult_of.push(Some((li, msg_idx)));
        }
    }

    // Replace each auxiliary leaf by the remote root it holds.
    for i in aux.leaves() {
        if aux.cells[i].n_bodies == 0 {
            continue;
        }
        let li = pseudo[aux.cells[i].body_offset].index as usize;
        let root = cells[bases[li]];
        let leaf = &mut cells[i];
        leaf.center = root.center;
        leaf.radius = root.radius;
        leaf.rcrit = root.rcrit;
        leaf.body_offset = root.body_offset;
        leaf.n_bodies = root.n_bodies;
        leaf.child_offset = root.child_offset;
        leaf.n_children = root.n_children;
        mult_of[i] = mult_of[bases[li]];
    }

    // Levels and parents over the reachable cells only; the spliced remote
    // roots themselves are now orphans.
    let mut levels: Vec<Vec<usize>> = Vec::new();
    let mut queue = VecDeque::new();
    queue.push_back((0usize, 0usize));
    while let Some((i, level)) = queue.pop_front() {
        if levels.len() <= level {
            levels.resize(level + 1, Vec::new());
        }
        cells[i].level = level;
        cells[i].level_index = levels[level].len();
        levels[level].push(i);
        for j in cells[i].children() {
            cells[j].parent = i;
            queue.push_back((j, level + 1));
        }
    }

    let tree = CellTree {
        cells,
        levels,
        bounds: *global,
    };
    let mut expansions = Expansions::new(&tree, ncoef);
    for level in tree.levels.iter() {
        for &i in level.iter() {
            if let Some((li, msg_idx)) = mult_of[i] {
                let (_, multipoles, _) = lets[li];
                expansions
                    .multipole_mut(&tree.cells[i])
                    .copy_from_slice(&multipoles[msg_idx * ncoef..][..ncoef]);
            }
        }
    }

    // Aggregate the auxiliary interior bottom-up; children always sit at
    // higher arena indices than their parents.
    for i in (0..aux_len).rev() {
        let cell = tree.cells[i];
        if cell.is_leaf() || mult_of[i].is_some() {
            continue;
        }
        let mut acc = vec![T::zero(); ncoef];
        for j in cell.children() {
            let child = &tree.cells[j];
            let child_multipole = expansions.multipole(child).to_vec();
            kernel.m2m(sub3(&child.center, &cell.center), &mut acc, &child_multipole);
        }
        expansions
            .multipole_mut(&tree.cells[i])
            .copy_from_slice(&acc);
    }

    Ok(Some((tree, expansions)))
}

#[cfg(feature = "mpi")]
mod mpi_exchange {
    use itertools::Itertools;
    use memoffset::offset_of;
    use mpi::{
        datatype::{
            Partition as BufferPartition, PartitionMut as BufferPartitionMut,
            UncommittedUserDatatype, UserDatatype,
        },
        traits::{Communicator, CommunicatorCollectives, Equivalence},
        Address, Count,
    };
    use num::Float;

    use super::{graft_let, reconstruct_let, select_let, LetCell, LetPayload};
    use crate::fmm::types::Expansions;
    use crate::traits::kernel::Kernel;
    use crate::traits::types::FmmError;
    use crate::tree::types::{Body, Bounds, CellTree};

    unsafe impl<T> Equivalence for LetCell<T>
    where
        T: Float + Equivalence,
    {
        type Out = UserDatatype;
        fn equivalent_datatype() -> Self::Out {
            UserDatatype::structured(
                &[1, 1, 1, 1, 1, 1, 1],
                &[
                    offset_of!(LetCell<T>, center) as Address,
                    offset_of!(LetCell<T>, radius) as Address,
                    offset_of!(LetCell<T>, rcrit) as Address,
                    offset_of!(LetCell<T>, n_bodies) as Address,
                    offset_of!(LetCell<T>, body_offset) as Address,
                    offset_of!(LetCell<T>, n_children) as Address,
                    offset_of!(LetCell<T>, child_offset) as Address,
                ],
                &[
                    UncommittedUserDatatype::contiguous(3, &T::equivalent_datatype()).as_ref(),
                    UncommittedUserDatatype::contiguous(1, &T::equivalent_datatype()).as_ref(),
                    UncommittedUserDatatype::contiguous(1, &T::equivalent_datatype()).as_ref(),
                    UncommittedUserDatatype::contiguous(1, &u64::equivalent_datatype()).as_ref(),
                    UncommittedUserDatatype::contiguous(1, &u64::equivalent_datatype()).as_ref(),
                    UncommittedUserDatatype::contiguous(1, &u64::equivalent_datatype()).as_ref(),
                    UncommittedUserDatatype::contiguous(1, &u64::equivalent_datatype()).as_ref(),
                ],
            )
        }
    }

    /// Builds and exchanges Local Essential Trees across the ranks of a
    /// communicator.
    pub struct TreeMpi<'c, T, C>
    where
        T: Float,
        C: Communicator,
    {
        comm: &'c C,
        images: usize,
        ncoef: usize,
        all_bounds: Vec<Bounds<T>>,
        send: Vec<LetPayload<T>>,
        recv_cells: Vec<LetCell<T>>,
        recv_multipoles: Vec<T>,
        recv_bodies: Vec<Body<T>>,
        recv_cell_ranges: Vec<(usize, usize)>,
        recv_body_ranges: Vec<(usize, usize)>,
    }

    impl<'c, T, C> TreeMpi<'c, T, C>
    where
        T: Float + Equivalence + Default + Send + Sync,
        C: Communicator,
    {
        /// An exchanger over `comm` with the given periodic image count.
        pub fn new(comm: &'c C, images: usize) -> Self {
            TreeMpi {
                comm,
                images,
                ncoef: 0,
                all_bounds: Vec::new(),
                send: Vec::new(),
                recv_cells: Vec::new(),
                recv_multipoles: Vec::new(),
                recv_bodies: Vec::new(),
                recv_cell_ranges: Vec::new(),
                recv_body_ranges: Vec::new(),
            }
        }

        /// Collective exchange of every rank's local bounding box.
        pub fn allgather_bounds(&mut self, local: &Bounds<T>) {
            let size = self.comm.size() as usize;
            let mut buffer = vec![Bounds::empty(); size];
            self.comm
                .all_gather_into(std::slice::from_ref(local), &mut buffer[..]);
            self.all_bounds = buffer;
        }

        /// Bounding boxes of all ranks, available after
        /// [`TreeMpi::allgather_bounds`].
        pub fn all_bounds(&self) -> &[Bounds<T>] {
            &self.all_bounds
        }

        /// Select this rank's LET for every remote rank.
        pub fn set_let(
            &mut self,
            tree: &CellTree<T>,
            expansions: &Expansions<T>,
            bodies: &[Body<T>],
            cycle: [T; 3],
        ) -> Result<(), FmmError> {
            let size = self.comm.size() as usize;
            if self.all_bounds.len() != size {
                return Err(FmmError::Communication(
                    "rank bounds must be gathered before building the LET".to_string(),
                ));
            }
            let rank = self.comm.rank() as usize;
            self.ncoef = expansions.ncoef();
            self.send = (0..size)
                .map(|r| {
                    if r == rank {
                        LetPayload::default()
                    } else {
                        select_let(
                            tree,
                            expansions,
                            bodies,
                            &self.all_bounds[r],
                            cycle,
                            self.images,
                        )
                    }
                })
                .collect();
            Ok(())
        }

        /// Exchange the LET payloads: sizes first, then cells, coefficients
        /// and bodies. Fails fatally on inconsistent payload shapes.
        pub fn comm_let(&mut self) -> Result<(), FmmError> {
            let size = self.comm.size() as usize;
            if self.send.len() != size {
                return Err(FmmError::Communication(
                    "the LET must be selected before it can be exchanged".to_string(),
                ));
            }

            let cell_counts = self.send.iter().map(|p| p.cells.len()).collect_vec();
            let body_counts = self.send.iter().map(|p| p.bodies.len()).collect_vec();
            let mult_counts = cell_counts.iter().map(|&c| c * self.ncoef).collect_vec();

            let flat_cells = self
                .send
                .iter()
                .flat_map(|p| p.cells.iter().copied())
                .collect_vec();
            let flat_multipoles = self
                .send
                .iter()
                .flat_map(|p| p.multipoles.iter().copied())
                .collect_vec();
            let flat_bodies = self
                .send
                .iter()
                .flat_map(|p| p.bodies.iter().copied())
                .collect_vec();

            let (recv_cells, cell_recv_counts) = self.exchange(&flat_cells, &cell_counts);
            let (recv_multipoles, mult_recv_counts) =
                self.exchange(&flat_multipoles, &mult_counts);
            let (recv_bodies, body_recv_counts) = self.exchange(&flat_bodies, &body_counts);

            for r in 0..size {
                if mult_recv_counts[r] != cell_recv_counts[r] * self.ncoef {
                    return Err(FmmError::Communication(format!(
                        "rank {} sent {} coefficients for {} cells",
                        r, mult_recv_counts[r], cell_recv_counts[r]
                    )));
                }
            }

            let mut cell_ranges = Vec::with_capacity(size);
            let mut body_ranges = Vec::with_capacity(size);
            let mut cell_cursor = 0;
            let mut body_cursor = 0;
            for r in 0..size {
                cell_ranges.push((cell_cursor, cell_recv_counts[r]));
                body_ranges.push((body_cursor, body_recv_counts[r]));
                cell_cursor += cell_recv_counts[r];
                body_cursor += body_recv_counts[r];
            }

            self.recv_cells = recv_cells;
            self.recv_multipoles = recv_multipoles;
            self.recv_bodies = recv_bodies;
            self.recv_cell_ranges = cell_ranges;
            self.recv_body_ranges = body_ranges;
            Ok(())
        }

        /// Reconstruct the LET received from `rank`. Pass
        /// [`TreeMpi::recv_bodies`] as the source bodies when traversing it.
        pub fn get_let(&self, rank: usize) -> Result<(CellTree<T>, Expansions<T>), FmmError> {
            let (cell_offset, cell_count) =
                *self.recv_cell_ranges.get(rank).ok_or_else(|| {
                    FmmError::Communication(format!("no LET received from rank {}", rank))
                })?;
            let (body_offset, _) = self.recv_body_ranges[rank];
            reconstruct_let(
                &self.recv_cells[cell_offset..][..cell_count],
                &self.recv_multipoles[cell_offset * self.ncoef..][..cell_count * self.ncoef],
                body_offset,
                self.ncoef,
            )
        }

        /// Merge every received LET into one auxiliary source tree; `None`
        /// when nothing was received (single rank). Traverse it against
        /// [`TreeMpi::recv_bodies`].
        #[allow(clippy::type_complexity)]
        pub fn graft<K>(
            &self,
            kernel: &K,
            nspawn: usize,
            global: &Bounds<T>,
        ) -> Result<Option<(CellTree<T>, Expansions<T>)>, FmmError>
        where
            K: Kernel<T>,
        {
            if kernel.ncoef() != self.ncoef {
                return Err(FmmError::Communication(format!(
                    "kernel expects {} coefficients, the exchanged LET carries {}",
                    kernel.ncoef(),
                    self.ncoef
                )));
            }
            let lets = self
                .recv_cell_ranges
                .iter()
                .zip(self.recv_body_ranges.iter())
                .map(|(&(co, cn), &(bo, _))| {
                    (
                        &self.recv_cells[co..][..cn],
                        &self.recv_multipoles[co * self.ncoef..][..cn * self.ncoef],
                        bo,
                    )
                })
                .collect_vec();
            graft_let(kernel, nspawn, global, &lets)
        }

        /// Bodies received with the LETs; they stay available after the
        /// main pass for periodic near-field and long-range corrections.
        pub fn recv_bodies(&self) -> &[Body<T>] {
            &self.recv_bodies
        }

        /// All-to-all with per-rank counts exchanged first.
        fn exchange<V>(&self, flat: &[V], counts: &[usize]) -> (Vec<V>, Vec<usize>)
        where
            V: Equivalence + Copy + Default,
        {
            let size = self.comm.size() as usize;
            let counts_snd = counts.iter().map(|&c| c as Count).collect_vec();
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
            let mut received = vec![V::default(); total as usize];
            {
                let partition_snd = BufferPartition::new(flat, counts_snd, &displs_snd[..]);
                let mut partition_recv = BufferPartitionMut::new(
                    &mut received[..],
                    &counts_recv[..],
                    &displs_recv[..],
                );
                self.comm
                    .all_to_all_varcount_into(&partition_snd, &mut partition_recv);
            }
            (received, counts_recv.iter().map(|&c| c as usize).collect())
        }
    }
}
