//! Adaptive octree construction.
//!
//! The build runs in two phases. A grow phase recursively bins each body
//! range into octants with a counting partition, ping-ponging between the
//! caller's body array and a scratch buffer, and fans out over independent
//! octants while ranges are large. A link phase then lays the cells out in an
//! exact-size arena: every subtree's cell count is known from the grow phase,
//! so each branch receives a disjoint, pre-sized index block and child
//! indices are fixed before any recursion spawns.
use num::Float;

use crate::tree::types::{Body, Bounds, Cell, CellTree};

/// Subtree produced by the grow phase.
struct Node<T>
where
    T: Float,
{
    center: [T; 3],
    radius: T,
    body_offset: usize,
    n_bodies: usize,
    n_cells: usize,
    children: Vec<Node<T>>,
}

/// Octant of `x` relative to `center`; coordinates on the split plane go to
/// the lower side.
fn octant<T: Float>(x: &[T; 3], center: &[T; 3]) -> usize {
    ((x[0] > center[0]) as usize)
        | (((x[1] > center[1]) as usize) << 1)
        | (((x[2] > center[2]) as usize) << 2)
}

/// Builds adaptive octrees bounded by a per-leaf body count.
#[derive(Debug, Clone, Copy)]
pub struct TreeBuilder {
    ncrit: usize,
    nspawn: usize,
}

impl TreeBuilder {
    /// A builder splitting cells above `ncrit` bodies and fanning recursion
    /// out in parallel while ranges hold more than `nspawn` bodies.
    ///
    /// Both limits must be positive; they are validated here, before any
    /// tree work.
    pub fn new(ncrit: usize, nspawn: usize) -> Result<Self, std::io::Error> {
        if ncrit == 0 {
            Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "leaf size limit (ncrit) must be positive",
            ))
        } else if nspawn == 0 {
            Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "fan-out threshold (nspawn) must be positive",
            ))
        } else {
            Ok(TreeBuilder { ncrit, nspawn })
        }
    }

    /// Hard recursion depth cap: the level at which halving the cell width
    /// no longer moves the centre coordinate in `T`'s precision, so further
    /// bisection cannot separate coincident points. 52 for `f64`, 23 for
    /// `f32`. A range still above `ncrit` at this depth becomes a forced
    /// leaf.
    pub fn max_depth<T>() -> usize
    where
        T: Float,
    {
        (-T::epsilon().log2()).round().to_usize().unwrap_or(52)
    }

    /// Build an adaptive octree over `bodies` within the cubic hull of
    /// `bounds`.
    ///
    /// Bodies are permuted in place so that every cell's subtree owns a
    /// contiguous range; `buffer` is scratch of the same length, reusable
    /// across repeated builds. Cells are returned in an arena whose index 0
    /// is the root.
    pub fn build<T>(
        &self,
        bodies: &mut [Body<T>],
        buffer: &mut Vec<Body<T>>,
        bounds: &Bounds<T>,
    ) -> CellTree<T>
    where
        T: Float + Send + Sync,
    {
        let (center, radius) = bounds.cube();
        buffer.clear();
        buffer.resize(bodies.len(), Body::default());

        let max_depth = Self::max_depth::<T>();
        let root = self.grow(bodies, buffer, center, radius, 0, true, 0, max_depth);

        let mut cells = vec![Cell::default(); root.n_cells];
        cells[0] = Cell {
            center,
            radius,
            rcrit: T::zero(),
            body_offset: 0,
            n_bodies: root.n_bodies,
            child_offset: if root.children.is_empty() { 0 } else { 1 },
            n_children: root.children.len(),
            parent: 0,
            level: 0,
            level_index: 0,
        };
        if root.n_cells > 1 {
            self.link(&root, 0, &mut cells[1..], 1);
        }

        // Levels follow from parent links; parents always precede children
        // in the arena.
        for i in 1..cells.len() {
            let parent_level = cells[cells[i].parent].level;
            cells[i].level = parent_level + 1;
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

        CellTree {
            cells,
            levels,
            bounds: *bounds,
        }
    }

    /// Recursive octant partition. `src` holds the bodies of this range,
    /// `dst` is the matching scratch range; `src_is_primary` tracks the
    /// ping-pong so leaf ranges always end up in the caller's array.
    #[allow(clippy::too_many_arguments)]
    fn grow<T>(
        &self,
        src: &mut [Body<T>],
        dst: &mut [Body<T>],
        center: [T; 3],
        radius: T,
        level: usize,
        src_is_primary: bool,
        body_offset: usize,
        max_depth: usize,
    ) -> Node<T>
    where
        T: Float + Send + Sync,
    {
        let n = src.len();
        if n <= self.ncrit || level >= max_depth {
            if !src_is_primary {
                dst.copy_from_slice(src);
            }
            return Node {
                center,
                radius,
                body_offset,
                n_bodies: n,
                n_cells: 1,
                children: Vec::new(),
            };
        }

        // Counting partition into octants; the scatter is stable though the
        // tree does not rely on it.
        let mut counts = [0usize; 8];
        for b in src.iter() {
            counts[octant(&b.position, &center)] += 1;
        }
        let mut offsets = [0usize; 8];
        let mut acc = 0;
        for o in 0..8 {
            offsets[o] = acc;
            acc += counts[o];
        }
        let mut cursor = offsets;
        for b in src.iter() {
            let o = octant(&b.position, &center);
            dst[cursor[o]] = *b;
            cursor[o] += 1;
        }

        // Hand each non-empty octant its disjoint pair of sub-ranges; the
        // scattered buffer becomes the child's source.
        let half = radius * T::from(0.5).unwrap();
        let mut work = Vec::with_capacity(8);
        {
            let mut src_rem = &mut *src;
            let mut dst_rem = &mut *dst;
            for o in 0..8 {
                let (dst_sub, rest) = dst_rem.split_at_mut(counts[o]);
                dst_rem = rest;
                let (src_sub, rest) = src_rem.split_at_mut(counts[o]);
                src_rem = rest;
                if counts[o] == 0 {
                    continue;
                }
                let mut child_center = center;
                for d in 0..3 {
                    child_center[d] = if (o >> d) & 1 == 1 {
                        center[d] + half
                    } else {
                        center[d] - half
                    };
                }
                work.push((o, dst_sub, src_sub, child_center));
            }
        }

        let mut slots: Vec<Option<Node<T>>> = work.iter().map(|_| None).collect();
        if n > self.nspawn {
            rayon::scope(|s| {
                for ((o, child_src, child_dst, child_center), slot) in
                    work.into_iter().zip(slots.iter_mut())
                {
                    s.spawn(move |_| {
                        *slot = Some(self.grow(
                            child_src,
                            child_dst,
                            child_center,
                            half,
                            level + 1,
                            !src_is_primary,
                            body_offset + offsets[o],
                            max_depth,
                        ));
                    });
                }
            });
        } else {
            for ((o, child_src, child_dst, child_center), slot) in
                work.into_iter().zip(slots.iter_mut())
            {
                *slot = Some(self.grow(
                    child_src,
                    child_dst,
                    child_center,
                    half,
                    level + 1,
                    !src_is_primary,
                    body_offset + offsets[o],
                    max_depth,
                ));
            }
        }

        let children: Vec<Node<T>> = slots.into_iter().map(|s| s.unwrap()).collect();
        let n_cells = 1 + children.iter().map(|c| c.n_cells).sum::<usize>();
        Node {
            center,
            radius,
            body_offset,
            n_bodies: n,
            n_cells,
            children,
        }
    }

    /// Write the descendants of `node` into their pre-sized arena block.
    /// `block` covers arena indices `[block_start, block_start +
    /// node.n_cells - 1)`; the node's direct children occupy the front of
    /// the block, each child's own descendants a disjoint chunk of the rest.
    fn link<T>(&self, node: &Node<T>, node_index: usize, block: &mut [Cell<T>], block_start: usize)
    where
        T: Float + Send + Sync,
    {
        let k = node.children.len();
        let (child_cells, mut rest) = block.split_at_mut(k);
        let mut rest_start = block_start + k;
        let mut tasks = Vec::with_capacity(k);

        for (i, child) in node.children.iter().enumerate() {
            let child_index = block_start + i;
            child_cells[i] = Cell {
                center: child.center,
                radius: child.radius,
                rcrit: T::zero(),
                body_offset: child.body_offset,
                n_bodies: child.n_bodies,
                child_offset: if child.children.is_empty() {
                    0
                } else {
                    rest_start
                },
                n_children: child.children.len(),
                parent: node_index,
                level: 0,
                level_index: 0,
            };
            let size = child.n_cells - 1;
            let (chunk, r) = rest.split_at_mut(size);
            rest = r;
            if size > 0 {
                tasks.push((child, child_index, chunk, rest_start));
            }
            rest_start += size;
        }

        if node.n_bodies > self.nspawn {
            rayon::scope(|s| {
                for (child, child_index, chunk, start) in tasks {
                    s.spawn(move |_| self.link(child, child_index, chunk, start));
                }
            });
        } else {
            for (child, child_index, chunk, start) in tasks {
                self.link(child, child_index, chunk, start);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tree::bounds::BoundBox;
    use crate::tree::helpers::{bodies_fixture, bodies_fixture_plummer};

    fn build_fixture(
        n: usize,
        ncrit: usize,
        nspawn: usize,
    ) -> (Vec<Body<f64>>, CellTree<f64>) {
        let mut bodies = bodies_fixture::<f64>(n, Some(-1.0), Some(1.0), Some(3));
        let mut buffer = Vec::new();
        let bounds = BoundBox::new(nspawn).bounds(&bodies, None);
        let tree = TreeBuilder::new(ncrit, nspawn)
            .unwrap()
            .build(&mut bodies, &mut buffer, &bounds);
        (bodies, tree)
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(TreeBuilder::new(0, 1000).is_err());
        assert!(TreeBuilder::new(16, 0).is_err());
        assert!(TreeBuilder::new(1, 1).is_ok());
    }

    #[test]
    fn test_leaves_partition_bodies() {
        let n = 5000;
        let (bodies, tree) = build_fixture(n, 16, 200);

        // Every leaf within the limit, ranges tile [0, n) exactly.
        let mut ranges: Vec<_> = tree
            .leaves()
            .map(|i| tree.cells[i].bodies())
            .collect();
        ranges.sort_by_key(|r| r.start);
        let mut next = 0;
        for r in ranges.iter() {
            assert_eq!(r.start, next);
            assert!(r.len() <= 16);
            next = r.end;
        }
        assert_eq!(next, n);

        // The permutation lost no bodies.
        let mut seen: Vec<u64> = bodies.iter().map(|b| b.index).collect();
        seen.sort_unstable();
        assert!(seen.iter().enumerate().all(|(i, &v)| i as u64 == v));
    }

    #[test]
    fn test_cells_are_consistent() {
        let (bodies, tree) = build_fixture(3000, 20, 500);
        let cells = &tree.cells;
        assert_eq!(cells[0].body_offset, 0);
        assert_eq!(cells[0].n_bodies, 3000);
        assert_eq!(cells[0].parent, 0);

        for (i, c) in cells.iter().enumerate() {
            if c.is_leaf() {
                continue;
            }
            // Children tile the parent's body range and point back at it.
            let mut offset = c.body_offset;
            let mut total = 0;
            for j in c.children() {
                assert_eq!(cells[j].parent, i);
                assert_eq!(cells[j].level, c.level + 1);
                assert_eq!(cells[j].body_offset, offset);
                assert!(cells[j].n_bodies > 0);
                offset += cells[j].n_bodies;
                total += cells[j].n_bodies;
            }
            assert_eq!(total, c.n_bodies);
        }

        // Bodies geometrically contained in their leaf cube.
        for i in tree.leaves() {
            let c = &cells[i];
            for b in &bodies[c.bodies()] {
                for d in 0..3 {
                    assert!((b.position[d] - c.center[d]).abs() <= c.radius * (1.0 + 1e-12));
                }
            }
        }

        // Level lists agree with the stored level indexing.
        for (l, list) in tree.levels.iter().enumerate() {
            for (j, &i) in list.iter().enumerate() {
                assert_eq!(cells[i].level, l);
                assert_eq!(cells[i].level_index, j);
            }
        }
        assert_eq!(
            tree.levels.iter().map(|l| l.len()).sum::<usize>(),
            cells.len()
        );
    }

    #[test]
    fn test_parallel_build_matches_sequential() {
        let n = 4000;
        let (bodies_seq, tree_seq) = build_fixture(n, 16, usize::MAX / 2);
        let (bodies_par, tree_par) = build_fixture(n, 16, 64);
        assert_eq!(tree_seq.cells, tree_par.cells);
        assert_eq!(bodies_seq, bodies_par);
    }

    #[test]
    fn test_clustered_distribution() {
        let mut bodies = bodies_fixture_plummer::<f64>(2000, Some(1));
        let mut buffer = Vec::new();
        let bounds = BoundBox::new(1000).bounds(&bodies, None);
        let tree = TreeBuilder::new(8, 1000)
            .unwrap()
            .build(&mut bodies, &mut buffer, &bounds);
        let max_depth = TreeBuilder::max_depth::<f64>();
        for i in tree.leaves() {
            let c = &tree.cells[i];
            assert!(c.n_bodies <= 8 || c.level == max_depth);
        }
    }

    #[test]
    fn test_coincident_bodies_force_leaf() {
        // Identical positions cannot be separated; the depth cap must stop
        // the recursion with one oversized leaf instead of diverging.
        let mut bodies: Vec<Body<f64>> = (0..100)
            .map(|i| {
                let mut b = Body::new([0.25, 0.25, 0.25], 1.0);
                b.index = i as u64;
                b
            })
            .collect();
        let mut buffer = Vec::new();
        let bounds = Bounds {
            min: [0.0; 3],
            max: [1.0; 3],
        };
        let tree = TreeBuilder::new(8, 1000)
            .unwrap()
            .build(&mut bodies, &mut buffer, &bounds);
        let deepest = tree.levels.last().unwrap();
        assert_eq!(deepest.len(), 1);
        let leaf = &tree.cells[deepest[0]];
        assert!(leaf.is_leaf());
        assert_eq!(leaf.n_bodies, 100);
        assert_eq!(leaf.level, TreeBuilder::max_depth::<f64>());
    }

    #[test]
    fn test_empty_and_tiny_inputs() {
        let bounds = Bounds {
            min: [0.0f64; 3],
            max: [1.0; 3],
        };
        let mut buffer = Vec::new();
        let tree = TreeBuilder::new(4, 100)
            .unwrap()
            .build(&mut [], &mut buffer, &bounds);
        assert_eq!(tree.cells.len(), 1);
        assert!(tree.root().is_leaf());
        assert_eq!(tree.root().n_bodies, 0);

        let mut one = vec![Body::new([0.5f64, 0.5, 0.5], 1.0)];
        let tree = TreeBuilder::new(4, 100)
            .unwrap()
            .build(&mut one, &mut buffer, &bounds);
        assert_eq!(tree.cells.len(), 1);
        assert_eq!(tree.root().n_bodies, 1);
    }
}
