//! Cartesian Taylor expansion kernel for the Laplace equation.
//!
//! Expansions are in multi-index form: a multipole stores
//! `M_k = Σ_b q_b (X_c − X_b)^k / k!` for `|k| ≤ order`, a local expansion
//! stores the Taylor coefficients of the incoming potential about the cell
//! centre. Translations reduce to multi-index convolutions with the Taylor
//! coefficients of the (softened) Green's function `(r² + eps²)^{-1/2}`,
//! which satisfy the recurrence
//! `|n|·R²·C_n = (1−2|n|)·Σ_i dx_i·C_{n−e_i} + (1−|n|)·Σ_i C_{n−2e_i}`.
use num::Float;

use crate::kernel::KernelParams;
use crate::traits::kernel::Kernel;
use crate::tree::types::{norm3, sub3, Accumulator, Body};

/// Highest supported expansion order; bounds the coefficient tables.
pub const MAX_ORDER: usize = 10;

/// Laplace kernel at a runtime expansion order.
///
/// All order-dependent tables (multi-index enumeration, factorials, index
/// lookup) are precomputed at construction.
#[derive(Debug, Clone)]
pub struct LaplaceKernel<T>
where
    T: Float,
{
    order: usize,
    ncoef: usize,
    eps2: T,
    /// Multi-indices in degree-major order up to degree `2·order`; the first
    /// `ncoef` entries are the expansion indices `|k| ≤ order`.
    multis: Vec<[usize; 3]>,
    /// `kx!·ky!·kz!` per multi-index.
    factorial: Vec<T>,
    /// Dense lookup from a multi-index to its position in `multis`.
    index: Vec<usize>,
}

fn n_multis(degree: usize) -> usize {
    (degree + 1) * (degree + 2) * (degree + 3) / 6
}

impl<T> LaplaceKernel<T>
where
    T: Float,
{
    /// A Laplace kernel of the given expansion order.
    ///
    /// The order is the highest retained multipole degree; it must lie in
    /// `1..=MAX_ORDER`. The wavenumber in `params` is ignored, the softening
    /// term applies to every pairwise distance.
    pub fn new(order: usize, params: KernelParams<T>) -> Result<Self, std::io::Error> {
        if order == 0 || order > MAX_ORDER {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("expansion order must lie in 1..={}", MAX_ORDER),
            ));
        }

        let degree = 2 * order;
        let mut multis = Vec::with_capacity(n_multis(degree));
        for n in 0..=degree {
            for kx in (0..=n).rev() {
                for ky in (0..=n - kx).rev() {
                    multis.push([kx, ky, n - kx - ky]);
                }
            }
        }

        let mut factorials = [T::one(); MAX_ORDER * 2 + 1];
        for i in 1..=degree {
            factorials[i] = factorials[i - 1] * T::from(i).unwrap();
        }
        let factorial = multis
            .iter()
            .map(|k| factorials[k[0]] * factorials[k[1]] * factorials[k[2]])
            .collect();

        let stride = degree + 1;
        let mut index = vec![usize::MAX; stride * stride * stride];
        for (i, k) in multis.iter().enumerate() {
            index[(k[0] * stride + k[1]) * stride + k[2]] = i;
        }

        Ok(LaplaceKernel {
            order,
            ncoef: n_multis(order),
            eps2: params.eps2,
            multis,
            factorial,
            index,
        })
    }

    fn idx(&self, k: [usize; 3]) -> usize {
        let stride = 2 * self.order + 1;
        self.index[(k[0] * stride + k[1]) * stride + k[2]]
    }

    /// Taylor coefficients of the Green's function at displacement `dx`, up
    /// to the given degree.
    fn coefficients(&self, dx: [T; 3], degree: usize) -> Vec<T> {
        let total = n_multis(degree);
        let mut c = vec![T::zero(); total];
        let r2 = norm3(&dx) + self.eps2;
        if r2 == T::zero() {
            return c;
        }
        let invr2 = r2.recip();
        c[0] = invr2.sqrt();

        for i in 1..total {
            let n = self.multis[i];
            let nsum = n[0] + n[1] + n[2];
            let mut first = T::zero();
            let mut second = T::zero();
            for d in 0..3 {
                if n[d] >= 1 {
                    let mut m = n;
                    m[d] -= 1;
                    first = first + dx[d] * c[self.idx(m)];
                }
                if n[d] >= 2 {
                    let mut m = n;
                    m[d] -= 2;
                    second = second + c[self.idx(m)];
                }
            }
            let f1 = T::from(1.0 - 2.0 * nsum as f64).unwrap();
            let f2 = T::from(1.0 - nsum as f64).unwrap();
            c[i] = (f1 * first + f2 * second) * invr2 / T::from(nsum).unwrap();
        }
        c
    }

    /// Powers of each component of `dx` up to `degree`.
    fn powers(&self, dx: [T; 3], degree: usize) -> [Vec<T>; 3] {
        let mut pw = [
            vec![T::one(); degree + 1],
            vec![T::one(); degree + 1],
            vec![T::one(); degree + 1],
        ];
        for d in 0..3 {
            for e in 1..=degree {
                pw[d][e] = pw[d][e - 1] * dx[d];
            }
        }
        pw
    }

    fn monomial(pw: &[Vec<T>; 3], k: &[usize; 3]) -> T {
        pw[0][k[0]] * pw[1][k[1]] * pw[2][k[2]]
    }
}

impl<T> Kernel<T> for LaplaceKernel<T>
where
    T: Float + Send + Sync,
{
    fn order(&self) -> usize {
        self.order
    }

    fn ncoef(&self) -> usize {
        self.ncoef
    }

    fn p2m(&self, center: [T; 3], bodies: &[Body<T>], multipole: &mut [T]) {
        for b in bodies.iter() {
            let dx = sub3(&center, &b.position);
            let pw = self.powers(dx, self.order);
            for (i, k) in self.multis[..self.ncoef].iter().enumerate() {
                multipole[i] = multipole[i] + b.charge * Self::monomial(&pw, k) / self.factorial[i];
            }
        }
    }

    fn m2m(&self, dx: [T; 3], parent: &mut [T], child: &[T]) {
        // Shift from the child centre to the parent centre.
        let s = [-dx[0], -dx[1], -dx[2]];
        let pw = self.powers(s, self.order);
        for (i, k) in self.multis[..self.ncoef].iter().enumerate() {
            let mut acc = T::zero();
            for (u, j) in self.multis[..self.ncoef].iter().enumerate() {
                if j[0] > k[0] || j[1] > k[1] || j[2] > k[2] {
                    continue;
                }
                let d = [k[0] - j[0], k[1] - j[1], k[2] - j[2]];
                acc = acc + child[u] * Self::monomial(&pw, &d) / self.factorial[self.idx(d)];
            }
            parent[i] = parent[i] + acc;
        }
    }

    fn m2l(&self, dx: [T; 3], local: &mut [T], multipole: &[T]) {
        let c = self.coefficients(dx, 2 * self.order);
        for (i, j) in self.multis[..self.ncoef].iter().enumerate() {
            let mut acc = T::zero();
            for (u, k) in self.multis[..self.ncoef].iter().enumerate() {
                let s = self.idx([j[0] + k[0], j[1] + k[1], j[2] + k[2]]);
                acc = acc + multipole[u] * self.factorial[s] * c[s];
            }
            local[i] = local[i] + acc / self.factorial[i];
        }
    }

    fn l2l(&self, dx: [T; 3], child: &mut [T], parent: &[T]) {
        let pw = self.powers(dx, self.order);
        for (i, ki) in self.multis[..self.ncoef].iter().enumerate() {
            let mut acc = T::zero();
            for (u, j) in self.multis[..self.ncoef].iter().enumerate() {
                if j[0] < ki[0] || j[1] < ki[1] || j[2] < ki[2] {
                    continue;
                }
                let d = [j[0] - ki[0], j[1] - ki[1], j[2] - ki[2]];
                // Componentwise binomial coefficient.
                let binom =
                    self.factorial[u] / (self.factorial[i] * self.factorial[self.idx(d)]);
                acc = acc + parent[u] * binom * Self::monomial(&pw, &d);
            }
            child[i] = child[i] + acc;
        }
    }

    fn l2p(&self, center: [T; 3], bodies: &[Body<T>], trg: &mut [Accumulator<T>], local: &[T]) {
        for (bi, b) in bodies.iter().enumerate() {
            let dx = sub3(&b.position, &center);
            let pw = self.powers(dx, self.order);
            let mut acc = [T::zero(); 4];
            for (i, k) in self.multis[..self.ncoef].iter().enumerate() {
                acc[0] = acc[0] + local[i] * Self::monomial(&pw, k);
                for d in 0..3 {
                    if k[d] >= 1 {
                        let mut m = *k;
                        m[d] -= 1;
                        acc[d + 1] =
                            acc[d + 1] + local[i] * T::from(k[d]).unwrap() * Self::monomial(&pw, &m);
                    }
                }
            }
            for v in 0..4 {
                trg[bi][v] = trg[bi][v] + acc[v];
            }
        }
    }

    fn p2p(
        &self,
        targets: &[Body<T>],
        trg: &mut [Accumulator<T>],
        sources: &[Body<T>],
        shift: [T; 3],
    ) {
        for (i, ti) in targets.iter().enumerate() {
            let mut acc = [T::zero(); 4];
            for sj in sources.iter() {
                let dx = [
                    ti.position[0] - sj.position[0] - shift[0],
                    ti.position[1] - sj.position[1] - shift[1],
                    ti.position[2] - sj.position[2] - shift[2],
                ];
                let r2 = norm3(&dx) + self.eps2;
                if r2 == T::zero() {
                    continue;
                }
                let invr2 = r2.recip();
                let invr = invr2.sqrt();
                let qinvr3 = sj.charge * invr * invr2;
                acc[0] = acc[0] + sj.charge * invr;
                acc[1] = acc[1] - dx[0] * qinvr3;
                acc[2] = acc[2] - dx[1] * qinvr3;
                acc[3] = acc[3] - dx[2] * qinvr3;
            }
            for v in 0..4 {
                trg[i][v] = trg[i][v] + acc[v];
            }
        }
    }

    fn m2l_mutual(
        &self,
        dx: [T; 3],
        target_local: &mut [T],
        source_local: &mut [T],
        target_multipole: &[T],
        source_multipole: &[T],
    ) {
        // One coefficient tensor serves both directions: reversing the
        // displacement flips the sign of odd-degree coefficients.
        let c = self.coefficients(dx, 2 * self.order);
        for (i, j) in self.multis[..self.ncoef].iter().enumerate() {
            let mut fwd = T::zero();
            let mut bwd = T::zero();
            for (u, k) in self.multis[..self.ncoef].iter().enumerate() {
                let sum = [j[0] + k[0], j[1] + k[1], j[2] + k[2]];
                let s = self.idx(sum);
                let term = self.factorial[s] * c[s];
                fwd = fwd + source_multipole[u] * term;
                if (sum[0] + sum[1] + sum[2]) % 2 == 0 {
                    bwd = bwd + target_multipole[u] * term;
                } else {
                    bwd = bwd - target_multipole[u] * term;
                }
            }
            target_local[i] = target_local[i] + fwd / self.factorial[i];
            source_local[i] = source_local[i] + bwd / self.factorial[i];
        }
    }
}
