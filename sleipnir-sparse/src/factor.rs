use crate::BcsrMatrix;
use nalgebra::{DMatrix, RealField};
use nalgebra_sparse::pattern::SparsityPattern;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;

/// Reported by [`BcsrLu::factor`] when a pivot block cannot be inverted.
///
/// The factorization must not be applied after this error; callers are
/// expected to check the result of `factor` before any triangular solve.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SingularBlock {
    pub block_row: usize,
}

impl fmt::Display for SingularBlock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Singular pivot block in block row {}", self.block_row)
    }
}

impl Error for SingularBlock {}

/// A block LU factorization with level-of-fill control.
///
/// `fill_level = 0` keeps the pattern of `A` (block ILU(0)), larger levels
/// admit progressively more fill, and `usize::MAX` yields the complete
/// factorization. `L` has an implicit unit diagonal; the diagonal blocks of
/// `U` are stored pre-inverted so that triangular solves only multiply.
#[derive(Debug, Clone)]
pub struct BcsrLu<T> {
    block_size: usize,
    l_pattern: SparsityPattern,
    u_pattern: SparsityPattern,
    l_values: Vec<T>,
    u_values: Vec<T>,
}

impl<T: RealField + Copy> BcsrLu<T> {
    pub fn factor(a: &BcsrMatrix<T>, fill_level: usize) -> Result<Self, SingularBlock> {
        assert_eq!(a.block_rows(), a.block_cols(), "Matrix must be square.");
        let (l_pattern, u_pattern) = symbolic_fill(a.pattern(), fill_level);
        numeric_factor(a, l_pattern, u_pattern)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_rows(&self) -> usize {
        self.u_pattern.major_dim()
    }

    pub fn nnz_l_blocks(&self) -> usize {
        self.l_pattern.nnz()
    }

    pub fn nnz_u_blocks(&self) -> usize {
        self.u_pattern.nnz()
    }

    /// Solves `L U x = v` in place.
    pub fn solve_in_place(&self, v: &mut [T]) {
        let bs = self.block_size;
        assert_eq!(v.len(), self.block_rows() * bs, "Dimension mismatch in v.");
        let b2 = bs * bs;
        let n = self.block_rows();
        let mut tmp = vec![T::zero(); bs];

        // Forward substitution with implicit unit diagonal: y_i = v_i - sum L_ij y_j
        for i in 0..n {
            let (cols, vals) = lane_parts(&self.l_pattern, &self.l_values, i, b2);
            tmp.copy_from_slice(&v[i * bs..(i + 1) * bs]);
            for (&j, block) in cols.iter().zip(vals.chunks_exact(b2)) {
                block_mul_sub(&mut tmp, block, &v[j * bs..(j + 1) * bs], bs);
            }
            v[i * bs..(i + 1) * bs].copy_from_slice(&tmp);
        }

        // Backward substitution: x_i = inv(U_ii) * (y_i - sum_{j > i} U_ij x_j)
        for i in (0..n).rev() {
            let (cols, vals) = lane_parts(&self.u_pattern, &self.u_values, i, b2);
            tmp.copy_from_slice(&v[i * bs..(i + 1) * bs]);
            // The first entry of every U lane is the (inverted) diagonal block.
            for (&j, block) in cols.iter().zip(vals.chunks_exact(b2)).skip(1) {
                block_mul_sub(&mut tmp, block, &v[j * bs..(j + 1) * bs], bs);
            }
            let inv_diag = &vals[..b2];
            let target = &mut v[i * bs..(i + 1) * bs];
            for r in 0..bs {
                let mut acc = T::zero();
                for c in 0..bs {
                    acc += inv_diag[r * bs + c] * tmp[c];
                }
                target[r] = acc;
            }
        }
    }

    /// Solves `L U X = V` in place for every column of a dense matrix.
    pub fn solve_dense_in_place(&self, v: &mut DMatrix<T>) {
        let rows = v.nrows();
        assert_eq!(rows, self.block_rows() * self.block_size, "Dimension mismatch in v.");
        for column in v.as_mut_slice().chunks_exact_mut(rows) {
            self.solve_in_place(column);
        }
    }
}

fn lane_parts<'a, T>(
    pattern: &'a SparsityPattern,
    values: &'a [T],
    i: usize,
    b2: usize,
) -> (&'a [usize], &'a [T]) {
    let offsets = pattern.major_offsets();
    let (begin, end) = (offsets[i], offsets[i + 1]);
    (&pattern.minor_indices()[begin..end], &values[begin * b2..end * b2])
}

/// `target -= block * x` for one `bs x bs` row-major block.
#[inline]
fn block_mul_sub<T: RealField + Copy>(target: &mut [T], block: &[T], x: &[T], bs: usize) {
    for r in 0..bs {
        let mut acc = T::zero();
        for c in 0..bs {
            acc += block[r * bs + c] * x[c];
        }
        target[r] -= acc;
    }
}

/// `out -= a * b` for row-major `bs x bs` blocks.
#[inline]
fn block_gemm_sub<T: RealField + Copy>(out: &mut [T], a: &[T], b: &[T], bs: usize) {
    for r in 0..bs {
        for k in 0..bs {
            let a_rk = a[r * bs + k];
            for c in 0..bs {
                out[r * bs + c] -= a_rk * b[k * bs + c];
            }
        }
    }
}

/// `a = a * b` for row-major `bs x bs` blocks, using `scratch` as temporary.
#[inline]
fn block_mul_assign_right<T: RealField + Copy>(a: &mut [T], b: &[T], scratch: &mut [T], bs: usize) {
    scratch.copy_from_slice(a);
    for r in 0..bs {
        for c in 0..bs {
            let mut acc = T::zero();
            for k in 0..bs {
                acc += scratch[r * bs + k] * b[k * bs + c];
            }
            a[r * bs + c] = acc;
        }
    }
}

/// Computes the level-of-fill L/U block patterns for the given matrix pattern.
///
/// Classic ILU(k) symbolic phase: an original entry has level 0, a fill entry
/// created by pivot `k` from entries of levels `p` and `q` has level
/// `p + q + 1`, and entries whose level exceeds `fill_level` are dropped
/// immediately. The diagonal is always structurally present, so a missing
/// diagonal surfaces as a numeric singular pivot rather than a panic.
fn symbolic_fill(pattern: &SparsityPattern, fill_level: usize) -> (SparsityPattern, SparsityPattern) {
    let n = pattern.major_dim();
    let mut u_rows: Vec<Vec<(usize, usize)>> = Vec::with_capacity(n);

    let mut l_offsets = Vec::with_capacity(n + 1);
    let mut l_indices = Vec::new();
    let mut u_offsets = Vec::with_capacity(n + 1);
    let mut u_indices = Vec::new();
    l_offsets.push(0);
    u_offsets.push(0);

    for i in 0..n {
        let mut row: BTreeMap<usize, usize> = pattern.lane(i).iter().map(|&j| (j, 0)).collect();
        row.entry(i).or_insert(0);

        let mut cursor = 0;
        while let Some((k, lev_ik)) = row.range(cursor..i).next().map(|(&k, &lev)| (k, lev)) {
            for &(j, lev_kj) in &u_rows[k] {
                if j > k {
                    let candidate = lev_ik.saturating_add(lev_kj).saturating_add(1);
                    if candidate <= fill_level {
                        row.entry(j)
                            .and_modify(|lev| *lev = (*lev).min(candidate))
                            .or_insert(candidate);
                    }
                }
            }
            cursor = k + 1;
        }

        let mut u_row = Vec::new();
        for (&j, &lev) in &row {
            if j < i {
                l_indices.push(j);
            } else {
                u_indices.push(j);
                u_row.push((j, lev));
            }
        }
        l_offsets.push(l_indices.len());
        u_offsets.push(u_indices.len());
        u_rows.push(u_row);
    }

    let l_pattern = SparsityPattern::try_from_offsets_and_indices(n, n, l_offsets, l_indices)
        .expect("Internal error: L pattern must be valid.");
    let u_pattern = SparsityPattern::try_from_offsets_and_indices(n, n, u_offsets, u_indices)
        .expect("Internal error: U pattern must be valid.");
    (l_pattern, u_pattern)
}

fn numeric_factor<T: RealField + Copy>(
    a: &BcsrMatrix<T>,
    l_pattern: SparsityPattern,
    u_pattern: SparsityPattern,
) -> Result<BcsrLu<T>, SingularBlock> {
    let n = a.block_rows();
    let bs = a.block_size();
    let b2 = bs * bs;

    let mut l_values = vec![T::zero(); l_pattern.nnz() * b2];
    let mut u_values = vec![T::zero(); u_pattern.nnz() * b2];

    // Scatter index: block column -> slot in the current work row, usize::MAX if absent.
    let mut slot_of_col = vec![usize::MAX; n];
    let mut work: Vec<T> = Vec::new();
    let mut row_cols: Vec<usize> = Vec::new();
    let mut scratch = vec![T::zero(); b2];

    for i in 0..n {
        row_cols.clear();
        row_cols.extend_from_slice(l_pattern.lane(i));
        row_cols.extend_from_slice(u_pattern.lane(i));
        for (slot, &j) in row_cols.iter().enumerate() {
            slot_of_col[j] = slot;
        }
        work.clear();
        work.resize(row_cols.len() * b2, T::zero());

        // Gather the block row of A; its columns are a subset of L ∪ U by construction.
        let (a_cols, a_vals) = a.block_row(i);
        for (&j, block) in a_cols.iter().zip(a_vals.chunks_exact(b2)) {
            let slot = slot_of_col[j];
            work[slot * b2..(slot + 1) * b2].copy_from_slice(block);
        }

        let num_l = l_pattern.lane(i).len();
        for slot_k in 0..num_l {
            let k = row_cols[slot_k];
            // w_k := w_k * inv(U_kk); this becomes L_ik.
            let (u_cols_k, u_vals_k) = lane_parts(&u_pattern, &u_values, k, b2);
            {
                let w_k = &mut work[slot_k * b2..(slot_k + 1) * b2];
                block_mul_assign_right(w_k, &u_vals_k[..b2], &mut scratch, bs);
            }
            scratch.copy_from_slice(&work[slot_k * b2..(slot_k + 1) * b2]);

            for (&j, u_block) in u_cols_k.iter().zip(u_vals_k.chunks_exact(b2)).skip(1) {
                let slot_j = slot_of_col[j];
                if slot_j != usize::MAX {
                    block_gemm_sub(&mut work[slot_j * b2..(slot_j + 1) * b2], &scratch, u_block, bs);
                }
            }
        }

        // Store L row.
        let l_begin = l_pattern.major_offsets()[i];
        l_values[l_begin * b2..(l_begin + num_l) * b2].copy_from_slice(&work[..num_l * b2]);

        // Store U row; invert the diagonal block (always the first U column).
        let u_begin = u_pattern.major_offsets()[i];
        let u_len = u_pattern.lane(i).len();
        u_values[u_begin * b2..(u_begin + u_len) * b2].copy_from_slice(&work[num_l * b2..]);

        let diag = DMatrix::from_row_slice(bs, bs, &u_values[u_begin * b2..u_begin * b2 + b2]);
        let inverse = invert_pivot(diag).ok_or(SingularBlock { block_row: i })?;
        let target = &mut u_values[u_begin * b2..u_begin * b2 + b2];
        for r in 0..bs {
            for c in 0..bs {
                target[r * bs + c] = inverse[(r, c)];
            }
        }

        for &j in &row_cols {
            slot_of_col[j] = usize::MAX;
        }
    }

    Ok(BcsrLu {
        block_size: bs,
        l_pattern,
        u_pattern,
        l_values,
        u_values,
    })
}

/// Inverts a pivot block, treating it as singular when the scaled pivot
/// magnitude falls below tolerance rather than only on exact zero.
fn invert_pivot<T: RealField + Copy>(diag: DMatrix<T>) -> Option<DMatrix<T>> {
    let bs = diag.nrows();
    let lu = diag.lu();
    let mut max_pivot = T::zero();
    let mut min_pivot = T::max_value().unwrap_or_else(T::one);
    let u = lu.u();
    for r in 0..bs {
        let pivot = u[(r, r)].abs();
        max_pivot = max_pivot.max(pivot);
        min_pivot = min_pivot.min(pivot);
    }
    let tol = T::default_epsilon() * nalgebra::convert(100.0) * max_pivot.max(T::one());
    if min_pivot <= tol {
        return None;
    }
    lu.try_inverse()
}
