use nalgebra::{ClosedAdd, ClosedMul, DMatrix, Scalar};
use nalgebra_sparse::pattern::SparsityPattern;
use num::{One, Zero};
use rayon::prelude::*;
use std::sync::Arc;

/// A block compressed sparse row matrix.
///
/// Each stored entry is a dense `block_size × block_size` block in row-major
/// layout. Column indices are sorted within each block row. The block-level
/// sparsity pattern is immutable and usually shared across several matrices
/// with the same structure (e.g. all matrices created by one assembler).
#[derive(Debug, Clone, PartialEq)]
pub struct BcsrMatrix<T> {
    pattern: Arc<SparsityPattern>,
    block_size: usize,
    values: Vec<T>,
}

impl<T: Scalar + Zero> BcsrMatrix<T> {
    /// Creates a matrix with the given block structure and all blocks zero.
    pub fn from_pattern(pattern: Arc<SparsityPattern>, block_size: usize) -> Self {
        assert!(block_size > 0, "Block size must be positive.");
        let nnz = pattern.nnz();
        Self {
            pattern,
            block_size,
            values: vec![T::zero(); nnz * block_size * block_size],
        }
    }

    /// Creates a matrix with the given block dimensions and no stored blocks.
    pub fn zeros(block_rows: usize, block_cols: usize, block_size: usize) -> Self {
        Self::from_pattern(Arc::new(SparsityPattern::zeros(block_rows, block_cols)), block_size)
    }

    pub fn set_zero(&mut self) {
        self.values.fill(T::zero());
    }
}

impl<T> BcsrMatrix<T> {
    pub fn block_rows(&self) -> usize {
        self.pattern.major_dim()
    }

    pub fn block_cols(&self) -> usize {
        self.pattern.minor_dim()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of scalar rows.
    pub fn rows(&self) -> usize {
        self.block_rows() * self.block_size
    }

    /// Number of scalar columns.
    pub fn cols(&self) -> usize {
        self.block_cols() * self.block_size
    }

    pub fn nnz_blocks(&self) -> usize {
        self.pattern.nnz()
    }

    pub fn pattern(&self) -> &SparsityPattern {
        &self.pattern
    }

    pub fn pattern_arc(&self) -> Arc<SparsityPattern> {
        Arc::clone(&self.pattern)
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [T] {
        &mut self.values
    }

    /// Column indices and block values of block row `i`.
    pub fn block_row(&self, i: usize) -> (&[usize], &[T]) {
        let b2 = self.block_size * self.block_size;
        let offsets = self.pattern.major_offsets();
        let (begin, end) = (offsets[i], offsets[i + 1]);
        (&self.pattern.minor_indices()[begin..end], &self.values[begin * b2..end * b2])
    }

    /// Index into the value array of the block at `(i, j)`, if it is stored.
    pub fn find_block(&self, i: usize, j: usize) -> Option<usize> {
        let offsets = self.pattern.major_offsets();
        let (begin, end) = (offsets[i], offsets[i + 1]);
        let lane = &self.pattern.minor_indices()[begin..end];
        lane.binary_search(&j).ok().map(|pos| begin + pos)
    }

    pub fn block(&self, i: usize, j: usize) -> Option<&[T]> {
        let b2 = self.block_size * self.block_size;
        self.find_block(i, j).map(|idx| &self.values[idx * b2..(idx + 1) * b2])
    }

    pub fn block_mut(&mut self, i: usize, j: usize) -> Option<&mut [T]> {
        let b2 = self.block_size * self.block_size;
        self.find_block(i, j)
            .map(move |idx| &mut self.values[idx * b2..(idx + 1) * b2])
    }
}

impl<T: Scalar + ClosedAdd + Copy> BcsrMatrix<T> {
    /// Accumulates a dense row-major block into the block at `(i, j)`.
    ///
    /// Returns `false` without touching the matrix if `(i, j)` is not part of
    /// the sparsity pattern; the structure is never extended.
    #[must_use]
    pub fn add_to_block(&mut self, i: usize, j: usize, block: &[T]) -> bool {
        let b2 = self.block_size * self.block_size;
        assert_eq!(block.len(), b2, "Block slice must have block_size^2 entries.");
        match self.block_mut(i, j) {
            Some(target) => {
                for (t, b) in target.iter_mut().zip(block) {
                    *t += *b;
                }
                true
            }
            None => false,
        }
    }
}

impl<T: Scalar + Zero + ClosedAdd + ClosedMul + Copy> BcsrMatrix<T> {
    /// Expands the block structure into a dense scalar matrix.
    ///
    /// Intended for tests and small interface blocks; do not call this on a
    /// large interior matrix.
    pub fn to_dense(&self) -> DMatrix<T> {
        let bs = self.block_size;
        let mut dense = DMatrix::zeros(self.rows(), self.cols());
        for i in 0..self.block_rows() {
            let (cols, vals) = self.block_row(i);
            for (&j, block) in cols.iter().zip(vals.chunks_exact(bs * bs)) {
                for r in 0..bs {
                    for c in 0..bs {
                        dense[(i * bs + r, j * bs + c)] = block[r * bs + c];
                    }
                }
            }
        }
        dense
    }
}

/// A column-major index over the stored blocks of a [`BcsrMatrix`].
///
/// `entries[offsets[j]..offsets[j + 1]]` lists `(block_row, value_block)`
/// pairs of block column `j`, with block rows ascending. Built once and used
/// wherever column access is needed (Schur complement formation, symmetric
/// boundary-condition elimination).
#[derive(Debug, Clone)]
pub struct ColumnIndex {
    offsets: Vec<usize>,
    entries: Vec<(usize, usize)>,
}

impl ColumnIndex {
    pub fn column(&self, j: usize) -> &[(usize, usize)] {
        &self.entries[self.offsets[j]..self.offsets[j + 1]]
    }
}

impl<T> BcsrMatrix<T> {
    pub fn column_index(&self) -> ColumnIndex {
        let mut counts = vec![0usize; self.block_cols()];
        for &j in self.pattern.minor_indices() {
            counts[j] += 1;
        }
        let mut offsets = Vec::with_capacity(counts.len() + 1);
        let mut sum = 0;
        offsets.push(0);
        for c in &counts {
            sum += c;
            offsets.push(sum);
        }

        let mut cursor = offsets.clone();
        let mut entries = vec![(0usize, 0usize); self.nnz_blocks()];
        for i in 0..self.block_rows() {
            let begin = self.pattern.major_offsets()[i];
            let end = self.pattern.major_offsets()[i + 1];
            for (idx, &j) in (begin..end).zip(&self.pattern.minor_indices()[begin..end]) {
                entries[cursor[j]] = (i, idx);
                cursor[j] += 1;
            }
        }
        ColumnIndex { offsets, entries }
    }
}

/// Block sparse matrix-vector multiply `y = beta * y + alpha * A * x`.
pub fn spmv_bcsr<T>(beta: T, y: &mut [T], alpha: T, a: &BcsrMatrix<T>, x: &[T])
where
    T: Scalar + Zero + One + ClosedAdd + ClosedMul + Copy,
{
    assert_eq!(y.len(), a.rows(), "Dimension mismatch in y.");
    assert_eq!(x.len(), a.cols(), "Dimension mismatch in x.");
    let bs = a.block_size();
    for (i, y_block) in y.chunks_exact_mut(bs).enumerate() {
        spmv_block_row(beta, y_block, alpha, a, i, x);
    }
}

/// Same as [`spmv_bcsr`], but with block rows processed in parallel.
pub fn spmv_bcsr_par<T>(beta: T, y: &mut [T], alpha: T, a: &BcsrMatrix<T>, x: &[T])
where
    T: Scalar + Zero + One + ClosedAdd + ClosedMul + Copy + Send + Sync,
{
    assert_eq!(y.len(), a.rows(), "Dimension mismatch in y.");
    assert_eq!(x.len(), a.cols(), "Dimension mismatch in x.");
    let bs = a.block_size();
    y.par_chunks_exact_mut(bs)
        .enumerate()
        .for_each(|(i, y_block)| spmv_block_row(beta, y_block, alpha, a, i, x));
}

fn spmv_block_row<T>(beta: T, y_block: &mut [T], alpha: T, a: &BcsrMatrix<T>, i: usize, x: &[T])
where
    T: Scalar + Zero + One + ClosedAdd + ClosedMul + Copy,
{
    let bs = a.block_size();
    for y_i in y_block.iter_mut() {
        *y_i = beta * *y_i;
    }
    let (cols, vals) = a.block_row(i);
    for (&j, block) in cols.iter().zip(vals.chunks_exact(bs * bs)) {
        let x_block = &x[j * bs..(j + 1) * bs];
        for r in 0..bs {
            let mut acc = T::zero();
            for c in 0..bs {
                acc += block[r * bs + c] * x_block[c];
            }
            y_block[r] += alpha * acc;
        }
    }
}
