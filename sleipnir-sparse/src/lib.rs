//! Block compressed sparse row storage and block LU/ILU factorization.
//!
//! The nonzero unit of every matrix in this crate is a small dense
//! `bsize × bsize` block, one per mesh node pair. The block-level structure
//! is described by a [`nalgebra_sparse::pattern::SparsityPattern`] and is
//! fixed at construction; values may be zeroed and accumulated repeatedly.

mod bcsr;
mod factor;

pub use bcsr::{spmv_bcsr, spmv_bcsr_par, BcsrMatrix, ColumnIndex};
pub use factor::{BcsrLu, SingularBlock};

pub use nalgebra_sparse::pattern::SparsityPattern;
