use nalgebra::RealField;

pub mod assembler;
pub mod comm;
pub mod distribute;
pub mod element;
pub mod error;
pub mod gmres;
pub mod interp;
pub mod node_map;
pub mod precond;
pub mod procedural;
pub mod reorder;
pub mod schur;
pub mod vector;

pub mod sparse {
    pub use sleipnir_sparse::*;
}

pub extern crate nalgebra;
pub extern crate nalgebra_sparse;

/// A real scalar type.
///
/// Used as a trait alias for the scalar bounds frequently needed by generic `sleipnir` routines.
pub trait Real: RealField + Copy {}

impl<T> Real for T where T: RealField + Copy {}
