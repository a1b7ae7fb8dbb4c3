//! Global Schur-complement preconditioning of [`SchurMatrix`] systems.
//!
//! The interior blocks are factored rank-locally with a block ILU; the
//! interface problem `S = C - F B^{-1} E` is assembled into a dense matrix
//! over the replicated interface numbering, summed collectively and factored
//! redundantly on every rank. With complete fill this preconditioner is an
//! exact solver for the assembled system.
use std::cell::RefCell;
use std::sync::Arc;

use log::debug;
use nalgebra::linalg::LU;
use nalgebra::{convert, DMatrix, DVector, Dyn};

use crate::error::Error;
use crate::schur::{SchurLayout, SchurMatrix};
use crate::vector::DistVector;
use crate::Real;
use sleipnir_sparse::{spmv_bcsr, BcsrLu, BcsrMatrix};

struct ApplyBuffers<T> {
    /// Interior scratch, `num_interior * block_size`.
    interior: Vec<T>,
    /// Local coupling scratch, `num_local_coupling * block_size`.
    coupling: Vec<T>,
    /// Replicated interface right-hand side / solution.
    interface: DVector<T>,
}

/// A factored Schur-complement preconditioner.
///
/// The preconditioner snapshots the coupling blocks it needs at factor time,
/// so re-assembling the matrix afterwards does not silently change an
/// existing factorization. Construction and application are collective; a
/// failed factorization yields no preconditioner at all, so a singular pivot
/// can never be applied by accident.
pub struct SchurPreconditioner<T>
where
    T: Real + Send,
{
    layout: Arc<SchurLayout<T>>,
    b_factor: BcsrLu<T>,
    e: BcsrMatrix<T>,
    f: BcsrMatrix<T>,
    /// Dense factorization of the replicated interface matrix; `None` when
    /// there are no coupling nodes anywhere (single-rank or disconnected
    /// configurations).
    interface_factor: Option<LU<T, Dyn, Dyn>>,
    buffers: RefCell<ApplyBuffers<T>>,
}

impl<T> SchurPreconditioner<T>
where
    T: Real + Send,
{
    /// Factors the interior block with level-of-fill `fill_level`
    /// (`usize::MAX` for complete factorization), forms the global Schur
    /// complement of the interface and factors it densely.
    ///
    /// Collective: every rank contributes its interface blocks through a
    /// global reduction and ends up with an identical interface
    /// factorization.
    pub fn factor(matrix: &SchurMatrix<T>, fill_level: usize) -> Result<Self, Error> {
        let layout = matrix.layout().clone();
        let bs = layout.block_size();
        let b_factor = BcsrLu::factor(matrix.b(), fill_level)?;

        let m = layout.num_global_coupling() * bs;
        let interface_factor = if m > 0 {
            let mut s = assemble_local_interface_matrix(matrix, &b_factor);
            layout.communicator().all_reduce_sum(s.as_mut_slice());
            Some(factor_interface(s, bs)?)
        } else {
            None
        };

        debug!(
            "Schur preconditioner on rank {}: interior factor {} L / {} U blocks, interface dimension {}",
            layout.communicator().rank(),
            b_factor.nnz_l_blocks(),
            b_factor.nnz_u_blocks(),
            m
        );

        let buffers = ApplyBuffers {
            interior: vec![T::zero(); layout.num_interior() * bs],
            coupling: vec![T::zero(); layout.num_local_coupling() * bs],
            interface: DVector::zeros(m),
        };
        Ok(Self {
            e: matrix.e().clone(),
            f: matrix.f().clone(),
            layout,
            b_factor,
            interface_factor,
            buffers: RefCell::new(buffers),
        })
    }

    /// The rank-local interior factorization.
    pub fn interior_factor(&self) -> &BcsrLu<T> {
        &self.b_factor
    }

    /// Applies the preconditioner: `z = M^{-1} r` on the owned segments.
    ///
    /// Collective; external slots of `z` are left stale.
    pub fn apply(&self, z: &mut DistVector<T>, r: &DistVector<T>) -> Result<(), Error> {
        let layout = &self.layout;
        layout.check_vector_compatible(r)?;
        layout.check_vector_compatible(z)?;
        let bs = layout.block_size();
        let ni = layout.num_interior() * bs;
        let own = layout.owned_coupling_run();
        let iface = layout.interface_of_local();

        let mut buffers = self.buffers.borrow_mut();
        let ApplyBuffers { interior, coupling, interface } = &mut *buffers;

        let r_owned = r.owned_values();
        interior.copy_from_slice(&r_owned[..ni]);
        self.b_factor.solve_in_place(interior);

        let z_owned = z.owned_values_mut();
        let Some(interface_factor) = &self.interface_factor else {
            // No interface anywhere: the interior factorization is the whole
            // preconditioner.
            z_owned.copy_from_slice(interior);
            return Ok(());
        };

        // Interface right-hand side g = r_c - F B^{-1} r_i, accumulated over
        // all ranks. Every interface entry of r is added exactly once, by
        // its owner.
        interface.fill(T::zero());
        for (k, pos) in own.clone().enumerate() {
            let slot = iface[pos] * bs;
            for d in 0..bs {
                interface[slot + d] += r_owned[ni + k * bs + d];
            }
        }
        spmv_bcsr(T::zero(), coupling, T::one(), &self.f, interior);
        for (pos, &slot) in iface.iter().enumerate() {
            for d in 0..bs {
                interface[slot * bs + d] -= coupling[pos * bs + d];
            }
        }
        layout.communicator().all_reduce_sum(interface.as_mut_slice());

        // Every rank solves the identical replicated interface system.
        let solved = interface_factor.solve_mut(interface);
        assert!(solved, "Internal error: factored interface matrix lost invertibility.");

        // Back-substitute the interior unknowns from the interface solution.
        for (pos, &slot) in iface.iter().enumerate() {
            for d in 0..bs {
                coupling[pos * bs + d] = interface[slot * bs + d];
            }
        }
        z_owned[..ni].copy_from_slice(&r_owned[..ni]);
        spmv_bcsr(T::one(), &mut z_owned[..ni], -T::one(), &self.e, coupling);
        self.b_factor.solve_in_place(&mut z_owned[..ni]);
        for (k, pos) in own.enumerate() {
            let slot = iface[pos] * bs;
            for d in 0..bs {
                z_owned[ni + k * bs + d] = interface[slot + d];
            }
        }
        Ok(())
    }
}

/// This rank's contribution `C - F B^{-1} E` to the replicated interface
/// matrix, placed at global interface positions.
fn assemble_local_interface_matrix<T>(matrix: &SchurMatrix<T>, b_factor: &BcsrLu<T>) -> DMatrix<T>
where
    T: Real + Send,
{
    let layout = matrix.layout();
    let bs = layout.block_size();
    let iface = layout.interface_of_local();
    let m = layout.num_global_coupling() * bs;
    let mut s = DMatrix::zeros(m, m);

    let c = matrix.c();
    for i in 0..c.block_rows() {
        let (cols, vals) = c.block_row(i);
        let gi = iface[i] * bs;
        for (&j, block) in cols.iter().zip(vals.chunks_exact(bs * bs)) {
            let gj = iface[j] * bs;
            for r in 0..bs {
                for col in 0..bs {
                    s[(gi + r, gj + col)] += block[r * bs + col];
                }
            }
        }
    }

    // One block column of E at a time: scatter it densely, apply the interior
    // factorization to all of its columns at once, then subtract F times the
    // result from the interface matrix.
    let e = matrix.e();
    let f = matrix.f();
    let e_columns = e.column_index();
    let mut w = DMatrix::zeros(layout.num_interior() * bs, bs);
    for j in 0..layout.num_local_coupling() {
        let entries = e_columns.column(j);
        if entries.is_empty() {
            continue;
        }
        w.fill(T::zero());
        for &(i, idx) in entries {
            let block = &e.values()[idx * bs * bs..(idx + 1) * bs * bs];
            for r in 0..bs {
                for col in 0..bs {
                    w[(i * bs + r, col)] = block[r * bs + col];
                }
            }
        }
        b_factor.solve_dense_in_place(&mut w);

        let gj = iface[j] * bs;
        for i in 0..f.block_rows() {
            let (cols, vals) = f.block_row(i);
            let gi = iface[i] * bs;
            for (&k, block) in cols.iter().zip(vals.chunks_exact(bs * bs)) {
                for r in 0..bs {
                    for col in 0..bs {
                        let mut acc = T::zero();
                        for d in 0..bs {
                            acc += block[r * bs + d] * w[(k * bs + d, col)];
                        }
                        s[(gi + r, gj + col)] -= acc;
                    }
                }
            }
        }
    }
    s
}

/// Dense LU of the summed interface matrix, with the same pivot tolerance
/// policy as the block factorization: the smallest pivot magnitude must
/// clear a threshold relative to the largest.
fn factor_interface<T>(s: DMatrix<T>, block_size: usize) -> Result<LU<T, Dyn, Dyn>, Error>
where
    T: Real,
{
    let lu = s.lu();
    let u = lu.u();
    let mut min_pivot = T::zero();
    let mut max_pivot = T::zero();
    let mut offender = 0;
    for i in 0..u.nrows() {
        let pivot = u[(i, i)].abs();
        if i == 0 || pivot < min_pivot {
            min_pivot = pivot;
            offender = i;
        }
        if pivot > max_pivot {
            max_pivot = pivot;
        }
    }
    let tol = T::default_epsilon() * convert::<f64, T>(100.0) * max_pivot.max(T::one());
    if u.nrows() > 0 && min_pivot <= tol {
        return Err(Error::SingularPivot {
            block_row: offender / block_size,
        });
    }
    Ok(lu)
}
