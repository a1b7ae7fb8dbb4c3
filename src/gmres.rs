//! Restarted GMRES over distributed vectors.
//!
//! The solver is right-preconditioned: it iterates on `A M^{-1}` and maps
//! the Krylov solution back through the preconditioner, so the reported
//! residual is the residual of the original system. All inner products and
//! norms are collective, and every rank observes bit-identical iteration
//! scalars; the ranks therefore take the same branches and the collective
//! call sequence stays matched.
use core::fmt;
use std::error::Error;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use log::debug;
use nalgebra::DMatrix;

use crate::precond::SchurPreconditioner;
use crate::schur::SchurMatrix;
use crate::vector::DistVector;
use crate::Real;

pub trait LinearOperator<T>
where
    T: Real + Send,
{
    fn apply(&self, y: &mut DistVector<T>, x: &DistVector<T>) -> Result<(), Box<dyn Error>>;
}

impl<'a, T, A> LinearOperator<T> for &'a A
where
    T: Real + Send,
    A: ?Sized + LinearOperator<T>,
{
    fn apply(&self, y: &mut DistVector<T>, x: &DistVector<T>) -> Result<(), Box<dyn Error>> {
        <A as LinearOperator<T>>::apply(self, y, x)
    }
}

impl<T> LinearOperator<T> for SchurMatrix<T>
where
    T: Real + Send,
{
    fn apply(&self, y: &mut DistVector<T>, x: &DistVector<T>) -> Result<(), Box<dyn Error>> {
        self.mult(x, y)?;
        Ok(())
    }
}

impl<T> LinearOperator<T> for SchurPreconditioner<T>
where
    T: Real + Send,
{
    fn apply(&self, y: &mut DistVector<T>, x: &DistVector<T>) -> Result<(), Box<dyn Error>> {
        SchurPreconditioner::apply(self, y, x)?;
        Ok(())
    }
}

pub struct IdentityOperator;

impl<T> LinearOperator<T> for IdentityOperator
where
    T: Real + Send,
{
    fn apply(&self, y: &mut DistVector<T>, x: &DistVector<T>) -> Result<(), Box<dyn Error>> {
        y.copy_owned_from(x)?;
        Ok(())
    }
}

/// Decides when the iteration stops.
///
/// The solver hands the criterion scalars that are already identical on
/// every rank, so implementations must not communicate; a criterion that
/// branches on rank-local data would desynchronize the collective sequence.
pub trait StoppingCriterion<T>
where
    T: Real + Send,
{
    fn has_converged(&self, b_norm: T, iteration: usize, residual_norm: T) -> Result<bool, SolveErrorKind>;
}

/// Relative residual tolerance ||r|| <= tol * ||b||.
///
/// Inside a restart cycle the residual norm is the rotation-maintained
/// estimate, which can drift from the true residual for ill-conditioned
/// problems; the solver re-checks the true residual at every restart, so a
/// false positive costs one extra cycle at most.
#[derive(Debug)]
pub struct RelativeResidualCriterion<T> {
    tol: T,
}

impl<T> RelativeResidualCriterion<T> {
    pub fn new(tol: T) -> Self {
        Self { tol }
    }
}

impl Default for RelativeResidualCriterion<f64> {
    fn default() -> Self {
        Self::new(1e-8)
    }
}

impl Default for RelativeResidualCriterion<f32> {
    fn default() -> Self {
        Self::new(1e-4)
    }
}

impl<T> StoppingCriterion<T> for RelativeResidualCriterion<T>
where
    T: Real + Send,
{
    fn has_converged(&self, b_norm: T, _iteration: usize, residual_norm: T) -> Result<bool, SolveErrorKind> {
        Ok(residual_norm <= self.tol * b_norm)
    }
}

/// Reusable storage for the Krylov basis and the small projected system.
pub struct GmresWorkspace<T>
where
    T: Real + Send,
{
    /// `[residual, z, v_0, ..., v_restart]`.
    vectors: Vec<DistVector<T>>,
    hessenberg: DMatrix<T>,
    cs: Vec<T>,
    sn: Vec<T>,
    g: Vec<T>,
    y: Vec<T>,
}

struct Buffers<'a, T>
where
    T: Real + Send,
{
    residual: &'a mut DistVector<T>,
    z: &'a mut DistVector<T>,
    basis: &'a mut [DistVector<T>],
    hessenberg: &'a mut DMatrix<T>,
    cs: &'a mut [T],
    sn: &'a mut [T],
    g: &'a mut [T],
    y: &'a mut [T],
}

impl<T> Default for GmresWorkspace<T>
where
    T: Real + Send,
{
    fn default() -> Self {
        Self {
            vectors: Vec::new(),
            hessenberg: DMatrix::zeros(0, 0),
            cs: Vec::new(),
            sn: Vec::new(),
            g: Vec::new(),
            y: Vec::new(),
        }
    }
}

impl<T> GmresWorkspace<T>
where
    T: Real + Send,
{
    fn prepare(&mut self, prototype: &DistVector<T>, restart: usize) -> Buffers<T> {
        let needed = restart + 3;
        let compatible = self.vectors.first().map_or(false, |v| {
            v.block_size() == prototype.block_size()
                && v.num_owned_nodes() == prototype.num_owned_nodes()
                && Arc::ptr_eq(v.node_map(), prototype.node_map())
        });
        if !compatible {
            self.vectors.clear();
        }
        while self.vectors.len() < needed {
            self.vectors.push(prototype.new_compatible());
        }
        self.vectors.truncate(needed);
        self.hessenberg.resize_mut(restart + 1, restart, T::zero());
        self.cs.resize(restart, T::zero());
        self.sn.resize(restart, T::zero());
        self.g.resize(restart + 1, T::zero());
        self.y.resize(restart, T::zero());

        let (scratch, basis) = self.vectors.split_at_mut(2);
        let (residual, z) = scratch.split_at_mut(1);
        Buffers {
            residual: &mut residual[0],
            z: &mut z[0],
            basis,
            hessenberg: &mut self.hessenberg,
            cs: &mut self.cs,
            sn: &mut self.sn,
            g: &mut self.g,
            y: &mut self.y,
        }
    }
}

enum OwnedOrMutRef<'a, T> {
    Owned(T),
    MutRef(&'a mut T),
}

impl<'a, T> Deref for OwnedOrMutRef<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        match self {
            Self::Owned(owned) => owned,
            Self::MutRef(mutref) => mutref,
        }
    }
}

impl<'a, T> DerefMut for OwnedOrMutRef<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            Self::Owned(owned) => owned,
            Self::MutRef(mutref) => mutref,
        }
    }
}

/// Restarted right-preconditioned GMRES.
///
/// Configured with the builder methods, then driven by
/// [`solve_with_guess`](Self::solve_with_guess):
///
/// ```ignore
/// let mut gmres = Gmres::new()
///     .with_operator(&matrix)
///     .with_preconditioner(&pc)
///     .with_restart_dim(80)
///     .with_max_iter(400)
///     .with_stopping_criterion(RelativeResidualCriterion::default());
/// let output = gmres.solve_with_guess(&b, &mut x)?;
/// ```
pub struct Gmres<'a, T, A, P, Criterion>
where
    T: Real + Send,
{
    workspace: OwnedOrMutRef<'a, GmresWorkspace<T>>,
    operator: A,
    preconditioner: P,
    stopping_criterion: Criterion,
    restart_dim: usize,
    max_iter: Option<usize>,
}

impl<'a, T> Gmres<'a, T, (), IdentityOperator, ()>
where
    T: Real + Send,
{
    pub fn new() -> Self {
        Self {
            workspace: OwnedOrMutRef::Owned(GmresWorkspace::default()),
            operator: (),
            preconditioner: IdentityOperator,
            stopping_criterion: (),
            restart_dim: 80,
            max_iter: None,
        }
    }

    pub fn with_workspace(workspace: &'a mut GmresWorkspace<T>) -> Self {
        Self {
            workspace: OwnedOrMutRef::MutRef(workspace),
            operator: (),
            preconditioner: IdentityOperator,
            stopping_criterion: (),
            restart_dim: 80,
            max_iter: None,
        }
    }
}

impl<'a, T> Default for Gmres<'a, T, (), IdentityOperator, ()>
where
    T: Real + Send,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, T, P, Criterion> Gmres<'a, T, (), P, Criterion>
where
    T: Real + Send,
{
    pub fn with_operator<A>(self, operator: A) -> Gmres<'a, T, A, P, Criterion> {
        Gmres {
            workspace: self.workspace,
            operator,
            preconditioner: self.preconditioner,
            stopping_criterion: self.stopping_criterion,
            restart_dim: self.restart_dim,
            max_iter: self.max_iter,
        }
    }
}

impl<'a, T, A, P, Criterion> Gmres<'a, T, A, P, Criterion>
where
    T: Real + Send,
{
    pub fn with_preconditioner<P2>(self, preconditioner: P2) -> Gmres<'a, T, A, P2, Criterion> {
        Gmres {
            workspace: self.workspace,
            operator: self.operator,
            preconditioner,
            stopping_criterion: self.stopping_criterion,
            restart_dim: self.restart_dim,
            max_iter: self.max_iter,
        }
    }

    /// The number of Arnoldi vectors kept before the iteration restarts.
    /// Defaults to 80.
    pub fn with_restart_dim(self, restart_dim: usize) -> Self {
        Self { restart_dim, ..self }
    }

    pub fn with_max_iter(self, max_iter: usize) -> Self {
        Self {
            max_iter: Some(max_iter),
            ..self
        }
    }
}

impl<'a, T, A, P> Gmres<'a, T, A, P, ()>
where
    T: Real + Send,
{
    pub fn with_stopping_criterion<Criterion>(self, stopping_criterion: Criterion) -> Gmres<'a, T, A, P, Criterion> {
        Gmres {
            workspace: self.workspace,
            operator: self.operator,
            preconditioner: self.preconditioner,
            stopping_criterion,
            restart_dim: self.restart_dim,
            max_iter: self.max_iter,
        }
    }
}

#[derive(Debug)]
#[non_exhaustive]
pub enum SolveErrorKind {
    OperatorError(Box<dyn Error>),
    PreconditionerError(Box<dyn Error>),
    StoppingCriterionError(Box<dyn Error>),
    /// The Krylov space degenerated into a singular projected system.
    Breakdown,
    MaxIterationsReached { max_iter: usize },
}

impl fmt::Display for SolveErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OperatorError(err) => {
                write!(f, "Error applying operator: ")?;
                err.fmt(f)
            }
            Self::PreconditionerError(err) => {
                write!(f, "Error applying preconditioner: ")?;
                err.fmt(f)
            }
            Self::StoppingCriterionError(err) => {
                write!(f, "Error evaluating stopping criterion: ")?;
                err.fmt(f)
            }
            Self::Breakdown => write!(f, "Krylov space breakdown produced a singular projected system."),
            Self::MaxIterationsReached { max_iter } => {
                write!(f, "Max iterations ({}) reached.", max_iter)
            }
        }
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct SolveError<T> {
    pub output: GmresOutput<T>,
    pub kind: SolveErrorKind,
}

impl<T> SolveError<T> {
    fn new(output: GmresOutput<T>, kind: SolveErrorKind) -> Self {
        Self { output, kind }
    }
}

impl<T: fmt::Debug> fmt::Display for SolveError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GMRES solve failed after {} iterations: {}",
            self.output.num_iterations, self.kind
        )
    }
}

impl<T: fmt::Debug> std::error::Error for SolveError<T> {}

#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct GmresOutput<T> {
    /// Number of inner iterations across all restart cycles.
    pub num_iterations: usize,
    /// The residual norm at the last stopping-criterion evaluation. Within a
    /// cycle this is the rotation-maintained estimate.
    pub residual_norm: T,
}

impl<'a, T, A, P, Criterion> Gmres<'a, T, A, P, Criterion>
where
    T: Real + Send,
    A: LinearOperator<T>,
    P: LinearOperator<T>,
    Criterion: StoppingCriterion<T>,
{
    /// Solves `A x = b`, starting from the initial guess in `x` and leaving
    /// the solution in its owned segment.
    ///
    /// Collective; every rank must call with globally consistent operands.
    pub fn solve_with_guess(
        &mut self,
        b: &DistVector<T>,
        x: &mut DistVector<T>,
    ) -> Result<GmresOutput<T>, SolveError<T>> {
        use SolveErrorKind::*;

        assert_eq!(b.block_size(), x.block_size(), "Incompatible block sizes.");
        assert_eq!(b.num_owned_nodes(), x.num_owned_nodes(), "Incompatible owned dimensions.");

        let mut output = GmresOutput {
            num_iterations: 0,
            residual_norm: T::zero(),
        };

        let restart = self.restart_dim.max(1);
        let Buffers {
            residual,
            z,
            basis,
            hessenberg,
            cs,
            sn,
            g,
            y,
        } = self.workspace.prepare(b, restart);

        let b_norm = match b.norm() {
            Ok(norm) => norm,
            Err(err) => return Err(SolveError::new(output, OperatorError(Box::new(err)))),
        };
        if b_norm == T::zero() {
            x.set_zero();
            return Ok(output);
        }

        loop {
            // True residual at the top of every cycle: r = b - A x.
            if let Err(err) = self.operator.apply(residual, x) {
                return Err(SolveError::new(output, OperatorError(err)));
            }
            residual
                .axpby(T::one(), b, -T::one())
                .expect("Internal error: incompatible residual vector.");
            let beta = match residual.norm() {
                Ok(norm) => norm,
                Err(err) => return Err(SolveError::new(output, OperatorError(Box::new(err)))),
            };
            output.residual_norm = beta;
            debug!(
                "GMRES cycle at iteration {}: true relative residual {:?}",
                output.num_iterations,
                beta / b_norm
            );

            match self.stopping_criterion.has_converged(b_norm, output.num_iterations, beta) {
                Ok(true) => return Ok(output),
                Ok(false) => {}
                Err(kind) => return Err(SolveError::new(output, kind)),
            }
            if let Some(max_iter) = self.max_iter {
                if output.num_iterations >= max_iter {
                    return Err(SolveError::new(output, MaxIterationsReached { max_iter }));
                }
            }

            basis[0]
                .copy_owned_from(residual)
                .expect("Internal error: incompatible basis vector.");
            basis[0].scale(T::one() / beta);
            g.fill(T::zero());
            g[0] = beta;

            let mut arnoldi_dim = 0;
            let mut converged = false;

            for j in 0..restart {
                // w = A M^{-1} v_j, built in the slot of v_{j+1}.
                if let Err(err) = self.preconditioner.apply(z, &basis[j]) {
                    return Err(SolveError::new(output, PreconditionerError(err)));
                }
                let (head, tail) = basis.split_at_mut(j + 1);
                let w = &mut tail[0];
                if let Err(err) = self.operator.apply(w, z) {
                    return Err(SolveError::new(output, OperatorError(err)));
                }

                // Modified Gram-Schmidt against the current basis.
                for (i, v) in head.iter().enumerate() {
                    let h = w.dot(v).expect("Internal error: incompatible basis vector.");
                    w.axpy(-h, v).expect("Internal error: incompatible basis vector.");
                    hessenberg[(i, j)] = h;
                }
                let h_next = match w.norm() {
                    Ok(norm) => norm,
                    Err(err) => return Err(SolveError::new(output, OperatorError(Box::new(err)))),
                };

                // Rotate the new column through the accumulated rotations,
                // then zero its subdiagonal entry with a fresh one.
                for i in 0..j {
                    let hi = hessenberg[(i, j)];
                    let hi1 = hessenberg[(i + 1, j)];
                    hessenberg[(i, j)] = cs[i] * hi + sn[i] * hi1;
                    hessenberg[(i + 1, j)] = cs[i] * hi1 - sn[i] * hi;
                }
                let (c, s) = givens_rotation(hessenberg[(j, j)], h_next);
                cs[j] = c;
                sn[j] = s;
                hessenberg[(j, j)] = c * hessenberg[(j, j)] + s * h_next;
                hessenberg[(j + 1, j)] = T::zero();
                g[j + 1] = -s * g[j];
                g[j] *= c;

                output.num_iterations += 1;
                output.residual_norm = g[j + 1].abs();
                arnoldi_dim = j + 1;

                match self
                    .stopping_criterion
                    .has_converged(b_norm, output.num_iterations, output.residual_norm)
                {
                    Ok(result) => converged = result,
                    Err(kind) => return Err(SolveError::new(output, kind)),
                }

                // On exact breakdown the Krylov space is exhausted and the
                // cycle's correction is already exact; normalizing would
                // divide by zero.
                let breakdown = h_next == T::zero();
                let exhausted = self.max_iter.map_or(false, |max_iter| output.num_iterations >= max_iter);
                if converged || breakdown || exhausted || j + 1 == restart {
                    break;
                }
                w.scale(T::one() / h_next);
            }

            // Back-substitute the projected system and map the correction
            // through the preconditioner: x += M^{-1} (V y).
            for i in (0..arnoldi_dim).rev() {
                if hessenberg[(i, i)] == T::zero() {
                    return Err(SolveError::new(output, Breakdown));
                }
                let mut sum = g[i];
                for k in (i + 1)..arnoldi_dim {
                    sum -= hessenberg[(i, k)] * y[k];
                }
                y[i] = sum / hessenberg[(i, i)];
            }
            z.set_zero();
            for (v, &y_i) in basis.iter().zip(y[..arnoldi_dim].iter()) {
                z.axpy(y_i, v).expect("Internal error: incompatible basis vector.");
            }
            if let Err(err) = self.preconditioner.apply(residual, z) {
                return Err(SolveError::new(output, PreconditionerError(err)));
            }
            x.axpy(T::one(), residual)
                .expect("Internal error: incompatible solution vector.");

            if converged {
                return Ok(output);
            }
        }
    }
}

fn givens_rotation<T: Real>(a: T, b: T) -> (T, T) {
    if b == T::zero() {
        (T::one(), T::zero())
    } else {
        let r = a.hypot(b);
        (a / r, b / r)
    }
}
