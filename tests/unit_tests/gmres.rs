use std::error::Error;
use std::sync::Arc;

use sleipnir::comm::{run_threaded, Communicator, SelfComm};
use sleipnir::gmres::{Gmres, GmresWorkspace, IdentityOperator, LinearOperator, RelativeResidualCriterion, SolveErrorKind};
use sleipnir::node_map::NodeMap;
use sleipnir::vector::DistVector;
use util::assert_approx_slice_eq;

/// Multiplies the owned segment entrywise, one coefficient per owned dof.
struct DiagonalOperator {
    diag: Vec<f64>,
}

impl LinearOperator<f64> for DiagonalOperator {
    fn apply(&self, y: &mut DistVector<f64>, x: &DistVector<f64>) -> Result<(), Box<dyn Error>> {
        y.copy_owned_from(x)?;
        for (value, d) in y.owned_values_mut().iter_mut().zip(&self.diag) {
            *value *= d;
        }
        Ok(())
    }
}

fn vector_of(values: &[f64]) -> DistVector<f64> {
    let comm: Arc<dyn Communicator<f64>> = Arc::new(SelfComm::new());
    let map = Arc::new(NodeMap::from_counts(&[values.len()]));
    let mut v = DistVector::new(comm, map, 1);
    v.owned_values_mut().copy_from_slice(values);
    v
}

#[test]
fn the_identity_system_converges_in_one_iteration() {
    let b = vector_of(&[1.0, 2.0, 3.0, 4.0]);
    let mut x = b.new_like();
    let output = Gmres::new()
        .with_operator(&IdentityOperator)
        .with_stopping_criterion(RelativeResidualCriterion::default())
        .solve_with_guess(&b, &mut x)
        .unwrap();
    assert_eq!(output.num_iterations, 1);
    assert_approx_slice_eq!(x.owned_values(), b.owned_values(), abstol = 1e-12);
}

#[test]
fn solves_a_diagonal_system() {
    let operator = DiagonalOperator {
        diag: vec![1.0, 2.0, 3.0, 4.0],
    };
    let b = vector_of(&[4.0, 6.0, 6.0, 4.0]);
    let mut x = b.new_like();
    let output = Gmres::new()
        .with_operator(&operator)
        .with_stopping_criterion(RelativeResidualCriterion::new(1e-10))
        .solve_with_guess(&b, &mut x)
        .unwrap();
    // Four distinct eigenvalues: the Krylov space closes after four steps.
    assert!(output.num_iterations <= 5);
    assert_approx_slice_eq!(x.owned_values(), [4.0, 3.0, 2.0, 1.0].as_slice(), abstol = 1e-6);
}

#[test]
fn an_exact_inverse_preconditioner_restores_the_identity() {
    let operator = DiagonalOperator {
        diag: vec![1.0, 2.0, 4.0, 8.0],
    };
    let preconditioner = DiagonalOperator {
        diag: vec![1.0, 0.5, 0.25, 0.125],
    };
    let b = vector_of(&[2.0, 4.0, 8.0, 16.0]);
    let mut x = b.new_like();
    let output = Gmres::new()
        .with_operator(&operator)
        .with_preconditioner(&preconditioner)
        .with_stopping_criterion(RelativeResidualCriterion::default())
        .solve_with_guess(&b, &mut x)
        .unwrap();
    assert_eq!(output.num_iterations, 1);
    assert_approx_slice_eq!(x.owned_values(), [2.0, 2.0, 2.0, 2.0].as_slice(), abstol = 1e-10);
}

#[test]
fn stops_with_an_error_at_the_iteration_cap() {
    let operator = DiagonalOperator {
        diag: vec![1.0, 2.0, 3.0, 4.0],
    };
    let b = vector_of(&[1.0, 1.0, 1.0, 1.0]);
    let mut x = b.new_like();
    let err = Gmres::new()
        .with_operator(&operator)
        .with_max_iter(2)
        .with_stopping_criterion(RelativeResidualCriterion::new(1e-12))
        .solve_with_guess(&b, &mut x)
        .unwrap_err();
    assert_eq!(err.output.num_iterations, 2);
    assert!(matches!(err.kind, SolveErrorKind::MaxIterationsReached { max_iter: 2 }));
}

#[test]
fn restart_cycles_still_converge() {
    let operator = DiagonalOperator {
        diag: vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
    };
    let b = vector_of(&[6.0, 10.0, 12.0, 12.0, 10.0, 6.0]);
    let mut x = b.new_like();
    let output = Gmres::new()
        .with_operator(&operator)
        .with_restart_dim(2)
        .with_max_iter(200)
        .with_stopping_criterion(RelativeResidualCriterion::new(1e-10))
        .solve_with_guess(&b, &mut x)
        .unwrap();
    // Six eigenvalues cannot fit in a two-dimensional Krylov space.
    assert!(output.num_iterations > 2);
    assert_approx_slice_eq!(
        x.owned_values(),
        [6.0, 5.0, 4.0, 3.0, 2.0, 1.0].as_slice(),
        abstol = 1e-6
    );
}

#[test]
fn a_zero_right_hand_side_returns_the_zero_solution() {
    let b = vector_of(&[0.0, 0.0, 0.0]);
    let mut x = vector_of(&[5.0, -3.0, 2.0]);
    let output = Gmres::new()
        .with_operator(&IdentityOperator)
        .with_stopping_criterion(RelativeResidualCriterion::default())
        .solve_with_guess(&b, &mut x)
        .unwrap();
    assert_eq!(output.num_iterations, 0);
    assert_eq!(output.residual_norm, 0.0);
    assert_eq!(x.owned_values(), &[0.0, 0.0, 0.0]);
}

#[test]
fn a_workspace_can_be_shared_between_solves() {
    let operator = DiagonalOperator {
        diag: vec![2.0, 4.0, 8.0],
    };
    let mut workspace = GmresWorkspace::default();
    for scale in [1.0, 3.0] {
        let b = vector_of(&[2.0 * scale, 4.0 * scale, 8.0 * scale]);
        let mut x = b.new_like();
        Gmres::with_workspace(&mut workspace)
            .with_operator(&operator)
            .with_stopping_criterion(RelativeResidualCriterion::new(1e-12))
            .solve_with_guess(&b, &mut x)
            .unwrap();
        let expected = [scale, scale, scale];
        assert_approx_slice_eq!(x.owned_values(), expected.as_slice(), abstol = 1e-8);
    }
}

#[test]
fn ranks_observe_the_same_iteration_count() {
    let results = run_threaded::<f64, _, _>(2, |comm| {
        let rank = comm.rank();
        let comm: Arc<dyn Communicator<f64>> = Arc::new(comm);
        let map = Arc::new(NodeMap::from_counts(&[2, 2]));
        let operator = DiagonalOperator {
            diag: if rank == 0 { vec![1.0, 2.0] } else { vec![3.0, 4.0] },
        };
        let b = {
            let mut b = DistVector::new(Arc::clone(&comm), Arc::clone(&map), 1);
            b.owned_values_mut().fill(1.0);
            b
        };
        let mut x = b.new_like();
        let output = Gmres::new()
            .with_operator(&operator)
            .with_stopping_criterion(RelativeResidualCriterion::new(1e-12))
            .solve_with_guess(&b, &mut x)
            .unwrap();
        (output.num_iterations, x.owned_values().to_vec())
    });
    assert_eq!(results[0].0, results[1].0);
    assert_approx_slice_eq!(&results[0].1, [1.0, 0.5].as_slice(), abstol = 1e-10);
    assert_approx_slice_eq!(&results[1].1, [1.0 / 3.0, 0.25].as_slice(), abstol = 1e-10);
}
