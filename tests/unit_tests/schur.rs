use std::sync::Arc;

use sleipnir::comm::{run_threaded, Communicator, SelfComm};
use sleipnir::distribute::VecIndices;
use sleipnir::error::Error;
use sleipnir::node_map::NodeMap;
use sleipnir::precond::SchurPreconditioner;
use sleipnir::schur::{NodeSlot, SchurLayout, SchurMatrix};
use sleipnir::sparse::SparsityPattern;
use sleipnir::vector::DistVector;
use util::assert_approx_slice_eq;

fn dense_pattern(rows: usize, cols: usize) -> Arc<SparsityPattern> {
    let offsets = (0..=rows).map(|i| i * cols).collect();
    let indices = (0..rows).flat_map(|_| 0..cols).collect();
    Arc::new(SparsityPattern::try_from_offsets_and_indices(rows, cols, offsets, indices).unwrap())
}

/// One rank, two nodes: node 0 interior, node 1 coupling, dense 1x1 block
/// patterns everywhere.
fn single_rank_layout(block_size: usize) -> (Arc<SchurLayout<f64>>, Arc<NodeMap>) {
    let comm: Arc<dyn Communicator<f64>> = Arc::new(SelfComm::new());
    let map = Arc::new(NodeMap::from_counts(&[2]));
    let layout = SchurLayout::new(
        comm,
        Arc::clone(&map),
        block_size,
        1,
        VecIndices::new(vec![1]),
        VecIndices::new(vec![1]),
        dense_pattern(1, 1),
        dense_pattern(1, 1),
        dense_pattern(1, 1),
        dense_pattern(1, 1),
    )
    .unwrap();
    (Arc::new(layout), map)
}

#[test]
fn layout_classifies_global_nodes() {
    let (layout, _) = single_rank_layout(2);
    assert_eq!(layout.block_size(), 2);
    assert_eq!(layout.num_interior(), 1);
    assert_eq!(layout.num_local_coupling(), 1);
    assert_eq!(layout.num_owned_coupling(), 1);
    assert_eq!(layout.num_global_coupling(), 1);
    assert_eq!(layout.owned_coupling_run(), 0..1);
    assert_eq!(layout.interface_of_local(), &[0]);
    assert_eq!(layout.slot_of_global(0), Some(NodeSlot::Interior(0)));
    assert_eq!(layout.slot_of_global(1), Some(NodeSlot::Coupling(0)));
    assert_eq!(layout.slot_of_global(2), None);
}

#[test]
fn layout_rejects_owned_nodes_outside_the_coupling_lists() {
    let comm: Arc<dyn Communicator<f64>> = Arc::new(SelfComm::new());
    let map = Arc::new(NodeMap::from_counts(&[2]));
    // Node 1 lies past the interior range but is not registered as a
    // coupling node.
    let result = SchurLayout::new(
        comm,
        map,
        1,
        1,
        VecIndices::new(Vec::new()),
        VecIndices::new(Vec::new()),
        dense_pattern(1, 1),
        dense_pattern(1, 0),
        dense_pattern(0, 1),
        dense_pattern(0, 0),
    );
    assert!(matches!(result, Err(Error::Configuration(_))));
}

#[test]
fn layout_rejects_mismatched_patterns() {
    let comm: Arc<dyn Communicator<f64>> = Arc::new(SelfComm::new());
    let map = Arc::new(NodeMap::from_counts(&[2]));
    let result = SchurLayout::new(
        comm,
        map,
        1,
        1,
        VecIndices::new(vec![1]),
        VecIndices::new(vec![1]),
        dense_pattern(2, 2),
        dense_pattern(1, 1),
        dense_pattern(1, 1),
        dense_pattern(1, 1),
    );
    assert!(matches!(result, Err(Error::DimensionMismatch(_))));
}

#[test]
fn add_block_routes_to_the_four_blocks() {
    let (layout, _) = single_rank_layout(2);
    let mut matrix = SchurMatrix::new(layout);
    assert!(matrix.add_block(NodeSlot::Interior(0), NodeSlot::Interior(0), &[1.0, 2.0, 3.0, 4.0]));
    assert!(matrix.add_block(NodeSlot::Interior(0), NodeSlot::Coupling(0), &[5.0, 6.0, 7.0, 8.0]));
    assert!(matrix.add_block(NodeSlot::Coupling(0), NodeSlot::Interior(0), &[9.0, 10.0, 11.0, 12.0]));
    assert!(matrix.add_block(NodeSlot::Coupling(0), NodeSlot::Coupling(0), &[13.0, 14.0, 15.0, 16.0]));
    assert_eq!(matrix.b().block(0, 0).unwrap(), &[1.0, 2.0, 3.0, 4.0]);
    assert_eq!(matrix.e().block(0, 0).unwrap(), &[5.0, 6.0, 7.0, 8.0]);
    assert_eq!(matrix.f().block(0, 0).unwrap(), &[9.0, 10.0, 11.0, 12.0]);
    assert_eq!(matrix.c().block(0, 0).unwrap(), &[13.0, 14.0, 15.0, 16.0]);

    // Accumulation, not overwrite.
    assert!(matrix.add_block(NodeSlot::Interior(0), NodeSlot::Interior(0), &[1.0; 4]));
    assert_eq!(matrix.b().block(0, 0).unwrap(), &[2.0, 3.0, 4.0, 5.0]);

    matrix.set_zero();
    assert_eq!(matrix.b().block(0, 0).unwrap(), &[0.0; 4]);
    assert_eq!(matrix.c().block(0, 0).unwrap(), &[0.0; 4]);
}

#[test]
fn add_block_reports_positions_outside_the_pattern() {
    // Two interior nodes with a diagonal-only B pattern.
    let comm: Arc<dyn Communicator<f64>> = Arc::new(SelfComm::new());
    let map = Arc::new(NodeMap::from_counts(&[3]));
    let diagonal = Arc::new(
        SparsityPattern::try_from_offsets_and_indices(2, 2, vec![0, 1, 2], vec![0, 1]).unwrap(),
    );
    let layout = Arc::new(
        SchurLayout::new(
            comm,
            map,
            1,
            2,
            VecIndices::new(vec![2]),
            VecIndices::new(vec![2]),
            diagonal,
            dense_pattern(2, 1),
            dense_pattern(1, 2),
            dense_pattern(1, 1),
        )
        .unwrap(),
    );
    let mut matrix = SchurMatrix::new(layout);
    assert!(matrix.add_block(NodeSlot::Interior(0), NodeSlot::Interior(0), &[1.0]));
    assert!(!matrix.add_block(NodeSlot::Interior(0), NodeSlot::Interior(1), &[1.0]));
}

#[test]
fn mult_matches_the_dense_block_form_on_one_rank() {
    let (layout, map) = single_rank_layout(2);
    let comm = Arc::clone(layout.communicator());
    let mut matrix = SchurMatrix::new(layout);
    assert!(matrix.add_block(NodeSlot::Interior(0), NodeSlot::Interior(0), &[1.0, 2.0, 3.0, 4.0]));
    assert!(matrix.add_block(NodeSlot::Interior(0), NodeSlot::Coupling(0), &[5.0, 6.0, 7.0, 8.0]));
    assert!(matrix.add_block(NodeSlot::Coupling(0), NodeSlot::Interior(0), &[9.0, 10.0, 11.0, 12.0]));
    assert!(matrix.add_block(NodeSlot::Coupling(0), NodeSlot::Coupling(0), &[13.0, 14.0, 15.0, 16.0]));

    let mut x = DistVector::new(comm, map, 2);
    x.owned_values_mut().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
    let mut y = x.new_like();
    matrix.mult(&x, &mut y).unwrap();
    // [B E; F C] applied to [1 2 | 3 4].
    assert_eq!(y.owned_values(), &[44.0, 64.0, 124.0, 144.0]);
}

#[test]
fn mult_sums_shared_coupling_rows_across_ranks() {
    // Global 2x2 system with node 0 interior to rank 0 and node 1 a
    // coupling node owned by rank 1; rank 0 holds off-diagonal and part of
    // the shared diagonal entry.
    let results = run_threaded::<f64, _, _>(2, |comm| {
        let rank = comm.rank();
        let comm: Arc<dyn Communicator<f64>> = Arc::new(comm);
        let map = Arc::new(NodeMap::from_counts(&[1, 1]));
        let layout = if rank == 0 {
            SchurLayout::new(
                Arc::clone(&comm),
                Arc::clone(&map),
                1,
                1,
                VecIndices::new(vec![1]),
                VecIndices::new(vec![1]),
                dense_pattern(1, 1),
                dense_pattern(1, 1),
                dense_pattern(1, 1),
                dense_pattern(1, 1),
            )
            .unwrap()
        } else {
            SchurLayout::new(
                Arc::clone(&comm),
                Arc::clone(&map),
                1,
                0,
                VecIndices::new(vec![1]),
                VecIndices::new(vec![1]),
                dense_pattern(0, 0),
                dense_pattern(0, 1),
                dense_pattern(1, 0),
                dense_pattern(1, 1),
            )
            .unwrap()
        };
        let mut matrix = SchurMatrix::new(Arc::new(layout));
        if rank == 0 {
            assert!(matrix.add_block(NodeSlot::Interior(0), NodeSlot::Interior(0), &[2.0]));
            assert!(matrix.add_block(NodeSlot::Interior(0), NodeSlot::Coupling(0), &[3.0]));
            assert!(matrix.add_block(NodeSlot::Coupling(0), NodeSlot::Interior(0), &[5.0]));
            assert!(matrix.add_block(NodeSlot::Coupling(0), NodeSlot::Coupling(0), &[7.0]));
        } else {
            assert!(matrix.add_block(NodeSlot::Coupling(0), NodeSlot::Coupling(0), &[11.0]));
        }

        let mut x = DistVector::new(comm, map, 1);
        x.owned_values_mut()[0] = (rank + 1) as f64;
        let mut y = x.new_like();
        matrix.mult(&x, &mut y).unwrap();
        y.owned_values()[0]
    });
    // A = [2 3; 5 18], x = [1, 2]: y = [8, 41].
    assert_eq!(results[0], 8.0);
    assert_eq!(results[1], 41.0);
}

#[test]
fn apply_dirichlet_zeroes_rows_and_columns() {
    let (layout, _) = single_rank_layout(2);
    let mut matrix = SchurMatrix::new(layout);
    assert!(matrix.add_block(NodeSlot::Interior(0), NodeSlot::Interior(0), &[1.0, 2.0, 3.0, 4.0]));
    assert!(matrix.add_block(NodeSlot::Interior(0), NodeSlot::Coupling(0), &[5.0, 6.0, 7.0, 8.0]));
    assert!(matrix.add_block(NodeSlot::Coupling(0), NodeSlot::Interior(0), &[9.0, 10.0, 11.0, 12.0]));
    assert!(matrix.add_block(NodeSlot::Coupling(0), NodeSlot::Coupling(0), &[13.0, 14.0, 15.0, 16.0]));

    // Constrain dof 0 of the interior node and dof 1 of the coupling node.
    matrix.apply_dirichlet(&[0b01], &[0b10]).unwrap();
    assert_eq!(matrix.b().block(0, 0).unwrap(), &[1.0, 0.0, 0.0, 4.0]);
    assert_eq!(matrix.e().block(0, 0).unwrap(), &[0.0, 0.0, 7.0, 0.0]);
    assert_eq!(matrix.f().block(0, 0).unwrap(), &[0.0, 10.0, 0.0, 0.0]);
    assert_eq!(matrix.c().block(0, 0).unwrap(), &[13.0, 0.0, 0.0, 1.0]);
}

#[test]
fn apply_dirichlet_validates_mask_lengths() {
    let (layout, _) = single_rank_layout(2);
    let mut matrix = SchurMatrix::new(layout);
    assert!(matches!(
        matrix.apply_dirichlet(&[0, 0], &[0]),
        Err(Error::DimensionMismatch(_))
    ));
}

#[test]
fn the_complete_fill_preconditioner_inverts_the_matrix() {
    let (layout, map) = single_rank_layout(2);
    let comm = Arc::clone(layout.communicator());
    let mut matrix = SchurMatrix::new(Arc::clone(&layout));
    assert!(matrix.add_block(NodeSlot::Interior(0), NodeSlot::Interior(0), &[10.0, 1.0, 1.0, 12.0]));
    assert!(matrix.add_block(NodeSlot::Interior(0), NodeSlot::Coupling(0), &[2.0, 0.0, 0.0, 3.0]));
    assert!(matrix.add_block(NodeSlot::Coupling(0), NodeSlot::Interior(0), &[2.0, 0.0, 0.0, 3.0]));
    assert!(matrix.add_block(NodeSlot::Coupling(0), NodeSlot::Coupling(0), &[14.0, 1.0, 1.0, 16.0]));

    let preconditioner = SchurPreconditioner::factor(&matrix, usize::MAX).unwrap();
    let mut r = DistVector::new(comm, map, 2);
    r.owned_values_mut().copy_from_slice(&[1.0, -2.0, 3.0, -4.0]);
    let mut z = r.new_like();
    preconditioner.apply(&mut z, &r).unwrap();

    // With unlimited fill the factorization is exact, so z solves A z = r
    // through the interior factor, the interface solve and the
    // back-substitution.
    let mut az = r.new_like();
    matrix.mult(&z, &mut az).unwrap();
    assert_approx_slice_eq!(az.owned_values(), r.owned_values(), abstol = 1e-12);
}

#[test]
fn mult_rejects_vectors_from_other_node_maps() {
    let (layout, _) = single_rank_layout(1);
    let matrix = SchurMatrix::new(Arc::clone(&layout));
    let foreign_map = Arc::new(NodeMap::from_counts(&[2]));
    let x = DistVector::new(Arc::clone(layout.communicator()), foreign_map, 1);
    let mut y = x.new_like();
    assert!(matches!(matrix.mult(&x, &mut y), Err(Error::Configuration(_))));
}
