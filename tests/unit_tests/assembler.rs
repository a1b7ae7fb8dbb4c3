use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use matrixcompare::assert_matrix_eq;
use nalgebra::{DVector, Point3};
use sleipnir::assembler::Assembler;
use sleipnir::comm::{run_threaded, Communicator, SelfComm};
use sleipnir::element::{ElementModel, IsotropicMaterial};
use sleipnir::error::Error;
use sleipnir::procedural::{
    create_unit_box_uniform_tet_mesh_3d, partition_elements_by_slabs, vertices_on_min_x_face,
    TetMesh3d,
};
use sleipnir::reorder::NodeOrdering;
use sleipnir::schur::NodeSlot;
use util::assert_approx_matrix_eq;

fn elastic_model() -> ElementModel<f64> {
    ElementModel::ElasticTet4(IsotropicMaterial::new(1000.0, 0.3, 1.0))
}

/// Single-rank assembler over the whole mesh with a configurable ordering
/// and no boundary conditions unless `clamp_min_x` is set.
fn box_assembler(mesh: &TetMesh3d<f64>, ordering: NodeOrdering, clamp_min_x: bool) -> Assembler<f64> {
    let comm: Arc<dyn Communicator<f64>> = Arc::new(SelfComm::new());
    let mut assembler = Assembler::new(comm, 3);
    let mut offsets = vec![0];
    let mut nodes = Vec::new();
    for tet in mesh.connectivity() {
        nodes.extend_from_slice(&tet.0);
        offsets.push(nodes.len());
    }
    assembler.set_element_connectivity(offsets, nodes).unwrap();
    assembler
        .set_elements(vec![elastic_model()], vec![0; mesh.num_elements()])
        .unwrap();
    if clamp_min_x {
        for vertex in vertices_on_min_x_face(mesh) {
            assembler
                .add_boundary_conditions(vertex, &[0, 1, 2], &[0.0; 3])
                .unwrap();
        }
    }
    assembler.set_ordering(ordering).unwrap();
    assembler.initialize().unwrap();
    let coordinates: Vec<Point3<f64>> = assembler
        .local_nodes()
        .unwrap()
        .iter()
        .map(|&vertex| mesh.vertices()[vertex])
        .collect();
    assembler.set_nodes(&coordinates).unwrap();
    assembler
}

fn fill_state(values: &mut [f64]) {
    for (i, value) in values.iter_mut().enumerate() {
        *value = 0.01 * ((i * 7 + 3) % 13) as f64 - 0.05;
    }
}

#[test]
fn configuration_is_validated_at_every_stage() {
    let comm: Arc<dyn Communicator<f64>> = Arc::new(SelfComm::new());
    let mut assembler = Assembler::new(Arc::clone(&comm), 3);
    assert!(matches!(
        assembler.set_elements(vec![elastic_model()], Vec::new()),
        Err(Error::Configuration(_))
    ));
    assert!(matches!(assembler.initialize(), Err(Error::Configuration(_))));
    assert!(matches!(assembler.local_nodes(), Err(Error::Configuration(_))));
    assert!(matches!(
        assembler.set_element_connectivity(vec![1, 5], vec![0, 1, 2, 3]),
        Err(Error::Configuration(_))
    ));
    assert!(matches!(
        assembler.set_element_connectivity(vec![0, 3], vec![0, 1, 2, 3]),
        Err(Error::DimensionMismatch(_))
    ));

    assembler
        .set_element_connectivity(vec![0, 4], vec![0, 1, 2, 3])
        .unwrap();
    assert!(matches!(
        assembler.set_element_connectivity(vec![0, 4], vec![0, 1, 2, 3]),
        Err(Error::Configuration(_))
    ));
    assert!(matches!(
        assembler.set_elements(vec![elastic_model()], vec![0, 0]),
        Err(Error::DimensionMismatch(_))
    ));
    assert!(matches!(
        assembler.set_elements(vec![elastic_model()], vec![1]),
        Err(Error::Configuration(_))
    ));
    assert!(matches!(
        assembler.add_boundary_conditions(0, &[0, 1], &[0.0]),
        Err(Error::DimensionMismatch(_))
    ));
    assert_eq!(
        assembler.add_boundary_conditions(0, &[3], &[0.0]),
        Err(Error::IndexOutOfRange { index: 3, bound: 3 })
    );
    // Elements must be assigned before initialize.
    assert!(matches!(assembler.initialize(), Err(Error::Configuration(_))));

    assembler.set_elements(vec![elastic_model()], vec![0]).unwrap();
    assert!(matches!(
        assembler.set_nodes(&[Point3::origin(); 4]),
        Err(Error::Configuration(_))
    ));
    assembler.initialize().unwrap();
    assert!(matches!(assembler.initialize(), Err(Error::Configuration(_))));
    assert!(matches!(
        assembler.set_element_connectivity(vec![0], Vec::new()),
        Err(Error::Configuration(_))
    ));
    assert!(matches!(
        assembler.add_boundary_conditions(0, &[0], &[0.0]),
        Err(Error::Configuration(_))
    ));
    assert!(matches!(
        assembler.set_ordering(NodeOrdering::ReverseCuthillMcKee),
        Err(Error::Configuration(_))
    ));
    assert!(matches!(
        assembler.set_dependent_nodes(Vec::new()),
        Err(Error::Configuration(_))
    ));

    assert_eq!(assembler.global_node_index(10).unwrap(), None);
    assert!(matches!(
        assembler.set_nodes(&[Point3::origin(); 3]),
        Err(Error::DimensionMismatch(_))
    ));
    // Assembly requires coordinates.
    let mut residual = assembler.create_vector().unwrap();
    assert!(assembler.assemble_residual(&mut residual).is_err());
    assembler
        .set_nodes(&[
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(0.0, 0.0, 1.0),
        ])
        .unwrap();
    assembler.assemble_residual(&mut residual).unwrap();

    // Vectors from another assembler's map are rejected.
    let mut foreign = Assembler::new(comm, 3);
    foreign
        .set_element_connectivity(vec![0, 4], vec![0, 1, 2, 3])
        .unwrap();
    foreign.set_elements(vec![elastic_model()], vec![0]).unwrap();
    foreign.initialize().unwrap();
    let mut vector = foreign.create_vector().unwrap();
    assert!(matches!(
        assembler.apply_boundary_conditions(&mut vector),
        Err(Error::Configuration(_))
    ));
}

#[test]
fn element_node_counts_must_match_the_model() {
    let comm: Arc<dyn Communicator<f64>> = Arc::new(SelfComm::new());
    let mut assembler = Assembler::new(comm, 3);
    assembler.set_element_connectivity(vec![0, 3], vec![0, 1, 2]).unwrap();
    assert!(matches!(
        assembler.set_elements(vec![elastic_model()], vec![0]),
        Err(Error::DimensionMismatch(_))
    ));
}

#[test]
fn dependent_declarations_are_validated() {
    let build = |dependents: Vec<(usize, Vec<(usize, f64)>)>, bc_node: Option<usize>| {
        let comm: Arc<dyn Communicator<f64>> = Arc::new(SelfComm::new());
        let mut assembler = Assembler::new(comm, 3);
        assembler
            .set_element_connectivity(vec![0, 4], vec![0, 1, 2, 3])
            .unwrap();
        assembler.set_elements(vec![elastic_model()], vec![0]).unwrap();
        assembler.set_dependent_nodes(dependents).unwrap();
        if let Some(node) = bc_node {
            assembler.add_boundary_conditions(node, &[0], &[0.0]).unwrap();
        }
        assembler.initialize()
    };
    // Declared twice.
    assert!(matches!(
        build(vec![(3, vec![(0, 1.0)]), (3, vec![(1, 1.0)])], None),
        Err(Error::Configuration(_))
    ));
    // No masters.
    assert!(matches!(build(vec![(3, Vec::new())], None), Err(Error::Configuration(_))));
    // A master that is itself dependent.
    assert!(matches!(
        build(vec![(3, vec![(4, 1.0)]), (4, vec![(0, 1.0)])], None),
        Err(Error::Configuration(_))
    ));
    // Boundary conditions cannot constrain dependent nodes.
    assert!(matches!(
        build(vec![(3, vec![(0, 1.0)])], Some(3)),
        Err(Error::Configuration(_))
    ));
}

#[test]
fn assembles_a_symmetric_jacobian_with_clamped_faces() {
    let mesh = create_unit_box_uniform_tet_mesh_3d(1);
    let assembler = crate::elasticity_assembler_single_rank(&mesh);
    assert_eq!(assembler.num_owned_nodes().unwrap(), 8);
    let layout = assembler.schur_layout().unwrap();
    assert_eq!(layout.num_interior(), 8);
    assert_eq!(layout.num_local_coupling(), 0);

    let mut matrix = assembler.create_matrix().unwrap();
    assembler.assemble_jacobian(1.0, 0.0, 0.0, None, &mut matrix).unwrap();
    let dense = matrix.b().to_dense();
    assert_approx_matrix_eq!(&dense, &dense.transpose(), abstol = 1e-9);

    // Constrained rows and columns collapse to the identity.
    for vertex in vertices_on_min_x_face(&mesh) {
        let g = assembler.global_node_index(vertex).unwrap().unwrap();
        for j in 0..8 {
            if let Some(block) = matrix.b().block(g, j) {
                if j == g {
                    assert_eq!(block, &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]);
                } else {
                    assert_eq!(block, &[0.0; 9]);
                }
            }
            if j != g {
                if let Some(block) = matrix.b().block(j, g) {
                    assert_eq!(block, &[0.0; 9]);
                }
            }
        }
    }

    // At the zero state the residual is the prescribed values, all zero.
    let mut residual = assembler.create_vector().unwrap();
    assembler.assemble_residual(&mut residual).unwrap();
    assert!(residual.owned_values().iter().all(|&value| value == 0.0));

    // The Jacobian weights scale the element contributions.
    let mut doubled = assembler.create_matrix().unwrap();
    assembler.assemble_jacobian(2.0, 0.0, 0.0, None, &mut doubled).unwrap();
    let free = mesh.vertices().iter().position(|p| p.x == 1.0).unwrap();
    let g = assembler.global_node_index(free).unwrap().unwrap();
    let twice: Vec<f64> = matrix.b().block(g, g).unwrap().iter().map(|&v| 2.0 * v).collect();
    assert_eq!(doubled.b().block(g, g).unwrap(), twice.as_slice());
}

#[test]
fn residual_entries_take_the_prescribed_values() {
    let mesh = create_unit_box_uniform_tet_mesh_3d(1);
    let comm: Arc<dyn Communicator<f64>> = Arc::new(SelfComm::new());
    let mut assembler = Assembler::new(comm, 3);
    let mut offsets = vec![0];
    let mut nodes = Vec::new();
    for tet in mesh.connectivity() {
        nodes.extend_from_slice(&tet.0);
        offsets.push(nodes.len());
    }
    assembler.set_element_connectivity(offsets, nodes).unwrap();
    assembler
        .set_elements(vec![elastic_model()], vec![0; mesh.num_elements()])
        .unwrap();
    assembler.add_boundary_conditions(7, &[1], &[0.1]).unwrap();
    assembler.initialize().unwrap();
    let coordinates: Vec<Point3<f64>> = assembler
        .local_nodes()
        .unwrap()
        .iter()
        .map(|&vertex| mesh.vertices()[vertex])
        .collect();
    assembler.set_nodes(&coordinates).unwrap();

    let g = assembler.global_node_index(7).unwrap().unwrap();
    let mut residual = assembler.create_vector().unwrap();
    assembler.assemble_residual(&mut residual).unwrap();
    for (flat, &value) in residual.owned_values().iter().enumerate() {
        if flat == 3 * g + 1 {
            assert_eq!(value, 0.1);
        } else {
            assert_eq!(value, 0.0);
        }
    }
}

#[test]
fn the_residual_is_consistent_with_the_jacobian() {
    let mesh = create_unit_box_uniform_tet_mesh_3d(2);
    let mut assembler = box_assembler(&mesh, NodeOrdering::Natural, false);

    let mut u = assembler.create_vector().unwrap();
    fill_state(u.owned_values_mut());
    assembler.set_variables(Some(&mut u), None, None).unwrap();

    let mut residual = assembler.create_vector().unwrap();
    assembler.assemble_residual(&mut residual).unwrap();
    let mut matrix = assembler.create_matrix().unwrap();
    assembler.assemble_jacobian(1.0, 0.0, 0.0, None, &mut matrix).unwrap();

    // Linear elements: R(u) = (dR/du) u.
    let mut expected = u.new_like();
    matrix.mult(&u, &mut expected).unwrap();
    assert_matrix_eq!(
        DVector::from_column_slice(residual.owned_values()),
        DVector::from_column_slice(expected.owned_values()),
        comp = abs,
        tol = 1e-8
    );
}

#[test]
fn dependent_nodes_fold_onto_their_masters() {
    let vertices = [
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(1.0, 0.0, 0.0),
        Point3::new(0.0, 1.0, 0.0),
        Point3::new(0.0, 0.0, 1.0),
        Point3::new(1.0, 1.0, 1.0),
    ];
    let build = |conn: [[usize; 4]; 2], dependents: Vec<(usize, Vec<(usize, f64)>)>| {
        let comm: Arc<dyn Communicator<f64>> = Arc::new(SelfComm::new());
        let mut assembler = Assembler::new(comm, 3);
        let mut offsets = vec![0];
        let mut nodes = Vec::new();
        for tet in conn {
            nodes.extend_from_slice(&tet);
            offsets.push(nodes.len());
        }
        assembler.set_element_connectivity(offsets, nodes).unwrap();
        assembler.set_elements(vec![elastic_model()], vec![0; 2]).unwrap();
        assembler.set_dependent_nodes(dependents).unwrap();
        assembler.initialize().unwrap();
        let coordinates: Vec<Point3<f64>> = assembler
            .local_nodes()
            .unwrap()
            .iter()
            .map(|&vertex| vertices[vertex])
            .collect();
        assembler.set_nodes(&coordinates).unwrap();
        assembler
    };
    let mut direct = build([[0, 1, 2, 3], [1, 2, 3, 4]], Vec::new());
    // Node 5 is a unit-weight alias of node 4, so the folded system is the
    // direct one entry for entry.
    let mut folded = build([[0, 1, 2, 3], [1, 2, 3, 5]], vec![(5, vec![(4, 1.0)])]);
    assert_eq!(direct.local_nodes().unwrap(), folded.local_nodes().unwrap());
    for vertex in 0..5 {
        assert_eq!(
            direct.global_node_index(vertex).unwrap(),
            folded.global_node_index(vertex).unwrap()
        );
    }

    let mut k_direct = direct.create_matrix().unwrap();
    direct.assemble_jacobian(1.0, 0.0, 0.0, None, &mut k_direct).unwrap();
    let mut k_folded = folded.create_matrix().unwrap();
    folded.assemble_jacobian(1.0, 0.0, 0.0, None, &mut k_folded).unwrap();
    assert_eq!(k_direct.b().pattern().major_offsets(), k_folded.b().pattern().major_offsets());
    assert_eq!(k_direct.b().pattern().minor_indices(), k_folded.b().pattern().minor_indices());
    assert_eq!(k_direct.b().values(), k_folded.b().values());

    let mut u = direct.create_vector().unwrap();
    fill_state(u.owned_values_mut());
    let mut u_folded = folded.create_vector().unwrap();
    u_folded.owned_values_mut().copy_from_slice(u.owned_values());
    direct.set_variables(Some(&mut u), None, None).unwrap();
    folded.set_variables(Some(&mut u_folded), None, None).unwrap();
    let mut r_direct = direct.create_vector().unwrap();
    direct.assemble_residual(&mut r_direct).unwrap();
    let mut r_folded = folded.create_vector().unwrap();
    folded.assemble_residual(&mut r_folded).unwrap();
    assert_eq!(r_direct.owned_values(), r_folded.owned_values());
}

#[test]
fn the_thread_count_does_not_change_results() {
    let mesh = create_unit_box_uniform_tet_mesh_3d(2);
    let mut assembler = crate::elasticity_assembler_single_rank(&mesh);
    let mut u = assembler.create_vector().unwrap();
    fill_state(u.owned_values_mut());
    assembler.set_variables(Some(&mut u), None, None).unwrap();

    let mut r_serial = assembler.create_vector().unwrap();
    assembler.assemble_residual(&mut r_serial).unwrap();
    let mut k_serial = assembler.create_matrix().unwrap();
    assembler.assemble_jacobian(1.0, 0.0, 0.0, None, &mut k_serial).unwrap();

    assembler.set_num_threads(4).unwrap();
    let mut r_threaded = assembler.create_vector().unwrap();
    let mut k_threaded = assembler.create_matrix().unwrap();
    assembler
        .assemble_jacobian(1.0, 0.0, 0.0, Some(&mut r_threaded), &mut k_threaded)
        .unwrap();
    assert_eq!(k_serial.b().values(), k_threaded.b().values());
    assert_eq!(r_serial.owned_values(), r_threaded.owned_values());
}

#[test]
fn node_orderings_only_relabel_the_unknowns() {
    let mesh = create_unit_box_uniform_tet_mesh_3d(2);
    let natural = box_assembler(&mesh, NodeOrdering::Natural, true);
    let rcm = box_assembler(&mesh, NodeOrdering::ReverseCuthillMcKee, true);
    assert_eq!(natural.local_nodes().unwrap(), rcm.local_nodes().unwrap());

    let mut k_natural = natural.create_matrix().unwrap();
    natural.assemble_jacobian(1.0, 0.0, 0.0, None, &mut k_natural).unwrap();
    let mut k_rcm = rcm.create_matrix().unwrap();
    rcm.assemble_jacobian(1.0, 0.0, 0.0, None, &mut k_rcm).unwrap();

    for v in 0..mesh.num_vertices() {
        let gn = natural.global_node_index(v).unwrap().unwrap();
        let gr = rcm.global_node_index(v).unwrap().unwrap();
        for w in 0..mesh.num_vertices() {
            let hn = natural.global_node_index(w).unwrap().unwrap();
            let hr = rcm.global_node_index(w).unwrap().unwrap();
            match (k_natural.b().block(gn, hn), k_rcm.b().block(gr, hr)) {
                (Some(a), Some(b)) => assert_eq!(a, b),
                (None, None) => {}
                _ => panic!("block structure differs between orderings"),
            }
        }
    }
}

#[test]
fn ranks_reject_inconsistent_boundary_conditions() {
    let results = run_threaded::<f64, _, _>(2, |comm| {
        let rank = comm.rank();
        let comm: Arc<dyn Communicator<f64>> = Arc::new(comm);
        let mesh = create_unit_box_uniform_tet_mesh_3d::<f64>(1);
        let partition = partition_elements_by_slabs(&mesh, 2);
        let vertex_set = |r: usize| -> BTreeSet<usize> {
            mesh.connectivity()
                .iter()
                .enumerate()
                .filter(|&(element, _)| partition[element] == r)
                .flat_map(|(_, tet)| tet.0)
                .collect()
        };
        // A vertex both ranks reference, away from the clamped face; every
        // rank computes the same one.
        let shared = vertex_set(0)
            .intersection(&vertex_set(1))
            .copied()
            .filter(|&v| mesh.vertices()[v].x > 0.0)
            .max()
            .unwrap();

        let mut assembler = Assembler::new(comm, 3);
        let mut offsets = vec![0];
        let mut nodes = Vec::new();
        for (element, tet) in mesh.connectivity().iter().enumerate() {
            if partition[element] == rank {
                nodes.extend_from_slice(&tet.0);
                offsets.push(nodes.len());
            }
        }
        let num_local = offsets.len() - 1;
        assembler.set_element_connectivity(offsets, nodes).unwrap();
        assembler.set_elements(vec![elastic_model()], vec![0; num_local]).unwrap();
        for vertex in vertices_on_min_x_face(&mesh) {
            assembler
                .add_boundary_conditions(vertex, &[0, 1, 2], &[0.0; 3])
                .unwrap();
        }
        if rank == 1 {
            assembler.add_boundary_conditions(shared, &[0], &[0.5]).unwrap();
        }
        assembler.initialize()
    });
    for result in results {
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}

#[test]
fn coupling_classification_is_consistent_across_ranks() {
    let results = run_threaded::<f64, _, _>(2, |comm| {
        let comm: Arc<dyn Communicator<f64>> = Arc::new(comm);
        let rank = comm.rank();
        let mesh = create_unit_box_uniform_tet_mesh_3d(1);
        let partition = partition_elements_by_slabs(&mesh, 2);
        let assembler = crate::elasticity_assembler(Arc::clone(&comm), &mesh, &partition);
        let map = Arc::clone(assembler.node_map().unwrap());
        let layout = Arc::clone(assembler.schur_layout().unwrap());

        let mut mapping = Vec::new();
        for &orig in assembler.local_nodes().unwrap() {
            let new = assembler.global_node_index(orig).unwrap().unwrap();
            let owned = map.is_owned_by(rank, new);
            if owned {
                let local = new - map.ownership_range(rank).start;
                match layout.slot_of_global(new).unwrap() {
                    NodeSlot::Interior(i) => assert_eq!(i, local),
                    // Owned coupling nodes take the tail of the owned range.
                    NodeSlot::Coupling(_) => assert!(local >= layout.num_interior()),
                }
            } else {
                assert!(matches!(layout.slot_of_global(new), Some(NodeSlot::Coupling(_))));
            }
            mapping.push((orig, new, owned));
        }
        (mapping, map.num_global_nodes(), layout.num_global_coupling())
    });

    assert_eq!(results[0].1, 8);
    assert_eq!(results[1].1, 8);
    assert_eq!(results[0].2, results[1].2);

    // The interface size is the number of vertices both ranks touch.
    let mesh = create_unit_box_uniform_tet_mesh_3d::<f64>(1);
    let partition = partition_elements_by_slabs(&mesh, 2);
    let vertex_set = |r: usize| -> BTreeSet<usize> {
        mesh.connectivity()
            .iter()
            .enumerate()
            .filter(|&(element, _)| partition[element] == r)
            .flat_map(|(_, tet)| tet.0)
            .collect()
    };
    let shared: BTreeSet<usize> = vertex_set(0).intersection(&vertex_set(1)).copied().collect();
    assert_eq!(results[0].2, shared.len());

    // Both ranks assign the same renumbered id to every shared vertex, and
    // the owned sets tile the global range.
    let lookup: BTreeMap<usize, usize> = results[0].0.iter().map(|&(orig, new, _)| (orig, new)).collect();
    for &(orig, new, _) in &results[1].0 {
        if let Some(&expected) = lookup.get(&orig) {
            assert_eq!(expected, new);
        }
    }
    let mut owned_new: Vec<usize> = results
        .iter()
        .flat_map(|(mapping, _, _)| {
            mapping.iter().filter(|&&(_, _, owned)| owned).map(|&(_, new, _)| new)
        })
        .collect();
    owned_new.sort_unstable();
    assert_eq!(owned_new, (0..8).collect::<Vec<_>>());
}
