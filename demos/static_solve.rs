//! Static equilibrium of a clamped elastic box under a uniform downward load.
//!
//! Four communicator ranks run as threads. Each rank assembles its slab of
//! the element partition and takes part in the collective preconditioned
//! GMRES solve.

use std::sync::Arc;

use eyre::eyre;
use nalgebra::Point3;
use sleipnir::assembler::Assembler;
use sleipnir::comm::{run_threaded, Communicator};
use sleipnir::element::{ElementModel, IsotropicMaterial};
use sleipnir::gmres::{Gmres, RelativeResidualCriterion};
use sleipnir::precond::SchurPreconditioner;
use sleipnir::procedural::{
    create_unit_box_uniform_tet_mesh_3d, partition_elements_by_slabs, vertices_on_min_x_face,
    TetMesh3d,
};

const RESOLUTION: usize = 6;
const NUM_RANKS: usize = 4;
const FILL_LEVEL: usize = 2;

struct RankReport {
    rank: usize,
    num_interior: usize,
    num_owned_coupling: usize,
    num_iterations: usize,
    residual_norm: f64,
    max_displacement: f64,
}

fn solve_on_rank(
    comm: Arc<dyn Communicator<f64>>,
    mesh: &TetMesh3d<f64>,
    partition: &[usize],
) -> eyre::Result<RankReport> {
    let rank = comm.rank();
    let mut assembler = Assembler::new(comm, 3);

    let mut offsets = vec![0];
    let mut nodes = Vec::new();
    for (element, tet) in mesh.connectivity().iter().enumerate() {
        if partition[element] == rank {
            nodes.extend_from_slice(&tet.0);
            offsets.push(nodes.len());
        }
    }
    let num_local_elements = offsets.len() - 1;
    assembler.set_element_connectivity(offsets, nodes)?;

    let material = IsotropicMaterial::new(10_000.0, 0.3, 1.0);
    assembler.set_elements(
        vec![ElementModel::ElasticTet4(material)],
        vec![0; num_local_elements],
    )?;

    for vertex in vertices_on_min_x_face(mesh) {
        assembler.add_boundary_conditions(vertex, &[0, 1, 2], &[0.0; 3])?;
    }

    assembler.initialize()?;
    let coordinates: Vec<Point3<f64>> = assembler
        .local_nodes()?
        .iter()
        .map(|&vertex| mesh.vertices()[vertex])
        .collect();
    assembler.set_nodes(&coordinates)?;

    let mut matrix = assembler.create_matrix()?;
    assembler.assemble_jacobian(1.0, 0.0, 0.0, None, &mut matrix)?;
    let preconditioner = SchurPreconditioner::factor(&matrix, FILL_LEVEL)?;

    // Unit downward load on every node; the clamped entries are overwritten
    // with their prescribed values below.
    let mut b = assembler.create_vector()?;
    for values in b.owned_values_mut().chunks_exact_mut(3) {
        values[2] = -1.0;
    }
    assembler.apply_boundary_conditions(&mut b)?;

    let mut x = b.new_like();
    let output = Gmres::new()
        .with_operator(&matrix)
        .with_preconditioner(&preconditioner)
        .with_max_iter(500)
        .with_stopping_criterion(RelativeResidualCriterion::new(1e-8))
        .solve_with_guess(&b, &mut x)
        .map_err(|err| eyre!("linear solve failed on rank {rank}: {err}"))?;

    let max_displacement = x
        .owned_values()
        .chunks_exact(3)
        .map(|u| (u[0] * u[0] + u[1] * u[1] + u[2] * u[2]).sqrt())
        .fold(0.0, f64::max);

    let layout = matrix.layout();
    Ok(RankReport {
        rank,
        num_interior: layout.num_interior(),
        num_owned_coupling: layout.num_owned_coupling(),
        num_iterations: output.num_iterations,
        residual_norm: output.residual_norm,
        max_displacement,
    })
}

fn main() -> eyre::Result<()> {
    let mesh = create_unit_box_uniform_tet_mesh_3d(RESOLUTION);
    let partition = partition_elements_by_slabs(&mesh, NUM_RANKS);
    println!(
        "Clamped unit box: {} vertices, {} elements, {} ranks",
        mesh.num_vertices(),
        mesh.num_elements(),
        NUM_RANKS
    );

    let reports = run_threaded::<f64, _, _>(NUM_RANKS, |comm| {
        solve_on_rank(Arc::new(comm), &mesh, &partition)
    });

    let mut num_iterations = 0;
    let mut residual_norm = 0.0;
    let mut max_displacement: f64 = 0.0;
    for report in reports {
        let report = report?;
        println!(
            "rank {}: {} owned nodes ({} interior, {} coupling)",
            report.rank,
            report.num_interior + report.num_owned_coupling,
            report.num_interior,
            report.num_owned_coupling
        );
        num_iterations = report.num_iterations;
        residual_norm = report.residual_norm;
        max_displacement = max_displacement.max(report.max_displacement);
    }

    println!("GMRES converged in {num_iterations} iterations (residual {residual_norm:.3e})");
    println!("Largest displacement magnitude: {max_displacement:.6}");
    Ok(())
}
