//! Basic procedural tetrahedral mesh generation, mainly for tests,
//! benchmarks and examples.
use crate::Real;
use nalgebra::{Point3, Scalar};
use ordered_float::NotNan;
use serde::{Deserialize, Serialize};

/// Connectivity of a single 4-node tetrahedron, as global vertex indices.
///
/// The vertex ordering is positively oriented: the signed volume of the
/// tetrahedron spanned by the vertices is positive.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tet4Connectivity(pub [usize; 4]);

/// A 3D tetrahedral mesh with shared vertices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TetMesh3d<T: Scalar> {
    vertices: Vec<Point3<T>>,
    connectivity: Vec<Tet4Connectivity>,
}

impl<T: Scalar> TetMesh3d<T> {
    pub fn from_vertices_and_connectivity(
        vertices: Vec<Point3<T>>,
        connectivity: Vec<Tet4Connectivity>,
    ) -> Self {
        Self { vertices, connectivity }
    }

    pub fn vertices(&self) -> &[Point3<T>] {
        &self.vertices
    }

    pub fn connectivity(&self) -> &[Tet4Connectivity] {
        &self.connectivity
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn num_elements(&self) -> usize {
        self.connectivity.len()
    }
}

pub fn create_unit_box_uniform_tet_mesh_3d<T>(cells_per_dim: usize) -> TetMesh3d<T>
where
    T: Real,
{
    create_rectangular_uniform_tet_mesh(T::one(), 1, 1, 1, cells_per_dim)
}

/// Generates an axis-aligned rectangular uniform tetrahedral mesh given a unit
/// length, dimensions as multipliers of the unit length and the number of
/// cells per unit length.
///
/// Each grid cell is split into six tetrahedra around its main diagonal, so
/// neighboring cells share compatible faces.
pub fn create_rectangular_uniform_tet_mesh<T>(
    unit_length: T,
    units_x: usize,
    units_y: usize,
    units_z: usize,
    cells_per_unit: usize,
) -> TetMesh3d<T>
where
    T: Real,
{
    if cells_per_unit == 0 || units_x == 0 || units_y == 0 || units_z == 0 {
        TetMesh3d::from_vertices_and_connectivity(Vec::new(), Vec::new())
    } else {
        let mut vertices = Vec::new();
        let mut cells = Vec::new();

        let cell_size = T::from_f64(unit_length.to_subset().unwrap() / cells_per_unit as f64).unwrap();

        let num_cells_x = units_x * cells_per_unit;
        let num_cells_y = units_y * cells_per_unit;
        let num_cells_z = units_z * cells_per_unit;
        let num_vertices_x = num_cells_x + 1;
        let num_vertices_y = num_cells_y + 1;
        let num_vertices_z = num_cells_z + 1;

        let to_global_vertex_index =
            |i: usize, j: usize, k: usize| (num_vertices_x * num_vertices_y) * k + num_vertices_x * j + i;

        for k in 0..num_vertices_z {
            for j in 0..num_vertices_y {
                for i in 0..num_vertices_x {
                    let v = Point3::new(
                        T::from_usize(i).unwrap() * cell_size,
                        T::from_usize(j).unwrap() * cell_size,
                        T::from_usize(k).unwrap() * cell_size,
                    );
                    vertices.push(v);
                }
            }
        }

        for k in 0..num_cells_z {
            for j in 0..num_cells_y {
                for i in 0..num_cells_x {
                    let idx = &to_global_vertex_index;
                    let v000 = idx(i, j, k);
                    let v100 = idx(i + 1, j, k);
                    let v010 = idx(i, j + 1, k);
                    let v110 = idx(i + 1, j + 1, k);
                    let v001 = idx(i, j, k + 1);
                    let v101 = idx(i + 1, j, k + 1);
                    let v011 = idx(i, j + 1, k + 1);
                    let v111 = idx(i + 1, j + 1, k + 1);

                    // Six positively oriented tetrahedra around the main
                    // diagonal (v000, v111).
                    cells.push(Tet4Connectivity([v000, v100, v110, v111]));
                    cells.push(Tet4Connectivity([v000, v110, v010, v111]));
                    cells.push(Tet4Connectivity([v000, v010, v011, v111]));
                    cells.push(Tet4Connectivity([v000, v011, v001, v111]));
                    cells.push(Tet4Connectivity([v000, v001, v101, v111]));
                    cells.push(Tet4Connectivity([v000, v101, v100, v111]));
                }
            }
        }

        TetMesh3d::from_vertices_and_connectivity(vertices, cells)
    }
}

/// Partitions the elements of a mesh into `num_parts` slabs of roughly equal
/// element count, ordered along the x axis by element centroid.
///
/// Returns the owning part of every element. The assignment is deterministic:
/// centroid ties are broken by element index, and earlier slabs receive the
/// remainder when the element count does not divide evenly.
pub fn partition_elements_by_slabs<T>(mesh: &TetMesh3d<T>, num_parts: usize) -> Vec<usize>
where
    T: Real,
{
    assert!(num_parts > 0, "Number of parts must be positive.");
    let num_elements = mesh.num_elements();

    let centroid_x = |element: usize| {
        let mut x = 0.0;
        for &vertex in &mesh.connectivity()[element].0 {
            x += mesh.vertices()[vertex]
                .x
                .to_subset()
                .expect("Vertex coordinate must be representable as f64");
        }
        NotNan::new(x / 4.0).expect("Vertex coordinates must not be NaN")
    };

    let mut order: Vec<usize> = (0..num_elements).collect();
    order.sort_by_key(|&element| (centroid_x(element), element));

    let mut partition = vec![0; num_elements];
    let base = num_elements / num_parts;
    let remainder = num_elements % num_parts;
    let mut start = 0;
    for part in 0..num_parts {
        let len = base + usize::from(part < remainder);
        for &element in &order[start..start + len] {
            partition[element] = part;
        }
        start += len;
    }
    partition
}

/// The indices of all vertices that lie on the plane `x = 0`, within a small
/// tolerance.
pub fn vertices_on_min_x_face<T>(mesh: &TetMesh3d<T>) -> Vec<usize>
where
    T: Real,
{
    let tol = T::default_epsilon().sqrt();
    mesh.vertices()
        .iter()
        .enumerate()
        .filter(|(_, v)| v.x.abs() <= tol)
        .map(|(i, _)| i)
        .collect()
}
