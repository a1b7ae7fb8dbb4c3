use sleipnir::procedural::{
    create_rectangular_uniform_tet_mesh, create_unit_box_uniform_tet_mesh_3d, partition_elements_by_slabs,
    vertices_on_min_x_face,
};

#[test]
fn unit_box_mesh_has_expected_counts() {
    let mesh = create_unit_box_uniform_tet_mesh_3d::<f64>(1);
    assert_eq!(mesh.num_vertices(), 8);
    assert_eq!(mesh.num_elements(), 6);

    let mesh = create_unit_box_uniform_tet_mesh_3d::<f64>(2);
    assert_eq!(mesh.num_vertices(), 27);
    assert_eq!(mesh.num_elements(), 48);
}

#[test]
fn unit_box_tets_are_positively_oriented() {
    let mesh = create_unit_box_uniform_tet_mesh_3d::<f64>(2);
    let vertices = mesh.vertices();
    for tet in mesh.connectivity() {
        let [a, b, c, d] = tet.0;
        let signed_volume = (vertices[b] - vertices[a])
            .cross(&(vertices[c] - vertices[a]))
            .dot(&(vertices[d] - vertices[a]));
        assert!(signed_volume > 0.0, "inverted tetrahedron {:?}", tet.0);
    }
}

#[test]
fn unit_box_vertices_fill_the_unit_cube() {
    let mesh = create_unit_box_uniform_tet_mesh_3d::<f64>(2);
    for vertex in mesh.vertices() {
        for coordinate in [vertex.x, vertex.y, vertex.z] {
            assert!((0.0..=1.0).contains(&coordinate));
        }
    }
}

#[test]
fn rectangular_mesh_spans_the_requested_box() {
    // 2 x 1 x 1 units of edge length 0.5 at 2 cells per unit.
    let mesh = create_rectangular_uniform_tet_mesh(0.5, 2, 1, 1, 2);
    assert_eq!(mesh.num_vertices(), 5 * 3 * 3);
    assert_eq!(mesh.num_elements(), 4 * 2 * 2 * 6);
    let max_x = mesh.vertices().iter().map(|v| v.x).fold(f64::NEG_INFINITY, f64::max);
    let max_y = mesh.vertices().iter().map(|v| v.y).fold(f64::NEG_INFINITY, f64::max);
    assert_eq!(max_x, 1.0);
    assert_eq!(max_y, 0.5);
}

#[test]
fn slab_partition_is_balanced_and_complete() {
    let mesh = create_unit_box_uniform_tet_mesh_3d::<f64>(3);
    let num_parts = 4;
    let partition = partition_elements_by_slabs(&mesh, num_parts);
    assert_eq!(partition.len(), mesh.num_elements());

    let mut counts = vec![0usize; num_parts];
    for &part in &partition {
        assert!(part < num_parts);
        counts[part] += 1;
    }
    let min = *counts.iter().min().unwrap();
    let max = *counts.iter().max().unwrap();
    assert!(max - min <= 1, "unbalanced partition: {:?}", counts);
}

#[test]
fn slab_partition_splits_along_x() {
    // With two slabs, every element of the first slab must lie left of (or
    // at) every element of the second in terms of x-centroids.
    let mesh = create_unit_box_uniform_tet_mesh_3d::<f64>(2);
    let partition = partition_elements_by_slabs(&mesh, 2);
    let centroid_x = |element: usize| -> f64 {
        let tet = &mesh.connectivity()[element];
        tet.0.iter().map(|&v| mesh.vertices()[v].x).sum::<f64>() / 4.0
    };
    let left_max = (0..mesh.num_elements())
        .filter(|&e| partition[e] == 0)
        .map(centroid_x)
        .fold(f64::NEG_INFINITY, f64::max);
    let right_min = (0..mesh.num_elements())
        .filter(|&e| partition[e] == 1)
        .map(centroid_x)
        .fold(f64::INFINITY, f64::min);
    assert!(left_max <= right_min);
}

#[test]
fn min_x_face_vertices_lie_on_the_face() {
    let mesh = create_unit_box_uniform_tet_mesh_3d::<f64>(2);
    let face = vertices_on_min_x_face(&mesh);
    assert_eq!(face.len(), 9);
    for &vertex in &face {
        assert_eq!(mesh.vertices()[vertex].x, 0.0);
    }
}
