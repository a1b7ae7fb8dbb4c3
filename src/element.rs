//! Element models: the local residual and Jacobian kernels fed to the
//! assembler.
//!
//! Models are a closed set of variants rather than a trait object, so the
//! assembler can query sizes and dispatch without dynamic allocation, and
//! adding a model is an explicit, exhaustive change.
use crate::Real;
use eyre::eyre;
use nalgebra::{DMatrixViewMut, Matrix3, Point3, SMatrix};
use numeric_literals::replace_float_literals;
use serde::{Deserialize, Serialize};

/// Isotropic linear-elastic material parameters.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsotropicMaterial<T> {
    pub young_modulus: T,
    pub poisson_ratio: T,
    pub density: T,
}

impl<T: Real> IsotropicMaterial<T> {
    pub fn new(young_modulus: T, poisson_ratio: T, density: T) -> Self {
        Self {
            young_modulus,
            poisson_ratio,
            density,
        }
    }

    /// The Lamé parameters `(lambda, mu)`.
    #[replace_float_literals(T::from_f64(literal).unwrap())]
    pub fn lame_parameters(&self) -> (T, T) {
        let e = self.young_modulus;
        let nu = self.poisson_ratio;
        let lambda = e * nu / ((1.0 + nu) * (1.0 - 2.0 * nu));
        let mu = e / (2.0 * (1.0 + nu));
        (lambda, mu)
    }
}

/// Linear heat conduction material parameters.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConductionMaterial<T> {
    pub conductivity: T,
    pub density: T,
    pub specific_heat: T,
}

/// An element model: the physics evaluated on one element.
///
/// The residual convention is `R(u, u', u'') = 0`, and Jacobians are
/// evaluated as the combination
/// `alpha * dR/du + beta * dR/du' + gamma * dR/du''`,
/// which covers stiffness-only, damped and inertial systems with one entry
/// point.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub enum ElementModel<T> {
    /// Linear elastic 4-node tetrahedron with 3 displacement degrees of
    /// freedom per node. `dR/du` is the stiffness matrix, `dR/du''` the
    /// consistent mass matrix; there is no damping term.
    ElasticTet4(IsotropicMaterial<T>),
    /// Linear heat conduction on a 4-node tetrahedron with 1 temperature
    /// degree of freedom per node. `dR/du` is the conductivity matrix,
    /// `dR/du'` the capacity matrix.
    ConductionTet4(ConductionMaterial<T>),
}

impl<T: Real> ElementModel<T> {
    pub fn num_nodes(&self) -> usize {
        4
    }

    /// Degrees of freedom per node; this must match the block size of the
    /// assembler the model is registered with.
    pub fn dofs_per_node(&self) -> usize {
        match self {
            ElementModel::ElasticTet4(_) => 3,
            ElementModel::ConductionTet4(_) => 1,
        }
    }

    pub fn num_dofs(&self) -> usize {
        self.num_nodes() * self.dofs_per_node()
    }

    /// Accumulates the element residual into `residual`.
    pub fn add_residual(
        &self,
        coords: &[Point3<T>],
        u: &[T],
        u_dot: &[T],
        u_ddot: &[T],
        residual: &mut [T],
    ) -> eyre::Result<()> {
        let n = self.num_dofs();
        assert_eq!(coords.len(), self.num_nodes(), "Invalid number of element nodes.");
        assert!(
            u.len() == n && u_dot.len() == n && u_ddot.len() == n && residual.len() == n,
            "Invalid element state dimensions."
        );
        match self {
            ElementModel::ElasticTet4(material) => {
                let (volume, gradients) = tet_gradients(coords)?;
                let stiffness = elastic_stiffness(material, volume, &gradients);
                for i in 0..n {
                    let mut value = T::zero();
                    for j in 0..n {
                        value += stiffness[(i, j)] * u[j];
                    }
                    residual[i] += value;
                }
                let mass_scale = consistent_mass_scale(material.density, volume);
                apply_consistent_mass(residual, u_ddot, mass_scale, 3);
            }
            ElementModel::ConductionTet4(material) => {
                let (volume, gradients) = tet_gradients(coords)?;
                let conductivity = conduction_matrix(material, volume, &gradients);
                for i in 0..n {
                    let mut value = T::zero();
                    for j in 0..n {
                        value += conductivity[(i, j)] * u[j];
                    }
                    residual[i] += value;
                }
                let capacity_scale = consistent_mass_scale(material.density * material.specific_heat, volume);
                apply_consistent_mass(residual, u_dot, capacity_scale, 1);
            }
        }
        Ok(())
    }

    /// Accumulates `alpha * dR/du + beta * dR/du' + gamma * dR/du''` into
    /// `jacobian`, which must be square with [`num_dofs`](Self::num_dofs)
    /// rows.
    pub fn add_jacobian(
        &self,
        coords: &[Point3<T>],
        alpha: T,
        beta: T,
        gamma: T,
        mut jacobian: DMatrixViewMut<T>,
    ) -> eyre::Result<()> {
        let n = self.num_dofs();
        assert_eq!(coords.len(), self.num_nodes(), "Invalid number of element nodes.");
        assert!(
            jacobian.nrows() == n && jacobian.ncols() == n,
            "Invalid element Jacobian dimensions."
        );
        match self {
            ElementModel::ElasticTet4(material) => {
                let (volume, gradients) = tet_gradients(coords)?;
                let stiffness = elastic_stiffness(material, volume, &gradients);
                for i in 0..n {
                    for j in 0..n {
                        jacobian[(i, j)] += alpha * stiffness[(i, j)];
                    }
                }
                let mass_scale = consistent_mass_scale(material.density, volume);
                add_consistent_mass(jacobian, gamma * mass_scale, 4, 3);
            }
            ElementModel::ConductionTet4(material) => {
                let (volume, gradients) = tet_gradients(coords)?;
                let conductivity = conduction_matrix(material, volume, &gradients);
                for i in 0..n {
                    for j in 0..n {
                        jacobian[(i, j)] += alpha * conductivity[(i, j)];
                    }
                }
                let capacity_scale = consistent_mass_scale(material.density * material.specific_heat, volume);
                add_consistent_mass(jacobian, beta * capacity_scale, 4, 1);
            }
        }
        Ok(())
    }
}

/// The volume and physical shape function gradients of a linear tetrahedron.
///
/// Column `a` of the returned matrix is the constant gradient of the basis
/// function of node `a`. Degenerate or inverted elements are rejected.
#[replace_float_literals(T::from_f64(literal).unwrap())]
fn tet_gradients<T: Real>(coords: &[Point3<T>]) -> eyre::Result<(T, SMatrix<T, 3, 4>)> {
    let edges = Matrix3::from_columns(&[
        coords[1] - coords[0],
        coords[2] - coords[0],
        coords[3] - coords[0],
    ]);
    let det = edges.determinant();
    if det <= T::zero() {
        return Err(eyre!("Degenerate or inverted tetrahedron (signed volume {:?})", det / 6.0));
    }
    let volume = det / 6.0;
    let edges_inv_t = edges
        .try_inverse()
        .ok_or_else(|| eyre!("Tetrahedron edge matrix is not invertible"))?
        .transpose();

    // Reference gradients of nodes 1..3 are the identity columns; node 0
    // carries the negated sum.
    let mut gradients = SMatrix::<T, 3, 4>::zeros();
    for a in 0..3 {
        let column = edges_inv_t.column(a).clone_owned();
        gradients.set_column(a + 1, &column);
        for i in 0..3 {
            gradients[(i, 0)] -= column[i];
        }
    }
    Ok((volume, gradients))
}

/// The 12x12 stiffness matrix `V * B^T D B` of a constant-strain
/// tetrahedron.
#[replace_float_literals(T::from_f64(literal).unwrap())]
fn elastic_stiffness<T: Real>(
    material: &IsotropicMaterial<T>,
    volume: T,
    gradients: &SMatrix<T, 3, 4>,
) -> SMatrix<T, 12, 12> {
    let (lambda, mu) = material.lame_parameters();

    // Strain-displacement matrix in Voigt order (xx, yy, zz, yz, xz, xy)
    // with engineering shear strains.
    let mut b = SMatrix::<T, 6, 12>::zeros();
    for a in 0..4 {
        let (gx, gy, gz) = (gradients[(0, a)], gradients[(1, a)], gradients[(2, a)]);
        let col = 3 * a;
        b[(0, col)] = gx;
        b[(1, col + 1)] = gy;
        b[(2, col + 2)] = gz;
        b[(3, col + 1)] = gz;
        b[(3, col + 2)] = gy;
        b[(4, col)] = gz;
        b[(4, col + 2)] = gx;
        b[(5, col)] = gy;
        b[(5, col + 1)] = gx;
    }

    let mut d = SMatrix::<T, 6, 6>::zeros();
    for i in 0..3 {
        for j in 0..3 {
            d[(i, j)] = lambda;
        }
        d[(i, i)] = lambda + 2.0 * mu;
        d[(i + 3, i + 3)] = mu;
    }

    (b.transpose() * d * b) * volume
}

/// The 4x4 conductivity matrix `V * kappa * G^T G`.
fn conduction_matrix<T: Real>(
    material: &ConductionMaterial<T>,
    volume: T,
    gradients: &SMatrix<T, 3, 4>,
) -> SMatrix<T, 4, 4> {
    (gradients.transpose() * gradients) * (material.conductivity * volume)
}

/// The scale of the consistent mass matrix of a linear tetrahedron, whose
/// entries are `scale * (1 + delta_ab)` per degree-of-freedom component.
#[replace_float_literals(T::from_f64(literal).unwrap())]
fn consistent_mass_scale<T: Real>(density: T, volume: T) -> T {
    density * volume / 20.0
}

fn add_consistent_mass<T: Real>(
    mut jacobian: DMatrixViewMut<T>,
    scale: T,
    num_nodes: usize,
    dofs_per_node: usize,
) {
    if scale == T::zero() {
        return;
    }
    for a in 0..num_nodes {
        for b in 0..num_nodes {
            let value = if a == b { scale + scale } else { scale };
            for i in 0..dofs_per_node {
                jacobian[(a * dofs_per_node + i, b * dofs_per_node + i)] += value;
            }
        }
    }
}

/// The consistent mass matrix applied to `state`, accumulated into
/// `residual`.
fn apply_consistent_mass<T: Real>(residual: &mut [T], state: &[T], scale: T, dofs_per_node: usize) {
    if scale == T::zero() {
        return;
    }
    let num_nodes = residual.len() / dofs_per_node;
    for a in 0..num_nodes {
        for b in 0..num_nodes {
            let value = if a == b { scale + scale } else { scale };
            for i in 0..dofs_per_node {
                residual[a * dofs_per_node + i] += value * state[b * dofs_per_node + i];
            }
        }
    }
}
