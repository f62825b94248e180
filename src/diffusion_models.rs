use crate::data_import::GradientTable;
use crate::{Error, Result};
use nalgebra::{DMatrix, DVector, Matrix3, SymmetricEigen};
use ndarray::{Array3, Array4, Array5, ShapeBuilder};
use rayon::prelude::*;
use std::time::Instant;

/// writes to a design matrix A based on b-values and b-vectors. A is in column-maj memory layout
/// where columns correspond to each of the 6 unique tensor entries {Dxx Dyy Dzz Dxy Dxz Dyz} and
/// a final column of ones for ln(S0). Rows correspond to every volume, b0s included.
fn build_design_matrix(b: &[f32], g: &[[f32; 3]], a: &mut [f64]) {
    assert_eq!(b.len(), g.len(), "b and g must have the same number of entries");
    assert_eq!(7 * g.len(), a.len(), "a must have exactly 7 x the number of entries as g");

    let m = b.len();

    // g-vector indices
    let gx = 0;
    let gy = 1;
    let gz = 2;

    a.iter_mut().enumerate().for_each(|(i, a)| {
        let col_index = i / m;
        let row_idx = i % m;
        let b = b[row_idx] as f64;
        let g = g[row_idx].map(|x| x as f64);
        *a = match col_index {
            // -b_m g_x_m ^ 2, -b_m g_y_m ^ 2, -b_m g_z_m ^ 2
            0..=2 => -b * g[col_index].powi(2),
            // - 2 b_m g_x_m g_y_m
            3 => -2.0 * b * g[gx] * g[gy],
            // - 2 b_m g_x_m g_z_m
            4 => -2.0 * b * g[gx] * g[gz],
            // - 2 b_m g_y_m g_z_m
            5 => -2.0 * b * g[gy] * g[gz],
            // ln(S0)
            _ => 1.0,
        }
    });
}

/// writes the log signal of a voxel into the right-hand side vector, clamped away from zero
fn build_rhs(signal: &[f32], rhs: &mut DVector<f64>) {
    assert_eq!(signal.len(), rhs.len(), "unexpected rhs length");
    rhs.iter_mut().zip(signal).for_each(|(r, &s)| *r = (s as f64).max(f64::MIN_POSITIVE).ln());
}

/// eigenvalues in decreasing order and matching eigenvectors (as columns) of the tensor
/// {Dxx Dyy Dzz Dxy Dxz Dyz}
fn solve_eigensystem(tensor_entries: &[f64]) -> ([f32; 3], [[f32; 3]; 3]) {
    let [dxx, dyy, dzz, dxy, dxz, dyz] = [0, 1, 2, 3, 4, 5].map(|i| tensor_entries[i]);
    let d = Matrix3::new(
        dxx, dxy, dxz,
        dxy, dyy, dyz,
        dxz, dyz, dzz,
    );
    let eig = SymmetricEigen::new(d);
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eig.eigenvalues[b].total_cmp(&eig.eigenvalues[a]));

    let evals = order.map(|i| eig.eigenvalues[i] as f32);
    let evecs = order.map(|i| {
        let v = eig.eigenvectors.column(i);
        [v[0] as f32, v[1] as f32, v[2] as f32]
    });
    (evals, evecs)
}

/// fractional anisotropy of a set of eigenvalues, 0 for a null tensor
pub fn fractional_anisotropy(evals: &[f32; 3]) -> f32 {
    let [l1, l2, l3] = *evals;
    let md = (l1 + l2 + l3) / 3.;
    let num = ((l1 - md).powi(2) + (l2 - md).powi(2) + (l3 - md).powi(2)).sqrt();
    let denom = (l1.powi(2) + l2.powi(2) + l3.powi(2)).sqrt();
    if denom > 0. { (3f32 / 2.).sqrt() * num / denom } else { 0. }
}

/// ordinary least squares fit of the log-linearized tensor model
pub struct TensorModel {
    n_vols: usize,
    /// (7 x n_vols) pseudo-inverse of the design matrix
    pinv: DMatrix<f64>,
}

pub struct TensorFit {
    /// (nx, ny, nz, 3) eigenvalues in decreasing order
    pub evals: Array4<f32>,
    /// (nx, ny, nz, 3, 3) eigenvectors, evecs[[x, y, z, .., j]] is the j-th eigenvector
    pub evecs: Array5<f32>,
}

impl TensorFit {
    pub fn fa(&self) -> Array3<f32> {
        let (nx, ny, nz, _) = self.evals.dim();
        Array3::from_shape_fn((nx, ny, nz).f(), |(x, y, z)| {
            fractional_anisotropy(&[self.evals[[x, y, z, 0]], self.evals[[x, y, z, 1]], self.evals[[x, y, z, 2]]])
        })
    }
}

impl TensorModel {
    pub fn new(gtab: &GradientTable) -> Result<Self> {
        let n_vols = gtab.len();
        if n_vols < 7 {
            return Err(Error::InvalidInput(format!("at least 7 volumes are needed to fit a tensor, got {}", n_vols)));
        }
        let mut a = vec![0f64; 7 * n_vols];
        build_design_matrix(&gtab.bvals, &gtab.bvecs, &mut a);
        let design = DMatrix::from_column_slice(n_vols, 7, &a);
        let pinv = design.pseudo_inverse(1e-12)
            .map_err(|e| Error::InvalidInput(format!("tensor design matrix: {}", e)))?;
        Ok(Self { n_vols, pinv })
    }

    fn fit_voxel(&self, signal: &[f32]) -> ([f32; 3], [[f32; 3]; 3]) {
        let mut rhs = DVector::zeros(self.n_vols);
        build_rhs(signal, &mut rhs);
        let x = &self.pinv * rhs;
        solve_eigensystem(x.as_slice())
    }

    /// fits every voxel where the mask is non-zero (all voxels without a mask). Voxels outside the
    /// mask are left at zero.
    pub fn fit(&self, data: &Array4<f32>, mask: Option<&Array3<u8>>) -> Result<TensorFit> {
        let (nx, ny, nz, nq) = data.dim();
        if nq != self.n_vols {
            return Err(Error::InvalidInput(format!("data has {} volumes but the gradient table has {}", nq, self.n_vols)));
        }
        if let Some(mask) = mask {
            if mask.dim() != (nx, ny, nz) {
                return Err(Error::InvalidInput(format!("mask shape {:?} does not match data shape {:?}", mask.dim(), (nx, ny, nz))));
            }
        }

        let voxels = (0..nz).flat_map(|z| (0..ny).flat_map(move |y| (0..nx).map(move |x| (x, y, z))))
            .filter(|&(x, y, z)| mask.map_or(true, |m| m[[x, y, z]] != 0))
            .collect::<Vec<_>>();

        log::info!("fitting tensors in {} voxels ...", voxels.len());
        let now = Instant::now();
        let fits = voxels.par_iter().map(|&(x, y, z)| {
            let signal = (0..nq).map(|q| data[[x, y, z, q]]).collect::<Vec<f32>>();
            self.fit_voxel(&signal)
        }).collect::<Vec<_>>();
        log::info!("tensor fit took {:.03} secs", now.elapsed().as_secs_f32());

        let mut evals = Array4::<f32>::zeros((nx, ny, nz, 3).f());
        let mut evecs = Array5::<f32>::zeros((nx, ny, nz, 3, 3).f());
        for (&(x, y, z), (vals, vecs)) in voxels.iter().zip(fits) {
            for j in 0..3 {
                evals[[x, y, z, j]] = vals[j];
                for i in 0..3 {
                    evecs[[x, y, z, i, j]] = vecs[j][i];
                }
            }
        }
        Ok(TensorFit { evals, evecs })
    }
}
