use crate::tractogram::SpatialReference;
use crate::{Error, Result};
use nalgebra::Matrix4;
use ndarray::{Array3, Array4, Ix3, Ix4};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use std::fs;
use std::path::Path;

/// read a 3-D nifti volume as f32 along with its header. Scaling (scl_slope/scl_inter) is applied
/// by the reader.
pub fn read_nifti_f32(path: impl AsRef<Path>) -> Result<(NiftiHeader, Array3<f32>)> {
    let path = path.as_ref();
    let obj = ReaderOptions::new().read_file(path)?;
    let header = obj.header().clone();
    let vol = obj.into_volume().into_ndarray::<f32>()?;
    let vol = match vol.ndim() {
        3 => vol.into_dimensionality::<Ix3>(),
        // singleton 4th dimension
        4 if vol.shape()[3] == 1 => vol.index_axis_move(ndarray::Axis(3), 0).into_dimensionality::<Ix3>(),
        n => return Err(Error::InvalidInput(format!("{} must be a 3-D volume, got {} dimensions", path.display(), n))),
    }
    .map_err(|e| Error::InvalidInput(format!("{}: {}", path.display(), e)))?;
    Ok((header, vol))
}

/// read a 4-D nifti volume (e.g. a diffusion weighted series) as f32 along with its header
pub fn read_nifti_f32_4d(path: impl AsRef<Path>) -> Result<(NiftiHeader, Array4<f32>)> {
    let path = path.as_ref();
    let obj = ReaderOptions::new().read_file(path)?;
    let header = obj.header().clone();
    let vol = obj.into_volume().into_ndarray::<f32>()?;
    if vol.ndim() != 4 {
        return Err(Error::InvalidInput(format!("{} must be a 4-D volume, got {} dimensions", path.display(), vol.ndim())));
    }
    let vol = vol.into_dimensionality::<Ix4>()
        .map_err(|e| Error::InvalidInput(format!("{}: {}", path.display(), e)))?;
    Ok((header, vol))
}

pub fn write_nifti_f32(path: impl AsRef<Path>, header: &NiftiHeader, vol: &Array3<f32>) -> Result<()> {
    let header = unscaled(header);
    WriterOptions::new(path.as_ref()).reference_header(&header).write_nifti(vol)?;
    Ok(())
}

pub fn write_nifti_i16(path: impl AsRef<Path>, header: &NiftiHeader, vol: &Array3<i16>) -> Result<()> {
    let header = unscaled(header);
    WriterOptions::new(path.as_ref()).reference_header(&header).write_nifti(vol)?;
    Ok(())
}

// data is always written in its native units
fn unscaled(header: &NiftiHeader) -> NiftiHeader {
    let mut header = header.clone();
    header.scl_slope = 1.;
    header.scl_inter = 0.;
    header
}

/// voxel-to-world affine of a nifti header: the sform when set, else the qform, else a diagonal
/// affine built from the voxel sizes
pub fn affine_from_header(header: &NiftiHeader) -> Matrix4<f64> {
    if header.sform_code > 0 {
        let [x, y, z] = [&header.srow_x, &header.srow_y, &header.srow_z];
        Matrix4::new(
            x[0] as f64, x[1] as f64, x[2] as f64, x[3] as f64,
            y[0] as f64, y[1] as f64, y[2] as f64, y[3] as f64,
            z[0] as f64, z[1] as f64, z[2] as f64, z[3] as f64,
            0., 0., 0., 1.,
        )
    } else if header.qform_code > 0 {
        qform_affine(header)
    } else {
        let p = &header.pixdim;
        Matrix4::new(
            p[1] as f64, 0., 0., 0.,
            0., p[2] as f64, 0., 0.,
            0., 0., p[3] as f64, 0.,
            0., 0., 0., 1.,
        )
    }
}

/// rotation from the quaternion (b, c, d), scaled by the voxel sizes with qfac flipping z, plus
/// the quatern offsets
fn qform_affine(header: &NiftiHeader) -> Matrix4<f64> {
    let (mut b, mut c, mut d) = (header.quatern_b as f64, header.quatern_c as f64, header.quatern_d as f64);
    let mut a = 1. - (b * b + c * c + d * d);
    if a < 1e-7 {
        // 180 degree rotation, the vector part is renormalized
        let norm = (b * b + c * c + d * d).sqrt();
        (b, c, d) = (b / norm, c / norm, d / norm);
        a = 0.;
    } else {
        a = a.sqrt();
    }
    let qfac = if header.pixdim[0] < 0. { -1. } else { 1. };
    let p = &header.pixdim;
    let (dx, dy, dz) = (p[1].abs() as f64, p[2].abs() as f64, qfac * p[3].abs() as f64);
    Matrix4::new(
        (a * a + b * b - c * c - d * d) * dx, 2. * (b * c - a * d) * dy, 2. * (b * d + a * c) * dz, header.quatern_x as f64,
        2. * (b * c + a * d) * dx, (a * a + c * c - b * b - d * d) * dy, 2. * (c * d - a * b) * dz, header.quatern_y as f64,
        2. * (b * d - a * c) * dx, 2. * (c * d + a * b) * dy, (a * a + d * d - c * c - b * b) * dz, header.quatern_z as f64,
        0., 0., 0., 1.,
    )
}

pub fn zooms_from_header(header: &NiftiHeader) -> [f32; 3] {
    [header.pixdim[1].abs(), header.pixdim[2].abs(), header.pixdim[3].abs()]
}

pub fn dims_from_header(header: &NiftiHeader) -> [usize; 3] {
    [header.dim[1] as usize, header.dim[2] as usize, header.dim[3] as usize]
}

/// builds a minimal header describing the grid of a spatial reference
pub fn header_from_reference(reference: &SpatialReference) -> NiftiHeader {
    let mut header = NiftiHeader::default();
    let [vx, vy, vz] = reference.voxel_sizes;
    header.pixdim = [1., vx, vy, vz, 1., 1., 1., 1.];
    header.sform_code = 1;
    header.qform_code = 0;
    let a = &reference.affine;
    header.srow_x = [a[(0, 0)] as f32, a[(0, 1)] as f32, a[(0, 2)] as f32, a[(0, 3)] as f32];
    header.srow_y = [a[(1, 0)] as f32, a[(1, 1)] as f32, a[(1, 2)] as f32, a[(1, 3)] as f32];
    header.srow_z = [a[(2, 0)] as f32, a[(2, 1)] as f32, a[(2, 2)] as f32, a[(2, 3)] as f32];
    header
}

/// splits a file name into its stem and extension, treating `.nii.gz` as a single extension
pub fn split_name_with_nii(name: &str) -> (String, String) {
    if let Some(stem) = name.strip_suffix(".nii.gz") {
        return (stem.to_string(), ".nii.gz".to_string());
    }
    match name.rfind('.') {
        Some(i) if i > 0 => (name[..i].to_string(), name[i..].to_string()),
        _ => (name.to_string(), String::new()),
    }
}

fn read_table(txt_file: &Path) -> Result<Vec<Vec<f32>>> {
    let s = fs::read_to_string(txt_file)?;
    s.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            l.split_ascii_whitespace()
                .map(|v| v.parse::<f32>().map_err(|_| Error::InvalidInput(format!("{}: cannot parse '{}' as a number", txt_file.display(), v))))
                .collect::<Result<Vec<f32>>>()
        })
        .collect()
}

/// reads FSL formatted b-values and b-vectors. B-vectors may be stored as 3 rows (FSL) or as
/// one row per volume.
pub fn read_bvals_bvecs(bval_file: impl AsRef<Path>, bvec_file: impl AsRef<Path>) -> Result<(Vec<f32>, Vec<[f32; 3]>)> {
    let bvals = read_table(bval_file.as_ref())?.into_iter().flatten().collect::<Vec<f32>>();
    let rows = read_table(bvec_file.as_ref())?;
    let n = bvals.len();

    let bvecs = if rows.len() == 3 && rows.iter().all(|r| r.len() == n) {
        (0..n).map(|i| [rows[0][i], rows[1][i], rows[2][i]]).collect::<Vec<_>>()
    } else if rows.len() == n && rows.iter().all(|r| r.len() == 3) {
        rows.iter().map(|r| [r[0], r[1], r[2]]).collect::<Vec<_>>()
    } else {
        return Err(Error::InvalidInput(format!(
            "b-vectors in {} do not match the {} b-values", bvec_file.as_ref().display(), n
        )));
    };
    Ok((bvals, bvecs))
}

/// scales every non-null vector to unit length
pub fn normalize_bvecs(bvecs: &[[f32; 3]]) -> Vec<[f32; 3]> {
    bvecs.iter().map(|b| {
        let norm = (b[0].powi(2) + b[1].powi(2) + b[2].powi(2)).sqrt();
        if norm > 0. { [b[0] / norm, b[1] / norm, b[2] / norm] } else { *b }
    }).collect()
}

/// indices of volumes whose b-value lies within `tol` of the shell
pub fn get_shell_indices(bvals: &[f32], shell: f32, tol: f32) -> Vec<usize> {
    bvals.iter().enumerate()
        .filter(|(_, &b)| b < shell + tol && b > shell - tol)
        .map(|(i, _)| i)
        .collect()
}

/// return a mask of b0 volumes given a b-value threshold
pub fn b0_mask(bvals: &[f32], b0_threshold: f32) -> Vec<bool> {
    assert!(b0_threshold >= 0., "b0 threshold must be non-negative");
    bvals.iter().map(|&b| b <= b0_threshold).collect()
}

#[derive(Debug, Clone)]
pub struct GradientTable {
    pub bvals: Vec<f32>,
    pub bvecs: Vec<[f32; 3]>,
    pub b0s_mask: Vec<bool>,
}

impl GradientTable {
    pub fn new(bvals: &[f32], bvecs: &[[f32; 3]], b0_threshold: f32) -> Result<Self> {
        if bvals.len() != bvecs.len() {
            return Err(Error::InvalidInput(format!("{} b-values but {} b-vectors", bvals.len(), bvecs.len())));
        }
        let b0s_mask = b0_mask(bvals, b0_threshold);
        Ok(Self { bvals: bvals.to_vec(), bvecs: bvecs.to_vec(), b0s_mask })
    }

    pub fn b0_indices(&self) -> Vec<usize> {
        self.b0s_mask.iter().enumerate().filter(|(_, &m)| m).map(|(i, _)| i).collect()
    }

    pub fn len(&self) -> usize {
        self.bvals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bvals.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ShapeBuilder;
    use std::fs;

    #[test]
    fn read_fsl_gradients() {
        let dir = tempfile::tempdir().unwrap();
        let bval = dir.path().join("dwi.bval");
        let bvec = dir.path().join("dwi.bvec");
        fs::write(&bval, "0 1000 1000 5\n").unwrap();
        fs::write(&bvec, "0 1 0 0\n0 0 2 0\n0 0 0 0\n").unwrap();

        let (bvals, bvecs) = read_bvals_bvecs(&bval, &bvec).unwrap();
        assert_eq!(bvals, vec![0., 1000., 1000., 5.]);
        assert_eq!(bvecs[1], [1., 0., 0.]);
        assert_eq!(normalize_bvecs(&bvecs)[2], [0., 1., 0.]);

        let gtab = GradientTable::new(&bvals, &bvecs, 10.).unwrap();
        assert_eq!(gtab.b0_indices(), vec![0, 3]);
    }

    #[test]
    fn read_row_per_volume_bvecs() {
        let dir = tempfile::tempdir().unwrap();
        let bval = dir.path().join("dwi.bval");
        let bvec = dir.path().join("dwi.bvec");
        fs::write(&bval, "0\n1000\n").unwrap();
        fs::write(&bvec, "0 0 0\n0 0 1\n").unwrap();
        let (_, bvecs) = read_bvals_bvecs(&bval, &bvec).unwrap();
        assert_eq!(bvecs, vec![[0., 0., 0.], [0., 0., 1.]]);

        fs::write(&bvec, "0 0\n").unwrap();
        assert!(read_bvals_bvecs(&bval, &bvec).is_err());
    }

    #[test]
    fn shell_selection() {
        let bvals = [0., 995., 1010., 2000., 15.];
        assert_eq!(get_shell_indices(&bvals, 1000., 20.), vec![1, 2]);
        assert_eq!(get_shell_indices(&bvals, 0., 20.), vec![0, 4]);
        assert!(get_shell_indices(&bvals, 3000., 20.).is_empty());
    }

    #[test]
    fn nii_names() {
        assert_eq!(split_name_with_nii("fa.nii.gz"), ("fa".to_string(), ".nii.gz".to_string()));
        assert_eq!(split_name_with_nii("md.nii"), ("md".to_string(), ".nii".to_string()));
        assert_eq!(split_name_with_nii("noext"), ("noext".to_string(), String::new()));
    }

    #[test]
    fn nifti_write_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.nii.gz");
        let reference = SpatialReference::from_affine(Matrix4::new_nonuniform_scaling(&nalgebra::Vector3::new(2., 2., 2.)), [3, 4, 5]);
        let header = header_from_reference(&reference);
        let vol = Array3::from_shape_fn((3, 4, 5).f(), |(x, y, z)| (x + 10 * y + 100 * z) as f32);
        write_nifti_f32(&path, &header, &vol).unwrap();

        let (h, read) = read_nifti_f32(&path).unwrap();
        assert_eq!(read, vol);
        assert_eq!(dims_from_header(&h), [3, 4, 5]);
        assert_eq!(zooms_from_header(&h), [2., 2., 2.]);
        assert_eq!(affine_from_header(&h)[(1, 1)], 2.);
    }

    #[test]
    fn qform_only_affine() {
        let mut header = NiftiHeader::default();
        header.sform_code = 0;
        header.qform_code = 1;
        header.pixdim = [1., 2., 2., 2., 1., 1., 1., 1.];
        (header.quatern_x, header.quatern_y, header.quatern_z) = (-90., -126., -72.);
        let a = affine_from_header(&header);
        assert_eq!(a[(0, 3)], -90.);
        assert_eq!(a[(1, 3)], -126.);
        assert_eq!(a[(2, 3)], -72.);
        assert_eq!((a[(0, 0)], a[(1, 1)], a[(2, 2)]), (2., 2., 2.));

        // 180 degrees about z with a flipped third axis: LPI
        header.quatern_d = 1.;
        header.pixdim[0] = -1.;
        let a = affine_from_header(&header);
        assert!((a[(0, 0)] + 2.).abs() < 1e-9);
        assert!((a[(1, 1)] + 2.).abs() < 1e-9);
        assert!((a[(2, 2)] + 2.).abs() < 1e-9);
        assert!(a[(0, 1)].abs() < 1e-9);
    }
}
