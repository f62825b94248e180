//! Projection of metric maps onto the endpoints of a bundle, to show the cortical areas reached by
//! streamlines with a given metric profile.

use crate::array_utils::truncated_voxel_of;
use crate::cli::{assert_inputs_exist, assert_output_dir_exists_and_empty, Check};
use crate::data_import::{dims_from_header, read_nifti_f32, split_name_with_nii, write_nifti_f32, zooms_from_header};
use crate::streamline_metrics::uncompress;
use crate::tractogram::{load_tractogram, Streamline};
use crate::{Error, Result};
use clap::Parser;
use ndarray::{Array3, ShapeBuilder};
use nifti::NiftiHeader;
use rayon::prelude::*;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Debug, Clone, Parser)]
#[command(about = "Projects metrics onto the endpoints of streamlines. The idea is to visualize the \
cortical areas affected by metrics (assuming streamlines start/end in the cortex).")]
pub struct EndpointsMetricArgs {
    /// fiber bundle file
    pub in_bundle: PathBuf,
    /// nifti metric(s) to compute statistics on
    #[arg(required = true, num_args = 1..)]
    pub metrics: Vec<PathBuf>,
    /// folder where to save endpoints metric
    pub output_folder: PathBuf,
    /// reference anatomy for tck files
    #[arg(long)]
    pub reference: Option<PathBuf>,
    /// force overwriting of the output files
    #[arg(short = 'f')]
    pub overwrite: bool,
}

impl EndpointsMetricArgs {
    /// checks inputs and prepares the output folder
    pub fn check(&self) -> Check {
        let mut required = vec![self.in_bundle.as_path()];
        required.extend(self.metrics.iter().map(PathBuf::as_path));
        assert_inputs_exist(&required, &[self.reference.as_deref()])?;
        check_reference(&self.in_bundle, self.reference.as_deref())?;
        assert_output_dir_exists_and_empty(&self.output_folder, self.overwrite)
    }
}

/// `.tck` tractograms carry no spatial information of their own
pub fn check_reference(bundle: &Path, reference: Option<&Path>) -> Check {
    let is_tck = bundle.extension().is_some_and(|e| e.eq_ignore_ascii_case("tck"));
    if is_tck && reference.is_none() {
        return Err(format!("--reference is required for {}", bundle.display()));
    }
    Ok(())
}

/// metric volumes must share their grid
fn assert_same_resolution(metrics: &[(PathBuf, NiftiHeader, Array3<f32>)]) -> Result<()> {
    if let Some((first_path, first, _)) = metrics.first() {
        for (path, header, _) in &metrics[1..] {
            let same_shape = dims_from_header(first) == dims_from_header(header);
            let same_zooms = zooms_from_header(first).iter().zip(zooms_from_header(header))
                .all(|(a, b)| (a - b).abs() < 1e-4);
            if !same_shape || !same_zooms {
                return Err(Error::InvalidInput(format!(
                    "{} and {} do not have the same resolution", first_path.display(), path.display()
                )));
            }
        }
    }
    Ok(())
}

/// unique voxels traversed by a streamline
fn streamline_voxels(streamline: &[[f32; 3]], dims: &[usize; 3]) -> Vec<[usize; 3]> {
    let mut seen = HashSet::new();
    uncompress(streamline, dims).into_iter().filter(|v| seen.insert(*v)).collect()
}

/// average of the metric along every streamline, stored at the voxels of its first and last
/// points and divided by the number of contributions. Streamlines without any voxel in the grid
/// are skipped.
pub fn project_endpoints(streamlines: &[Streamline], voxels: &[Vec<[usize; 3]>], data: &Array3<f32>) -> Array3<f32> {
    let (nx, ny, nz) = data.dim();
    let dims = [nx, ny, nz];

    let means = voxels.par_iter().map(|vox| {
        if vox.is_empty() {
            return None;
        }
        let sum = vox.iter().map(|v| data[*v] as f64).sum::<f64>();
        Some(sum / vox.len() as f64)
    }).collect::<Vec<_>>();

    let mut sum = Array3::<f64>::zeros((nx, ny, nz).f());
    let mut count = Array3::<u32>::zeros((nx, ny, nz).f());
    let mut skipped = 0usize;
    for (s, mean) in streamlines.iter().zip(means) {
        let (Some(mean), Some(first), Some(last)) = (mean, s.first(), s.last()) else {
            skipped += 1;
            continue;
        };
        for p in [first, last] {
            if let Some(v) = truncated_voxel_of(p, &dims) {
                sum[v] += mean;
                count[v] += 1;
            }
        }
    }
    if skipped > 0 {
        log::warn!("{} streamlines do not cross the metric grid and were skipped", skipped);
    }

    let mut out = Array3::<f32>::zeros((nx, ny, nz).f());
    ndarray::Zip::from(&mut out).and(&sum).and(&count).for_each(|o, &s, &c| {
        if c > 0 {
            *o = (s / c as f64) as f32;
        }
    });
    out
}

pub fn output_name(metric: &Path) -> String {
    let name = metric.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    let (stem, ext) = split_name_with_nii(&name);
    format!("{}_endpoints_metric{}", stem, ext)
}

pub fn endpoints_metric(args: &EndpointsMetricArgs) -> Result<()> {
    let now = Instant::now();
    let metrics = args.metrics.iter()
        .map(|m| read_nifti_f32(m).map(|(h, v)| (m.clone(), h, v)))
        .collect::<Result<Vec<_>>>()?;
    assert_same_resolution(&metrics)?;

    let tractogram = load_tractogram(&args.in_bundle, args.reference.as_deref())?;
    if tractogram.is_empty() {
        log::warn!("Empty bundle file {}. Skipping", args.in_bundle.display());
        return Ok(());
    }
    log::info!("loaded {} streamlines from {}", tractogram.len(), args.in_bundle.display());

    let Some((_, first_header, _)) = metrics.first() else {
        return Ok(());
    };
    let dims = dims_from_header(first_header);
    let voxels = tractogram.streamlines.par_iter()
        .map(|s| streamline_voxels(s, &dims))
        .collect::<Vec<_>>();

    for (path, header, data) in &metrics {
        let map = project_endpoints(&tractogram.streamlines, &voxels, data);
        let output = args.output_folder.join(output_name(path));
        write_nifti_f32(&output, header, &map)?;
        log::info!("wrote {}", output.display());
    }
    log::info!("endpoints metric took {:.03} secs", now.elapsed().as_secs_f32());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_import::header_from_reference;
    use crate::tractogram::{save_tractogram, SpatialReference, Tractogram};
    use nalgebra::Matrix4;
    use std::fs;

    fn metric() -> Array3<f32> {
        Array3::from_shape_fn((5, 4, 3).f(), |(x, _, _)| x as f32)
    }

    fn streamlines() -> Vec<Streamline> {
        vec![
            vec![[0.5, 0.5, 0.5], [3.5, 0.5, 0.5]],
            vec![[3.5, 0.5, 0.5], [3.5, 2.5, 0.5]],
        ]
    }

    #[test]
    fn endpoint_averages() {
        let data = metric();
        let dims = [5, 4, 3];
        let s = streamlines();
        let voxels = s.iter().map(|s| streamline_voxels(s, &dims)).collect::<Vec<_>>();
        let map = project_endpoints(&s, &voxels, &data);
        assert_eq!(map[[0, 0, 0]], 1.5);
        assert_eq!(map[[3, 0, 0]], 2.25);
        assert_eq!(map[[3, 2, 0]], 3.);
        assert_eq!(map[[1, 0, 0]], 0.);
    }

    #[test]
    fn revisited_voxels_count_once() {
        let data = metric();
        let s = vec![vec![[0.5, 0.5, 0.5], [2.5, 0.5, 0.5], [0.5, 0.5, 0.5]]];
        let voxels = vec![streamline_voxels(&s[0], &[5, 4, 3])];
        assert_eq!(voxels[0].len(), 3);
        let map = project_endpoints(&s, &voxels, &data);
        assert_eq!(map[[0, 0, 0]], 1.);
    }

    #[test]
    fn streamlines_outside_are_skipped() {
        let data = metric();
        let s = vec![vec![[10.5, 0.5, 0.5], [12.5, 0.5, 0.5]]];
        let voxels = vec![streamline_voxels(&s[0], &[5, 4, 3])];
        assert_eq!(project_endpoints(&s, &voxels, &data).sum(), 0.);
    }

    #[test]
    fn output_names() {
        assert_eq!(output_name(Path::new("maps/fa.nii.gz")), "fa_endpoints_metric.nii.gz");
        assert_eq!(output_name(Path::new("md.nii")), "md_endpoints_metric.nii");
    }

    #[test]
    fn tck_needs_reference() {
        assert!(check_reference(Path::new("a.tck"), None).is_err());
        assert!(check_reference(Path::new("a.tck"), Some(Path::new("t1.nii.gz"))).is_ok());
        assert!(check_reference(Path::new("a.trk"), None).is_ok());
    }

    #[test]
    fn full_run() {
        let dir = tempfile::tempdir().unwrap();
        let reference = SpatialReference::from_affine(Matrix4::identity(), [5, 4, 3]);
        let header = header_from_reference(&reference);
        let fa = dir.path().join("fa.nii.gz");
        let md = dir.path().join("md.nii.gz");
        write_nifti_f32(&fa, &header, &metric()).unwrap();
        write_nifti_f32(&md, &header, &metric().mapv(|v| 2. * v)).unwrap();
        let bundle = dir.path().join("bundle.trk");
        save_tractogram(&Tractogram::new(reference, streamlines()), &bundle).unwrap();

        let args = EndpointsMetricArgs {
            in_bundle: bundle,
            metrics: vec![fa, md],
            output_folder: dir.path().join("out"),
            reference: None,
            overwrite: false,
        };
        args.check().unwrap();
        endpoints_metric(&args).unwrap();

        let (_, fa_map) = read_nifti_f32(dir.path().join("out").join("fa_endpoints_metric.nii.gz")).unwrap();
        let (_, md_map) = read_nifti_f32(dir.path().join("out").join("md_endpoints_metric.nii.gz")).unwrap();
        assert!((fa_map[[3, 0, 0]] - 2.25).abs() < 1e-4);
        assert!((md_map[[3, 0, 0]] - 4.5).abs() < 1e-4);

        // a second run needs -f
        assert!(args.check().is_err());
        let forced = EndpointsMetricArgs { overwrite: true, ..args.clone() };
        forced.check().unwrap();
        assert_eq!(fs::read_dir(dir.path().join("out")).unwrap().count(), 0);
    }

    #[test]
    fn mismatched_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let a = SpatialReference::from_affine(Matrix4::identity(), [5, 4, 3]);
        let b = SpatialReference::from_affine(Matrix4::identity(), [5, 4, 4]);
        let fa = dir.path().join("fa.nii");
        let md = dir.path().join("md.nii");
        write_nifti_f32(&fa, &header_from_reference(&a), &metric()).unwrap();
        write_nifti_f32(&md, &header_from_reference(&b), &Array3::zeros((5, 4, 4).f())).unwrap();
        let bundle = dir.path().join("bundle.trk");
        save_tractogram(&Tractogram::new(a, streamlines()), &bundle).unwrap();
        let args = EndpointsMetricArgs {
            in_bundle: bundle,
            metrics: vec![fa, md],
            output_folder: dir.path().join("out"),
            reference: None,
            overwrite: false,
        };
        assert!(matches!(endpoints_metric(&args), Err(Error::InvalidInput(_))));
    }
}
