//! Quality control screenshots of a DWI: the data is rigidly registered to a template, a tensor
//! is fitted on three orthogonal slices and FA with principal directions is rendered for the
//! sagittal, coronal and axial views.

use crate::cli::{assert_inputs_exist, assert_outputs_exist, Check};
use crate::data_import::{
    affine_from_header, get_shell_indices, normalize_bvecs, read_bvals_bvecs, read_nifti_f32, read_nifti_f32_4d,
    zooms_from_header, GradientTable,
};
use crate::diffusion_models::TensorModel;
use crate::registration::{register_image, rotate_bvecs, TransformationType};
use crate::screenshot::{display_slices, Peaks, ViewAxis};
use crate::{Error, Result};
use clap::builder::TypedValueParser;
use clap::Parser;
use ndarray::{Array3, Array4, Axis, ShapeBuilder, Zip};
use std::fs;
use std::path::PathBuf;
use std::time::Instant;

pub const B0_THRESHOLD: f32 = 10.;
pub const SHELL_TOLERANCE: f32 = 20.;

/// camera position and focal point of each view for a 1 mm template, in voxels
const CAMERAS: [(ViewAxis, [f64; 3], [f64; 3]); 3] = [
    (ViewAxis::Sagittal, [-50., 120., 100.], [80., 120., 100.]),
    (ViewAxis::Coronal, [95., 200., 100.], [95., 100., 100.]),
    (ViewAxis::Axial, [100., 100., -75.], [100., 100., 90.]),
];

#[derive(Debug, Clone, Parser)]
#[command(about = "Register DWI to a template for screenshots. For quick quality control, the MNI \
template can be downsampled to 2mm iso. Axial, coronal and sagittal slices are captured.")]
pub struct ScreenshotDtiArgs {
    /// path of the input diffusion volume
    pub dwi: PathBuf,
    /// path of the bval file, in FSL format
    pub bval: PathBuf,
    /// path of the bvec file, in FSL format
    pub bvec: PathBuf,
    /// path to the target MNI152 template for registration
    pub target_template: PathBuf,
    /// shells to use for DTI fit (usually below 1200), b0 must be listed
    #[arg(long, num_args = 1..)]
    pub shells: Option<Vec<f32>>,
    /// add a suffix to the output, else the axis name is used
    #[arg(long)]
    pub output_suffix: Option<String>,
    /// put all images in a specific directory
    #[arg(long, default_value = "", value_parser = clap::builder::OsStringValueParser::new().map(PathBuf::from))]
    pub output_dir: PathBuf,
    /// force overwriting of the output files
    #[arg(short = 'f')]
    pub overwrite: bool,
}

impl ScreenshotDtiArgs {
    pub fn output_filenames(&self) -> Vec<PathBuf> {
        ViewAxis::ALL.iter().map(|axis| {
            let name = match &self.output_suffix {
                Some(suffix) if !suffix.is_empty() => format!("{}_{}.png", axis.name(), suffix),
                _ => format!("{}.png", axis.name()),
            };
            self.output_dir.join(name)
        }).collect()
    }

    /// checks inputs and outputs, creating the output directory when needed
    pub fn check(&self) -> Check {
        assert_inputs_exist(&[self.dwi.as_path(), self.bval.as_path(), self.bvec.as_path(), self.target_template.as_path()], &[])?;
        if !self.output_dir.as_os_str().is_empty() && !self.output_dir.is_dir() {
            fs::create_dir_all(&self.output_dir)
                .map_err(|e| format!("cannot create {}: {}", self.output_dir.display(), e))?;
        }
        let outputs = self.output_filenames();
        assert_outputs_exist(&outputs.iter().map(PathBuf::as_path).collect::<Vec<_>>(), self.overwrite)
    }
}

/// slices shown for a template: off-center sagittal slice, central coronal and axial slices
pub fn slices_choice(dims: [usize; 3], zoom: f64) -> [usize; 3] {
    [
        (dims[0] as f64 / 2. + zoom * 30.) as usize,
        dims[1] / 2,
        dims[2] / 2,
    ]
}

/// restricts a mask to the three displayed slices
pub fn prepare_slices_mask(mask: &Array3<u8>, slices: [usize; 3]) -> Array3<u8> {
    let mut out = Array3::<u8>::zeros(mask.raw_dim().f());
    for (axis, &slice) in slices.iter().enumerate() {
        if slice < mask.len_of(Axis(axis)) {
            out.index_axis_mut(Axis(axis), slice).assign(&mask.index_axis(Axis(axis), slice));
        }
    }
    out
}

/// sorted indices of the volumes belonging to any of the shells
pub fn select_shells(bvals: &[f32], shells: &[f32]) -> Result<Vec<usize>> {
    let mut indices = shells.iter()
        .flat_map(|&shell| get_shell_indices(bvals, shell, SHELL_TOLERANCE))
        .collect::<Vec<_>>();
    indices.sort_unstable();
    if indices.is_empty() {
        return Err(Error::InvalidInput("There are no volumes that have the supplied b-values".to_string()));
    }
    Ok(indices)
}

/// FA and the scaled principal direction of the tensors fitted on the displayed slices, on the
/// template grid
pub struct SliceActors {
    pub fa: Array3<f32>,
    pub peak_values: Array3<f32>,
    pub peak_directions: Array4<f32>,
}

pub fn prepare_data_for_actors(args: &ScreenshotDtiArgs, slices: [usize; 3]) -> Result<SliceActors> {
    let (dwi_header, dwi) = read_nifti_f32_4d(&args.dwi)?;
    let dwi_affine = affine_from_header(&dwi_header);
    let (bvals, bvecs) = read_bvals_bvecs(&args.bval, &args.bvec)?;
    if bvals.len() != dwi.len_of(Axis(3)) {
        return Err(Error::InvalidInput(format!(
            "{} has {} volumes but {} b-values were given", args.dwi.display(), dwi.len_of(Axis(3)), bvals.len()
        )));
    }

    let (template_header, template) = read_nifti_f32(&args.target_template)?;
    let template_affine = affine_from_header(&template_header);
    let mask = template.mapv(|v| (v > 0.) as u8);
    let mask = prepare_slices_mask(&mask, slices);

    let gtab = GradientTable::new(&bvals, &normalize_bvecs(&bvecs), B0_THRESHOLD)?;
    let b0_idx = gtab.b0_indices();
    if b0_idx.is_empty() {
        return Err(Error::InvalidInput(format!("no b0 volume (b <= {}) in {}", B0_THRESHOLD, args.bval.display())));
    }
    let mean_b0 = dwi.select(Axis(3), &b0_idx).mean_axis(Axis(3))
        .ok_or_else(|| Error::InvalidInput("cannot average b0 volumes".to_string()))?;

    let (shell_data, shell_bvals, shell_bvecs) = match &args.shells {
        Some(shells) => {
            let indices = select_shells(&bvals, shells)?;
            log::info!("using {} volumes from shells {:?}", indices.len(), shells);
            (
                dwi.select(Axis(3), &indices),
                indices.iter().map(|&i| bvals[i]).collect::<Vec<_>>(),
                indices.iter().map(|&i| bvecs[i]).collect::<Vec<_>>(),
            )
        }
        None => (dwi, bvals, bvecs),
    };

    let now = Instant::now();
    let (transformed_dwi, transformation) = register_image(
        &template, &template_affine, &mean_b0, &dwi_affine, TransformationType::Rigid, Some(&shell_data),
    )?;
    log::info!("registration took {:.03} secs", now.elapsed().as_secs_f32());

    let rotated_bvecs = normalize_bvecs(&rotate_bvecs(&shell_bvecs, &transformation));
    let rotated_gtab = GradientTable::new(&shell_bvals, &rotated_bvecs, B0_THRESHOLD)?;

    let tensor_fit = TensorModel::new(&rotated_gtab)?.fit(&transformed_dwi, Some(&mask))?;
    let fa = tensor_fit.fa().mapv(|v| if v.is_finite() { v.clamp(0., 1.) } else { 0. });

    let first_evals = tensor_fit.evals.index_axis(Axis(3), 0).to_owned();
    let max = first_evals.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let peak_values = if max > 0. { first_evals.mapv(|v| v / max) } else { Array3::zeros(first_evals.raw_dim().f()) };

    let (nx, ny, nz) = fa.dim();
    let mut peak_directions = Array4::<f32>::zeros((nx, ny, nz, 3).f());
    Zip::from(peak_directions.lanes_mut(Axis(3)))
        .and(tensor_fit.evecs.index_axis(Axis(4), 0).lanes(Axis(3)))
        .for_each(|mut out, principal| out.assign(&principal));

    Ok(SliceActors { fa, peak_values, peak_directions })
}

pub fn screenshot_dti(args: &ScreenshotDtiArgs) -> Result<()> {
    let now = Instant::now();
    let (template_header, template) = read_nifti_f32(&args.target_template)?;
    let zoom = 1. / zooms_from_header(&template_header)[0] as f64;
    let (nx, ny, nz) = template.dim();
    let slices = slices_choice([nx, ny, nz], zoom);
    log::info!("slices {:?} of a {:?} template", slices, (nx, ny, nz));

    let actors = prepare_data_for_actors(args, slices)?;
    let peaks = Peaks { directions: &actors.peak_directions, values: &actors.peak_values };

    // camera settings are fixed for the known template and will not suit another one
    for ((axis, position, focal), output) in CAMERAS.iter().zip(args.output_filenames()) {
        display_slices(
            &actors.fa,
            Some(&peaks),
            slices,
            &output,
            *axis,
            position.map(|v| v * zoom),
            focal.map(|v| v * zoom),
        )?;
    }
    log::info!("screenshots took {:.03} secs", now.elapsed().as_secs_f32());
    Ok(())
}
