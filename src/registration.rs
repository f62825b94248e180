//! Rigid registration of a moving volume onto a static volume by maximizing mutual information.
//!
//! Transforms map static world coordinates to moving world coordinates. Optimization starts from
//! the alignment of the intensity centers of mass, refines a translation, then a full rigid
//! transform over a coarse-to-fine pyramid of subsampled grids.

use crate::{Error, Result};
use nalgebra::{Matrix3, Matrix4, Rotation3, Vector3, Vector4};
use ndarray::{Array3, Array4, ArrayView3, Axis, ShapeBuilder};
use rayon::prelude::*;
use std::time::Instant;

pub const MI_BINS: usize = 32;
pub const PYRAMID_FACTORS: [usize; 3] = [4, 2, 1];
const MAX_ITERATIONS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformationType {
    Rigid,
    Affine,
}

/// rotation angles (radians) about the static center of mass followed by a translation (mm)
#[derive(Debug, Clone, Copy, PartialEq)]
struct RigidParams {
    angles: [f64; 3],
    translation: [f64; 3],
}

impl RigidParams {
    fn get(&self, i: usize) -> f64 {
        if i < 3 { self.angles[i] } else { self.translation[i - 3] }
    }

    fn set(&mut self, i: usize, v: f64) {
        if i < 3 { self.angles[i] = v } else { self.translation[i - 3] = v }
    }

    fn matrix(&self, center: &Vector3<f64>) -> Matrix4<f64> {
        let r: Matrix3<f64> = Rotation3::from_euler_angles(self.angles[0], self.angles[1], self.angles[2]).into_inner();
        let t = Vector3::from(self.translation);
        let offset = center - r * center + t;
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&r);
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&offset);
        m
    }
}

/// intensity weighted center of a volume in world coordinates. Falls back to the grid center
/// when the volume has no positive intensity.
pub fn center_of_mass(vol: &ArrayView3<f32>, affine: &Matrix4<f64>) -> Vector3<f64> {
    let (sum, weight) = vol.indexed_iter()
        .filter(|(_, &v)| v > 0.)
        .fold((Vector3::zeros(), 0f64), |(s, w), ((x, y, z), &v)| {
            (s + Vector3::new(x as f64, y as f64, z as f64) * v as f64, w + v as f64)
        });
    let (nx, ny, nz) = vol.dim();
    let voxel = if weight > 0. {
        sum / weight
    } else {
        Vector3::new((nx as f64 - 1.) / 2., (ny as f64 - 1.) / 2., (nz as f64 - 1.) / 2.)
    };
    (affine * voxel.push(1.)).xyz()
}

/// trilinear interpolation at a (center origin) voxel coordinate, None outside the grid
#[inline]
pub fn trilinear(vol: &ArrayView3<f32>, p: &Vector3<f64>) -> Option<f32> {
    let (nx, ny, nz) = vol.dim();
    let dims = [nx, ny, nz];
    let mut base = [0usize; 3];
    let mut frac = [0f64; 3];
    for d in 0..3 {
        let c = p[d];
        if !(c >= 0.) || c > (dims[d] - 1) as f64 {
            return None;
        }
        let f = c.floor();
        base[d] = (f as usize).min(dims[d].saturating_sub(2));
        frac[d] = c - base[d] as f64;
    }
    let mut value = 0f64;
    for corner in 0..8 {
        let offset = [corner & 1, (corner >> 1) & 1, (corner >> 2) & 1];
        let mut w = 1f64;
        let mut idx = [0usize; 3];
        for d in 0..3 {
            idx[d] = (base[d] + offset[d]).min(dims[d] - 1);
            w *= if offset[d] == 1 { frac[d] } else { 1. - frac[d] };
        }
        if w != 0. {
            value += w * vol[idx] as f64;
        }
    }
    Some(value as f32)
}

/// resamples a moving volume onto a static grid. `static_to_moving` maps static world coordinates
/// to moving world coordinates. Points falling outside the moving grid are set to 0.
pub fn resample_trilinear(
    moving: &ArrayView3<f32>,
    moving_affine: &Matrix4<f64>,
    static_to_moving: &Matrix4<f64>,
    static_affine: &Matrix4<f64>,
    static_dims: [usize; 3],
) -> Result<Array3<f32>> {
    let world_to_moving = moving_affine.try_inverse()
        .ok_or_else(|| Error::InvalidInput("moving affine is not invertible".to_string()))?;
    let grid = world_to_moving * static_to_moving * static_affine;

    let [nx, ny, nz] = static_dims;
    let mut out = Array3::<f32>::zeros((nx, ny, nz).f());
    out.axis_iter_mut(Axis(2)).into_par_iter().enumerate().for_each(|(z, mut plane)| {
        for y in 0..ny {
            for x in 0..nx {
                let p = grid * Vector4::new(x as f64, y as f64, z as f64, 1.);
                plane[[x, y]] = trilinear(moving, &p.xyz()).unwrap_or(0.);
            }
        }
    });
    Ok(out)
}

/// static samples drawn on a subsampled grid, in world coordinates
struct Samples {
    world: Vec<Vector4<f64>>,
    bins: Vec<usize>,
}

fn intensity_range(vol: &ArrayView3<f32>) -> (f32, f32) {
    vol.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}

#[inline]
fn bin_of(v: f32, range: (f32, f32)) -> usize {
    let width = range.1 - range.0;
    if width <= 0. {
        return 0;
    }
    (((v - range.0) / width * MI_BINS as f32) as usize).min(MI_BINS - 1)
}

fn draw_samples(vol: &ArrayView3<f32>, affine: &Matrix4<f64>, factor: usize, range: (f32, f32)) -> Samples {
    let (nx, ny, nz) = vol.dim();
    let mut world = vec![];
    let mut bins = vec![];
    for z in (0..nz).step_by(factor) {
        for y in (0..ny).step_by(factor) {
            for x in (0..nx).step_by(factor) {
                world.push(affine * Vector4::new(x as f64, y as f64, z as f64, 1.));
                bins.push(bin_of(vol[[x, y, z]], range));
            }
        }
    }
    Samples { world, bins }
}

/// mutual information (nats) between binned intensities
fn mutual_information(joint: &[f64]) -> f64 {
    let total = joint.iter().sum::<f64>();
    if total <= 0. {
        return 0.;
    }
    let mut ps = [0f64; MI_BINS];
    let mut pm = [0f64; MI_BINS];
    for i in 0..MI_BINS {
        for j in 0..MI_BINS {
            let p = joint[i * MI_BINS + j] / total;
            ps[i] += p;
            pm[j] += p;
        }
    }
    let mut mi = 0.;
    for i in 0..MI_BINS {
        for j in 0..MI_BINS {
            let p = joint[i * MI_BINS + j] / total;
            if p > 0. {
                mi += p * (p / (ps[i] * pm[j])).ln();
            }
        }
    }
    mi
}

struct Metric<'a> {
    samples: Samples,
    moving: ArrayView3<'a, f32>,
    world_to_moving: Matrix4<f64>,
    moving_range: (f32, f32),
}

impl Metric<'_> {
    fn evaluate(&self, static_to_moving: &Matrix4<f64>) -> f64 {
        let m = self.world_to_moving * static_to_moving;
        let joint = self.samples.world.par_iter().zip(self.samples.bins.par_iter())
            .fold(|| vec![0f64; MI_BINS * MI_BINS], |mut h, (w, &bs)| {
                // samples mapped outside the moving grid count as background
                let v = trilinear(&self.moving, &(m * w).xyz()).unwrap_or(0.);
                h[bs * MI_BINS + bin_of(v, self.moving_range)] += 1.;
                h
            })
            .reduce(|| vec![0f64; MI_BINS * MI_BINS], |mut a, b| {
                a.iter_mut().zip(b).for_each(|(a, b)| *a += b);
                a
            });
        mutual_information(&joint)
    }
}

/// compass search over the selected parameters. Steps are halved whenever no move improves the
/// metric.
fn compass_search(
    metric: &Metric,
    center: &Vector3<f64>,
    mut params: RigidParams,
    free: &[usize],
    mut steps: [f64; 6],
    min_step: [f64; 6],
) -> RigidParams {
    let mut best = metric.evaluate(&params.matrix(center));
    for _ in 0..MAX_ITERATIONS {
        let mut improved = false;
        for &i in free {
            for sign in [1., -1.] {
                let mut candidate = params;
                candidate.set(i, params.get(i) + sign * steps[i]);
                let value = metric.evaluate(&candidate.matrix(center));
                if value > best {
                    best = value;
                    params = candidate;
                    improved = true;
                    break;
                }
            }
        }
        if !improved {
            if free.iter().all(|&i| steps[i] <= min_step[i]) {
                break;
            }
            for &i in free {
                steps[i] = (steps[i] / 2.).max(min_step[i]);
            }
        }
    }
    params
}

/// rigidly registers `moving` to `static_vol`. Returns the static to moving world transform.
pub fn register_rigid(
    static_vol: &ArrayView3<f32>,
    static_affine: &Matrix4<f64>,
    moving: &ArrayView3<f32>,
    moving_affine: &Matrix4<f64>,
) -> Result<Matrix4<f64>> {
    let world_to_moving = moving_affine.try_inverse()
        .ok_or_else(|| Error::InvalidInput("moving affine is not invertible".to_string()))?;
    let center = center_of_mass(static_vol, static_affine);
    let moving_center = center_of_mass(moving, moving_affine);

    let mut params = RigidParams { angles: [0.; 3], translation: (moving_center - center).into() };
    log::info!("center of mass offset: {:?}", params.translation);

    let voxel = static_affine.fixed_view::<3, 1>(0, 0).norm();
    let static_range = intensity_range(static_vol);
    let moving_range = intensity_range(moving);

    for (level, &factor) in PYRAMID_FACTORS.iter().enumerate() {
        let now = Instant::now();
        let metric = Metric {
            samples: draw_samples(static_vol, static_affine, factor, static_range),
            moving: moving.view(),
            world_to_moving,
            moving_range,
        };
        let f = factor as f64;
        let steps = [0.05 * f, 0.05 * f, 0.05 * f, voxel * f, voxel * f, voxel * f];
        let min_step = [0.002, 0.002, 0.002, voxel * 0.05, voxel * 0.05, voxel * 0.05];
        // the translation is refined on its own at the coarsest level
        if level == 0 {
            params = compass_search(&metric, &center, params, &[3, 4, 5], steps, min_step);
        }
        params = compass_search(&metric, &center, params, &[0, 1, 2, 3, 4, 5], steps, min_step);
        log::info!(
            "registration level {} (factor {}) took {:.03} secs, angles {:?} translation {:?}",
            level, factor, now.elapsed().as_secs_f32(), params.angles, params.translation
        );
    }
    Ok(params.matrix(&center))
}

/// registers `moving` to `static_vol` and resamples every volume of `dwi` (the moving volume when
/// no series is given) onto the static grid. Returns the resampled series and the static to
/// moving world transform.
pub fn register_image(
    static_vol: &Array3<f32>,
    static_affine: &Matrix4<f64>,
    moving: &Array3<f32>,
    moving_affine: &Matrix4<f64>,
    kind: TransformationType,
    dwi: Option<&Array4<f32>>,
) -> Result<(Array4<f32>, Matrix4<f64>)> {
    if kind != TransformationType::Rigid {
        return Err(Error::InvalidInput(format!("{:?} registration is not supported, use rigid", kind)));
    }
    let transform = register_rigid(&static_vol.view(), static_affine, &moving.view(), moving_affine)?;

    let (nx, ny, nz) = static_vol.dim();
    let static_dims = [nx, ny, nz];
    let volumes = match dwi {
        Some(dwi) => dwi.axis_iter(Axis(3)).collect::<Vec<_>>(),
        None => vec![moving.view()],
    };

    let now = Instant::now();
    let resampled = volumes.par_iter()
        .map(|v| resample_trilinear(v, moving_affine, &transform, static_affine, static_dims))
        .collect::<Result<Vec<_>>>()?;
    let mut out = Array4::<f32>::zeros((nx, ny, nz, resampled.len()).f());
    for (q, vol) in resampled.iter().enumerate() {
        out.index_axis_mut(Axis(3), q).assign(vol);
    }
    log::info!("resampled {} volumes in {:.03} secs", resampled.len(), now.elapsed().as_secs_f32());
    Ok((out, transform))
}

/// rotates gradient directions by the rotation block of a static to moving transform, as row
/// vectors multiplied on the right
pub fn rotate_bvecs(bvecs: &[[f32; 3]], transform: &Matrix4<f64>) -> Vec<[f32; 3]> {
    let r = transform.fixed_view::<3, 3>(0, 0);
    bvecs.iter().map(|b| {
        let mut out = [0f32; 3];
        for (j, o) in out.iter_mut().enumerate() {
            *o = (0..3).map(|i| b[i] as f64 * r[(i, j)]).sum::<f64>() as f32;
        }
        out
    }).collect()
}
