//! Offscreen rendering of a single slice with an optional layer of peak directions.
//!
//! The slice is seen through a perspective camera (30 degree vertical view angle) placed in voxel
//! space, with voxel `i` centered on coordinate `i`.

use crate::{Error, Result};
use image::{Rgb, RgbImage};
use nalgebra::Vector3;
use ndarray::{Array3, Array4};
use rayon::prelude::*;
use std::path::Path;

pub const WIDTH: u32 = 1920;
pub const HEIGHT: u32 = 1080;
pub const SLICE_OPACITY: f32 = 0.3;
const VIEW_ANGLE_DEG: f64 = 30.;
// half length of a peak line per unit of peak value
const PEAK_SCALE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewAxis {
    Sagittal,
    Coronal,
    Axial,
}

impl ViewAxis {
    pub const ALL: [ViewAxis; 3] = [ViewAxis::Sagittal, ViewAxis::Coronal, ViewAxis::Axial];

    pub fn name(&self) -> &'static str {
        match self {
            ViewAxis::Sagittal => "sagittal",
            ViewAxis::Coronal => "coronal",
            ViewAxis::Axial => "axial",
        }
    }

    /// array axis the displayed slice is taken along
    pub fn index(&self) -> usize {
        match self {
            ViewAxis::Sagittal => 0,
            ViewAxis::Coronal => 1,
            ViewAxis::Axial => 2,
        }
    }

    pub fn view_up(&self) -> Vector3<f64> {
        match self {
            ViewAxis::Sagittal | ViewAxis::Coronal => Vector3::z(),
            ViewAxis::Axial => Vector3::y(),
        }
    }
}

/// principal directions with their (normalized) magnitudes
pub struct Peaks<'a> {
    /// (nx, ny, nz, 3)
    pub directions: &'a Array4<f32>,
    /// (nx, ny, nz)
    pub values: &'a Array3<f32>,
}

struct Camera {
    position: Vector3<f64>,
    forward: Vector3<f64>,
    right: Vector3<f64>,
    up: Vector3<f64>,
    tan_half: f64,
    aspect: f64,
}

impl Camera {
    fn new(position: [f64; 3], focal_point: [f64; 3], view_up: Vector3<f64>) -> Result<Self> {
        let position = Vector3::from(position);
        let forward = (Vector3::from(focal_point) - position).try_normalize(1e-12)
            .ok_or_else(|| Error::InvalidInput("camera position and focal point coincide".to_string()))?;
        let right = forward.cross(&view_up).try_normalize(1e-12)
            .ok_or_else(|| Error::InvalidInput("view up is parallel to the viewing direction".to_string()))?;
        let up = right.cross(&forward);
        Ok(Self {
            position,
            forward,
            right,
            up,
            tan_half: (VIEW_ANGLE_DEG.to_radians() / 2.).tan(),
            aspect: WIDTH as f64 / HEIGHT as f64,
        })
    }

    fn ray(&self, px: u32, py: u32) -> Vector3<f64> {
        let sx = (2. * (px as f64 + 0.5) / WIDTH as f64 - 1.) * self.aspect * self.tan_half;
        let sy = (1. - 2. * (py as f64 + 0.5) / HEIGHT as f64) * self.tan_half;
        self.forward + self.right * sx + self.up * sy
    }

    /// pixel coordinates of a point, None behind the camera
    fn project(&self, p: &Vector3<f64>) -> Option<(f64, f64)> {
        let v = p - self.position;
        let depth = v.dot(&self.forward);
        if depth <= 0. {
            return None;
        }
        let sx = v.dot(&self.right) / depth / (self.tan_half * self.aspect);
        let sy = v.dot(&self.up) / depth / self.tan_half;
        Some(((sx + 1.) / 2. * WIDTH as f64, (1. - sy) / 2. * HEIGHT as f64))
    }
}

fn value_range(vol: &Array3<f32>) -> (f32, f32) {
    vol.iter().filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}

/// renders the slice `slices[axis]` of `volume` in grayscale at the slice opacity over a black
/// background, with peaks of the same slice drawn on top, and writes a PNG
pub fn display_slices(
    volume: &Array3<f32>,
    peaks: Option<&Peaks>,
    slices: [usize; 3],
    output: impl AsRef<Path>,
    axis: ViewAxis,
    view_position: [f64; 3],
    focal_point: [f64; 3],
) -> Result<()> {
    let img = render_slice(volume, peaks, slices, axis, view_position, focal_point)?;
    img.save(output.as_ref())?;
    log::info!("wrote {}", output.as_ref().display());
    Ok(())
}

pub fn render_slice(
    volume: &Array3<f32>,
    peaks: Option<&Peaks>,
    slices: [usize; 3],
    axis: ViewAxis,
    view_position: [f64; 3],
    focal_point: [f64; 3],
) -> Result<RgbImage> {
    let camera = Camera::new(view_position, focal_point, axis.view_up())?;
    let (nx, ny, nz) = volume.dim();
    let dims = [nx, ny, nz];
    let a = axis.index();
    if slices[a] >= dims[a] {
        return Err(Error::InvalidInput(format!("{} slice {} is outside a volume of shape {:?}", axis.name(), slices[a], dims)));
    }
    let plane = slices[a] as f64;
    let (lo, hi) = value_range(volume);
    let scale = if hi > lo { 1. / (hi - lo) } else { 0. };

    let row_len = WIDTH as usize * 3;
    let mut buffer = vec![0u8; row_len * HEIGHT as usize];
    buffer.par_chunks_exact_mut(row_len).enumerate().for_each(|(py, row)| {
        for (px, pixel) in row.chunks_exact_mut(3).enumerate() {
            let dir = camera.ray(px as u32, py as u32);
            if dir[a] == 0. {
                continue;
            }
            let t = (plane - camera.position[a]) / dir[a];
            if t <= 0. {
                continue;
            }
            let hit = camera.position + dir * t;
            let mut voxel = [slices[a]; 3];
            let mut inside = true;
            for d in (0..3).filter(|&d| d != a) {
                let i = hit[d].round();
                if i < 0. || i >= dims[d] as f64 {
                    inside = false;
                    break;
                }
                voxel[d] = i as usize;
            }
            if !inside {
                continue;
            }
            let v = volume[voxel];
            if !v.is_finite() {
                continue;
            }
            let gray = ((v - lo) * scale).clamp(0., 1.) * SLICE_OPACITY * 255.;
            pixel.fill(gray.round() as u8);
        }
    });
    let mut img = RgbImage::from_raw(WIDTH, HEIGHT, buffer)
        .ok_or_else(|| Error::InvalidInput("frame buffer does not match image size".to_string()))?;

    if let Some(peaks) = peaks {
        draw_peaks(&mut img, &camera, peaks, axis, slices[a])?;
    }
    Ok(img)
}

fn draw_peaks(img: &mut RgbImage, camera: &Camera, peaks: &Peaks, axis: ViewAxis, slice: usize) -> Result<()> {
    let (nx, ny, nz, nc) = peaks.directions.dim();
    if nc != 3 || peaks.values.dim() != (nx, ny, nz) {
        return Err(Error::InvalidInput("peak directions and values do not share a grid".to_string()));
    }
    let a = axis.index();
    let dims = [nx, ny, nz];
    if slice >= dims[a] {
        return Ok(());
    }
    let (b, c) = match a {
        0 => (1, 2),
        1 => (0, 2),
        _ => (0, 1),
    };
    for j in 0..dims[b] {
        for k in 0..dims[c] {
            let mut voxel = [0usize; 3];
            voxel[a] = slice;
            voxel[b] = j;
            voxel[c] = k;
            let value = peaks.values[voxel] as f64;
            let [x, y, z] = voxel;
            let dir = Vector3::new(
                peaks.directions[[x, y, z, 0]] as f64,
                peaks.directions[[x, y, z, 1]] as f64,
                peaks.directions[[x, y, z, 2]] as f64,
            );
            if !(value > 0.) || dir.norm() == 0. {
                continue;
            }
            let color = orientation_color(&dir);
            let center = Vector3::new(x as f64, y as f64, z as f64);
            let half = dir * value * PEAK_SCALE;
            if let (Some(p0), Some(p1)) = (camera.project(&(center - half)), camera.project(&(center + half))) {
                draw_line(img, p0, p1, color);
            }
        }
    }
    Ok(())
}

/// RGB from the absolute components of a unit direction
fn orientation_color(dir: &Vector3<f64>) -> Rgb<u8> {
    let n = dir.norm();
    let c = dir.map(|v| ((v / n).abs() * 255.).round().min(255.) as u8);
    Rgb([c[0], c[1], c[2]])
}

/// one pixel wide line (Bresenham), clipped to the image
fn draw_line(img: &mut RgbImage, p0: (f64, f64), p1: (f64, f64), color: Rgb<u8>) {
    let limit = 4. * WIDTH.max(HEIGHT) as f64;
    if [p0.0, p0.1, p1.0, p1.1].iter().any(|v| !v.is_finite() || v.abs() > limit) {
        return;
    }
    let (mut x0, mut y0) = (p0.0.floor() as i64, p0.1.floor() as i64);
    let (x1, y1) = (p1.0.floor() as i64, p1.1.floor() as i64);
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    let (w, h) = (img.width() as i64, img.height() as i64);
    loop {
        if x0 >= 0 && x0 < w && y0 >= 0 && y0 < h {
            img.put_pixel(x0 as u32, y0 as u32, color);
        }
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}
