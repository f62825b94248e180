//! Similarity measures between two bundles, either on their density maps or on their streamlines.

use crate::clustering::mdf;
use crate::distance_transform::edt;
use crate::tractogram::Streamline;
use ndarray::{Array3, Zip};
use std::collections::HashSet;

/// Dice coefficient of the binarized maps and the density weighted Dice coefficient. Both are 0
/// when the maps are empty.
pub fn compute_dice_voxel(density_1: &Array3<f32>, density_2: &Array3<f32>) -> (f64, f64) {
    assert_eq!(density_1.dim(), density_2.dim(), "density maps must have the same shape");

    let mut count_1 = 0usize;
    let mut count_2 = 0usize;
    let mut intersection = 0usize;
    let mut overlap_weight = 0f64;
    let mut total_weight = 0f64;
    Zip::from(density_1).and(density_2).for_each(|&a, &b| {
        let in_1 = a > 0.;
        let in_2 = b > 0.;
        count_1 += in_1 as usize;
        count_2 += in_2 as usize;
        total_weight += a as f64 + b as f64;
        if in_1 && in_2 {
            intersection += 1;
            overlap_weight += a as f64 + b as f64;
        }
    });

    let denominator = (count_1 + count_2) as f64;
    let dice = if denominator > 0. { 2. * intersection as f64 / denominator } else { 0. };
    let w_dice = if total_weight > 0. { overlap_weight / total_weight } else { 0. };
    (dice, w_dice)
}

/// mean of the distances, optionally ignoring the zeros. An empty selection averages to 0.
fn mean_distance(distances: impl Iterator<Item = f64>, non_overlap: bool) -> f64 {
    let (sum, n) = distances
        .filter(|&d| !non_overlap || d != 0.)
        .fold((0f64, 0usize), |(s, n), d| (s + d, n + 1));
    if n > 0 { sum / n as f64 } else { 0. }
}

/// bundle adjacency on voxels: for every occupied voxel of one map, the distance (in voxels) to
/// the closest occupied voxel of the other map, averaged in both directions. With `non_overlap`,
/// voxels present in both maps are left out of the averages.
pub fn compute_bundle_adjacency_voxel(density_1: &Array3<f32>, density_2: &Array3<f32>, non_overlap: bool) -> f64 {
    assert_eq!(density_1.dim(), density_2.dim(), "density maps must have the same shape");
    let binary_1 = density_1.mapv(|v| v > 0.);
    let binary_2 = density_2.mapv(|v| v > 0.);
    if !binary_1.iter().any(|&b| b) || !binary_2.iter().any(|&b| b) {
        return 0.;
    }

    let to_1 = edt(&binary_1);
    let to_2 = edt(&binary_2);

    let distance_b1 = mean_distance(
        binary_2.iter().zip(to_1.iter()).filter(|(&b, _)| b).map(|(_, &d)| d),
        non_overlap,
    );
    let distance_b2 = mean_distance(
        binary_1.iter().zip(to_2.iter()).filter(|(&b, _)| b).map(|(_, &d)| d),
        non_overlap,
    );
    (distance_b1 + distance_b2) / 2.
}

/// bundle adjacency on streamlines: for every centroid of one bundle, the MDF distance to the
/// closest centroid of the other bundle, averaged in both directions
pub fn compute_bundle_adjacency_streamlines(centroids_1: &[Streamline], centroids_2: &[Streamline], non_overlap: bool) -> f64 {
    if centroids_1.is_empty() || centroids_2.is_empty() {
        return 0.;
    }
    let distances = centroids_1.iter()
        .map(|a| centroids_2.iter().map(|b| mdf(a, b) as f64).collect::<Vec<_>>())
        .collect::<Vec<_>>();

    // closest centroid of bundle 1 for each centroid of bundle 2
    let closest_in_1 = (0..centroids_2.len())
        .map(|j| distances.iter().map(|row| row[j]).fold(f64::INFINITY, f64::min));
    let closest_in_2 = distances.iter()
        .map(|row| row.iter().copied().fold(f64::INFINITY, f64::min));

    (mean_distance(closest_in_1, non_overlap) + mean_distance(closest_in_2, non_overlap)) / 2.
}

/// key identifying a streamline after rounding its coordinates to `precision` decimals
fn streamline_key(streamline: &[[f32; 3]], precision: i32) -> Vec<i64> {
    let scale = 10f64.powi(precision);
    streamline.iter()
        .flat_map(|p| p.iter().map(move |&v| (v as f64 * scale).round() as i64))
        .collect()
}

/// streamlines present in both bundles, with coordinates matched after rounding to `precision`
/// decimals. Order follows the first bundle.
pub fn streamlines_intersection(bundle_1: &[Streamline], bundle_2: &[Streamline], precision: i32) -> Vec<Streamline> {
    let keys_2 = bundle_2.iter().map(|s| streamline_key(s, precision)).collect::<HashSet<_>>();
    let mut seen = HashSet::new();
    bundle_1.iter()
        .filter(|s| {
            let key = streamline_key(s, precision);
            keys_2.contains(&key) && seen.insert(key)
        })
        .cloned()
        .collect()
}

/// distinct streamlines of both bundles, matched after rounding to `precision` decimals
pub fn streamlines_union(bundle_1: &[Streamline], bundle_2: &[Streamline], precision: i32) -> Vec<Streamline> {
    let mut seen = HashSet::new();
    bundle_1.iter().chain(bundle_2)
        .filter(|s| seen.insert(streamline_key(s, precision)))
        .cloned()
        .collect()
}

/// streamline-wise Dice coefficient, only meaningful when both bundles come from the same
/// tractogram. Returns the coefficient, the intersection and the union.
pub fn compute_dice_streamlines(bundle_1: &[Streamline], bundle_2: &[Streamline]) -> (f64, Vec<Streamline>, Vec<Streamline>) {
    let intersection = streamlines_intersection(bundle_1, bundle_2, 0);
    let union = streamlines_union(bundle_1, bundle_2, 0);
    let denominator = (bundle_1.len() + bundle_2.len()) as f64;
    let dice = if denominator > 0. { 2. * intersection.len() as f64 / denominator } else { 0. };
    (dice, intersection, union)
}

/// Pearson correlation coefficient, NaN when either input has no variance
pub fn pearson_correlation(x: &[f64], y: &[f64]) -> f64 {
    assert_eq!(x.len(), y.len(), "correlated samples must have the same length");
    let n = x.len() as f64;
    if x.is_empty() {
        return f64::NAN;
    }
    let mx = x.iter().sum::<f64>() / n;
    let my = y.iter().sum::<f64>() / n;
    let (mut sxy, mut sxx, mut syy) = (0f64, 0f64, 0f64);
    for (a, b) in x.iter().zip(y) {
        let (da, db) = (a - mx, b - my);
        sxy += da * db;
        sxx += da * da;
        syy += db * db;
    }
    let r = sxy / (sxx * syy).sqrt();
    if r.is_finite() { r.clamp(-1., 1.) } else { f64::NAN }
}

/// correlation of two maps over the voxels where either map is non-zero
pub fn masked_correlation(map_1: &Array3<f32>, map_2: &Array3<f32>) -> f64 {
    let (x, y): (Vec<f64>, Vec<f64>) = map_1.iter().zip(map_2.iter())
        .filter(|(&a, &b)| a + b > 0.)
        .map(|(&a, &b)| (a as f64, b as f64))
        .unzip();
    pearson_correlation(&x, &y)
}
