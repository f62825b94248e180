use crate::array_utils::{clipped_voxel_of, index_to_subscript_col_maj3, subscript_to_index_col_maj3};
use crate::tractogram::Streamline;
use ndarray::{Array3, ShapeBuilder};
use rayon::prelude::*;

/// lists every voxel traversed by the segments of a streamline, in order of traversal. Consecutive
/// repeats are removed and voxels outside the grid are dropped. Points are in corner-origin voxel
/// coordinates.
pub fn uncompress(streamline: &[[f32; 3]], dims: &[usize; 3]) -> Vec<[usize; 3]> {
    let mut traversed: Vec<[i64; 3]> = Vec::with_capacity(streamline.len() * 2);

    let floor = |p: &[f32; 3]| [p[0].floor() as i64, p[1].floor() as i64, p[2].floor() as i64];

    if let Some(first) = streamline.first() {
        traversed.push(floor(first));
    }

    for seg in streamline.windows(2) {
        let (p0, p1) = (&seg[0], &seg[1]);
        let mut voxel = floor(p0);
        let end = floor(p1);

        let mut step = [0i64; 3];
        let mut t_max = [f64::INFINITY; 3];
        let mut t_delta = [f64::INFINITY; 3];
        for d in 0..3 {
            let delta = (p1[d] - p0[d]) as f64;
            if delta > 0. {
                step[d] = 1;
                t_delta[d] = 1. / delta;
                t_max[d] = ((voxel[d] + 1) as f64 - p0[d] as f64) / delta;
            } else if delta < 0. {
                step[d] = -1;
                t_delta[d] = -1. / delta;
                t_max[d] = (voxel[d] as f64 - p0[d] as f64) / delta;
            }
        }

        // the number of boundary crossings is fixed by the end voxel
        let mut remaining = (0..3).map(|d| (end[d] - voxel[d]).abs()).sum::<i64>();
        while remaining > 0 {
            let axis = (0..3)
                .filter(|&d| step[d] != 0 && voxel[d] != end[d])
                .min_by(|&a, &b| t_max[a].total_cmp(&t_max[b]));
            let Some(axis) = axis else { break };
            voxel[axis] += step[axis];
            t_max[axis] += t_delta[axis];
            traversed.push(voxel);
            remaining -= 1;
        }
    }

    let mut out: Vec<[usize; 3]> = Vec::with_capacity(traversed.len());
    for v in traversed {
        let inside = (0..3).all(|d| v[d] >= 0 && (v[d] as usize) < dims[d]);
        if !inside {
            continue;
        }
        let v = [v[0] as usize, v[1] as usize, v[2] as usize];
        if out.last() != Some(&v) {
            out.push(v);
        }
    }
    out
}

/// unique linear (column-major) indices of the voxels traversed by a streamline
pub fn unique_voxel_indices(streamline: &[[f32; 3]], dims: &[usize; 3]) -> Vec<usize> {
    let mut idx = uncompress(streamline, dims).iter()
        .map(|v| subscript_to_index_col_maj3(v, dims))
        .collect::<Vec<_>>();
    idx.sort_unstable();
    idx.dedup();
    idx
}

/// number of streamlines traversing each voxel. A streamline contributes at most once to a voxel.
pub fn compute_tract_counts_map(streamlines: &[Streamline], dims: &[usize; 3]) -> Array3<f32> {
    let empty = || Array3::<f32>::zeros((dims[0], dims[1], dims[2]).f());
    streamlines.par_iter()
        .fold(empty, |mut acc, s| {
            for i in unique_voxel_indices(s, dims) {
                acc[index_to_subscript_col_maj3(i, dims)] += 1.;
            }
            acc
        })
        .reduce(empty, |mut a, b| {
            a += &b;
            a
        })
}

/// density of streamline endpoints. The first and last `point_to_select` points of every
/// streamline increment the voxel they fall in (clipped to the grid). Streamlines shorter than
/// `point_to_select` contribute all of their points from both ends.
pub fn get_endpoints_density_map(streamlines: &[Streamline], dims: &[usize; 3], point_to_select: usize) -> Array3<f32> {
    let mut density = Array3::<f32>::zeros((dims[0], dims[1], dims[2]).f());
    if dims.iter().any(|&d| d == 0) {
        return density;
    }
    for s in streamlines {
        let n = s.len();
        let k = point_to_select.min(n);
        let head = &s[..k];
        let tail = &s[n - k..];
        for p in head.iter().chain(tail) {
            let [x, y, z] = clipped_voxel_of(p, dims);
            density[[x, y, z]] += 1.;
        }
    }
    density
}

#[inline(always)]
pub fn dist(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
}

/// resamples a streamline to `n_points` points equally spaced along its arc length
pub fn set_number_of_points(streamline: &[[f32; 3]], n_points: usize) -> Streamline {
    assert!(n_points >= 2, "a streamline needs at least 2 points");
    match streamline.len() {
        0 => return vec![],
        1 => return vec![streamline[0]; n_points],
        _ => {}
    }

    let mut cumulative = Vec::with_capacity(streamline.len());
    cumulative.push(0f32);
    for w in streamline.windows(2) {
        let last = *cumulative.last().unwrap_or(&0.);
        cumulative.push(last + dist(&w[0], &w[1]));
    }
    let total = *cumulative.last().unwrap_or(&0.);
    if total <= 0. {
        return vec![streamline[0]; n_points];
    }

    let mut out = Vec::with_capacity(n_points);
    let mut seg = 0;
    for i in 0..n_points {
        let target = total * i as f32 / (n_points - 1) as f32;
        while seg + 2 < cumulative.len() && cumulative[seg + 1] < target {
            seg += 1;
        }
        let seg_len = cumulative[seg + 1] - cumulative[seg];
        let t = if seg_len > 0. { ((target - cumulative[seg]) / seg_len).clamp(0., 1.) } else { 0. };
        let (a, b) = (&streamline[seg], &streamline[seg + 1]);
        out.push([a[0] + t * (b[0] - a[0]), a[1] + t * (b[1] - a[1]), a[2] + t * (b[2] - a[2])]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncompress_straight_line() {
        let s = vec![[0.5, 0.5, 0.5], [3.5, 0.5, 0.5]];
        assert_eq!(uncompress(&s, &[5, 5, 5]), vec![[0, 0, 0], [1, 0, 0], [2, 0, 0], [3, 0, 0]]);
    }

    #[test]
    fn uncompress_diagonal_is_face_connected() {
        let s = vec![[0.5, 0.5, 0.5], [2.7, 1.2, 0.5]];
        let v = uncompress(&s, &[5, 5, 5]);
        assert_eq!(v.first(), Some(&[0, 0, 0]));
        assert_eq!(v.last(), Some(&[2, 1, 0]));
        for w in v.windows(2) {
            let manhattan: usize = (0..3).map(|d| w[0][d].abs_diff(w[1][d])).sum();
            assert_eq!(manhattan, 1);
        }
    }

    #[test]
    fn uncompress_drops_outside_voxels() {
        let s = vec![[-1.5, 0.5, 0.5], [1.5, 0.5, 0.5]];
        assert_eq!(uncompress(&s, &[2, 2, 2]), vec![[0, 0, 0], [1, 0, 0]]);
    }

    #[test]
    fn tract_counts_once_per_streamline() {
        // goes forth and back through the same voxels
        let s1 = vec![[0.5, 0.5, 0.5], [2.5, 0.5, 0.5], [0.5, 0.5, 0.5]];
        let s2 = vec![[1.5, 0.5, 0.5], [1.5, 2.5, 0.5]];
        let counts = compute_tract_counts_map(&[s1, s2], &[3, 3, 1]);
        assert_eq!(counts[[0, 0, 0]], 1.);
        assert_eq!(counts[[1, 0, 0]], 2.);
        assert_eq!(counts[[2, 0, 0]], 1.);
        assert_eq!(counts[[1, 2, 0]], 1.);
        assert_eq!(counts.sum(), 6.);
    }

    #[test]
    fn endpoints_density() {
        let s = (0..10).map(|i| [i as f32 + 0.5, 0.5, 0.5]).collect::<Streamline>();
        let short = vec![[0.5, 1.5, 0.5], [1.5, 1.5, 0.5]];
        let d = get_endpoints_density_map(&[s, short], &[10, 2, 1], 3);
        assert_eq!(d.sum(), 10.);
        assert_eq!(d[[0, 0, 0]], 1.);
        assert_eq!(d[[9, 0, 0]], 1.);
        assert_eq!(d[[4, 0, 0]], 0.);
        assert_eq!(d[[0, 1, 0]], 2.);
    }

    #[test]
    fn resampling() {
        let s = vec![[0., 0., 0.], [1., 0., 0.], [1., 3., 0.]];
        let r = set_number_of_points(&s, 5);
        assert_eq!(r.len(), 5);
        assert_eq!(r[0], [0., 0., 0.]);
        assert_eq!(r[4], [1., 3., 0.]);
        assert!((r[1][0] - 1.).abs() < 1e-6 && r[1][1].abs() < 1e-6);
        let arc = r.windows(2).map(|w| dist(&w[0], &w[1])).sum::<f32>();
        assert!((arc - 4.).abs() < 1e-5);
    }
}
