// Exact Euclidean distance transform on voxel grids, computed one axis at a time with the lower
// envelope of parabolas (Felzenszwalb & Huttenlocher)

use ndarray::{Array3, Axis, Zip};

// stands in for infinity so the envelope arithmetic stays finite
const FAR: f64 = 1e20;

/// squared distance (in voxels) from every voxel to the nearest voxel where `mask` is true. When
/// the mask is empty every entry is a very large value.
pub fn squared_edt(mask: &Array3<bool>) -> Array3<f64> {
    let mut f = mask.mapv(|m| if m { 0. } else { FAR });
    for axis in 0..3 {
        Zip::from(f.lanes_mut(Axis(axis))).par_for_each(|mut lane| {
            let input = lane.to_vec();
            let out = edt_1d(&input);
            lane.iter_mut().zip(out).for_each(|(a, b)| *a = b);
        });
    }
    f
}

/// Euclidean distance (in voxels) to the nearest voxel where `mask` is true
pub fn edt(mask: &Array3<bool>) -> Array3<f64> {
    squared_edt(mask).mapv(f64::sqrt)
}

fn edt_1d(f: &[f64]) -> Vec<f64> {
    let n = f.len();
    if n == 0 {
        return vec![];
    }
    let mut d = vec![0f64; n];
    // locations of parabolas in the lower envelope and the boundaries between them
    let mut v = vec![0usize; n];
    let mut z = vec![0f64; n + 1];
    let mut k = 0usize;
    z[0] = f64::NEG_INFINITY;
    z[1] = f64::INFINITY;

    let intersect = |q: usize, p: usize| -> f64 {
        let (qf, pf) = (q as f64, p as f64);
        ((f[q] + qf * qf) - (f[p] + pf * pf)) / (2. * qf - 2. * pf)
    };

    for q in 1..n {
        let mut s = intersect(q, v[k]);
        while s <= z[k] {
            // k is never 0 here since z[0] is -inf
            k -= 1;
            s = intersect(q, v[k]);
        }
        k += 1;
        v[k] = q;
        z[k] = s;
        z[k + 1] = f64::INFINITY;
    }

    k = 0;
    for (q, dq) in d.iter_mut().enumerate() {
        while z[k + 1] < q as f64 {
            k += 1;
        }
        let diff = q as f64 - v[k] as f64;
        *dq = diff * diff + f[v[k]];
    }
    d
}
