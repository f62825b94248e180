// Array utilities for column-major voxel grids (x varies fastest, as stored in NIfTI)

#[inline(always)]
pub fn index_to_subscript_col_maj3(index: usize, size: &[usize; 3]) -> [usize; 3] {
    let iz = index / (size[0] * size[1]);
    let rem = index % (size[0] * size[1]);
    let iy = rem / size[0];
    let ix = rem % size[0];
    [ix, iy, iz]
}

#[inline(always)]
pub fn subscript_to_index_col_maj3(subscript: &[usize; 3], size: &[usize; 3]) -> usize {
    let z_stride = size[0] * size[1];
    let y_stride = size[0];
    subscript[2] * z_stride + subscript[1] * y_stride + subscript[0]
}

/// voxel containing a point with each index clipped into the grid
#[inline(always)]
pub fn clipped_voxel_of(point: &[f32; 3], size: &[usize; 3]) -> [usize; 3] {
    let mut v = [0usize; 3];
    for d in 0..3 {
        let max = size[d].saturating_sub(1) as f32;
        v[d] = point[d].floor().clamp(0., max) as usize;
    }
    v
}

/// truncation toward zero of a point, as used for endpoint lookups
#[inline(always)]
pub fn truncated_voxel_of(point: &[f32; 3], size: &[usize; 3]) -> Option<[usize; 3]> {
    let mut v = [0usize; 3];
    for d in 0..3 {
        let t = point[d].trunc();
        if !(t >= 0.) || t as usize >= size[d] {
            return None;
        }
        v[d] = t as usize;
    }
    Some(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_subscript_inverse() {
        let size = [4, 3, 5];
        for i in 0..60 {
            let s = index_to_subscript_col_maj3(i, &size);
            assert_eq!(subscript_to_index_col_maj3(&s, &size), i);
        }
        assert_eq!(index_to_subscript_col_maj3(5, &size), [1, 1, 0]);
    }

    #[test]
    fn voxel_lookup() {
        let size = [2, 2, 2];
        assert_eq!(truncated_voxel_of(&[2.0, 0., 0.], &size), None);
        assert_eq!(truncated_voxel_of(&[f32::NAN, 0., 0.], &size), None);
        assert_eq!(clipped_voxel_of(&[-3., 7., 1.2], &size), [0, 1, 1]);
        assert_eq!(truncated_voxel_of(&[-0.5, 1.5, 0.], &size), Some([0, 1, 0]));
    }
}
