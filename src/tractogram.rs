//! Reading and writing of tractogram files.
//!
//! Streamlines are held in voxel space with the origin at the corner of voxel (0,0,0), so the
//! voxel containing a point is found by flooring each coordinate. TrackVis (`.trk`) files carry
//! their own spatial reference, MRtrix (`.tck`) files need a nifti reference.

use crate::data_import::{affine_from_header, dims_from_header};
use crate::{Error, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};
use nalgebra::{Matrix4, Vector4};
use nifti::NiftiHeader;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

pub type Streamline = Vec<[f32; 3]>;

const TRK_HEADER_SIZE: usize = 1000;
const TCK_MAGIC: &str = "mrtrix tracks";

/// grid and world mapping shared by volumes and tractograms
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialReference {
    /// voxel (center origin) to RAS+ millimeter affine
    pub affine: Matrix4<f64>,
    pub dims: [usize; 3],
    pub voxel_sizes: [f32; 3],
    pub voxel_order: String,
}

impl SpatialReference {
    pub fn from_affine(affine: Matrix4<f64>, dims: [usize; 3]) -> Self {
        let mut voxel_sizes = [0f32; 3];
        for (d, v) in voxel_sizes.iter_mut().enumerate() {
            *v = affine.fixed_view::<3, 1>(0, d).norm() as f32;
        }
        let voxel_order = axis_codes(&affine);
        Self { affine, dims, voxel_sizes, voxel_order }
    }

    pub fn from_nifti_header(header: &NiftiHeader) -> Self {
        Self::from_affine(affine_from_header(header), dims_from_header(header))
    }

    /// reads only the header of a nifti file
    pub fn from_nifti(path: impl AsRef<Path>) -> Result<Self> {
        let header = NiftiHeader::from_file(path.as_ref())?;
        Ok(Self::from_nifti_header(&header))
    }

    /// volume of a single voxel in mm^3
    pub fn voxel_volume(&self) -> f64 {
        self.voxel_sizes.iter().map(|&v| v as f64).product()
    }

    pub fn is_compatible(&self, other: &SpatialReference) -> bool {
        let tol = 1e-3;
        self.dims == other.dims
            && self.voxel_order == other.voxel_order
            && self.voxel_sizes.iter().zip(&other.voxel_sizes).all(|(a, b)| (a - b).abs() < tol as f32)
            && self.affine.iter().zip(other.affine.iter()).all(|(a, b)| (a - b).abs() < tol)
    }

    /// corner-origin voxel coordinate to world millimeters
    pub fn vox_to_rasmm(&self, p: &[f32; 3]) -> [f32; 3] {
        let v = self.affine * Vector4::new(p[0] as f64 - 0.5, p[1] as f64 - 0.5, p[2] as f64 - 0.5, 1.);
        [v[0] as f32, v[1] as f32, v[2] as f32]
    }
}

pub fn is_header_compatible(a: &SpatialReference, b: &SpatialReference) -> bool {
    a.is_compatible(b)
}

/// orientation codes (e.g. "RAS") of the voxel axes of an affine
fn axis_codes(affine: &Matrix4<f64>) -> String {
    const POS: [char; 3] = ['R', 'A', 'S'];
    const NEG: [char; 3] = ['L', 'P', 'I'];
    (0..3).map(|col| {
        let c = affine.fixed_view::<3, 1>(0, col);
        let (axis, value) = (0..3)
            .map(|r| (r, c[r]))
            .fold((0, 0f64), |best, cur| if cur.1.abs() > best.1.abs() { cur } else { best });
        if value >= 0. { POS[axis] } else { NEG[axis] }
    }).collect()
}

/// anatomical axis and direction of an orientation code
fn axis_code(c: char) -> Option<(usize, bool)> {
    match c.to_ascii_uppercase() {
        'R' => Some((0, true)),
        'L' => Some((0, false)),
        'A' => Some((1, true)),
        'P' => Some((1, false)),
        'S' => Some((2, true)),
        'I' => Some((2, false)),
        _ => None,
    }
}

/// for each voxel axis of the affine, the TrackVis axis it is read from and whether it is
/// mirrored. Unknown voxel orders map one to one.
#[derive(Debug, Clone, Copy, PartialEq)]
struct TrkAxes {
    source: [usize; 3],
    flip: [bool; 3],
}

impl TrkAxes {
    const IDENTITY: TrkAxes = TrkAxes { source: [0, 1, 2], flip: [false; 3] };

    fn new(voxel_order: &str, affine: &Matrix4<f64>) -> Self {
        let parse = |codes: &str| codes.chars().map(axis_code).collect::<Option<Vec<_>>>();
        let (Some(header), Some(image)) = (parse(voxel_order), parse(&axis_codes(affine))) else {
            return Self::IDENTITY;
        };
        if header.len() != 3 || image.len() != 3 {
            return Self::IDENTITY;
        }
        let mut axes = Self::IDENTITY;
        for (i, &(anatomical, positive)) in image.iter().enumerate() {
            let Some(j) = header.iter().position(|&(a, _)| a == anatomical) else {
                return Self::IDENTITY;
            };
            axes.source[i] = j;
            axes.flip[i] = header[j].1 != positive;
        }
        axes
    }

    /// TrackVis millimeters to corner-origin voxel coordinates
    fn to_voxel(&self, voxmm: &[f32], voxel_sizes: &[f32; 3], dims: &[usize; 3]) -> [f32; 3] {
        let mut p = [0f32; 3];
        for i in 0..3 {
            let j = self.source[i];
            let v = voxmm[j] / voxel_sizes[j];
            p[i] = if self.flip[i] { dims[j] as f32 - v } else { v };
        }
        p
    }

    fn to_voxmm(&self, p: &[f32; 3], voxel_sizes: &[f32; 3], dims: &[usize; 3]) -> [f32; 3] {
        let mut voxmm = [0f32; 3];
        for i in 0..3 {
            let j = self.source[i];
            let v = if self.flip[i] { dims[j] as f32 - p[i] } else { p[i] };
            voxmm[j] = v * voxel_sizes[j];
        }
        voxmm
    }
}

#[derive(Debug, Clone)]
pub struct Tractogram {
    pub reference: SpatialReference,
    pub streamlines: Vec<Streamline>,
}

impl Tractogram {
    pub fn new(reference: SpatialReference, streamlines: Vec<Streamline>) -> Self {
        Self { reference, streamlines }
    }

    pub fn len(&self) -> usize {
        self.streamlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streamlines.is_empty()
    }
}

fn malformed(path: &Path, reason: impl Into<String>) -> Error {
    Error::Tractogram { path: path.to_path_buf(), reason: reason.into() }
}

fn extension(path: &Path) -> String {
    path.extension().and_then(|e| e.to_str()).unwrap_or("").to_ascii_lowercase()
}

/// loads a tractogram into corner-origin voxel space. `.tck` files require a nifti reference,
/// `.trk` files use their own header. Streamlines without points are dropped.
pub fn load_tractogram(path: impl AsRef<Path>, reference: Option<&Path>) -> Result<Tractogram> {
    let path = path.as_ref();
    let mut tractogram = match extension(path).as_str() {
        "trk" => read_trk(path)?,
        "tck" => {
            let reference = reference.ok_or_else(|| malformed(path, "a reference image is required for .tck files"))?;
            read_tck(path, &SpatialReference::from_nifti(reference)?)?
        }
        other => return Err(malformed(path, format!("unsupported tractogram extension '.{}'", other))),
    };
    let n = tractogram.len();
    tractogram.streamlines.retain(|s| !s.is_empty());
    if tractogram.len() < n {
        log::warn!("dropped {} streamlines without points from {}", n - tractogram.len(), path.display());
    }
    Ok(tractogram)
}

pub fn save_tractogram(tractogram: &Tractogram, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let bytes = match extension(path).as_str() {
        "trk" => encode_trk(tractogram),
        "tck" => encode_tck(tractogram),
        other => return Err(malformed(path, format!("unsupported tractogram extension '.{}'", other))),
    };
    fs::write(path, bytes)?;
    Ok(())
}

/// spatial reference a bundle is loaded with: the nifti reference when given, otherwise the
/// header of a `.trk` file
pub fn reference_of(path: impl AsRef<Path>, reference: Option<&Path>) -> Result<SpatialReference> {
    let path = path.as_ref();
    if let Some(reference) = reference {
        return SpatialReference::from_nifti(reference);
    }
    match extension(path).as_str() {
        "trk" => {
            let mut header = vec![0u8; TRK_HEADER_SIZE];
            let mut f = fs::File::open(path)?;
            f.read_exact(&mut header).map_err(|_| malformed(path, "missing TRACK header"))?;
            Ok(with_trk_byte_order(path, &header)?.reference)
        }
        "tck" => Err(malformed(path, "a reference image is required for .tck files")),
        other => Err(malformed(path, format!("unsupported tractogram extension '.{}'", other))),
    }
}

struct TrkHeader {
    reference: SpatialReference,
    n_scalars: usize,
    n_properties: usize,
    n_count: i32,
    big_endian: bool,
}

fn with_trk_byte_order(path: &Path, bytes: &[u8]) -> Result<TrkHeader> {
    if bytes.len() < TRK_HEADER_SIZE || &bytes[0..5] != b"TRACK" {
        return Err(malformed(path, "missing TRACK header"));
    }
    if LittleEndian::read_i32(&bytes[996..1000]) == TRK_HEADER_SIZE as i32 {
        parse_trk_header::<LittleEndian>(path, bytes, false)
    } else if BigEndian::read_i32(&bytes[996..1000]) == TRK_HEADER_SIZE as i32 {
        parse_trk_header::<BigEndian>(path, bytes, true)
    } else {
        Err(malformed(path, "invalid header size"))
    }
}

pub fn read_trk(path: &Path) -> Result<Tractogram> {
    let bytes = fs::read(path)?;
    let header = with_trk_byte_order(path, &bytes)?;
    if header.big_endian {
        parse_trk_body::<BigEndian>(path, &bytes, header)
    } else {
        parse_trk_body::<LittleEndian>(path, &bytes, header)
    }
}

fn parse_trk_header<B: ByteOrder>(path: &Path, bytes: &[u8], big_endian: bool) -> Result<TrkHeader> {
    let mut dims = [0usize; 3];
    let mut voxel_sizes = [0f32; 3];
    for d in 0..3 {
        dims[d] = B::read_i16(&bytes[6 + 2 * d..]).max(0) as usize;
        voxel_sizes[d] = B::read_f32(&bytes[12 + 4 * d..]);
    }
    if voxel_sizes.iter().any(|&v| !(v > 0.)) {
        return Err(malformed(path, format!("invalid voxel sizes {:?}", voxel_sizes)));
    }
    let n_scalars = B::read_i16(&bytes[36..]).max(0) as usize;
    let n_properties = B::read_i16(&bytes[238..]).max(0) as usize;

    let mut vox_to_ras = [0f32; 16];
    B::read_f32_into(&bytes[440..504], &mut vox_to_ras);
    let affine = if vox_to_ras[15] == 0. {
        // version 1 files leave the affine empty
        Matrix4::new_nonuniform_scaling(&nalgebra::Vector3::new(voxel_sizes[0] as f64, voxel_sizes[1] as f64, voxel_sizes[2] as f64))
    } else {
        Matrix4::from_row_slice(&vox_to_ras.map(|v| v as f64))
    };
    let voxel_order = String::from_utf8_lossy(&bytes[948..951]).trim_matches(char::from(0)).to_ascii_uppercase();
    let n_count = B::read_i32(&bytes[988..]);

    let reference = SpatialReference {
        affine,
        dims,
        voxel_sizes,
        voxel_order: if voxel_order.is_empty() { axis_codes(&affine) } else { voxel_order },
    };
    Ok(TrkHeader { reference, n_scalars, n_properties, n_count, big_endian })
}

fn parse_trk_body<B: ByteOrder>(path: &Path, bytes: &[u8], header: TrkHeader) -> Result<Tractogram> {
    let TrkHeader { reference, n_scalars, n_properties, n_count, .. } = header;
    let axes = TrkAxes::new(&reference.voxel_order, &reference.affine);
    let (voxel_sizes, dims) = (reference.voxel_sizes, reference.dims);
    let point_stride = 3 + n_scalars;
    let mut streamlines = Vec::with_capacity(n_count.max(0) as usize);
    let mut offset = TRK_HEADER_SIZE;
    let mut point_buff = Vec::<f32>::new();
    while offset < bytes.len() && (n_count <= 0 || streamlines.len() < n_count as usize) {
        if offset + 4 > bytes.len() {
            return Err(malformed(path, "truncated streamline"));
        }
        let n_points = B::read_i32(&bytes[offset..]);
        if n_points < 0 {
            return Err(malformed(path, format!("negative point count {}", n_points)));
        }
        offset += 4;
        let n_values = n_points as usize * point_stride;
        let end = offset + 4 * (n_values + n_properties);
        if end > bytes.len() {
            return Err(malformed(path, "truncated streamline"));
        }
        point_buff.resize(n_values, 0.);
        B::read_f32_into(&bytes[offset..offset + 4 * n_values], &mut point_buff);
        let s = point_buff.chunks_exact(point_stride)
            .map(|p| axes.to_voxel(p, &voxel_sizes, &dims))
            .collect::<Streamline>();
        streamlines.push(s);
        offset = end;
    }
    if n_count > 0 && streamlines.len() != n_count as usize {
        return Err(malformed(path, format!("expected {} streamlines, found {}", n_count, streamlines.len())));
    }
    Ok(Tractogram::new(reference, streamlines))
}

fn encode_trk(tractogram: &Tractogram) -> Vec<u8> {
    let r = &tractogram.reference;
    let n_points: usize = tractogram.streamlines.iter().map(|s| s.len()).sum();
    let mut header = vec![0u8; TRK_HEADER_SIZE];
    header[0..6].copy_from_slice(b"TRACK\0");
    for d in 0..3 {
        LittleEndian::write_i16(&mut header[6 + 2 * d..], r.dims[d] as i16);
        LittleEndian::write_f32(&mut header[12 + 4 * d..], r.voxel_sizes[d]);
    }
    let vox_to_ras = (0..4).flat_map(|i| (0..4).map(move |j| (i, j))).map(|(i, j)| r.affine[(i, j)] as f32).collect::<Vec<_>>();
    LittleEndian::write_f32_into(&vox_to_ras, &mut header[440..504]);
    let order = r.voxel_order.as_bytes();
    header[948..948 + order.len().min(3)].copy_from_slice(&order[..order.len().min(3)]);
    LittleEndian::write_i32(&mut header[988..], tractogram.streamlines.len() as i32);
    LittleEndian::write_i32(&mut header[992..], 2);
    LittleEndian::write_i32(&mut header[996..], TRK_HEADER_SIZE as i32);

    let axes = TrkAxes::new(&r.voxel_order, &r.affine);
    let mut bytes = Vec::with_capacity(TRK_HEADER_SIZE + 4 * tractogram.len() + 12 * n_points);
    bytes.extend_from_slice(&header);
    for s in &tractogram.streamlines {
        // writes into a Vec<u8> cannot fail
        let _ = bytes.write_i32::<LittleEndian>(s.len() as i32);
        for p in s {
            for v in axes.to_voxmm(p, &r.voxel_sizes, &r.dims) {
                let _ = bytes.write_f32::<LittleEndian>(v);
            }
        }
    }
    bytes
}

pub fn read_tck(path: &Path, reference: &SpatialReference) -> Result<Tractogram> {
    let bytes = fs::read(path)?;
    let header_end = bytes.windows(4).position(|w| w == b"END\n")
        .ok_or_else(|| malformed(path, "missing END of header"))?;
    let header = String::from_utf8_lossy(&bytes[..header_end]);
    let mut lines = header.lines();
    if lines.next().map(|l| l.trim()) != Some(TCK_MAGIC) {
        return Err(malformed(path, "missing mrtrix tracks magic"));
    }

    let mut data_offset = None;
    let mut big_endian = false;
    for line in lines {
        let Some((key, value)) = line.split_once(':') else { continue };
        match key.trim() {
            "file" => {
                let offset = value.trim().trim_start_matches('.').trim();
                data_offset = Some(offset.parse::<usize>().map_err(|_| malformed(path, format!("invalid file offset '{}'", value.trim())))?);
            }
            "datatype" => match value.trim() {
                "Float32LE" => big_endian = false,
                "Float32BE" => big_endian = true,
                other => return Err(malformed(path, format!("unsupported datatype {}", other))),
            },
            _ => {}
        }
    }
    let data_offset = data_offset.ok_or_else(|| malformed(path, "missing file offset"))?;
    if data_offset > bytes.len() {
        return Err(malformed(path, "file offset past end of file"));
    }

    let data = &bytes[data_offset..];
    let mut values = vec![0f32; data.len() / 4];
    if big_endian {
        BigEndian::read_f32_into(&data[..values.len() * 4], &mut values);
    } else {
        LittleEndian::read_f32_into(&data[..values.len() * 4], &mut values);
    }

    let ras_to_vox = reference.affine.try_inverse()
        .ok_or_else(|| malformed(path, "reference affine is not invertible"))?;

    let mut streamlines = vec![];
    let mut current = Streamline::new();
    for p in values.chunks_exact(3) {
        if p.iter().any(|v| v.is_infinite()) {
            break;
        }
        if p.iter().any(|v| v.is_nan()) {
            streamlines.push(std::mem::take(&mut current));
            continue;
        }
        let v = ras_to_vox * Vector4::new(p[0] as f64, p[1] as f64, p[2] as f64, 1.);
        current.push([(v[0] + 0.5) as f32, (v[1] + 0.5) as f32, (v[2] + 0.5) as f32]);
    }
    if !current.is_empty() {
        streamlines.push(current);
    }
    Ok(Tractogram::new(reference.clone(), streamlines))
}

fn encode_tck(tractogram: &Tractogram) -> Vec<u8> {
    let base = format!("{}\ndatatype: Float32LE\ncount: {}\n", TCK_MAGIC, tractogram.len());
    // the offset field is part of the header it points past
    let mut offset = base.len() + "file: . \nEND\n".len();
    loop {
        let candidate = base.len() + format!("file: . {}\nEND\n", offset).len();
        if candidate == offset {
            break;
        }
        offset = candidate;
    }
    let mut bytes = Vec::new();
    let _ = write!(bytes, "{}file: . {}\nEND\n", base, offset);
    for s in &tractogram.streamlines {
        for p in s {
            for v in tractogram.reference.vox_to_rasmm(p) {
                let _ = bytes.write_f32::<LittleEndian>(v);
            }
        }
        for _ in 0..3 {
            let _ = bytes.write_f32::<LittleEndian>(f32::NAN);
        }
    }
    for _ in 0..3 {
        let _ = bytes.write_f32::<LittleEndian>(f32::INFINITY);
    }
    bytes
}

/// pairs each bundle with the reference used to load it
pub fn bundle_reference_pairs(bundles: &[PathBuf], reference: Option<&Path>) -> Vec<(PathBuf, Option<PathBuf>)> {
    bundles.iter().map(|b| (b.clone(), reference.map(Path::to_path_buf))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    fn test_reference() -> SpatialReference {
        let mut affine = Matrix4::new_nonuniform_scaling(&Vector3::new(2., 2., 2.));
        affine[(0, 3)] = -10.;
        affine[(1, 3)] = 4.;
        SpatialReference::from_affine(affine, [10, 12, 14])
    }

    fn test_tractogram() -> Tractogram {
        Tractogram::new(test_reference(), vec![
            vec![[0.5, 0.5, 0.5], [1.5, 2.25, 3.0], [4.0, 4.0, 4.0]],
            vec![[9.5, 11.5, 13.5], [0.25, 0.75, 1.0]],
        ])
    }

    fn assert_close(a: &[Streamline], b: &[Streamline]) {
        assert_eq!(a.len(), b.len());
        for (s1, s2) in a.iter().zip(b) {
            assert_eq!(s1.len(), s2.len());
            for (p1, p2) in s1.iter().zip(s2) {
                for d in 0..3 {
                    assert!((p1[d] - p2[d]).abs() < 1e-4, "{:?} != {:?}", p1, p2);
                }
            }
        }
    }

    #[test]
    fn reference_orientation() {
        let r = test_reference();
        assert_eq!(r.voxel_order, "RAS");
        assert_eq!(r.voxel_sizes, [2., 2., 2.]);
        assert_eq!(r.voxel_volume(), 8.);

        let mut flipped = r.affine;
        flipped[(0, 0)] = -2.;
        assert_eq!(SpatialReference::from_affine(flipped, r.dims).voxel_order, "LAS");
        assert!(!r.is_compatible(&SpatialReference::from_affine(flipped, r.dims)));
        assert!(r.is_compatible(&r.clone()));
    }

    #[test]
    fn trk_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.trk");
        let t = test_tractogram();
        save_tractogram(&t, &path).unwrap();
        let loaded = load_tractogram(&path, None).unwrap();
        assert_eq!(loaded.reference.dims, t.reference.dims);
        assert!(loaded.reference.is_compatible(&t.reference));
        assert_close(&loaded.streamlines, &t.streamlines);
    }

    #[test]
    fn tck_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.tck");
        let t = test_tractogram();
        save_tractogram(&t, &path).unwrap();
        let loaded = read_tck(&path, &t.reference).unwrap();
        assert_close(&loaded.streamlines, &t.streamlines);

        // voxel corner of (0,0,0) maps half a voxel below the affine origin
        assert_eq!(t.reference.vox_to_rasmm(&[0.5, 0.5, 0.5]), [-10., 4., 0.]);
    }

    #[test]
    fn tck_requires_reference() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.tck");
        save_tractogram(&test_tractogram(), &path).unwrap();
        assert!(load_tractogram(&path, None).is_err());
    }

    #[test]
    fn rejects_unknown_and_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.vtk");
        std::fs::write(&path, b"nothing").unwrap();
        assert!(load_tractogram(&path, None).is_err());

        let path = dir.path().join("bundle.trk");
        let mut bytes = encode_trk(&test_tractogram());
        bytes.truncate(bytes.len() - 6);
        std::fs::write(&path, bytes).unwrap();
        assert!(load_tractogram(&path, None).is_err());
    }

    #[test]
    fn reference_from_trk_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.trk");
        save_tractogram(&test_tractogram(), &path).unwrap();
        let r = reference_of(&path, None).unwrap();
        assert!(r.is_compatible(&test_reference()));
        assert!(reference_of(dir.path().join("bundle.tck"), None).is_err());
    }

    #[test]
    fn empty_trk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.trk");
        save_tractogram(&Tractogram::new(test_reference(), vec![]), &path).unwrap();
        assert!(load_tractogram(&path, None).unwrap().is_empty());
    }

    /// rewrites a little endian buffer in big endian, 2-byte fields in `short` and 4-byte words
    /// everywhere else in `words`
    fn swap_fields(bytes: &mut [u8], short: &[std::ops::Range<usize>], words: &[std::ops::Range<usize>]) {
        for r in short {
            for c in bytes[r.clone()].chunks_exact_mut(2) {
                c.reverse();
            }
        }
        for r in words {
            for c in bytes[r.clone()].chunks_exact_mut(4) {
                c.reverse();
            }
        }
    }

    #[test]
    fn big_endian_trk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.trk");
        let t = test_tractogram();
        let mut bytes = encode_trk(&t);
        let n = bytes.len();
        swap_fields(&mut bytes, &[6..12, 36..38, 238..240], &[12..24, 440..504, 988..1000, 1000..n]);
        std::fs::write(&path, &bytes).unwrap();

        let loaded = load_tractogram(&path, None).unwrap();
        assert_eq!(loaded.reference.dims, t.reference.dims);
        assert!(loaded.reference.is_compatible(&t.reference));
        assert_close(&loaded.streamlines, &t.streamlines);
    }

    #[test]
    fn big_endian_tck() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.tck");
        let t = test_tractogram();
        let mut bytes = encode_tck(&t);
        let start = bytes.windows(4).position(|w| w == b"END\n").unwrap() + 4;
        let header = String::from_utf8(bytes[..start].to_vec()).unwrap().replace("Float32LE", "Float32BE");
        bytes[..start].copy_from_slice(header.as_bytes());
        let n = bytes.len();
        swap_fields(&mut bytes, &[], &[start..n]);
        std::fs::write(&path, &bytes).unwrap();

        let loaded = read_tck(&path, &t.reference).unwrap();
        assert_close(&loaded.streamlines, &t.streamlines);
    }

    #[test]
    fn trk_voxel_order_mirrors_axes() {
        let dir = tempfile::tempdir().unwrap();
        let ras = dir.path().join("ras.trk");
        let lps = dir.path().join("lps.trk");
        let t = test_tractogram();
        let mut bytes = encode_trk(&t);
        std::fs::write(&ras, &bytes).unwrap();
        bytes[948..951].copy_from_slice(b"LPS");
        std::fs::write(&lps, &bytes).unwrap();

        let from_ras = load_tractogram(&ras, None).unwrap();
        let from_lps = load_tractogram(&lps, None).unwrap();
        assert_eq!(from_lps.reference.voxel_order, "LPS");
        assert_ne!(from_ras.streamlines, from_lps.streamlines);
        // x and y are mirrored within the 10 x 12 grid
        assert_close(&from_lps.streamlines[..1], &[vec![[9.5, 11.5, 0.5], [8.5, 9.75, 3.0], [6.0, 8.0, 4.0]]]);

        // saving keeps the header order and the voxel positions
        let again = dir.path().join("again.trk");
        save_tractogram(&from_lps, &again).unwrap();
        assert_eq!(&std::fs::read(&again).unwrap()[1000..], &bytes[1000..]);
        assert_close(&load_tractogram(&again, None).unwrap().streamlines, &from_lps.streamlines);
    }

    #[test]
    fn streamlines_without_points_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = test_tractogram();
        t.streamlines.insert(1, vec![]);

        let path = dir.path().join("bundle.tck");
        save_tractogram(&t, &path).unwrap();
        // consecutive delimiters read back as an empty streamline
        assert_eq!(read_tck(&path, &t.reference).unwrap().len(), 3);

        let path = dir.path().join("bundle.trk");
        save_tractogram(&t, &path).unwrap();
        let loaded = load_tractogram(&path, None).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.streamlines.iter().all(|s| !s.is_empty()));
    }
}
