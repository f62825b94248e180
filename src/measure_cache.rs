//! On-disk cache of the per-bundle data reused across pairwise comparisons.
//!
//! Every bundle owns three files named after the SHA-256 of its path: the tract density map, the
//! endpoints density map and the centroids of its clusters. Files are written under a temporary
//! name and renamed into place, so two workers racing on the same bundle only duplicate work.

use crate::clustering::bundle_centroids;
use crate::data_import::{header_from_reference, read_nifti_f32, write_nifti_f32, write_nifti_i16};
use crate::params::SimilarityParams;
use crate::streamline_metrics::{compute_tract_counts_map, get_endpoints_density_map};
use crate::tractogram::{load_tractogram, save_tractogram, SpatialReference, Streamline, Tractogram};
use crate::Result;
use ndarray::Array3;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// everything the similarity measures need from one bundle
#[derive(Debug, Clone)]
pub struct BundleData {
    pub reference: SpatialReference,
    pub density: Array3<f32>,
    pub endpoints_density: Array3<f32>,
    pub streamlines: Vec<Streamline>,
    pub centroids: Vec<Streamline>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub density: PathBuf,
    pub endpoints: PathBuf,
    pub centroids: PathBuf,
}

impl CacheEntry {
    pub fn is_complete(&self) -> bool {
        self.density.is_file() && self.endpoints.is_file() && self.centroids.is_file()
    }
}

/// hex encoded SHA-256 of a path string
pub fn path_hash(path: &Path) -> String {
    format!("{:x}", Sha256::digest(path.to_string_lossy().as_bytes()))
}

pub struct MeasureCache {
    dir: PathBuf,
    params: SimilarityParams,
    disable_centroids: bool,
}

impl MeasureCache {
    /// opens the cache directory of `params`, creating it when needed
    pub fn new(params: &SimilarityParams, disable_centroids: bool) -> Result<Self> {
        fs::create_dir_all(&params.cache_dir)?;
        Ok(Self { dir: params.cache_dir.clone(), params: params.clone(), disable_centroids })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry(&self, bundle: &Path) -> CacheEntry {
        let hash = path_hash(bundle);
        CacheEntry {
            density: self.dir.join(format!("{}_density.nii.gz", hash)),
            endpoints: self.dir.join(format!("{}_endpoints.nii.gz", hash)),
            centroids: self.dir.join(format!("{}_centroids.trk", hash)),
        }
    }

    /// computes and stores the entry of a bundle when it is missing. Missing or empty bundles are
    /// reported with a warning.
    pub fn warm(&self, bundle: &Path, reference: Option<&Path>) -> Result<()> {
        self.load_or_compute(bundle, reference, true).map(|_| ())
    }

    /// data of a bundle, from the cache when possible. None for a missing or empty bundle.
    pub fn load(&self, bundle: &Path, reference: Option<&Path>) -> Result<Option<BundleData>> {
        self.load_or_compute(bundle, reference, false)
    }

    fn load_or_compute(&self, bundle: &Path, reference: Option<&Path>, init_only: bool) -> Result<Option<BundleData>> {
        if !bundle.is_file() {
            if init_only {
                log::warn!("{} does not exist", bundle.display());
            }
            return Ok(None);
        }

        let tractogram = load_tractogram(bundle, reference)?;
        if tractogram.is_empty() {
            if init_only {
                log::warn!("{} is empty", bundle.display());
            }
            return Ok(None);
        }

        let entry = self.entry(bundle);
        if entry.is_complete() {
            if init_only {
                return Ok(None);
            }
            let (_, density) = read_nifti_f32(&entry.density)?;
            let (_, endpoints_density) = read_nifti_f32(&entry.endpoints)?;
            let centroids = load_tractogram(&entry.centroids, None)?.streamlines;
            let Tractogram { reference, streamlines } = tractogram;
            return Ok(Some(BundleData { reference, density, endpoints_density, streamlines, centroids }));
        }

        let data = self.compute(tractogram);
        self.store(&entry, &data)?;
        Ok(Some(data))
    }

    fn compute(&self, tractogram: Tractogram) -> BundleData {
        let now = Instant::now();
        let Tractogram { reference, streamlines } = tractogram;
        let dims = reference.dims;
        let density = compute_tract_counts_map(&streamlines, &dims);
        let endpoints_density = get_endpoints_density_map(&streamlines, &dims, self.params.endpoints_point_to_select);
        let centroids = if self.disable_centroids {
            vec![]
        } else {
            bundle_centroids(&streamlines, &self.params.qbx_thresholds, self.params.nb_points, self.params.seed)
        };
        log::debug!(
            "computed density, endpoints and {} centroids of {} streamlines in {:.03} secs",
            centroids.len(), streamlines.len(), now.elapsed().as_secs_f32()
        );
        BundleData { reference, density, endpoints_density, streamlines, centroids }
    }

    fn store(&self, entry: &CacheEntry, data: &BundleData) -> Result<()> {
        let header = header_from_reference(&data.reference);
        let endpoints = data.endpoints_density.mapv(|v| v.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16);
        let centroids = Tractogram::new(data.reference.clone(), data.centroids.clone());

        let tmp_density = temporary_name(&entry.density, ".nii.gz");
        write_nifti_f32(&tmp_density, &header, &data.density)?;
        fs::rename(&tmp_density, &entry.density)?;

        let tmp_endpoints = temporary_name(&entry.endpoints, ".nii.gz");
        write_nifti_i16(&tmp_endpoints, &header, &endpoints)?;
        fs::rename(&tmp_endpoints, &entry.endpoints)?;

        let tmp_centroids = temporary_name(&entry.centroids, ".trk");
        save_tractogram(&centroids, &tmp_centroids)?;
        fs::rename(&tmp_centroids, &entry.centroids)?;
        Ok(())
    }

    /// deletes the cache directory and its content
    pub fn remove(self) -> Result<()> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }
}

/// name unique to the writing process and thread, keeping the extension the writers rely on
fn temporary_name(path: &Path, extension: &str) -> PathBuf {
    let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    let stem = name.strip_suffix(extension).unwrap_or(&name);
    let worker = rayon::current_thread_index().map_or(String::from("main"), |i| i.to_string());
    path.with_file_name(format!(".{}.{}-{}.tmp{}", stem, std::process::id(), worker, extension))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Matrix4, Vector3};

    fn write_bundle(dir: &Path, name: &str, streamlines: Vec<Streamline>) -> PathBuf {
        let reference = SpatialReference::from_affine(Matrix4::new_nonuniform_scaling(&Vector3::new(2., 2., 2.)), [8, 8, 8]);
        let path = dir.join(name);
        save_tractogram(&Tractogram::new(reference, streamlines), &path).unwrap();
        path
    }

    fn params(dir: &Path) -> SimilarityParams {
        SimilarityParams { cache_dir: dir.join("tmp_measures"), ..SimilarityParams::default() }
    }

    fn bundle() -> Vec<Streamline> {
        (0..4).map(|i| (0..6).map(|j| [j as f32 + 0.5, 2.5 + i as f32 * 0.1, 3.5]).collect()).collect()
    }

    #[test]
    fn hash_is_stable_hex() {
        let h = path_hash(Path::new("bundles/AF_L.trk"));
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(h, path_hash(Path::new("bundles/AF_L.trk")));
        assert_ne!(h, path_hash(Path::new("bundles/AF_R.trk")));
        assert_eq!(path_hash(Path::new("abc")), "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
    }

    #[test]
    fn computes_then_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bundle(dir.path(), "af.trk", bundle());
        let cache = MeasureCache::new(&params(dir.path()), false).unwrap();

        let computed = cache.load(&path, None).unwrap().unwrap();
        assert!(cache.entry(&path).is_complete());
        assert_eq!(computed.density[[2, 2, 3]], 4.);
        assert_eq!(computed.endpoints_density.sum(), 24.);
        assert_eq!(computed.centroids.len(), 1);

        let cached = cache.load(&path, None).unwrap().unwrap();
        assert_eq!(cached.density, computed.density);
        assert_eq!(cached.endpoints_density, computed.endpoints_density);
        assert_eq!(cached.centroids.len(), 1);
        assert_eq!(cached.streamlines.len(), 4);

        // no temporary files are left behind
        let names = fs::read_dir(cache.dir()).unwrap().count();
        assert_eq!(names, 3);

        let cache_dir = cache.dir().to_path_buf();
        cache.remove().unwrap();
        assert!(!cache_dir.exists());
    }

    #[test]
    fn missing_and_empty_bundles() {
        let dir = tempfile::tempdir().unwrap();
        let empty = write_bundle(dir.path(), "empty.trk", vec![]);
        let cache = MeasureCache::new(&params(dir.path()), true).unwrap();
        assert!(cache.load(&dir.path().join("missing.trk"), None).unwrap().is_none());
        assert!(cache.load(&empty, None).unwrap().is_none());
        cache.warm(&empty, None).unwrap();
        assert!(!cache.entry(&empty).is_complete());
    }

    #[test]
    fn warm_without_centroids() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bundle(dir.path(), "cst.trk", bundle());
        let cache = MeasureCache::new(&params(dir.path()), true).unwrap();
        cache.warm(&path, None).unwrap();
        assert!(cache.entry(&path).is_complete());
        assert!(cache.load(&path, None).unwrap().unwrap().centroids.is_empty());
    }
}
