//! Pair-wise similarity measures of bundles. All tractograms must be in the same space (aligned
//! to one reference).

use crate::cli::{assert_inputs_exist, assert_outputs_exist};
use crate::endpoints_metric::check_reference;
use crate::measure_cache::{BundleData, MeasureCache};
use crate::params::SimilarityParams;
use crate::reproducibility_measures::{
    compute_bundle_adjacency_streamlines, compute_bundle_adjacency_voxel, compute_dice_streamlines,
    compute_dice_voxel, masked_correlation,
};
use crate::tractogram::{bundle_reference_pairs, is_header_compatible, reference_of};
use crate::{Error, Result};
use clap::Parser;
use ndarray::{Array3, Zip};
use rayon::prelude::*;
use serde_json::{json, Map, Value};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Debug, Clone, Parser)]
#[command(about = "Compute pair-wise similarity measures of bundles. All tractograms must be in the \
same space (aligned to one reference).")]
pub struct BundleSimilarityArgs {
    /// path of the input bundles
    #[arg(required = true, num_args = 1..)]
    pub in_bundles: Vec<PathBuf>,
    /// path of the output json file
    pub out_json: PathBuf,
    /// streamline-wise Dice coefficient will be computed, tractograms must be identical
    #[arg(long)]
    pub streamline_dice: bool,
    /// will not compute the streamlines distance
    #[arg(long)]
    pub disable_streamline_distance: bool,
    /// compare inputs to this single file
    #[arg(long)]
    pub single_compare: Option<PathBuf>,
    /// number of worker threads to use [ALL]
    #[arg(long, allow_negative_numbers = true)]
    pub processes: Option<i64>,
    /// will not delete the cache folder at the end
    #[arg(long)]
    pub keep_tmp: bool,
    /// reference anatomy for tck files
    #[arg(long)]
    pub reference: Option<PathBuf>,
    /// toml file of measure parameters
    #[arg(long)]
    pub params: Option<PathBuf>,
    /// force overwriting of the output files
    #[arg(short = 'f')]
    pub overwrite: bool,
}

/// a bundle and the reference it is loaded with
pub type BundleRef = (PathBuf, Option<PathBuf>);

impl BundleSimilarityArgs {
    /// validates the invocation and returns the number of worker threads
    pub fn check(&self) -> std::result::Result<usize, String> {
        let bundles = self.in_bundles.iter().map(PathBuf::as_path).collect::<Vec<_>>();
        assert_inputs_exist(&bundles, &[self.reference.as_deref(), self.params.as_deref()])?;
        assert_outputs_exist(&[self.out_json.as_path()], self.overwrite)?;
        for bundle in bundles.iter().copied().chain(self.single_compare.as_deref()) {
            check_reference(bundle, self.reference.as_deref())?;
        }
        let n_cpu = std::thread::available_parallelism().map_or(1, |n| n.get());
        number_of_processes(self.processes, n_cpu)
    }

    /// pairs of bundles to compare, in output order
    pub fn pairs(&self) -> Vec<(BundleRef, BundleRef)> {
        let reference = self.reference.as_deref();
        match &self.single_compare {
            Some(single) => {
                let bundles = self.in_bundles.iter().filter(|b| *b != single).cloned().collect::<Vec<_>>();
                let single = (single.clone(), reference.map(Path::to_path_buf));
                bundle_reference_pairs(&bundles, reference).into_iter()
                    .map(|b| (b, single.clone()))
                    .collect()
            }
            None => {
                let refs = bundle_reference_pairs(&self.in_bundles, reference);
                let mut pairs = vec![];
                for i in 0..refs.len() {
                    for j in i + 1..refs.len() {
                        pairs.push((refs[i].clone(), refs[j].clone()));
                    }
                }
                pairs
            }
        }
    }
}

pub fn number_of_processes(requested: Option<i64>, n_cpu: usize) -> std::result::Result<usize, String> {
    let n = requested.unwrap_or(n_cpu as i64);
    if n <= 0 {
        return Err("Number of processes cannot be <= 0".to_string());
    }
    if n as usize > n_cpu {
        return Err(format!("Max number of processes is {}. Got {}", n_cpu, n));
    }
    Ok(n as usize)
}

/// voxels set in either map and in both maps
fn occupancy(map_1: &Array3<f32>, map_2: &Array3<f32>) -> (usize, usize) {
    let mut either = 0usize;
    let mut both = 0usize;
    Zip::from(map_1).and(map_2).for_each(|&a, &b| {
        either += (a != 0. || b != 0.) as usize;
        both += (a != 0. && b != 0.) as usize;
    });
    (either, both)
}

/// every measure between two bundles, in output order
pub fn pair_measures(
    data_1: &BundleData,
    data_2: &BundleData,
    streamline_dice: bool,
    disable_streamline_distance: bool,
) -> Vec<(&'static str, Value)> {
    let voxel_volume = data_1.reference.voxel_volume();

    // mm^3
    let (either, volume_overlap) = occupancy(&data_1.density, &data_2.density);
    let volume_overreach = either.abs_diff(volume_overlap);
    let (either_endpoints, volume_overlap_endpoints) = occupancy(&data_1.endpoints_density, &data_2.endpoints_density);
    let volume_overreach_endpoints = either_endpoints.abs_diff(volume_overlap_endpoints);

    // voxels
    let bundle_adjacency_voxel = compute_bundle_adjacency_voxel(&data_1.density, &data_2.density, true);

    // [0, 1]
    let (dice_vox, w_dice_vox) = compute_dice_voxel(&data_1.density, &data_2.density);
    let (dice_vox_endpoints, w_dice_vox_endpoints) = compute_dice_voxel(&data_1.endpoints_density, &data_2.endpoints_density);
    let density_correlation = masked_correlation(&data_1.density, &data_2.density);
    let density_correlation_endpoints = masked_correlation(&data_1.endpoints_density, &data_2.endpoints_density);

    let mut measures = vec![
        ("bundle_adjacency_voxels", json!(bundle_adjacency_voxel)),
        ("dice_voxels", json!(dice_vox)),
        ("w_dice_voxels", json!(w_dice_vox)),
        ("volume_overlap", json!(volume_overlap as f64 * voxel_volume)),
        ("volume_overreach", json!(volume_overreach as f64 * voxel_volume)),
        ("dice_voxels_endpoints", json!(dice_vox_endpoints)),
        ("w_dice_voxels_endpoints", json!(w_dice_vox_endpoints)),
        ("volume_overlap_endpoints", json!(volume_overlap_endpoints as f64 * voxel_volume)),
        ("volume_overreach_endpoints", json!(volume_overreach_endpoints as f64 * voxel_volume)),
        ("density_correlation", json!(density_correlation)),
        ("density_correlation_endpoints", json!(density_correlation_endpoints)),
    ];

    if !disable_streamline_distance {
        let adjacency = compute_bundle_adjacency_streamlines(&data_1.centroids, &data_2.centroids, true);
        measures.push(("bundle_adjacency_streamlines", json!(adjacency)));
    }

    // only meaningful when both bundles come from the same tractogram
    if streamline_dice {
        let (dice, intersection, union) = compute_dice_streamlines(&data_1.streamlines, &data_2.streamlines);
        measures.push(("dice_streamlines", json!(dice)));
        measures.push(("streamlines_count_overlap", json!(intersection.len())));
        measures.push(("streamlines_count_overreach", json!(union.len() - intersection.len())));
    }
    measures
}

/// measures of one pair, None when either bundle is missing or empty
pub fn compute_all_measures(
    cache: &MeasureCache,
    bundle_1: &BundleRef,
    bundle_2: &BundleRef,
    streamline_dice: bool,
    disable_streamline_distance: bool,
) -> Result<Option<Vec<(&'static str, Value)>>> {
    let (filename_1, reference_1) = bundle_1;
    let (filename_2, reference_2) = bundle_2;
    if !filename_1.is_file() || !filename_2.is_file() {
        return Ok(None);
    }
    let header_1 = reference_of(filename_1, reference_1.as_deref())?;
    let header_2 = reference_of(filename_2, reference_2.as_deref())?;
    if !is_header_compatible(&header_1, &header_2) {
        return Err(Error::IncompatibleHeaders(filename_1.clone(), filename_2.clone()));
    }

    let Some(data_1) = cache.load(filename_1, reference_1.as_deref())? else {
        return Ok(None);
    };
    let Some(data_2) = cache.load(filename_2, reference_2.as_deref())? else {
        return Ok(None);
    };
    Ok(Some(pair_measures(&data_1, &data_2, streamline_dice, disable_streamline_distance)))
}

/// gathers the measures of every pair into lists keyed by measure name. Skipped pairs do not
/// contribute.
pub fn collect_measures(all_measures: Vec<Option<Vec<(&'static str, Value)>>>) -> Map<String, Value> {
    let mut output = Map::new();
    for measures in all_measures.into_iter().flatten() {
        for (name, value) in measures {
            if let Value::Array(values) = output.entry(name).or_insert_with(|| Value::Array(vec![])) {
                values.push(value);
            }
        }
    }
    output
}

pub fn bundle_similarity(args: &BundleSimilarityArgs, n_threads: usize) -> Result<()> {
    let now = Instant::now();
    let params = match &args.params {
        Some(path) => SimilarityParams::from_file(path)?,
        None => SimilarityParams::default(),
    };
    let cache = MeasureCache::new(&params, args.disable_streamline_distance)?;
    let pool = rayon::ThreadPoolBuilder::new().num_threads(n_threads).build()?;
    log::info!("using {} worker threads, cache in {}", n_threads, cache.dir().display());

    if args.single_compare.is_none() {
        // the cache is filled once per bundle before the pairs compete for it
        let refs = bundle_reference_pairs(&args.in_bundles, args.reference.as_deref());
        pool.install(|| {
            refs.par_iter()
                .map(|(bundle, reference)| cache.warm(bundle, reference.as_deref()))
                .collect::<Result<Vec<_>>>()
        })?;
        log::info!("cache ready for {} bundles after {:.03} secs", refs.len(), now.elapsed().as_secs_f32());
    }

    let pairs = args.pairs();
    let all_measures = pool.install(|| {
        pairs.par_iter()
            .map(|(a, b)| compute_all_measures(&cache, a, b, args.streamline_dice, args.disable_streamline_distance))
            .collect::<Result<Vec<_>>>()
    })?;
    let skipped = all_measures.iter().filter(|m| m.is_none()).count();
    if skipped > 0 {
        log::warn!("{} of {} pairs were skipped because of missing or empty bundles", skipped, pairs.len());
    }

    let output = collect_measures(all_measures);
    let writer = BufWriter::new(File::create(&args.out_json)?);
    serde_json::to_writer(writer, &output)?;
    log::info!("wrote {} pairs of measures to {} in {:.03} secs", pairs.len() - skipped, args.out_json.display(), now.elapsed().as_secs_f32());

    if !args.keep_tmp {
        cache.remove()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tractogram::{save_tractogram, SpatialReference, Streamline, Tractogram};
    use nalgebra::{Matrix4, Vector3};
    use std::fs;

    fn reference(dims: [usize; 3]) -> SpatialReference {
        SpatialReference::from_affine(Matrix4::new_nonuniform_scaling(&Vector3::new(2., 2., 2.)), dims)
    }

    /// one streamline per z slice, along x
    fn bundle(y: f32, n: usize) -> Vec<Streamline> {
        (0..n).map(|i| (0..8).map(|j| [j as f32 + 0.5, y, i as f32 + 1.5]).collect()).collect()
    }

    fn write(dir: &Path, name: &str, reference: SpatialReference, streamlines: Vec<Streamline>) -> PathBuf {
        let path = dir.join(name);
        save_tractogram(&Tractogram::new(reference, streamlines), &path).unwrap();
        path
    }

    fn args(dir: &Path, bundles: Vec<PathBuf>) -> BundleSimilarityArgs {
        let params = dir.join("params.toml");
        SimilarityParams { cache_dir: dir.join("tmp_measures"), ..SimilarityParams::default() }
            .to_file(&params)
            .unwrap();
        BundleSimilarityArgs {
            in_bundles: bundles,
            out_json: dir.join("out.json"),
            streamline_dice: false,
            disable_streamline_distance: false,
            single_compare: None,
            processes: Some(1),
            keep_tmp: false,
            reference: None,
            params: Some(params),
            overwrite: false,
        }
    }

    fn read_json(path: &Path) -> Map<String, Value> {
        serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
    }

    #[test]
    fn process_count() {
        assert_eq!(number_of_processes(None, 8), Ok(8));
        assert_eq!(number_of_processes(Some(2), 8), Ok(2));
        assert!(number_of_processes(Some(0), 8).is_err());
        assert!(number_of_processes(Some(-1), 8).is_err());
        assert!(number_of_processes(Some(9), 8).is_err());
    }

    #[test]
    fn pairing() {
        let dir = tempfile::tempdir().unwrap();
        let names = ["a.trk", "b.trk", "c.trk"].map(|n| dir.path().join(n));
        let mut a = args(dir.path(), names.to_vec());
        let pairs = a.pairs();
        assert_eq!(pairs.len(), 3);
        assert_eq!((&pairs[0].0 .0, &pairs[0].1 .0), (&names[0], &names[1]));
        assert_eq!((&pairs[2].0 .0, &pairs[2].1 .0), (&names[1], &names[2]));

        a.single_compare = Some(names[1].clone());
        let pairs = a.pairs();
        assert_eq!(pairs.len(), 2);
        assert!(pairs.iter().all(|(_, s)| s.0 == names[1]));
        assert_eq!(pairs[1].0 .0, names[2]);
    }

    #[test]
    fn identical_and_disjoint_bundles() {
        let dir = tempfile::tempdir().unwrap();
        let r = reference([10, 10, 10]);
        let a = write(dir.path(), "a.trk", r.clone(), bundle(2.5, 5));
        let b = write(dir.path(), "b.trk", r.clone(), bundle(2.5, 5));
        let c = write(dir.path(), "c.trk", r, bundle(7.5, 5));
        let mut args = args(dir.path(), vec![a, b, c]);
        args.streamline_dice = true;
        let n = args.check().unwrap();
        bundle_similarity(&args, n).unwrap();

        let out = read_json(&args.out_json);
        let names = out.keys().cloned().collect::<Vec<_>>();
        assert_eq!(names, vec![
            "bundle_adjacency_voxels", "dice_voxels", "w_dice_voxels", "volume_overlap", "volume_overreach",
            "dice_voxels_endpoints", "w_dice_voxels_endpoints", "volume_overlap_endpoints",
            "volume_overreach_endpoints", "density_correlation", "density_correlation_endpoints",
            "bundle_adjacency_streamlines", "dice_streamlines", "streamlines_count_overlap",
            "streamlines_count_overreach",
        ]);
        let values = |name: &str| out[name].as_array().unwrap().clone();

        // pairs (a, b), (a, c), (b, c)
        assert_eq!(values("dice_voxels")[0], json!(1.0));
        assert_eq!(values("dice_voxels")[1], json!(0.0));
        assert_eq!(values("bundle_adjacency_voxels")[0], json!(0.0));
        assert_eq!(values("bundle_adjacency_voxels")[1], json!(5.0));
        assert_eq!(values("volume_overlap")[0], json!(40.0 * 8.0));
        assert_eq!(values("volume_overreach")[1], json!(80.0 * 8.0));
        assert_eq!(values("dice_streamlines")[0], json!(1.0));
        assert_eq!(values("streamlines_count_overlap")[0], json!(5));
        assert_eq!(values("streamlines_count_overreach")[1], json!(10));
        // constant maps have no correlation
        assert!(values("density_correlation")[0].is_null());
        assert!((values("density_correlation")[1].as_f64().unwrap() + 1.).abs() < 1e-12);

        // the cache is removed
        assert!(!dir.path().join("tmp_measures").exists());
        assert!(args.check().is_err());
    }

    #[test]
    fn skips_empty_and_keeps_cache() {
        let dir = tempfile::tempdir().unwrap();
        let r = reference([10, 10, 10]);
        let a = write(dir.path(), "a.trk", r.clone(), bundle(2.5, 3));
        let empty = write(dir.path(), "empty.trk", r.clone(), vec![]);
        let b = write(dir.path(), "b.trk", r, bundle(3.5, 3));
        let mut args = args(dir.path(), vec![a, empty, b.clone()]);
        args.disable_streamline_distance = true;
        args.keep_tmp = true;
        args.single_compare = Some(b);
        bundle_similarity(&args, 1).unwrap();

        let out = read_json(&args.out_json);
        assert!(!out.contains_key("bundle_adjacency_streamlines"));
        assert_eq!(out["dice_voxels"].as_array().unwrap().len(), 1);
        assert_eq!(out.len(), 11);
        assert!(dir.path().join("tmp_measures").is_dir());
    }

    #[test]
    fn incompatible_headers() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a.trk", reference([10, 10, 10]), bundle(2.5, 3));
        let b = write(dir.path(), "b.trk", reference([10, 10, 12]), bundle(2.5, 3));
        let args = args(dir.path(), vec![a, b]);
        assert!(matches!(bundle_similarity(&args, 1), Err(Error::IncompatibleHeaders(_, _))));
    }

    #[test]
    fn cli_parsing() {
        let args = BundleSimilarityArgs::parse_from([
            "bundle-similarity", "a.trk", "b.trk", "c.trk", "out.json", "--streamline-dice", "--processes", "-2",
        ]);
        assert_eq!(args.in_bundles.len(), 3);
        assert_eq!(args.out_json, PathBuf::from("out.json"));
        assert!(args.streamline_dice);
        assert_eq!(args.processes, Some(-2));
    }
}
