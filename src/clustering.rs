//! Streamline clustering with QuickBundles and its hierarchical variant QuickBundlesX.
//!
//! All distances are minimum average direct-flip (MDF) distances between streamlines that have
//! been resampled to the same number of points.

use crate::streamline_metrics::{dist, set_number_of_points};
use crate::tractogram::Streamline;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;

/// number of points streamlines are resampled to before clustering
pub const NB_POINTS: usize = 20;

/// thresholds used to summarize bundles by their centroids
pub const DEFAULT_THRESHOLDS: [f32; 4] = [32., 24., 12., 6.];

fn mean_direct(a: &[[f32; 3]], b: &[[f32; 3]]) -> f32 {
    a.iter().zip(b).map(|(p, q)| dist(p, q)).sum::<f32>() / a.len() as f32
}

fn mean_flipped(a: &[[f32; 3]], b: &[[f32; 3]]) -> f32 {
    a.iter().zip(b.iter().rev()).map(|(p, q)| dist(p, q)).sum::<f32>() / a.len() as f32
}

/// minimum average direct-flip distance between two streamlines with the same number of points
pub fn mdf(a: &[[f32; 3]], b: &[[f32; 3]]) -> f32 {
    assert_eq!(a.len(), b.len(), "mdf requires streamlines with the same number of points");
    if a.is_empty() {
        return 0.;
    }
    mean_direct(a, b).min(mean_flipped(a, b))
}

#[derive(Debug, Clone)]
pub struct Cluster {
    pub centroid: Streamline,
    /// indices of member streamlines
    pub indices: Vec<usize>,
}

impl Cluster {
    fn new(streamline: &[[f32; 3]], index: usize) -> Self {
        Self { centroid: streamline.to_vec(), indices: vec![index] }
    }

    /// adds a member and updates the centroid as the running mean of flip-aligned members
    fn assign(&mut self, streamline: &[[f32; 3]], index: usize) {
        let n = self.indices.len() as f32;
        let flip = mean_flipped(&self.centroid, streamline) < mean_direct(&self.centroid, streamline);
        let aligned: Box<dyn Iterator<Item = &[f32; 3]>> = if flip {
            Box::new(streamline.iter().rev())
        } else {
            Box::new(streamline.iter())
        };
        self.centroid.iter_mut().zip(aligned).for_each(|(c, p)| {
            for d in 0..3 {
                c[d] = (c[d] * n + p[d]) / (n + 1.);
            }
        });
        self.indices.push(index);
    }
}

/// index and distance of the closest centroid within `threshold`
fn nearest<'a>(centroids: impl Iterator<Item = (usize, &'a Streamline)>, s: &[[f32; 3]], threshold: f32) -> Option<usize> {
    centroids
        .map(|(i, c)| (i, mdf(c, s)))
        .filter(|(_, d)| *d < threshold)
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| i)
}

#[derive(Debug, Clone)]
pub struct QuickBundles {
    pub threshold: f32,
}

impl QuickBundles {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    /// clusters resampled streamlines, visiting them in the supplied order
    pub fn cluster(&self, streamlines: &[Streamline], ordering: &[usize]) -> Vec<Cluster> {
        let mut clusters: Vec<Cluster> = vec![];
        for &idx in ordering {
            let s = &streamlines[idx];
            match nearest(clusters.iter().map(|c| &c.centroid).enumerate(), s, self.threshold) {
                Some(c) => clusters[c].assign(s, idx),
                None => clusters.push(Cluster::new(s, idx)),
            }
        }
        clusters
    }
}

struct Node {
    cluster: Cluster,
    children: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct QuickBundlesX {
    /// decreasing thresholds, one per level of the hierarchy
    pub thresholds: Vec<f32>,
}

impl QuickBundlesX {
    pub fn new(thresholds: &[f32]) -> Self {
        Self { thresholds: thresholds.to_vec() }
    }

    /// hierarchical clustering of resampled streamlines. Each streamline descends the tree, joining
    /// the closest child within the threshold of that level or starting a new one. Returns the
    /// clusters of the deepest level.
    pub fn cluster(&self, streamlines: &[Streamline], ordering: &[usize]) -> Vec<Cluster> {
        let mut nodes: Vec<Node> = vec![];
        let mut roots: Vec<usize> = vec![];

        for &idx in ordering {
            let s = &streamlines[idx];
            let mut siblings = roots.clone();
            let mut parent: Option<usize> = None;
            for &threshold in &self.thresholds {
                let hit = nearest(siblings.iter().map(|&n| (n, &nodes[n].cluster.centroid)), s, threshold);
                let node = match hit {
                    Some(n) => {
                        nodes[n].cluster.assign(s, idx);
                        n
                    }
                    None => {
                        nodes.push(Node { cluster: Cluster::new(s, idx), children: vec![] });
                        let n = nodes.len() - 1;
                        match parent {
                            Some(p) => nodes[p].children.push(n),
                            None => roots.push(n),
                        }
                        n
                    }
                };
                siblings = nodes[node].children.clone();
                parent = Some(node);
            }
        }

        // collect the leaves in creation order
        let mut leaves = vec![];
        let mut level = roots;
        for _ in 1..self.thresholds.len() {
            level = level.iter().flat_map(|&n| nodes[n].children.iter().copied()).collect();
        }
        level.sort_unstable();
        for n in level {
            leaves.push(nodes[n].cluster.clone());
        }
        leaves
    }
}

/// clusters a bundle with QuickBundlesX and merges the resulting clusters with QuickBundles at
/// the finest threshold. Streamlines are visited in a random order drawn from `seed`, so the result
/// is reproducible.
pub fn qbx_and_merge(streamlines: &[Streamline], thresholds: &[f32], nb_points: usize, seed: u64) -> Vec<Cluster> {
    // streamlines without points have no centroid contribution
    let valid = (0..streamlines.len()).filter(|&i| !streamlines[i].is_empty()).collect::<Vec<_>>();
    if valid.is_empty() || thresholds.is_empty() {
        return vec![];
    }
    let resampled = valid.par_iter()
        .map(|&i| set_number_of_points(&streamlines[i], nb_points))
        .collect::<Vec<_>>();

    let mut rng = StdRng::seed_from_u64(seed);
    let mut ordering = (0..resampled.len()).collect::<Vec<_>>();
    ordering.shuffle(&mut rng);

    let leaves = QuickBundlesX::new(thresholds).cluster(&resampled, &ordering);
    let leaf_centroids = leaves.iter().map(|c| c.centroid.clone()).collect::<Vec<_>>();

    let mut merge_order = (0..leaf_centroids.len()).collect::<Vec<_>>();
    merge_order.shuffle(&mut rng);
    let last = thresholds[thresholds.len() - 1];
    let merged = QuickBundles::new(last).cluster(&leaf_centroids, &merge_order);

    merged.into_iter().map(|m| {
        let mut indices = m.indices.iter()
            .flat_map(|&leaf| leaves[leaf].indices.iter().map(|&i| valid[i]))
            .collect::<Vec<_>>();
        indices.sort_unstable();
        Cluster { centroid: m.centroid, indices }
    }).collect()
}

/// centroids of a bundle summarized with [qbx_and_merge]
pub fn bundle_centroids(streamlines: &[Streamline], thresholds: &[f32], nb_points: usize, seed: u64) -> Vec<Streamline> {
    qbx_and_merge(streamlines, thresholds, nb_points, seed).into_iter().map(|c| c.centroid).collect()
}
