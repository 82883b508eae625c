// pipeline/cluster.rs
// Stage 2: Semantic Clustering
// Groups embedded comments into themes; groups below the minimum size become noise

use std::collections::{BTreeMap, HashMap};

use hdbscan::{DistanceMetric as HdbscanMetric, Hdbscan, HdbscanHyperParams};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::embedder::{cosine_similarity, l2_normalize};
use crate::error::PipelineError;
use crate::model::{Cluster, EmbeddedComment};
use crate::pipeline::keywords;

/// HDBSCAN / agglomerative label for points that belong to no group
const NOISE: i32 = -1;

/// Clustering algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ClusterAlgorithm {
    /// Density-based; finds its own number of clusters and marks outliers
    Hdbscan,
    /// Average-linkage, cut at `distance_threshold`
    Agglomerative,
}

/// Distance used to compare comment vectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    Cosine,
    Euclidean,
    Manhattan,
}

/// Configuration for clustering
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub algorithm: ClusterAlgorithm,
    pub metric: DistanceMetric,

    /// Smallest cluster that is emitted. Picked from the dataset size when unset.
    pub min_cluster_size: Option<usize>,

    /// HDBSCAN `min_cluster_size` used to form candidate groups
    pub density_min_cluster_size: Option<usize>,

    /// HDBSCAN `min_samples`
    pub min_samples: Option<usize>,

    /// Agglomerative merge threshold, in units of the chosen metric
    pub distance_threshold: f32,

    /// Keywords kept per cluster
    pub top_keywords: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            algorithm: ClusterAlgorithm::Hdbscan,
            metric: DistanceMetric::Cosine,
            min_cluster_size: None,
            density_min_cluster_size: None,
            min_samples: None,
            distance_threshold: 0.6,
            top_keywords: 8,
        }
    }
}

/// Parameters actually used for one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterParams {
    pub min_cluster_size: usize,
    pub density_min_cluster_size: usize,
    pub min_samples: usize,
}

impl ClusterConfig {
    /// Fill unset sizes from the dataset size
    pub fn resolve(&self, n: usize) -> ClusterParams {
        let (auto_density, auto_keep) = auto_params(n);
        let density = self.density_min_cluster_size.unwrap_or(auto_density).max(2);
        let min_cluster_size = self.min_cluster_size.unwrap_or(auto_keep);
        let min_samples = self.min_samples.unwrap_or((density / 2).max(2)).max(1);
        ClusterParams {
            min_cluster_size,
            density_min_cluster_size: density,
            min_samples,
        }
    }
}

/// Pick (density cluster size, minimum emitted size) for `n` comments.
///
/// Small datasets get small thresholds so that a handful of similar comments
/// can still form a theme; large ones scale with the data. The emitted minimum
/// never exceeds the density size and is never below two.
pub fn auto_params(n: usize) -> (usize, usize) {
    let scaled = |ratio: f64| (ratio * n as f64).round() as usize;

    let (density, keep) = if n < 10 {
        (2, 1)
    } else if n < 30 {
        (scaled(0.2).max(2), scaled(0.15).max(1))
    } else if n < 200 {
        (scaled(0.1).max(3), scaled(0.07).max(2))
    } else {
        (scaled(0.07).max(5), scaled(0.05).max(3))
    };

    let density = density.min((n / 2).max(2));
    let keep = keep.min(density).max(2);
    (density, keep)
}

/// Result of clustering operation
#[derive(Debug, Clone)]
pub struct ClusteringResult {
    /// Retained clusters, largest first
    pub clusters: Vec<Cluster>,
    pub noise_comments: usize,
    pub discarded_clusters: usize,
    pub discarded_comments: usize,
    pub params: ClusterParams,
}

/// Cluster embedded comments.
///
/// Returns [`PipelineError::InsufficientData`] when there are fewer comments
/// than the minimum cluster size.
pub fn cluster_comments(
    comments: &[EmbeddedComment],
    config: &ClusterConfig,
) -> Result<ClusteringResult, PipelineError> {
    let n = comments.len();
    let params = config.resolve(n);

    if n < params.min_cluster_size {
        return Err(PipelineError::InsufficientData {
            available: n,
            required: params.min_cluster_size,
        });
    }

    tracing::info!(
        comments = n,
        algorithm = ?config.algorithm,
        metric = ?config.metric,
        min_cluster_size = params.min_cluster_size,
        density_min_cluster_size = params.density_min_cluster_size,
        "clustering"
    );

    let labels = if all_identical(comments) {
        tracing::debug!("all vectors identical, emitting a single group");
        vec![0; n]
    } else {
        match config.algorithm {
            ClusterAlgorithm::Hdbscan => run_hdbscan(comments, config.metric, &params)?,
            ClusterAlgorithm::Agglomerative => {
                run_agglomerative(comments, config.metric, config.distance_threshold)
            }
        }
    };

    let result = build_clusters(comments, &labels, params, config.top_keywords);

    tracing::info!(
        clusters = result.clusters.len(),
        noise = result.noise_comments,
        discarded_clusters = result.discarded_clusters,
        discarded_comments = result.discarded_comments,
        "clustering finished"
    );

    Ok(result)
}

fn all_identical(comments: &[EmbeddedComment]) -> bool {
    let Some(first) = comments.first() else {
        return false;
    };
    comments.iter().skip(1).all(|c| {
        c.vector
            .iter()
            .zip(first.vector.iter())
            .all(|(a, b)| (a - b).abs() <= 1e-6)
    })
}

/// Run HDBSCAN clustering on embeddings
fn run_hdbscan(
    comments: &[EmbeddedComment],
    metric: DistanceMetric,
    params: &ClusterParams,
) -> Result<Vec<i32>, PipelineError> {
    let n = comments.len();
    if n < params.density_min_cluster_size {
        return Ok(vec![NOISE; n]);
    }

    // On unit vectors Euclidean distance is monotone in cosine distance
    let (data, dist_metric): (Vec<Vec<f32>>, HdbscanMetric) = match metric {
        DistanceMetric::Cosine => (
            comments
                .iter()
                .map(|c| {
                    let mut v = c.vector.clone();
                    l2_normalize(&mut v);
                    v
                })
                .collect(),
            HdbscanMetric::Euclidean,
        ),
        DistanceMetric::Euclidean => (
            comments.iter().map(|c| c.vector.clone()).collect(),
            HdbscanMetric::Euclidean,
        ),
        DistanceMetric::Manhattan => (
            comments.iter().map(|c| c.vector.clone()).collect(),
            HdbscanMetric::Manhattan,
        ),
    };

    let hyper_params = HdbscanHyperParams::builder()
        .min_cluster_size(params.density_min_cluster_size)
        .min_samples(params.min_samples.min(n))
        .dist_metric(dist_metric)
        .build();

    let clusterer = Hdbscan::new(&data, hyper_params);
    clusterer
        .cluster()
        .map_err(|e| PipelineError::Clustering(format!("{:?}", e)))
}

/// Average-linkage agglomerative clustering via the nearest-neighbor chain.
///
/// Nearest-neighbor ties resolve to the lowest index. Merges at or above
/// `threshold` are not applied; groups of one are noise.
fn run_agglomerative(comments: &[EmbeddedComment], metric: DistanceMetric, threshold: f32) -> Vec<i32> {
    let n = comments.len();
    let mut dist: Vec<Vec<f64>> = (0..n)
        .into_par_iter()
        .map(|i| {
            (0..n)
                .map(|j| distance(&comments[i].vector, &comments[j].vector, metric))
                .collect()
        })
        .collect();

    let merges = nn_chain_average(&mut dist);

    let mut groups = UnionFind::new(n);
    for (a, b, d) in merges {
        if d < threshold as f64 {
            groups.union(a, b);
        }
    }

    let mut sizes: HashMap<usize, usize> = HashMap::new();
    for i in 0..n {
        *sizes.entry(groups.find(i)).or_insert(0) += 1;
    }

    (0..n)
        .map(|i| {
            let root = groups.find(i);
            if sizes[&root] < 2 { NOISE } else { root as i32 }
        })
        .collect()
}

fn distance(a: &[f32], b: &[f32], metric: DistanceMetric) -> f64 {
    match metric {
        DistanceMetric::Cosine => (1.0 - cosine_similarity(a, b) as f64).max(0.0),
        DistanceMetric::Euclidean => a
            .iter()
            .zip(b)
            .map(|(x, y)| ((x - y) as f64).powi(2))
            .sum::<f64>()
            .sqrt(),
        DistanceMetric::Manhattan => a.iter().zip(b).map(|(x, y)| ((x - y) as f64).abs()).sum(),
    }
}

/// Builds the full average-linkage dendrogram. Returns merges as
/// (slot a, slot b, linkage distance); a slot index is always a member of the
/// group it stands for. Consumes the distance matrix as scratch space.
fn nn_chain_average(dist: &mut [Vec<f64>]) -> Vec<(usize, usize, f64)> {
    let n = dist.len();
    let mut active = vec![true; n];
    let mut size = vec![1usize; n];
    let mut chain: Vec<usize> = Vec::new();
    let mut merges = Vec::with_capacity(n.saturating_sub(1));
    let mut remaining = n;

    while remaining > 1 {
        if chain.is_empty() {
            if let Some(first) = (0..n).find(|&i| active[i]) {
                chain.push(first);
            }
        }

        let (a, b) = loop {
            let a = chain[chain.len() - 1];
            let prev = if chain.len() >= 2 {
                Some(chain[chain.len() - 2])
            } else {
                None
            };

            // Prefer the previous chain element on ties so the chain terminates
            let mut best = prev;
            let mut best_d = prev.map(|p| dist[a][p]).unwrap_or(f64::INFINITY);
            for j in 0..n {
                if j != a && active[j] && dist[a][j] < best_d {
                    best = Some(j);
                    best_d = dist[a][j];
                }
            }

            let Some(b) = best else {
                break (a, a);
            };
            if Some(b) == prev {
                break (a, b);
            }
            chain.push(b);
        };

        if a == b {
            break;
        }

        chain.pop();
        chain.pop();

        let (keep, gone) = if a < b { (a, b) } else { (b, a) };
        let d = dist[a][b];
        merges.push((keep, gone, d));

        let (size_keep, size_gone) = (size[keep] as f64, size[gone] as f64);
        for k in 0..n {
            if active[k] && k != keep && k != gone {
                let updated = (size_keep * dist[keep][k] + size_gone * dist[gone][k])
                    / (size_keep + size_gone);
                dist[keep][k] = updated;
                dist[k][keep] = updated;
            }
        }
        size[keep] += size[gone];
        active[gone] = false;
        remaining -= 1;
    }

    merges
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cur = x;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    /// The smaller root wins so roots stay at the earliest member
    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}

/// Group labels into clusters, drop undersized groups and order the rest.
fn build_clusters(
    comments: &[EmbeddedComment],
    labels: &[i32],
    params: ClusterParams,
    top_keywords: usize,
) -> ClusteringResult {
    let mut groups: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
    let mut noise_comments = 0;
    for (idx, &label) in labels.iter().enumerate() {
        if label < 0 {
            noise_comments += 1;
        } else {
            groups.entry(label).or_default().push(idx);
        }
    }

    // Ids follow the position of each group's earliest member
    let mut candidates: Vec<Vec<usize>> = groups.into_values().collect();
    candidates.sort_by_key(|members| members[0]);

    let mut clusters = Vec::new();
    let mut discarded_clusters = 0;
    let mut discarded_comments = 0;

    for members in candidates {
        if members.len() < params.min_cluster_size {
            tracing::debug!(size = members.len(), "discarding undersized group");
            discarded_clusters += 1;
            discarded_comments += members.len();
            continue;
        }
        let cluster_id = clusters.len();
        clusters.push(make_cluster(cluster_id, &members, comments, top_keywords));
    }

    clusters.sort_by(|a, b| b.size.cmp(&a.size).then(a.cluster_id.cmp(&b.cluster_id)));

    ClusteringResult {
        clusters,
        noise_comments,
        discarded_clusters,
        discarded_comments,
        params,
    }
}

fn make_cluster(
    cluster_id: usize,
    members: &[usize],
    comments: &[EmbeddedComment],
    top_keywords: usize,
) -> Cluster {
    let member_comments: Vec<&EmbeddedComment> = members.iter().map(|&i| &comments[i]).collect();
    let texts: Vec<&str> = member_comments
        .iter()
        .map(|c| c.comment.text.as_str())
        .collect();

    Cluster {
        cluster_id,
        member_comment_ids: member_comments.iter().map(|c| c.comment.id.clone()).collect(),
        centroid: compute_centroid(&member_comments),
        size: members.len(),
        keywords: keywords::top_keywords(&texts, top_keywords),
        top_brands: top_counts(member_comments.iter().map(|c| c.comment.brand.as_str()), 5),
        top_questions: top_counts(member_comments.iter().map(|c| c.comment.question.as_str()), 5),
    }
}

/// Compute centroid of embeddings
pub fn compute_centroid(members: &[&EmbeddedComment]) -> Vec<f32> {
    let Some(first) = members.first() else {
        return vec![];
    };

    let dim = first.vector.len();
    let mut centroid = vec![0.0; dim];

    for emb in members {
        for (i, &val) in emb.vector.iter().enumerate() {
            centroid[i] += val;
        }
    }

    let count = members.len() as f32;
    for val in &mut centroid {
        *val /= count;
    }

    centroid
}

/// Frequency count of non-empty values, most common first, ties alphabetical
fn top_counts<'a>(values: impl Iterator<Item = &'a str>, limit: usize) -> Vec<(String, usize)> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for value in values.map(str::trim).filter(|v| !v.is_empty()) {
        *counts.entry(value).or_insert(0) += 1;
    }
    let mut sorted: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(value, count)| (value.to_string(), count))
        .collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    sorted.truncate(limit);
    sorted
}
