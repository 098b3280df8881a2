//! Cosine k-means over the full-dimensional embeddings.
use rand::Rng;
use tracing::debug;

use crate::pipeline::vector_math::{cosine_similarity, mean_vector, normalize_in_place};

/// Result of one clustering pass. Cluster indices are dense `0..cluster_count()`.
#[derive(Debug, Clone)]
pub struct Clustering {
    /// Cluster index per input vector.
    pub assignments: Vec<u32>,
    /// Unit-length centroid per cluster.
    pub centroids: Vec<Vec<f32>>,
    /// Cosine similarity of each input vector to its own centroid.
    pub similarities: Vec<f32>,
    pub sizes: Vec<usize>,
    /// Average member-to-centroid similarity per cluster.
    pub cohesion: Vec<f32>,
}

impl Clustering {
    pub fn cluster_count(&self) -> usize {
        self.centroids.len()
    }

    /// Input indices belonging to `cluster`, in input order.
    pub fn members(&self, cluster: u32) -> Vec<usize> {
        self.assignments
            .iter()
            .enumerate()
            .filter(|(_, c)| **c == cluster)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn is_outlier(&self, index: usize, outlier_similarity: f32) -> bool {
        self.similarities[index] < outlier_similarity
    }
}

/// Partition `vectors` into at most `k` clusters; `k` shrinks to the input
/// size, and clusters left empty after relocation are dropped.
pub fn kmeans<R: Rng>(vectors: &[Vec<f32>], k: usize, max_iterations: usize, rng: &mut R) -> Clustering {
    let n = vectors.len();
    let dim = vectors.first().map(|v| v.len()).unwrap_or(0);
    let k = k.min(n);
    if n == 0 || k == 0 || dim == 0 {
        return Clustering {
            assignments: vec![0; n],
            centroids: if n > 0 { vec![vec![0.0; dim]] } else { Vec::new() },
            similarities: vec![0.0; n],
            sizes: if n > 0 { vec![n] } else { Vec::new() },
            cohesion: if n > 0 { vec![0.0] } else { Vec::new() },
        };
    }

    let mut centroids = kmeans_plusplus_init(vectors, k, rng);
    let mut assignments = vec![usize::MAX; n];

    for iteration in 0..max_iterations.max(1) {
        let mut changed = false;
        for (i, vector) in vectors.iter().enumerate() {
            let best = nearest_centroid(vector, &centroids);
            if assignments[i] != best {
                assignments[i] = best;
                changed = true;
            }
        }
        if !changed {
            debug!("k-means converged after {} iterations", iteration);
            break;
        }
        centroids = recompute_centroids(vectors, &assignments, centroids.len(), dim, rng);
    }

    compact(vectors, &assignments, centroids.len(), dim)
}

fn nearest_centroid(vector: &[f32], centroids: &[Vec<f32>]) -> usize {
    let mut best_cluster = 0;
    let mut best_sim = f32::MIN;
    for (c, centroid) in centroids.iter().enumerate() {
        let sim = cosine_similarity(vector, centroid);
        if sim > best_sim {
            best_sim = sim;
            best_cluster = c;
        }
    }
    best_cluster
}

/// Seed centroids with probability proportional to squared cosine distance.
/// Returns fewer than `k` seeds when the remaining points coincide with them.
fn kmeans_plusplus_init<R: Rng>(vectors: &[Vec<f32>], k: usize, rng: &mut R) -> Vec<Vec<f32>> {
    let n = vectors.len();
    let mut centroids = vec![vectors[rng.gen_range(0..n)].clone()];

    while centroids.len() < k {
        let distances: Vec<f32> = vectors
            .iter()
            .map(|v| {
                let nearest = centroids
                    .iter()
                    .map(|c| (1.0 - cosine_similarity(v, c)).max(0.0))
                    .fold(f32::MAX, f32::min);
                nearest * nearest
            })
            .collect();

        let total: f32 = distances.iter().sum();
        if total <= 0.0 {
            break;
        }

        let threshold = rng.gen::<f32>() * total;
        let mut cumsum = 0.0;
        let mut chosen = None;
        for (i, d) in distances.iter().enumerate() {
            cumsum += d;
            if *d > 0.0 && cumsum >= threshold {
                chosen = Some(i);
                break;
            }
        }
        // Rounding can leave the threshold just above the final sum.
        let chosen = chosen.or_else(|| distances.iter().rposition(|d| *d > 0.0));
        match chosen {
            Some(i) => centroids.push(vectors[i].clone()),
            None => break,
        }
    }
    centroids
}

fn recompute_centroids<R: Rng>(
    vectors: &[Vec<f32>],
    assignments: &[usize],
    k: usize,
    dim: usize,
    rng: &mut R,
) -> Vec<Vec<f32>> {
    (0..k)
        .map(|c| {
            let members: Vec<&[f32]> = vectors
                .iter()
                .zip(assignments)
                .filter(|(_, a)| **a == c)
                .map(|(v, _)| v.as_slice())
                .collect();
            if members.is_empty() {
                // Reseed so the next assignment pass can still use the slot.
                return vectors[rng.gen_range(0..vectors.len())].clone();
            }
            let mut centroid = mean_vector(members, dim);
            normalize_in_place(&mut centroid);
            centroid
        })
        .collect()
}

/// Drop empty clusters, renumber densely and compute the per-cluster stats.
fn compact(vectors: &[Vec<f32>], assignments: &[usize], k: usize, dim: usize) -> Clustering {
    let mut remap = vec![None; k];
    let mut next = 0u32;
    for c in 0..k {
        if assignments.contains(&c) {
            remap[c] = Some(next);
            next += 1;
        }
    }
    let dense: Vec<u32> = assignments.iter().map(|a| remap[*a].unwrap_or(0)).collect();
    let cluster_count = next as usize;

    let centroids: Vec<Vec<f32>> = (0..cluster_count as u32)
        .map(|c| {
            let members = vectors.iter().zip(&dense).filter(|(_, a)| **a == c).map(|(v, _)| v.as_slice());
            let mut centroid = mean_vector(members, dim);
            normalize_in_place(&mut centroid);
            centroid
        })
        .collect();

    let similarities: Vec<f32> = vectors
        .iter()
        .zip(&dense)
        .map(|(v, c)| cosine_similarity(v, &centroids[*c as usize]))
        .collect();

    let mut sizes = vec![0usize; cluster_count];
    let mut totals = vec![0.0f32; cluster_count];
    for (c, sim) in dense.iter().zip(&similarities) {
        sizes[*c as usize] += 1;
        totals[*c as usize] += sim;
    }
    let cohesion = totals
        .iter()
        .zip(&sizes)
        .map(|(total, size)| if *size > 0 { total / *size as f32 } else { 0.0 })
        .collect();

    Clustering {
        assignments: dense,
        centroids,
        similarities,
        sizes,
        cohesion,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn two_blobs() -> Vec<Vec<f32>> {
        vec![
            vec![1.0, 0.05],
            vec![0.98, 0.1],
            vec![1.0, 0.0],
            vec![0.05, 1.0],
            vec![0.1, 0.97],
        ]
    }

    #[test]
    fn empty_input_has_no_clusters() {
        let mut rng = StdRng::seed_from_u64(1);
        let clustering = kmeans(&[], 8, 50, &mut rng);
        assert_eq!(clustering.cluster_count(), 0);
        assert!(clustering.assignments.is_empty());
    }

    #[test]
    fn k_shrinks_to_the_number_of_points() {
        let mut rng = StdRng::seed_from_u64(2);
        let vectors = vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![-1.0, 0.0]];
        let clustering = kmeans(&vectors, 8, 50, &mut rng);
        assert_eq!(clustering.cluster_count(), 3);
        assert_eq!(clustering.sizes, vec![1, 1, 1]);
    }

    #[test]
    fn identical_points_collapse_into_one_cluster() {
        let mut rng = StdRng::seed_from_u64(3);
        let vectors = vec![vec![0.3, 0.4]; 5];
        let clustering = kmeans(&vectors, 4, 50, &mut rng);
        assert_eq!(clustering.cluster_count(), 1);
        assert!(clustering.assignments.iter().all(|c| *c == 0));
        assert!((clustering.cohesion[0] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn separates_two_directions() {
        for seed in 0..10 {
            let mut rng = StdRng::seed_from_u64(seed);
            let clustering = kmeans(&two_blobs(), 2, 50, &mut rng);
            assert_eq!(clustering.cluster_count(), 2);
            let a = clustering.assignments[0];
            assert!(clustering.assignments[..3].iter().all(|c| *c == a));
            assert!(clustering.assignments[3..].iter().all(|c| *c != a));
            assert_eq!(clustering.sizes.iter().sum::<usize>(), 5);
            assert!(clustering.cohesion.iter().all(|c| *c > 0.95));
        }
    }

    #[test]
    fn indices_are_dense_and_members_consistent() {
        let mut rng = StdRng::seed_from_u64(9);
        let clustering = kmeans(&two_blobs(), 4, 50, &mut rng);
        let count = clustering.cluster_count() as u32;
        assert!(clustering.assignments.iter().all(|c| *c < count));
        for c in 0..count {
            assert_eq!(clustering.members(c).len(), clustering.sizes[c as usize]);
            assert!(clustering.sizes[c as usize] > 0);
        }
    }

    #[test]
    fn outliers_fall_below_the_similarity_floor() {
        let vectors = vec![vec![1.0, 0.0], vec![1.0, 0.0], vec![0.0, 1.0]];
        let clustering = compact(&vectors, &[0, 0, 0], 1, 2);
        assert!(!clustering.is_outlier(0, 0.8));
        assert!(clustering.is_outlier(2, 0.8));
    }
}
