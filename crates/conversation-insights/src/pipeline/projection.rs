//! 2D layout of the embedding set for display.
//!
//! A compact UMAP-style embedding: a fuzzy k-nearest-neighbour graph over
//! cosine distance is laid out by stochastic gradient descent with negative
//! sampling. Output is centred and scaled into [-1, 1]. Results are not
//! reproducible across runs unless the caller seeds the RNG.
use std::collections::HashMap;

use rand::Rng;
use rayon::prelude::*;

use crate::pipeline::vector_math::cosine_similarity;

const NEGATIVE_SAMPLES: usize = 5;
const GRADIENT_CLIP: f32 = 4.0;
const SIGMA_SEARCH_STEPS: usize = 64;
const SIGMA_TOLERANCE: f32 = 1e-5;
const INIT_RANGE: f32 = 10.0;

#[derive(Debug, Clone, Copy)]
pub struct ProjectionParams {
    pub n_neighbors: usize,
    pub min_dist: f32,
    pub epochs: usize,
}

/// Project `vectors` to 2D; one point per input, in input order.
pub fn project<R: Rng>(vectors: &[Vec<f32>], params: ProjectionParams, rng: &mut R) -> Vec<[f32; 2]> {
    let n = vectors.len();
    match n {
        0 => return Vec::new(),
        1 => return vec![[0.0, 0.0]],
        _ => {}
    }

    let k = params.n_neighbors.clamp(1, n - 1);
    let neighbors = nearest_neighbors(vectors, k);
    let edges = fuzzy_graph(&neighbors, k);
    let (a, b) = fit_curve(params.min_dist);

    let mut layout: Vec<[f32; 2]> = (0..n)
        .map(|_| [rng.gen_range(-INIT_RANGE..INIT_RANGE), rng.gen_range(-INIT_RANGE..INIT_RANGE)])
        .collect();
    optimize_layout(&mut layout, &edges, a, b, params.epochs.max(1), rng);
    normalize_layout(&mut layout);
    layout
}

/// For each point, its `k` nearest other points as `(index, cosine distance)`,
/// closest first.
fn nearest_neighbors(vectors: &[Vec<f32>], k: usize) -> Vec<Vec<(usize, f32)>> {
    (0..vectors.len())
        .into_par_iter()
        .map(|i| {
            let mut row: Vec<(usize, f32)> = vectors
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(j, other)| (j, (1.0 - cosine_similarity(&vectors[i], other)).max(0.0)))
                .collect();
            row.sort_by(|x, y| x.1.total_cmp(&y.1).then(x.0.cmp(&y.0)));
            row.truncate(k);
            row
        })
        .collect()
}

/// Symmetrised membership strengths keyed by `(min(i, j), max(i, j))`.
fn fuzzy_graph(neighbors: &[Vec<(usize, f32)>], k: usize) -> Vec<(usize, usize, f32)> {
    let target = (k as f32).log2().max(SIGMA_TOLERANCE);
    let mut directed: HashMap<(usize, usize), f32> = HashMap::new();

    for (i, row) in neighbors.iter().enumerate() {
        let rho = row.iter().map(|(_, d)| *d).find(|d| *d > 0.0).unwrap_or(0.0);
        let sigma = smooth_knn_sigma(row, rho, target);
        for &(j, d) in row {
            let weight = (-(d - rho).max(0.0) / sigma).exp();
            directed.insert((i, j), weight);
        }
    }

    let mut combined: HashMap<(usize, usize), f32> = HashMap::new();
    for (&(i, j), &w_ij) in &directed {
        let key = (i.min(j), i.max(j));
        if combined.contains_key(&key) {
            continue;
        }
        let w_ji = directed.get(&(j, i)).copied().unwrap_or(0.0);
        combined.insert(key, w_ij + w_ji - w_ij * w_ji);
    }

    let mut edges: Vec<(usize, usize, f32)> = combined
        .into_iter()
        .filter(|(_, w)| *w > 0.0)
        .map(|((i, j), w)| (i, j, w))
        .collect();
    edges.sort_by(|x, y| (x.0, x.1).cmp(&(y.0, y.1)));
    edges
}

/// Binary search for the bandwidth at which the neighbour weights sum to `target`.
fn smooth_knn_sigma(row: &[(usize, f32)], rho: f32, target: f32) -> f32 {
    let mean_distance = row.iter().map(|(_, d)| *d).sum::<f32>() / row.len().max(1) as f32;
    let floor = (1e-3 * mean_distance).max(1e-6);

    let (mut lo, mut hi, mut mid) = (0.0f32, f32::INFINITY, 1.0f32);
    for _ in 0..SIGMA_SEARCH_STEPS {
        let total: f32 = row.iter().map(|(_, d)| (-(d - rho).max(0.0) / mid).exp()).sum();
        if (total - target).abs() < SIGMA_TOLERANCE {
            break;
        }
        if total > target {
            hi = mid;
            mid = (lo + hi) / 2.0;
        } else {
            lo = mid;
            mid = if hi.is_finite() { (lo + hi) / 2.0 } else { mid * 2.0 };
        }
    }
    mid.max(floor)
}

/// Fit `1 / (1 + a * d^(2b))` to the target low-dimensional membership curve.
fn fit_curve(min_dist: f32) -> (f32, f32) {
    const SPREAD: f32 = 1.0;
    let samples: Vec<(f32, f32)> = (0..300)
        .map(|i| {
            let x = i as f32 * 3.0 * SPREAD / 299.0;
            let y = if x < min_dist { 1.0 } else { (-(x - min_dist) / SPREAD).exp() };
            (x, y)
        })
        .collect();

    let mut best = (1.577, 0.895);
    let mut best_err = f32::INFINITY;
    for ai in 1..=60 {
        let a = ai as f32 * 0.1;
        for bi in 1..=40 {
            let b = 0.3 + bi as f32 * 0.04;
            let err: f32 = samples
                .iter()
                .map(|(x, y)| {
                    let fitted = 1.0 / (1.0 + a * x.powf(2.0 * b));
                    (fitted - y) * (fitted - y)
                })
                .sum();
            if err < best_err {
                best_err = err;
                best = (a, b);
            }
        }
    }
    best
}

fn optimize_layout<R: Rng>(
    layout: &mut [[f32; 2]],
    edges: &[(usize, usize, f32)],
    a: f32,
    b: f32,
    epochs: usize,
    rng: &mut R,
) {
    let n = layout.len();
    let max_weight = edges.iter().map(|e| e.2).fold(0.0f32, f32::max);
    if max_weight <= 0.0 {
        return;
    }

    for epoch in 0..epochs {
        let learning_rate = 1.0 - epoch as f32 / epochs as f32;
        for &(i, j, weight) in edges {
            // Edges are sampled in proportion to their membership strength.
            if rng.gen::<f32>() > weight / max_weight {
                continue;
            }

            let dist2 = squared_distance(layout[i], layout[j]);
            if dist2 > 0.0 {
                let coeff = (-2.0 * a * b * dist2.powf(b - 1.0)) / (a * dist2.powf(b) + 1.0);
                for d in 0..2 {
                    let grad = clip(coeff * (layout[i][d] - layout[j][d])) * learning_rate;
                    layout[i][d] += grad;
                    layout[j][d] -= grad;
                }
            }

            for _ in 0..NEGATIVE_SAMPLES {
                let other = rng.gen_range(0..n);
                if other == i {
                    continue;
                }
                let dist2 = squared_distance(layout[i], layout[other]);
                if dist2 <= 0.0 {
                    continue;
                }
                let coeff = (2.0 * b) / ((0.001 + dist2) * (a * dist2.powf(b) + 1.0));
                for d in 0..2 {
                    layout[i][d] += clip(coeff * (layout[i][d] - layout[other][d])) * learning_rate;
                }
            }
        }
    }
}

fn normalize_layout(layout: &mut [[f32; 2]]) {
    for point in layout.iter_mut() {
        for v in point.iter_mut() {
            if !v.is_finite() {
                *v = 0.0;
            }
        }
    }
    let n = layout.len() as f32;
    let center = [
        layout.iter().map(|p| p[0]).sum::<f32>() / n,
        layout.iter().map(|p| p[1]).sum::<f32>() / n,
    ];
    let mut extent = 0.0f32;
    for point in layout.iter_mut() {
        point[0] -= center[0];
        point[1] -= center[1];
        extent = extent.max(point[0].abs()).max(point[1].abs());
    }
    if extent > 0.0 {
        for point in layout.iter_mut() {
            point[0] /= extent;
            point[1] /= extent;
        }
    }
}

fn squared_distance(p: [f32; 2], q: [f32; 2]) -> f32 {
    (p[0] - q[0]).powi(2) + (p[1] - q[1]).powi(2)
}

fn clip(v: f32) -> f32 {
    v.clamp(-GRADIENT_CLIP, GRADIENT_CLIP)
}
