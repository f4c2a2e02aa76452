//! Column standardization and a small seeded K-means.
//!
//! The irregularity scorer measures each precinct's distance to the
//! nearest centroid of the national voting-pattern clusters. Results must
//! be reproducible run to run, so the fit is driven by an explicit seed
//! and k-means++ initialization with a fixed restart count.

use ndarray::{Array1, Array2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Lloyd iterations per restart; assignment converges far earlier on
/// real precinct data.
const MAX_LLOYD_ITERS: usize = 300;

/// Per-column zero-mean unit-variance scaling.
pub struct Standardizer {
    mean: Array1<f64>,
    std: Array1<f64>,
}

impl Standardizer {
    pub fn fit(data: &Array2<f64>) -> Self {
        let mean = data
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(data.ncols()));
        let n = data.nrows().max(1) as f64;
        let mut std = Array1::<f64>::zeros(data.ncols());
        for j in 0..data.ncols() {
            let mu = mean[j];
            let var: f64 = data.column(j).iter().map(|v| (v - mu) * (v - mu)).sum::<f64>() / n;
            let s = var.sqrt();
            // Constant columns scale by one rather than blowing up.
            std[j] = if s > 0.0 { s } else { 1.0 };
        }
        Standardizer { mean, std }
    }

    pub fn transform(&self, data: &Array2<f64>) -> Array2<f64> {
        let mut out = data.clone();
        for mut row in out.rows_mut() {
            for j in 0..row.len() {
                row[j] = (row[j] - self.mean[j]) / self.std[j];
            }
        }
        out
    }

    pub fn transform_row(&self, row: &Array1<f64>) -> Array1<f64> {
        let mut out = row.clone();
        for j in 0..out.len() {
            out[j] = (out[j] - self.mean[j]) / self.std[j];
        }
        out
    }
}

/// Cluster centroids in standardized space.
pub struct CentroidModel {
    pub centers: Array2<f64>,
}

impl CentroidModel {
    /// Distance from a standardized row to its nearest centroid.
    pub fn nearest_distance(&self, row: &Array1<f64>) -> f64 {
        self.centers
            .rows()
            .into_iter()
            .map(|c| {
                c.iter()
                    .zip(row.iter())
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum::<f64>()
                    .sqrt()
            })
            .fold(f64::INFINITY, f64::min)
    }

    /// The degenerate model used when there are too few rows to cluster:
    /// a single centroid at the data mean.
    pub fn single_mean(data: &Array2<f64>) -> Self {
        let mean = data
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(data.ncols()));
        let mut centers = Array2::<f64>::zeros((1, data.ncols()));
        centers.row_mut(0).assign(&mean);
        CentroidModel { centers }
    }
}

/// K-means with k-means++ seeding, `n_init` restarts, best inertia wins.
pub fn fit_kmeans(data: &Array2<f64>, k: usize, seed: u64, n_init: usize) -> CentroidModel {
    let n = data.nrows();
    if k < 2 || n <= k {
        return CentroidModel::single_mean(data);
    }

    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let mut best: Option<(f64, Array2<f64>)> = None;

    for _ in 0..n_init.max(1) {
        let mut centers = plus_plus_init(data, k, &mut rng);
        let mut assignment = vec![usize::MAX; n];

        for _ in 0..MAX_LLOYD_ITERS {
            let mut changed = false;
            for (i, row) in data.rows().into_iter().enumerate() {
                let mut nearest = 0;
                let mut nearest_d = f64::INFINITY;
                for (c, center) in centers.rows().into_iter().enumerate() {
                    let d: f64 = center
                        .iter()
                        .zip(row.iter())
                        .map(|(a, b)| (a - b) * (a - b))
                        .sum();
                    if d < nearest_d {
                        nearest_d = d;
                        nearest = c;
                    }
                }
                if assignment[i] != nearest {
                    assignment[i] = nearest;
                    changed = true;
                }
            }
            if !changed {
                break;
            }

            let mut sums = Array2::<f64>::zeros((k, data.ncols()));
            let mut counts = vec![0usize; k];
            for (i, row) in data.rows().into_iter().enumerate() {
                let c = assignment[i];
                counts[c] += 1;
                for j in 0..row.len() {
                    sums[[c, j]] += row[j];
                }
            }
            for c in 0..k {
                if counts[c] > 0 {
                    for j in 0..data.ncols() {
                        centers[[c, j]] = sums[[c, j]] / counts[c] as f64;
                    }
                }
                // An emptied cluster keeps its previous center.
            }
        }

        let inertia: f64 = data
            .rows()
            .into_iter()
            .enumerate()
            .map(|(i, row)| {
                let c = centers.row(assignment[i]);
                c.iter()
                    .zip(row.iter())
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum::<f64>()
            })
            .sum();

        if best.as_ref().map_or(true, |(b, _)| inertia < *b) {
            best = Some((inertia, centers));
        }
    }

    CentroidModel {
        centers: best.expect("at least one restart").1,
    }
}

/// k-means++: first center uniform, the rest weighted by squared distance
/// to the nearest center chosen so far.
fn plus_plus_init(data: &Array2<f64>, k: usize, rng: &mut ChaCha20Rng) -> Array2<f64> {
    let n = data.nrows();
    let mut centers = Array2::<f64>::zeros((k, data.ncols()));
    let first = rng.gen_range(0..n);
    centers.row_mut(0).assign(&data.row(first));

    let mut dist2: Vec<f64> = data
        .rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .zip(centers.row(0).iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum()
        })
        .collect();

    for c in 1..k {
        let total: f64 = dist2.iter().sum();
        let picked = if total > 0.0 {
            let mut target = rng.gen::<f64>() * total;
            let mut picked = n - 1;
            for (i, &d) in dist2.iter().enumerate() {
                target -= d;
                if target <= 0.0 {
                    picked = i;
                    break;
                }
            }
            picked
        } else {
            rng.gen_range(0..n)
        };
        centers.row_mut(c).assign(&data.row(picked));

        for (i, row) in data.rows().into_iter().enumerate() {
            let d: f64 = row
                .iter()
                .zip(centers.row(c).iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum();
            if d < dist2[i] {
                dist2[i] = d;
            }
        }
    }
    centers
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn standardizer_zero_mean_unit_variance() {
        let data = array![[1.0, 10.0], [3.0, 10.0], [5.0, 10.0]];
        let sc = Standardizer::fit(&data);
        let t = sc.transform(&data);
        let col0: f64 = t.column(0).iter().sum();
        assert!(col0.abs() < 1e-12);
        // Constant column survives untouched rather than dividing by zero.
        assert!(t.column(1).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn kmeans_separates_two_blobs() {
        let mut rows = Vec::new();
        for i in 0..20 {
            let eps = (i % 5) as f64 * 0.01;
            rows.push([0.0 + eps, 0.0]);
            rows.push([10.0 + eps, 10.0]);
        }
        let data = Array2::from_shape_vec(
            (rows.len(), 2),
            rows.iter().flat_map(|r| r.to_vec()).collect(),
        )
        .unwrap();
        let model = fit_kmeans(&data, 2, 42, 10);
        assert_eq!(model.centers.nrows(), 2);
        let near_origin = model.nearest_distance(&array![0.0, 0.0]);
        let near_far = model.nearest_distance(&array![10.0, 10.0]);
        assert!(near_origin < 1.0);
        assert!(near_far < 1.0);
        let between = model.nearest_distance(&array![5.0, 5.0]);
        assert!(between > 3.0);
    }

    #[test]
    fn kmeans_is_deterministic_for_a_seed() {
        let data = Array2::from_shape_fn((50, 3), |(i, j)| ((i * 7 + j * 13) % 17) as f64);
        let a = fit_kmeans(&data, 3, 42, 10);
        let b = fit_kmeans(&data, 3, 42, 10);
        assert_eq!(a.centers, b.centers);
    }

    #[test]
    fn too_few_rows_collapse_to_single_mean() {
        let data = array![[1.0, 2.0], [3.0, 4.0]];
        let model = fit_kmeans(&data, 2, 42, 10);
        assert_eq!(model.centers.nrows(), 1);
        assert_eq!(model.centers[[0, 0]], 2.0);
        assert_eq!(model.centers[[0, 1]], 3.0);
    }
}
