//! The vote-transfer *estimation* phase.
//!
//! We solve for a row-stochastic matrix M minimizing ‖XM − Y‖_F, where X
//! and Y are the matched precincts-by-parties count matrices of two
//! consecutive elections. Row i of M reads as "how list i's voters
//! redistributed". The primary method is projected-gradient descent on the
//! row simplexes with a fixed iteration ceiling; NNLS-per-target and a
//! closed-form least squares are kept as alternates.

use color_eyre::eyre::Result;
use ndarray::{s, Array1, Array2, Axis as NdAxis};
use tracing::{info, warn};

use crate::abstention::{AbstentionColumn, ABSTAIN_CODE, ABSTAIN_NAME};
use crate::ballots::{match_precincts, BallotTable, ElectionId, PrecinctId};
use crate::config::{ElectionSpec, Method, TransferOptions};
use crate::utils::CoreError;

/// Relative-improvement threshold under which the iteration is declared
/// converged. Checked every `CHECK_EVERY` iterations.
const CONVERGENCE_RTOL: f64 = 1e-10;
const CHECK_EVERY: usize = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolverStatus {
    Optimal,
    /// The iteration ceiling was hit; the best iterate found is returned.
    IterationLimit,
}

/// A solved transfer matrix plus its fit diagnostics.
pub struct Solution {
    pub matrix: Array2<f64>,
    pub r_squared: f64,
    pub status: SolverStatus,
}

/// One axis of a transfer matrix: codes, display names and seat counts in
/// declared order.
#[derive(Clone, Debug, Default)]
pub struct MatrixAxis {
    pub codes: Vec<String>,
    pub names: Vec<String>,
    pub seats: Vec<Option<u32>>,
}

impl MatrixAxis {
    fn push(&mut self, code: String, name: String, seats: Option<u32>) {
        self.codes.push(code);
        self.names.push(name);
        self.seats.push(seats);
    }
}

/// The full outcome of one transition analysis, pre-export. Flow
/// suppression happens at the export stage only.
pub struct TransferOutcome {
    pub from: ElectionId,
    pub to: ElectionId,
    pub sources: MatrixAxis,
    pub targets: MatrixAxis,
    pub matrix: Array2<f64>,
    /// Estimated vote flows: `M[i,j] · national source totals[i]`.
    pub movements: Array2<f64>,
    pub source_totals: Array1<f64>,
    pub target_totals: Array1<f64>,
    pub r_squared: f64,
    pub matched_precincts: usize,
    pub status: SolverStatus,
}

/// Solve for the transfer matrix with the requested method.
///
/// X and Y must have the same row count (paired precincts). No column or
/// row preconditioning is applied, and the solver itself never clips.
pub fn solve(
    x: &Array2<f64>,
    y: &Array2<f64>,
    method: Method,
    max_iterations: usize,
) -> Result<Solution, CoreError> {
    if x.nrows() == 0 || y.nrows() == 0 {
        return Err(CoreError::InputEmpty(
            "transfer solver given zero matched precincts".to_string(),
        ));
    }

    let (matrix, status) = match method {
        Method::Convex => solve_convex(x, y, max_iterations),
        Method::Nnls => (solve_nnls(x, y, max_iterations), SolverStatus::Optimal),
        Method::ClosedForm => (solve_closed_form(x, y), SolverStatus::Optimal),
    };

    if status == SolverStatus::IterationLimit {
        warn!("solver hit the iteration ceiling ({max_iterations}); returning best iterate");
    }

    let r_squared = r_squared(x, y, &matrix);
    Ok(Solution {
        matrix,
        r_squared,
        status,
    })
}

/// Projected-gradient descent on the row simplexes.
///
/// The gradient of ½‖XM − Y‖²_F is GM − H with G = XᵀX, H = XᵀY; the step
/// is 1/L with L = ‖G‖₁ ≥ ‖G‖₂, and each step ends with a Euclidean
/// projection of every row onto the probability simplex, which keeps the
/// iterate feasible (rows sum to one, entries in [0, 1]) at all times.
fn solve_convex(x: &Array2<f64>, y: &Array2<f64>, max_iterations: usize) -> (Array2<f64>, SolverStatus) {
    let p = x.ncols();
    let q = y.ncols();
    let g = x.t().dot(x);
    let h = x.t().dot(y);
    let yy: f64 = y.iter().map(|v| v * v).sum();

    let l = (0..p)
        .map(|j| g.column(j).iter().map(|v| v.abs()).sum::<f64>())
        .fold(0.0_f64, f64::max);
    let step = if l > 0.0 { 1.0 / l } else { 1.0 };

    let mut m = Array2::<f64>::from_elem((p, q), 1.0 / q as f64);
    // ½‖XM−Y‖² expressed through the p×q Gram forms; cheap to re-evaluate.
    let objective = |m: &Array2<f64>| -> f64 {
        let gm = g.dot(m);
        0.5 * m.iter().zip(gm.iter()).map(|(a, b)| a * b).sum::<f64>()
            - m.iter().zip(h.iter()).map(|(a, b)| a * b).sum::<f64>()
            + 0.5 * yy
    };
    let mut prev_obj = objective(&m);

    for it in 1..=max_iterations {
        let grad = g.dot(&m) - &h;
        m.scaled_add(-step, &grad);
        for mut row in m.rows_mut() {
            project_onto_simplex(row.as_slice_mut().expect("row not contiguous"));
        }

        if it % CHECK_EVERY == 0 {
            let obj = objective(&m);
            if (prev_obj - obj).abs() <= CONVERGENCE_RTOL * prev_obj.abs().max(1.0) {
                return (m, SolverStatus::Optimal);
            }
            prev_obj = obj;
        }
    }
    (m, SolverStatus::IterationLimit)
}

/// Per-target non-negative least squares, then exact row renormalization.
/// Rows that end up all-zero are left all-zero.
fn solve_nnls(x: &Array2<f64>, y: &Array2<f64>, max_iterations: usize) -> Array2<f64> {
    let p = x.ncols();
    let q = y.ncols();
    let g = x.t().dot(x);
    let h = x.t().dot(y);

    let l = (0..p)
        .map(|j| g.column(j).iter().map(|v| v.abs()).sum::<f64>())
        .fold(0.0_f64, f64::max);
    let step = if l > 0.0 { 1.0 / l } else { 1.0 };

    let mut m = Array2::<f64>::zeros((p, q));
    for j in 0..q {
        let hj = h.column(j);
        let mut col = Array1::<f64>::zeros(p);
        let mut prev = f64::INFINITY;
        for it in 1..=max_iterations {
            let grad = g.dot(&col) - &hj;
            col.scaled_add(-step, &grad);
            col.mapv_inplace(|v| v.max(0.0));
            if it % CHECK_EVERY == 0 {
                let r = g.dot(&col) - &hj;
                let norm: f64 = r.iter().map(|v| v * v).sum();
                if (prev - norm).abs() <= CONVERGENCE_RTOL * prev.abs().max(1.0) {
                    break;
                }
                prev = norm;
            }
        }
        m.column_mut(j).assign(&col);
    }

    for mut row in m.rows_mut() {
        let sum: f64 = row.iter().sum();
        if sum > 0.0 {
            row.mapv_inplace(|v| v / sum);
        }
    }
    m
}

/// Closed-form least squares `M = XᵀY · (YᵀY)⁻¹`.
/// May produce negative entries; retained for comparison only.
fn solve_closed_form(x: &Array2<f64>, y: &Array2<f64>) -> Array2<f64> {
    let yty = y.t().dot(y);
    let inv = invert_spd(&yty);
    x.t().dot(y).dot(&inv)
}

/// Gauss-Jordan inverse with partial pivoting; retries with a growing
/// ridge on the diagonal when the matrix is singular.
fn invert_spd(a: &Array2<f64>) -> Array2<f64> {
    let n = a.nrows();
    let trace_scale = (0..n).map(|i| a[[i, i]].abs()).sum::<f64>() / n.max(1) as f64;
    let mut ridge = 0.0;
    loop {
        if let Some(inv) = gauss_jordan(&{
            let mut b = a.clone();
            for i in 0..n {
                b[[i, i]] += ridge;
            }
            b
        }) {
            return inv;
        }
        ridge = if ridge == 0.0 {
            (trace_scale * 1e-8).max(1e-12)
        } else {
            ridge * 1000.0
        };
    }
}

fn gauss_jordan(a: &Array2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    let mut aug = Array2::<f64>::zeros((n, 2 * n));
    aug.slice_mut(s![.., ..n]).assign(a);
    for i in 0..n {
        aug[[i, n + i]] = 1.0;
    }
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| {
                aug[[i, col]]
                    .abs()
                    .partial_cmp(&aug[[j, col]].abs())
                    .expect("NaN pivot")
            })
            .expect("empty pivot range");
        if aug[[pivot, col]].abs() < 1e-12 {
            return None;
        }
        if pivot != col {
            for k in 0..2 * n {
                aug.swap([pivot, k], [col, k]);
            }
        }
        let d = aug[[col, col]];
        for k in 0..2 * n {
            aug[[col, k]] /= d;
        }
        for row in 0..n {
            if row != col {
                let f = aug[[row, col]];
                if f != 0.0 {
                    for k in 0..2 * n {
                        aug[[row, k]] -= f * aug[[col, k]];
                    }
                }
            }
        }
    }
    Some(aug.slice(s![.., n..]).to_owned())
}

/// Euclidean projection of a vector onto the probability simplex
/// (Held/Duchi): subtract the largest threshold that keeps the positive
/// part summing to one.
fn project_onto_simplex(v: &mut [f64]) {
    let mut sorted = v.to_vec();
    sorted.sort_unstable_by(|a, b| b.partial_cmp(a).expect("NaN in projection"));
    let mut cumulative = 0.0;
    let mut theta = 0.0;
    for (i, &u) in sorted.iter().enumerate() {
        cumulative += u;
        let t = (cumulative - 1.0) / (i as f64 + 1.0);
        if u - t > 0.0 {
            theta = t;
        }
    }
    for x in v.iter_mut() {
        *x = (*x - theta).max(0.0);
    }
}

/// R² = 1 − ‖Y − XM‖²_F / ‖Y − mean(Y)‖²_F, reported for monitoring.
pub fn r_squared(x: &Array2<f64>, y: &Array2<f64>, m: &Array2<f64>) -> f64 {
    let pred = x.dot(m);
    let ss_res: f64 = y
        .iter()
        .zip(pred.iter())
        .map(|(a, b)| (a - b) * (a - b))
        .sum();
    let means = y.mean_axis(NdAxis(0)).expect("empty Y");
    let ss_tot: f64 = y
        .rows()
        .into_iter()
        .flat_map(|row| {
            row.iter()
                .zip(means.iter())
                .map(|(a, mu)| (a - mu) * (a - mu))
                .collect::<Vec<_>>()
        })
        .sum();
    if ss_tot <= 1e-12 {
        // Degenerate target: identical rows. A near-perfect fit (relative
        // to the magnitude of Y) still reads as 1.
        let scale: f64 = y.iter().map(|v| v * v).sum::<f64>() + 1.0;
        return if ss_res <= 1e-6 * scale { 1.0 } else { 0.0 };
    }
    1.0 - ss_res / ss_tot
}

/// Declared major parties actually present in the table, with their
/// display names and seats kept aligned through the filtering.
fn present_axis(table: &BallotTable, spec: &ElectionSpec) -> MatrixAxis {
    let mut axis = MatrixAxis::default();
    let present = table.present_parties(&spec.major_parties.symbols);
    for (idx, symbol) in spec.major_parties.symbols.iter().enumerate() {
        if present.contains(symbol) {
            axis.push(
                symbol.clone(),
                spec.major_parties.names[idx].clone(),
                spec.major_parties.seats_for(idx),
            );
        }
    }
    axis
}

fn append_column(m: &Array2<f64>, col: &[f64]) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros((m.nrows(), m.ncols() + 1));
    out.slice_mut(s![.., ..m.ncols()]).assign(m);
    for (r, &v) in col.iter().enumerate() {
        out[[r, m.ncols()]] = v;
    }
    out
}

fn append_value(v: &Array1<f64>, extra: f64) -> Array1<f64> {
    let mut out = Array1::<f64>::zeros(v.len() + 1);
    out.slice_mut(s![..v.len()]).assign(v);
    out[v.len()] = extra;
    out
}

/// Compute the vote transfer between two elections.
pub fn analyze(
    from_table: &BallotTable,
    to_table: &BallotTable,
    from_spec: &ElectionSpec,
    to_spec: &ElectionSpec,
    opts: &TransferOptions,
) -> Result<TransferOutcome> {
    from_table.require_nonempty()?;
    to_table.require_nonempty()?;

    let mut sources = present_axis(from_table, from_spec);
    let mut targets = present_axis(to_table, to_spec);

    let pairs = match_precincts(from_table, to_table);
    info!(
        "Found {} matched precincts (with fallback)",
        pairs.len()
    );
    if pairs.is_empty() {
        return Err(CoreError::InputEmpty(format!(
            "no matching precincts between elections {} and {}",
            from_table.election, to_table.election
        ))
        .into());
    }

    let from_ids: Vec<PrecinctId> = pairs.iter().map(|(f, _)| f.clone()).collect();
    let to_ids: Vec<PrecinctId> = pairs.iter().map(|(_, t)| t.clone()).collect();

    let mut x = from_table.rows_matrix(&from_ids, &sources.codes);
    let mut y = to_table.rows_matrix(&to_ids, &targets.codes);
    let mut source_totals = from_table.national_totals(&sources.codes);
    let mut target_totals = to_table.national_totals(&targets.codes);

    if opts.include_abstention {
        let dnv_from = AbstentionColumn::compute(from_table, from_spec.eligible_voters);
        let dnv_to = AbstentionColumn::compute(to_table, to_spec.eligible_voters);
        x = append_column(&x, &dnv_from.values_for(&from_ids));
        y = append_column(&y, &dnv_to.values_for(&to_ids));
        source_totals = append_value(&source_totals, dnv_from.national);
        target_totals = append_value(&target_totals, dnv_to.national);
        sources.push(ABSTAIN_CODE.to_string(), ABSTAIN_NAME.to_string(), None);
        targets.push(ABSTAIN_CODE.to_string(), ABSTAIN_NAME.to_string(), None);
    }

    info!("Computing transfer matrix using {} method...", opts.method);
    let solution = solve(&x, &y, opts.method, opts.max_iterations)?;
    info!("R² = {:.4}", solution.r_squared);

    // Per-cell estimated vote flow, scaled by NATIONAL source totals (all
    // precincts of the source election, not only the matched subset).
    let mut movements = solution.matrix.clone();
    for (i, mut row) in movements.rows_mut().into_iter().enumerate() {
        row.mapv_inplace(|v| v * source_totals[i]);
    }

    Ok(TransferOutcome {
        from: from_table.election.clone(),
        to: to_table.election.clone(),
        sources,
        targets,
        matrix: solution.matrix,
        movements,
        source_totals,
        target_totals,
        r_squared: solution.r_squared,
        matched_precincts: pairs.len(),
        status: solution.status,
    })
}
