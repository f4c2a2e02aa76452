//! The forward *simulation* phase: synthesize the next election's
//! precinct table from the previous one and a hypothesized transfer plan.
//!
//! Every source precinct's votes are redistributed to target lists using
//! the plan's share map, perturbed with Dirichlet noise, and rounded back
//! to integers with the largest-remainder rule so each precinct's total
//! closes exactly. Given identical inputs and seed the output is
//! bit-identical.

use color_eyre::eyre::{bail, Context, Result};
use indexmap::IndexMap;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use rand_distr::{Dirichlet, Distribution};
use std::collections::HashMap;
use std::fs::read_to_string;
use std::path::Path;
use tracing::{info, warn};

use crate::ballots::{BallotTable, ElectionId, Precinct, PrecinctRecord};
use crate::utils::CoreError;

/// Alpha floor: keeps every Dirichlet component strictly positive even
/// for targets with zero expected share.
const ALPHA_FLOOR: f64 = 0.01;

/// A hypothesized transfer plan: per-source target shares, per-source
/// turnout factors, and the noise/seed knobs.
#[derive(Clone, Debug)]
pub struct SimulationPlan {
    /// source code -> (target code -> fraction); each inner map sums to 1.
    pub shares: IndexMap<String, IndexMap<String, f64>>,
    /// Per-source turnout factor; 1 when absent.
    pub turnout: HashMap<String, f64>,
    /// Source codes absent from `shares` fold into this one.
    pub dominant: String,
    /// Dirichlet concentration; higher is tighter around the expectation.
    pub alpha: f64,
    pub seed: u64,
    /// Optional source-column renames applied before simulation
    /// (publisher symbol changes between elections).
    pub remap: HashMap<String, String>,
}

#[derive(Deserialize)]
struct PlanFile {
    dominant: String,
    alpha: Option<f64>,
    seed: Option<u64>,
    #[serde(default)]
    turnout: HashMap<String, f64>,
    shares: IndexMap<String, IndexMap<String, f64>>,
    #[serde(default)]
    remap: HashMap<String, String>,
}

impl SimulationPlan {
    /// Load a plan from its TOML file; `alpha`/`seed` fall back to the
    /// main configuration's simulator options when the plan omits them.
    pub fn from_path(path: &Path, default_alpha: f64, default_seed: u64) -> Result<Self> {
        let raw = read_to_string(path)
            .with_context(|| format!("plan file {} could not be read", path.display()))?;
        let file: PlanFile =
            toml_edit::de::from_str(&raw).context("plan file could not be parsed")?;

        let mut shares = file.shares;
        for (src, dist) in shares.iter_mut() {
            let sum: f64 = dist.values().sum();
            if sum <= 0.0 {
                bail!("plan shares for {src} sum to zero");
            }
            if (sum - 1.0).abs() > 1e-6 {
                warn!("plan shares for {src} sum to {sum:.4}; renormalizing");
                for v in dist.values_mut() {
                    *v /= sum;
                }
            }
        }
        if !shares.contains_key(&file.dominant) {
            bail!("dominant source {} has no share row", file.dominant);
        }

        let alpha = file.alpha.unwrap_or(default_alpha);
        if alpha <= 0.0 {
            bail!("alpha must be positive, got {alpha}");
        }

        Ok(SimulationPlan {
            shares,
            turnout: file.turnout,
            dominant: file.dominant,
            alpha,
            seed: file.seed.unwrap_or(default_seed),
            remap: file.remap,
        })
    }

    /// Target codes in first-seen declaration order across all sources.
    fn target_codes(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for dist in self.shares.values() {
            for code in dist.keys() {
                if !out.contains(code) {
                    out.push(code.clone());
                }
            }
        }
        out
    }

    fn turnout_for(&self, code: &str) -> f64 {
        self.turnout.get(code).copied().unwrap_or(1.0)
    }
}

/// Integer rounding of a real vector to a fixed total: assign floors,
/// then increment in descending order of fractional remainder until the
/// target is reached. Remainder ties break by natural index order.
pub fn largest_remainder(values: &[f64], total: u32) -> Vec<u32> {
    let mut out: Vec<u32> = values.iter().map(|v| v.max(0.0).floor() as u32).collect();
    let assigned: u32 = out.iter().sum();
    let mut deficit = total.saturating_sub(assigned) as usize;
    if deficit == 0 {
        return out;
    }

    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| {
        let ra = values[a] - values[a].floor();
        let rb = values[b] - values[b].floor();
        rb.partial_cmp(&ra)
            .expect("NaN remainder")
            .then(a.cmp(&b))
    });

    // More than one full round can only happen through accumulated
    // floating-point slack; spreading again in the same order keeps the
    // closure exact.
    while deficit > 0 {
        for &i in &order {
            if deficit == 0 {
                break;
            }
            out[i] += 1;
            deficit -= 1;
        }
    }
    out
}

/// Produce a synthetic target table from a source table and a plan.
pub fn simulate(
    source: &BallotTable,
    plan: &SimulationPlan,
    target_election: ElectionId,
) -> Result<BallotTable> {
    source.require_nonempty()?;

    let targets = plan.target_codes();
    if targets.is_empty() {
        return Err(CoreError::InputEmpty("plan has no target lists".to_string()).into());
    }

    info!(
        "\tSimulating election {} from {} ({} precincts, α = {}, seed = {})",
        target_election,
        source.election,
        source.len(),
        plan.alpha,
        plan.seed
    );

    let mut rng = ChaCha20Rng::seed_from_u64(plan.seed);
    let mut folded_unknown = 0usize;

    let records: Vec<PrecinctRecord> = source
        .precincts()
        .map(|p| synthesize_precinct(p, plan, &targets, &mut rng, &mut folded_unknown))
        .collect();

    if folded_unknown > 0 {
        warn!(
            "{} source vote blocks had no share row; folded into {}",
            folded_unknown, plan.dominant
        );
    }

    Ok(BallotTable::load(target_election, targets, records, 1))
}

fn synthesize_precinct(
    p: &Precinct,
    plan: &SimulationPlan,
    targets: &[String],
    rng: &mut ChaCha20Rng,
    folded_unknown: &mut usize,
) -> PrecinctRecord {
    // Expected target vector e[j] = Σᵢ votesᵢ·τᵢ·share[i][j], with
    // unknown sources folded into the dominant one.
    let mut expected = vec![0.0_f64; targets.len()];
    let mut effective_total = 0.0_f64;
    for (code, &votes) in &p.votes {
        if votes == 0 {
            continue;
        }
        let src = if plan.shares.contains_key(code) {
            code.as_str()
        } else {
            *folded_unknown += 1;
            plan.dominant.as_str()
        };
        let tau = plan.turnout_for(src);
        let weight = f64::from(votes) * tau;
        effective_total += weight;
        let dist = &plan.shares[src];
        for (j, target) in targets.iter().enumerate() {
            if let Some(&f) = dist.get(target) {
                expected[j] += weight * f;
            }
        }
    }

    let total = effective_total.round().max(1.0) as u32;

    let esum: f64 = expected.iter().sum();
    let probs: Vec<f64> = if esum > 0.0 {
        expected.iter().map(|e| e / esum).collect()
    } else {
        vec![1.0 / targets.len() as f64; targets.len()]
    };

    let perturbed: Vec<f64> = if targets.len() < 2 {
        probs.clone()
    } else {
        let alpha: Vec<f64> = probs
            .iter()
            .map(|&pi| (plan.alpha * pi).max(ALPHA_FLOOR))
            .collect();
        Dirichlet::new(&alpha[..])
            .expect("alpha entries are positive")
            .sample(rng)
    };

    let scaled: Vec<f64> = perturbed.iter().map(|q| q * f64::from(total)).collect();
    let counts = largest_remainder(&scaled, total);

    let votes: IndexMap<String, u32> = targets
        .iter()
        .cloned()
        .zip(counts.iter().copied())
        .collect();

    PrecinctRecord {
        settlement_name: p.settlement_name.clone(),
        settlement_code: p.id.settlement_code,
        precinct_number: p.id.number.clone(),
        eligible: p.eligible,
        voted: total + p.invalid,
        valid: total,
        invalid: p.invalid,
        votes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_table(n: usize) -> BallotTable {
        let records: Vec<PrecinctRecord> = (0..n)
            .map(|i| {
                let a = 200 + (i % 7) as u32 * 10;
                let b = 100 + (i % 5) as u32 * 20;
                let c = 50 + (i % 3) as u32 * 5;
                PrecinctRecord {
                    settlement_name: "עיר".to_string(),
                    settlement_code: 100 + (i / 10) as u32,
                    precinct_number: format!("{}", i % 10 + 1),
                    eligible: 700,
                    voted: a + b + c + 4,
                    valid: a + b + c,
                    invalid: 4,
                    votes: IndexMap::from([
                        ("מחל".to_string(), a),
                        ("פה".to_string(), b),
                        ("שס".to_string(), c),
                    ]),
                }
            })
            .collect();
        BallotTable::load(
            ElectionId::from("25"),
            vec!["מחל".to_string(), "פה".to_string(), "שס".to_string()],
            records,
            1,
        )
    }

    fn plan() -> SimulationPlan {
        let shares = IndexMap::from([
            (
                "מחל".to_string(),
                IndexMap::from([("מחל".to_string(), 0.8), ("צל".to_string(), 0.2)]),
            ),
            (
                "פה".to_string(),
                IndexMap::from([("פה".to_string(), 0.9), ("מחל".to_string(), 0.1)]),
            ),
            (
                "שס".to_string(),
                IndexMap::from([("שס".to_string(), 1.0)]),
            ),
        ]);
        SimulationPlan {
            shares,
            turnout: HashMap::new(),
            dominant: "מחל".to_string(),
            alpha: 80.0,
            seed: 42,
            remap: HashMap::new(),
        }
    }

    #[test]
    fn plan_file_parses_and_renormalizes() {
        let toml = r#"
dominant = "מחל"
alpha = 80.0

[turnout]
"פה" = 0.9

[shares."מחל"]
"מחל" = 0.8
"ט" = 0.3

[shares."פה"]
"פה" = 1.0

[remap]
"צפ" = "פה"
"#;
        let dir = std::env::temp_dir().join("kalpi-plan-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("plan.toml");
        std::fs::write(&path, toml).unwrap();

        let plan = SimulationPlan::from_path(&path, 55.0, 42).unwrap();
        assert_eq!(plan.alpha, 80.0);
        // Seed falls back to the configuration default.
        assert_eq!(plan.seed, 42);
        assert_eq!(plan.dominant, "מחל");
        assert_eq!(plan.remap["צפ"], "פה");
        // The 0.8/0.3 row renormalizes to sum 1.
        let row = &plan.shares["מחל"];
        let sum: f64 = row.values().sum();
        assert!((sum - 1.0).abs() < 1e-12);
        assert!((row["מחל"] - 8.0 / 11.0).abs() < 1e-9);
    }

    #[test]
    fn largest_remainder_closes_exactly() {
        assert_eq!(largest_remainder(&[1.5, 1.5, 1.0], 4), vec![2, 1, 1]);
        assert_eq!(largest_remainder(&[0.3, 0.3, 0.4], 1), vec![0, 0, 1]);
        // Ties break by natural index order.
        assert_eq!(largest_remainder(&[0.5, 0.5], 1), vec![1, 0]);
        let v = [10.2, 0.4, 3.1, 86.3];
        let out = largest_remainder(&v, 100);
        assert_eq!(out.iter().sum::<u32>(), 100);
    }

    #[test]
    fn precinct_totals_close_exactly() {
        let src = source_table(40);
        let out = simulate(&src, &plan(), ElectionId::from("26")).unwrap();
        assert_eq!(out.len(), src.len());
        for (orig, synth) in src.precincts().zip(out.precincts()) {
            let total: u32 = synth.votes.values().sum();
            assert_eq!(total, synth.valid, "vote sum must equal valid");
            assert_eq!(synth.voted, synth.valid + synth.invalid);
            assert_eq!(synth.invalid, orig.invalid);
            assert_eq!(synth.eligible, orig.eligible);
            // τ = 1 everywhere: the effective total is the source total.
            assert_eq!(synth.valid, orig.vote_total().max(1));
        }
    }

    #[test]
    fn identical_seed_is_bit_identical() {
        let src = source_table(25);
        let a = simulate(&src, &plan(), ElectionId::from("26")).unwrap();
        let b = simulate(&src, &plan(), ElectionId::from("26")).unwrap();
        for (pa, pb) in a.precincts().zip(b.precincts()) {
            assert_eq!(pa.votes, pb.votes);
        }
        let mut other = plan();
        other.seed = 43;
        let c = simulate(&src, &other, ElectionId::from("26")).unwrap();
        let differs = a
            .precincts()
            .zip(c.precincts())
            .any(|(pa, pc)| pa.votes != pc.votes);
        assert!(differs, "a different seed should perturb differently");
    }

    #[test]
    fn national_mass_tracks_the_plan() {
        // 5000 precincts, τ = 1, α = 80, seed 42; per-party national
        // totals must land within 0.3% of the national vote mass on the
        // deterministic expectation Σᵢ votesᵢ·share[i][·].
        let src = source_table(5000);
        let p = plan();
        let out = simulate(&src, &p, ElectionId::from("26")).unwrap();

        let mut expected: HashMap<String, f64> = HashMap::new();
        let mut grand_total = 0.0_f64;
        for precinct in src.precincts() {
            for (code, &v) in &precinct.votes {
                grand_total += f64::from(v);
                for (dst, &f) in &p.shares[code] {
                    *expected.entry(dst.clone()).or_insert(0.0) += f64::from(v) * f;
                }
            }
        }

        let mut actual: HashMap<String, f64> = HashMap::new();
        for precinct in out.precincts() {
            for (code, &v) in &precinct.votes {
                *actual.entry(code.clone()).or_insert(0.0) += f64::from(v);
            }
        }

        for (code, exp) in &expected {
            let act = actual.get(code).copied().unwrap_or(0.0);
            let dev = (act - exp).abs() / grand_total;
            assert!(
                dev < 0.003,
                "{code}: expected {exp:.0}, got {act:.0} ({:.3}% of mass)",
                dev * 100.0
            );
        }

        // The dominant columns also track their own expectation tightly.
        for (code, exp) in &expected {
            if *exp >= 0.25 * grand_total {
                let act = actual.get(code).copied().unwrap_or(0.0);
                assert!((act - exp).abs() / exp < 0.01, "{code} drifted");
            }
        }
    }

    #[test]
    fn turnout_factors_scale_the_total() {
        let src = source_table(1);
        let mut p = plan();
        p.turnout.insert("מחל".to_string(), 0.5);
        let out = simulate(&src, &p, ElectionId::from("26")).unwrap();
        let orig = src.precincts().next().unwrap();
        let synth = out.precincts().next().unwrap();
        let expected_total = (f64::from(orig.votes["מחל"]) * 0.5
            + f64::from(orig.votes["פה"])
            + f64::from(orig.votes["שס"]))
        .round() as u32;
        assert_eq!(synth.valid, expected_total);
    }

    #[test]
    fn unknown_sources_fold_into_dominant() {
        let records = vec![PrecinctRecord {
            settlement_name: "עיר".to_string(),
            settlement_code: 100,
            precinct_number: "1".to_string(),
            eligible: 500,
            voted: 300,
            valid: 300,
            invalid: 0,
            votes: IndexMap::from([("זץ".to_string(), 300)]),
        }];
        let src = BallotTable::load(ElectionId::from("25"), vec!["זץ".to_string()], records, 1);
        let out = simulate(&src, &plan(), ElectionId::from("26")).unwrap();
        let synth = out.precincts().next().unwrap();
        // The dominant row (מחל) routes 80/20 to מחל/צל.
        assert_eq!(synth.valid, 300);
        assert!(synth.votes["מחל"] > synth.votes["צל"]);
    }
}
