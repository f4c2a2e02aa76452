//! The irregularity *audit* phase.
//!
//! Six independent detectors score each precinct against the national
//! voting pattern; a weighted combiner ranks the suspects. Detection is a
//! screen, not a verdict: the output is ranked candidates for human
//! review, and precincts already corrected in the authoritative public
//! record are filtered out by the verifier collaborator.

use color_eyre::eyre::Result;
use indexmap::IndexMap;
use ndarray::{Array1, Array2};
use tracing::{info, warn};

use crate::ballots::{BallotTable, ElectionId, Precinct, PrecinctId};
use crate::catalog::PartyCatalog;
use crate::cluster::{fit_kmeans, CentroidModel, Standardizer};
use crate::config::{ElectionSpec, IrregularityOptions};
use crate::term;
use crate::utils::roundn;

/// Fixed seed for the cluster fit; audits must be reproducible.
const KMEANS_SEED: u64 = 42;
const KMEANS_RESTARTS: usize = 10;

/// Distance to the nearest cluster centroid beyond which a precinct is an
/// outlier.
const OUTLIER_DISTANCE: f64 = 15.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// One detector firing on one precinct.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum AnomalyDetails {
    #[serde(rename = "shift_error")]
    Shift(Vec<ShiftDetail>),
    #[serde(rename = "round_numbers")]
    RoundNumbers(Vec<RoundDetail>),
    #[serde(rename = "turnout_anomaly")]
    Turnout(Vec<String>),
    #[serde(rename = "statistical_outlier")]
    Outlier { distance_score: f64 },
    #[serde(rename = "extreme_dominance")]
    Dominance(DominanceDetail),
    #[serde(rename = "small_party_spike")]
    SmallPartySpike(Vec<SpikeDetail>),
}

#[derive(Clone, Debug, Serialize)]
pub struct Anomaly {
    pub severity: Severity,
    pub description: String,
    #[serde(flatten)]
    pub details: AnomalyDetails,
}

#[derive(Clone, Debug, Serialize)]
pub struct ShiftDetail {
    pub missing: String,
    pub unexpected: String,
    pub missing_votes: u32,
    pub unexpected_votes: u32,
    pub expected_missing: String,
    pub expected_unexpected: String,
    pub missing_position: usize,
    pub unexpected_position: usize,
    pub direction: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct RoundDetail {
    pub party: String,
    pub votes: u32,
    /// Which magnitude fired: hundreds, fifties or tens.
    pub kind: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct DominanceDetail {
    pub party: String,
    pub party_name: String,
    pub proportion: String,
    pub votes: u32,
    pub kind: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct SpikeDetail {
    pub party: String,
    pub party_name: String,
    pub votes: u32,
    pub proportion: String,
    pub national_avg: String,
    pub ratio: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SuspectStatus {
    Verified,
    Fixed,
}

/// One suspected precinct, its firing detectors and combined score.
#[derive(Clone, Debug, Serialize)]
pub struct Suspect {
    pub id: PrecinctId,
    pub settlement: String,
    pub eligible: u32,
    pub voted: u32,
    pub valid: u32,
    pub invalid: u32,
    /// Non-zero party votes only.
    pub votes: IndexMap<String, u32>,
    pub anomalies: Vec<Anomaly>,
    pub score: f64,
    pub status: SuspectStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix_note: Option<String>,
}

impl Suspect {
    pub fn has_high_severity(&self) -> bool {
        self.anomalies.iter().any(|a| a.severity == Severity::High)
    }
}

/// National profile of one party, for the audit artifact.
#[derive(Clone, Debug, Serialize)]
pub struct PartyProfile {
    pub symbol: String,
    pub votes: u64,
    pub proportion: f64,
}

pub struct AuditOutcome {
    pub election: ElectionId,
    pub total_precincts: usize,
    pub analyzed_precincts: usize,
    /// Suspects passing the score and severity gates, pre-verification.
    pub irregular_found: usize,
    pub fixed_count: usize,
    /// Party columns with their national vote shares, descending.
    pub parties: Vec<PartyProfile>,
    pub suspects: Vec<Suspect>,
}

/// Asks the authoritative public record whether a precinct's counts have
/// been replaced since the raw feed was published. Pure query.
pub trait Verifier {
    fn was_corrected(
        &self,
        election: &ElectionId,
        settlement_code: u32,
        precinct_number: &str,
    ) -> Result<(bool, Option<String>)>;
}

/// Offline runs: nothing is ever corrected.
pub struct NoopVerifier;

impl Verifier for NoopVerifier {
    fn was_corrected(&self, _: &ElectionId, _: u32, _: &str) -> Result<(bool, Option<String>)> {
        Ok((false, None))
    }
}

/// Scan one election for irregular precincts.
pub fn score_election(
    table: &BallotTable,
    spec: &ElectionSpec,
    catalog: &PartyCatalog,
    opts: &IrregularityOptions,
    verifier: &dyn Verifier,
    keep_fixed: bool,
) -> Result<AuditOutcome> {
    table.require_nonempty()?;
    info!("Scanning election {} for irregularities", table.election);

    let party_cols = &table.parties;

    // National profile π over every precinct.
    let totals = table.national_totals(party_cols);
    let grand_total: f64 = totals.sum();
    let profile: Vec<f64> = if grand_total > 0.0 {
        totals.iter().map(|t| t / grand_total).collect()
    } else {
        vec![0.0; party_cols.len()]
    };

    // When the eligible column is empty for the whole election the
    // turnout checks would flag everything; suppress them instead.
    let has_eligible = table.precincts().any(|p| p.eligible > 0);
    if !has_eligible {
        warn!(
            "election {}: eligible column empty, suppressing turnout checks",
            table.election
        );
    }

    // Cluster model over the analyzable precincts.
    let analyzed: Vec<&Precinct> = table
        .precincts()
        .filter(|p| p.valid >= opts.min_valid)
        .collect();
    let mut props = Array2::<f64>::zeros((analyzed.len(), party_cols.len()));
    let mut skipped_rows = 0usize;
    for (r, p) in analyzed.iter().enumerate() {
        let total = f64::from(p.vote_total());
        if total <= 0.0 {
            skipped_rows += 1;
            continue;
        }
        for (c, code) in party_cols.iter().enumerate() {
            props[[r, c]] = f64::from(p.votes.get(code).copied().unwrap_or(0)) / total;
        }
    }
    if skipped_rows > 0 {
        warn!("{skipped_rows} analyzable precincts had zero party votes; skipped");
    }

    let scaler = Standardizer::fit(&props);
    let scaled = scaler.transform(&props);
    let k = (analyzed.len() / 100).min(10);
    let model: CentroidModel = if k >= 2 {
        fit_kmeans(&scaled, k, KMEANS_SEED, KMEANS_RESTARTS)
    } else {
        CentroidModel::single_mean(&scaled)
    };

    let major = &spec.major_parties;
    let mut suspects: Vec<Suspect> = Vec::new();

    for p in &analyzed {
        let total = f64::from(p.vote_total());
        if total <= 0.0 {
            continue;
        }
        let props_row: Vec<f64> = party_cols
            .iter()
            .map(|code| f64::from(p.votes.get(code).copied().unwrap_or(0)) / total)
            .collect();

        let mut anomalies: Vec<Anomaly> = Vec::new();
        let mut score = 0.0_f64;

        // 1. Shift error: a silent major column next to a loud minor one.
        let shifts = detect_shift(p, party_cols, &props_row, &profile, major);
        if !shifts.is_empty() {
            score += 10.0 * shifts.len() as f64;
            anomalies.push(Anomaly {
                severity: Severity::High,
                description: "חשד להזנת קולות בעמודה הלא נכונה".to_string(),
                details: AnomalyDetails::Shift(shifts),
            });
        }

        // 2. Suspiciously round counts.
        let rounds = detect_round_numbers(p, party_cols);
        if !rounds.is_empty() {
            score += 2.0 * rounds.len() as f64;
            anomalies.push(Anomaly {
                severity: Severity::Medium,
                description: "מספרים עגולים באופן חשוד".to_string(),
                details: AnomalyDetails::RoundNumbers(rounds),
            });
        }

        // 3. Impossible turnout.
        if has_eligible {
            let flags = detect_turnout(p);
            if !flags.is_empty() {
                score += 15.0 * flags.len() as f64;
                anomalies.push(Anomaly {
                    severity: Severity::High,
                    description: "אנומליה באחוזי ההשתתפות".to_string(),
                    details: AnomalyDetails::Turnout(flags),
                });
            }
        }

        // 4. Statistical outlier against the cluster centroids.
        let scaled_row = scaler.transform_row(&Array1::from(props_row.clone()));
        let distance = model.nearest_distance(&scaled_row);
        if distance > OUTLIER_DISTANCE {
            score += 0.5 * distance;
            anomalies.push(Anomaly {
                severity: Severity::Medium,
                description: "דפוס הצבעה חריג שלא מתאים לאף אשכול".to_string(),
                details: AnomalyDetails::Outlier {
                    distance_score: roundn(distance, 2),
                },
            });
        }

        // 5. Extreme single-party dominance.
        if let Some((contribution, severity, detail)) =
            detect_dominance(p, party_cols, &props_row, major, catalog, &table.election)
        {
            score += contribution;
            anomalies.push(Anomaly {
                severity,
                description: "שליטה קיצונית של מפלגה אחת".to_string(),
                details: AnomalyDetails::Dominance(detail),
            });
        }

        // 6. Small-party spike.
        let spikes = detect_small_party_spike(
            p,
            party_cols,
            &props_row,
            &profile,
            major,
            catalog,
            &table.election,
        );
        if !spikes.is_empty() {
            score += 8.0 * spikes.len() as f64;
            anomalies.push(Anomaly {
                severity: Severity::High,
                description: "תוצאות גבוהות באופן חריג למפלגות קטנות".to_string(),
                details: AnomalyDetails::SmallPartySpike(spikes),
            });
        }

        let suspect = Suspect {
            id: p.id.clone(),
            settlement: p.settlement_name.clone(),
            eligible: p.eligible,
            voted: p.voted,
            valid: p.valid,
            invalid: p.invalid,
            votes: p
                .votes
                .iter()
                .filter(|(_, &v)| v > 0)
                .map(|(c, &v)| (c.clone(), v))
                .collect(),
            anomalies,
            score,
            status: SuspectStatus::Verified,
            fix_note: None,
        };
        if !suspect.anomalies.is_empty()
            && suspect.score >= opts.min_score
            && suspect.has_high_severity()
        {
            suspects.push(suspect);
        }
    }

    // Rank by score; ties break on the precinct id for stable output.
    suspects.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .expect("NaN score")
            .then_with(|| a.id.cmp(&b.id))
    });
    let irregular_found = suspects.len();
    info!(
        "Found {} potential irregularities, checking against official record...",
        irregular_found
    );

    // Verification pass: drop (or annotate) precincts already corrected.
    let mut fixed_count = 0usize;
    let mut verified: Vec<Suspect> = Vec::new();
    for (checked, mut suspect) in suspects.into_iter().enumerate() {
        if checked > 0 && checked % 10 == 0 {
            info!("{}\t\tChecked {} ballots", ttyjump(), checked);
        }
        let (was_fixed, note) = verifier.was_corrected(
            &table.election,
            suspect.id.settlement_code,
            &suspect.id.number,
        )?;
        if was_fixed {
            fixed_count += 1;
            suspect.status = SuspectStatus::Fixed;
            suspect.fix_note = note;
            if keep_fixed {
                verified.push(suspect);
            }
        } else {
            verified.push(suspect);
        }
    }
    verified.truncate(opts.top_n);
    info!(
        "{} irregularities were fixed, reporting {} remaining",
        fixed_count,
        verified.len()
    );

    let mut parties: Vec<PartyProfile> = party_cols
        .iter()
        .enumerate()
        .filter(|(c, _)| totals[*c] > 0.0)
        .map(|(c, code)| PartyProfile {
            symbol: code.clone(),
            votes: totals[c] as u64,
            proportion: profile[c],
        })
        .collect();
    parties.sort_by(|a, b| b.votes.cmp(&a.votes));

    Ok(AuditOutcome {
        election: table.election.clone(),
        total_precincts: table.len(),
        analyzed_precincts: analyzed.len(),
        irregular_found,
        fixed_count,
        parties,
        suspects: verified,
    })
}

// `let` can only be used in a function
fn ttyjump() -> &'static str {
    use std::io::IsTerminal;
    if std::io::stderr().is_terminal() {
        term::TTYJUMP
    } else {
        ""
    }
}

/// A major party at near-zero next to a non-major column spiking well
/// above its national share reads as a data-entry column shift.
fn detect_shift(
    p: &Precinct,
    party_cols: &[String],
    props: &[f64],
    profile: &[f64],
    major: &crate::config::MajorParties,
) -> Vec<ShiftDetail> {
    let mut out = Vec::new();
    for (i, col) in party_cols.iter().enumerate() {
        if !major.contains(col) {
            continue;
        }
        let expected = profile[i];
        let actual = props[i];
        if expected > 0.05 && actual < 0.01 {
            for offset in [-1_isize, 1] {
                let adj = i as isize + offset;
                if adj < 0 || adj as usize >= party_cols.len() {
                    continue;
                }
                let adj = adj as usize;
                let adj_col = &party_cols[adj];
                if major.contains(adj_col) {
                    continue;
                }
                if props[adj] > 0.05 && profile[adj] < 0.01 {
                    let direction = if offset == 1 { "→" } else { "←" };
                    out.push(ShiftDetail {
                        missing: col.clone(),
                        unexpected: adj_col.clone(),
                        missing_votes: p.votes.get(col).copied().unwrap_or(0),
                        unexpected_votes: p.votes.get(adj_col).copied().unwrap_or(0),
                        expected_missing: format!("{:.1}%", expected * 100.0),
                        expected_unexpected: format!("{:.1}%", profile[adj] * 100.0),
                        missing_position: i + 1,
                        unexpected_position: adj + 1,
                        direction: direction.to_string(),
                    });
                }
            }
        }
    }
    out
}

/// At least five non-zero counts with four or more round ones making up
/// over 60% of them.
fn detect_round_numbers(p: &Precinct, party_cols: &[String]) -> Vec<RoundDetail> {
    let non_zero: Vec<(&String, u32)> = party_cols
        .iter()
        .filter_map(|c| p.votes.get(c).map(|&v| (c, v)))
        .filter(|(_, v)| *v > 0)
        .collect();
    if non_zero.len() < 5 {
        return Vec::new();
    }

    let mut round: Vec<RoundDetail> = Vec::new();
    for (col, v) in &non_zero {
        let kind = if *v >= 100 && v % 100 == 0 {
            "מאות"
        } else if *v >= 50 && v % 50 == 0 {
            "חמישים"
        } else if *v >= 10 && v % 10 == 0 {
            "עשרות"
        } else {
            continue;
        };
        round.push(RoundDetail {
            party: (*col).clone(),
            votes: *v,
            kind: kind.to_string(),
        });
    }

    if round.len() >= 4 && round.len() as f64 / non_zero.len() as f64 > 0.6 {
        round
    } else {
        Vec::new()
    }
}

fn detect_turnout(p: &Precinct) -> Vec<String> {
    let mut flags = Vec::new();
    if p.eligible > 0 && p.voted > p.eligible {
        flags.push(format!(
            "מצביעים ({}) > בעלי זכות ({})",
            p.voted, p.eligible
        ));
    }
    let counted = p.valid + p.invalid;
    if p.voted > 0 && counted.abs_diff(p.voted) > 1 {
        flags.push(format!(
            "כשרים+פסולים ({counted}) ≠ מצביעים ({})",
            p.voted
        ));
    }
    if p.eligible > 100 && p.voted == p.eligible {
        flags.push(format!("השתתפות 100% ({}/{})", p.voted, p.eligible));
    }
    flags
}

fn detect_dominance(
    p: &Precinct,
    party_cols: &[String],
    props: &[f64],
    major: &crate::config::MajorParties,
    catalog: &PartyCatalog,
    election: &ElectionId,
) -> Option<(f64, Severity, DominanceDetail)> {
    let (max_idx, &max_prop) = props
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).expect("NaN proportion"))?;
    let max_party = &party_cols[max_idx];
    let max_votes = p.votes.get(max_party).copied().unwrap_or(0);

    // Homogeneous communities legitimately reach 90%+ for one list, so
    // the major-party threshold sits very high; a minor list with even
    // 30% is a different matter.
    if !major.contains(max_party) && max_prop > 0.3 {
        return Some((
            5.0 * max_prop,
            Severity::High,
            DominanceDetail {
                party: max_party.clone(),
                party_name: catalog.info(max_party, election).name,
                proportion: format!("{:.1}%", max_prop * 100.0),
                votes: max_votes,
                kind: "small_party_dominance".to_string(),
            },
        ));
    }
    if major.contains(max_party) && max_prop > 0.95 {
        return Some((
            max_prop,
            Severity::Low,
            DominanceDetail {
                party: max_party.clone(),
                party_name: catalog.info(max_party, election).name,
                proportion: format!("{:.1}%", max_prop * 100.0),
                votes: max_votes,
                kind: "extreme_dominance".to_string(),
            },
        ));
    }
    None
}

#[allow(clippy::too_many_arguments)]
fn detect_small_party_spike(
    p: &Precinct,
    party_cols: &[String],
    props: &[f64],
    profile: &[f64],
    major: &crate::config::MajorParties,
    catalog: &PartyCatalog,
    election: &ElectionId,
) -> Vec<SpikeDetail> {
    let mut out = Vec::new();
    for (i, col) in party_cols.iter().enumerate() {
        if major.contains(col) {
            continue;
        }
        let expected = profile[i];
        let actual = props[i];
        let votes = p.votes.get(col).copied().unwrap_or(0);
        if expected < 0.005 && actual > 0.05 && votes >= 5 {
            let ratio = actual / expected.max(0.001);
            if ratio > 20.0 && ratio.is_finite() {
                out.push(SpikeDetail {
                    party: col.clone(),
                    party_name: catalog.info(col, election).name,
                    votes,
                    proportion: format!("{:.2}%", actual * 100.0),
                    national_avg: format!("{:.3}%", expected * 100.0),
                    ratio: format!("{ratio:.0}x"),
                });
            }
        }
    }
    out
}
