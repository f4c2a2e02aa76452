//! Persisted artifact schemas and their JSON writers.
//!
//! One transition record per analyzed election pair, one audit record per
//! scanned election, one metrics record overall. Flow suppression below
//! the configured threshold happens HERE, at export time; the stats block
//! is always computed from the unsuppressed flows.

use color_eyre::eyre::{Context, ContextCompat, Result};
use std::fs::{create_dir_all, File};
use std::io::BufWriter;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

use crate::abstention::{ABSTAIN_CODE, ABSTAIN_COLOR, ABSTAIN_NAME};
use crate::ballots::ElectionId;
use crate::catalog::PartyCatalog;
use crate::config::ElectionSpec;
use crate::irregular::AuditOutcome;
use crate::transfer::{SolverStatus, TransferOutcome};
use crate::utils::{round1, roundn};

/// Election header carried on both sides of a transition record.
#[derive(Serialize)]
pub struct ElectionMeta {
    pub id: String,
    pub name: String,
    pub name_en: String,
    pub date: String,
    pub eligible_voters: u32,
    pub votes_cast: u32,
    pub valid_votes: u32,
    pub turnout_percent: f64,
}

impl ElectionMeta {
    pub fn from_spec(spec: &ElectionSpec) -> Self {
        ElectionMeta {
            id: spec.id.to_string(),
            name: spec.name.clone(),
            name_en: spec.name_en.clone(),
            date: spec.date.clone(),
            eligible_voters: spec.eligible_voters,
            votes_cast: spec.votes_cast,
            valid_votes: spec.valid_votes,
            turnout_percent: spec.turnout_percent,
        }
    }
}

#[derive(Serialize)]
pub struct Node {
    pub code: String,
    pub display_name: String,
    pub color: String,
    pub total_votes: u64,
    pub seats: Option<u32>,
}

#[derive(Serialize)]
pub struct Flow {
    pub source_code: String,
    pub target_code: String,
    pub votes: u64,
    pub percentage: f64,
}

#[derive(Serialize)]
pub struct TransitionStats {
    pub common_precincts: usize,
    pub r_squared: f64,
    pub solver_optimal: bool,
    pub total_votes_from: u64,
    pub total_votes_to: u64,
    /// Unix epoch seconds.
    pub generated_at: u64,
}

#[derive(Serialize)]
pub struct TransitionArtifact {
    pub from_election: ElectionMeta,
    pub to_election: ElectionMeta,
    pub nodes_from: Vec<Node>,
    pub nodes_to: Vec<Node>,
    pub transfers: Vec<Flow>,
    pub stats: TransitionStats,
}

fn nodes(
    election: &ElectionId,
    codes: &[String],
    names: &[String],
    seats: &[Option<u32>],
    totals: &ndarray::Array1<f64>,
    catalog: &PartyCatalog,
) -> Vec<Node> {
    codes
        .iter()
        .enumerate()
        .map(|(i, code)| {
            let (display_name, color) = if code == ABSTAIN_CODE {
                (ABSTAIN_NAME.to_string(), ABSTAIN_COLOR.to_string())
            } else {
                let info = catalog.info(code, election);
                (names[i].clone(), info.color)
            };
            Node {
                code: code.clone(),
                display_name,
                color,
                total_votes: totals[i].max(0.0) as u64,
                seats: seats[i],
            }
        })
        .collect()
}

/// Assemble the transition artifact, suppressing flows under
/// `min_flow_threshold`.
pub fn transition_artifact(
    outcome: &TransferOutcome,
    from_spec: &ElectionSpec,
    to_spec: &ElectionSpec,
    catalog: &PartyCatalog,
    min_flow_threshold: u32,
) -> TransitionArtifact {
    let mut transfers = Vec::new();
    for (i, source_code) in outcome.sources.codes.iter().enumerate() {
        for (j, target_code) in outcome.targets.codes.iter().enumerate() {
            let votes = outcome.movements[[i, j]];
            if votes >= f64::from(min_flow_threshold) {
                transfers.push(Flow {
                    source_code: source_code.clone(),
                    target_code: target_code.clone(),
                    votes: votes as u64,
                    percentage: round1(outcome.matrix[[i, j]] * 100.0),
                });
            }
        }
    }

    TransitionArtifact {
        from_election: ElectionMeta::from_spec(from_spec),
        to_election: ElectionMeta::from_spec(to_spec),
        nodes_from: nodes(
            &outcome.from,
            &outcome.sources.codes,
            &outcome.sources.names,
            &outcome.sources.seats,
            &outcome.source_totals,
            catalog,
        ),
        nodes_to: nodes(
            &outcome.to,
            &outcome.targets.codes,
            &outcome.targets.names,
            &outcome.targets.seats,
            &outcome.target_totals,
            catalog,
        ),
        transfers,
        stats: TransitionStats {
            common_precincts: outcome.matched_precincts,
            r_squared: roundn(outcome.r_squared, 4),
            solver_optimal: outcome.status == SolverStatus::Optimal,
            total_votes_from: outcome.source_totals.sum().max(0.0) as u64,
            total_votes_to: outcome.target_totals.sum().max(0.0) as u64,
            generated_at: epoch_seconds(),
        },
    }
}

#[derive(Serialize)]
pub struct AuditHeader {
    pub id: String,
    pub name: String,
    pub name_en: String,
    pub date: String,
    pub total_ballots: usize,
    pub analyzed_ballots: usize,
    pub irregular_found: usize,
    pub fixed_count: usize,
}

#[derive(Serialize)]
pub struct AuditParty {
    pub symbol: String,
    pub name: String,
    pub color: String,
    pub votes: u64,
    pub proportion: String,
}

#[derive(Serialize)]
pub struct AuditArtifact<'a> {
    pub election: AuditHeader,
    pub parties: Vec<AuditParty>,
    pub irregularities: &'a [crate::irregular::Suspect],
}

pub fn audit_artifact<'a>(
    outcome: &'a AuditOutcome,
    spec: &ElectionSpec,
    catalog: &PartyCatalog,
) -> AuditArtifact<'a> {
    let parties = outcome
        .parties
        .iter()
        .map(|p| {
            let info = catalog.info(&p.symbol, &outcome.election);
            AuditParty {
                symbol: p.symbol.clone(),
                name: info.name,
                color: info.color,
                votes: p.votes,
                proportion: format!("{:.2}%", p.proportion * 100.0),
            }
        })
        .collect();

    AuditArtifact {
        election: AuditHeader {
            id: outcome.election.to_string(),
            name: spec.name.clone(),
            name_en: spec.name_en.clone(),
            date: spec.date.clone(),
            total_ballots: outcome.total_precincts,
            analyzed_ballots: outcome.analyzed_precincts,
            irregular_found: outcome.irregular_found,
            fixed_count: outcome.fixed_count,
        },
        parties,
        irregularities: &outcome.suspects,
    }
}

/// Write any serializable artifact as pretty JSON, creating directories
/// as needed.
pub fn write_json<T: serde::Serialize>(value: &T, path: &Path) -> Result<()> {
    create_dir_all(
        path.parent()
            .with_context(|| format!("{} has no parent", path.display()))?,
    )?;
    let file = File::create(path)
        .with_context(|| format!("could not create artifact {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), value)
        .with_context(|| format!("could not write artifact {}", path.display()))?;
    info!("Saved {}", path.display());
    Ok(())
}

fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ballots::{BallotTable, PrecinctRecord};
    use crate::config::{MajorParties, TransferOptions};
    use indexmap::IndexMap;
    use std::path::PathBuf;

    fn spec(id: &str, symbols: &[&str]) -> ElectionSpec {
        ElectionSpec {
            id: ElectionId::from(id),
            name: format!("הכנסת ה-{id}"),
            name_en: format!("{id}th Knesset"),
            date: "2022-11-01".to_string(),
            file: PathBuf::from("x"),
            encoding: "utf-8-sig".to_string(),
            ballot_field: "קלפי".to_string(),
            precinct_number_divisor: 1,
            eligible_voters: 1000,
            votes_cast: 900,
            valid_votes: 890,
            turnout_percent: 90.0,
            major_parties: MajorParties {
                symbols: symbols.iter().map(|s| s.to_string()).collect(),
                names: symbols.iter().map(|s| format!("רשימת {s}")).collect(),
                seats: vec![10, 5],
            },
        }
    }

    fn table(id: &str, factor: u32) -> BallotTable {
        let records = (1..=3)
            .map(|n| {
                let a = 100 * factor;
                let b = 50;
                PrecinctRecord {
                    settlement_name: "עיר".to_string(),
                    settlement_code: 100,
                    precinct_number: n.to_string(),
                    eligible: 400,
                    voted: a + b,
                    valid: a + b,
                    invalid: 0,
                    votes: IndexMap::from([
                        ("מחל".to_string(), a),
                        ("פה".to_string(), b),
                    ]),
                }
            })
            .collect();
        BallotTable::load(
            ElectionId::from(id),
            vec!["מחל".to_string(), "פה".to_string()],
            records,
            1,
        )
    }

    #[test]
    fn artifact_suppresses_small_flows_only_at_export() {
        let e1 = table("24", 1);
        let e2 = table("25", 1);
        let outcome = crate::transfer::analyze(
            &e1,
            &e2,
            &spec("24", &["מחל", "פה"]),
            &spec("25", &["מחל", "פה"]),
            &TransferOptions::default(),
        )
        .unwrap();
        let catalog = PartyCatalog::embedded().unwrap();

        // National totals: מחל 300, פה 150; with identity-ish transfer
        // the big diagonal flows are ~300 and ~150.
        let artifact = transition_artifact(
            &outcome,
            &spec("24", &["מחל", "פה"]),
            &spec("25", &["מחל", "פה"]),
            &catalog,
            200,
        );
        assert_eq!(artifact.transfers.len(), 1, "only the מחל flow survives");
        assert_eq!(artifact.transfers[0].source_code, "מחל");

        // Stats stay unsuppressed.
        assert_eq!(artifact.stats.common_precincts, 3);
        assert_eq!(artifact.stats.total_votes_from, 450);
        assert!(artifact.stats.r_squared > 0.99);

        // Threshold zero keeps everything meaningful.
        let full = transition_artifact(
            &outcome,
            &spec("24", &["מחל", "פה"]),
            &spec("25", &["מחל", "פה"]),
            &catalog,
            0,
        );
        assert!(full.transfers.len() >= 2);
        // Nodes resolve display data through the catalog.
        assert_eq!(full.nodes_from[0].display_name, "רשימת מחל");
        assert_eq!(full.nodes_from[0].seats, Some(10));
        assert!(full.nodes_from[0].color.starts_with('#'));
    }
}
