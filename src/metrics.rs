//! The settlement *aggregation and metrics* phase.
//!
//! Precinct tables fold up into settlement aggregates (keyed by canonical
//! name), which in turn feed the longitudinal metrics: Pedersen
//! volatility with family-merge normalization, Herfindahl-Hirschman
//! concentration, and party-similarity matrices.

use color_eyre::eyre::Result;
use indexmap::IndexMap;
use std::collections::{BTreeMap, HashMap, HashSet};
use string_interner::{backend::StringBackend, symbol::SymbolU16, StringInterner};
use tracing::{info, warn};

use crate::ballots::{BallotTable, ElectionId};
use crate::catalog::PartyCatalog;
use crate::config::ElectionSpec;
use crate::geo::CoordinateIndex;
use crate::names::NameCanonicalizer;
use crate::utils::{round1, roundn};

/// Aggregate of one settlement in one election.
#[derive(Clone, Debug, Serialize)]
pub struct Settlement {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    pub voters: u64,
    pub eligible: u64,
    pub turnout: f64,
    pub ballot_count: usize,
    /// Percent of valid votes, weighted by voter count, keyed by code.
    pub proportions: IndexMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winning_party: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<u32>,
}

/// Fold a precinct table up to settlement level.
///
/// Proportions are per-precinct percent-of-valid, weighted by each
/// precinct's voter count; precincts with no usable denominator are
/// skipped and counted.
pub fn aggregate_settlements(
    table: &BallotTable,
    canon: &NameCanonicalizer,
    coords: Option<&CoordinateIndex>,
    socio: Option<&HashMap<String, u32>>,
) -> Vec<Settlement> {
    // Settlement names repeat once per precinct; intern them so the
    // accumulation pass works on u16 keys instead of strings.
    let mut interner = StringInterner::<StringBackend<SymbolU16>>::new();

    struct Accumulator {
        voters: u64,
        eligible: u64,
        ballot_count: usize,
        weighted: IndexMap<String, f64>,
    }

    let mut order: Vec<SymbolU16> = Vec::new();
    let mut acc: HashMap<SymbolU16, Accumulator> = HashMap::new();
    let mut skipped = 0usize;

    for p in table.precincts() {
        let denominator = if p.valid > 0 {
            f64::from(p.valid)
        } else {
            f64::from(p.vote_total())
        };
        if denominator <= 0.0 {
            skipped += 1;
            continue;
        }
        let name = interner.get_or_intern(canon.canon(&p.settlement_name));
        let entry = acc.entry(name).or_insert_with(|| {
            order.push(name);
            Accumulator {
                voters: 0,
                eligible: 0,
                ballot_count: 0,
                weighted: IndexMap::new(),
            }
        });
        entry.voters += u64::from(p.voted);
        entry.eligible += u64::from(p.eligible);
        entry.ballot_count += 1;
        let weight = f64::from(p.voted);
        for (code, &v) in &p.votes {
            if v > 0 {
                *entry.weighted.entry(code.clone()).or_insert(0.0) +=
                    100.0 * f64::from(v) / denominator * weight;
            }
        }
    }
    if skipped > 0 {
        warn!(
            "election {}: skipped {} precincts with no countable votes",
            table.election, skipped
        );
    }

    order
        .into_iter()
        .map(|sym| {
            let a = &acc[&sym];
            let name = interner.resolve(sym).expect("interned").to_string();
            let proportions: IndexMap<String, f64> = if a.voters > 0 {
                a.weighted
                    .iter()
                    .map(|(c, w)| (c.clone(), round1(w / a.voters as f64)))
                    .collect()
            } else {
                IndexMap::new()
            };
            let winning_party = proportions
                .iter()
                .max_by(|(_, a), (_, b)| a.partial_cmp(b).expect("NaN proportion"))
                .map(|(c, _)| c.clone());
            let turnout = if a.eligible > 0 {
                round1(100.0 * a.voters as f64 / a.eligible as f64)
            } else {
                0.0
            };
            let coord = coords.and_then(|c| c.settlement(&name));
            Settlement {
                name: name.clone(),
                lat: coord.map(|c| c.lat),
                lon: coord.map(|c| c.lon),
                voters: a.voters,
                eligible: a.eligible,
                turnout,
                ballot_count: a.ballot_count,
                proportions,
                winning_party,
                cluster: socio.and_then(|s| s.get(&name).copied()),
            }
        })
        .collect()
}

/// Pedersen volatility: half the L¹ distance between two percent vectors.
pub fn pedersen(a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> f64 {
    let keys: HashSet<&String> = a.keys().chain(b.keys()).collect();
    keys.iter()
        .map(|k| {
            (a.get(*k).copied().unwrap_or(0.0) - b.get(*k).copied().unwrap_or(0.0)).abs()
        })
        .sum::<f64>()
        / 2.0
}

/// Re-key a proportion vector by family id where the code participates in
/// a family, summing the members of a merge group.
pub fn merge_families(
    props: &IndexMap<String, f64>,
    election: &ElectionId,
    catalog: &PartyCatalog,
) -> HashMap<String, f64> {
    let mut out: HashMap<String, f64> = HashMap::new();
    for (code, &v) in props {
        let key = catalog
            .family_of(code, election)
            .cloned()
            .unwrap_or_else(|| code.clone());
        *out.entry(key).or_insert(0.0) += v;
    }
    out
}

#[derive(Clone, Debug, Serialize)]
pub struct SettlementVolatility {
    pub transitions: IndexMap<String, f64>,
    pub average: f64,
    pub rank: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct ConcentrationThresholds {
    pub s50: usize,
    pub s75: usize,
    pub s90: usize,
    pub s98: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct TopSettlement {
    pub name: String,
    pub share: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct FamilyConcentration {
    pub hhi: f64,
    pub effective_settlements: u32,
    pub thresholds: ConcentrationThresholds,
    pub elections: Vec<String>,
    pub top5: Vec<TopSettlement>,
}

#[derive(Clone, Debug, Serialize)]
pub struct NationalVolatility {
    pub median_pedersen: f64,
    pub mean_pedersen: f64,
    pub total_settlements: usize,
}

#[derive(Serialize)]
pub struct MetricsReport {
    pub settlement_pedersen: IndexMap<String, SettlementVolatility>,
    pub national_stats: NationalVolatility,
    pub family_hhi: BTreeMap<String, FamilyConcentration>,
    pub party_cosine_similarity: BTreeMap<String, BTreeMap<String, f64>>,
    pub party_ballot_correlations: BTreeMap<String, BTreeMap<String, f64>>,
}

/// Compute the full metrics block over every declared election table.
pub fn compute_metrics(
    tables: &BTreeMap<ElectionId, BallotTable>,
    specs: &BTreeMap<ElectionId, ElectionSpec>,
    catalog: &PartyCatalog,
    canon: &NameCanonicalizer,
    coords: Option<&CoordinateIndex>,
    socio: Option<&HashMap<String, u32>>,
) -> Result<MetricsReport> {
    let latest = tables
        .keys()
        .max()
        .cloned()
        .ok_or_else(|| crate::utils::CoreError::InputEmpty("no election tables".to_string()))?;

    // Settlement aggregates per election.
    let mut settlements: BTreeMap<ElectionId, Vec<Settlement>> = BTreeMap::new();
    for (eid, table) in tables {
        settlements.insert(eid.clone(), aggregate_settlements(table, canon, coords, socio));
    }

    let volatility = settlement_volatility(&settlements, catalog, &latest);
    let family_hhi = family_concentration(&settlements, catalog);
    let (cosine, correlations) = similarity_matrices(
        &settlements[&latest],
        &tables[&latest],
        &specs[&latest],
    );

    let averages: Vec<f64> = volatility.values().map(|v| v.average).collect();
    let national_stats = NationalVolatility {
        median_pedersen: round1(median(&averages)),
        mean_pedersen: round1(mean(&averages)),
        total_settlements: volatility.len(),
    };
    info!(
        "{} settlements with volatility, median Pedersen {}%",
        national_stats.total_settlements, national_stats.median_pedersen
    );

    Ok(MetricsReport {
        settlement_pedersen: volatility,
        national_stats,
        family_hhi,
        party_cosine_similarity: cosine,
        party_ballot_correlations: correlations,
    })
}

/// Per-settlement Pedersen over every consecutive transition, family
/// merges applied per side. A settlement reports only when it appears in
/// all transitions and still has voters in the most recent election.
fn settlement_volatility(
    settlements: &BTreeMap<ElectionId, Vec<Settlement>>,
    catalog: &PartyCatalog,
    latest: &ElectionId,
) -> IndexMap<String, SettlementVolatility> {
    let by_name: BTreeMap<&ElectionId, HashMap<&str, &Settlement>> = settlements
        .iter()
        .map(|(e, list)| {
            (
                e,
                list.iter()
                    .map(|s| (s.name.as_str(), s))
                    .collect::<HashMap<_, _>>(),
            )
        })
        .collect();

    let ids: Vec<&ElectionId> = settlements.keys().collect();
    let transitions: Vec<(&ElectionId, &ElectionId)> =
        ids.windows(2).map(|w| (w[0], w[1])).collect();

    let latest_names: HashSet<&str> = by_name
        .get(latest)
        .map(|m| {
            m.values()
                .filter(|s| s.voters > 0)
                .map(|s| s.name.as_str())
                .collect()
        })
        .unwrap_or_default();

    let mut rows: Vec<(String, IndexMap<String, f64>, f64)> = Vec::new();
    'names: for name in &latest_names {
        let mut per_transition = IndexMap::new();
        for (e1, e2) in &transitions {
            let (Some(s1), Some(s2)) = (by_name[e1].get(*name), by_name[e2].get(*name)) else {
                continue 'names;
            };
            let m1 = merge_families(&s1.proportions, e1, catalog);
            let m2 = merge_families(&s2.proportions, e2, catalog);
            per_transition.insert(format!("{e1}_to_{e2}"), round1(pedersen(&m1, &m2)));
        }
        if per_transition.is_empty() {
            continue;
        }
        let avg = round1(mean(&per_transition.values().copied().collect::<Vec<_>>()));
        rows.push(((*name).to_string(), per_transition, avg));
    }

    rows.sort_by(|a, b| b.2.partial_cmp(&a.2).expect("NaN average").then(a.0.cmp(&b.0)));
    rows.into_iter()
        .enumerate()
        .map(|(i, (name, transitions, average))| {
            (
                name,
                SettlementVolatility {
                    transitions,
                    average,
                    rank: i + 1,
                },
            )
        })
        .collect()
}

/// Absolute votes of a family in one settlement of one election.
fn family_votes(s: &Settlement, election: &ElectionId, catalog: &PartyCatalog, family: &str) -> f64 {
    s.proportions
        .iter()
        .filter(|(code, _)| {
            catalog
                .family_of(code, election)
                .map_or(false, |f| f == family)
        })
        .map(|(_, &pct)| pct / 100.0 * s.voters as f64)
        .sum()
}

/// HHI, effective settlements and cumulative-share thresholds per family,
/// averaged across the elections where the family is declared present.
fn family_concentration(
    settlements: &BTreeMap<ElectionId, Vec<Settlement>>,
    catalog: &PartyCatalog,
) -> BTreeMap<String, FamilyConcentration> {
    let mut families: HashSet<String> = HashSet::new();
    for (eid, list) in settlements {
        for s in list {
            for code in s.proportions.keys() {
                if let Some(f) = catalog.family_of(code, eid) {
                    families.insert(f.clone());
                }
            }
        }
    }

    let mut out = BTreeMap::new();
    for family in families {
        let mut hhis = Vec::new();
        let mut effectives = Vec::new();
        let mut s50 = Vec::new();
        let mut s75 = Vec::new();
        let mut s90 = Vec::new();
        let mut s98 = Vec::new();
        let mut elections = Vec::new();
        let mut top5: Vec<TopSettlement> = Vec::new();

        for (eid, list) in settlements {
            if !catalog.family_elections(&family).contains(eid) {
                continue;
            }
            let mut votes: Vec<(&str, f64)> = list
                .iter()
                .map(|s| (s.name.as_str(), family_votes(s, eid, catalog, &family)))
                .filter(|(_, v)| *v > 0.0)
                .collect();
            let total: f64 = votes.iter().map(|(_, v)| v).sum();
            if total <= 0.0 {
                continue;
            }
            let hhi: f64 = votes.iter().map(|(_, v)| (v / total) * (v / total)).sum();
            hhis.push(hhi);
            effectives.push(1.0 / hhi);
            // Thresholds count settlements descending by absolute votes.
            votes.sort_by(|a, b| b.1.partial_cmp(&a.1).expect("NaN votes"));
            for (frac, bucket) in [
                (0.50, &mut s50),
                (0.75, &mut s75),
                (0.90, &mut s90),
                (0.98, &mut s98),
            ] {
                let mut cum = 0.0;
                let mut count = votes.len();
                for (i, (_, v)) in votes.iter().enumerate() {
                    cum += v;
                    if cum >= frac * total {
                        count = i + 1;
                        break;
                    }
                }
                bucket.push(count as f64);
            }
            elections.push(eid.to_string());
            // Top-5 from the most recent election the family ran in.
            top5 = votes
                .iter()
                .take(5)
                .map(|(name, v)| TopSettlement {
                    name: (*name).to_string(),
                    share: round1(v / total * 100.0),
                })
                .collect();
        }

        if hhis.is_empty() {
            continue;
        }
        out.insert(
            family,
            FamilyConcentration {
                hhi: roundn(mean(&hhis), 4),
                effective_settlements: mean(&effectives).round() as u32,
                thresholds: ConcentrationThresholds {
                    s50: mean(&s50).round() as usize,
                    s75: mean(&s75).round() as usize,
                    s90: mean(&s90).round() as usize,
                    s98: mean(&s98).round() as usize,
                },
                elections,
                top5,
            },
        );
    }
    out
}

/// Cosine similarity over settlement-level absolute-vote vectors, and
/// Pearson correlation over precinct-level proportion vectors, both for
/// the most recent election's major lists.
fn similarity_matrices(
    settlements: &[Settlement],
    table: &BallotTable,
    spec: &ElectionSpec,
) -> (
    BTreeMap<String, BTreeMap<String, f64>>,
    BTreeMap<String, BTreeMap<String, f64>>,
) {
    let codes = &spec.major_parties.symbols;

    // Settlement-level absolute votes per party.
    let vectors: Vec<Vec<f64>> = codes
        .iter()
        .map(|code| {
            settlements
                .iter()
                .map(|s| {
                    s.proportions.get(code).copied().unwrap_or(0.0) / 100.0 * s.voters as f64
                })
                .collect()
        })
        .collect();

    let mut cosine: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
    for (i, a) in codes.iter().enumerate() {
        if vectors[i].iter().sum::<f64>() == 0.0 {
            continue;
        }
        let mut row = BTreeMap::new();
        for (j, b) in codes.iter().enumerate() {
            if i == j || vectors[j].iter().sum::<f64>() == 0.0 {
                continue;
            }
            if let Some(sim) = cosine_similarity(&vectors[i], &vectors[j]) {
                row.insert(b.clone(), roundn(sim, 3));
            }
        }
        if !row.is_empty() {
            cosine.insert(a.clone(), row);
        }
    }

    // Precinct-level proportions per party.
    let precinct_vectors: Vec<Vec<f64>> = codes
        .iter()
        .map(|code| {
            table
                .precincts()
                .filter(|p| p.vote_total() > 0)
                .map(|p| {
                    f64::from(p.votes.get(code).copied().unwrap_or(0))
                        / f64::from(p.vote_total())
                })
                .collect()
        })
        .collect();

    let mut correlations: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
    for (i, a) in codes.iter().enumerate() {
        let mut row = BTreeMap::new();
        for (j, b) in codes.iter().enumerate() {
            if i == j {
                continue;
            }
            if let Some(r) = pearson(&precinct_vectors[i], &precinct_vectors[j]) {
                row.insert(b.clone(), roundn(r, 3));
            }
        }
        if !row.is_empty() {
            correlations.insert(a.clone(), row);
        }
    }

    (cosine, correlations)
}

fn cosine_similarity(a: &[f64], b: &[f64]) -> Option<f64> {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let nb: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 {
        None
    } else {
        Some(dot / (na * nb))
    }
}

fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() || a.len() < 2 {
        return None;
    }
    let ma = mean(a);
    let mb = mean(b);
    let cov: f64 = a.iter().zip(b).map(|(x, y)| (x - ma) * (y - mb)).sum();
    let va: f64 = a.iter().map(|x| (x - ma) * (x - ma)).sum();
    let vb: f64 = b.iter().map(|y| (y - mb) * (y - mb)).sum();
    if va == 0.0 || vb == 0.0 {
        None
    } else {
        Some(cov / (va.sqrt() * vb.sqrt()))
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("NaN"));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ballots::PrecinctRecord;
    use crate::config::MajorParties;
    use std::path::PathBuf;

    fn catalog() -> PartyCatalog {
        PartyCatalog::from_toml(
            r##"
[parties."א"]
name = "אלף"
color = "#111111"

[families]
alef = ["24:א", "25:א"]
bet = ["24:ב", "24:בב", "25:ב"]
"##,
        )
        .unwrap()
    }

    fn spec(id: &str, majors: &[&str]) -> ElectionSpec {
        ElectionSpec {
            id: ElectionId::from(id),
            name: id.to_string(),
            name_en: String::new(),
            date: String::new(),
            file: PathBuf::from("x"),
            encoding: String::new(),
            ballot_field: "קלפי".to_string(),
            precinct_number_divisor: 1,
            eligible_voters: 0,
            votes_cast: 0,
            valid_votes: 0,
            turnout_percent: 0.0,
            major_parties: MajorParties {
                symbols: majors.iter().map(|s| s.to_string()).collect(),
                names: majors.iter().map(|s| s.to_string()).collect(),
                seats: vec![],
            },
        }
    }

    fn precinct(
        settlement: &str,
        code: u32,
        num: &str,
        eligible: u32,
        votes: &[(&str, u32)],
    ) -> PrecinctRecord {
        let votes: IndexMap<String, u32> =
            votes.iter().map(|(c, v)| (c.to_string(), *v)).collect();
        let valid: u32 = votes.values().sum();
        PrecinctRecord {
            settlement_name: settlement.to_string(),
            settlement_code: code,
            precinct_number: num.to_string(),
            eligible,
            voted: valid,
            valid,
            invalid: 0,
            votes,
        }
    }

    fn table(id: &str, parties: &[&str], records: Vec<PrecinctRecord>) -> BallotTable {
        BallotTable::load(
            ElectionId::from(id),
            parties.iter().map(|s| s.to_string()).collect(),
            records,
            1,
        )
    }

    #[test]
    fn settlement_aggregation_weights_by_voters() {
        let t = table(
            "25",
            &["א", "ב"],
            vec![
                precinct("חיפה", 4000, "1", 200, &[("א", 80), ("ב", 20)]),
                precinct("חיפה", 4000, "2", 400, &[("א", 100), ("ב", 200)]),
                precinct("עכו", 7600, "1", 100, &[("א", 50), ("ב", 50)]),
            ],
        );
        let canon = NameCanonicalizer::default();
        let settlements = aggregate_settlements(&t, &canon, None, None);
        assert_eq!(settlements.len(), 2);
        let haifa = &settlements[0];
        assert_eq!(haifa.name, "חיפה");
        assert_eq!(haifa.voters, 400);
        assert_eq!(haifa.ballot_count, 2);
        // א: (80% · 100 + 33.3% · 300) / 400 = 45%
        assert!((haifa.proportions["א"] - 45.0).abs() < 0.2);
        assert_eq!(haifa.winning_party.as_deref(), Some("ב"));
        assert!((haifa.turnout - 66.7).abs() < 0.1);
    }

    #[test]
    fn pedersen_bounds_and_zero_iff_identical() {
        let a = HashMap::from([("x".to_string(), 60.0), ("y".to_string(), 40.0)]);
        let b = HashMap::from([("x".to_string(), 40.0), ("y".to_string(), 60.0)]);
        assert_eq!(pedersen(&a, &a), 0.0);
        let v = pedersen(&a, &b);
        assert!((v - 20.0).abs() < 1e-9);
        // Complete replacement caps at 100.
        let c = HashMap::from([("z".to_string(), 100.0)]);
        assert!((pedersen(&a, &c) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn family_merge_neutralizes_a_rename() {
        let cat = catalog();
        // ב ran as two lists in 24 and reunited in 25; merged vectors are
        // identical so volatility must be zero.
        let p24 = IndexMap::from([
            ("ב".to_string(), 30.0),
            ("בב".to_string(), 20.0),
            ("א".to_string(), 50.0),
        ]);
        let p25 = IndexMap::from([("ב".to_string(), 50.0), ("א".to_string(), 50.0)]);
        let m24 = merge_families(&p24, &ElectionId::from("24"), &cat);
        let m25 = merge_families(&p25, &ElectionId::from("25"), &cat);
        assert_eq!(pedersen(&m24, &m25), 0.0);
    }

    #[test]
    fn volatility_requires_full_history_and_current_voters() {
        let cat = catalog();
        let canon = NameCanonicalizer::default();
        let mut tables = BTreeMap::new();
        tables.insert(
            ElectionId::from("24"),
            table(
                "24",
                &["א", "ב"],
                vec![
                    precinct("חיפה", 4000, "1", 200, &[("א", 60), ("ב", 40)]),
                    precinct("עכו", 7600, "1", 100, &[("א", 50), ("ב", 50)]),
                ],
            ),
        );
        tables.insert(
            ElectionId::from("25"),
            table(
                "25",
                &["א", "ב"],
                vec![
                    precinct("חיפה", 4000, "1", 200, &[("א", 40), ("ב", 60)]),
                    // עכו missing in 25: must not report.
                    precinct("יבנה", 2660, "1", 100, &[("א", 50), ("ב", 50)]),
                ],
            ),
        );
        let mut specs = BTreeMap::new();
        specs.insert(ElectionId::from("24"), spec("24", &["א", "ב"]));
        specs.insert(ElectionId::from("25"), spec("25", &["א", "ב"]));

        let report = compute_metrics(&tables, &specs, &cat, &canon, None, None).unwrap();
        assert!(report.settlement_pedersen.contains_key("חיפה"));
        assert!(!report.settlement_pedersen.contains_key("עכו"));
        // יבנה exists only in 25; the 24→25 transition is unavailable.
        assert!(!report.settlement_pedersen.contains_key("יבנה"));
        let haifa = &report.settlement_pedersen["חיפה"];
        assert!((haifa.transitions["24_to_25"] - 20.0).abs() < 0.11);
        assert_eq!(haifa.rank, 1);
        for v in report.settlement_pedersen.values() {
            assert!(v.average >= 0.0 && v.average <= 100.0);
        }
    }

    #[test]
    fn hhi_is_one_for_a_single_settlement_party() {
        let cat = catalog();
        let canon = NameCanonicalizer::default();
        let mut tables = BTreeMap::new();
        tables.insert(
            ElectionId::from("25"),
            table(
                "25",
                &["א", "ב"],
                vec![
                    // א votes exist only in חיפה.
                    precinct("חיפה", 4000, "1", 200, &[("א", 100), ("ב", 100)]),
                    precinct("עכו", 7600, "1", 100, &[("א", 0), ("ב", 100)]),
                ],
            ),
        );
        let mut specs = BTreeMap::new();
        specs.insert(ElectionId::from("25"), spec("25", &["א", "ב"]));

        let report = compute_metrics(&tables, &specs, &cat, &canon, None, None).unwrap();
        let alef = &report.family_hhi["alef"];
        assert_eq!(alef.hhi, 1.0);
        assert_eq!(alef.effective_settlements, 1);
        assert_eq!(alef.thresholds.s50, 1);
        assert_eq!(alef.thresholds.s98, 1);
        assert_eq!(alef.top5[0].name, "חיפה");
        // HHI is a probability mass concentration: always in (0, 1].
        for fam in report.family_hhi.values() {
            assert!(fam.hhi > 0.0 && fam.hhi <= 1.0);
        }
    }

    #[test]
    fn similarity_matrices_have_sane_ranges() {
        let canon = NameCanonicalizer::default();
        let records = vec![
            precinct("חיפה", 4000, "1", 200, &[("א", 90), ("ב", 10)]),
            precinct("חיפה", 4000, "2", 200, &[("א", 80), ("ב", 20)]),
            precinct("עכו", 7600, "1", 100, &[("א", 10), ("ב", 90)]),
            precinct("עכו", 7600, "2", 100, &[("א", 20), ("ב", 80)]),
        ];
        let t = table("25", &["א", "ב"], records);
        let settlements = aggregate_settlements(&t, &canon, None, None);
        let (cosine, corr) = similarity_matrices(&settlements, &t, &spec("25", &["א", "ב"]));
        let ab = cosine["א"]["ב"];
        assert!((-1.0..=1.0).contains(&ab));
        // Two-party proportions are perfectly anticorrelated.
        let r = corr["א"]["ב"];
        assert!((r + 1.0).abs() < 1e-6);
    }
}
