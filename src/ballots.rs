//! Precinct-level ballot tables and the canonical precinct identity.
//!
//! Everything downstream (the transfer solver, the simulator, the
//! irregularity scorer, the aggregation layer) consumes these tables; all
//! of it relies on precinct iteration being insertion order and on party
//! columns staying in declared feed order. Never sort either.

use color_eyre::eyre::Result;
use indexmap::IndexMap;
use ndarray::{Array1, Array2};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::warn;

use crate::utils::CoreError;

/// Settlement code the publisher uses for externally-aggregated envelopes.
/// Those rows are not precincts and are always dropped.
const EXTERNAL_ENVELOPES: u32 = 9999;

/// An opaque short election identifier ("16" through "26" historically).
///
/// Ordered numerically where possible so that consecutive pairs can be
/// derived from a declared list.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElectionId(String);

impl ElectionId {
    pub fn new(id: impl Into<String>) -> Self {
        ElectionId(id.into())
    }
}

impl fmt::Display for ElectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for ElectionId {
    fn from(s: &str) -> Self {
        ElectionId(s.to_string())
    }
}

impl PartialOrd for ElectionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ElectionId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0.parse::<u32>(), other.0.parse::<u32>()) {
            // The string tiebreak keeps the ordering consistent with Eq
            // for ids like "07" versus "7".
            (Ok(a), Ok(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            _ => self.0.cmp(&other.0),
        }
    }
}

/// Canonical precinct key: settlement code plus canonical precinct number.
///
/// Equality and ordering are defined here, never on raw feed strings.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrecinctId {
    pub settlement_code: u32,
    pub number: String,
}

impl PrecinctId {
    pub fn new(settlement_code: u32, number: impl Into<String>) -> Self {
        PrecinctId {
            settlement_code,
            number: number.into(),
        }
    }
}

impl fmt::Display for PrecinctId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}__{}", self.settlement_code, self.number)
    }
}

/// One raw precinct record as emitted by the ballot parser.
/// `precinct_number` is still in feed form here; `load` canonicalizes.
#[derive(Clone, Debug)]
pub struct PrecinctRecord {
    pub settlement_name: String,
    pub settlement_code: u32,
    pub precinct_number: String,
    pub eligible: u32,
    pub voted: u32,
    pub valid: u32,
    pub invalid: u32,
    /// Party votes in feed column order.
    pub votes: IndexMap<String, u32>,
}

/// One precinct row of a loaded table, keyed canonically.
#[derive(Clone, Debug)]
pub struct Precinct {
    pub id: PrecinctId,
    pub settlement_name: String,
    pub eligible: u32,
    pub voted: u32,
    pub valid: u32,
    pub invalid: u32,
    pub votes: IndexMap<String, u32>,
}

impl Precinct {
    /// Total party votes in this precinct.
    pub fn vote_total(&self) -> u32 {
        self.votes.values().sum()
    }
}

/// The full per-precinct table of counted votes for one election.
pub struct BallotTable {
    pub election: ElectionId,
    /// Party columns in feed order.
    pub parties: Vec<String>,
    precincts: Vec<Precinct>,
    index: HashMap<PrecinctId, usize>,
    /// Canonical ids whose raw precinct number carried an explicit `.0`
    /// suffix; the pairing fallback needs to know about these siblings.
    zero_suffixed: HashSet<PrecinctId>,
    /// Duplicate canonical ids dropped at load (first occurrence wins).
    pub duplicates_dropped: usize,
}

/// Canonical form of a feed precinct number.
///
/// Trailing `.0` is stripped; when the election declares a divisor d > 1
/// (the historical publisher numbered precincts in multiples of ten) an
/// integer value divisible by d is divided by it.
pub fn canonical_number(raw: &str, divisor: u32) -> String {
    let mut b = raw.trim().to_string();
    if let Some(stripped) = b.strip_suffix(".0") {
        b = stripped.to_string();
    }
    if divisor > 1 {
        if let Ok(n) = b.parse::<u64>() {
            if n % u64::from(divisor) == 0 {
                b = (n / u64::from(divisor)).to_string();
            }
        }
    }
    b
}

impl BallotTable {
    /// Build a table from parsed precinct records.
    ///
    /// Rows with the external-envelope settlement code are dropped, ids
    /// are canonicalized, and duplicate canonical ids are reduced to their
    /// first occurrence (a known publisher bug in historical feeds).
    pub fn load(
        election: ElectionId,
        parties: Vec<String>,
        records: Vec<PrecinctRecord>,
        precinct_number_divisor: u32,
    ) -> Self {
        let mut precincts: Vec<Precinct> = Vec::with_capacity(records.len());
        let mut index: HashMap<PrecinctId, usize> = HashMap::with_capacity(records.len());
        let mut zero_suffixed: HashSet<PrecinctId> = HashSet::new();
        let mut duplicates_dropped = 0_usize;

        for rec in records {
            if rec.settlement_code == EXTERNAL_ENVELOPES {
                continue;
            }
            let number = canonical_number(&rec.precinct_number, precinct_number_divisor);
            let id = PrecinctId::new(rec.settlement_code, number);
            if index.contains_key(&id) {
                duplicates_dropped += 1;
                continue;
            }
            if rec.precinct_number.trim().ends_with(".0") {
                zero_suffixed.insert(id.clone());
            }
            index.insert(id.clone(), precincts.len());
            precincts.push(Precinct {
                id,
                settlement_name: rec.settlement_name,
                eligible: rec.eligible,
                voted: rec.voted,
                valid: rec.valid,
                invalid: rec.invalid,
                votes: rec.votes,
            });
        }

        if duplicates_dropped > 0 {
            warn!(
                "removed {} duplicate precinct ids from election {}",
                duplicates_dropped, election
            );
        }

        BallotTable {
            election,
            parties,
            precincts,
            index,
            zero_suffixed,
            duplicates_dropped,
        }
    }

    pub fn len(&self) -> usize {
        self.precincts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.precincts.is_empty()
    }

    /// Precincts in insertion order.
    pub fn precincts(&self) -> impl Iterator<Item = &Precinct> {
        self.precincts.iter()
    }

    pub fn get(&self, id: &PrecinctId) -> Option<&Precinct> {
        self.index.get(id).map(|&i| &self.precincts[i])
    }

    pub fn contains(&self, id: &PrecinctId) -> bool {
        self.index.contains_key(id)
    }

    /// Error out on a table with zero rows; everything downstream needs
    /// at least one precinct.
    pub fn require_nonempty(&self) -> Result<(), CoreError> {
        if self.precincts.is_empty() {
            Err(CoreError::InputEmpty(format!(
                "ballot table for election {} has no precincts",
                self.election
            )))
        } else {
            Ok(())
        }
    }

    /// The precincts-by-parties count matrix with columns in the given
    /// order, zero-filling absent parties.
    pub fn matrix(&self, ordered_parties: &[String]) -> Array2<f64> {
        let mut m = Array2::<f64>::zeros((self.precincts.len(), ordered_parties.len()));
        for (r, p) in self.precincts.iter().enumerate() {
            for (c, code) in ordered_parties.iter().enumerate() {
                if let Some(&v) = p.votes.get(code) {
                    m[[r, c]] = f64::from(v);
                }
            }
        }
        m
    }

    /// Like [`matrix`](Self::matrix) but over an explicit row selection
    /// (the matched-pair subset the solver consumes).
    pub fn rows_matrix(&self, ids: &[PrecinctId], ordered_parties: &[String]) -> Array2<f64> {
        let mut m = Array2::<f64>::zeros((ids.len(), ordered_parties.len()));
        for (r, id) in ids.iter().enumerate() {
            if let Some(p) = self.get(id) {
                for (c, code) in ordered_parties.iter().enumerate() {
                    if let Some(&v) = p.votes.get(code) {
                        m[[r, c]] = f64::from(v);
                    }
                }
            }
        }
        m
    }

    /// National per-party totals over ALL precincts of this table, in the
    /// given column order. Flow reporting uses these, not the matched
    /// subset.
    pub fn national_totals(&self, ordered_parties: &[String]) -> Array1<f64> {
        let mut t = Array1::<f64>::zeros(ordered_parties.len());
        for p in &self.precincts {
            for (c, code) in ordered_parties.iter().enumerate() {
                if let Some(&v) = p.votes.get(code) {
                    t[c] += f64::from(v);
                }
            }
        }
        t
    }

    /// Keep only the declared party columns that are actually present in
    /// the feed, warning about the rest (they are treated as all-zero by
    /// the matrix extractors anyway).
    pub fn present_parties(&self, declared: &[String]) -> Vec<String> {
        let have: HashSet<&String> = self.parties.iter().collect();
        let (present, missing): (Vec<String>, Vec<String>) = declared
            .iter()
            .cloned()
            .partition(|code| have.contains(code));
        if !missing.is_empty() {
            warn!(
                "election {}: missing party columns: {}",
                self.election,
                missing.join(", ")
            );
        }
        present
    }

    /// Rename party columns (publisher symbol changes between elections).
    pub fn remap_parties(&mut self, remap: &HashMap<String, String>) {
        if remap.is_empty() {
            return;
        }
        self.parties = self
            .parties
            .iter()
            .map(|c| remap.get(c).unwrap_or(c).clone())
            .collect();
        for p in &mut self.precincts {
            p.votes = p
                .votes
                .iter()
                .map(|(c, v)| (remap.get(c).unwrap_or(c).clone(), *v))
                .collect();
        }
    }
}

/// Produce the ordered list of paired precincts consumed by the transfer
/// solver.
///
/// Rules, in order:
/// 1. Exact canonical match between E1 and E2.
/// 2. An E2 id suffixed exactly `.1` may fall back to its stripped base
///    when E2 has no `.0` sibling of that base and E1 contains the base.
///    This captures publisher splits where an unsubdivided E1 precinct
///    became a `.1/.2/...` chain with no explicit `.0`.
/// 3. Otherwise unmatched. Suffixes other than `.1` never fall back.
pub fn match_precincts(e1: &BallotTable, e2: &BallotTable) -> Vec<(PrecinctId, PrecinctId)> {
    let mut pairs: Vec<(PrecinctId, PrecinctId)> = Vec::with_capacity(e2.len());

    for p in e2.precincts() {
        let to_id = &p.id;
        if e1.contains(to_id) {
            pairs.push((to_id.clone(), to_id.clone()));
        } else if let Some(base) = to_id.number.strip_suffix(".1") {
            let base_id = PrecinctId::new(to_id.settlement_code, base);
            if !e2.zero_suffixed.contains(&base_id) && e1.contains(&base_id) {
                pairs.push((base_id, to_id.clone()));
            }
        }
    }

    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(code: u32, number: &str, votes: &[(&str, u32)]) -> PrecinctRecord {
        let votes: IndexMap<String, u32> = votes
            .iter()
            .map(|(c, v)| ((*c).to_string(), *v))
            .collect();
        let valid = votes.values().sum();
        PrecinctRecord {
            settlement_name: format!("ישוב {code}"),
            settlement_code: code,
            precinct_number: number.to_string(),
            eligible: 0,
            voted: valid,
            valid,
            invalid: 0,
            votes,
        }
    }

    fn table(election: &str, divisor: u32, recs: Vec<PrecinctRecord>) -> BallotTable {
        BallotTable::load(
            ElectionId::from(election),
            vec!["א".to_string(), "ב".to_string()],
            recs,
            divisor,
        )
    }

    #[test]
    fn canonical_number_strips_and_divides() {
        assert_eq!(canonical_number("3.0", 1), "3");
        assert_eq!(canonical_number("3.1", 1), "3.1");
        assert_eq!(canonical_number("30", 10), "3");
        assert_eq!(canonical_number("35", 10), "35");
        assert_eq!(canonical_number("30.0", 10), "3");
    }

    #[test]
    fn load_drops_envelopes_and_duplicates() {
        let t = table(
            "25",
            1,
            vec![
                rec(100, "1", &[("א", 10)]),
                rec(9999, "1", &[("א", 99)]),
                rec(100, "1.0", &[("א", 20)]), // duplicate of 100__1
                rec(100, "2", &[("א", 30)]),
            ],
        );
        assert_eq!(t.len(), 2);
        assert_eq!(t.duplicates_dropped, 1);
        // First occurrence wins.
        assert_eq!(t.get(&PrecinctId::new(100, "1")).unwrap().votes["א"], 10);
    }

    #[test]
    fn exact_match_and_dot_one_fallback() {
        let e1 = table("24", 1, vec![rec(100, "5", &[("א", 10)])]);
        let e2 = table("25", 1, vec![rec(100, "5.1", &[("א", 12)])]);
        let pairs = match_precincts(&e1, &e2);
        assert_eq!(
            pairs,
            vec![(PrecinctId::new(100, "5"), PrecinctId::new(100, "5.1"))]
        );
    }

    #[test]
    fn dot_two_never_falls_back() {
        // The older any-suffix fallback was a bug; only `.1` may pair.
        let e1 = table("24", 1, vec![rec(100, "5", &[("א", 10)])]);
        let e2 = table("25", 1, vec![rec(100, "5.2", &[("א", 12)])]);
        assert!(match_precincts(&e1, &e2).is_empty());
    }

    #[test]
    fn zero_sibling_blocks_fallback() {
        let e1 = table("24", 1, vec![rec(100, "5", &[("א", 10)])]);
        // E2 carries an explicit 5.0 (canonicalized to 5) next to 5.1: the
        // base is taken by the exact match and 5.1 must stay unmatched.
        let e2 = table(
            "25",
            1,
            vec![rec(100, "5.0", &[("א", 7)]), rec(100, "5.1", &[("א", 12)])],
        );
        let pairs = match_precincts(&e1, &e2);
        assert_eq!(
            pairs,
            vec![(PrecinctId::new(100, "5"), PrecinctId::new(100, "5"))]
        );
    }

    #[test]
    fn no_e2_precinct_pairs_twice() {
        let e1 = table(
            "24",
            1,
            vec![rec(100, "1", &[("א", 1)]), rec(100, "1.1", &[("א", 2)])],
        );
        let e2 = table(
            "25",
            1,
            vec![rec(100, "1", &[("א", 3)]), rec(100, "1.1", &[("א", 4)])],
        );
        let pairs = match_precincts(&e1, &e2);
        let mut seen = HashSet::new();
        for (_, to) in &pairs {
            assert!(seen.insert(to.clone()), "{to} paired twice");
        }
        assert_eq!(pairs.len(), 2);
    }

    #[test]
    fn matrix_zero_fills_absent_columns() {
        let t = table("25", 1, vec![rec(100, "1", &[("א", 10), ("ב", 5)])]);
        let m = t.matrix(&["ב".to_string(), "ג".to_string()]);
        assert_eq!(m[[0, 0]], 5.0);
        assert_eq!(m[[0, 1]], 0.0);
    }

    #[test]
    fn election_ids_order_numerically() {
        assert!(ElectionId::from("9") < ElectionId::from("16"));
        assert!(ElectionId::from("25") < ElectionId::from("26"));
    }
}
