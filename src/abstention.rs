//! The "did not vote" pseudo-party.
//!
//! Treating non-voters as a virtual list makes turnout changes visible as
//! transfers to and from that list. The augmenter appends exactly one
//! column to each side of the solver input.

use indexmap::IndexMap;
use tracing::warn;

use crate::ballots::{BallotTable, PrecinctId};

/// Symbol carried on both axes of an augmented transfer matrix.
pub const ABSTAIN_CODE: &str = "abstain";
/// Display name of the pseudo-party.
pub const ABSTAIN_NAME: &str = "לא הצביעו";
/// Display color of the pseudo-party.
pub const ABSTAIN_COLOR: &str = "#9ca3af";

/// Per-precinct abstention counts for one election.
pub struct AbstentionColumn {
    values: IndexMap<PrecinctId, f64>,
    /// National total over ALL precincts, for flow reporting.
    pub national: f64,
    /// True when the eligible column was empty and a national estimate
    /// stood in for it.
    pub estimated: bool,
}

impl AbstentionColumn {
    /// Compute `max(0, eligible − voted)` per precinct.
    ///
    /// When the feed's eligible column is entirely empty (a known gap in
    /// one historical feed), per-precinct eligible is estimated as
    /// `round(voted / total_voted · national_eligible)` from the declared
    /// national figure. With no national figure either, the column is
    /// all-zero and a warning is surfaced; downstream turnout checks for
    /// that election are expected to be suppressed.
    pub fn compute(table: &BallotTable, national_eligible: u32) -> Self {
        let eligible_total: u64 = table.precincts().map(|p| u64::from(p.eligible)).sum();

        if eligible_total > 0 {
            let values: IndexMap<PrecinctId, f64> = table
                .precincts()
                .map(|p| {
                    (
                        p.id.clone(),
                        f64::from(p.eligible.saturating_sub(p.voted)),
                    )
                })
                .collect();
            let national = values.values().sum();
            return AbstentionColumn {
                values,
                national,
                estimated: false,
            };
        }

        let total_voted: u64 = table.precincts().map(|p| u64::from(p.voted)).sum();
        if national_eligible == 0 || total_voted == 0 {
            warn!(
                "election {}: no eligible-voter data available, abstention will be 0",
                table.election
            );
            let values = table.precincts().map(|p| (p.id.clone(), 0.0)).collect();
            return AbstentionColumn {
                values,
                national: 0.0,
                estimated: true,
            };
        }

        warn!(
            "election {}: eligible column empty, estimating from national eligible={}",
            table.election, national_eligible
        );
        let values: IndexMap<PrecinctId, f64> = table
            .precincts()
            .map(|p| {
                let est = (f64::from(p.voted) / total_voted as f64
                    * f64::from(national_eligible))
                .round();
                (p.id.clone(), (est - f64::from(p.voted)).max(0.0))
            })
            .collect();
        let national = values.values().sum();
        AbstentionColumn {
            values,
            national,
            estimated: true,
        }
    }

    /// Values in the order of a matched-precinct selection.
    pub fn values_for(&self, ids: &[PrecinctId]) -> Vec<f64> {
        ids.iter()
            .map(|id| self.values.get(id).copied().unwrap_or(0.0))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ballots::{ElectionId, PrecinctRecord};
    use indexmap::IndexMap;

    fn table(rows: &[(u32, &str, u32, u32)]) -> BallotTable {
        let records = rows
            .iter()
            .map(|(code, num, eligible, voted)| PrecinctRecord {
                settlement_name: "עיר".to_string(),
                settlement_code: *code,
                precinct_number: (*num).to_string(),
                eligible: *eligible,
                voted: *voted,
                valid: *voted,
                invalid: 0,
                votes: IndexMap::from([("מחל".to_string(), *voted)]),
            })
            .collect();
        BallotTable::load(
            ElectionId::from("25"),
            vec!["מחל".to_string()],
            records,
            1,
        )
    }

    #[test]
    fn direct_computation_clips_at_zero() {
        let t = table(&[(100, "1", 200, 150), (100, "2", 100, 120)]);
        let a = AbstentionColumn::compute(&t, 0);
        assert!(!a.estimated);
        let v = a.values_for(&[
            PrecinctId::new(100, "1"),
            PrecinctId::new(100, "2"),
        ]);
        assert_eq!(v, vec![50.0, 0.0]);
        assert_eq!(a.national, 50.0);
    }

    #[test]
    fn national_estimate_when_eligible_missing() {
        let t = table(&[(100, "1", 0, 100), (100, "2", 0, 300)]);
        let a = AbstentionColumn::compute(&t, 800);
        assert!(a.estimated);
        // Eligible distributes 200/600 per precinct.
        let v = a.values_for(&[
            PrecinctId::new(100, "1"),
            PrecinctId::new(100, "2"),
        ]);
        assert_eq!(v, vec![100.0, 300.0]);
    }

    #[test]
    fn all_zero_without_any_figures() {
        let t = table(&[(100, "1", 0, 100)]);
        let a = AbstentionColumn::compute(&t, 0);
        assert!(a.estimated);
        assert_eq!(a.national, 0.0);
    }
}
