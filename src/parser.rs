//! Binding to the ballot-feed collaborator: official per-precinct CSV
//! files in (or out of) the publisher's schema.
//!
//! The feed carries a handful of bookkeeping columns followed by one
//! integer column per party list. Which header holds the precinct number
//! varies by election, so the caller supplies a column dictionary.
//! Encoding discovery belongs to the download side; feeds are expected
//! here already transcoded to UTF-8 (the BOM variant is fine, the `csv`
//! crate strips it).

use color_eyre::eyre::{Context, ContextCompat, Result};
use indexmap::IndexMap;
use regex::Regex;
use std::collections::HashSet;
use std::fs::create_dir_all;
use std::path::Path;
use tracing::{info, trace, warn};

use crate::ballots::{BallotTable, PrecinctRecord};
use crate::utils::{open_csvz_from_path, parse_count};

/// Which feed header holds which logical field.
#[derive(Clone, Debug)]
pub struct ColumnDictionary {
    pub settlement_name: String,
    pub settlement_code: String,
    pub precinct_number: String,
    pub eligible: String,
    pub voted: String,
    pub invalid: String,
    pub valid: String,
}

impl ColumnDictionary {
    /// The publisher's usual headers; only the precinct-number column
    /// moves around between elections.
    pub fn with_ballot_field(ballot_field: &str) -> Self {
        ColumnDictionary {
            settlement_name: "שם ישוב".to_string(),
            settlement_code: "סמל ישוב".to_string(),
            precinct_number: ballot_field.to_string(),
            eligible: "בזב".to_string(),
            voted: "מצביעים".to_string(),
            invalid: "פסולים".to_string(),
            valid: "כשרים".to_string(),
        }
    }
}

/// Bookkeeping headers that are never party columns, under every name the
/// publisher has used for them.
const NON_PARTY_COLUMNS: [&str; 13] = [
    "סמל ועדה",
    "סמל_ועדה",
    "ברזל",
    "שם ישוב",
    "סמל ישוב",
    "קלפי",
    "מספר קלפי",
    "ריכוז",
    "שופט",
    "בזב",
    "מצביעים",
    "פסולים",
    "כשרים",
];

/// Read one feed into a ballot table.
///
/// Every header that is not a known bookkeeping column is taken as a party
/// column, in feed order.
pub fn read_feed(
    path: &Path,
    columns: &ColumnDictionary,
    table_of: impl FnOnce(Vec<String>, Vec<PrecinctRecord>) -> BallotTable,
) -> Result<BallotTable> {
    info!("\tLoading precinct feed {}", path.display());

    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(open_csvz_from_path(path)?);

    let headers = rdr.headers()?.clone();
    trace!("feed headers: {:?}", headers);

    let col = |name: &str| -> Result<usize> {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .with_context(|| format!("feed {} has no column {name}", path.display()))
    };

    let c_name = col(&columns.settlement_name)?;
    let c_code = col(&columns.settlement_code)?;
    let c_number = col(&columns.precinct_number)?;
    let c_eligible = col(&columns.eligible)?;
    let c_voted = col(&columns.voted)?;
    let c_invalid = col(&columns.invalid)?;
    let c_valid = col(&columns.valid)?;

    // Party symbols are one to four Hebrew letters; anything else among
    // the non-bookkeeping headers is upstream junk.
    let symbol_re = Regex::new("^[א-ת]{1,4}$").expect("static regex");
    let excluded: HashSet<&str> = NON_PARTY_COLUMNS.iter().copied().collect();
    let mut junk: Vec<String> = Vec::new();
    let party_cols: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| (i, h.trim()))
        .filter(|(_, h)| !excluded.contains(h))
        .filter(|(_, h)| {
            if symbol_re.is_match(h) {
                true
            } else {
                junk.push((*h).to_string());
                false
            }
        })
        .map(|(i, h)| (i, h.to_string()))
        .collect();
    if !junk.is_empty() {
        warn!("ignoring non-party feed columns: {}", junk.join(", "));
    }
    let parties: Vec<String> = party_cols.iter().map(|(_, h)| h.clone()).collect();

    let mut records: Vec<PrecinctRecord> = Vec::new();
    let mut row = csv::StringRecord::new();
    while rdr.read_record(&mut row)? {
        let votes: IndexMap<String, u32> = party_cols
            .iter()
            .map(|(i, code)| (code.clone(), row.get(*i).map(parse_count).unwrap_or(0)))
            .collect();
        records.push(PrecinctRecord {
            settlement_name: row.get(c_name).unwrap_or("").trim().to_string(),
            settlement_code: row.get(c_code).map(parse_count).unwrap_or(0),
            precinct_number: row.get(c_number).unwrap_or("").trim().to_string(),
            eligible: row.get(c_eligible).map(parse_count).unwrap_or(0),
            voted: row.get(c_voted).map(parse_count).unwrap_or(0),
            invalid: row.get(c_invalid).map(parse_count).unwrap_or(0),
            valid: row.get(c_valid).map(parse_count).unwrap_or(0),
            votes,
        });
    }

    info!("\t\tLoaded {} precinct rows", records.len());
    Ok(table_of(parties, records))
}

/// Write a table back out in the feed schema, so a synthetic election can
/// re-enter the pipeline exactly like a published one.
pub fn write_feed(table: &BallotTable, path: &Path, columns: &ColumnDictionary) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            create_dir_all(parent)
                .with_context(|| format!("{} has no usable parent", path.display()))?;
        }
    }
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)?;

    let mut header: Vec<String> = vec![
        columns.settlement_name.clone(),
        columns.settlement_code.clone(),
        columns.precinct_number.clone(),
        columns.eligible.clone(),
        columns.voted.clone(),
        columns.invalid.clone(),
        columns.valid.clone(),
    ];
    header.extend(table.parties.iter().cloned());
    wtr.write_record(&header).context("error writing feed header")?;

    for p in table.precincts() {
        let mut out: Vec<String> = vec![
            p.settlement_name.clone(),
            p.id.settlement_code.to_string(),
            p.id.number.clone(),
            p.eligible.to_string(),
            p.voted.to_string(),
            p.invalid.to_string(),
            p.valid.to_string(),
        ];
        for code in &table.parties {
            out.push(p.votes.get(code).copied().unwrap_or(0).to_string());
        }
        wtr.write_record(&out).context("error writing feed row")?;
    }
    wtr.flush().context("error finalising feed")?;
    Ok(())
}
