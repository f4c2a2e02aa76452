//! Generation and loading of configuration files.
//!
//! The configuration declares every election (feed path, column names,
//! national totals, major-party list) plus the option tables for the
//! transfer solver, the irregularity scorer, the simulator and the
//! aggregation layer. A special `[DEFAULT]` table supplies fallbacks for
//! per-election keys (encoding, ballot field and friends are the same for
//! most elections).

use crate::ballots::ElectionId;
use crate::term::{BOLD, END};
use crate::utils::CoreError;
use color_eyre::eyre::{bail, Context, ContextCompat, Result};
use itertools::Itertools;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::read_to_string;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tabwriter::TabWriter;
use toml_edit::{Document, Item, TableLike};

/// Does what it says on the tin (or at least, the function signature).
pub fn get_cfg_doc_from_path(cfgpath: &Path) -> Result<Document> {
    read_to_string(cfgpath)
        .context("Config file could not be read")?
        .parse::<Document>()
        .context("Config file could not be parsed")
}

/// The major-party block of one election: symbols, display names and seat
/// counts, in official result order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MajorParties {
    pub symbols: Vec<String>,
    pub names: Vec<String>,
    pub seats: Vec<u32>,
}

impl MajorParties {
    pub fn seats_for(&self, idx: usize) -> Option<u32> {
        self.seats.get(idx).copied()
    }

    pub fn contains(&self, code: &str) -> bool {
        self.symbols.iter().any(|s| s == code)
    }
}

/// Everything declared about one election.
#[derive(Clone, Debug)]
pub struct ElectionSpec {
    pub id: ElectionId,
    pub name: String,
    pub name_en: String,
    pub date: String,
    pub file: PathBuf,
    /// Recorded for provenance; feeds are expected transcoded to UTF-8.
    pub encoding: String,
    /// Feed column carrying the precinct number.
    pub ballot_field: String,
    pub precinct_number_divisor: u32,
    /// National figures from the official results page; 0 when unknown.
    pub eligible_voters: u32,
    pub votes_cast: u32,
    pub valid_votes: u32,
    pub turnout_percent: f64,
    pub major_parties: MajorParties,
}

/// Transfer solver method.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Convex,
    Nnls,
    ClosedForm,
}

impl FromStr for Method {
    type Err = color_eyre::eyre::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "convex" => Ok(Method::Convex),
            "nnls" => Ok(Method::Nnls),
            "closed_form" => Ok(Method::ClosedForm),
            other => bail!("unknown transfer method: {other}"),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Method::Convex => "convex",
            Method::Nnls => "nnls",
            Method::ClosedForm => "closed_form",
        };
        s.fmt(f)
    }
}

#[derive(Clone, Debug)]
pub struct TransferOptions {
    pub method: Method,
    /// Flows below this many votes are dropped from the exported flow
    /// list. Export-stage only: stats always use unsuppressed flows.
    pub min_flow_threshold: u32,
    pub include_abstention: bool,
    pub max_iterations: usize,
}

impl Default for TransferOptions {
    fn default() -> Self {
        TransferOptions {
            method: Method::Convex,
            min_flow_threshold: 5000,
            include_abstention: false,
            max_iterations: 20_000,
        }
    }
}

#[derive(Clone, Debug)]
pub struct IrregularityOptions {
    pub min_valid: u32,
    pub min_score: f64,
    pub top_n: usize,
}

impl Default for IrregularityOptions {
    fn default() -> Self {
        IrregularityOptions {
            min_valid: 50,
            min_score: 8.0,
            top_n: 100,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SimulatorOptions {
    pub alpha: f64,
    pub seed: u64,
}

impl Default for SimulatorOptions {
    fn default() -> Self {
        SimulatorOptions {
            alpha: 55.0,
            seed: 42,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct AggregationOptions {
    /// Additive settlement-name overrides on top of the built-in table.
    pub name_overrides: HashMap<String, String>,
}

/// Get all the election declarations, with defaults suitably propagated.
pub fn get_elections(cfg: &Document) -> Result<BTreeMap<ElectionId, ElectionSpec>> {
    let mut out: BTreeMap<ElectionId, ElectionSpec> = BTreeMap::new();
    let cfg = cfg.as_table();

    // We pop the contents of [DEFAULT] into a HashMap to avoid existence failure
    let mut defaults: HashMap<&str, &Item> = HashMap::new();
    if let Some(d) = cfg.get("DEFAULT").and_then(Item::as_table) {
        for (key, item) in d {
            defaults.insert(key, item);
        }
    }

    let elections = cfg
        .get("elections")
        .and_then(Item::as_table)
        .context("Missing [elections] tables")?;

    for (eid, raw) in elections {
        let spec: &dyn TableLike = raw
            .as_table_like()
            .with_context(|| format!("Election {eid} is not a table"))?;

        /// Much of the per-key logic abstracts out into this...
        fn get_attribute<'a, T, F>(
            key: &'a str,
            spec: &'a dyn TableLike,
            defaults: &'a HashMap<&str, &Item>,
            conversion_fn: F,
        ) -> Option<T>
        where
            F: FnOnce(&'a str) -> T,
        {
            spec.get(key)
                .or_else(|| defaults.get(key).copied())
                .and_then(Item::as_str)
                .map(conversion_fn)
        }

        fn get_int(key: &str, spec: &dyn TableLike, defaults: &HashMap<&str, &Item>) -> Option<i64> {
            spec.get(key)
                .or_else(|| defaults.get(key).copied())
                .and_then(Item::as_integer)
        }

        fn get_float(
            key: &str,
            spec: &dyn TableLike,
            defaults: &HashMap<&str, &Item>,
        ) -> Option<f64> {
            spec.get(key)
                .or_else(|| defaults.get(key).copied())
                .and_then(|i| i.as_float().or_else(|| i.as_integer().map(|n| n as f64)))
        }

        let name = get_attribute("name", spec, &defaults, String::from)
            .with_context(|| format!("Election {eid}: missing name"))?;
        let name_en = get_attribute("name_en", spec, &defaults, String::from).unwrap_or_default();
        let date = get_attribute("date", spec, &defaults, String::from)
            .with_context(|| format!("Election {eid}: missing date"))?;
        let file = get_attribute("file", spec, &defaults, PathBuf::from)
            .with_context(|| format!("Election {eid}: missing file"))?;
        let encoding = get_attribute("encoding", spec, &defaults, String::from)
            .unwrap_or_else(|| String::from("utf-8-sig"));
        let ballot_field = get_attribute("ballot_field", spec, &defaults, String::from)
            .unwrap_or_else(|| String::from("קלפי"));
        let precinct_number_divisor =
            get_int("precinct_number_divisor", spec, &defaults).unwrap_or(1) as u32;
        let eligible_voters = get_int("eligible_voters", spec, &defaults).unwrap_or(0) as u32;
        let votes_cast = get_int("votes_cast", spec, &defaults).unwrap_or(0) as u32;
        let valid_votes = get_int("valid_votes", spec, &defaults).unwrap_or(0) as u32;
        let turnout_percent = get_float("turnout_percent", spec, &defaults).unwrap_or(0.0);

        // Really the only complicated parse is the major-party block.
        let mp = spec
            .get("major_parties")
            .and_then(Item::as_table_like)
            .with_context(|| format!("Election {eid}: missing [elections.{eid}.major_parties]"))?;
        let strings = |key: &str| -> Result<Vec<String>> {
            mp.get(key)
                .and_then(Item::as_array)
                .with_context(|| format!("Election {eid}: major_parties.{key} missing"))?
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(String::from)
                        .with_context(|| format!("Election {eid}: major_parties.{key} not strings"))
                })
                .collect()
        };
        let symbols = strings("symbols")?;
        let names = strings("names")?;
        let seats: Vec<u32> = mp
            .get("seats")
            .and_then(Item::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_integer())
                    .map(|n| n as u32)
                    .collect()
            })
            .unwrap_or_default();
        if names.len() != symbols.len() {
            bail!("Election {eid}: major_parties symbols/names length mismatch");
        }

        let id = ElectionId::new(eid.to_string());
        out.insert(
            id.clone(),
            ElectionSpec {
                id,
                name,
                name_en,
                date,
                file,
                encoding,
                ballot_field,
                precinct_number_divisor,
                eligible_voters,
                votes_cast,
                valid_votes,
                turnout_percent,
                major_parties: MajorParties {
                    symbols,
                    names,
                    seats,
                },
            },
        );
    }

    Ok(out)
}

fn option_table<'a>(cfg: &'a Document, name: &str) -> Option<&'a dyn TableLike> {
    cfg.as_table().get(name).and_then(Item::as_table_like)
}

pub fn get_transfer_options(cfg: &Document) -> Result<TransferOptions> {
    let mut opts = TransferOptions::default();
    if let Some(t) = option_table(cfg, "transfer") {
        if let Some(m) = t.get("method").and_then(Item::as_str) {
            opts.method = Method::from_str(m)?;
        }
        if let Some(n) = t.get("min_flow_threshold").and_then(Item::as_integer) {
            opts.min_flow_threshold = n as u32;
        }
        if let Some(b) = t.get("include_abstention").and_then(Item::as_bool) {
            opts.include_abstention = b;
        }
        if let Some(n) = t.get("max_iterations").and_then(Item::as_integer) {
            opts.max_iterations = n as usize;
        }
    }
    Ok(opts)
}

pub fn get_irregularity_options(cfg: &Document) -> IrregularityOptions {
    let mut opts = IrregularityOptions::default();
    if let Some(t) = option_table(cfg, "irregularity") {
        if let Some(n) = t.get("min_valid").and_then(Item::as_integer) {
            opts.min_valid = n as u32;
        }
        if let Some(x) = t
            .get("min_score")
            .and_then(|i| i.as_float().or_else(|| i.as_integer().map(|n| n as f64)))
        {
            opts.min_score = x;
        }
        if let Some(n) = t.get("top_n").and_then(Item::as_integer) {
            opts.top_n = n as usize;
        }
    }
    opts
}

pub fn get_simulator_options(cfg: &Document) -> SimulatorOptions {
    let mut opts = SimulatorOptions::default();
    if let Some(t) = option_table(cfg, "simulator") {
        if let Some(x) = t
            .get("alpha")
            .and_then(|i| i.as_float().or_else(|| i.as_integer().map(|n| n as f64)))
        {
            opts.alpha = x;
        }
        if let Some(n) = t.get("seed").and_then(Item::as_integer) {
            opts.seed = n as u64;
        }
    }
    opts
}

pub fn get_aggregation_options(cfg: &Document) -> AggregationOptions {
    let mut opts = AggregationOptions::default();
    if let Some(t) = option_table(cfg, "aggregation") {
        if let Some(overrides) = t.get("name_overrides").and_then(Item::as_table_like) {
            for (k, v) in overrides.iter() {
                if let Some(v) = v.as_str() {
                    opts.name_overrides.insert(k.to_string(), v.to_string());
                }
            }
        }
    }
    opts
}

/// Consecutive election pairs in id order; these drive transfer analysis
/// and the longitudinal metrics.
pub fn transitions(elections: &BTreeMap<ElectionId, ElectionSpec>) -> Vec<(ElectionId, ElectionId)> {
    elections
        .keys()
        .cloned()
        .tuple_windows()
        .collect::<Vec<_>>()
}

/// Parse a `"25_to_26"`-style transition label against the declared
/// elections.
pub fn parse_transition(
    label: &str,
    elections: &BTreeMap<ElectionId, ElectionSpec>,
) -> Result<(ElectionId, ElectionId)> {
    let (from, to) = label
        .split_once("_to_")
        .with_context(|| format!("transition {label} is not FROM_to_TO"))?;
    let from = ElectionId::from(from);
    let to = ElectionId::from(to);
    for e in [&from, &to] {
        if !elections.contains_key(e) {
            return Err(CoreError::UnknownElection(e.to_string()).into());
        }
    }
    Ok((from, to))
}

/// This function handles `kalpi list`.
pub fn list_elections(cfgpath: &Path) -> Result<()> {
    let headers = "Election\tDate\tFeed\tMajor lists\tTurnout";
    let mut output = Vec::new();
    let doc = get_cfg_doc_from_path(cfgpath)?;
    let elections = get_elections(&doc)?;
    for (id, spec) in &elections {
        output.push(format!(
            "{}\t{}\t{}\t{}\t{:.1}%",
            id,
            spec.date,
            spec.file.display(),
            spec.major_parties.symbols.len(),
            spec.turnout_percent
        ));
    }

    if std::io::IsTerminal::is_terminal(&std::io::stdout()) {
        let mut tw = TabWriter::new(vec![]);
        writeln!(&mut tw, "{headers}")?;
        for i in output {
            writeln!(&mut tw, "{i}")?;
        }
        tw.flush()?;
        let output = String::from_utf8(tw.into_inner()?)?;
        let firstnewline = output.find('\n').context("empty list output")?;
        let head = &output[0..firstnewline];
        let body = &output[firstnewline..output.len()];
        println!("{BOLD}{head}{END}{body}");
    } else {
        println!("{headers}");
        for i in output {
            println!("{i}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[DEFAULT]
encoding = "utf-8-sig"
ballot_field = "קלפי"

[elections.24]
name = "הכנסת ה-24"
name_en = "24th Knesset"
date = "2021-03-23"
file = "ballot24.csv"
eligible_voters = 6578084
votes_cast = 4436365
valid_votes = 4410052
turnout_percent = 67.4

[elections.24.major_parties]
symbols = ["מחל", "פה", "שס"]
names = ["הליכוד", "יש עתיד", "ש״ס"]
seats = [30, 17, 9]

[elections.25]
name = "הכנסת ה-25"
date = "2022-11-01"
file = "ballot25.csv"
ballot_field = "מספר קלפי"
precinct_number_divisor = 10

[elections.25.major_parties]
symbols = ["מחל", "פה"]
names = ["הליכוד", "יש עתיד"]
seats = [32, 24]

[transfer]
method = "nnls"
min_flow_threshold = 1000

[irregularity]
min_score = 12.5

[aggregation.name_overrides]
"גולס" = "ג'וליס"
"#;

    fn doc() -> Document {
        SAMPLE.parse::<Document>().unwrap()
    }

    #[test]
    fn elections_with_defaults() {
        let elections = get_elections(&doc()).unwrap();
        assert_eq!(elections.len(), 2);
        let e24 = &elections[&ElectionId::from("24")];
        assert_eq!(e24.encoding, "utf-8-sig");
        assert_eq!(e24.ballot_field, "קלפי");
        assert_eq!(e24.precinct_number_divisor, 1);
        assert_eq!(e24.major_parties.seats_for(0), Some(30));
        let e25 = &elections[&ElectionId::from("25")];
        // Local keys beat [DEFAULT].
        assert_eq!(e25.ballot_field, "מספר קלפי");
        assert_eq!(e25.precinct_number_divisor, 10);
        assert_eq!(e25.eligible_voters, 0);
    }

    #[test]
    fn option_tables_overlay_defaults() {
        let t = get_transfer_options(&doc()).unwrap();
        assert_eq!(t.method, Method::Nnls);
        assert_eq!(t.min_flow_threshold, 1000);
        assert_eq!(t.max_iterations, 20_000);
        let i = get_irregularity_options(&doc());
        assert_eq!(i.min_score, 12.5);
        assert_eq!(i.min_valid, 50);
        let a = get_aggregation_options(&doc());
        assert_eq!(a.name_overrides["גולס"], "ג'וליס");
    }

    #[test]
    fn transitions_are_consecutive_pairs() {
        let elections = get_elections(&doc()).unwrap();
        assert_eq!(
            transitions(&elections),
            vec![(ElectionId::from("24"), ElectionId::from("25"))]
        );
        let (f, t) = parse_transition("24_to_25", &elections).unwrap();
        assert_eq!(f, ElectionId::from("24"));
        assert_eq!(t, ElectionId::from("25"));
        assert!(parse_transition("25_to_26", &elections).is_err());
    }
}
