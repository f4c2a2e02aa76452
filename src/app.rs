//! The main app logic: argument structs and most top-level functions

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use clap::{ArgEnum, Parser, Subcommand, ValueHint};
use color_eyre::eyre::{Context, ContextCompat, Result};
use tracing::info;

use crate::ballots::{BallotTable, ElectionId};
use crate::catalog::PartyCatalog;
use crate::config::{self, ElectionSpec, Method};
use crate::geo::CoordinateIndex;
use crate::irregular::{self, NoopVerifier};
use crate::metrics;
use crate::names::NameCanonicalizer;
use crate::parser::{self, ColumnDictionary};
use crate::report;
use crate::simulate::{self, SimulationPlan};
use crate::transfer;

#[derive(Parser, Debug)]
#[clap(version, about)]
pub struct Cli {
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    #[clap(subcommand)]
    pub command: CliCommands,
}

#[derive(Subcommand, Debug)]
pub enum CliCommands {
    Transfer(CliTransfer),
    Audit(CliAudit),
    Simulate(CliSimulate),
    Metrics(CliMetrics),
    List(CliList),
}

/// Estimate vote-transfer matrices for consecutive election pairs.
#[derive(Parser, Debug)]
pub struct CliTransfer {
    /// Solver method
    #[clap(long, arg_enum)]
    pub method: Option<CliMethod>,

    /// Include the "did not vote" pseudo-party on both axes
    #[clap(long)]
    pub abstention: bool,

    /// Only compute specific transitions, e.g. --transitions 25_to_26
    #[clap(long, multiple_values = true)]
    pub transitions: Option<Vec<String>>,

    /// Output directory for the transition artifacts
    #[clap(long, default_value = "data", parse(from_os_str), value_hint = ValueHint::DirPath)]
    pub out: PathBuf,

    /// The configuration file to run
    #[clap(parse(from_os_str), value_hint = ValueHint::FilePath)]
    pub configfile: PathBuf,
}

#[derive(ArgEnum, Debug, Clone, Copy)]
pub enum CliMethod {
    Convex,
    Nnls,
    ClosedForm,
}

impl From<CliMethod> for Method {
    fn from(m: CliMethod) -> Self {
        match m {
            CliMethod::Convex => Method::Convex,
            CliMethod::Nnls => Method::Nnls,
            CliMethod::ClosedForm => Method::ClosedForm,
        }
    }
}

/// Scan elections for precincts whose counts look irregular.
#[derive(Parser, Debug)]
pub struct CliAudit {
    /// Scan a SPECIFIC election (can be given multiple times)
    #[clap(long, short, multiple_occurrences = true)]
    pub election: Option<Vec<String>>,

    /// Keep precincts already corrected in the official record, annotated
    /// instead of dropped
    #[clap(long)]
    pub keep_fixed: bool,

    /// Output directory for the audit artifacts
    #[clap(long, default_value = "data", parse(from_os_str), value_hint = ValueHint::DirPath)]
    pub out: PathBuf,

    /// The configuration file to run
    #[clap(parse(from_os_str), value_hint = ValueHint::FilePath)]
    pub configfile: PathBuf,
}

/// Synthesize a future election's precinct feed from a transfer plan.
#[derive(Parser, Debug)]
pub struct CliSimulate {
    /// Transfer-plan TOML (shares, turnout factors, dominant list)
    #[clap(long, parse(from_os_str), value_hint = ValueHint::FilePath)]
    pub plan: PathBuf,

    /// Source election id
    #[clap(long)]
    pub source: String,

    /// Target election id for the synthetic feed
    #[clap(long)]
    pub target: String,

    /// Where to write the synthetic feed CSV (defaults to ballot<target>.csv)
    #[clap(long, parse(from_os_str), value_hint = ValueHint::FilePath)]
    pub out: Option<PathBuf>,

    /// The configuration file to run
    #[clap(parse(from_os_str), value_hint = ValueHint::FilePath)]
    pub configfile: PathBuf,
}

/// Aggregate settlements and compute the longitudinal metrics.
#[derive(Parser, Debug)]
pub struct CliMetrics {
    /// Station-coordinates JSON from the geocoding collaborators
    #[clap(long, parse(from_os_str), value_hint = ValueHint::FilePath)]
    pub coordinates: Option<PathBuf>,

    /// Socio-economic clusters JSON
    #[clap(long, parse(from_os_str), value_hint = ValueHint::FilePath)]
    pub socioeconomic: Option<PathBuf>,

    /// Output file
    #[clap(long, default_value = "data/metrics.json", parse(from_os_str), value_hint = ValueHint::FilePath)]
    pub out: PathBuf,

    /// The configuration file to run
    #[clap(parse(from_os_str), value_hint = ValueHint::FilePath)]
    pub configfile: PathBuf,
}

/// List elections from the configuration file.
#[derive(Parser, Debug)]
#[clap(
    after_help = "Election tables are printed to standard output. If that's a terminal, they'll be pretty-printed with elastic tabstops. If that's a pipe or file, they'll be tab-separated to make further processing as straightforward as possible."
)]
pub struct CliList {
    /// The configuration file to list elections from
    #[clap(parse(from_os_str), value_hint = ValueHint::FilePath)]
    pub configfile: PathBuf,
}

/// Read one election's feed into a ballot table.
fn load_table(spec: &ElectionSpec) -> Result<BallotTable> {
    let columns = ColumnDictionary::with_ballot_field(&spec.ballot_field);
    parser::read_feed(&spec.file, &columns, |parties, records| {
        BallotTable::load(
            spec.id.clone(),
            parties,
            records,
            spec.precinct_number_divisor,
        )
    })
    .with_context(|| format!("could not load the feed for election {}", spec.id))
}

/// Performs the `transfer` subcommand.
pub fn run_transfer(args: CliTransfer) -> Result<()> {
    let doc = config::get_cfg_doc_from_path(&args.configfile)?;
    let elections = config::get_elections(&doc)?;
    let mut opts = config::get_transfer_options(&doc)?;
    if let Some(method) = args.method {
        opts.method = method.into();
    }
    if args.abstention {
        opts.include_abstention = true;
    }
    let catalog = PartyCatalog::embedded()?;

    let pairs: Vec<(ElectionId, ElectionId)> = match &args.transitions {
        Some(labels) => labels
            .iter()
            .map(|l| config::parse_transition(l, &elections))
            .collect::<Result<_>>()?,
        None => config::transitions(&elections),
    };

    let suffix = if opts.include_abstention {
        "_abstention"
    } else {
        ""
    };
    let mut tables: HashMap<ElectionId, BallotTable> = HashMap::new();
    let mut combined: BTreeMap<String, report::TransitionArtifact> = BTreeMap::new();

    for (from, to) in pairs {
        info!("Analyzing {from} → {to}");
        for eid in [&from, &to] {
            if !tables.contains_key(eid) {
                tables.insert(eid.clone(), load_table(&elections[eid])?);
            }
        }
        let outcome = transfer::analyze(
            &tables[&from],
            &tables[&to],
            &elections[&from],
            &elections[&to],
            &opts,
        )?;
        let artifact = report::transition_artifact(
            &outcome,
            &elections[&from],
            &elections[&to],
            &catalog,
            opts.min_flow_threshold,
        );
        let key = format!("{from}_to_{to}");
        report::write_json(
            &artifact,
            &args.out.join(format!("transfer_{key}{suffix}.json")),
        )?;
        combined.insert(key, artifact);
    }

    report::write_json(&combined, &args.out.join(format!("all_transfers{suffix}.json")))?;
    Ok(())
}

/// Performs the `audit` subcommand.
pub fn run_audit(args: CliAudit) -> Result<()> {
    let doc = config::get_cfg_doc_from_path(&args.configfile)?;
    let elections = config::get_elections(&doc)?;
    let opts = config::get_irregularity_options(&doc);
    let catalog = PartyCatalog::embedded()?;

    let ids: Vec<ElectionId> = match &args.election {
        Some(list) => list.iter().map(|s| ElectionId::from(s.as_str())).collect(),
        None => elections.keys().cloned().collect(),
    };

    for eid in ids {
        let spec = elections
            .get(&eid)
            .with_context(|| format!("election {eid} is not declared in the configuration"))?;
        let table = load_table(spec)?;
        let outcome = irregular::score_election(
            &table,
            spec,
            &catalog,
            &opts,
            &NoopVerifier,
            args.keep_fixed,
        )?;
        let artifact = report::audit_artifact(&outcome, spec, &catalog);
        report::write_json(
            &artifact,
            &args.out.join(format!("irregularities_{eid}.json")),
        )?;
    }
    Ok(())
}

/// Performs the `simulate` subcommand.
pub fn run_simulate(args: CliSimulate) -> Result<()> {
    let doc = config::get_cfg_doc_from_path(&args.configfile)?;
    let elections = config::get_elections(&doc)?;
    let sim_opts = config::get_simulator_options(&doc);

    let source_id = ElectionId::from(args.source.as_str());
    let spec = elections
        .get(&source_id)
        .with_context(|| format!("source election {source_id} is not declared"))?;
    let plan = SimulationPlan::from_path(&args.plan, sim_opts.alpha, sim_opts.seed)?;

    let mut source = load_table(spec)?;
    source.remap_parties(&plan.remap);

    let target_id = ElectionId::from(args.target.as_str());
    let synthetic = simulate::simulate(&source, &plan, target_id)?;

    let out = args
        .out
        .unwrap_or_else(|| PathBuf::from(format!("ballot{}.csv", args.target)));
    let columns = ColumnDictionary::with_ballot_field(&spec.ballot_field);
    parser::write_feed(&synthetic, &out, &columns)?;
    info!("Saved synthetic feed {}", out.display());
    Ok(())
}

/// Performs the `metrics` subcommand.
pub fn run_metrics(args: CliMetrics) -> Result<()> {
    let doc = config::get_cfg_doc_from_path(&args.configfile)?;
    let elections = config::get_elections(&doc)?;
    let agg_opts = config::get_aggregation_options(&doc);
    let catalog = PartyCatalog::embedded()?;
    let canon = NameCanonicalizer::new(&agg_opts.name_overrides);

    let coords = args
        .coordinates
        .as_deref()
        .map(|p| CoordinateIndex::from_path(p, &canon))
        .transpose()?;
    let socio = args
        .socioeconomic
        .as_deref()
        .map(|p| load_socioeconomic(p, &canon))
        .transpose()?;

    let mut tables: BTreeMap<ElectionId, BallotTable> = BTreeMap::new();
    for (eid, spec) in &elections {
        tables.insert(eid.clone(), load_table(spec)?);
    }

    let metrics_report = metrics::compute_metrics(
        &tables,
        &elections,
        &catalog,
        &canon,
        coords.as_ref(),
        socio.as_ref(),
    )?;
    report::write_json(&metrics_report, &args.out)?;
    Ok(())
}

#[derive(Deserialize)]
struct SocioEntry {
    name: String,
    cluster: u32,
}

/// Socio-economic clusters keyed by canonical settlement name.
fn load_socioeconomic(path: &Path, canon: &NameCanonicalizer) -> Result<HashMap<String, u32>> {
    let file = File::open(path)
        .with_context(|| format!("socioeconomic file {} could not be opened", path.display()))?;
    let entries: Vec<SocioEntry> = serde_json::from_reader(BufReader::new(file))
        .context("socioeconomic file could not be parsed")?;
    Ok(entries
        .into_iter()
        .map(|e| (canon.canon(&e.name), e.cluster))
        .collect())
}

/// Does the top-level command.
pub fn actual(m: Cli) -> Result<()> {
    use CliCommands::*;
    match m.command {
        Transfer(sm) => run_transfer(sm)?,
        Audit(sm) => run_audit(sm)?,
        Simulate(sm) => run_simulate(sm)?,
        Metrics(sm) => run_metrics(sm)?,
        List(sm) => config::list_elections(&sm.configfile)?,
    }
    Ok(())
}
