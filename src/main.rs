// kalpi: vote-transfer analysis, forward simulation and irregularity
// auditing of Knesset precinct returns.
// Released under the MIT or Apache-2.0 licenses, at your option.

#[macro_use]
extern crate serde_derive;

use clap::Parser;
use color_eyre::eyre::Result;

mod abstention;
mod app;
mod ballots;
mod catalog;
mod cluster;
mod config;
mod geo;
mod irregular;
mod metrics;
mod names;
mod parser;
mod report;
mod simulate;
mod term;
mod transfer;
mod utils;

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = app::Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(tracing_level(cli.verbose.log_level_filter()))
        .with_writer(std::io::stderr)
        .init();

    app::actual(cli)
}

/// The verbosity flag speaks `log` levels; the subscriber wants its own.
fn tracing_level(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    use tracing_subscriber::filter::LevelFilter;
    match filter {
        log::LevelFilter::Off => LevelFilter::OFF,
        log::LevelFilter::Error => LevelFilter::ERROR,
        log::LevelFilter::Warn => LevelFilter::WARN,
        log::LevelFilter::Info => LevelFilter::INFO,
        log::LevelFilter::Debug => LevelFilter::DEBUG,
        log::LevelFilter::Trace => LevelFilter::TRACE,
    }
}
