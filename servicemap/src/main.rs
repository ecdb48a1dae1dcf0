use anyhow::Context;
use clap::ArgMatches;
use colored::Colorize;
use commands::command_argument_builder;
use servicemap::handlers::{handle_alerts, handle_config, handle_map, init_logging};
use servicemap_core::Config;

mod commands;

#[tokio::main]
async fn main() {
    let matches = command_argument_builder().get_matches();
    init_logging(matches.get_count("verbose"));

    if let Err(e) = run(&matches).await {
        eprintln!("{} {:#}", "✗".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(matches: &ArgMatches) -> anyhow::Result<()> {
    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let config = Config::load(config_path).context("failed to load configuration")?;

    match matches.subcommand() {
        Some(("map", sub_matches)) => handle_map(sub_matches, &config).await,
        Some(("alerts", sub_matches)) => handle_alerts(sub_matches, &config).await,
        Some(("config", _)) => handle_config(&config),
        _ => unreachable!("clap should ensure we don't get here"),
    }
}

pub const CLAP_STYLING: clap::builder::styling::Styles = clap::builder::styling::Styles::styled()
    .header(clap_cargo::style::HEADER)
    .usage(clap_cargo::style::USAGE)
    .literal(clap_cargo::style::LITERAL)
    .placeholder(clap_cargo::style::PLACEHOLDER)
    .error(clap_cargo::style::ERROR)
    .valid(clap_cargo::style::VALID)
    .invalid(clap_cargo::style::INVALID);
