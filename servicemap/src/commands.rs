use crate::CLAP_STYLING;
use clap::{arg, command};

pub(crate) fn command_argument_builder() -> clap::Command {
    clap::Command::new("servicemap")
        .version(env!("CARGO_PKG_VERSION"))
        .bin_name("servicemap")
        .styles(CLAP_STYLING)
        .about("Derive a service dependency map from APM trace data")
        .arg(
            arg!(-c --"config" <PATH>)
                .required(false)
                .global(true)
                .help("Path to the config file (default: ~/.config/servicemap/config.json)"),
        )
        .arg(
            arg!(-v --"verbose" ...)
                .required(false)
                .global(true)
                .help("Increase log verbosity (-v debug, -vv trace)"),
        )
        .arg(
            arg!(-q --"quiet" "Suppress progress and summary output")
                .required(false)
                .global(true),
        )
        .subcommand_required(true)
        .subcommand(
            command!("map")
                .about("Sample traces and print the service map as JSON")
                .arg(
                    arg!(-s --"service-name" <NAME>)
                        .required(false)
                        .help("Only include paths through this service"),
                )
                .arg(
                    arg!(-e --"environment" <ENV>)
                        .required(false)
                        .help("Only include paths through services in this environment"),
                )
                .arg(
                    arg!(--"start" <TIME>)
                        .required(false)
                        .help("Window start, RFC 3339 or epoch milliseconds (default: end minus the configured range)"),
                )
                .arg(
                    arg!(--"end" <TIME>)
                        .required(false)
                        .help("Window end, RFC 3339 or epoch milliseconds (default: now)"),
                )
                .arg(
                    arg!(-f --"filter" <JSON>)
                        .required(false)
                        .help("Extra query DSL filter clause; may be repeated")
                        .action(clap::ArgAction::Append),
                )
                .arg(
                    arg!(--"after" <CURSOR>)
                        .required(false)
                        .help("Continue from a cursor returned by an earlier run"),
                )
                .arg(
                    arg!(-n --"max-requests" <COUNT>)
                        .required(false)
                        .help("Maximum number of pages to fetch and merge")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("5"),
                )
                .arg(
                    arg!(--"pretty")
                        .required(false)
                        .help("Pretty-print the JSON output")
                        .action(clap::ArgAction::SetTrue),
                ),
        )
        .subcommand(
            command!("alerts")
                .about("List APM alert rules and whether they are firing")
                .arg(
                    arg!(--"pretty")
                        .required(false)
                        .help("Pretty-print the JSON output")
                        .action(clap::ArgAction::SetTrue),
                ),
        )
        .subcommand(command!("config").about("Print the effective configuration"))
}
