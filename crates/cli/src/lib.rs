pub mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use funnel_core::ForecastMode;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "funnel",
    about = "Clinic funnel operator CLI",
    long_about = "Apply migrations, inspect configuration, check readiness, and query conversion \
                  rates and upgrade forecasts for a clinic.",
    after_help = "Examples:\n  funnel doctor --json\n  funnel rate harbor-dental --days 7\n  \
                  funnel forecast harbor-dental\n  \
                  funnel rebuild-counters harbor-dental"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Inspect effective configuration values with source attribution")]
    Config,
    #[command(about = "Validate config, database connectivity and schema state")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Conversion rate for a clinic over a trailing window")]
    Rate {
        slug: String,
        #[arg(
            long,
            default_value_t = commands::rate::DEFAULT_DAYS,
            value_parser = clap::value_parser!(u32).range(1..=366),
            help = "Trailing window length in days"
        )]
        days: u32,
    },
    #[command(about = "Rebuild a clinic's conversion counters by replaying its event log")]
    RebuildCounters { slug: String },
    #[command(about = "Latest unexpired upgrade forecast for a clinic, generating one if needed")]
    Forecast {
        slug: String,
        #[arg(long, value_enum, default_value_t = ModeArg::Tier)]
        mode: ModeArg,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Tier,
    Package,
    Feature,
}

impl From<ModeArg> for ForecastMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Tier => ForecastMode::Tier,
            ModeArg::Package => ForecastMode::Package,
            ModeArg::Feature => ForecastMode::Feature,
        }
    }
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Rate { slug, days } => commands::rate::run(&slug, days),
        Command::RebuildCounters { slug } => commands::rebuild_counters::run(&slug),
        Command::Forecast { slug, mode } => commands::forecast::run(&slug, mode.into()),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
