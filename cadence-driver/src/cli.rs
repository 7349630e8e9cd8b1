//! Command line interface.

use std::path::PathBuf;

use anyhow::{Context, Result};
use argh::FromArgs;

use crate::config::Config;
use crate::observability;
use crate::run::{self, Workload};

/// Paced benchmark workload driver.
#[derive(Debug, FromArgs)]
struct Args {
    /// path to the YAML configuration file
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,

    #[argh(subcommand)]
    pub command: Command,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    Run(RunCommand),
    Validate(ValidateCommand),
    Version(VersionCommand),
}

/// run the configured workload and print a report
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "run")]
struct RunCommand {
    /// also write the report as JSON to this file
    #[argh(option, short = 'o')]
    output: Option<PathBuf>,
}

/// check the configuration and print the resolved operation intervals
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "validate")]
struct ValidateCommand {}

/// print the driver version
#[derive(Default, Debug, FromArgs)]
#[argh(subcommand, name = "version")]
struct VersionCommand {}

/// Bootstrap the runtime and execute the CLI command.
pub fn execute() -> Result<()> {
    let args: Args = argh::from_env();

    // Special switch to just print the version and exit.
    if let Command::Version(_) = args.command {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = Config::load(args.config.as_deref()).context("failed to load configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("cadence-rt")
        .enable_all()
        .build()?;
    let _runtime_guard = runtime.enter();

    observability::initialize_tracing(&config.logging);
    tracing::debug!(?config);

    match args.command {
        Command::Run(RunCommand { output }) => runtime.block_on(async move {
            let report = run::run(&config).await?;
            report.print();
            if let Some(output) = output {
                report.write_json(&output)?;
                tracing::info!(path = %output.display(), "wrote report");
            }
            Ok(())
        }),
        Command::Validate(ValidateCommand {}) => validate(&config),
        Command::Version(VersionCommand {}) => unreachable!(),
    }
}

fn validate(config: &Config) -> Result<()> {
    let workload = Workload::new(config)?;
    let names = config.mix.names();

    println!("operations ({:?} form):", workload.mix().form());
    for (kind, interval) in workload.mix().iter() {
        let name = names.get(&kind).map_or("unknown", String::as_str);
        println!("  {name} ({kind}): every {interval:?}");
    }
    println!();
    print!(
        "{}",
        serde_yaml::to_string(config).context("failed to render configuration")?
    );

    Ok(())
}
