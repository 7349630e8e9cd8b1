//! Command line entry point of the cadence workload driver.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

fn main() -> anyhow::Result<()> {
    cadence_driver::cli::execute()
}
