//! Binary entrypoint that launches the firehose ingestion worker.

use std::process::ExitCode;

use mh_worker::start_mh_worker;

/// Start the worker with configuration taken from the environment.
fn main() -> ExitCode {
    start_mh_worker::run()
}
