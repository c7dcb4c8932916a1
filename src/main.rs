use clap::Parser;
use quantlab::cli::{Cli, run};

fn main() -> std::process::ExitCode {
    run(Cli::parse())
}
