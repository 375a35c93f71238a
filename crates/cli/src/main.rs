//! `excoder` executable.

use anyhow::Result;
use clap::Parser;
use excoder_cli::cli::{run_cli, Cli};

fn main() -> Result<()> {
    let cli = Cli::parse();
    run_cli(cli)
}
