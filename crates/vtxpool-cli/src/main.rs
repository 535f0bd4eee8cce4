mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;

use crate::cli::Cli;

fn main() -> Result<()> {
    let cli = Cli::parse();
    vtxpool::logging::init(&cli.log_level);
    commands::run(cli)
}
