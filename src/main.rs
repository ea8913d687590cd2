mod cli;
mod cond;
mod error;
mod harmonise;
mod pair;
mod reference;
mod stats;
mod sumstats;

use anyhow::Result;
use clap::Parser;
use rayon::ThreadPoolBuilder;

use cli::{Cli, Command};

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(n) = cli.rayon_threads {
        if let Err(err) = ThreadPoolBuilder::new().num_threads(n).build_global() {
            eprintln!("warning: failed to set Rayon thread pool size: {}", err);
        }
    }

    match cli.command {
        Command::Cond(args) => cond::run(args),
        Command::Pair(args) => pair::run(args),
    }
}
