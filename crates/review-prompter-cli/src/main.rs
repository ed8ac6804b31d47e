use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = review_prompter_cli::Cli::parse();
    review_prompter_cli::init_logging(cli.verbose())?;
    review_prompter_cli::run_cli(cli)
}
