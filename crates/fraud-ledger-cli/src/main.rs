use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = fraud_ledger_cli::Cli::parse();
    fraud_ledger_cli::init_logging(&cli)?;
    fraud_ledger_cli::run_cli(cli)
}
