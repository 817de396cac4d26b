use anyhow::Result;
use clap::Parser;
use env_logger::Env;

use vmrepoctl::cli::BuildRepoCommand;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    BuildRepoCommand::parse().run().await
}
