use clap::Parser;

use wagate_lib::config::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    wagate_lib::run(Cli::parse()).await
}
