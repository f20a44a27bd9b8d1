use clap::Parser;

use yard_tracker::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    yard_tracker::run(Config::parse()).await
}
