mod passway;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "passway",
    version,
    about = "passway - universal TCP/UDP tunneling client"
)]
struct Cli {
    /// Client URL: client://<tunnel host:port>/<target host:port>?log=info&insecure=0&ca=<pem>&sni=<name>. Tunables are read from PASSWAY_* environment variables.
    #[arg(env = "PASSWAY_URL")]
    url: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    passway::run(&cli.url).await
}
