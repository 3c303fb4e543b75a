pub mod app;
pub mod config;
pub mod endpoint;
pub mod logging;
pub mod net;
pub mod telemetry;
pub mod tunnel;

pub async fn run(raw_url: &str) -> anyhow::Result<()> {
    app::run(raw_url).await
}
