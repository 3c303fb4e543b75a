use std::{future::Future, time::Duration};

use anyhow::Context;

use crate::passway::{
    config::{self, CertVerification},
    logging, telemetry,
    tunnel::client::{Client, ClientError, ClientOptions},
};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

pub async fn run(raw_url: &str) -> anyhow::Result<()> {
    let cfg = config::load_config(raw_url).context("load config")?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    telemetry::init_prometheus(cfg.tunables.metrics_addr)?;

    if !cfg.ignored_options.is_empty() {
        tracing::debug!(options = ?cfg.ignored_options, "config: ignoring options not used by the client");
    }

    let t = &cfg.tunables;
    tracing::info!(
        tunnel = %cfg.endpoints.tunnel,
        target = %cfg.endpoints.target,
        insecure = cfg.tls.verification == CertVerification::Insecure,
        signal_queue = t.signal_queue,
        drop_policy = ?t.drop_policy,
        min_pool = t.min_pool,
        max_pool = t.max_pool,
        "passway: starting"
    );

    let opts = ClientOptions {
        endpoints: cfg.endpoints.clone(),
        tls: cfg.tls.clone(),
        tunables: cfg.tunables.clone(),
    };
    serve(opts, shutdown_signal()).await
}

/// Run clients back to back until `shutdown` resolves, reconnecting with
/// exponential backoff whenever the control channel fails.
async fn serve<S>(opts: ClientOptions, shutdown: S) -> anyhow::Result<()>
where
    S: Future<Output = ()>,
{
    let grace = opts.tunables.shutdown_grace;
    tokio::pin!(shutdown);

    let mut backoff = INITIAL_BACKOFF;
    loop {
        let client = Client::new(opts.clone()).context("tunnel: build client")?;

        let res = tokio::select! {
            _ = &mut shutdown => None,
            res = client.start() => Some(res),
        };
        client.shutdown(grace).await;

        let err = match res {
            None => {
                tracing::info!("shutdown: signal");
                return Ok(());
            }
            Some(Ok(())) => return Ok(()),
            Some(Err(err)) => err,
        };

        // A channel that was up and then failed starts a fresh backoff series.
        if matches!(err, ClientError::Control(_)) {
            backoff = INITIAL_BACKOFF;
        }
        tracing::warn!(
            tunnel = %opts.endpoints.tunnel,
            err = %err,
            backoff = %humantime::format_duration(backoff),
            "tunnel: disconnected; retrying"
        );

        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutdown: signal");
                return Ok(());
            }
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable; waiting for Ctrl-C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
