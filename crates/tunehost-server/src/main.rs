use anyhow::Context;
use tokio::task::LocalSet;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tunehost_plugin::{HostConfig, PluginHost};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // stdout carries the protocol; diagnostics go to stderr only.
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = HostConfig::from_env();
    tracing::info!(
        memory_limit = config.sandbox.memory_limit,
        max_record_bytes = config.max_record_bytes,
        plugin_dir = ?config.plugin_dir,
        "starting tunehost v{}",
        env!("CARGO_PKG_VERSION")
    );

    let host = PluginHost::new(config);
    LocalSet::new()
        .run_until(async move {
            if let Err(e) = host.preload_dir().await {
                tracing::warn!(error = %e, "plugin preload failed");
            }
            host.run(tokio::io::stdin(), tokio::io::stdout())
                .await
                .context("plugin host stopped with an error")
        })
        .await
}
