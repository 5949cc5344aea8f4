//! The plugin host loop.
//!
//! Reads records from the inbound stream, runs each request as its own
//! local task and funnels every outbound record (responses and proxy
//! requests) through a single writer task so records never interleave.

use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::dispatcher::Dispatcher;
use crate::error::PluginError;
use crate::framer::{Frame, RecordCodec};
use crate::host_functions::HostProxy;
use crate::protocol::{self, Inbound, Outbound, Response};
use crate::registry::PluginRegistry;
use crate::sandbox::SandboxConfig;

// ─── Configuration ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub sandbox: SandboxConfig,
    /// Longest inbound record accepted (default: 16 MiB).
    pub max_record_bytes: usize,
    /// Directory of `<name>.js` plugins loaded before the loop starts.
    pub plugin_dir: Option<PathBuf>,
    /// Names to preload from `plugin_dir`. Empty means all of them.
    pub enabled_plugins: Vec<String>,
    /// How long in-flight requests may run after inbound EOF (default: 30).
    pub shutdown_grace_secs: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            sandbox: SandboxConfig::default(),
            max_record_bytes: 16 * 1024 * 1024,
            plugin_dir: None,
            enabled_plugins: Vec::new(),
            shutdown_grace_secs: 30,
        }
    }
}

impl HostConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            sandbox: SandboxConfig::from_env(),
            max_record_bytes: std::env::var("HOST_MAX_RECORD_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_record_bytes),
            plugin_dir: std::env::var("PLUGIN_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            enabled_plugins: std::env::var("PLUGIN_ENABLED")
                .map(|v| parse_name_list(&v))
                .unwrap_or_default(),
            shutdown_grace_secs: std::env::var("HOST_SHUTDOWN_GRACE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.shutdown_grace_secs),
        }
    }

    fn is_enabled(&self, name: &str) -> bool {
        self.enabled_plugins.is_empty() || self.enabled_plugins.iter().any(|n| n == name)
    }
}

fn parse_name_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ─── Host ───────────────────────────────────────────────────────────────

/// A plugin host bound to one pair of protocol streams.
///
/// Everything runs on the current thread: [`PluginHost::preload_dir`] and
/// [`PluginHost::run`] must be awaited inside a `tokio::task::LocalSet`.
pub struct PluginHost {
    config: HostConfig,
    dispatcher: Rc<Dispatcher>,
    proxy: Arc<HostProxy>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    outbound_rx: mpsc::UnboundedReceiver<Outbound>,
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl PluginHost {
    pub fn new(config: HostConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let proxy = Arc::new(HostProxy::new(
            outbound_tx.clone(),
            Duration::from_secs(config.sandbox.fetch_timeout_secs),
        ));
        let dispatcher = Rc::new(Dispatcher::new(
            Arc::clone(&proxy),
            config.sandbox.clone(),
        ));
        Self {
            config,
            dispatcher,
            proxy,
            outbound_tx,
            outbound_rx,
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn registry(&self) -> &PluginRegistry {
        self.dispatcher.registry()
    }

    /// Load every enabled `<name>.js` in the plugin directory.
    ///
    /// A plugin that fails to load is logged and skipped. Returns how many
    /// plugins were loaded.
    pub async fn preload_dir(&self) -> Result<usize, PluginError> {
        let Some(dir) = &self.config.plugin_dir else {
            return Ok(0);
        };

        let mut candidates = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("js") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !self.config.is_enabled(name) {
                tracing::debug!(plugin = %name, "plugin not enabled, skipping");
                continue;
            }
            candidates.push((name.to_string(), path));
        }
        candidates.sort();

        let mut loaded = 0;
        for (name, path) in candidates {
            let code = match tokio::fs::read_to_string(&path).await {
                Ok(code) => code,
                Err(e) => {
                    tracing::warn!(plugin = %name, path = %path.display(), error = %e, "failed to read plugin file");
                    continue;
                }
            };
            match self.dispatcher.load(&name, &code) {
                Ok(_) => loaded += 1,
                Err(e) => tracing::warn!(plugin = %name, error = %e, "failed to preload plugin"),
            }
        }

        tracing::info!(dir = %dir.display(), count = loaded, "preloaded plugins");
        Ok(loaded)
    }

    /// Serve requests from `reader` until EOF, writing records to `writer`.
    pub async fn run<R, W>(self, reader: R, writer: W) -> Result<(), PluginError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + 'static,
    {
        let PluginHost {
            config,
            dispatcher,
            proxy,
            outbound_tx,
            outbound_rx,
        } = self;

        let codec = RecordCodec::new(config.max_record_bytes);
        let mut frames = FramedRead::new(reader, codec.clone());
        let writer_stop = CancellationToken::new();
        let writer_closed = CancellationToken::new();
        let writer_task = tokio::task::spawn_local(write_outbound(
            FramedWrite::new(writer, codec),
            outbound_rx,
            writer_stop.clone(),
            writer_closed.clone(),
        ));

        let shutdown = CancellationToken::new();
        let mut in_flight = JoinSet::new();
        tracing::info!(loaded = dispatcher.registry().loaded_count(), "plugin host ready");

        loop {
            let next = tokio::select! {
                biased;
                _ = writer_closed.cancelled() => {
                    tracing::warn!("outbound stream closed, stopping");
                    break;
                }
                next = frames.next() => next,
            };
            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    tracing::error!(error = %e, "inbound stream failed");
                    break;
                }
                None => break,
            };

            while let Some(joined) = in_flight.try_join_next() {
                log_join(joined);
            }

            match frame {
                Frame::Oversized => {
                    let max = frames.decoder().max_length();
                    tracing::warn!(max, "discarded oversized record");
                    let error = PluginError::RecordTooLong { max };
                    let _ = outbound_tx.send(Response::sentinel(error).into());
                }
                Frame::Record(bytes) => match protocol::decode(&bytes) {
                    Err(response) => {
                        let _ = outbound_tx.send(response.into());
                    }
                    Ok(Inbound::ProxyReply(reply)) => {
                        proxy.complete(reply);
                    }
                    Ok(Inbound::Request(request)) => {
                        let dispatcher = Rc::clone(&dispatcher);
                        let outbound = outbound_tx.clone();
                        let shutdown = shutdown.clone();
                        in_flight.spawn_local(async move {
                            let id = request.id.clone();
                            let response = tokio::select! {
                                response = dispatcher.dispatch(request) => response,
                                _ = shutdown.cancelled() => {
                                    Response::failure(id, PluginError::ShuttingDown)
                                }
                            };
                            let _ = outbound.send(response.into());
                        });
                    }
                },
            }
        }

        if !in_flight.is_empty() {
            tracing::info!(count = in_flight.len(), "waiting for in-flight requests");
        }
        let grace = Duration::from_secs(config.shutdown_grace_secs);
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = in_flight.join_next().await {
                log_join(joined);
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(count = in_flight.len(), "grace period elapsed, abandoning requests");
            shutdown.cancel();
            while let Some(joined) = in_flight.join_next().await {
                log_join(joined);
            }
        }

        proxy.close();
        drop(outbound_tx);
        writer_stop.cancel();
        let written = match writer_task.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "writer task failed");
                Ok(())
            }
        };
        tracing::info!("plugin host stopped");
        written
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "request task failed");
    }
}

/// Drain outbound records into `sink` until `stop` fires, then flush what
/// is already queued. `closed` fires if the sink fails.
async fn write_outbound<W>(
    mut sink: FramedWrite<W, RecordCodec>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    stop: CancellationToken,
    closed: CancellationToken,
) -> Result<(), PluginError>
where
    W: AsyncWrite + Unpin,
{
    let result = async {
        loop {
            tokio::select! {
                biased;
                message = rx.recv() => match message {
                    Some(message) => sink.send(message).await?,
                    None => break,
                },
                _ = stop.cancelled() => {
                    while let Ok(message) = rx.try_recv() {
                        sink.feed(message).await?;
                    }
                    break;
                }
            }
        }
        sink.flush().await
    }
    .await;

    if let Err(e) = &result {
        tracing::error!(error = %e, "failed to write outbound record");
        closed.cancel();
    }
    result
}
