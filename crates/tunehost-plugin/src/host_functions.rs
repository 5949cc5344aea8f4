//! Host-side effects that sandboxed plugins reach through narrow channels:
//! console logging and the proxied network fetch.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::PluginError;
use crate::protocol::{Outbound, ProxyReply, ProxyRequest};

/// Maximum fetch response body accepted from the parent (10 MB).
const MAX_FETCH_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Maximum log message length from plugins.
const MAX_LOG_MESSAGE_LEN: usize = 2048;

const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// Strip control characters (except newline/tab) and truncate.
pub fn sanitize_log_message(message: &str) -> String {
    let cleaned: String = message
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .take(MAX_LOG_MESSAGE_LEN)
        .collect();
    if message.chars().count() > MAX_LOG_MESSAGE_LEN {
        format!("{cleaned}… (truncated)")
    } else {
        cleaned
    }
}

/// Forward one console call from a plugin to the host's diagnostics.
///
/// Only warnings and errors are surfaced; everything else stays at trace
/// level so chatty plugins do not flood the diagnostic stream.
pub fn plugin_log(plugin: &str, level: &str, message: &str) {
    let message = sanitize_log_message(message);
    match level {
        "error" => tracing::error!(plugin = %plugin, "{message}"),
        "warn" => tracing::warn!(plugin = %plugin, "{message}"),
        _ => tracing::trace!(plugin = %plugin, level = %level, "{message}"),
    }
}

// ─── Types shared with plugins ────────────────────────────────────────

/// A network request a plugin asked the host to perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// The parent's result for a [`FetchRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
}

// ─── Request validation ───────────────────────────────────────────────

/// Check a fetch before it leaves the sandbox. The method is normalized to
/// upper case in place.
pub fn validate_fetch_request(
    request: &mut FetchRequest,
    block_private_hosts: bool,
) -> Result<(), PluginError> {
    let url = url::Url::parse(&request.url)
        .map_err(|_| PluginError::FetchDenied(format!("invalid URL: {}", request.url)))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(PluginError::FetchDenied(format!(
            "scheme '{}' is not allowed",
            url.scheme()
        )));
    }
    if url.host().is_none() {
        return Err(PluginError::FetchDenied(format!(
            "URL has no host: {}",
            request.url
        )));
    }

    request.method = request.method.to_ascii_uppercase();
    if !ALLOWED_METHODS.contains(&request.method.as_str()) {
        return Err(PluginError::FetchDenied(format!(
            "method '{}' is not allowed",
            request.method
        )));
    }

    if block_private_hosts {
        check_private_ip(&url)?;
    }
    Ok(())
}

fn check_private_ip(url: &url::Url) -> Result<(), PluginError> {
    let ip = match url.host() {
        Some(url::Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            let blocked = ["localhost", "metadata.google.internal"];
            if blocked.contains(&domain.as_str()) || domain.ends_with(".localhost") {
                return Err(PluginError::FetchDenied(format!(
                    "requests to '{domain}' are blocked (private/reserved address)"
                )));
            }
            return Ok(());
        }
        Some(url::Host::Ipv4(v4)) => IpAddr::V4(v4),
        Some(url::Host::Ipv6(v6)) => IpAddr::V6(v6),
        None => return Ok(()),
    };

    let is_private = match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local, fe80::/10 link local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || v6.to_ipv4_mapped().is_some_and(|v4| {
                    v4.is_private() || v4.is_loopback() || v4.is_link_local()
                })
        }
    };
    if is_private {
        return Err(PluginError::FetchDenied(format!(
            "requests to private IP '{ip}' are blocked"
        )));
    }
    Ok(())
}

// ─── Host proxy ───────────────────────────────────────────────────────

type PendingReply = oneshot::Sender<Result<FetchResponse, String>>;

/// Correlates outbound fetch requests with the parent's replies.
///
/// Requests are written to the same stream as responses; replies arrive as
/// `proxyResponse` records and are routed back through [`HostProxy::complete`].
pub struct HostProxy {
    outbound: mpsc::UnboundedSender<Outbound>,
    pending: Mutex<HashMap<String, PendingReply>>,
    timeout: Duration,
}

impl std::fmt::Debug for HostProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostProxy")
            .field("pending", &self.pending_count())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HostProxy {
    pub fn new(outbound: mpsc::UnboundedSender<Outbound>, timeout: Duration) -> Self {
        Self {
            outbound,
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, PendingReply>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Ask the parent to perform `request` and wait for its reply.
    pub async fn fetch(
        &self,
        plugin: &str,
        request: FetchRequest,
    ) -> Result<FetchResponse, PluginError> {
        let id = format!("proxy-{}", Uuid::new_v4());
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id.clone(), tx);

        tracing::debug!(plugin = %plugin, id = %id, url = %request.url, "forwarding fetch to host");
        let message = Outbound::Proxy(ProxyRequest {
            id: id.clone(),
            plugin_name: plugin.to_string(),
            request,
        });
        if self.outbound.send(message).is_err() {
            self.pending().remove(&id);
            return Err(PluginError::ProxyClosed);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(Ok(response))) => Ok(response),
            Ok(Ok(Err(message))) => Err(PluginError::Fetch(message)),
            Ok(Err(_)) => Err(PluginError::ProxyClosed),
            Err(_) => {
                self.pending().remove(&id);
                tracing::warn!(plugin = %plugin, id = %id, "host proxy request timed out");
                Err(PluginError::ProxyTimeout(id))
            }
        }
    }

    /// Route a parent reply to its waiting fetch. Returns false for ids that
    /// are unknown or already timed out.
    pub fn complete(&self, reply: ProxyReply) -> bool {
        let Some(waiter) = self.pending().remove(&reply.id) else {
            tracing::warn!(id = %reply.id, "proxy response for unknown request");
            return false;
        };
        let outcome = reply.outcome.and_then(|response| {
            if response.body.len() > MAX_FETCH_BODY_BYTES {
                Err(format!(
                    "response body too large: {} bytes (max: {} bytes)",
                    response.body.len(),
                    MAX_FETCH_BODY_BYTES
                ))
            } else {
                Ok(response)
            }
        });
        waiter.send(outcome).is_ok()
    }

    /// Fail every outstanding fetch.
    pub fn close(&self) {
        let drained = std::mem::take(&mut *self.pending());
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "dropping outstanding proxy requests");
        }
    }
}
