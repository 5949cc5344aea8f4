//! Cooperative driver for realm work.
//!
//! Plugin code never blocks on I/O. Timers and fetches it requests are
//! queued on the realm and turned into local tasks here; each completion
//! re-enters the realm and wakes any capability call waiting on it.

use std::rc::Rc;
use std::sync::Arc;

use serde_json::Value;

use crate::capability::Capability;
use crate::error::PluginError;
use crate::host_functions::HostProxy;
use crate::sandbox::{HostOp, Realm, TaskState};

/// Spawn local tasks for every host operation the realm has queued.
///
/// Operations of a dormant realm (unloaded or replaced, with no call still
/// in flight) are dropped. Must be called from within a `LocalSet`.
pub fn schedule_ops(realm: &Rc<Realm>, proxy: &Arc<HostProxy>) {
    let ops = realm.take_ops();
    if realm.is_dormant() {
        if !ops.is_empty() {
            tracing::debug!(plugin = %realm.name(), dropped = ops.len(), "dropping host operations for retired realm");
        }
        return;
    }
    for op in ops {
        let realm = Rc::clone(realm);
        let proxy = Arc::clone(proxy);
        tokio::task::spawn_local(async move {
            let result = match op {
                HostOp::Timer { id, delay } => {
                    tokio::time::sleep(delay).await;
                    if realm.is_dormant() {
                        return;
                    }
                    realm.fire_timer(id)
                }
                HostOp::Fetch { id, request } => {
                    if realm.is_dormant() {
                        return;
                    }
                    // Once sent, the reply is always delivered.
                    let outcome = proxy.fetch(realm.name(), request).await;
                    realm.settle_fetch(id, outcome)
                }
            };
            match result {
                Ok(()) => schedule_ops(&realm, &proxy),
                Err(PluginError::Interrupted { .. }) => {
                    tracing::debug!(plugin = %realm.name(), "dropping host operation for poisoned realm");
                }
                Err(e) => {
                    tracing::warn!(plugin = %realm.name(), error = %e, "host operation failed");
                    schedule_ops(&realm, &proxy);
                }
            }
            realm.notify_settled();
        });
    }
}

/// Invoke a capability and wait until its promise settles.
///
/// There is no call-level timeout: a plugin that never settles holds the
/// caller until the realm is dropped or poisoned.
pub async fn run_capability(
    realm: &Rc<Realm>,
    proxy: &Arc<HostProxy>,
    capability: Capability,
    args: Vec<Value>,
) -> Result<Value, PluginError> {
    let _active = realm.track_call();
    let thrown = |message: String| PluginError::Thrown {
        plugin: realm.name().to_string(),
        action: capability.method().to_string(),
        message,
    };

    let task = realm.invoke(capability, args).map_err(|e| match e {
        PluginError::Sandbox(message) => thrown(message),
        other => other,
    })?;
    schedule_ops(realm, proxy);

    loop {
        let notified = realm.settled().notified();
        let state = realm.poll(task)?;
        schedule_ops(realm, proxy);
        match state {
            TaskState::Pending => notified.await,
            TaskState::Resolved { value } => return Ok(value),
            TaskState::Rejected { error } => return Err(thrown(error)),
        }
    }
}
