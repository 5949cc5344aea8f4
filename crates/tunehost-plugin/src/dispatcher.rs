//! Capability dispatcher: turns one decoded request into one response.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::capability::{Capability, CapabilityCall};
use crate::error::PluginError;
use crate::host_functions::HostProxy;
use crate::protocol::{Command, Request, Response};
use crate::registry::PluginRegistry;
use crate::sandbox::SandboxConfig;
use crate::{scheduler, validator};

pub struct Dispatcher {
    registry: PluginRegistry,
    proxy: Arc<HostProxy>,
    config: SandboxConfig,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("loaded", &self.registry.loaded_count())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(proxy: Arc<HostProxy>, config: SandboxConfig) -> Self {
        Self {
            registry: PluginRegistry::new(),
            proxy,
            config,
        }
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Handle a request. Never fails: every error becomes a failure response
    /// addressed to the request's id.
    pub async fn dispatch(&self, request: Request) -> Response {
        let Request {
            id,
            action,
            payload,
        } = request;
        tracing::debug!(id = %id, action = %action, "dispatching request");

        match self.execute(&action, &payload).await {
            Ok(result) => Response::success(id, result),
            Err(e) => {
                tracing::warn!(id = %id, action = %action, error = %e, "request failed");
                Response::failure(id, e)
            }
        }
    }

    async fn execute(&self, action: &str, payload: &Map<String, Value>) -> Result<Value, PluginError> {
        match Command::parse(action, payload)? {
            Command::Load { name, code } => self.load(&name, &code),
            Command::Unload { name } => Ok(json!({ "removed": self.registry.remove(&name) })),
            Command::ListPlugins => Ok(serde_json::to_value(self.registry.loaded_plugins())?),
            Command::Invoke { plugin, capability } => {
                self.invoke(&plugin, capability, payload).await
            }
        }
    }

    /// Load (or replace) a plugin. Timers its top-level code started are
    /// scheduled right away.
    pub fn load(&self, name: &str, code: &str) -> Result<Value, PluginError> {
        let plugin = self.registry.load(name, code, &self.config)?;
        scheduler::schedule_ops(plugin.realm(), &self.proxy);
        Ok(json!({
            "name": plugin.name(),
            "capabilities": plugin.capabilities(),
        }))
    }

    async fn invoke(
        &self,
        name: &str,
        capability: Capability,
        payload: &Map<String, Value>,
    ) -> Result<Value, PluginError> {
        // Held for the whole call: a concurrent reload must not affect it.
        let plugin = self.registry.get(name)?;
        if !plugin.implements(capability) {
            tracing::debug!(plugin = %name, action = %capability, "capability not implemented");
            return Ok(validator::empty_result(capability));
        }

        let call = CapabilityCall::from_payload(capability, payload)?;
        let raw =
            scheduler::run_capability(plugin.realm(), &self.proxy, capability, call.into_args())
                .await?;
        validator::normalize(plugin.name(), capability, raw)
    }
}
