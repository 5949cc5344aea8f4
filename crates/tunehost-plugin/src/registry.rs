//! Plugin registry: the single owned table of loaded plugins.
//!
//! The host loop is single-threaded, so the table lives behind a `RefCell`
//! and entries are handed out as `Rc`s. A call that already holds an entry
//! keeps using that instance even if the name is reloaded or unloaded
//! meanwhile.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::capability::{Capability, CapabilitySet};
use crate::error::PluginError;
use crate::sandbox::{Realm, SandboxConfig};

// ─── Loaded plugin entry ────────────────────────────────────────────────

/// A loaded plugin with its realm and load metadata.
#[derive(Debug)]
pub struct LoadedPlugin {
    name: String,
    realm: Rc<Realm>,
    loaded_at: DateTime<Utc>,
}

impl LoadedPlugin {
    pub fn new(name: &str, realm: Realm) -> Self {
        Self {
            name: name.to_string(),
            realm: Rc::new(realm),
            loaded_at: Utc::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn realm(&self) -> &Rc<Realm> {
        &self.realm
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        self.realm.capabilities()
    }

    pub fn implements(&self, capability: Capability) -> bool {
        self.realm.capabilities().contains(capability)
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }
}

/// Listing entry returned by `listPlugins`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSummary {
    pub name: String,
    pub capabilities: CapabilitySet,
    pub loaded_at: DateTime<Utc>,
    /// Set once the plugin overran its execution slice; calls fail until
    /// it is reloaded.
    pub poisoned: bool,
}

// ─── Registry ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct PluginRegistry {
    plugins: RefCell<HashMap<String, Rc<LoadedPlugin>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a realm for `code` and register it under `name`.
    ///
    /// On failure nothing is registered and any previous entry for the
    /// name stays in place.
    pub fn load(
        &self,
        name: &str,
        code: &str,
        config: &SandboxConfig,
    ) -> Result<Rc<LoadedPlugin>, PluginError> {
        let realm = Realm::build(name, code, config)?;
        let plugin = Rc::new(LoadedPlugin::new(name, realm));
        if self.put(Rc::clone(&plugin)).is_some() {
            tracing::info!(plugin = %name, "plugin replaced");
        } else {
            tracing::info!(plugin = %name, "plugin loaded");
        }
        Ok(plugin)
    }

    /// Insert or replace an entry. Returns the entry it displaced, which
    /// is retired.
    pub fn put(&self, plugin: Rc<LoadedPlugin>) -> Option<Rc<LoadedPlugin>> {
        let displaced = self
            .plugins
            .borrow_mut()
            .insert(plugin.name().to_string(), plugin);
        if let Some(old) = &displaced {
            old.realm().retire();
        }
        displaced
    }

    pub fn get(&self, name: &str) -> Result<Rc<LoadedPlugin>, PluginError> {
        self.plugins
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| PluginError::NotFound(name.to_string()))
    }

    /// Remove an entry. Removing an unknown name is not an error.
    pub fn remove(&self, name: &str) -> bool {
        let Some(removed) = self.plugins.borrow_mut().remove(name) else {
            return false;
        };
        removed.realm().retire();
        tracing::info!(plugin = %name, "plugin unloaded");
        true
    }

    pub fn loaded_count(&self) -> usize {
        self.plugins.borrow().len()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.plugins.borrow().contains_key(name)
    }

    /// Every loaded plugin, sorted by name.
    pub fn loaded_plugins(&self) -> Vec<PluginSummary> {
        let mut summaries: Vec<PluginSummary> = self
            .plugins
            .borrow()
            .values()
            .map(|p| PluginSummary {
                name: p.name().to_string(),
                capabilities: p.capabilities().clone(),
                loaded_at: p.loaded_at(),
                poisoned: p.realm().is_poisoned(),
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }
}
