//! QuickJS plugin realms.
//!
//! Each plugin runs in its own runtime and context with a heap ceiling, a
//! stack ceiling and a wall-clock interrupt budget. The realm exposes no
//! ambient host objects: everything a plugin can reach is provisioned by
//! the prelude from a private `native` object (logging, bounded timers,
//! mediated fetch and the library allow-list).

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use regex::Regex;
use rquickjs::{
    CatchResultExt, CaughtError, Context, Ctx, Exception, Function, Object, Persistent, Runtime,
};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Notify;

use crate::capability::{Capability, CapabilitySet};
use crate::error::PluginError;
use crate::host_functions::{self, FetchRequest, FetchResponse};
use crate::modules;

const PRELUDE: &str = include_str!("js/prelude.js");

const EXPORT_DEFAULT_PATTERN: &str = r"(?m)^\s*export\s+default\s+";

// ─── Configuration ──────────────────────────────────────────────────────

/// Limits applied to every plugin realm.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum heap in bytes (default: 64 MB).
    pub memory_limit: usize,
    /// Maximum native stack in bytes (default: 1 MB).
    pub max_stack_size: usize,
    /// Wall-clock budget for a plugin's top-level code (default: 10).
    pub load_timeout_secs: u64,
    /// Budget for any single synchronous entry into a loaded realm (default: 10).
    pub execution_slice_secs: u64,
    /// Longest delay `setTimeout` accepts (default: 10000).
    pub max_timer_ms: u64,
    /// How long a proxied fetch waits for the parent (default: 15).
    pub fetch_timeout_secs: u64,
    /// Reject fetches aimed at loopback, private or metadata hosts.
    pub block_private_hosts: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit: 64 * 1024 * 1024,
            max_stack_size: 1024 * 1024,
            load_timeout_secs: 10,
            execution_slice_secs: 10,
            max_timer_ms: 10_000,
            fetch_timeout_secs: 15,
            block_private_hosts: true,
        }
    }
}

impl SandboxConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            memory_limit: std::env::var("PLUGIN_MEMORY_LIMIT_MB")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .map(|mb| mb * 1024 * 1024)
                .unwrap_or(defaults.memory_limit),
            max_stack_size: std::env::var("PLUGIN_MAX_STACK_KB")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .map(|kb| kb * 1024)
                .unwrap_or(defaults.max_stack_size),
            load_timeout_secs: std::env::var("PLUGIN_LOAD_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.load_timeout_secs),
            execution_slice_secs: std::env::var("PLUGIN_EXECUTION_SLICE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.execution_slice_secs),
            max_timer_ms: std::env::var("PLUGIN_MAX_TIMER_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_timer_ms),
            fetch_timeout_secs: std::env::var("PLUGIN_FETCH_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.fetch_timeout_secs),
            block_private_hosts: std::env::var("PLUGIN_BLOCK_PRIVATE_HOSTS")
                .map(|v| !(v.eq_ignore_ascii_case("false") || v == "0"))
                .unwrap_or(defaults.block_private_hosts),
        }
    }
}

// ─── Execution budget ───────────────────────────────────────────────────

/// Deadline checked from the QuickJS interrupt handler.
#[derive(Debug, Clone, Default)]
struct ExecutionBudget {
    deadline: Arc<Mutex<Option<Instant>>>,
    tripped: Arc<AtomicBool>,
}

impl ExecutionBudget {
    fn arm(&self, window: Duration) {
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now() + window);
        self.tripped.store(false, Ordering::SeqCst);
    }

    fn disarm(&self) {
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    /// Returns true once the armed deadline has passed.
    fn expired(&self) -> bool {
        let deadline = *self.deadline.lock().unwrap_or_else(|e| e.into_inner());
        let expired = deadline.is_some_and(|d| Instant::now() >= d);
        if expired {
            self.tripped.store(true, Ordering::SeqCst);
        }
        expired
    }
}

// ─── Host operations ────────────────────────────────────────────────────

/// Work a realm asked the host to do, collected while JS runs and
/// scheduled once control returns to the event loop.
#[derive(Debug, Clone, PartialEq)]
pub enum HostOp {
    Timer { id: u32, delay: Duration },
    Fetch { id: u32, request: FetchRequest },
}

#[derive(Debug)]
pub struct HostOps {
    next_id: u32,
    queued: Vec<HostOp>,
    max_timer_ms: u64,
    block_private_hosts: bool,
}

impl HostOps {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            next_id: 0,
            queued: Vec::new(),
            max_timer_ms: config.max_timer_ms,
            block_private_hosts: config.block_private_hosts,
        }
    }

    fn allocate(&mut self) -> u32 {
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.next_id
    }

    /// Queue a timer. Delays above the ceiling are rejected before anything
    /// is scheduled; negative or non-numeric delays fire immediately.
    pub fn schedule_timer(&mut self, delay_ms: f64) -> Result<u32, PluginError> {
        let delay_ms = if delay_ms.is_finite() && delay_ms > 0.0 {
            delay_ms
        } else {
            0.0
        };
        if delay_ms > self.max_timer_ms as f64 {
            return Err(PluginError::TimerCeiling {
                requested: delay_ms.ceil() as u64,
                max: self.max_timer_ms,
            });
        }
        let id = self.allocate();
        self.queued.push(HostOp::Timer {
            id,
            delay: Duration::from_secs_f64(delay_ms / 1000.0),
        });
        Ok(id)
    }

    pub fn queue_fetch(&mut self, mut request: FetchRequest) -> Result<u32, PluginError> {
        host_functions::validate_fetch_request(&mut request, self.block_private_hosts)?;
        let id = self.allocate();
        self.queued.push(HostOp::Fetch { id, request });
        Ok(id)
    }

    pub fn drain(&mut self) -> Vec<HostOp> {
        std::mem::take(&mut self.queued)
    }
}

// ─── Realm ──────────────────────────────────────────────────────────────

/// Progress of one capability call inside a realm.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Resolved {
        #[serde(default)]
        value: Value,
    },
    Rejected {
        error: String,
    },
}

/// One isolated plugin instance.
pub struct Realm {
    // Declared first: must be released before the context and runtime.
    internals: Persistent<Object<'static>>,
    context: Context,
    runtime: Runtime,
    name: String,
    capabilities: CapabilitySet,
    budget: ExecutionBudget,
    slice_secs: u64,
    ops: Rc<RefCell<HostOps>>,
    poisoned: Cell<bool>,
    retired: Cell<bool>,
    active_calls: Cell<usize>,
    settled: Notify,
}

impl std::fmt::Debug for Realm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Realm")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .field("poisoned", &self.poisoned.get())
            .field("retired", &self.retired.get())
            .field("active_calls", &self.active_calls.get())
            .finish_non_exhaustive()
    }
}

fn sandbox_error(e: rquickjs::Error) -> PluginError {
    PluginError::Sandbox(e.to_string())
}

fn describe_caught(error: CaughtError<'_>) -> String {
    match error {
        CaughtError::Exception(exception) => exception
            .message()
            .unwrap_or_else(|| "uncaught exception".to_string()),
        other => other.to_string(),
    }
}

/// Wrap plugin source as a CommonJS-style function. A top-level
/// `export default` is rewritten into an assignment on `module.exports`.
fn wrap_source(code: &str) -> Result<String, PluginError> {
    let export_default = Regex::new(EXPORT_DEFAULT_PATTERN)
        .map_err(|e| PluginError::Sandbox(format!("invalid export regex: {e}")))?;
    let body = export_default.replace_all(code, "module.exports.default = ");
    Ok(format!(
        "(function (module, exports, require, console, setTimeout, clearTimeout, fetch) {{\n{body}\n}})"
    ))
}

fn drain_jobs(runtime: &Runtime, budget: &ExecutionBudget, plugin: &str) {
    loop {
        match runtime.execute_pending_job() {
            Ok(true) => {}
            Ok(false) => break,
            Err(_) => {
                if budget.tripped() {
                    break;
                }
                tracing::debug!(plugin = %plugin, "pending job raised an exception");
            }
        }
    }
}

fn install_host_natives<'js>(
    ctx: &Ctx<'js>,
    native: &Object<'js>,
    name: &str,
    ops: &Rc<RefCell<HostOps>>,
) -> rquickjs::Result<()> {
    let plugin = name.to_string();
    native.set(
        "log",
        Function::new(ctx.clone(), move |level: String, message: String| {
            host_functions::plugin_log(&plugin, &level, &message)
        })?,
    )?;

    let timers = Rc::clone(ops);
    native.set(
        "timer",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, delay: f64| {
            timers
                .borrow_mut()
                .schedule_timer(delay)
                .map_err(|e| Exception::throw_range(&ctx, &e.to_string()))
        })?,
    )?;

    let fetches = Rc::clone(ops);
    native.set(
        "fetch",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, request: String| {
            let request: FetchRequest = serde_json::from_str(&request).map_err(|e| {
                Exception::throw_type(&ctx, &format!("invalid fetch request: {e}"))
            })?;
            fetches
                .borrow_mut()
                .queue_fetch(request)
                .map_err(|e| Exception::throw_type(&ctx, &e.to_string()))
        })?,
    )?;
    Ok(())
}

type Bootstrapped<'js> = (Object<'js>, Option<Vec<String>>);

fn bootstrap<'js>(
    ctx: &Ctx<'js>,
    name: &str,
    source: &str,
    ops: &Rc<RefCell<HostOps>>,
) -> rquickjs::Result<Bootstrapped<'js>> {
    let native = Object::new(ctx.clone())?;
    install_host_natives(ctx, &native, name, ops)?;
    modules::install(ctx, &native)?;

    let libraries: Function = ctx.eval(modules::LIBRARIES)?;
    let prelude: Function = ctx.eval(PRELUDE)?;
    let internals: Object = prelude.call((native, libraries))?;

    let wrapper: Function = ctx.eval(source)?;
    let load: Function = internals.get("load")?;
    let methods: Vec<&str> = Capability::ALL.iter().map(|c| c.method()).collect();
    let detected: Option<Vec<String>> = load.call((wrapper, methods))?;
    Ok((internals, detected))
}

impl Realm {
    /// Build a realm, run the plugin's top-level code under the load budget
    /// and probe its exported object for capabilities.
    pub fn build(name: &str, code: &str, config: &SandboxConfig) -> Result<Self, PluginError> {
        let source = wrap_source(code)?;

        let runtime = Runtime::new().map_err(sandbox_error)?;
        runtime.set_memory_limit(config.memory_limit);
        runtime.set_max_stack_size(config.max_stack_size);
        let budget = ExecutionBudget::default();
        let watchdog = budget.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || watchdog.expired())));
        let context = Context::full(&runtime).map_err(sandbox_error)?;
        let ops = Rc::new(RefCell::new(HostOps::new(config)));

        budget.arm(Duration::from_secs(config.load_timeout_secs));
        let loaded = context.with(|ctx| {
            bootstrap(&ctx, name, &source, &ops)
                .catch(&ctx)
                .map(|(internals, detected)| (Persistent::save(&ctx, internals), detected))
                .map_err(describe_caught)
        });
        drain_jobs(&runtime, &budget, name);
        budget.disarm();

        if budget.tripped() {
            return Err(PluginError::LoadTimeout {
                plugin: name.to_string(),
                secs: config.load_timeout_secs,
            });
        }
        let (internals, detected) = loaded.map_err(|message| PluginError::Load {
            plugin: name.to_string(),
            message,
        })?;
        let Some(detected) = detected else {
            return Err(PluginError::InvalidExport(name.to_string()));
        };
        let capabilities: CapabilitySet = detected
            .iter()
            .filter_map(|method| Capability::from_action(method))
            .collect();

        tracing::debug!(plugin = %name, capabilities = capabilities.len(), "realm initialized");

        Ok(Self {
            internals,
            context,
            runtime,
            name: name.to_string(),
            capabilities,
            budget,
            slice_secs: config.execution_slice_secs,
            ops,
            poisoned: Cell::new(false),
            retired: Cell::new(false),
            active_calls: Cell::new(0),
            settled: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.get()
    }

    /// Mark the realm as no longer registered. Calls already dispatched
    /// against it keep running; background timers and fetches stop once
    /// the last of them finishes.
    pub fn retire(&self) {
        if !self.retired.replace(true) {
            tracing::debug!(plugin = %self.name, active = self.active_calls.get(), "realm retired");
        }
    }

    /// True when the realm is retired and no call still depends on it.
    /// A dormant realm gets no further host operations.
    pub fn is_dormant(&self) -> bool {
        self.retired.get() && self.active_calls.get() == 0
    }

    /// Count a capability call as in flight until the guard is dropped.
    pub fn track_call(&self) -> ActiveCall<'_> {
        self.active_calls.set(self.active_calls.get() + 1);
        ActiveCall { realm: self }
    }

    fn interrupted(&self) -> PluginError {
        PluginError::Interrupted {
            plugin: self.name.clone(),
            secs: self.slice_secs,
        }
    }

    /// Run `f` against the realm's internals, then drain the microtask
    /// queue, all under one execution slice.
    fn enter<R>(
        &self,
        f: impl for<'js> FnOnce(&Ctx<'js>, &Object<'js>) -> rquickjs::Result<R>,
    ) -> Result<R, PluginError> {
        if self.poisoned.get() {
            return Err(self.interrupted());
        }
        self.budget.arm(Duration::from_secs(self.slice_secs));
        let outcome = self.context.with(|ctx| {
            self.internals
                .clone()
                .restore(&ctx)
                .and_then(|internals| f(&ctx, &internals))
                .catch(&ctx)
                .map_err(describe_caught)
        });
        drain_jobs(&self.runtime, &self.budget, &self.name);
        self.budget.disarm();

        if self.budget.tripped() {
            self.poisoned.set(true);
            tracing::warn!(
                plugin = %self.name,
                secs = self.slice_secs,
                "plugin exceeded its execution slice, realm poisoned"
            );
            return Err(self.interrupted());
        }
        outcome.map_err(PluginError::Sandbox)
    }

    /// Start a capability call. Returns the task id to poll.
    ///
    /// Plugin code run here may settle other calls' promises, so waiters
    /// are woken afterwards whatever the outcome.
    pub fn invoke(&self, capability: Capability, args: Vec<Value>) -> Result<u32, PluginError> {
        let args = serde_json::to_string(&args)?;
        let started = self.enter(move |_ctx, internals| {
            let invoke: Function = internals.get("invoke")?;
            invoke.call((capability.method(), args))
        });
        self.notify_settled();
        started
    }

    /// Current state of a task. Settled tasks are removed once reported.
    pub fn poll(&self, task: u32) -> Result<TaskState, PluginError> {
        let state: String = self.enter(move |_ctx, internals| {
            let take: Function = internals.get("take")?;
            take.call((task,))
        })?;
        Ok(serde_json::from_str(&state)?)
    }

    pub fn fire_timer(&self, id: u32) -> Result<(), PluginError> {
        self.enter(move |_ctx, internals| {
            let fire: Function = internals.get("fireTimer")?;
            fire.call::<_, ()>((id,))
        })
    }

    pub fn settle_fetch(
        &self,
        id: u32,
        outcome: Result<FetchResponse, PluginError>,
    ) -> Result<(), PluginError> {
        let (ok, payload) = match outcome {
            Ok(response) => (true, serde_json::to_string(&response)?),
            Err(e) => (false, e.to_string()),
        };
        self.enter(move |_ctx, internals| {
            let settle: Function = internals.get("settleFetch")?;
            settle.call::<_, ()>((id, ok, payload))
        })
    }

    /// Timers and fetches queued since the last call.
    pub fn take_ops(&self) -> Vec<HostOp> {
        self.ops.borrow_mut().drain()
    }

    /// Signalled whenever JS ran and task states may have changed.
    pub fn settled(&self) -> &Notify {
        &self.settled
    }

    pub fn notify_settled(&self) {
        self.settled.notify_waiters();
    }
}

/// Guard returned by [`Realm::track_call`].
#[derive(Debug)]
pub struct ActiveCall<'a> {
    realm: &'a Realm,
}

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        let active = &self.realm.active_calls;
        active.set(active.get().saturating_sub(1));
    }
}
