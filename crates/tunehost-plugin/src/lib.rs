//! TuneHost Plugin Host
//!
//! Runs untrusted MusicFree-style JavaScript music plugins in isolated
//! QuickJS realms and serves them over a newline-delimited JSON protocol.
//! Each plugin gets its own runtime with heap, stack and wall-clock limits;
//! the only ways out of a realm are bounded timers, a fetch that is proxied
//! through the controlling process, a fixed set of library modules and
//! structured logging.
//!
//! # Protocol
//!
//! One JSON object per line in each direction. Requests carry `id`, `action`
//! and the action's fields side by side.
//!
//! ```text
//! -> {"id": 1, "action": "load", "name": "kw", "code": "module.exports = {...}"}
//! <- {"id": 1, "success": true, "result": {"name": "kw", "capabilities": ["search"]}}
//! -> {"id": 2, "action": "search", "pluginName": "kw", "params": {"keywords": "x"}}
//! <- {"type": "proxyRequest", "id": "proxy-<uuid>", "pluginName": "kw", "request": {...}}
//! -> {"id": "proxy-<uuid>", "action": "proxyResponse", "success": true, "result": {"status": 200, "headers": {}, "body": "..."}}
//! <- {"id": 2, "success": true, "result": {"isEnd": true, "data": [...]}}
//! ```
//!
//! Responses may arrive in any order; callers correlate them by `id`.
//! Records that cannot be attributed to a request are answered with
//! `"id": "unknown"`.

pub mod capability;
pub mod dispatcher;
pub mod error;
pub mod framer;
pub mod host;
pub mod host_functions;
pub mod modules;
pub mod protocol;
pub mod registry;
pub mod sandbox;
pub mod scheduler;
pub mod validator;

pub use capability::{Capability, CapabilitySet};
pub use dispatcher::Dispatcher;
pub use error::PluginError;
pub use framer::{Frame, RecordCodec};
pub use host::{HostConfig, PluginHost};
pub use host_functions::{FetchRequest, FetchResponse, HostProxy};
pub use protocol::{Outbound, Request, Response};
pub use registry::{LoadedPlugin, PluginRegistry, PluginSummary};
pub use sandbox::{Realm, SandboxConfig};
