//! Wire types for the request/response protocol spoken with the parent
//! process.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::capability::Capability;
use crate::error::PluginError;
use crate::host_functions::{FetchRequest, FetchResponse};

/// Correlation id used when a record is too broken to carry its own.
pub const SENTINEL_ID: &str = "unknown";

/// Action name of inbound replies to host proxy requests.
pub const PROXY_RESPONSE_ACTION: &str = "proxyResponse";

const MAX_LOGGED_RECORD: usize = 512;

/// Reply to exactly one request. `result` is present iff `success`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: Value,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: impl std::fmt::Display) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(error.to_string()),
        }
    }

    /// Error reply for a record whose id could not be recovered.
    pub fn sentinel(error: impl std::fmt::Display) -> Self {
        Self::failure(Value::String(SENTINEL_ID.to_string()), error)
    }
}

/// Out-of-band request asking the parent to perform a network fetch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename = "proxyRequest", rename_all = "camelCase")]
pub struct ProxyRequest {
    pub id: String,
    pub plugin_name: String,
    pub request: FetchRequest,
}

/// Anything the host writes to the protocol stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    Response(Response),
    Proxy(ProxyRequest),
}

impl From<Response> for Outbound {
    fn from(response: Response) -> Self {
        Outbound::Response(response)
    }
}

/// A decoded inbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: Value,
    pub action: String,
    /// Remaining action-specific fields.
    pub payload: Map<String, Value>,
}

/// The parent's answer to a [`ProxyRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyReply {
    pub id: String,
    pub outcome: Result<FetchResponse, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Request(Request),
    ProxyReply(ProxyReply),
}

fn excerpt(record: &[u8]) -> String {
    String::from_utf8_lossy(record)
        .chars()
        .take(MAX_LOGGED_RECORD)
        .collect()
}

/// Decode one raw record.
///
/// On failure the returned `Response` is the single error reply for the
/// record, addressed to the record's id when one could be read and to
/// [`SENTINEL_ID`] otherwise.
pub fn decode(record: &[u8]) -> Result<Inbound, Response> {
    let value: Value = serde_json::from_slice(record).map_err(|e| {
        tracing::warn!(record = %excerpt(record), error = %e, "undecodable record");
        Response::sentinel(PluginError::Protocol(e.to_string()))
    })?;

    let Value::Object(mut fields) = value else {
        tracing::warn!(record = %excerpt(record), "record is not an object");
        return Err(Response::sentinel(PluginError::Protocol(
            "expected a JSON object".into(),
        )));
    };

    let id = fields
        .remove("id")
        .filter(|id| !id.is_null())
        .unwrap_or_else(|| Value::String(SENTINEL_ID.to_string()));

    let action = match fields.remove("action") {
        Some(Value::String(action)) => action,
        _ => {
            tracing::warn!(record = %excerpt(record), "record has no action");
            return Err(Response::failure(
                id,
                PluginError::Protocol("missing action".into()),
            ));
        }
    };

    if action == PROXY_RESPONSE_ACTION {
        let Value::String(id) = id else {
            tracing::warn!(record = %excerpt(record), "proxy response without string id");
            return Err(Response::sentinel(PluginError::Protocol(
                "proxy response id must be a string".into(),
            )));
        };
        return Ok(Inbound::ProxyReply(ProxyReply {
            id,
            outcome: proxy_outcome(fields),
        }));
    }

    Ok(Inbound::Request(Request {
        id,
        action,
        payload: fields,
    }))
}

fn proxy_outcome(mut fields: Map<String, Value>) -> Result<FetchResponse, String> {
    let success = fields
        .get("success")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !success {
        return Err(fields
            .remove("error")
            .and_then(|e| e.as_str().map(str::to_string))
            .unwrap_or_else(|| "proxy request failed".to_string()));
    }
    let result = fields.remove("result").unwrap_or(Value::Null);
    serde_json::from_value(result).map_err(|e| format!("malformed proxy response: {e}"))
}

/// What a request asks the host to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Load { name: String, code: String },
    Unload { name: String },
    ListPlugins,
    Invoke {
        plugin: String,
        capability: Capability,
    },
}

impl Command {
    /// Resolve the action name, then the fields every instance of it needs.
    ///
    /// Capability arguments are validated later, once the target plugin is
    /// known to implement the capability.
    pub fn parse(action: &str, payload: &Map<String, Value>) -> Result<Self, PluginError> {
        let string_field = |field: &'static str| {
            payload
                .get(field)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| PluginError::InvalidField {
                    action: action.to_string(),
                    field,
                })
        };

        match action {
            "load" => Ok(Command::Load {
                name: string_field("name")?,
                code: string_field("code")?,
            }),
            "unload" => Ok(Command::Unload {
                name: string_field("name")?,
            }),
            "listPlugins" => Ok(Command::ListPlugins),
            other => match Capability::from_action(other) {
                Some(capability) => Ok(Command::Invoke {
                    plugin: string_field("pluginName")?,
                    capability,
                }),
                None => Err(PluginError::UnknownAction(other.to_string())),
            },
        }
    }
}
