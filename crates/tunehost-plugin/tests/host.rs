//! End-to-end tests driving the host loop over in-memory pipes.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::task::{JoinHandle, LocalSet};
use tunehost_plugin::{HostConfig, PluginError, PluginHost};

const ECHO: &str =
    "module.exports = { search(query, page, type) { return {isEnd: true, data: [{title: query}]}; } };";

struct Harness {
    input: DuplexStream,
    output: Lines<BufReader<DuplexStream>>,
    task: JoinHandle<Result<(), PluginError>>,
}

impl Harness {
    fn start(host: PluginHost) -> Self {
        let (input, host_in) = tokio::io::duplex(64 * 1024);
        let (host_out, output) = tokio::io::duplex(64 * 1024);
        let task = tokio::task::spawn_local(host.run(host_in, host_out));
        Self {
            input,
            output: BufReader::new(output).lines(),
            task,
        }
    }

    fn with_config(config: HostConfig) -> Self {
        Self::start(PluginHost::new(config))
    }

    fn new() -> Self {
        Self::with_config(HostConfig::default())
    }

    async fn send_raw(&mut self, raw: &str) {
        self.input.write_all(raw.as_bytes()).await.unwrap();
        self.input.write_all(b"\n").await.unwrap();
    }

    async fn send(&mut self, record: Value) {
        self.send_raw(&record.to_string()).await;
    }

    async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(10), self.output.next_line())
            .await
            .expect("timed out waiting for a record")
            .expect("outbound stream failed")
            .expect("outbound stream closed");
        serde_json::from_str(&line).expect("outbound record is JSON")
    }

    /// Every record written within `window`.
    async fn drain_for(&mut self, window: Duration) -> Vec<Value> {
        let mut records = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(line) = tokio::time::timeout_at(deadline, self.output.next_line()).await {
            match line.unwrap() {
                Some(line) => records.push(serde_json::from_str(&line).unwrap()),
                None => break,
            }
        }
        records
    }

    /// Receive records until the response for `id`, returning it with
    /// everything that arrived before it.
    async fn recv_until(&mut self, id: &str) -> (Value, Vec<Value>) {
        let mut before = Vec::new();
        loop {
            let record = self.recv().await;
            if record["id"] == id && record.get("type").is_none() {
                return (record, before);
            }
            before.push(record);
        }
    }

    async fn call(&mut self, record: Value) -> Value {
        self.send(record).await;
        self.recv().await
    }

    async fn load(&mut self, name: &str, code: &str) -> Value {
        self.call(json!({"id": format!("load-{name}"), "action": "load", "name": name, "code": code}))
            .await
    }

    /// Close the inbound stream and collect everything written until the
    /// host exits.
    async fn finish(self) -> Vec<Value> {
        let Harness {
            input,
            mut output,
            task,
        } = self;
        drop(input);
        let mut records = Vec::new();
        while let Some(line) = output.next_line().await.unwrap() {
            records.push(serde_json::from_str(&line).unwrap());
        }
        task.await.unwrap().unwrap();
        records
    }
}

async fn local<F: Future>(f: F) -> F::Output {
    LocalSet::new().run_until(f).await
}

fn by_id(records: Vec<Value>) -> HashMap<String, Value> {
    records
        .into_iter()
        .map(|r| (r["id"].as_str().unwrap_or_default().to_string(), r))
        .collect()
}

#[tokio::test]
async fn test_echo_search() {
    local(async {
        let mut h = Harness::new();
        let loaded = h.load("echo", ECHO).await;
        assert_eq!(
            loaded,
            json!({"id": "load-echo", "success": true, "result": {"name": "echo", "capabilities": ["search"]}})
        );

        let response = h
            .call(json!({"id": "2", "action": "search", "pluginName": "echo", "params": {"keywords": "test"}}))
            .await;
        assert_eq!(
            response,
            json!({"id": "2", "success": true, "result": {"isEnd": true, "data": [{"title": "test", "platform": "echo"}]}})
        );
        assert!(h.finish().await.is_empty());
    })
    .await;
}

#[tokio::test]
async fn test_unknown_plugin() {
    local(async {
        let mut h = Harness::new();
        let response = h
            .call(json!({"id": 7, "action": "getLyric", "pluginName": "echo", "musicItem": {"id": 1}}))
            .await;
        assert_eq!(
            response,
            json!({"id": 7, "success": false, "error": "Plugin echo not found"})
        );
    })
    .await;
}

#[tokio::test]
async fn test_throwing_load_registers_nothing() {
    local(async {
        let mut h = Harness::new();
        let loaded = h.load("bad", "throw new Error('boom');").await;
        assert_eq!(loaded["success"], json!(false));
        let error = loaded["error"].as_str().unwrap();
        assert!(error.starts_with("failed to load plugin bad"), "{error}");
        assert!(error.contains("boom"), "{error}");

        let response = h
            .call(json!({"id": 2, "action": "search", "pluginName": "bad", "params": "x"}))
            .await;
        assert_eq!(response["error"], "Plugin bad not found");
    })
    .await;
}

#[tokio::test]
async fn test_malformed_record_then_continues() {
    local(async {
        let mut h = Harness::new();
        h.send_raw("{not json").await;
        let error = h.recv().await;
        assert_eq!(error["id"], "unknown");
        assert_eq!(error["success"], json!(false));
        assert!(error["error"].as_str().unwrap().starts_with("invalid record:"));

        h.send_raw("[1, 2]").await;
        assert_eq!(h.recv().await["id"], "unknown");

        let listed = h.call(json!({"id": 1, "action": "listPlugins"})).await;
        assert_eq!(listed, json!({"id": 1, "success": true, "result": []}));
    })
    .await;
}

#[tokio::test]
async fn test_missing_action_keeps_id() {
    local(async {
        let mut h = Harness::new();
        let response = h.call(json!({"id": 3})).await;
        assert_eq!(
            response,
            json!({"id": 3, "success": false, "error": "invalid record: missing action"})
        );
    })
    .await;
}

#[tokio::test]
async fn test_unknown_action() {
    local(async {
        let mut h = Harness::new();
        let response = h.call(json!({"id": 9, "action": "dance"})).await;
        assert_eq!(
            response,
            json!({"id": 9, "success": false, "error": "unknown action: dance"})
        );
    })
    .await;
}

#[tokio::test]
async fn test_unload_twice() {
    local(async {
        let mut h = Harness::new();
        h.load("echo", ECHO).await;
        let first = h.call(json!({"id": 1, "action": "unload", "name": "echo"})).await;
        assert_eq!(first["result"], json!({"removed": true}));
        let second = h.call(json!({"id": 2, "action": "unload", "name": "echo"})).await;
        assert_eq!(second["result"], json!({"removed": false}));

        let response = h
            .call(json!({"id": 3, "action": "search", "pluginName": "echo", "params": "x"}))
            .await;
        assert_eq!(response["error"], "Plugin echo not found");
    })
    .await;
}

#[tokio::test]
async fn test_absent_capability_is_not_an_error() {
    local(async {
        let mut h = Harness::new();
        h.load("echo", ECHO).await;
        let response = h
            .call(json!({"id": 1, "action": "getLyric", "pluginName": "echo", "musicItem": {"id": "1"}}))
            .await;
        assert_eq!(response, json!({"id": 1, "success": true, "result": null}));

        let response = h
            .call(json!({"id": 2, "action": "importMusicSheet", "pluginName": "echo", "urlLike": "https://x"}))
            .await;
        assert_eq!(response, json!({"id": 2, "success": true, "result": []}));
    })
    .await;
}

#[tokio::test]
async fn test_search_keeps_is_end_false() {
    local(async {
        let mut h = Harness::new();
        h.load(
            "paged",
            "module.exports = { search(q, page) { return {isEnd: false, data: [{id: page}]}; } };",
        )
        .await;
        let response = h
            .call(json!({"id": 1, "action": "search", "pluginName": "paged", "params": {"keywords": "x", "page": 2}}))
            .await;
        assert_eq!(
            response["result"],
            json!({"isEnd": false, "data": [{"id": 2, "platform": "paged"}]})
        );
    })
    .await;
}

#[tokio::test]
async fn test_invalid_sheet_result() {
    local(async {
        let mut h = Harness::new();
        h.load(
            "sheet",
            "module.exports = { importMusicSheet() { return 'nope'; } };",
        )
        .await;
        let response = h
            .call(json!({"id": 1, "action": "importMusicSheet", "pluginName": "sheet", "urlLike": "https://x"}))
            .await;
        assert_eq!(
            response["error"],
            "plugin sheet returned an invalid result for importMusicSheet: expected an array, got string"
        );
    })
    .await;
}

#[tokio::test]
async fn test_double_load_is_idempotent() {
    local(async {
        let mut h = Harness::new();
        assert_eq!(h.load("echo", ECHO).await["success"], json!(true));
        assert_eq!(h.load("echo", ECHO).await["success"], json!(true));

        let listed = h.call(json!({"id": 1, "action": "listPlugins"})).await;
        let plugins = listed["result"].as_array().unwrap();
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0]["name"], "echo");
        assert_eq!(plugins[0]["capabilities"], json!(["search"]));
    })
    .await;
}

#[tokio::test]
async fn test_denied_require_at_call_time() {
    local(async {
        let mut h = Harness::new();
        h.load(
            "sneaky",
            "module.exports = { getTopLists() { return require('child_process').exec('id'); } };",
        )
        .await;
        let response = h
            .call(json!({"id": 1, "action": "getTopLists", "pluginName": "sneaky"}))
            .await;
        let error = response["error"].as_str().unwrap();
        assert!(error.starts_with("plugin sneaky failed in getTopLists"), "{error}");
        assert!(
            error.contains("Module 'child_process' is not allowed in plugin sandbox"),
            "{error}"
        );
    })
    .await;
}

#[tokio::test]
async fn test_timer_based_plugin() {
    local(async {
        let mut h = Harness::new();
        h.load(
            "slow",
            "module.exports = { getTopLists() { return new Promise((resolve) => setTimeout(() => resolve([{id: 'hot'}]), 30)); } };",
        )
        .await;
        let response = h
            .call(json!({"id": 1, "action": "getTopLists", "pluginName": "slow"}))
            .await;
        assert_eq!(response["result"], json!([{"id": "hot"}]));
    })
    .await;
}

#[tokio::test]
async fn test_timer_over_ceiling_rejects() {
    local(async {
        let mut h = Harness::new();
        h.load(
            "long",
            "module.exports = { getTopLists() { return new Promise((resolve) => setTimeout(resolve, 60000)); } };",
        )
        .await;
        let response = h
            .call(json!({"id": 1, "action": "getTopLists", "pluginName": "long"}))
            .await;
        let error = response["error"].as_str().unwrap();
        assert!(error.contains("exceeds maximum of 10000ms"), "{error}");
    })
    .await;
}

#[tokio::test]
async fn test_responses_follow_completion_order() {
    local(async {
        let mut h = Harness::new();
        h.load(
            "mixed",
            "module.exports = { getTopLists() { return new Promise((r) => setTimeout(() => r(['slow']), 100)); }, getTopListDetail(item) { return {id: item.id}; } };",
        )
        .await;
        h.send(json!({"id": "slow", "action": "getTopLists", "pluginName": "mixed"}))
            .await;
        h.send(json!({"id": "fast", "action": "getTopListDetail", "pluginName": "mixed", "topListItem": {"id": "t"}}))
            .await;
        assert_eq!(h.recv().await["id"], "fast");
        assert_eq!(h.recv().await["id"], "slow");
    })
    .await;
}

#[tokio::test]
async fn test_proxy_round_trip() {
    local(async {
        let mut h = Harness::new();
        h.load(
            "net",
            "module.exports = { async search(q) { const res = await fetch('https://api.example.com/s?q=' + q, {headers: {'X-Test': '1'}}); const body = await res.json(); return {isEnd: true, data: body.songs}; } };",
        )
        .await;
        h.send(json!({"id": 1, "action": "search", "pluginName": "net", "params": "jay"}))
            .await;

        let proxied = h.recv().await;
        assert_eq!(proxied["type"], "proxyRequest");
        assert_eq!(proxied["pluginName"], "net");
        assert_eq!(proxied["request"]["url"], "https://api.example.com/s?q=jay");
        assert_eq!(proxied["request"]["method"], "GET");
        assert_eq!(proxied["request"]["headers"]["X-Test"], "1");
        let proxy_id = proxied["id"].as_str().unwrap().to_string();
        assert!(proxy_id.starts_with("proxy-"));

        h.send(json!({
            "id": proxy_id,
            "action": "proxyResponse",
            "success": true,
            "result": {"status": 200, "headers": {"content-type": "application/json"}, "body": "{\"songs\":[{\"id\":1}]}"}
        }))
        .await;

        let response = h.recv().await;
        assert_eq!(
            response,
            json!({"id": 1, "success": true, "result": {"isEnd": true, "data": [{"id": 1, "platform": "net"}]}})
        );
    })
    .await;
}

#[tokio::test]
async fn test_proxy_failure_rejects_fetch() {
    local(async {
        let mut h = Harness::new();
        h.load(
            "net",
            "module.exports = { async getLyric(item) { await fetch('https://lyrics.example.com/' + item.id); return {rawLrc: ''}; } };",
        )
        .await;
        h.send(json!({"id": 1, "action": "getLyric", "pluginName": "net", "musicItem": {"id": "9"}}))
            .await;
        let proxied = h.recv().await;
        h.send(json!({"id": proxied["id"], "action": "proxyResponse", "success": false, "error": "connection refused"}))
            .await;

        let response = h.recv().await;
        let error = response["error"].as_str().unwrap();
        assert!(error.starts_with("plugin net failed in getLyric"), "{error}");
        assert!(error.contains("connection refused"), "{error}");
    })
    .await;
}

#[tokio::test]
async fn test_private_fetch_is_denied() {
    local(async {
        let mut h = Harness::new();
        h.load(
            "ssrf",
            "module.exports = { async importMusicItem(url) { await fetch(url); return {}; } };",
        )
        .await;
        let response = h
            .call(json!({"id": 1, "action": "importMusicItem", "pluginName": "ssrf", "urlLike": "http://169.254.169.254/latest"}))
            .await;
        assert_eq!(response["success"], json!(false));
    })
    .await;
}

#[tokio::test]
async fn test_unknown_proxy_reply_is_ignored() {
    local(async {
        let mut h = Harness::new();
        h.send(json!({"id": "proxy-missing", "action": "proxyResponse", "success": true, "result": {"status": 200, "headers": {}, "body": ""}}))
            .await;
        let listed = h.call(json!({"id": 1, "action": "listPlugins"})).await;
        assert_eq!(listed["id"], 1);
    })
    .await;
}

#[tokio::test]
async fn test_oversized_record() {
    local(async {
        let mut h = Harness::with_config(HostConfig {
            max_record_bytes: 64,
            ..HostConfig::default()
        });
        let padding = "x".repeat(200);
        h.send(json!({"id": 1, "action": "listPlugins", "padding": padding}))
            .await;
        assert_eq!(
            h.recv().await,
            json!({"id": "unknown", "success": false, "error": "record exceeds maximum length of 64 bytes"})
        );

        let listed = h.call(json!({"id": 2, "action": "listPlugins"})).await;
        assert_eq!(listed["success"], json!(true));
    })
    .await;
}

#[tokio::test]
async fn test_record_at_limit_accepted_with_either_line_ending() {
    local(async {
        let record = r#"{"id":"crlf","action":"listPlugins"}"#;
        let mut h = Harness::with_config(HostConfig {
            max_record_bytes: record.len(),
            ..HostConfig::default()
        });
        h.send_raw(&format!("{record}\r")).await;
        let first = h.recv().await;
        assert_eq!(first["id"], json!("crlf"));
        assert_eq!(first["success"], json!(true));

        h.send_raw(record).await;
        assert_eq!(h.recv().await["success"], json!(true));

        h.send_raw(&format!("{record}x\r")).await;
        assert_eq!(h.recv().await["id"], json!("unknown"));
    })
    .await;
}

#[tokio::test]
async fn test_oversized_error_reports_enforced_limit() {
    local(async {
        let mut h = Harness::with_config(HostConfig {
            max_record_bytes: 0,
            ..HostConfig::default()
        });
        h.send_raw("ab").await;
        assert_eq!(
            h.recv().await["error"],
            json!("record exceeds maximum length of 1 bytes")
        );
    })
    .await;
}

#[tokio::test]
async fn test_in_flight_call_survives_replacement() {
    local(async {
        let mut h = Harness::new();
        h.load(
            "swap",
            "module.exports = { getTopLists() { return new Promise((r) => setTimeout(() => r(['old']), 100)); } };",
        )
        .await;
        h.send(json!({"id": "before", "action": "getTopLists", "pluginName": "swap"}))
            .await;
        h.send(json!({"id": "reload", "action": "load", "name": "swap", "code": "module.exports = { getTopLists() { return ['new']; } };"}))
            .await;
        h.send(json!({"id": "after", "action": "getTopLists", "pluginName": "swap"}))
            .await;

        let mut records = Vec::new();
        for _ in 0..3 {
            records.push(h.recv().await);
        }
        let records = by_id(records);
        assert_eq!(records["before"]["result"], json!(["old"]));
        assert_eq!(records["reload"]["success"], json!(true));
        assert_eq!(records["after"]["result"], json!(["new"]));
    })
    .await;
}

#[tokio::test]
async fn test_call_settled_by_another_call_is_answered() {
    local(async {
        let mut h = Harness::new();
        h.load(
            "gate",
            "const waiters = []; module.exports = { getLyric() { return new Promise((r) => waiters.push(r)); }, getTopLists() { waiters.splice(0).forEach((r) => r({rawLrc: 'open'})); return []; } };",
        )
        .await;
        h.send(json!({"id": "wait", "action": "getLyric", "pluginName": "gate", "musicItem": {"id": "1"}}))
            .await;
        h.send(json!({"id": "release", "action": "getTopLists", "pluginName": "gate"}))
            .await;

        let records = by_id(vec![h.recv().await, h.recv().await]);
        assert_eq!(records["release"]["result"], json!([]));
        assert_eq!(records["wait"]["result"], json!({"rawLrc": "open"}));
    })
    .await;
}

const PINGER: &str = "function tick() { fetch('https://example.com/ping').catch(() => {}); setTimeout(tick, 20); } tick(); module.exports = {};";

#[tokio::test]
async fn test_unloaded_plugin_stops_background_work() {
    local(async {
        let mut h = Harness::new();
        h.send(json!({"id": "load", "action": "load", "name": "pinger", "code": PINGER}))
            .await;
        let (loaded, _) = h.recv_until("load").await;
        assert_eq!(loaded["success"], json!(true));
        tokio::time::sleep(Duration::from_millis(50)).await;

        h.send(json!({"id": "unload", "action": "unload", "name": "pinger"}))
            .await;
        let (unloaded, before) = h.recv_until("unload").await;
        assert_eq!(unloaded["result"], json!({"removed": true}));
        assert!(before.iter().any(|r| r["type"] == "proxyRequest"));

        let after = h.drain_for(Duration::from_millis(200)).await;
        let proxied = after.iter().filter(|r| r["type"] == "proxyRequest").count();
        assert_eq!(proxied, 0, "{after:?}");
    })
    .await;
}

#[tokio::test]
async fn test_replaced_plugin_stops_background_work() {
    local(async {
        let mut h = Harness::new();
        h.send(json!({"id": "load", "action": "load", "name": "pinger", "code": PINGER}))
            .await;
        h.recv_until("load").await;

        h.send(json!({"id": "reload", "action": "load", "name": "pinger", "code": "module.exports = {};"}))
            .await;
        let (reloaded, _) = h.recv_until("reload").await;
        assert_eq!(reloaded["success"], json!(true));

        let after = h.drain_for(Duration::from_millis(200)).await;
        assert!(after.iter().all(|r| r["type"] != "proxyRequest"), "{after:?}");
    })
    .await;
}

#[tokio::test]
async fn test_eof_lets_in_flight_requests_finish() {
    local(async {
        let mut h = Harness::new();
        h.load(
            "slow",
            "module.exports = { getTopLists() { return new Promise((r) => setTimeout(() => r(['late']), 50)); } };",
        )
        .await;
        h.send(json!({"id": 1, "action": "getTopLists", "pluginName": "slow"}))
            .await;
        let records = h.finish().await;
        assert_eq!(records, vec![json!({"id": 1, "success": true, "result": ["late"]})]);
    })
    .await;
}

#[tokio::test]
async fn test_grace_period_answers_hung_requests() {
    local(async {
        let mut h = Harness::with_config(HostConfig {
            shutdown_grace_secs: 0,
            ..HostConfig::default()
        });
        h.load(
            "hung",
            "module.exports = { getTopLists() { return new Promise(() => {}); } };",
        )
        .await;
        h.send(json!({"id": 1, "action": "getTopLists", "pluginName": "hung"}))
            .await;
        let records = h.finish().await;
        assert_eq!(
            records,
            vec![json!({"id": 1, "success": false, "error": "host is shutting down"})]
        );
    })
    .await;
}

#[tokio::test]
async fn test_preload_directory() {
    local(async {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kw.js"), ECHO).unwrap();
        std::fs::write(dir.path().join("wy.js"), ECHO).unwrap();
        std::fs::write(dir.path().join("broken.js"), "throw new Error('x');").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a plugin").unwrap();

        let host = PluginHost::new(HostConfig {
            plugin_dir: Some(dir.path().to_path_buf()),
            ..HostConfig::default()
        });
        assert_eq!(host.preload_dir().await.unwrap(), 2);
        assert!(host.registry().is_loaded("kw"));
        assert!(!host.registry().is_loaded("broken"));

        let mut h = Harness::start(host);
        let response = h
            .call(json!({"id": 1, "action": "search", "pluginName": "wy", "params": "x"}))
            .await;
        assert_eq!(response["result"]["data"][0]["platform"], "wy");
    })
    .await;
}

#[tokio::test]
async fn test_preload_respects_enabled_list() {
    local(async {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kw.js"), ECHO).unwrap();
        std::fs::write(dir.path().join("wy.js"), ECHO).unwrap();

        let host = PluginHost::new(HostConfig {
            plugin_dir: Some(dir.path().to_path_buf()),
            enabled_plugins: vec!["wy".into()],
            ..HostConfig::default()
        });
        assert_eq!(host.preload_dir().await.unwrap(), 1);
        assert!(host.registry().is_loaded("wy"));
        assert!(!host.registry().is_loaded("kw"));
    })
    .await;
}

#[tokio::test]
async fn test_closed_output_stops_host() {
    local(async {
        let (mut input, host_in) = tokio::io::duplex(1024);
        let (host_out, output) = tokio::io::duplex(1024);
        let task = tokio::task::spawn_local(PluginHost::new(HostConfig::default()).run(host_in, host_out));
        drop(output);
        input
            .write_all(b"{\"id\": 1, \"action\": \"listPlugins\"}\n")
            .await
            .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("host did not stop")
            .unwrap();
        assert!(result.is_err());
    })
    .await;
}
