//! Native halves of the library modules plugins may `require`.
//!
//! The JS side of each module lives in `js/libraries.js`; anything that
//! needs real parsing or hashing is delegated to the functions here, which
//! are installed on the realm's private `native` object.

use std::fmt::Write as _;

use base64::Engine as _;
use chrono::{DateTime, Local, TimeZone};
use rquickjs::{Ctx, Exception, Function, Object};
use scraper::{Html, Selector};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::Digest as _;

/// Names `require` resolves. Everything else is rejected.
pub const ALLOWED_MODULES: &[&str] = &["axios", "cheerio", "crypto-js", "dayjs", "he", "qs"];

pub(crate) const LIBRARIES: &str = include_str!("js/libraries.js");

// ─── Encodings & digests ────────────────────────────────────────────────

pub fn utf8_to_hex(text: &str) -> String {
    hex::encode(text.as_bytes())
}

pub fn hex_to_utf8(hex_text: &str) -> Result<String, String> {
    let bytes = hex::decode(hex_text).map_err(|e| format!("invalid hex: {e}"))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub fn normalize_hex(hex_text: &str) -> Result<String, String> {
    hex::decode(hex_text.trim())
        .map(hex::encode)
        .map_err(|e| format!("invalid hex: {e}"))
}

pub fn hex_to_base64(hex_text: &str) -> Result<String, String> {
    let bytes = hex::decode(hex_text).map_err(|e| format!("invalid hex: {e}"))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

pub fn base64_to_hex(encoded: &str) -> Result<String, String> {
    let trimmed = encoded.trim();
    base64::engine::general_purpose::STANDARD
        .decode(trimmed)
        .or_else(|_| base64::engine::general_purpose::STANDARD_NO_PAD.decode(trimmed))
        .map(hex::encode)
        .map_err(|e| format!("invalid base64: {e}"))
}

/// Hash hex-encoded input with the named algorithm, returning hex.
pub fn digest(algorithm: &str, hex_input: &str) -> Result<String, String> {
    let bytes = hex::decode(hex_input).map_err(|e| format!("invalid hex: {e}"))?;
    match algorithm {
        "md5" => Ok(format!("{:x}", md5::compute(&bytes))),
        "sha256" => Ok(hex::encode(sha2::Sha256::digest(&bytes))),
        "sha512" => Ok(hex::encode(sha2::Sha512::digest(&bytes))),
        other => Err(format!("unsupported digest algorithm: {other}")),
    }
}

// ─── Dates ──────────────────────────────────────────────────────────────

/// dayjs format tokens, longest first within each letter.
const DATE_TOKENS: &[(&str, &str)] = &[
    ("YYYY", "%Y"),
    ("YY", "%y"),
    ("MMMM", "%B"),
    ("MMM", "%b"),
    ("MM", "%m"),
    ("M", "%-m"),
    ("DD", "%d"),
    ("D", "%-d"),
    ("dddd", "%A"),
    ("ddd", "%a"),
    ("HH", "%H"),
    ("H", "%-H"),
    ("hh", "%I"),
    ("h", "%-I"),
    ("mm", "%M"),
    ("m", "%-M"),
    ("ss", "%S"),
    ("s", "%-S"),
    ("SSS", "%3f"),
    ("A", "%p"),
    ("a", "%P"),
    ("ZZ", "%z"),
    ("Z", "%:z"),
    ("X", "%s"),
];

/// Translate a dayjs pattern into a chrono format string.
fn translate_pattern(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() * 2);
    let mut rest = pattern;
    while let Some(ch) = rest.chars().next() {
        if ch == '[' {
            if let Some(end) = rest.find(']') {
                out.push_str(&rest[1..end].replace('%', "%%"));
                rest = &rest[end + 1..];
                continue;
            }
        }
        if let Some((token, strftime)) = DATE_TOKENS.iter().find(|(t, _)| rest.starts_with(t)) {
            out.push_str(strftime);
            rest = &rest[token.len()..];
            continue;
        }
        if ch == '%' {
            out.push_str("%%");
        } else {
            out.push(ch);
        }
        rest = &rest[ch.len_utf8()..];
    }
    out
}

pub fn format_datetime<Tz>(at: &DateTime<Tz>, pattern: &str) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    let strftime = translate_pattern(pattern);
    let mut out = String::new();
    // translate_pattern only emits known specifiers.
    let _ = write!(out, "{}", at.format(&strftime));
    out
}

/// Format epoch milliseconds in the host's local zone.
pub fn format_date(epoch_ms: f64, pattern: &str) -> Result<String, String> {
    if !epoch_ms.is_finite() {
        return Err("invalid date".into());
    }
    let at = Local
        .timestamp_millis_opt(epoch_ms as i64)
        .single()
        .ok_or_else(|| format!("timestamp out of range: {epoch_ms}"))?;
    Ok(format_datetime(&at, pattern))
}

// ─── HTML selection ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct HtmlNode {
    name: String,
    html: String,
    inner: String,
    text: String,
    attrs: Map<String, Value>,
}

/// Run a CSS selector over a document or fragment. Returns the matched
/// elements as a JSON array.
pub fn html_select(html: &str, selector: &str, fragment: bool) -> Result<String, String> {
    let parsed =
        Selector::parse(selector).map_err(|e| format!("invalid selector '{selector}': {e}"))?;
    let document = if fragment {
        Html::parse_fragment(html)
    } else {
        Html::parse_document(html)
    };
    let nodes: Vec<HtmlNode> = document
        .select(&parsed)
        .map(|element| HtmlNode {
            name: element.value().name().to_string(),
            html: element.html(),
            inner: element.inner_html(),
            text: element.text().collect(),
            attrs: element
                .value()
                .attrs()
                .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
                .collect(),
        })
        .collect();
    serde_json::to_string(&nodes).map_err(|e| e.to_string())
}

// ─── Query strings ──────────────────────────────────────────────────────

fn flatten_query(prefix: &str, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let name = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}[{key}]")
                };
                flatten_query(&name, child, out);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                flatten_query(&format!("{prefix}[{index}]"), child, out);
            }
        }
        Value::Null => out.push((prefix.to_string(), String::new())),
        Value::String(s) => out.push((prefix.to_string(), s.clone())),
        other => out.push((prefix.to_string(), other.to_string())),
    }
}

pub fn qs_stringify(json: &str) -> Result<String, String> {
    let value: Value = serde_json::from_str(json).map_err(|e| e.to_string())?;
    if !value.is_object() {
        return Ok(String::new());
    }
    let mut pairs = Vec::new();
    flatten_query("", &value, &mut pairs);
    Ok(pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&"))
}

fn key_path(key: &str) -> Vec<String> {
    let Some(open) = key.find('[').filter(|i| *i > 0) else {
        return vec![key.to_string()];
    };
    let mut segments = vec![key[..open].to_string()];
    let mut rest = &key[open..];
    while rest.starts_with('[') {
        let Some(close) = rest.find(']') else { break };
        segments.push(rest[1..close].to_string());
        rest = &rest[close + 1..];
    }
    if !rest.is_empty() {
        if let Some(last) = segments.last_mut() {
            last.push_str(rest);
        }
    }
    segments
}

fn insert_query(target: &mut Map<String, Value>, path: &[String], value: String) {
    let Some((head, tail)) = path.split_first() else {
        return;
    };
    if tail.is_empty() {
        match target.get_mut(head) {
            None => {
                target.insert(head.clone(), Value::String(value));
            }
            Some(Value::Array(items)) => items.push(Value::String(value)),
            Some(existing) => {
                let previous = existing.take();
                *existing = Value::Array(vec![previous, Value::String(value)]);
            }
        }
        return;
    }
    if tail.len() == 1 && tail[0].is_empty() {
        let slot = target
            .entry(head.clone())
            .or_insert_with(|| Value::Array(Vec::new()));
        match slot {
            Value::Array(items) => items.push(Value::String(value)),
            other => {
                let previous = other.take();
                *other = Value::Array(vec![previous, Value::String(value)]);
            }
        }
        return;
    }
    let slot = target
        .entry(head.clone())
        .or_insert_with(|| Value::Object(Map::new()));
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    if let Value::Object(child) = slot {
        insert_query(child, tail, value);
    }
}

/// Objects keyed `0..n` become arrays, as `qs` does for indexed keys.
fn arrayify(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let indexed = !map.is_empty()
                && (0..map.len()).all(|i| map.contains_key(i.to_string().as_str()));
            if indexed {
                let mut map = map;
                Value::Array(
                    (0..map.len())
                        .map(|i| arrayify(map.remove(&i.to_string()).unwrap_or(Value::Null)))
                        .collect(),
                )
            } else {
                Value::Object(map.into_iter().map(|(k, v)| (k, arrayify(v))).collect())
            }
        }
        Value::Array(items) => Value::Array(items.into_iter().map(arrayify).collect()),
        other => other,
    }
}

pub fn qs_parse(query: &str) -> String {
    let query = query.trim_start_matches('?');
    let mut root = Map::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if key.is_empty() {
            continue;
        }
        insert_query(&mut root, &key_path(&key), value.into_owned());
    }
    arrayify(Value::Object(root)).to_string()
}

// ─── Realm installation ─────────────────────────────────────────────────

fn throwing<'js, T>(ctx: &Ctx<'js>, result: Result<T, String>) -> rquickjs::Result<T> {
    result.map_err(|message| Exception::throw_type(ctx, &message))
}

/// Install the library natives on a realm's private `native` object.
pub(crate) fn install<'js>(ctx: &Ctx<'js>, native: &Object<'js>) -> rquickjs::Result<()> {
    native.set("allowedModules", ALLOWED_MODULES.to_vec())?;
    native.set(
        "utf8ToHex",
        Function::new(ctx.clone(), |text: String| utf8_to_hex(&text))?,
    )?;
    native.set(
        "hexToUtf8",
        Function::new(ctx.clone(), |ctx: Ctx<'js>, text: String| {
            throwing(&ctx, hex_to_utf8(&text))
        })?,
    )?;
    native.set(
        "normalizeHex",
        Function::new(ctx.clone(), |ctx: Ctx<'js>, text: String| {
            throwing(&ctx, normalize_hex(&text))
        })?,
    )?;
    native.set(
        "hexToBase64",
        Function::new(ctx.clone(), |ctx: Ctx<'js>, text: String| {
            throwing(&ctx, hex_to_base64(&text))
        })?,
    )?;
    native.set(
        "base64ToHex",
        Function::new(ctx.clone(), |ctx: Ctx<'js>, text: String| {
            throwing(&ctx, base64_to_hex(&text))
        })?,
    )?;
    native.set(
        "digest",
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>, algorithm: String, input: String| {
                throwing(&ctx, digest(&algorithm, &input))
            },
        )?,
    )?;
    native.set(
        "formatDate",
        Function::new(ctx.clone(), |ctx: Ctx<'js>, epoch_ms: f64, pattern: String| {
            throwing(&ctx, format_date(epoch_ms, &pattern))
        })?,
    )?;
    native.set(
        "htmlSelect",
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>, html: String, selector: String, fragment: bool| {
                throwing(&ctx, html_select(&html, &selector, fragment))
            },
        )?,
    )?;
    native.set(
        "qsStringify",
        Function::new(ctx.clone(), |ctx: Ctx<'js>, json: String| {
            throwing(&ctx, qs_stringify(&json))
        })?,
    )?;
    native.set(
        "qsParse",
        Function::new(ctx.clone(), |query: String| qs_parse(&query))?,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_md5_matches_known_vector() {
        let out = digest("md5", &utf8_to_hex("hello")).unwrap();
        assert_eq!(out, "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn test_sha256_matches_known_vector() {
        let out = digest("sha256", &utf8_to_hex("abc")).unwrap();
        assert_eq!(
            out,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_unknown_digest_rejected() {
        assert!(digest("sha1", "00").is_err());
    }

    #[test]
    fn test_base64_conversions() {
        let hex_text = utf8_to_hex("tune");
        let encoded = hex_to_base64(&hex_text).unwrap();
        assert_eq!(encoded, "dHVuZQ==");
        assert_eq!(base64_to_hex("dHVuZQ").unwrap(), hex_text);
        assert!(base64_to_hex("***").is_err());
    }

    #[test]
    fn test_hex_validation() {
        assert_eq!(normalize_hex("ABCD").unwrap(), "abcd");
        assert!(normalize_hex("xyz").is_err());
        assert_eq!(hex_to_utf8("6869").unwrap(), "hi");
    }

    #[test]
    fn test_translate_pattern_tokens() {
        assert_eq!(translate_pattern("YYYY-MM-DD HH:mm:ss"), "%Y-%m-%d %H:%M:%S");
        assert_eq!(translate_pattern("[YYYY] YY"), "YYYY %y");
        assert_eq!(translate_pattern("100%"), "100%%");
    }

    #[test]
    fn test_format_datetime_utc() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).single().unwrap();
        assert_eq!(
            format_datetime(&at, "YYYY-MM-DD HH:mm:ss.SSS"),
            "2023-11-14 22:13:20.123"
        );
        assert_eq!(format_datetime(&at, "M/D/YY"), "11/14/23");
    }

    #[test]
    fn test_format_date_rejects_nan() {
        assert!(format_date(f64::NAN, "YYYY").is_err());
    }

    #[test]
    fn test_html_select_document() {
        let html = r#"<ul><li class="song" data-id="1">One</li><li class="song" data-id="2"><b>Two</b></li></ul>"#;
        let nodes: Value = serde_json::from_str(&html_select(html, "li.song", false).unwrap()).unwrap();
        assert_eq!(nodes.as_array().unwrap().len(), 2);
        assert_eq!(nodes[0]["text"], "One");
        assert_eq!(nodes[1]["attrs"]["data-id"], "2");
        assert_eq!(nodes[1]["inner"], "<b>Two</b>");
        assert_eq!(nodes[1]["name"], "li");
    }

    #[test]
    fn test_html_select_invalid_selector() {
        assert!(html_select("<p></p>", "p[", false).is_err());
    }

    #[test]
    fn test_qs_stringify_nested() {
        let out = qs_stringify(r#"{"q":"a b","page":2,"f":{"x":"1"},"ids":[3,4]}"#).unwrap();
        assert_eq!(out, "f%5Bx%5D=1&ids%5B0%5D=3&ids%5B1%5D=4&page=2&q=a%20b");
    }

    #[test]
    fn test_qs_parse_nested_and_repeated() {
        let parsed: Value = serde_json::from_str(&qs_parse("?a=1&b[c]=2&d[]=x&d[]=y&e=1&e=2&f[0]=p&f[1]=q&s=a+b")).unwrap();
        assert_eq!(
            parsed,
            json!({
                "a": "1",
                "b": {"c": "2"},
                "d": ["x", "y"],
                "e": ["1", "2"],
                "f": ["p", "q"],
                "s": "a b"
            })
        );
    }
}
