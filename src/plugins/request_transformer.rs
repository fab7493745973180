use super::{parse_options, PluginOutcome};
use crate::proxy::context::RequestContext;
use anyhow::Result;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;

/// Option shape shared by request-transformer and response-transformer:
/// each operation names the headers / query parameters / JSON body keys it
/// touches. `remove` entries are bare names; `rename` entries are
/// "old:new"; `replace` and `add` entries are "name:value".
#[derive(Debug, Default, Deserialize)]
pub(crate) struct TransformSpec {
    #[serde(default)]
    pub remove: TransformTargets,
    #[serde(default)]
    pub rename: TransformTargets,
    #[serde(default)]
    pub replace: TransformTargets,
    #[serde(default)]
    pub add: TransformTargets,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct TransformTargets {
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default)]
    pub querystring: Vec<String>,
    #[serde(default)]
    pub json: Vec<String>,
}

/// Pre-parsed operations. Header names and values are validated at
/// compile time so a bad entry fails config load, not a live request.
pub(crate) struct CompiledOps {
    remove_headers: Vec<String>,
    remove_query: Vec<String>,
    remove_json: Vec<String>,
    rename_headers: Vec<(String, HeaderName)>,
    rename_query: Vec<(String, String)>,
    rename_json: Vec<(String, String)>,
    replace_headers: Vec<(HeaderName, HeaderValue)>,
    replace_query: Vec<(String, String)>,
    replace_json: Vec<(String, serde_json::Value)>,
    add_headers: Vec<(HeaderName, HeaderValue)>,
    add_query: Vec<(String, String)>,
    add_json: Vec<(String, serde_json::Value)>,
}

impl CompiledOps {
    pub(crate) fn compile(spec: TransformSpec) -> Result<Self> {
        Ok(Self {
            remove_headers: spec.remove.headers,
            remove_query: spec.remove.querystring,
            remove_json: spec.remove.json,
            rename_headers: spec
                .rename
                .headers
                .iter()
                .map(|e| {
                    let (old, new) = split_pair(e)?;
                    Ok((old.to_string(), HeaderName::from_bytes(new.as_bytes())?))
                })
                .collect::<Result<_>>()?,
            rename_query: parse_pairs(&spec.rename.querystring)?,
            rename_json: parse_pairs(&spec.rename.json)?,
            replace_headers: parse_header_pairs(&spec.replace.headers)?,
            replace_query: parse_pairs(&spec.replace.querystring)?,
            replace_json: parse_json_pairs(&spec.replace.json)?,
            add_headers: parse_header_pairs(&spec.add.headers)?,
            add_query: parse_pairs(&spec.add.querystring)?,
            add_json: parse_json_pairs(&spec.add.json)?,
        })
    }

    pub(crate) fn has_json_ops(&self) -> bool {
        !self.remove_json.is_empty()
            || !self.rename_json.is_empty()
            || !self.replace_json.is_empty()
            || !self.add_json.is_empty()
    }

    /// remove → rename → replace → add. `add` never overwrites an
    /// existing header; `replace` only touches existing ones.
    pub(crate) fn apply_headers(&self, headers: &mut HeaderMap) {
        for name in &self.remove_headers {
            headers.remove(name.as_str());
        }
        for (old, new) in &self.rename_headers {
            if let Some(value) = headers.remove(old.as_str()) {
                headers.insert(new.clone(), value);
            }
        }
        for (name, value) in &self.replace_headers {
            if headers.contains_key(name) {
                headers.insert(name.clone(), value.clone());
            }
        }
        for (name, value) in &self.add_headers {
            if !headers.contains_key(name) {
                headers.insert(name.clone(), value.clone());
            }
        }
    }

    pub(crate) fn apply_query(&self, query: &mut Option<String>) {
        if self.remove_query.is_empty()
            && self.rename_query.is_empty()
            && self.replace_query.is_empty()
            && self.add_query.is_empty()
        {
            return;
        }

        let mut pairs: Vec<(String, String)> = query
            .as_deref()
            .unwrap_or("")
            .split('&')
            .filter(|p| !p.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (pair.to_string(), String::new()),
            })
            .collect();

        pairs.retain(|(k, _)| !self.remove_query.contains(k));
        for (old, new) in &self.rename_query {
            for pair in pairs.iter_mut().filter(|(k, _)| k == old) {
                pair.0 = new.clone();
            }
        }
        for (name, value) in &self.replace_query {
            for pair in pairs.iter_mut().filter(|(k, _)| k == name) {
                pair.1 = value.clone();
            }
        }
        for (name, value) in &self.add_query {
            if !pairs.iter().any(|(k, _)| k == name) {
                pairs.push((name.clone(), value.clone()));
            }
        }

        *query = if pairs.is_empty() {
            None
        } else {
            Some(
                pairs
                    .iter()
                    .map(|(k, v)| {
                        if v.is_empty() {
                            k.clone()
                        } else {
                            format!("{}={}", k, v)
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("&"),
            )
        };
    }

    /// Apply JSON body ops. Returns `None` when the body is not a JSON
    /// object — the body is then forwarded untouched.
    pub(crate) fn apply_json(&self, body: &[u8]) -> Option<Bytes> {
        let mut value: serde_json::Value = serde_json::from_slice(body).ok()?;
        let obj = value.as_object_mut()?;

        for key in &self.remove_json {
            obj.remove(key);
        }
        for (old, new) in &self.rename_json {
            if let Some(v) = obj.remove(old) {
                obj.insert(new.clone(), v);
            }
        }
        for (key, v) in &self.replace_json {
            if obj.contains_key(key) {
                obj.insert(key.clone(), v.clone());
            }
        }
        for (key, v) in &self.add_json {
            if !obj.contains_key(key) {
                obj.insert(key.clone(), v.clone());
            }
        }

        serde_json::to_vec(&value).ok().map(Bytes::from)
    }
}

fn split_pair(entry: &str) -> Result<(&str, &str)> {
    entry
        .split_once(':')
        .map(|(a, b)| (a.trim(), b.trim()))
        .ok_or_else(|| anyhow::anyhow!("transformer: entry must be \"name:value\": {}", entry))
}

fn parse_pairs(entries: &[String]) -> Result<Vec<(String, String)>> {
    entries
        .iter()
        .map(|e| {
            let (k, v) = split_pair(e)?;
            Ok((k.to_string(), v.to_string()))
        })
        .collect()
}

fn parse_header_pairs(entries: &[String]) -> Result<Vec<(HeaderName, HeaderValue)>> {
    entries
        .iter()
        .map(|e| {
            let (k, v) = split_pair(e)?;
            Ok((HeaderName::from_bytes(k.as_bytes())?, HeaderValue::from_str(v)?))
        })
        .collect()
}

/// JSON entry values keep their JSON type when they parse as one
/// ("count:3" stores a number), otherwise they are stored as strings.
fn parse_json_pairs(entries: &[String]) -> Result<Vec<(String, serde_json::Value)>> {
    entries
        .iter()
        .map(|e| {
            let (k, v) = split_pair(e)?;
            let value = serde_json::from_str(v).unwrap_or(serde_json::Value::String(v.to_string()));
            Ok((k.to_string(), value))
        })
        .collect()
}

pub(crate) fn is_json_content(headers: &HeaderMap) -> bool {
    headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("application/json") || ct.contains("+json"))
        .unwrap_or(false)
}

/// Mutates the outbound request: headers, query string, and JSON body.
pub struct RequestTransformer {
    ops: CompiledOps,
}

impl RequestTransformer {
    pub fn new(options: &serde_json::Value) -> Result<Self> {
        let spec: TransformSpec = parse_options(options)?;
        Ok(Self {
            ops: CompiledOps::compile(spec)?,
        })
    }

    pub fn on_access(&self, ctx: &mut RequestContext) -> PluginOutcome {
        self.ops.apply_headers(&mut ctx.headers);
        self.ops.apply_query(&mut ctx.query);

        if self.ops.has_json_ops() && !ctx.body.is_empty() && is_json_content(&ctx.headers) {
            if let Some(body) = self.ops.apply_json(&ctx.body) {
                ctx.body = body;
            }
        }

        PluginOutcome::Continue
    }
}
