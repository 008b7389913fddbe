//! Sandboxed Lua 5.4 evaluator for profile expressions.
//!
//! A profile field may carry a small Lua chunk instead of a policy name:
//!
//! ```toml
//! channel_extractor = { lua = "return doc.json.channels" }
//! asset_info_parser = { lua = "return { title = html.title() }" }
//! ```
//!
//! The chunk is compiled once when the connector is built (syntax errors are
//! configuration errors) and evaluated in a fresh VM for every page. The
//! chunk's return value is converted to JSON.
//!
//! # Host APIs
//!
//! | Name | Contents |
//! |------|----------|
//! | `doc` | `kind` (`"json"`/`"html"`), `url`, `json` or `text` |
//! | `html` | `select(css)`, `title()`, `meta(name)` (HTML pages only) |
//! | `json` | `parse`, `encode` |
//! | `log` | `info`, `warn`, `error`, `debug` |
//! | `urljoin` | `urljoin(base, href)` |
//!
//! # Sandboxing
//!
//! `os`, `io`, `debug`, `package`, `require`, `load`, `loadfile`, `dofile`
//! and `collectgarbage` are removed. No network or filesystem access is
//! exposed. An instruction hook aborts chunks that run past their deadline.

use std::time::{Duration, Instant};

use mlua::prelude::*;
use serde_json::Value as Json;

use crate::error::{ConfigurationError, ExtractionError};
use crate::policies::Transform;
use crate::response::{resolve_url, HtmlDocument, Page, ParsedResponse};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// A compiled profile expression.
#[derive(Debug, Clone)]
pub struct LuaExpression {
    field: &'static str,
    source: String,
    timeout: Duration,
}

impl LuaExpression {
    /// Check that `source` compiles. Nothing is executed.
    pub fn compile(field: &'static str, source: &str) -> Result<Self, ConfigurationError> {
        let lua = Lua::new();
        lua.load(source)
            .set_name(field)
            .into_function()
            .map_err(|e| ConfigurationError::InvalidExpression {
                field,
                reason: e.to_string(),
            })?;

        Ok(Self {
            field,
            source: source.to_string(),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn into_transform(self) -> Transform {
        std::sync::Arc::new(move |page: &Page| self.evaluate(page))
    }

    /// Run the chunk against one page.
    pub fn evaluate(&self, page: &Page) -> Result<Json, ExtractionError> {
        self.run(page)
            .map_err(|e| ExtractionError::transform(self.field, e))
    }

    fn run(&self, page: &Page) -> LuaResult<Json> {
        let lua = Lua::new();

        let started = Instant::now();
        let limit = self.timeout;
        lua.set_hook(
            mlua::HookTriggers::new().every_nth_instruction(10_000),
            move |_, _| {
                if started.elapsed() > limit {
                    return Err(LuaError::RuntimeError(format!(
                        "expression exceeded its {:?} time limit",
                        limit
                    )));
                }
                Ok(mlua::VmState::Continue)
            },
        );

        register_host_apis(&lua, self.field)?;
        lua.globals().set("doc", page_to_lua(&lua, page)?)?;
        if let ParsedResponse::Html(doc) = &page.parsed {
            register_html_api(&lua, doc.clone())?;
        }

        let result: LuaValue = lua.load(&self.source).set_name(self.field).eval()?;
        from_lua(result)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Sandboxing and host APIs
// ═══════════════════════════════════════════════════════════════════════

/// Globals that reach outside the VM.
const REMOVED_GLOBALS: &[&str] = &[
    "os",
    "io",
    "debug",
    "package",
    "require",
    "load",
    "loadfile",
    "dofile",
    "collectgarbage",
];

fn register_host_apis(lua: &Lua, field: &str) -> LuaResult<()> {
    for name in REMOVED_GLOBALS {
        lua.globals().set(*name, LuaValue::Nil)?;
    }
    register_json_api(lua)?;
    register_log_api(lua, field)?;
    lua.globals().set(
        "urljoin",
        lua.create_function(|_, (base, href): (String, String)| Ok(resolve_url(&base, &href)))?,
    )
}

fn register_json_api(lua: &Lua) -> LuaResult<()> {
    let json = lua.create_table()?;
    json.set(
        "parse",
        lua.create_function(|lua, text: String| {
            let parsed: Json = serde_json::from_str(&text)
                .map_err(|e| LuaError::external(format!("json.parse: {}", e)))?;
            to_lua(lua, &parsed)
        })?,
    )?;
    json.set(
        "encode",
        lua.create_function(|_, value: LuaValue| {
            serde_json::to_string(&from_lua(value)?)
                .map_err(|e| LuaError::external(format!("json.encode: {}", e)))
        })?,
    )?;
    lua.globals().set("json", json)
}

/// `log.<level>(msg)` forwards to `tracing`, tagged with the profile field.
fn register_log_api(lua: &Lua, field: &str) -> LuaResult<()> {
    let log = lua.create_table()?;
    for level in ["debug", "info", "warn", "error"] {
        let expression = field.to_string();
        let emit = lua.create_function(move |_, msg: String| {
            match level {
                "debug" => tracing::debug!(%expression, "{}", msg),
                "warn" => tracing::warn!(%expression, "{}", msg),
                "error" => tracing::error!(%expression, "{}", msg),
                _ => tracing::info!(%expression, "{}", msg),
            }
            Ok(())
        })?;
        log.set(level, emit)?;
    }
    lua.globals().set("log", log)
}

fn register_html_api(lua: &Lua, doc: HtmlDocument) -> LuaResult<()> {
    let html = lua.create_table()?;

    let d = doc.clone();
    html.set(
        "select",
        lua.create_function(move |lua, css: String| {
            let nodes = d.select(&css).map_err(LuaError::external)?;
            let value = serde_json::to_value(&nodes).map_err(LuaError::external)?;
            to_lua(lua, &value)
        })?,
    )?;

    let d = doc.clone();
    html.set("title", lua.create_function(move |_, ()| Ok(d.title()))?)?;
    html.set(
        "meta",
        lua.create_function(move |_, name: String| Ok(doc.meta(&name)))?,
    )?;

    lua.globals().set("html", html)
}

fn page_to_lua(lua: &Lua, page: &Page) -> LuaResult<LuaTable> {
    let doc = lua.create_table()?;
    doc.set("kind", page.parsed.kind())?;
    doc.set("url", page.url.as_str())?;
    match &page.parsed {
        ParsedResponse::Json(value) => doc.set("json", to_lua(lua, value)?)?,
        ParsedResponse::Html(html) => doc.set("text", html.source())?,
    }
    Ok(doc)
}

// ═══════════════════════════════════════════════════════════════════════
// JSON <-> Lua
// ═══════════════════════════════════════════════════════════════════════

fn to_lua(lua: &Lua, value: &Json) -> LuaResult<LuaValue> {
    Ok(match value {
        Json::Null => LuaValue::Nil,
        Json::Bool(b) => LuaValue::Boolean(*b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => LuaValue::Integer(i),
            None => LuaValue::Number(n.as_f64().unwrap_or_default()),
        },
        Json::String(s) => LuaValue::String(lua.create_string(s)?),
        Json::Array(items) => {
            let table = lua.create_table_with_capacity(items.len(), 0)?;
            for (i, item) in items.iter().enumerate() {
                table.raw_set(i + 1, to_lua(lua, item)?)?;
            }
            LuaValue::Table(table)
        }
        Json::Object(map) => {
            let table = lua.create_table_with_capacity(0, map.len())?;
            for (key, item) in map {
                table.raw_set(key.as_str(), to_lua(lua, item)?)?;
            }
            LuaValue::Table(table)
        }
    })
}

/// Tables with a positive border become arrays, any other table an object,
/// so an empty table is `{}`. Functions and userdata become `null`.
fn from_lua(value: LuaValue) -> LuaResult<Json> {
    Ok(match value {
        LuaValue::Nil => Json::Null,
        LuaValue::Boolean(b) => Json::Bool(b),
        LuaValue::Integer(i) => Json::from(i),
        LuaValue::Number(n) => serde_json::Number::from_f64(n).map_or(Json::Null, Json::Number),
        LuaValue::String(s) => Json::String(s.to_str()?.to_string()),
        LuaValue::Table(t) if t.raw_len() > 0 => {
            let mut items = Vec::with_capacity(t.raw_len());
            for i in 1..=t.raw_len() {
                items.push(from_lua(t.raw_get(i)?)?);
            }
            Json::Array(items)
        }
        LuaValue::Table(t) => {
            let mut map = serde_json::Map::new();
            for pair in t.pairs::<String, LuaValue>() {
                let (key, item) = pair?;
                map.insert(key, from_lua(item)?);
            }
            Json::Object(map)
        }
        _ => Json::Null,
    })
}
