//! Named, compiled extraction policies.
//!
//! A profile refers to a policy by name plus arguments, e.g.
//! `{ policy = "json_list", pointer = "/channels" }`. The name is looked up
//! in a [`PolicyRegistry`] at connector construction time, so an unknown name
//! or bad argument fails before any request is made.
//!
//! | Policy | Input | Output |
//! |--------|-------|--------|
//! | `json_list` | JSON | array at `pointer`; strings become `{url}`, other object keys end up in the child's info |
//! | `json_object` | JSON | object at `pointer` |
//! | `css_links` | HTML | `[{url, name}]` for elements matching `selector` |
//! | `html_meta` | HTML | `{title, description, canonical}` |
//! | `document` | any | top-level JSON object, or `html_meta` for HTML |
//! | `no_children` | any | `[]` |
//! | `no_info` | any | `{}` |

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::error::ExtractionError;
use crate::response::{resolve_url, HtmlDocument, Page, ParsedResponse};

/// A resolved parser or extractor.
pub type Transform = Arc<dyn Fn(&Page) -> Result<Value, ExtractionError> + Send + Sync>;

/// Builds a [`Transform`] from policy arguments. Errors are human-readable
/// reasons.
pub type PolicyFactory = fn(&Map<String, Value>) -> Result<Transform, String>;

/// Name → factory lookup for compiled extraction policies.
#[derive(Clone)]
pub struct PolicyRegistry {
    factories: BTreeMap<String, PolicyFactory>,
}

impl PolicyRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Create a registry pre-loaded with the built-in policies.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("json_list", json_list);
        registry.register("json_object", json_object);
        registry.register("css_links", css_links);
        registry.register("html_meta", |_| Ok(Arc::new(html_meta)));
        registry.register("document", |_| Ok(Arc::new(document)));
        registry.register("no_children", |_| Ok(Arc::new(no_children)));
        registry.register("no_info", |_| Ok(Arc::new(no_info)));
        registry
    }

    /// Register a policy. A later registration replaces an earlier one.
    pub fn register(&mut self, name: &str, factory: PolicyFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Build the named policy. `None` means the name is unknown.
    pub fn build(&self, name: &str, args: &Map<String, Value>) -> Option<Result<Transform, String>> {
        self.factories.get(name).map(|factory| factory(args))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn string_arg(args: &Map<String, Value>, key: &str) -> Result<Option<String>, String> {
    match args.get(key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(format!("argument '{}' must be a string, got {}", key, other)),
    }
}

fn require_json<'a>(page: &'a Page, policy: &str) -> Result<&'a Value, ExtractionError> {
    page.parsed.as_json().ok_or_else(|| {
        ExtractionError::transform(policy, format!("{} is not a JSON document", page.url))
    })
}

fn require_html<'a>(page: &'a Page, policy: &str) -> Result<&'a HtmlDocument, ExtractionError> {
    page.parsed.as_html().ok_or_else(|| {
        ExtractionError::transform(policy, format!("{} is not an HTML document", page.url))
    })
}

fn lookup<'a>(value: &'a Value, pointer: &str, policy: &str) -> Result<&'a Value, ExtractionError> {
    value
        .pointer(pointer)
        .ok_or_else(|| ExtractionError::transform(policy, format!("no value at pointer '{}'", pointer)))
}

fn json_list(args: &Map<String, Value>) -> Result<Transform, String> {
    let pointer = string_arg(args, "pointer")?.unwrap_or_default();
    let url_field = string_arg(args, "url_field")?.unwrap_or_else(|| "url".to_string());
    let name_field = string_arg(args, "name_field")?;

    Ok(Arc::new(move |page: &Page| {
        let root = require_json(page, "json_list")?;
        let items = lookup(root, &pointer, "json_list")?
            .as_array()
            .ok_or_else(|| {
                ExtractionError::transform("json_list", format!("value at '{}' is not an array", pointer))
            })?;

        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Value::String(url) => out.push(json!({ "url": url })),
                Value::Object(map) => {
                    let mut entry = map.clone();
                    if url_field != "url" {
                        if let Some(url) = map.get(&url_field) {
                            entry.insert("url".to_string(), url.clone());
                        }
                    }
                    if let Some(field) = &name_field {
                        if let Some(name) = map.get(field) {
                            entry.insert("name".to_string(), name.clone());
                        }
                    }
                    out.push(Value::Object(entry));
                }
                other => {
                    return Err(ExtractionError::transform(
                        "json_list",
                        format!("list entries must be strings or objects, got {}", other),
                    ))
                }
            }
        }
        Ok(Value::Array(out))
    }))
}

fn json_object(args: &Map<String, Value>) -> Result<Transform, String> {
    let pointer = string_arg(args, "pointer")?.unwrap_or_default();

    Ok(Arc::new(move |page: &Page| {
        let root = require_json(page, "json_object")?;
        let value = lookup(root, &pointer, "json_object")?;
        if !value.is_object() {
            return Err(ExtractionError::transform(
                "json_object",
                format!("value at '{}' is not an object", pointer),
            ));
        }
        Ok(value.clone())
    }))
}

fn css_links(args: &Map<String, Value>) -> Result<Transform, String> {
    let selector = string_arg(args, "selector")?
        .ok_or_else(|| "argument 'selector' is required".to_string())?;
    let attr = string_arg(args, "attr")?.unwrap_or_else(|| "href".to_string());

    // Validate once so a bad selector is a configuration error.
    HtmlDocument::new("<html></html>").select(&selector)?;

    Ok(Arc::new(move |page: &Page| {
        let doc = require_html(page, "css_links")?;
        let nodes = doc
            .select(&selector)
            .map_err(|e| ExtractionError::transform("css_links", e))?;
        Ok(Value::Array(
            nodes
                .into_iter()
                .filter_map(|node| {
                    let target = node.attrs.get(&attr)?;
                    let mut entry = Map::new();
                    entry.insert("url".into(), Value::String(resolve_url(&page.url, target)));
                    if !node.text.is_empty() {
                        entry.insert("name".into(), Value::String(node.text));
                    }
                    Some(Value::Object(entry))
                })
                .collect(),
        ))
    }))
}

fn html_meta(page: &Page) -> Result<Value, ExtractionError> {
    let doc = require_html(page, "html_meta")?;
    let mut info = Map::new();
    if let Some(title) = doc.title().or_else(|| doc.meta("og:title")) {
        info.insert("title".into(), Value::String(title));
    }
    if let Some(desc) = doc.meta("description").or_else(|| doc.meta("og:description")) {
        info.insert("description".into(), Value::String(desc));
    }
    let canonical = doc
        .select("link[rel=\"canonical\"]")
        .ok()
        .and_then(|nodes| nodes.into_iter().find_map(|n| n.attrs.get("href").cloned()));
    if let Some(href) = canonical {
        info.insert("canonical".into(), Value::String(resolve_url(&page.url, &href)));
    }
    Ok(Value::Object(info))
}

fn no_children(_page: &Page) -> Result<Value, ExtractionError> {
    Ok(json!([]))
}

fn no_info(_page: &Page) -> Result<Value, ExtractionError> {
    Ok(json!({}))
}

fn document(page: &Page) -> Result<Value, ExtractionError> {
    match &page.parsed {
        ParsedResponse::Json(Value::Object(map)) => Ok(Value::Object(map.clone())),
        ParsedResponse::Json(other) => Ok(json!({ "value": other })),
        ParsedResponse::Html(_) => html_meta(page),
    }
}
