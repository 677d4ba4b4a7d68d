//! OpenAPI 3.0 aggregation. Components declare their routes and optionally
//! a document fragment; this module merges the fragments into one document
//! and backfills an "undocumented" stub for every installed route no
//! fragment covered. Served at `GET /api-docs`.

use serde_json::{json, Map, Value};

/// `components.*` subkeys that shallow-merge across fragments.
const COMPONENT_SUBKEYS: &[&str] = &[
    "schemas",
    "responses",
    "parameters",
    "examples",
    "requestBodies",
    "headers",
    "securitySchemes",
    "links",
    "callbacks",
];

/// One installed leaf route. `operation` is the handler's own OpenAPI
/// operation object when it declared one.
#[derive(Debug, Clone)]
pub struct RouteDoc {
    pub path: String,
    pub method: String,
    pub operation: Option<Value>,
}

impl RouteDoc {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            path: path.to_string(),
            method: method.to_string(),
            operation: None,
        }
    }

    pub fn with_operation(mut self, operation: Value) -> Self {
        self.operation = Some(operation);
        self
    }

    /// Rebase the route under a mount prefix (`/api/<component>`).
    pub fn mounted_under(mut self, prefix: &str) -> Self {
        let suffix = if self.path == "/" { "" } else { self.path.as_str() };
        self.path = format!("{prefix}{suffix}");
        self
    }
}

fn stub_operation() -> Value {
    json!({
        "description": "Undocumented route.",
        "responses": { "200": { "description": "Undocumented" } }
    })
}

/// Merge fragments and route docs into one OpenAPI 3.0 document.
/// `components.*` subkeys merge shallowly, last writer wins; `security` and
/// `tags` concatenate in fragment order; paths merge per method.
pub fn aggregate(title: &str, version: &str, fragments: &[Value], routes: &[RouteDoc]) -> Value {
    let mut components = Map::new();
    let mut security = Vec::new();
    let mut tags = Vec::new();
    let mut paths = Map::new();

    for fragment in fragments {
        if let Some(fragment_components) = fragment.get("components").and_then(Value::as_object) {
            for subkey in COMPONENT_SUBKEYS {
                let Some(entries) = fragment_components.get(*subkey).and_then(Value::as_object)
                else {
                    continue;
                };
                let target = components
                    .entry(subkey.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                if let Some(target) = target.as_object_mut() {
                    for (key, value) in entries {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }

        if let Some(fragment_security) = fragment.get("security").and_then(Value::as_array) {
            security.extend(fragment_security.iter().cloned());
        }
        if let Some(fragment_tags) = fragment.get("tags").and_then(Value::as_array) {
            tags.extend(fragment_tags.iter().cloned());
        }

        if let Some(fragment_paths) = fragment.get("paths").and_then(Value::as_object) {
            for (path, operations) in fragment_paths {
                let entry = paths
                    .entry(path.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                if let (Some(entry), Some(operations)) =
                    (entry.as_object_mut(), operations.as_object())
                {
                    for (method, operation) in operations {
                        entry.insert(method.clone(), operation.clone());
                    }
                }
            }
        }
    }

    for route in routes {
        let entry = paths
            .entry(route.path.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        let Some(entry) = entry.as_object_mut() else {
            continue;
        };
        if !entry.contains_key(&route.method) {
            entry.insert(
                route.method.clone(),
                route.operation.clone().unwrap_or_else(stub_operation),
            );
        }
    }

    json!({
        "openapi": "3.0.3",
        "info": { "title": title, "version": version },
        "paths": Value::Object(paths),
        "components": Value::Object(components),
        "security": security,
        "tags": tags,
    })
}
