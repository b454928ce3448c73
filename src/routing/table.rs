//! # Route Table
//!
//! Compiles declarative route descriptors into an ordered matcher. A route
//! matches by typed path pattern (`/a/{name}` or `/a/{name:type}`) or by
//! path prefix; when both are present the pattern wins. Patterns compile to
//! anchored regular expressions with named capture groups.

use crate::core::config::RouteDefinition;
use crate::core::error::{GatewayError, GatewayResult};
use axum::http::Method;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};

/// Matcher half of a route descriptor.
#[derive(Debug, Clone, Default)]
pub struct RouteMatch {
    pub path_prefix: String,
    pub path_pattern: String,
    /// Empty set accepts every method.
    pub methods: HashSet<Method>,
}

/// Backend half of a route descriptor.
#[derive(Debug, Clone, Default)]
pub struct Backend {
    pub scheme: String,
    pub host: String,
    /// Empty keeps the client method.
    pub method: String,
    /// Empty forwards the original path.
    pub path_rewrite: String,
}

/// Per-route behavior declared alongside the descriptor.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteOptions {
    pub require_session: bool,
    pub generate_if_missing: bool,
}

/// Immutable route descriptor. `name` doubles as the audit tag and the key
/// into the body-transform and options tables.
#[derive(Debug, Clone, Default)]
pub struct Route {
    pub name: String,
    pub match_: RouteMatch,
    pub backend: Backend,
    pub options: RouteOptions,
}

impl Route {
    /// Build a descriptor from its YAML form.
    pub fn from_definition(def: &RouteDefinition) -> Self {
        let methods = def
            .match_
            .methods
            .iter()
            .filter_map(|m| m.to_uppercase().parse::<Method>().ok())
            .collect();
        Self {
            name: def.name.clone(),
            match_: RouteMatch {
                path_prefix: def.match_.path_prefix.clone(),
                path_pattern: def.match_.path_pattern.clone(),
                methods,
            },
            backend: Backend {
                scheme: def.backend.scheme.clone(),
                host: def.backend.host.clone(),
                method: def.backend.method.clone(),
                path_rewrite: def.backend.path_rewrite.clone(),
            },
            options: RouteOptions {
                require_session: def.options.require_session,
                generate_if_missing: def.options.generate_if_missing,
            },
        }
    }
}

/// Path parameters extracted from a pattern match.
pub type PathParams = HashMap<String, String>;

struct CompiledRoute {
    route: Route,
    regex: Option<Regex>,
    var_names: Vec<String>,
}

/// Ordered route matcher, immutable after construction.
pub struct RouteTable {
    routes: Vec<CompiledRoute>,
}

static VAR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{([a-zA-Z_][a-zA-Z0-9_]*)(?::([a-zA-Z_][a-zA-Z0-9_]*))?\}").expect("var regex")
});

/// Regex fragment for a pattern variable type. Unknown types fall back to
/// `str`.
fn type_fragment(type_name: &str) -> &'static str {
    match type_name.to_ascii_lowercase().as_str() {
        "int" => r"\d+",
        "float" => r"\d+(?:\.\d+)?",
        "path" => r".+",
        "uuid" => {
            r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[1-5][0-9a-fA-F]{3}-[89abAB][0-9a-fA-F]{3}-[0-9a-fA-F]{12}"
        }
        _ => r"[^/]+",
    }
}

/// Compile `/a/{name}` / `/a/{name:type}` into an anchored regex with named
/// captures, remembering variable order.
fn compile_pattern(pattern: &str) -> GatewayResult<(Regex, Vec<String>)> {
    let mut var_names = Vec::new();
    let replaced = VAR_RE.replace_all(pattern, |caps: &regex::Captures<'_>| {
        let name = caps[1].to_string();
        let fragment = type_fragment(caps.get(2).map(|m| m.as_str()).unwrap_or("str"));
        var_names.push(name.clone());
        format!("(?P<{name}>{fragment})")
    });
    let anchored = format!("^{replaced}$");
    let regex = Regex::new(&anchored)
        .map_err(|e| GatewayError::config(format!("invalid path pattern {pattern:?}: {e}")))?;
    Ok((regex, var_names))
}

impl RouteTable {
    /// Compile the descriptors, preserving declaration order.
    pub fn new(routes: Vec<Route>) -> GatewayResult<Self> {
        let mut compiled = Vec::with_capacity(routes.len());
        for route in routes {
            let (regex, var_names) = if route.match_.path_pattern.is_empty() {
                (None, Vec::new())
            } else {
                let (rx, names) = compile_pattern(&route.match_.path_pattern)?;
                (Some(rx), names)
            };
            compiled.push(CompiledRoute {
                route,
                regex,
                var_names,
            });
        }
        Ok(Self { routes: compiled })
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Match a request against the table in declaration order. Pattern
    /// routes yield extracted parameters; prefix routes yield an empty map.
    pub fn match_route(&self, method: &Method, path: &str) -> Option<(&Route, PathParams)> {
        for entry in &self.routes {
            if !entry.route.match_.methods.is_empty()
                && !entry.route.match_.methods.contains(method)
            {
                continue;
            }

            if let Some(regex) = &entry.regex {
                if let Some(caps) = regex.captures(path) {
                    let mut params = PathParams::new();
                    for name in &entry.var_names {
                        if let Some(m) = caps.name(name) {
                            params.insert(name.clone(), m.as_str().to_string());
                        }
                    }
                    return Some((&entry.route, params));
                }
                continue;
            }

            if !entry.route.match_.path_prefix.is_empty()
                && path.starts_with(&entry.route.match_.path_prefix)
            {
                return Some((&entry.route, PathParams::new()));
            }
        }
        None
    }
}

/// Resolve the upstream path: an empty rewrite template forwards the
/// original path; otherwise `{name}` tokens are substituted with the
/// percent-encoded parameter values.
pub fn build_upstream_path(route: &Route, original_path: &str, params: &PathParams) -> String {
    let template = route.backend.path_rewrite.trim();
    if template.is_empty() {
        return original_path.to_string();
    }
    let mut path = template.to_string();
    for (name, value) in params {
        path = path.replace(
            &format!("{{{name}}}"),
            urlencoding::encode(value).as_ref(),
        );
    }
    path
}
