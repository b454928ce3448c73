//! # Code-Registered Routes
//!
//! A builder for routes registered programmatically rather than declared in
//! YAML. These routes carry behavior the YAML schema cannot express: a JSON
//! body validator and the async-ack mode (202 immediately, proxy in the
//! background). Registered routes are consulted before the YAML table.

use crate::routing::table::{Backend, Route, RouteMatch, RouteOptions, RouteTable};
use crate::core::error::GatewayResult;
use axum::http::Method;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;

/// Body validator: `Ok(())` passes, `Err(reason)` rejects with 400.
pub type JsonValidator = Arc<dyn Fn(&[u8]) -> Result<(), String> + Send + Sync>;

/// Behavior attached to a registered route, keyed by route name.
#[derive(Clone, Default)]
pub struct RegisteredOptions {
    pub validate_json: Option<JsonValidator>,
    pub async_ack: bool,
}

/// Build a validator that requires the body to deserialize as `T`.
/// An empty body always passes.
pub fn json_validator<T: DeserializeOwned>() -> JsonValidator {
    Arc::new(|raw: &[u8]| {
        if raw.is_empty() {
            return Ok(());
        }
        serde_json::from_slice::<T>(raw)
            .map(|_| ())
            .map_err(|e| e.to_string())
    })
}

/// Fluent registry for code-declared routes.
#[derive(Default)]
pub struct RouteRegistry {
    routes: Vec<Route>,
    options: HashMap<String, RegisteredOptions>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, path: &str, backend: Backend, opts: RegisteredOptions) -> &mut Self {
        self.add(Method::GET, path, backend, opts)
    }

    pub fn post(&mut self, path: &str, backend: Backend, opts: RegisteredOptions) -> &mut Self {
        self.add(Method::POST, path, backend, opts)
    }

    pub fn put(&mut self, path: &str, backend: Backend, opts: RegisteredOptions) -> &mut Self {
        self.add(Method::PUT, path, backend, opts)
    }

    pub fn patch(&mut self, path: &str, backend: Backend, opts: RegisteredOptions) -> &mut Self {
        self.add(Method::PATCH, path, backend, opts)
    }

    pub fn delete(&mut self, path: &str, backend: Backend, opts: RegisteredOptions) -> &mut Self {
        self.add(Method::DELETE, path, backend, opts)
    }

    fn add(
        &mut self,
        method: Method,
        path: &str,
        backend: Backend,
        opts: RegisteredOptions,
    ) -> &mut Self {
        let name = format!("{method} {path}");
        self.routes.push(Route {
            name: name.clone(),
            match_: RouteMatch {
                path_prefix: String::new(),
                path_pattern: path.to_string(),
                methods: [method].into_iter().collect(),
            },
            backend,
            options: RouteOptions::default(),
        });
        self.options.insert(name, opts);
        self
    }

    /// Compile into a table plus the name-keyed options map.
    pub fn build(self) -> GatewayResult<(RouteTable, HashMap<String, RegisteredOptions>)> {
        let table = RouteTable::new(self.routes)?;
        Ok((table, self.options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct SavePayload {
        #[allow(dead_code)]
        key: String,
    }

    fn backend() -> Backend {
        Backend {
            scheme: "http".into(),
            host: "backend:8080".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_registered_route_matches_and_carries_options() {
        let mut registry = RouteRegistry::new();
        registry.post(
            "/v1/session/{id:int}",
            backend(),
            RegisteredOptions {
                validate_json: Some(json_validator::<SavePayload>()),
                async_ack: true,
            },
        );
        let (table, options) = registry.build().unwrap();

        let (route, params) = table
            .match_route(&Method::POST, "/v1/session/9")
            .expect("registered route should match");
        assert_eq!(route.name, "POST /v1/session/{id:int}");
        assert_eq!(params.get("id"), Some(&"9".to_string()));

        let opts = options.get(&route.name).unwrap();
        assert!(opts.async_ack);
        assert!(opts.validate_json.is_some());
    }

    #[test]
    fn test_json_validator_accepts_matching_body() {
        let validator = json_validator::<SavePayload>();
        assert!(validator(br#"{"key":"abc"}"#).is_ok());
        assert!(validator(b"").is_ok());
        assert!(validator(br#"{"other":1}"#).is_err());
        assert!(validator(b"not json").is_err());
    }
}
