//! Resource identifiers, methods, and addressable patterns (the RID algebra).
//!
//! A [`Resource`] is a service-scoped namespace exposing [`Method`]s. A
//! `Method` becomes addressable once bound into a [`Pattern`], which knows
//! how to render itself as a bus subject (`EndpointName`/`EndpointSpecific`)
//! or as a REST path (`EndpointREST`).
//!
//! Resources declare their patterns explicitly (see [`Resource::patterns`])
//! rather than via reflection — there is no runtime type inspection here.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

/// The verb a method is exposed under.
///
/// `Internal` methods are reachable only bus-side (never routed at the HTTP
/// edge); `Event` methods are reachable only via publish/monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Verb {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Internal,
    Event,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Get => "GET",
            Verb::Post => "POST",
            Verb::Put => "PUT",
            Verb::Patch => "PATCH",
            Verb::Delete => "DELETE",
            Verb::Internal => "INTERNAL",
            Verb::Event => "EVENT",
        }
    }

    pub fn is_http(&self) -> bool {
        matches!(self, Verb::Get | Verb::Post | Verb::Put | Verb::Patch | Verb::Delete)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A method declared by a [`Resource`]: a verb plus a dot-separated generic
/// endpoint where `$Name` segments mark positional parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Method {
    pub service: String,
    pub label: String,
    pub verb: Verb,
    pub http_prefix: String,
    pub generic_endpoint: String,
    pub public: bool,
}

impl Method {
    pub fn new(
        service: impl Into<String>,
        http_prefix: impl Into<String>,
        label: impl Into<String>,
        generic_endpoint: impl Into<String>,
        verb: Verb,
    ) -> Self {
        Self {
            service: service.into(),
            label: label.into(),
            verb,
            http_prefix: http_prefix.into(),
            generic_endpoint: generic_endpoint.into(),
            public: false,
        }
    }

    /// Mark this method as reachable without a token.
    pub fn public(mut self) -> Self {
        self.public = true;
        self
    }

    /// Names of the `$`-prefixed positional parameters, in order of appearance.
    pub fn param_names(&self) -> Vec<&str> {
        self.generic_endpoint
            .split('.')
            .filter_map(|seg| seg.strip_prefix('$'))
            .collect()
    }

    /// Finalize into an unbound [`Pattern`] — every `$Name` still a placeholder.
    pub fn pattern(&self) -> Pattern {
        Pattern {
            method: self.clone(),
            params: BTreeMap::new(),
            query: None,
        }
    }
}

/// A finalized, addressable endpoint: a [`Method`] plus bound parameters and
/// an optional query-params bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pattern {
    pub method: Method,
    params: BTreeMap<String, String>,
    query: Option<String>,
}

impl Pattern {
    /// Build directly from a method string, e.g. `"users.profile.$ID"`.
    /// Rejects endpoints with fewer than two dot-separated segments.
    pub fn from_str(service: &str, http_prefix: &str, endpoint: &str, verb: Verb) -> Result<Pattern, BrokerError> {
        if endpoint.split('.').count() < 1 || service.is_empty() {
            return Err(BrokerError::InvalidParams("endpoint must be at least `service.leaf`".into()));
        }
        Ok(Method::new(service, http_prefix, endpoint, endpoint, verb).pattern())
    }

    /// Bind named parameters into the `$Name` placeholders of the generic
    /// endpoint. Unbound placeholders remain as `$Name`. Returns a new,
    /// independent `Pattern` — the receiver is never mutated.
    pub fn bind(&self, values: &[(&str, &str)]) -> Pattern {
        let mut params = self.params.clone();
        for (k, v) in values {
            params.insert((*k).to_string(), (*v).to_string());
        }
        Pattern {
            method: self.method.clone(),
            params,
            query: self.query.clone(),
        }
    }

    /// Bind positional parameters left to right into unfilled `$Name` slots.
    pub fn bind_positional(&self, values: &[&dyn fmt::Display]) -> Pattern {
        let names: Vec<String> = self
            .method
            .param_names()
            .into_iter()
            .filter(|n| !self.params.contains_key(*n))
            .map(|n| n.to_string())
            .collect();
        let pairs: Vec<(&str, String)> = names
            .iter()
            .zip(values.iter())
            .map(|(n, v)| (n.as_str(), v.to_string()))
            .collect();
        let borrowed: Vec<(&str, &str)> = pairs.iter().map(|(n, v)| (*n, v.as_str())).collect();
        self.bind(&borrowed)
    }

    pub fn with_query(&self, query: impl Into<String>) -> Pattern {
        Pattern {
            method: self.method.clone(),
            params: self.params.clone(),
            query: Some(query.into()),
        }
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn verb(&self) -> Verb {
        self.method.verb
    }

    pub fn is_public(&self) -> bool {
        self.method.public
    }

    fn render(&self, generic: bool) -> String {
        self.method
            .generic_endpoint
            .split('.')
            .map(|seg| match seg.strip_prefix('$') {
                Some(name) if !generic => self
                    .params
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| seg.to_string()),
                _ => seg.to_string(),
            })
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Routing subject: stable across parameter substitution (P1).
    pub fn endpoint_name(&self) -> String {
        format!("{}.{}.{}", self.method.service, self.render(true), self.method.verb)
    }

    /// Publication subject: reflects bound parameters (P2).
    pub fn endpoint_specific(&self) -> String {
        format!("{}.{}.{}", self.method.service, self.render(false), self.method.verb)
    }

    /// REST path, `$Name` rendered as `{Name}` for unbound params (P3).
    pub fn endpoint_rest(&self) -> String {
        let path = self
            .method
            .generic_endpoint
            .split('.')
            .map(|seg| match seg.strip_prefix('$') {
                Some(name) => self
                    .params
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| format!("{{{name}}}")),
                None => seg.to_string(),
            })
            .collect::<Vec<_>>()
            .join("/");
        let mut rest = format!("/{}/{}/{}", self.method.http_prefix, self.method.service, path);
        if let Some(q) = &self.query {
            rest.push('?');
            rest.push_str(q);
        }
        rest
    }

    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(|s| s.as_str())
    }
}

/// A service-scoped namespace exposing methods. Resources register their
/// patterns explicitly rather than being discovered by reflection.
pub trait Resource: Send + Sync {
    fn service(&self) -> &str;
    fn http_prefix(&self) -> &str;
    fn ws_prefix(&self) -> &str;

    /// API version this resource speaks; `2` enables event-authorization
    /// (`validateMonitor`/`validatePublish`) and the v1 compatibility shims.
    fn api_version(&self) -> u8 {
        2
    }

    /// All non-event patterns exposed by this resource.
    fn patterns(&self) -> Vec<Pattern>;

    /// `Event`-verb patterns exposed by this resource (default: none).
    fn events(&self) -> Vec<Pattern> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Pattern {
        Method::new("serviceTest", "api", "reply", "reply.$ID", Verb::Get).pattern()
    }

    #[test]
    fn endpoint_name_is_stable_under_substitution() {
        let p = sample();
        let bound = p.bind(&[("ID", "42")]);
        assert_eq!(p.endpoint_name(), bound.endpoint_name());
        assert_eq!(bound.endpoint_name(), "serviceTest.reply.$ID.GET");
    }

    #[test]
    fn endpoint_specific_reflects_bound_params() {
        let bound = sample().bind(&[("ID", "42")]);
        assert_eq!(bound.endpoint_specific(), "serviceTest.reply.42.GET");
    }

    #[test]
    fn endpoint_rest_substitutes_braces() {
        let p = sample();
        assert_eq!(p.endpoint_rest(), "/api/serviceTest/reply/{ID}");
        let bound = p.bind(&[("ID", "42")]);
        assert_eq!(bound.endpoint_rest(), "/api/serviceTest/reply/42");
    }

    #[test]
    fn bind_does_not_mutate_receiver() {
        let p = sample();
        let _ = p.bind(&[("ID", "42")]);
        assert_eq!(p.endpoint_specific(), "serviceTest.reply.$ID.GET");
    }

    #[test]
    fn serde_round_trip_preserves_equality() {
        let p = sample().bind(&[("ID", "7")]).with_query("a=b");
        let json = serde_json::to_string(&p).unwrap();
        let back: Pattern = serde_json::from_str(&json).unwrap();
        assert_eq!(p, back);
    }

    #[test]
    fn from_str_rejects_empty_service() {
        assert!(Pattern::from_str("", "api", "leaf", Verb::Get).is_err());
    }
}
