//! Fact backend querying a JSON directory service over HTTP.
//!
//! The URL is a template where `{key}` is replaced by the lookup key, e.g.
//! `https://directory.example.org/v1/groups/{key}/members/`. Responses are
//! either a JSON array or an object wrapping the array in `result`. Names
//! may be plain strings or objects carrying `username`, `groupname` or `name`;
//! artifacts may be `kind/name` strings or `{"type": ..., "name": ...}` objects.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;

use super::{Fact, FactBackend, InvalidationPolicy, LookupKind};
use crate::config::{HttpServiceConfig, SecretString, resolve_env_vars};
use crate::error::{ConfigError, LookupError};
use crate::message::{Artifact, Message};
use crate::topic::TopicPattern;

/// Keys are user and group names; anything else is refused before it reaches a URL.
static KEY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._@+-]*$").expect("valid regex"));

pub struct HttpFactBackend {
    kind: LookupKind,
    client: reqwest::Client,
    /// URL template; may embed credentials, so never logged.
    url_template: SecretString,
    headers: HeaderMap,
    policy: InvalidationPolicy,
}

impl HttpFactBackend {
    pub fn from_config(
        kind: LookupKind,
        config: &HttpServiceConfig,
        client: reqwest::Client,
    ) -> Result<Self, ConfigError> {
        let invalid = |message: String| ConfigError::InvalidService {
            kind: kind.to_string(),
            message,
        };

        let url = resolve_env_vars(&config.url).map_err(|e| invalid(format!("url: {}", e)))?;
        if !url.contains("{key}") {
            return Err(invalid("url must contain the {key} placeholder".to_string()));
        }

        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            let resolved =
                resolve_env_vars(value).map_err(|e| invalid(format!("header '{}': {}", key, e)))?;
            let name = HeaderName::from_str(key)
                .map_err(|_| invalid(format!("invalid header name: {}", key)))?;
            let value = HeaderValue::from_str(&resolved)
                .map_err(|_| invalid(format!("invalid header value for '{}'", key)))?;
            headers.insert(name, value);
        }

        let topics = TopicPattern::compile_all(&config.invalidate_topics)?;

        Ok(Self {
            kind,
            client,
            url_template: SecretString::new(url),
            headers,
            policy: InvalidationPolicy::new(topics),
        })
    }

    fn url_for(&self, key: &str) -> Result<String, LookupError> {
        if !KEY_REGEX.is_match(key) {
            return Err(LookupError::InvalidKey(key.to_string()));
        }
        Ok(self.url_template.expose().replace("{key}", key))
    }
}

#[async_trait]
impl FactBackend for HttpFactBackend {
    fn kind(&self) -> LookupKind {
        self.kind
    }

    async fn fetch(&self, key: &str) -> Result<Fact, LookupError> {
        let url = self.url_for(key)?;

        let response = self
            .client
            .get(&url)
            .headers(self.headers.clone())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| LookupError::Fetch(e.without_url().to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            tracing::debug!(kind = %self.kind, key = %key, "Directory has no entry, using empty fact");
            return Ok(self.kind.empty_fact());
        }
        if !status.is_success() {
            return Err(LookupError::Fetch(format!("HTTP {}", status.as_u16())));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| LookupError::Decode(e.without_url().to_string()))?;

        decode_fact(self.kind, body)
    }

    fn invalidation_signal(&self, message: &Message) -> Vec<String> {
        self.policy.keys(self.kind, message)
    }
}

impl std::fmt::Debug for HttpFactBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFactBackend")
            .field("kind", &self.kind)
            .field("url_template", &self.url_template)
            .field("policy", &self.policy)
            .finish()
    }
}

fn decode_fact(kind: LookupKind, body: Value) -> Result<Fact, LookupError> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("result") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(LookupError::Decode(
                    "expected an array or an object with a `result` array".to_string(),
                ));
            }
        },
        other => {
            return Err(LookupError::Decode(format!(
                "expected an array, got {}",
                json_type(&other)
            )));
        }
    };

    match kind {
        LookupKind::GroupMembers => items
            .into_iter()
            .map(decode_name)
            .collect::<Result<BTreeSet<_>, _>>()
            .map(Fact::Names),
        LookupKind::UserArtifacts | LookupKind::GroupArtifacts => items
            .into_iter()
            .map(decode_artifact)
            .collect::<Result<BTreeSet<_>, _>>()
            .map(Fact::Artifacts),
    }
}

fn decode_name(item: Value) -> Result<String, LookupError> {
    match item {
        Value::String(name) => Ok(name),
        Value::Object(map) => ["username", "groupname", "name"]
            .iter()
            .find_map(|field| map.get(*field).and_then(Value::as_str))
            .map(str::to_string)
            .ok_or_else(|| LookupError::Decode("name entry without a name field".to_string())),
        other => Err(LookupError::Decode(format!(
            "expected a name, got {}",
            json_type(&other)
        ))),
    }
}

fn decode_artifact(item: Value) -> Result<Artifact, LookupError> {
    match item {
        Value::String(s) => Artifact::parse(&s)
            .ok_or_else(|| LookupError::Decode(format!("'{}' is not a kind/name artifact", s))),
        other @ Value::Object(_) => {
            serde_json::from_value(other).map_err(|e| LookupError::Decode(e.to_string()))
        }
        other => Err(LookupError::Decode(format!(
            "expected an artifact, got {}",
            json_type(&other)
        ))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
