//! Generation-rule filters. A generation rule fires only if all pass.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::tracking::{MatchContext, parse_params};
use crate::error::EvalError;
use crate::message::{Message, Severity};
use crate::topic::TopicPattern;

/// What a filter may look at besides the message.
#[derive(Debug, Clone, Copy)]
pub struct FilterContext<'a> {
    /// Owner of the rule being evaluated.
    pub owner: &'a str,
    /// Bindings from the tracking predicate.
    pub matched: &'a MatchContext,
    pub now: DateTime<Utc>,
}

/// A named filter with validated parameters.
pub trait Filter: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn passes(&self, message: &Message, ctx: &FilterContext<'_>) -> Result<bool, EvalError>;
}

/// `applications`: the message comes from one of the listed applications.
/// Case-insensitive; an empty list passes everything.
#[derive(Debug)]
pub struct Applications {
    names: BTreeSet<String>,
}

impl Applications {
    pub fn from_params(params: &Value) -> Result<Self, String> {
        let names: Vec<String> = serde_json::from_value(params.clone()).map_err(|e| e.to_string())?;
        Ok(Self {
            names: names.into_iter().map(|n| n.to_lowercase()).collect(),
        })
    }
}

impl Filter for Applications {
    fn name(&self) -> &'static str {
        "applications"
    }

    fn passes(&self, message: &Message, _ctx: &FilterContext<'_>) -> Result<bool, EvalError> {
        if self.names.is_empty() {
            return Ok(true);
        }
        Ok(message
            .app_name
            .as_deref()
            .is_some_and(|app| self.names.contains(&app.to_lowercase())))
    }
}

/// `severities`: the message severity is listed. An empty list passes.
#[derive(Debug)]
pub struct Severities {
    levels: BTreeSet<Severity>,
}

impl Severities {
    pub fn from_params(params: &Value) -> Result<Self, String> {
        let levels: Vec<Severity> =
            serde_json::from_value(params.clone()).map_err(|e| e.to_string())?;
        Ok(Self {
            levels: levels.into_iter().collect(),
        })
    }
}

impl Filter for Severities {
    fn name(&self) -> &'static str {
        "severities"
    }

    fn passes(&self, message: &Message, _ctx: &FilterContext<'_>) -> Result<bool, EvalError> {
        Ok(self.levels.is_empty() || self.levels.contains(&message.severity))
    }
}

/// `topic`: the message topic matches a glob. An empty glob passes.
#[derive(Debug)]
pub struct Topic {
    pattern: Option<TopicPattern>,
}

impl Topic {
    pub fn from_params(params: &Value) -> Result<Self, String> {
        let glob: String = serde_json::from_value(params.clone()).map_err(|e| e.to_string())?;
        if glob.is_empty() {
            return Ok(Self { pattern: None });
        }
        let pattern = TopicPattern::new(&glob).map_err(|e| e.to_string())?;
        Ok(Self {
            pattern: Some(pattern),
        })
    }
}

impl Filter for Topic {
    fn name(&self) -> &'static str {
        "topic"
    }

    fn passes(&self, message: &Message, _ctx: &FilterContext<'_>) -> Result<bool, EvalError> {
        Ok(self
            .pattern
            .as_ref()
            .is_none_or(|p| p.matches(&message.topic)))
    }
}

/// `my_actions`: when `false`, drops messages caused by the rule owner.
#[derive(Debug)]
pub struct MyActions {
    include: bool,
}

impl MyActions {
    pub fn from_params(params: &Value) -> Result<Self, String> {
        let include: bool = serde_json::from_value(params.clone()).map_err(|e| e.to_string())?;
        Ok(Self { include })
    }
}

impl Filter for MyActions {
    fn name(&self) -> &'static str {
        "my_actions"
    }

    fn passes(&self, message: &Message, ctx: &FilterContext<'_>) -> Result<bool, EvalError> {
        Ok(self.include || message.agent() != Some(ctx.owner))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MutedParams {
    #[serde(default)]
    until: Option<DateTime<Utc>>,
}

/// `muted`: blocks everything, optionally only until a point in time.
///
/// Accepts `true`/`false`, `{}` or `{until: <RFC 3339>}`.
#[derive(Debug)]
pub struct Muted {
    active: bool,
    until: Option<DateTime<Utc>>,
}

impl Muted {
    pub fn from_params(params: &Value) -> Result<Self, String> {
        if let Value::Bool(active) = params {
            return Ok(Self {
                active: *active,
                until: None,
            });
        }
        let params: MutedParams = parse_params(params)?;
        Ok(Self {
            active: true,
            until: params.until,
        })
    }
}

impl Filter for Muted {
    fn name(&self) -> &'static str {
        "muted"
    }

    fn passes(&self, _message: &Message, ctx: &FilterContext<'_>) -> Result<bool, EvalError> {
        if !self.active {
            return Ok(true);
        }
        Ok(self.until.is_some_and(|until| ctx.now >= until))
    }
}
