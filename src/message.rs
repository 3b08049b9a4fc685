//! Inbound event messages and the artifact vocabulary shared with rules.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Severity of a message.
///
/// Decodes from the lowercase names or from the numeric levels used on the
/// bus (10 debug, 20 info, 30 warning, 40 error).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn from_level(level: u64) -> Option<Self> {
        match level {
            10 => Some(Severity::Debug),
            20 => Some(Severity::Info),
            30 => Some(Severity::Warning),
            40 => Some(Severity::Error),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "debug" => Some(Severity::Debug),
            "info" => Some(Severity::Info),
            "warning" | "warn" => Some(Severity::Warning),
            "error" => Some(Severity::Error),
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        match Value::deserialize(deserializer)? {
            Value::String(s) => Severity::from_name(&s)
                .ok_or_else(|| D::Error::custom(format!("unknown severity '{}'", s))),
            Value::Number(n) => n
                .as_u64()
                .and_then(Severity::from_level)
                .ok_or_else(|| D::Error::custom(format!("unknown severity level {}", n))),
            other => Err(D::Error::custom(format!("invalid severity: {}", other))),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        f.write_str(name)
    }
}

/// Kind of artifact a message can refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    #[serde(alias = "rpms", alias = "package")]
    Packages,
    #[serde(alias = "container")]
    Containers,
    #[serde(alias = "module")]
    Modules,
    #[serde(alias = "flatpak")]
    Flatpaks,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 4] = [
        ArtifactKind::Packages,
        ArtifactKind::Containers,
        ArtifactKind::Modules,
        ArtifactKind::Flatpaks,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Packages => "packages",
            ArtifactKind::Containers => "containers",
            ArtifactKind::Modules => "modules",
            ArtifactKind::Flatpaks => "flatpaks",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "packages" | "package" | "rpms" => Some(ArtifactKind::Packages),
            "containers" | "container" => Some(ArtifactKind::Containers),
            "modules" | "module" => Some(ArtifactKind::Modules),
            "flatpaks" | "flatpak" => Some(ArtifactKind::Flatpaks),
            _ => None,
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named artifact of a given kind, e.g. the `firefox` package.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Artifact {
    #[serde(rename = "type")]
    pub kind: ArtifactKind,
    pub name: String,
}

impl Artifact {
    pub fn new(kind: ArtifactKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    /// Parse the `kind/name` shorthand, e.g. `packages/firefox`.
    pub fn parse(value: &str) -> Option<Self> {
        let (kind, name) = value.split_once('/')?;
        let kind = ArtifactKind::from_name(kind)?;
        if name.is_empty() {
            return None;
        }
        Some(Self::new(kind, name))
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// An event message as delivered by the bus. Never mutated by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub topic: String,
    #[serde(default)]
    pub app_name: Option<String>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub agent_name: Option<String>,
    /// Set when the sender also publishes the same event with a newer schema.
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default)]
    pub packages: BTreeSet<String>,
    #[serde(default)]
    pub containers: BTreeSet<String>,
    #[serde(default)]
    pub modules: BTreeSet<String>,
    #[serde(default)]
    pub flatpaks: BTreeSet<String>,
    #[serde(default)]
    pub usernames: BTreeSet<String>,
    #[serde(default)]
    pub groups: BTreeSet<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub body: Value,
}

impl Message {
    /// Minimal message with an id and a topic, everything else empty.
    pub fn new(id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
            app_name: None,
            severity: Severity::default(),
            agent_name: None,
            deprecated: false,
            packages: BTreeSet::new(),
            containers: BTreeSet::new(),
            modules: BTreeSet::new(),
            flatpaks: BTreeSet::new(),
            usernames: BTreeSet::new(),
            groups: BTreeSet::new(),
            summary: None,
            url: None,
            timestamp: None,
            body: Value::Null,
        }
    }

    /// Names of the artifacts of one kind this message refers to.
    pub fn artifacts(&self, kind: ArtifactKind) -> &BTreeSet<String> {
        match kind {
            ArtifactKind::Packages => &self.packages,
            ArtifactKind::Containers => &self.containers,
            ArtifactKind::Modules => &self.modules,
            ArtifactKind::Flatpaks => &self.flatpaks,
        }
    }

    pub fn refers_to(&self, artifact: &Artifact) -> bool {
        self.artifacts(artifact.kind).contains(&artifact.name)
    }

    pub fn agent(&self) -> Option<&str> {
        self.agent_name.as_deref()
    }
}
