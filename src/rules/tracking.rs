//! Tracking predicates: does a rule care about a message at all?
//!
//! Every predicate answers two questions:
//!
//! - [`TrackingPredicate::prime`]: what must the tracked-criteria pre-filter
//!   contain so that no message this predicate could match is dropped?
//! - [`TrackingPredicate::matches`]: does it match this message?
//!
//! Predicates that need external facts (group membership, artifact
//! ownership) resolve them through the [`Requester`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::EvalError;
use crate::message::{Artifact, ArtifactKind, Message};
use crate::requester::{LookupKind, Requester};
use crate::tracked::TrackedCriteria;

/// Values bound by a successful match, exposed to templates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchContext {
    pub bindings: BTreeMap<String, String>,
}

impl MatchContext {
    pub fn bind(mut self, name: &str, value: impl Into<String>) -> Self {
        self.bindings.insert(name.to_string(), value.into());
        self
    }
}

/// Outcome of a tracking predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchResult {
    NoMatch,
    Matched(MatchContext),
}

impl MatchResult {
    pub fn matched() -> Self {
        MatchResult::Matched(MatchContext::default())
    }

    pub fn from_bool(matched: bool) -> Self {
        if matched {
            Self::matched()
        } else {
            MatchResult::NoMatch
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(self, MatchResult::Matched(_))
    }
}

/// A named tracking predicate with validated parameters.
#[async_trait]
pub trait TrackingPredicate: Send + Sync + fmt::Debug {
    /// Registry name, e.g. `artifacts-owned`.
    fn name(&self) -> &'static str;

    /// Add what this predicate tracks to the pre-filter criteria.
    ///
    /// # Errors
    /// A failed fact lookup. The caller then tracks everything.
    async fn prime(
        &self,
        requester: &Requester,
        tracked: &mut TrackedCriteria,
    ) -> Result<(), EvalError>;

    async fn matches(
        &self,
        message: &Message,
        requester: &Requester,
    ) -> Result<MatchResult, EvalError>;
}

/// Deserialize predicate params; absent params read as an empty object.
pub(crate) fn parse_params<T: DeserializeOwned>(params: &Value) -> Result<T, String> {
    let value = match params {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(value).map_err(|e| e.to_string())
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UsernamesParams {
    usernames: BTreeSet<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GroupsParams {
    groups: BTreeSet<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ArtifactsParams {
    artifacts: BTreeSet<Artifact>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EmptyParams {}

// ============================================================
// Direct attribute predicates
// ============================================================

/// `packages`, `containers`, `modules`, `flatpaks`: the message names one
/// of the listed artifacts of that kind.
#[derive(Debug)]
pub struct ArtifactNames {
    kind: ArtifactKind,
    names: BTreeSet<String>,
}

impl ArtifactNames {
    /// Params: `{<kind>: [names]}`, e.g. `{packages: [firefox]}`.
    pub fn from_params(kind: ArtifactKind, params: &Value) -> Result<Self, String> {
        let mut map: BTreeMap<String, BTreeSet<String>> = parse_params(params)?;
        let names = map
            .remove(kind.as_str())
            .ok_or_else(|| format!("missing field `{}`", kind.as_str()))?;
        if let Some(extra) = map.keys().next() {
            return Err(format!("unknown field `{}`", extra));
        }
        Ok(Self { kind, names })
    }
}

#[async_trait]
impl TrackingPredicate for ArtifactNames {
    fn name(&self) -> &'static str {
        self.kind.as_str()
    }

    async fn prime(&self, _requester: &Requester, tracked: &mut TrackedCriteria) -> Result<(), EvalError> {
        tracked
            .artifacts_mut(self.kind)
            .extend(self.names.iter().cloned());
        Ok(())
    }

    async fn matches(&self, message: &Message, _requester: &Requester) -> Result<MatchResult, EvalError> {
        Ok(MatchResult::from_bool(
            !message.artifacts(self.kind).is_disjoint(&self.names),
        ))
    }
}

/// `artifacts-followed`: any of the listed artifacts is present.
#[derive(Debug)]
pub struct ArtifactsFollowed {
    artifacts: BTreeSet<Artifact>,
}

impl ArtifactsFollowed {
    pub fn from_params(params: &Value) -> Result<Self, String> {
        let params: ArtifactsParams = parse_params(params)?;
        Ok(Self {
            artifacts: params.artifacts,
        })
    }
}

#[async_trait]
impl TrackingPredicate for ArtifactsFollowed {
    fn name(&self) -> &'static str {
        "artifacts-followed"
    }

    async fn prime(&self, _requester: &Requester, tracked: &mut TrackedCriteria) -> Result<(), EvalError> {
        for artifact in &self.artifacts {
            tracked.add_artifact(artifact);
        }
        Ok(())
    }

    async fn matches(&self, message: &Message, _requester: &Requester) -> Result<MatchResult, EvalError> {
        Ok(MatchResult::from_bool(
            self.artifacts.iter().any(|a| message.refers_to(a)),
        ))
    }
}

/// `related-events`: the message concerns one of the listed users.
#[derive(Debug)]
pub struct RelatedEvents {
    usernames: BTreeSet<String>,
}

impl RelatedEvents {
    pub fn from_params(params: &Value) -> Result<Self, String> {
        let params: UsernamesParams = parse_params(params)?;
        Ok(Self {
            usernames: params.usernames,
        })
    }
}

#[async_trait]
impl TrackingPredicate for RelatedEvents {
    fn name(&self) -> &'static str {
        "related-events"
    }

    async fn prime(&self, _requester: &Requester, tracked: &mut TrackedCriteria) -> Result<(), EvalError> {
        tracked.usernames.extend(self.usernames.iter().cloned());
        Ok(())
    }

    async fn matches(&self, message: &Message, _requester: &Requester) -> Result<MatchResult, EvalError> {
        Ok(MatchResult::from_bool(
            !message.usernames.is_disjoint(&self.usernames),
        ))
    }
}

/// `users-followed`: the message was caused by one of the listed users.
#[derive(Debug)]
pub struct UsersFollowed {
    usernames: BTreeSet<String>,
}

impl UsersFollowed {
    pub fn from_params(params: &Value) -> Result<Self, String> {
        let params: UsernamesParams = parse_params(params)?;
        Ok(Self {
            usernames: params.usernames,
        })
    }
}

#[async_trait]
impl TrackingPredicate for UsersFollowed {
    fn name(&self) -> &'static str {
        "users-followed"
    }

    async fn prime(&self, _requester: &Requester, tracked: &mut TrackedCriteria) -> Result<(), EvalError> {
        tracked.agent_names.extend(self.usernames.iter().cloned());
        Ok(())
    }

    async fn matches(&self, message: &Message, _requester: &Requester) -> Result<MatchResult, EvalError> {
        Ok(MatchResult::from_bool(
            message.agent().is_some_and(|a| self.usernames.contains(a)),
        ))
    }
}

/// `everything`: matches every message.
#[derive(Debug)]
pub struct Everything;

impl Everything {
    pub fn from_params(params: &Value) -> Result<Self, String> {
        let _: EmptyParams = parse_params(params)?;
        Ok(Self)
    }
}

#[async_trait]
impl TrackingPredicate for Everything {
    fn name(&self) -> &'static str {
        "everything"
    }

    async fn prime(&self, _requester: &Requester, tracked: &mut TrackedCriteria) -> Result<(), EvalError> {
        tracked.everything = true;
        Ok(())
    }

    async fn matches(&self, _message: &Message, _requester: &Requester) -> Result<MatchResult, EvalError> {
        Ok(MatchResult::matched())
    }
}

// ============================================================
// Fact-backed predicates
// ============================================================

/// First key whose owned artifacts appear in the message.
///
/// A failed lookup for one key does not hide a match on another; it is only
/// reported when no key matched.
async fn owned_artifact_owner<'a>(
    requester: &Requester,
    kind: LookupKind,
    keys: &'a BTreeSet<String>,
    message: &Message,
) -> Result<Option<&'a str>, EvalError> {
    let mut failure = None;

    for key in keys {
        match requester.resolve(kind, key).await {
            Ok(fact) => {
                if fact.artifacts()?.iter().any(|a| message.refers_to(a)) {
                    return Ok(Some(key.as_str()));
                }
            }
            Err(e) => failure = Some(e),
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(None),
    }
}

fn refers_to_any_artifact(message: &Message) -> bool {
    ArtifactKind::ALL
        .iter()
        .any(|kind| !message.artifacts(*kind).is_empty())
}

/// `artifacts-owned`: an artifact a listed user has access to is present.
/// Binds `owner`.
#[derive(Debug)]
pub struct ArtifactsOwned {
    usernames: BTreeSet<String>,
}

impl ArtifactsOwned {
    pub fn from_params(params: &Value) -> Result<Self, String> {
        let params: UsernamesParams = parse_params(params)?;
        Ok(Self {
            usernames: params.usernames,
        })
    }
}

#[async_trait]
impl TrackingPredicate for ArtifactsOwned {
    fn name(&self) -> &'static str {
        "artifacts-owned"
    }

    async fn prime(
        &self,
        requester: &Requester,
        tracked: &mut TrackedCriteria,
    ) -> Result<(), EvalError> {
        for username in &self.usernames {
            let entry = requester.resolve_entry(LookupKind::UserArtifacts, username).await?;
            for artifact in entry.fact.artifacts()? {
                tracked.add_artifact(artifact);
            }
            tracked.note_fact(&entry);
        }
        Ok(())
    }

    async fn matches(
        &self,
        message: &Message,
        requester: &Requester,
    ) -> Result<MatchResult, EvalError> {
        if !refers_to_any_artifact(message) {
            return Ok(MatchResult::NoMatch);
        }
        let owner = owned_artifact_owner(
            requester,
            LookupKind::UserArtifacts,
            &self.usernames,
            message,
        )
        .await?;
        Ok(match owner {
            Some(owner) => MatchResult::Matched(MatchContext::default().bind("owner", owner)),
            None => MatchResult::NoMatch,
        })
    }
}

/// `artifacts-group-owned`: an artifact a listed group has access to is
/// present. Binds `group`.
#[derive(Debug)]
pub struct ArtifactsGroupOwned {
    groups: BTreeSet<String>,
}

impl ArtifactsGroupOwned {
    pub fn from_params(params: &Value) -> Result<Self, String> {
        let params: GroupsParams = parse_params(params)?;
        Ok(Self {
            groups: params.groups,
        })
    }
}

#[async_trait]
impl TrackingPredicate for ArtifactsGroupOwned {
    fn name(&self) -> &'static str {
        "artifacts-group-owned"
    }

    async fn prime(
        &self,
        requester: &Requester,
        tracked: &mut TrackedCriteria,
    ) -> Result<(), EvalError> {
        for group in &self.groups {
            let entry = requester.resolve_entry(LookupKind::GroupArtifacts, group).await?;
            for artifact in entry.fact.artifacts()? {
                tracked.add_artifact(artifact);
            }
            tracked.note_fact(&entry);
        }
        Ok(())
    }

    async fn matches(
        &self,
        message: &Message,
        requester: &Requester,
    ) -> Result<MatchResult, EvalError> {
        if !refers_to_any_artifact(message) {
            return Ok(MatchResult::NoMatch);
        }
        let group =
            owned_artifact_owner(requester, LookupKind::GroupArtifacts, &self.groups, message)
                .await?;
        Ok(match group {
            Some(group) => MatchResult::Matched(MatchContext::default().bind("group", group)),
            None => MatchResult::NoMatch,
        })
    }
}

/// `group-members-followed`: the message was caused by a member of a listed
/// group. Binds `group`.
#[derive(Debug)]
pub struct GroupMembersFollowed {
    groups: BTreeSet<String>,
}

impl GroupMembersFollowed {
    pub fn from_params(params: &Value) -> Result<Self, String> {
        let params: GroupsParams = parse_params(params)?;
        Ok(Self {
            groups: params.groups,
        })
    }
}

#[async_trait]
impl TrackingPredicate for GroupMembersFollowed {
    fn name(&self) -> &'static str {
        "group-members-followed"
    }

    async fn prime(
        &self,
        requester: &Requester,
        tracked: &mut TrackedCriteria,
    ) -> Result<(), EvalError> {
        for group in &self.groups {
            let entry = requester.resolve_entry(LookupKind::GroupMembers, group).await?;
            tracked.agent_names.extend(entry.fact.names()?.iter().cloned());
            tracked.note_fact(&entry);
        }
        Ok(())
    }

    async fn matches(
        &self,
        message: &Message,
        requester: &Requester,
    ) -> Result<MatchResult, EvalError> {
        let Some(agent) = message.agent() else {
            return Ok(MatchResult::NoMatch);
        };

        let mut failure = None;
        for group in &self.groups {
            match requester.resolve(LookupKind::GroupMembers, group).await {
                Ok(fact) => {
                    if fact.names()?.contains(agent) {
                        return Ok(MatchResult::Matched(
                            MatchContext::default().bind("group", group.as_str()),
                        ));
                    }
                }
                Err(e) => failure = Some(e),
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(MatchResult::NoMatch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requester::{Fact, RequesterSettings, StaticFactBackend};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn requester() -> Requester {
        let members = HashMap::from([(
            "packagers".to_string(),
            Fact::Names(["alice".to_string(), "bob".to_string()].into()),
        )]);
        let user_artifacts = HashMap::from([(
            "alice".to_string(),
            Fact::Artifacts([Artifact::new(ArtifactKind::Packages, "firefox")].into()),
        )]);
        let group_artifacts = HashMap::from([(
            "infra".to_string(),
            Fact::Artifacts([Artifact::new(ArtifactKind::Containers, "toolbox")].into()),
        )]);

        Requester::new(RequesterSettings::default())
            .with_backend(Arc::new(StaticFactBackend::new(
                LookupKind::GroupMembers,
                members,
            )))
            .with_backend(Arc::new(StaticFactBackend::new(
                LookupKind::UserArtifacts,
                user_artifacts,
            )))
            .with_backend(Arc::new(StaticFactBackend::new(
                LookupKind::GroupArtifacts,
                group_artifacts,
            )))
    }

    fn message() -> Message {
        let mut msg = Message::new("m1", "prod.bodhi.update.comment");
        msg.packages.insert("firefox".to_string());
        msg.usernames.insert("carol".to_string());
        msg.agent_name = Some("bob".to_string());
        msg
    }

    // ============================================================
    // Params
    // ============================================================

    #[test]
    fn artifact_names_params() {
        assert!(ArtifactNames::from_params(ArtifactKind::Packages, &json!({"packages": ["a"]})).is_ok());

        let err = ArtifactNames::from_params(ArtifactKind::Packages, &json!({})).unwrap_err();
        assert!(err.contains("missing field `packages`"));

        let err = ArtifactNames::from_params(
            ArtifactKind::Modules,
            &json!({"modules": [], "packages": []}),
        )
        .unwrap_err();
        assert!(err.contains("unknown field `packages`"));
    }

    #[test]
    fn unknown_params_are_rejected() {
        assert!(UsersFollowed::from_params(&json!({"users": ["a"]})).is_err());
        assert!(Everything::from_params(&json!({"anything": true})).is_err());
        assert!(Everything::from_params(&Value::Null).is_ok());
        assert!(ArtifactsFollowed::from_params(&json!({"artifacts": [{"type": "nope", "name": "x"}]})).is_err());
    }

    // ============================================================
    // Matching
    // ============================================================

    #[tokio::test]
    async fn artifact_names_match_on_intersection() {
        let r = requester();
        let hit = ArtifactNames::from_params(ArtifactKind::Packages, &json!({"packages": ["firefox", "vim"]})).unwrap();
        let miss = ArtifactNames::from_params(ArtifactKind::Containers, &json!({"containers": ["firefox"]})).unwrap();

        assert!(hit.matches(&message(), &r).await.unwrap().is_match());
        assert!(!miss.matches(&message(), &r).await.unwrap().is_match());
    }

    #[tokio::test]
    async fn artifacts_followed_matches_kind_and_name() {
        let r = requester();
        let pred = ArtifactsFollowed::from_params(&json!({"artifacts": [{"type": "packages", "name": "firefox"}]})).unwrap();
        assert!(pred.matches(&message(), &r).await.unwrap().is_match());

        let other = ArtifactsFollowed::from_params(&json!({"artifacts": [{"type": "flatpaks", "name": "firefox"}]})).unwrap();
        assert!(!other.matches(&message(), &r).await.unwrap().is_match());
    }

    #[tokio::test]
    async fn related_events_and_users_followed() {
        let r = requester();
        let related = RelatedEvents::from_params(&json!({"usernames": ["carol"]})).unwrap();
        let followed = UsersFollowed::from_params(&json!({"usernames": ["carol"]})).unwrap();

        assert!(related.matches(&message(), &r).await.unwrap().is_match());
        // carol is concerned but bob acted
        assert!(!followed.matches(&message(), &r).await.unwrap().is_match());
    }

    #[tokio::test]
    async fn artifacts_owned_binds_owner() {
        let r = requester();
        let pred = ArtifactsOwned::from_params(&json!({"usernames": ["zed", "alice"]})).unwrap();

        match pred.matches(&message(), &r).await.unwrap() {
            MatchResult::Matched(ctx) => assert_eq!(ctx.bindings["owner"], "alice"),
            MatchResult::NoMatch => panic!("Expected a match"),
        }
    }

    #[tokio::test]
    async fn artifacts_owned_skips_lookup_without_artifacts() {
        let r = Requester::new(RequesterSettings::default());
        let pred = ArtifactsOwned::from_params(&json!({"usernames": ["alice"]})).unwrap();
        let msg = Message::new("m2", "prod.fas.user.update");
        // No backend is registered: a lookup would fail.
        assert_eq!(pred.matches(&msg, &r).await.unwrap(), MatchResult::NoMatch);
    }

    #[tokio::test]
    async fn artifacts_group_owned_binds_group() {
        let r = requester();
        let pred = ArtifactsGroupOwned::from_params(&json!({"groups": ["infra"]})).unwrap();
        let mut msg = Message::new("m3", "prod.container.build");
        msg.containers.insert("toolbox".to_string());

        match pred.matches(&msg, &r).await.unwrap() {
            MatchResult::Matched(ctx) => assert_eq!(ctx.bindings["group"], "infra"),
            MatchResult::NoMatch => panic!("Expected a match"),
        }
        assert!(!pred.matches(&message(), &r).await.unwrap().is_match());
    }

    #[tokio::test]
    async fn group_members_followed_uses_agent() {
        let r = requester();
        let pred = GroupMembersFollowed::from_params(&json!({"groups": ["packagers"]})).unwrap();

        assert!(pred.matches(&message(), &r).await.unwrap().is_match());

        let mut anonymous = message();
        anonymous.agent_name = None;
        assert!(!pred.matches(&anonymous, &r).await.unwrap().is_match());
    }

    #[tokio::test]
    async fn lookup_failure_surfaces_when_nothing_matched() {
        let r = Requester::new(RequesterSettings::default());
        let pred = GroupMembersFollowed::from_params(&json!({"groups": ["packagers"]})).unwrap();

        match pred.matches(&message(), &r).await {
            Err(EvalError::LookupFailed { kind, key, .. }) => {
                assert_eq!(kind, LookupKind::GroupMembers);
                assert_eq!(key, "packagers");
            }
            other => panic!("Expected LookupFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn everything_always_matches() {
        let pred = Everything::from_params(&json!({})).unwrap();
        assert!(pred.matches(&message(), &requester()).await.unwrap().is_match());
    }

    // ============================================================
    // Priming
    // ============================================================

    #[tokio::test]
    async fn prime_collects_tracked_values() {
        let r = requester();
        let mut tracked = TrackedCriteria::default();

        ArtifactsOwned::from_params(&json!({"usernames": ["alice"]}))
            .unwrap()
            .prime(&r, &mut tracked)
            .await
            .unwrap();
        GroupMembersFollowed::from_params(&json!({"groups": ["packagers"]}))
            .unwrap()
            .prime(&r, &mut tracked)
            .await
            .unwrap();
        RelatedEvents::from_params(&json!({"usernames": ["carol"]}))
            .unwrap()
            .prime(&r, &mut tracked)
            .await
            .unwrap();

        assert!(tracked.packages.contains("firefox"));
        assert!(tracked.agent_names.contains("alice"));
        assert!(tracked.agent_names.contains("bob"));
        assert!(tracked.usernames.contains("carol"));
        assert!(!tracked.everything);
    }

    #[tokio::test]
    async fn prime_fails_without_backend() {
        let r = Requester::new(RequesterSettings::default());
        let mut tracked = TrackedCriteria::default();
        let pred = ArtifactsGroupOwned::from_params(&json!({"groups": ["infra"]})).unwrap();
        assert!(pred.prime(&r, &mut tracked).await.is_err());
    }
}
