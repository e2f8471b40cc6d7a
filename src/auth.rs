//! Actor identity and capability checks
use crate::error::AuthError;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
pub enum ActorType {
    #[n(0)]
    Operator,
    #[n(1)]
    Player,
    #[n(2)]
    Service,
    /// An unauthenticated caller, e.g. someone attempting to log in.
    #[n(3)]
    Anonymous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    ConfigPropose,
    ConfigApprove,
    ConfigApply,
    WagerPlace,
    WagerSettle,
    WagerCancel,
    LedgerPost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub actor_id: String,
    pub actor_type: ActorType,
    pub capabilities: BTreeSet<Capability>,
}

impl Actor {
    pub fn new(actor_id: impl Into<String>, actor_type: ActorType) -> Self {
        Self {
            actor_id: actor_id.into(),
            actor_type,
            capabilities: BTreeSet::new(),
        }
    }

    pub fn with(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn anonymous() -> Self {
        Self::new("anonymous", ActorType::Anonymous)
    }

    pub fn can(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Per-call metadata supplied by the transport layer.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub request_id: String,
    pub credentials: Option<String>,
    pub idempotency_key: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ..Self::default()
        }
    }
    pub fn as_actor(mut self, credentials: impl Into<String>) -> Self {
        self.credentials = Some(credentials.into());
        self
    }
    pub fn idempotent(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Turns request credentials into an actor. Supplied by the authentication layer.
pub trait ActorResolver: Send + Sync {
    fn resolve(&self, ctx: &RequestContext) -> Result<Actor, AuthError>;
}

/// Resolves a fixed table of bearer tokens.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    actors: HashMap<String, Actor>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn register(mut self, token: impl Into<String>, actor: Actor) -> Self {
        self.actors.insert(token.into(), actor);
        self
    }
}

impl ActorResolver for StaticResolver {
    fn resolve(&self, ctx: &RequestContext) -> Result<Actor, AuthError> {
        let token = ctx
            .credentials
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or(AuthError::MissingCredentials)?;
        self.actors
            .get(token)
            .cloned()
            .ok_or(AuthError::UnknownCredentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_registered_tokens_only() {
        let resolver = StaticResolver::new().register(
            "tok-a",
            Actor::new("op_a", ActorType::Operator).with(Capability::ConfigPropose),
        );

        let actor = resolver
            .resolve(&RequestContext::new("r1").as_actor("tok-a"))
            .unwrap();
        assert!(actor.can(Capability::ConfigPropose));
        assert!(!actor.can(Capability::ConfigApply));

        assert_eq!(
            resolver.resolve(&RequestContext::new("r2")),
            Err(AuthError::MissingCredentials)
        );
        assert_eq!(
            resolver.resolve(&RequestContext::new("r3").as_actor("tok-z")),
            Err(AuthError::UnknownCredentials)
        );
    }
}
