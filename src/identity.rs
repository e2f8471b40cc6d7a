//! Session issuance with refresh-token rotation
//!
//! Tokens are never stored in the clear: records are keyed by the sha256 of
//! the token, and that digest is what appears in the audit trail.
use crate::auth::{Actor, ActorType, RequestContext};
use crate::clock::{TimeStamp, later};
use crate::config::SessionConfig;
use crate::envelope::Response;
use crate::error::StoreError;
use crate::executor::{Access, Command, CommandExecutor, Decision, Effect, Request, Substrate};
use crate::lockout::{LockoutPolicy, RateWindow};
use crate::mirror::Tx;
use crate::utils::new_id;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// Checks a secret for an actor. Hash selection lives behind this trait.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, actor_id: &str, secret: &str) -> Option<ActorType>;
}

/// Plain lookup table of secrets, for embedding and tests.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    secrets: HashMap<String, (String, ActorType)>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn register(
        mut self,
        actor_id: impl Into<String>,
        secret: impl Into<String>,
        actor_type: ActorType,
    ) -> Self {
        self.secrets
            .insert(actor_id.into(), (secret.into(), actor_type));
        self
    }
}

impl CredentialVerifier for StaticCredentials {
    fn verify(&self, actor_id: &str, secret: &str) -> Option<ActorType> {
        self.secrets
            .get(actor_id)
            .filter(|(expected, _)| expected == secret)
            .map(|(_, actor_type)| *actor_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct IdentitySession {
    #[n(0)]
    pub token_digest: String,
    #[n(1)]
    pub actor_id: String,
    #[n(2)]
    pub actor_type: ActorType,
    #[n(3)]
    pub issued_at: TimeStamp,
    #[n(4)]
    pub expires_at: TimeStamp,
    #[n(5)]
    pub revoked: bool,
    #[n(6)]
    pub rotated_to: Option<String>, // digest of the replacing token
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct AccessGrant {
    #[n(0)]
    pub actor_id: String,
    #[n(1)]
    pub actor_type: ActorType,
    #[n(2)]
    pub expires_at: TimeStamp,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct TokenPair {
    #[n(0)]
    pub actor_id: String,
    #[n(1)]
    pub access_token: String,
    #[n(2)]
    pub access_expires_at: TimeStamp,
    #[n(3)]
    pub refresh_token: String,
    #[n(4)]
    pub refresh_expires_at: TimeStamp,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode)]
pub struct Login {
    #[n(0)]
    pub actor_id: String,
}

impl Request for Login {
    fn validate(&self) -> Result<(), String> {
        if self.actor_id.trim().is_empty() {
            return Err("actor_id is required".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode)]
pub struct SessionRef {
    #[n(0)]
    pub token_digest: String,
}

impl SessionRef {
    pub fn for_token(refresh_token: &str) -> Self {
        Self {
            token_digest: token_digest(refresh_token),
        }
    }
}

impl Request for SessionRef {}

pub fn token_digest(token: &str) -> String {
    sha256::digest(token)
}

fn session_key(digest: &str) -> String {
    format!("session/{digest}")
}

fn access_key(digest: &str) -> String {
    format!("access/{digest}")
}

pub struct IdentityService {
    executor: CommandExecutor,
    verifier: Arc<dyn CredentialVerifier>,
    lockout: LockoutPolicy,
    rate: RateWindow,
    session: SessionConfig,
}

impl IdentityService {
    pub fn new(substrate: &Substrate, verifier: Arc<dyn CredentialVerifier>) -> Self {
        Self {
            executor: substrate.executor("identity"),
            verifier,
            lockout: LockoutPolicy::from_config(&substrate.config.lockout),
            rate: RateWindow::from_config(&substrate.config.rate_window),
            session: substrate.config.session.clone(),
        }
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    /// Rate window, then lockout, then the credential check itself. Login is
    /// never answered from the idempotency store: the secret is not part of
    /// the fingerprint, so every attempt is checked.
    pub fn login(&self, ctx: &RequestContext, request: Login, secret: &str) -> Response<TokenPair> {
        let command = Command::new(
            "identity",
            &request.actor_id,
            "login",
            Access::Public(Actor::new(&request.actor_id, ActorType::Anonymous)),
        )
        .never_replayed();
        let actor_id = request.actor_id.clone();
        self.executor.execute(ctx, command, &request, |_, tx, now| {
            if !self.rate.try_acquire(tx, &actor_id, now)? {
                return Ok(Decision::Deny("too many attempts".into()));
            }
            if self.lockout.locked_until(tx, &actor_id, now)?.is_some() {
                return Ok(Decision::Deny("actor is locked out".into()));
            }
            let Some(actor_type) = self.verifier.verify(&actor_id, secret) else {
                self.lockout.record_failure(tx, &actor_id, now)?;
                return Ok(Decision::Deny("invalid credentials".into()));
            };
            self.lockout.record_success(tx, &actor_id)?;

            let (pair, session) = self.issue(tx, &actor_id, actor_type, now)?;
            Ok(Decision::Apply(Effect::new(pair).after(&session)?))
        })
    }

    /// Exchange a live refresh token for a new pair. The presented token is
    /// revoked whether or not it is ever used again.
    pub fn refresh(&self, ctx: &RequestContext, refresh_token: &str) -> Response<TokenPair> {
        let request = SessionRef::for_token(refresh_token);
        let command = Command::new(
            "session",
            &request.token_digest,
            "refresh",
            Access::Public(Actor::anonymous()),
        );
        self.executor.execute(ctx, command, &request, |_, tx, now| {
            let key = session_key(&request.token_digest);
            let Some(before) = tx.get::<IdentitySession>(&key)? else {
                return Ok(Decision::Deny("unknown refresh token".into()));
            };
            if before.revoked {
                return Ok(Decision::Deny("session revoked".into()));
            }
            if !before.expires_at.is_after(&now) {
                return Ok(Decision::Deny("session expired".into()));
            }

            let (pair, session) = self.issue(tx, &before.actor_id, before.actor_type, now)?;
            let mut retired = before.clone();
            retired.revoked = true;
            retired.rotated_to = Some(session.token_digest.clone());
            tx.put(&key, &retired)?;

            Ok(Decision::Apply(
                Effect::new(pair).before(&before)?.after(&retired)?,
            ))
        })
    }

    pub fn revoke(&self, ctx: &RequestContext, refresh_token: &str) -> Response<IdentitySession> {
        let request = SessionRef::for_token(refresh_token);
        let command = Command::new(
            "session",
            &request.token_digest,
            "revoke",
            Access::Public(Actor::anonymous()),
        );
        self.executor.execute(ctx, command, &request, |_, tx, _| {
            let key = session_key(&request.token_digest);
            let Some(before) = tx.get::<IdentitySession>(&key)? else {
                return Ok(Decision::Deny("unknown refresh token".into()));
            };
            if before.revoked {
                return Ok(Decision::Deny("session revoked".into()));
            }
            let mut after = before.clone();
            after.revoked = true;
            tx.put(&key, &after)?;

            Ok(Decision::Apply(
                Effect::new(after.clone()).before(&before)?.after(&after)?,
            ))
        })
    }

    /// Resolves an access token that has not yet expired.
    pub fn check_access(&self, access_token: &str) -> Result<Option<AccessGrant>, StoreError> {
        let now = self.executor.clock().now();
        let grant: Option<AccessGrant> = self
            .executor
            .read(|mirror| mirror.get(&access_key(&token_digest(access_token))))?;
        Ok(grant.filter(|g| g.expires_at.is_after(&now)))
    }

    pub fn session(&self, refresh_token: &str) -> Result<Option<IdentitySession>, StoreError> {
        self.executor
            .read(|mirror| mirror.get(&session_key(&token_digest(refresh_token))))
    }

    fn issue(
        &self,
        tx: &mut Tx<'_>,
        actor_id: &str,
        actor_type: ActorType,
        now: DateTime<Utc>,
    ) -> Result<(TokenPair, IdentitySession), StoreError> {
        let refresh_token = new_id("rt")?;
        let access_token = new_id("at")?;
        let access_expires_at = TimeStamp::from(later(now, self.session.access_ttl())?);
        let refresh_expires_at = TimeStamp::from(later(now, self.session.refresh_ttl())?);

        let session = IdentitySession {
            token_digest: token_digest(&refresh_token),
            actor_id: actor_id.to_string(),
            actor_type,
            issued_at: now.into(),
            expires_at: refresh_expires_at,
            revoked: false,
            rotated_to: None,
        };
        tx.put(&session_key(&session.token_digest), &session)?;
        tx.put(
            &access_key(&token_digest(&access_token)),
            &AccessGrant {
                actor_id: actor_id.to_string(),
                actor_type,
                expires_at: access_expires_at,
            },
        )?;

        let pair = TokenPair {
            actor_id: actor_id.to_string(),
            access_token,
            access_expires_at,
            refresh_token,
            refresh_expires_at,
        };
        Ok((pair, session))
    }
}
