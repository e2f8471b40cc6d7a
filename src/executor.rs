//! Per-service command execution
//!
//! Every command runs the same sequence inside the service's critical
//! section: authorize, consult the idempotency store, check preconditions and
//! mutate (in a staged [`Tx`]), then commit the mutation, the idempotency
//! record and the audit event as one atomic batch. Nothing staged becomes
//! visible unless that batch lands.
use crate::audit::{AuditDraft, AuditEvent, AuditLedger, AuditResult, Verification};
use crate::auth::{Actor, ActorResolver, Capability, RequestContext};
use crate::clock::{Clock, format_server_time};
use crate::config::Config;
use crate::critical::CriticalSection;
use crate::envelope::{ResultCode, Response};
use crate::error::{ConfigError, StoreError};
use crate::idempotency::{IdempotencyStore, Lookup};
use crate::mirror::{DualStoreMirror, Tx};
use crate::store::{Durable, WriteBatch};
use crate::utils::{fingerprint, from_cbor, to_cbor};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// A command's request body. Its CBOR encoding is the idempotency fingerprint,
/// so it should carry exactly the semantically significant fields.
pub trait Request: minicbor::Encode<()> {
    /// Shape checks that need no state. Runs before authorization.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum Access {
    Requires(Capability),
    /// No resolver involved; the caller already knows who is acting.
    Public(Actor),
}

#[derive(Debug, Clone)]
pub struct Command {
    pub object_type: &'static str,
    pub object_id: String,
    pub action: &'static str,
    pub access: Access,
    /// When false the idempotency store is bypassed and every call runs the
    /// body afresh.
    pub replayable: bool,
}

impl Command {
    pub fn new(
        object_type: &'static str,
        object_id: impl Into<String>,
        action: &'static str,
        access: Access,
    ) -> Self {
        Self {
            object_type,
            object_id: object_id.into(),
            action,
            access,
            replayable: true,
        }
    }

    /// Ignore any idempotency key. For commands whose outcome hinges on a
    /// secret that is not part of the request fingerprint.
    pub fn never_replayed(mut self) -> Self {
        self.replayable = false;
        self
    }

    /// Idempotency scope, `<aggregate>|<operation>`.
    pub fn scope(&self) -> String {
        format!("{}|{}", self.object_id, self.action)
    }
}

/// The successful result of a command body.
#[derive(Debug)]
pub struct Effect<T> {
    payload: T,
    object_id: Option<String>,
    before: Option<Vec<u8>>,
    after: Option<Vec<u8>>,
}

impl<T> Effect<T> {
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            object_id: None,
            before: None,
            after: None,
        }
    }
    /// Audit the effect against a different object than the command's own,
    /// e.g. the id of a freshly created aggregate.
    pub fn on(mut self, object_id: impl Into<String>) -> Self {
        self.object_id = Some(object_id.into());
        self
    }
    pub fn before<S: minicbor::Encode<()>>(mut self, state: &S) -> Result<Self, StoreError> {
        self.before = Some(to_cbor(state)?);
        Ok(self)
    }
    pub fn after<S: minicbor::Encode<()>>(mut self, state: &S) -> Result<Self, StoreError> {
        self.after = Some(to_cbor(state)?);
        Ok(self)
    }
}

#[derive(Debug)]
pub enum Decision<T> {
    Apply(Effect<T>),
    /// Domain rejection. Staged mutations are dropped, bookkeeping is kept.
    Deny(String),
}

/// A non-OK outcome on its way to the audit ledger.
struct Refusal {
    code: ResultCode,
    reason: String,
    bookkeeping: WriteBatch,
}

impl Refusal {
    fn new(code: ResultCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            bookkeeping: WriteBatch::default(),
        }
    }

    fn keeping(mut self, bookkeeping: WriteBatch) -> Self {
        self.bookkeeping = bookkeeping;
        self
    }
}

pub struct CommandExecutor {
    section: CriticalSection<DualStoreMirror>,
    clock: Arc<dyn Clock>,
    resolver: Arc<dyn ActorResolver>,
    idempotency: IdempotencyStore,
    ledger: AuditLedger,
}

impl CommandExecutor {
    /// `store` selects the backend: `None` keeps everything in memory for
    /// the life of the process.
    pub fn new(
        namespace: &str,
        store: Option<Arc<dyn Durable>>,
        config: &Config,
        clock: Arc<dyn Clock>,
        resolver: Arc<dyn ActorResolver>,
    ) -> Self {
        let mirror = match store {
            Some(store) => DualStoreMirror::durable(namespace, store, config.mirror),
            None => DualStoreMirror::in_memory(namespace),
        };
        Self {
            section: CriticalSection::new(mirror),
            clock,
            resolver,
            idempotency: IdempotencyStore::new(config.idempotency_ttl()),
            ledger: AuditLedger::new(),
        }
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn execute<R, T, F>(
        &self,
        ctx: &RequestContext,
        command: Command,
        request: &R,
        body: F,
    ) -> Response<T>
    where
        R: Request,
        T: minicbor::Encode<()> + for<'b> minicbor::Decode<'b, ()>,
        F: FnOnce(&Actor, &mut Tx<'_>, DateTime<Utc>) -> Result<Decision<T>, StoreError>,
    {
        let scope = command.scope();
        let outcome = self
            .section
            .enter(|mirror| self.run(mirror, ctx, &command, request, body));
        match outcome {
            Ok(response) => {
                tracing::info!(
                    scope = %scope,
                    request_id = %ctx.request_id,
                    code = %response.result_code,
                    reason = response.reason(),
                    "command decided"
                );
                response
            }
            Err(err) => {
                tracing::warn!(
                    scope = %scope,
                    request_id = %ctx.request_id,
                    error = %err,
                    "command failed"
                );
                self.respond(ctx, ResultCode::Error, Some(err.to_string()), None)
            }
        }
    }

    fn run<R, T, F>(
        &self,
        mirror: &mut DualStoreMirror,
        ctx: &RequestContext,
        command: &Command,
        request: &R,
        body: F,
    ) -> Result<Response<T>, StoreError>
    where
        R: Request,
        T: minicbor::Encode<()> + for<'b> minicbor::Decode<'b, ()>,
        F: FnOnce(&Actor, &mut Tx<'_>, DateTime<Utc>) -> Result<Decision<T>, StoreError>,
    {
        let now = self.clock.now();
        self.check_deadline(ctx)?;

        // malformed requests never reach authorization or the idempotency store
        if let Err(reason) = request.validate() {
            let outcome = Refusal::new(ResultCode::Invalid, reason);
            return self.refuse(mirror, ctx, command, &Actor::anonymous(), now, outcome);
        }

        let (actor, capability_denial) = match &command.access {
            Access::Public(actor) => (actor.clone(), None),
            Access::Requires(capability) => match self.resolver.resolve(ctx) {
                Ok(actor) if actor.can(*capability) => (actor, None),
                Ok(actor) => {
                    let reason = format!("actor {} may not {}", actor.actor_id, command.action);
                    (actor, Some(reason))
                }
                Err(err) => {
                    let outcome = Refusal::new(ResultCode::Denied, err.to_string());
                    return self.refuse(mirror, ctx, command, &Actor::anonymous(), now, outcome);
                }
            },
        };

        let scope = command.scope();
        let idempotency_key = ctx.idempotency_key.as_ref().filter(|_| command.replayable);
        let keyed = match idempotency_key {
            Some(key) => {
                let digest = fingerprint(request)?;
                match self.idempotency.lookup(mirror, &scope, key, &digest, now)? {
                    Lookup::Hit(record) => {
                        tracing::debug!(scope = %scope, key = %key, "idempotent replay");
                        return from_cbor(record.key.as_bytes(), &record.response_payload);
                    }
                    Lookup::Conflict { stored_fingerprint } => {
                        tracing::warn!(
                            scope = %scope,
                            key = %key,
                            stored = %stored_fingerprint,
                            "idempotency key reused"
                        );
                        let outcome = Refusal::new(
                            ResultCode::Invalid,
                            "idempotency key reused with a different request",
                        );
                        return self.refuse(mirror, ctx, command, &actor, now, outcome);
                    }
                    Lookup::Miss => Some((key.clone(), digest)),
                }
            }
            None => None,
        };

        if let Some(reason) = capability_denial {
            let outcome = Refusal::new(ResultCode::Denied, reason);
            return self.refuse(mirror, ctx, command, &actor, now, outcome);
        }

        let mut tx = mirror.begin();
        let decision = body(&actor, &mut tx, now)?;
        let (mutations, bookkeeping) = tx.into_batches();

        match decision {
            Decision::Deny(reason) => {
                let outcome = Refusal::new(ResultCode::Denied, reason).keeping(bookkeeping);
                self.refuse(mirror, ctx, command, &actor, now, outcome)
            }
            Decision::Apply(effect) => {
                let mut draft = self.draft(&actor, command, now, AuditResult::Success, None);
                if let Some(object_id) = effect.object_id {
                    draft.object_id = object_id;
                }
                draft.before_state = effect.before;
                draft.after_state = effect.after;

                let response = self.respond(ctx, ResultCode::Ok, None, Some(effect.payload));
                let mut batch = mutations;
                batch.extend(bookkeeping);
                if let Some((key, fingerprint)) = keyed {
                    batch.extend(self.idempotency.stage(
                        &scope,
                        &key,
                        &fingerprint,
                        to_cbor(&response)?,
                        response.result_code,
                        now,
                    )?);
                }
                self.check_deadline(ctx)?;
                self.commit(mirror, batch, draft)?;
                Ok(response)
            }
        }
    }

    /// Audits a refused command and answers without a payload. Only the
    /// refusal's bookkeeping is written alongside the audit event.
    fn refuse<T>(
        &self,
        mirror: &mut DualStoreMirror,
        ctx: &RequestContext,
        command: &Command,
        actor: &Actor,
        now: DateTime<Utc>,
        refusal: Refusal,
    ) -> Result<Response<T>, StoreError> {
        let result = match refusal.code {
            ResultCode::Denied => AuditResult::Denied,
            _ => AuditResult::Error,
        };
        let draft = self.draft(actor, command, now, result, Some(refusal.reason.as_str()));
        self.commit(mirror, refusal.bookkeeping, draft)?;
        Ok(self.respond(ctx, refusal.code, Some(refusal.reason), None))
    }

    /// Seals the audit event onto `batch` and writes everything at once.
    fn commit(
        &self,
        mirror: &mut DualStoreMirror,
        mut batch: WriteBatch,
        draft: AuditDraft,
    ) -> Result<AuditEvent, StoreError> {
        let (event, audit) = self.ledger.stage(mirror, draft, self.clock.now())?;
        batch.extend(audit);
        mirror.write(batch)?;
        Ok(event)
    }

    fn check_deadline(&self, ctx: &RequestContext) -> Result<(), StoreError> {
        match ctx.deadline {
            Some(deadline) if self.clock.now() >= deadline => Err(StoreError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    fn draft(
        &self,
        actor: &Actor,
        command: &Command,
        occurred_at: DateTime<Utc>,
        result: AuditResult,
        reason: Option<&str>,
    ) -> AuditDraft {
        AuditDraft {
            occurred_at,
            actor_id: actor.actor_id.clone(),
            actor_type: actor.actor_type,
            object_type: command.object_type.to_string(),
            object_id: command.object_id.clone(),
            action: command.action.to_string(),
            before_state: None,
            after_state: None,
            result,
            reason: reason.map(str::to_string),
        }
    }

    fn respond<T>(
        &self,
        ctx: &RequestContext,
        result_code: ResultCode,
        denial_reason: Option<String>,
        payload: Option<T>,
    ) -> Response<T> {
        Response {
            request_id: ctx.request_id.clone(),
            result_code,
            denial_reason,
            server_time: format_server_time(self.clock.now()),
            payload,
        }
    }

    /// Runs a read against the service state under the critical section.
    pub fn read<R>(
        &self,
        f: impl FnOnce(&mut DualStoreMirror) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        self.section.enter(f)
    }

    pub fn verify_audit(&self, day: &str) -> Result<Verification, StoreError> {
        self.read(|mirror| self.ledger.verify(mirror, day))
    }

    pub fn audit_events(&self, day: &str) -> Result<Vec<AuditEvent>, StoreError> {
        self.read(|mirror| self.ledger.events(mirror, day))
    }

    /// Periodic sweep of expired idempotency records. Returns the count deleted.
    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        self.read(|mirror| self.idempotency.purge_expired(mirror, now))
    }
}

/// Shared collaborators every service executor is built from.
#[derive(Clone)]
pub struct Substrate {
    pub store: Option<Arc<dyn Durable>>,
    pub config: Config,
    pub clock: Arc<dyn Clock>,
    pub resolver: Arc<dyn ActorResolver>,
}

impl Substrate {
    pub fn new(clock: Arc<dyn Clock>, resolver: Arc<dyn ActorResolver>) -> Self {
        Self {
            store: None,
            config: Config::default(),
            clock,
            resolver,
        }
    }
    pub fn with_store(mut self, store: Arc<dyn Durable>) -> Self {
        self.store = Some(store);
        self
    }
    /// Rejects a config that fails [`Config::validate`].
    pub fn with_config(mut self, config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }
    pub fn executor(&self, namespace: &str) -> CommandExecutor {
        CommandExecutor::new(
            namespace,
            self.store.clone(),
            &self.config,
            self.clock.clone(),
            self.resolver.clone(),
        )
    }
}
