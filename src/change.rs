//! Configuration change approval workflow
//!
//! A change is proposed, approved by a second operator and then applied.
//! Applying updates the namespace's current-value projection.
use crate::auth::{Capability, RequestContext};
use crate::clock::TimeStamp;
use crate::envelope::Response;
use crate::error::StoreError;
use crate::executor::{Access, Command, CommandExecutor, Decision, Effect, Request, Substrate};
use crate::machine::{ChangeEvent, ChangeStatus, Lifecycle};
use crate::mirror::Tx;
use crate::utils::new_id;

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct ConfigChange {
    #[n(0)]
    pub change_id: String,
    #[n(1)]
    pub namespace: String,
    #[n(2)]
    pub key: String,
    #[n(3)]
    pub proposed_value: String,
    #[n(4)]
    pub previous_value: Option<String>, // captured at proposal time
    #[n(5)]
    pub reason: String,
    #[n(6)]
    pub status: ChangeStatus,
    #[n(7)]
    pub proposer_id: String,
    #[n(8)]
    pub approver_id: Option<String>,
    #[n(9)]
    pub applied_by: Option<String>,
    #[n(10)]
    pub created_at: TimeStamp,
    #[n(11)]
    pub approved_at: Option<TimeStamp>,
    #[n(12)]
    pub applied_at: Option<TimeStamp>,
    #[n(13)]
    pub rejected_by: Option<String>,
    #[n(14)]
    pub rejection_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct CurrentValue {
    #[n(0)]
    pub value: String,
    #[n(1)]
    pub change_id: String,
    #[n(2)]
    pub applied_at: TimeStamp,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode)]
pub struct ProposeChange {
    #[n(0)]
    pub namespace: String,
    #[n(1)]
    pub key: String,
    #[n(2)]
    pub value: String,
    #[n(3)]
    pub reason: String,
}

impl Request for ProposeChange {
    fn validate(&self) -> Result<(), String> {
        if self.namespace.trim().is_empty() {
            return Err("namespace is required".into());
        }
        if self.key.trim().is_empty() {
            return Err("key is required".into());
        }
        if self.reason.trim().is_empty() {
            return Err("reason is required".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode)]
pub struct ChangeRef {
    #[n(0)]
    pub change_id: String,
}

impl Request for ChangeRef {
    fn validate(&self) -> Result<(), String> {
        if self.change_id.trim().is_empty() {
            return Err("change_id is required".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode)]
pub struct RejectChange {
    #[n(0)]
    pub change_id: String,
    #[n(1)]
    pub reason: String,
}

impl Request for RejectChange {
    fn validate(&self) -> Result<(), String> {
        if self.change_id.trim().is_empty() {
            return Err("change_id is required".into());
        }
        if self.reason.trim().is_empty() {
            return Err("reason is required".into());
        }
        Ok(())
    }
}

fn change_key(change_id: &str) -> String {
    format!("change/{change_id}")
}

/// `namespace` is length-prefixed so ("a", "b/c") and ("a/b", "c") stay apart.
fn setting_id(namespace: &str, key: &str) -> String {
    format!("{}:{namespace}/{key}", namespace.len())
}

fn current_key(namespace: &str, key: &str) -> String {
    format!("current/{}", setting_id(namespace, key))
}

pub struct ConfigChangeService {
    executor: CommandExecutor,
}

impl ConfigChangeService {
    pub fn new(substrate: &Substrate) -> Self {
        Self {
            executor: substrate.executor("config"),
        }
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    /// Propose a new value for `namespace`/`key`
    pub fn propose(&self, ctx: &RequestContext, request: ProposeChange) -> Response<ConfigChange> {
        let command = Command::new(
            "config_change",
            setting_id(&request.namespace, &request.key),
            "propose",
            Access::Requires(Capability::ConfigPropose),
        );
        self.executor.execute(ctx, command, &request, |actor, tx, now| {
            let previous_value = tx
                .get::<CurrentValue>(&current_key(&request.namespace, &request.key))?
                .map(|current| current.value);

            let change = ConfigChange {
                change_id: new_id("chg")?,
                namespace: request.namespace.clone(),
                key: request.key.clone(),
                proposed_value: request.value.clone(),
                previous_value,
                reason: request.reason.clone(),
                status: ChangeStatus::Proposed,
                proposer_id: actor.actor_id.clone(),
                approver_id: None,
                applied_by: None,
                created_at: now.into(),
                approved_at: None,
                applied_at: None,
                rejected_by: None,
                rejection_reason: None,
            };
            tx.put(&change_key(&change.change_id), &change)?;

            Ok(Decision::Apply(
                Effect::new(change.clone()).on(&change.change_id).after(&change)?,
            ))
        })
    }

    /// Approve a proposed change. The approver must not be the proposer.
    pub fn approve(&self, ctx: &RequestContext, request: ChangeRef) -> Response<ConfigChange> {
        let command = Command::new(
            "config_change",
            &request.change_id,
            "approve",
            Access::Requires(Capability::ConfigApprove),
        );
        self.executor.execute(ctx, command, &request, |actor, tx, now| {
            let Some(before) = load(tx, &request.change_id)? else {
                return Ok(Decision::Deny("change not found".into()));
            };
            let status = match before.status.transition(ChangeEvent::Approve) {
                Ok(status) => status,
                Err(rejection) => return Ok(Decision::Deny(rejection.reason.into())),
            };
            if before.proposer_id == actor.actor_id {
                return Ok(Decision::Deny("approver must differ from proposer".into()));
            }

            let mut after = before.clone();
            after.status = status;
            after.approver_id = Some(actor.actor_id.clone());
            after.approved_at = Some(now.into());
            tx.put(&change_key(&after.change_id), &after)?;

            Ok(Decision::Apply(
                Effect::new(after.clone()).before(&before)?.after(&after)?,
            ))
        })
    }

    /// Apply an approved change to the current-value projection
    pub fn apply(&self, ctx: &RequestContext, request: ChangeRef) -> Response<ConfigChange> {
        let command = Command::new(
            "config_change",
            &request.change_id,
            "apply",
            Access::Requires(Capability::ConfigApply),
        );
        self.executor.execute(ctx, command, &request, |actor, tx, now| {
            let Some(before) = load(tx, &request.change_id)? else {
                return Ok(Decision::Deny("change not found".into()));
            };
            let status = match before.status.transition(ChangeEvent::Apply) {
                Ok(status) => status,
                Err(rejection) => return Ok(Decision::Deny(rejection.reason.into())),
            };

            let mut after = before.clone();
            after.status = status;
            after.applied_by = Some(actor.actor_id.clone());
            after.applied_at = Some(now.into());
            tx.put(&change_key(&after.change_id), &after)?;
            tx.put(
                &current_key(&after.namespace, &after.key),
                &CurrentValue {
                    value: after.proposed_value.clone(),
                    change_id: after.change_id.clone(),
                    applied_at: now.into(),
                },
            )?;

            Ok(Decision::Apply(
                Effect::new(after.clone()).before(&before)?.after(&after)?,
            ))
        })
    }

    /// Reject a change that has not been applied yet
    pub fn reject(&self, ctx: &RequestContext, request: RejectChange) -> Response<ConfigChange> {
        let command = Command::new(
            "config_change",
            &request.change_id,
            "reject",
            Access::Requires(Capability::ConfigApprove),
        );
        self.executor.execute(ctx, command, &request, |actor, tx, _| {
            let Some(before) = load(tx, &request.change_id)? else {
                return Ok(Decision::Deny("change not found".into()));
            };
            let status = match before.status.transition(ChangeEvent::Reject) {
                Ok(status) => status,
                Err(rejection) => return Ok(Decision::Deny(rejection.reason.into())),
            };

            let mut after = before.clone();
            after.status = status;
            after.rejected_by = Some(actor.actor_id.clone());
            after.rejection_reason = Some(request.reason.clone());
            tx.put(&change_key(&after.change_id), &after)?;

            Ok(Decision::Apply(
                Effect::new(after.clone()).before(&before)?.after(&after)?,
            ))
        })
    }

    pub fn get_change(&self, change_id: &str) -> Result<Option<ConfigChange>, StoreError> {
        self.executor.read(|mirror| mirror.get(&change_key(change_id)))
    }

    pub fn current_value(&self, namespace: &str, key: &str) -> Result<Option<String>, StoreError> {
        let current: Option<CurrentValue> = self
            .executor
            .read(|mirror| mirror.get(&current_key(namespace, key)))?;
        Ok(current.map(|c| c.value))
    }
}

fn load(tx: &mut Tx<'_>, change_id: &str) -> Result<Option<ConfigChange>, StoreError> {
    tx.get(&change_key(change_id))
}
