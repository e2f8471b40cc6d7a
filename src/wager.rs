//! Wager placement and settlement
use crate::auth::{ActorType, Capability, RequestContext};
use crate::clock::TimeStamp;
use crate::envelope::Response;
use crate::error::StoreError;
use crate::executor::{Access, Command, CommandExecutor, Decision, Effect, Request, Substrate};
use crate::machine::{Lifecycle, WagerEvent, WagerStatus};
use crate::utils::new_id;

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Wager {
    #[n(0)]
    pub wager_id: String,
    #[n(1)]
    pub player_id: String,
    #[n(2)]
    pub game_id: String,
    #[n(3)]
    pub stake: u64, // minor units
    #[n(4)]
    pub status: WagerStatus,
    #[n(5)]
    pub payout: Option<u64>,
    #[n(6)]
    pub outcome_ref: Option<String>,
    #[n(7)]
    pub placed_at: TimeStamp,
    #[n(8)]
    pub settled_at: Option<TimeStamp>,
    #[n(9)]
    pub canceled_at: Option<TimeStamp>,
    #[n(10)]
    pub cancel_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode)]
pub struct PlaceWager {
    #[n(0)]
    pub player_id: String,
    #[n(1)]
    pub game_id: String,
    #[n(2)]
    pub stake: u64,
}

impl Request for PlaceWager {
    fn validate(&self) -> Result<(), String> {
        if self.player_id.trim().is_empty() {
            return Err("player_id is required".into());
        }
        if self.game_id.trim().is_empty() {
            return Err("game_id is required".into());
        }
        if self.stake == 0 {
            return Err("stake must be positive".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode)]
pub struct SettleWager {
    #[n(0)]
    pub wager_id: String,
    #[n(1)]
    pub payout: u64,
    #[n(2)]
    pub outcome_ref: String,
}

impl Request for SettleWager {
    fn validate(&self) -> Result<(), String> {
        if self.wager_id.trim().is_empty() {
            return Err("wager_id is required".into());
        }
        if self.outcome_ref.trim().is_empty() {
            return Err("outcome_ref is required".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode)]
pub struct CancelWager {
    #[n(0)]
    pub wager_id: String,
    #[n(1)]
    pub reason: String,
}

impl Request for CancelWager {
    fn validate(&self) -> Result<(), String> {
        if self.wager_id.trim().is_empty() {
            return Err("wager_id is required".into());
        }
        if self.reason.trim().is_empty() {
            return Err("reason is required".into());
        }
        Ok(())
    }
}

fn wager_key(wager_id: &str) -> String {
    format!("wager/{wager_id}")
}

pub struct WagerService {
    executor: CommandExecutor,
}

impl WagerService {
    pub fn new(substrate: &Substrate) -> Self {
        Self {
            executor: substrate.executor("wager"),
        }
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    pub fn place(&self, ctx: &RequestContext, request: PlaceWager) -> Response<Wager> {
        let command = Command::new(
            "wager",
            &request.player_id,
            "place",
            Access::Requires(Capability::WagerPlace),
        );
        self.executor.execute(ctx, command, &request, |actor, tx, now| {
            // players may only stake on their own behalf
            if actor.actor_type == ActorType::Player && actor.actor_id != request.player_id {
                return Ok(Decision::Deny("players may only place their own wagers".into()));
            }

            let wager = Wager {
                wager_id: new_id("wgr")?,
                player_id: request.player_id.clone(),
                game_id: request.game_id.clone(),
                stake: request.stake,
                status: WagerStatus::Pending,
                payout: None,
                outcome_ref: None,
                placed_at: now.into(),
                settled_at: None,
                canceled_at: None,
                cancel_reason: None,
            };
            tx.put(&wager_key(&wager.wager_id), &wager)?;

            Ok(Decision::Apply(
                Effect::new(wager.clone()).on(&wager.wager_id).after(&wager)?,
            ))
        })
    }

    pub fn settle(&self, ctx: &RequestContext, request: SettleWager) -> Response<Wager> {
        let command = Command::new(
            "wager",
            &request.wager_id,
            "settle",
            Access::Requires(Capability::WagerSettle),
        );
        self.executor.execute(ctx, command, &request, |_, tx, now| {
            let Some(before) = tx.get::<Wager>(&wager_key(&request.wager_id))? else {
                return Ok(Decision::Deny("wager not found".into()));
            };
            let status = match before.status.transition(WagerEvent::Settle) {
                Ok(status) => status,
                Err(rejection) => return Ok(Decision::Deny(rejection.reason.into())),
            };

            let mut after = before.clone();
            after.status = status;
            after.payout = Some(request.payout);
            after.outcome_ref = Some(request.outcome_ref.clone());
            after.settled_at = Some(now.into());
            tx.put(&wager_key(&after.wager_id), &after)?;

            Ok(Decision::Apply(
                Effect::new(after.clone()).before(&before)?.after(&after)?,
            ))
        })
    }

    pub fn cancel(&self, ctx: &RequestContext, request: CancelWager) -> Response<Wager> {
        let command = Command::new(
            "wager",
            &request.wager_id,
            "cancel",
            Access::Requires(Capability::WagerCancel),
        );
        self.executor.execute(ctx, command, &request, |_, tx, now| {
            let Some(before) = tx.get::<Wager>(&wager_key(&request.wager_id))? else {
                return Ok(Decision::Deny("wager not found".into()));
            };
            let status = match before.status.transition(WagerEvent::Cancel) {
                Ok(status) => status,
                Err(rejection) => return Ok(Decision::Deny(rejection.reason.into())),
            };

            let mut after = before.clone();
            after.status = status;
            after.canceled_at = Some(now.into());
            after.cancel_reason = Some(request.reason.clone());
            tx.put(&wager_key(&after.wager_id), &after)?;

            Ok(Decision::Apply(
                Effect::new(after.clone()).before(&before)?.after(&after)?,
            ))
        })
    }

    pub fn get_wager(&self, wager_id: &str) -> Result<Option<Wager>, StoreError> {
        self.executor.read(|mirror| mirror.get(&wager_key(wager_id)))
    }
}
