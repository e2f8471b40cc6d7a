//! Account ledger postings
use crate::auth::{Capability, RequestContext};
use crate::clock::TimeStamp;
use crate::envelope::Response;
use crate::error::StoreError;
use crate::executor::{Access, Command, CommandExecutor, Decision, Effect, Request, Substrate};
use crate::mirror::Tx;
use crate::utils::new_id;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Account {
    #[n(0)]
    pub account_id: String,
    #[n(1)]
    pub balance: u64, // minor units
    #[n(2)]
    pub updated_at: TimeStamp,
    #[n(3)]
    pub last_transaction_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum PostingKind {
    #[n(0)]
    Deposit,
    #[n(1)]
    Withdrawal,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Posting {
    #[n(0)]
    pub transaction_id: String,
    #[n(1)]
    pub account_id: String,
    #[n(2)]
    pub kind: PostingKind,
    #[n(3)]
    pub amount: u64,
    #[n(4)]
    pub balance_after: u64,
    #[n(5)]
    pub reference: String,
    #[n(6)]
    pub posted_at: TimeStamp,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode)]
pub struct PostFunds {
    #[n(0)]
    pub account_id: String,
    #[n(1)]
    pub amount: u64,
    #[n(2)]
    pub reference: String, // caller's external reference, e.g. a payment id
}

impl Request for PostFunds {
    fn validate(&self) -> Result<(), String> {
        if self.account_id.trim().is_empty() {
            return Err("account_id is required".into());
        }
        if self.amount == 0 {
            return Err("amount must be positive".into());
        }
        Ok(())
    }
}

fn account_key(account_id: &str) -> String {
    format!("account/{account_id}")
}

fn posting_key(transaction_id: &str) -> String {
    format!("posting/{transaction_id}")
}

pub struct AccountService {
    executor: CommandExecutor,
}

impl AccountService {
    pub fn new(substrate: &Substrate) -> Self {
        Self {
            executor: substrate.executor("ledger"),
        }
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    /// Credit an account, opening it on first deposit
    pub fn deposit(&self, ctx: &RequestContext, request: PostFunds) -> Response<Posting> {
        let command = Command::new(
            "account",
            &request.account_id,
            "deposit",
            Access::Requires(Capability::LedgerPost),
        );
        self.executor.execute(ctx, command, &request, |_, tx, now| {
            let before = tx.get::<Account>(&account_key(&request.account_id))?;
            let balance = before.as_ref().map_or(0, |a| a.balance);
            let Some(balance_after) = balance.checked_add(request.amount) else {
                return Ok(Decision::Deny("balance overflow".into()));
            };
            post(tx, &request, before, PostingKind::Deposit, balance_after, now)
        })
    }

    pub fn withdraw(&self, ctx: &RequestContext, request: PostFunds) -> Response<Posting> {
        let command = Command::new(
            "account",
            &request.account_id,
            "withdraw",
            Access::Requires(Capability::LedgerPost),
        );
        self.executor.execute(ctx, command, &request, |_, tx, now| {
            let Some(before) = tx.get::<Account>(&account_key(&request.account_id))? else {
                return Ok(Decision::Deny("account not found".into()));
            };
            let Some(balance_after) = before.balance.checked_sub(request.amount) else {
                return Ok(Decision::Deny("insufficient funds".into()));
            };
            post(tx, &request, Some(before), PostingKind::Withdrawal, balance_after, now)
        })
    }

    pub fn balance(&self, account_id: &str) -> Result<Option<u64>, StoreError> {
        let account: Option<Account> = self
            .executor
            .read(|mirror| mirror.get(&account_key(account_id)))?;
        Ok(account.map(|a| a.balance))
    }

    pub fn get_posting(&self, transaction_id: &str) -> Result<Option<Posting>, StoreError> {
        self.executor.read(|mirror| mirror.get(&posting_key(transaction_id)))
    }
}

fn post(
    tx: &mut Tx<'_>,
    request: &PostFunds,
    before: Option<Account>,
    kind: PostingKind,
    balance_after: u64,
    now: DateTime<Utc>,
) -> Result<Decision<Posting>, StoreError> {
    let posting = Posting {
        transaction_id: new_id("txn")?,
        account_id: request.account_id.clone(),
        kind,
        amount: request.amount,
        balance_after,
        reference: request.reference.clone(),
        posted_at: now.into(),
    };
    let after = Account {
        account_id: request.account_id.clone(),
        balance: balance_after,
        updated_at: now.into(),
        last_transaction_id: Some(posting.transaction_id.clone()),
    };
    tx.put(&account_key(&after.account_id), &after)?;
    tx.put(&posting_key(&posting.transaction_id), &posting)?;

    let mut effect = Effect::new(posting).after(&after)?;
    if let Some(before) = &before {
        effect = effect.before(before)?;
    }
    Ok(Decision::Apply(effect))
}
