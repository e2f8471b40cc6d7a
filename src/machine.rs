//! Approval state machines
//!
//! A machine never moves by itself. Each transition is driven by exactly one
//! authorized command and is accepted only from its single legal predecessor.
use std::fmt::Debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    pub reason: &'static str,
}

pub trait Lifecycle: Copy + Eq + Debug {
    type Event: Copy + Debug;

    fn transition(self, event: Self::Event) -> Result<Self, Rejection>;
    fn is_terminal(self) -> bool;
}

fn reject<T>(reason: &'static str) -> Result<T, Rejection> {
    Err(Rejection { reason })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum ChangeStatus {
    #[n(0)]
    Proposed,
    #[n(1)]
    Approved,
    #[n(2)]
    Applied,
    #[n(3)]
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    Approve,
    Apply,
    Reject,
}

impl Lifecycle for ChangeStatus {
    type Event = ChangeEvent;

    fn transition(self, event: ChangeEvent) -> Result<Self, Rejection> {
        use ChangeStatus::*;
        match (self, event) {
            (Proposed, ChangeEvent::Approve) => Ok(Approved),
            (_, ChangeEvent::Approve) => reject("change is not proposed"),
            (Approved, ChangeEvent::Apply) => Ok(Applied),
            (_, ChangeEvent::Apply) => reject("change is not approved"),
            (Proposed | Approved, ChangeEvent::Reject) => Ok(Rejected),
            (Applied, ChangeEvent::Reject) => reject("change is already applied"),
            (Rejected, ChangeEvent::Reject) => reject("change is already rejected"),
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, ChangeStatus::Applied | ChangeStatus::Rejected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum WagerStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Settled,
    #[n(2)]
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WagerEvent {
    Settle,
    Cancel,
}

impl Lifecycle for WagerStatus {
    type Event = WagerEvent;

    fn transition(self, event: WagerEvent) -> Result<Self, Rejection> {
        match (self, event) {
            (WagerStatus::Pending, WagerEvent::Settle) => Ok(WagerStatus::Settled),
            (WagerStatus::Pending, WagerEvent::Cancel) => Ok(WagerStatus::Canceled),
            (WagerStatus::Settled, _) => reject("wager is already settled"),
            (WagerStatus::Canceled, _) => reject("wager is already canceled"),
        }
    }

    fn is_terminal(self) -> bool {
        self != WagerStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_follows_propose_approve_apply() {
        let approved = ChangeStatus::Proposed.transition(ChangeEvent::Approve).unwrap();
        let applied = approved.transition(ChangeEvent::Apply).unwrap();
        assert_eq!(applied, ChangeStatus::Applied);
        assert!(applied.is_terminal());
    }

    #[test]
    fn apply_before_approve_is_rejected() {
        assert_eq!(
            ChangeStatus::Proposed.transition(ChangeEvent::Apply),
            Err(Rejection {
                reason: "change is not approved"
            })
        );
        assert_eq!(
            ChangeStatus::Applied.transition(ChangeEvent::Apply).unwrap_err().reason,
            "change is not approved"
        );
    }

    #[test]
    fn settled_wager_stays_settled() {
        let settled = WagerStatus::Pending.transition(WagerEvent::Settle).unwrap();
        assert_eq!(
            settled.transition(WagerEvent::Settle).unwrap_err().reason,
            "wager is already settled"
        );
        assert!(settled.transition(WagerEvent::Cancel).is_err());
    }
}
