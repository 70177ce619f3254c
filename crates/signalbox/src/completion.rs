#![forbid(unsafe_code)]

//! Settle-once outcome of a write batch.
//!
//! Every write joins a batch, and every write in the same batch gets a clone
//! of the same [`Completion`]. The flush settles it once with the new state
//! or a [`SignalError`]. Hosts can poll it ([`Completion::outcome`]) or
//! `.await` it.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use serde_json::Value;

use crate::error::SignalError;

/// Outcome of a settled batch.
pub type Outcome = Result<Value, SignalError>;

/// Shared handle to one batch outcome.
#[derive(Clone)]
pub struct Completion {
    slot: Rc<RefCell<Slot>>,
}

#[derive(Default)]
struct Slot {
    outcome: Option<Outcome>,
    wakers: Vec<Waker>,
}

impl Completion {
    pub(crate) fn pending() -> Self {
        Self {
            slot: Rc::new(RefCell::new(Slot::default())),
        }
    }

    /// An already-resolved completion.
    #[must_use]
    pub fn resolved(value: Value) -> Self {
        let completion = Self::pending();
        completion.settle(Ok(value));
        completion
    }

    /// An already-rejected completion.
    #[must_use]
    pub fn rejected(error: SignalError) -> Self {
        let completion = Self::pending();
        completion.settle(Err(error));
        completion
    }

    /// Settle the batch. Later calls are ignored.
    pub(crate) fn settle(&self, outcome: Outcome) {
        let wakers = {
            let mut slot = self.slot.borrow_mut();
            if slot.outcome.is_some() {
                return;
            }
            slot.outcome = Some(outcome);
            std::mem::take(&mut slot.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
    }

    /// Whether the batch has settled.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.slot.borrow().outcome.is_some()
    }

    /// The outcome, once settled.
    #[must_use]
    pub fn outcome(&self) -> Option<Outcome> {
        self.slot.borrow().outcome.clone()
    }

    /// Whether both handles belong to the same batch.
    #[must_use]
    pub fn same_batch(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.slot, &other.slot)
    }
}

impl Future for Completion {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.slot.borrow_mut();
        if let Some(outcome) = slot.outcome.clone() {
            return Poll::Ready(outcome);
        }
        slot.wakers.push(cx.waker().clone());
        Poll::Pending
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.slot.borrow();
        let state = match &slot.outcome {
            None => "pending",
            Some(Ok(_)) => "resolved",
            Some(Err(_)) => "rejected",
        };
        f.debug_struct("Completion").field("state", &state).finish()
    }
}
