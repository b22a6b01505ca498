//! Outcome of a single reconciliation pass
//!
//! Reconcilers never abort with an error directly, instead they return a [`Status`] that states
//! how (and whether) the object should be rescheduled. The controller glue translates it into a
//! kube-runtime [`Action`], using [`Failure`] to carry errors into the error policy.

use std::{fmt::Display, time::Duration};

use stackable_operator::{
    kube::{api::DynamicObject, runtime::controller::Action, runtime::reflector::ObjectRef},
    logging::controller::ReconcilerError,
};

#[derive(Debug)]
#[must_use]
pub enum Status<E> {
    /// The pass completed, keep the regular resync cadence.
    Succeeded,
    /// The pass completed and the object does not need periodic reconciliation.
    Stop,
    /// The pass failed transiently, and should be retried after a delay.
    Delay(Option<E>),
    /// The pass failed in a way that retrying will not fix, until the object itself is changed.
    Failed(E),
}

impl<E> Status<E> {
    pub fn delay(error: E) -> Self {
        Status::Delay(Some(error))
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self, Status::Succeeded | Status::Stop)
    }

    /// Turns a success into a [`Status::Stop`], failures are kept as they are.
    pub fn stop(self) -> Self {
        match self {
            Status::Succeeded => Status::Stop,
            other => other,
        }
    }

    pub fn into_action(self, requeue: &RequeuePolicy) -> Result<Action, Failure<E>> {
        match self {
            Status::Succeeded => Ok(Action::requeue(requeue.resync_interval)),
            Status::Stop => Ok(Action::await_change()),
            Status::Delay(None) => Ok(Action::requeue(requeue.retry_delay)),
            Status::Delay(Some(err)) => Err(Failure::Retry(err)),
            Status::Failed(err) => Err(Failure::Fatal(err)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequeuePolicy {
    pub resync_interval: Duration,
    pub retry_delay: Duration,
}

/// A failed reconciliation pass, as seen by the controller's error policy.
#[derive(Debug)]
pub enum Failure<E> {
    Retry(E),
    Fatal(E),
}

impl<E> Failure<E> {
    pub fn inner(&self) -> &E {
        match self {
            Failure::Retry(err) | Failure::Fatal(err) => err,
        }
    }

    pub fn action(&self, requeue: &RequeuePolicy) -> Action {
        match self {
            Failure::Retry(_) => Action::requeue(requeue.retry_delay),
            Failure::Fatal(_) => Action::await_change(),
        }
    }
}

impl<E: Display> Display for Failure<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self.inner(), f)
    }
}

impl<E: std::error::Error> std::error::Error for Failure<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner().source()
    }
}

impl<E: ReconcilerError> ReconcilerError for Failure<E> {
    fn category(&self) -> &'static str {
        self.inner().category()
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        self.inner().secondary_object()
    }
}
