use std::time::Duration;

use tokio::time::Instant;

use crate::config::ThrottleWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayClass {
    /// Quiescence after a queue change
    Settle,
    /// Cooldown between dispatch batches
    Pause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Reconcile dispatched work against what is still running
    Update,
    /// Launch waiting work
    Dispatch,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    deadline: Instant,
    class: DelayClass,
    action: TimerAction,
}

/// Single-slot delayed action. Arming replaces whatever was pending, so at
/// most one fire is ever outstanding.
///
/// The timer does not spawn anything: the owner awaits [`expired`] inside its
/// event loop and then calls [`fire`].
///
/// [`expired`]: ThrottleTimer::expired
/// [`fire`]: ThrottleTimer::fire
#[derive(Debug)]
pub struct ThrottleTimer {
    settle: Duration,
    pause: Duration,
    pending: Option<Pending>,
}

impl ThrottleTimer {
    pub fn new(window: &ThrottleWindow) -> Self {
        Self {
            settle: window.settle,
            pause: window.pause,
            pending: None,
        }
    }

    pub fn delay(&self, class: DelayClass) -> Duration {
        match class {
            DelayClass::Settle => self.settle,
            DelayClass::Pause => self.pause,
        }
    }

    /// Schedule `action` after the delay for `class`, cancelling any pending
    /// fire.
    pub fn arm(&mut self, class: DelayClass, action: TimerAction) {
        let deadline = Instant::now() + self.delay(class);
        if let Some(prev) = self.pending.replace(Pending {
            deadline,
            class,
            action,
        }) {
            tracing::trace!(?prev.action, ?action, "Replaced pending timer");
        }
    }

    /// Drop the pending fire, if any. Returns whether one was pending.
    pub fn cancel(&mut self) -> bool {
        self.pending.take().is_some()
    }

    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending.map(|p| p.deadline)
    }

    pub fn pending(&self) -> Option<(DelayClass, TimerAction)> {
        self.pending.map(|p| (p.class, p.action))
    }

    /// Completes at the pending deadline; never completes while disarmed.
    pub async fn expired(&self) {
        match self.deadline() {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    /// Take the pending action if its deadline has passed.
    pub fn fire(&mut self) -> Option<TimerAction> {
        match self.pending {
            Some(p) if p.deadline <= Instant::now() => {
                self.pending = None;
                Some(p.action)
            }
            _ => None,
        }
    }
}
