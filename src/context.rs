//! Cooperative cancellation.
//!
//! A [`Context`] is a cheap, cloneable token that every suspension point of a run observes: the
//! top of each worker iteration, the rate limiter's wait, and the catalog call itself. It is done
//! once it (or any of its parents) has been cancelled, or once its deadline has passed. Nothing is
//! ever interrupted by force; whoever holds the token checks it.

use crate::Error;
use quanta::Instant;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on how long [`Context::sleep`] sleeps before re-checking the token.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

struct Inner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
    parent: Option<Context>,
}

#[derive(Clone)]
pub struct Context(Arc<Inner>);

impl Context {
    /// A root context that is only done when cancelled.
    pub fn background() -> Self {
        Self(Arc::new(Inner {
            cancelled: AtomicBool::new(false),
            deadline: None,
            parent: None,
        }))
    }

    /// A child that can be cancelled on its own, and is done whenever `self` is.
    pub fn with_cancel(&self) -> Self {
        Self(Arc::new(Inner {
            cancelled: AtomicBool::new(false),
            deadline: None,
            parent: Some(self.clone()),
        }))
    }

    /// A child that additionally expires after `timeout`. A timeout past the end of the clock
    /// never expires.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self(Arc::new(Inner {
            cancelled: AtomicBool::new(false),
            deadline: Instant::now().checked_add(timeout),
            parent: Some(self.clone()),
        }))
    }

    /// Mark this context (and therefore all of its children) as done. Parents are unaffected.
    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::Release);
    }

    pub fn is_done(&self) -> bool {
        self.is_done_at(Instant::now())
    }

    fn is_done_at(&self, now: Instant) -> bool {
        let mut ctx = self;
        loop {
            if ctx.0.cancelled.load(Ordering::Acquire) {
                return true;
            }
            if let Some(deadline) = ctx.0.deadline {
                if now >= deadline {
                    return true;
                }
            }
            match ctx.0.parent {
                Some(ref parent) => ctx = parent,
                None => return false,
            }
        }
    }

    /// The earliest deadline along the parent chain.
    pub fn deadline(&self) -> Option<Instant> {
        let mut deadline = self.0.deadline;
        let mut parent = self.0.parent.as_ref();
        while let Some(ctx) = parent {
            deadline = match (deadline, ctx.0.deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            parent = ctx.0.parent.as_ref();
        }
        deadline
    }

    /// Time left until the deadline, if there is one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline()
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Sleep for `duration`, waking early if the context becomes done.
    ///
    /// Returns `true` if the full duration elapsed and the context is still live.
    pub fn sleep(&self, duration: Duration) -> bool {
        let until = Instant::now().checked_add(duration);
        loop {
            let now = Instant::now();
            if self.is_done_at(now) {
                return false;
            }
            match until {
                Some(until) if now >= until => return true,
                Some(until) => std::thread::sleep((until - now).min(POLL_INTERVAL)),
                None => std::thread::sleep(POLL_INTERVAL),
            }
        }
    }
}

/// Convert a configured number of seconds into a [`Duration`] that a deadline can be set from.
pub(crate) fn seconds(what: &str, secs: f32) -> Result<Duration, Error> {
    let duration = Duration::try_from_secs_f32(secs).map_err(|_| {
        Error::config(format!(
            "{} should be a non-negative number of seconds, got {}",
            what, secs
        ))
    })?;
    if Instant::now().checked_add(duration).is_none() {
        return Err(Error::config(format!(
            "{} of {} seconds is too long",
            what, secs
        )));
    }
    Ok(duration)
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("done", &self.is_done())
            .field("deadline", &self.deadline())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_propagates_to_children_only() {
        let root = Context::background();
        let child = root.with_cancel();
        let grandchild = child.with_cancel();
        assert!(!grandchild.is_done());

        child.cancel();
        assert!(child.is_done());
        assert!(grandchild.is_done());
        assert!(!root.is_done());
    }

    #[test]
    fn timeout_expires() {
        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        assert!(!ctx.is_done());
        assert!(!ctx.sleep(Duration::from_secs(5)));
        assert!(ctx.is_done());
    }

    #[test]
    fn deadline_is_earliest_in_chain() {
        let outer = Context::background().with_timeout(Duration::from_millis(50));
        let inner = outer.with_timeout(Duration::from_secs(60));
        let remaining = inner.remaining().unwrap();
        assert!(remaining <= Duration::from_millis(50));
        assert!(Context::background().deadline().is_none());
    }

    #[test]
    fn sleep_wakes_on_cancel() {
        let ctx = Context::background();
        let other = ctx.clone();
        let t = std::thread::spawn(move || other.sleep(Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(20));
        ctx.cancel();
        assert!(!t.join().unwrap());
    }

    #[test]
    fn sleep_completes_when_live() {
        let ctx = Context::background();
        assert!(ctx.sleep(Duration::from_millis(10)));
    }

    #[test]
    fn timeout_past_the_clock_never_expires() {
        let ctx = Context::background().with_timeout(Duration::MAX);
        assert!(ctx.deadline().is_none());
        assert!(!ctx.is_done());
        assert!(ctx.sleep(Duration::from_millis(5)));
    }

    #[test]
    fn seconds_are_bounded() {
        assert_eq!(seconds("timeout", 1.5).unwrap(), Duration::from_millis(1500));
        assert_eq!(seconds("timeout", 0.0).unwrap(), Duration::ZERO);
        for secs in [-1.0, f32::NAN, f32::INFINITY, 1e20, 18_446_745_600.0] {
            match seconds("timeout", secs) {
                Err(Error::Config(msg)) => assert!(msg.starts_with("timeout "), "{}", msg),
                other => panic!("{} should be rejected, got {:?}", secs, other),
            }
        }
    }
}
