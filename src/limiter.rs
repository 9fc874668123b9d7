//! Request throttling.
//!
//! A [`RateLimiter`] is consulted once per worker iteration, before the request is issued. It may
//! let the worker through right away, park it until a permit is available, or tell it that the
//! run is over. The latter is independent of cancellation: a limiter may simply run out of quota.

use crate::{Context, Error};
use ratelimit::Ratelimiter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// The answer of a [`RateLimiter`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Permit {
    Granted,
    /// The worker should stop issuing requests.
    Exhausted,
}

pub trait RateLimiter: Send + Sync {
    fn acquire(&self, ctx: &Context) -> Permit;
}

/// A token bucket shared by all workers of a phase, with an optional total request quota.
pub struct Throttle {
    bucket: Option<Ratelimiter>,
    quota: Option<AtomicU64>,
}

impl Throttle {
    /// Build a throttle from the phase options. Returns `None` if neither a rate nor a quota is
    /// configured, in which case workers run unconstrained.
    pub fn new(rps: Option<f64>, ops: Option<u64>) -> Result<Option<Self>, Error> {
        if rps.is_none() && ops.is_none() {
            return Ok(None);
        }
        let bucket = match rps {
            Some(rate) => {
                if !(rate.is_finite() && rate > 0.0) {
                    return Err(Error::config(format!("rps should be positive, got {}", rate)));
                }
                // refill in batches at very high rates, the clock can't tick every nanosecond
                let amount = (rate / 1_000_000.0).ceil().max(1.0) as u64;
                let interval = Duration::from_nanos((1e9 * amount as f64 / rate) as u64);
                let bucket = Ratelimiter::builder(amount, interval)
                    .max_tokens(amount)
                    .initial_available(0)
                    .build()
                    .map_err(|e| Error::config(format!("invalid rate limit {}: {:?}", rate, e)))?;
                Some(bucket)
            }
            None => None,
        };
        let quota = ops.map(AtomicU64::new);
        Ok(Some(Self { bucket, quota }))
    }

    fn take_quota(&self) -> bool {
        match self.quota {
            Some(ref quota) => quota
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1))
                .is_ok(),
            None => true,
        }
    }

    /// Requests left in the quota, if there is one.
    pub fn remaining(&self) -> Option<u64> {
        self.quota.as_ref().map(|q| q.load(Ordering::Acquire))
    }
}

impl RateLimiter for Throttle {
    fn acquire(&self, ctx: &Context) -> Permit {
        if !self.take_quota() {
            return Permit::Exhausted;
        }
        let bucket = match self.bucket {
            Some(ref bucket) => bucket,
            None => return Permit::Granted,
        };
        loop {
            if ctx.is_done() {
                return Permit::Exhausted;
            }
            match bucket.try_wait() {
                Ok(()) => return Permit::Granted,
                Err(wait) => {
                    if !ctx.sleep(wait.max(Duration::from_micros(10))) {
                        return Permit::Exhausted;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Throttle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle")
            .field("limited", &self.bucket.is_some())
            .field("remaining", &self.remaining())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn nothing_configured_is_none() {
        assert!(Throttle::new(None, None).unwrap().is_none());
    }

    #[test]
    fn invalid_rate() {
        assert!(Throttle::new(Some(0.0), None).is_err());
        assert!(Throttle::new(Some(-3.0), None).is_err());
        assert!(Throttle::new(Some(f64::NAN), None).is_err());
    }

    #[test]
    fn quota_runs_out() {
        let ctx = Context::background();
        let t = Throttle::new(None, Some(3)).unwrap().unwrap();
        for _ in 0..3 {
            assert_eq!(t.acquire(&ctx), Permit::Granted);
        }
        assert_eq!(t.acquire(&ctx), Permit::Exhausted);
        assert_eq!(t.acquire(&ctx), Permit::Exhausted);
        assert_eq!(t.remaining(), Some(0));
    }

    #[test]
    fn rate_is_enforced() {
        let ctx = Context::background();
        let t = Throttle::new(Some(100.0), None).unwrap().unwrap();
        let start = Instant::now();
        for _ in 0..21 {
            assert_eq!(t.acquire(&ctx), Permit::Granted);
        }
        // 20 refills of 10ms each at least
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn cancelled_wait_is_exhausted() {
        let ctx = Context::background();
        let t = Throttle::new(Some(0.1), None).unwrap().unwrap();
        let other = ctx.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            other.cancel();
        });
        // the bucket starts empty and refills every 10 seconds
        assert_eq!(t.acquire(&ctx), Permit::Exhausted);
    }
}
