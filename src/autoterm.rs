//! Automatic termination once throughput has settled.
//!
//! The run is cut into fixed-length segments counted from the moment the monitor was created.
//! Every successful [`Operation`] of the monitored type is counted in the segment its request
//! finished in. After each completed segment, the trailing `samples` segments are compared with
//! their mean: if all of them are within `pct` percent of it, throughput is considered stable and
//! the run's context is cancelled. Independently, the context carries a hard deadline of
//! `duration`, so a run never outlives it even if throughput never settles.

use crate::{Context, OpType, Operation};
use quanta::Instant;
use std::collections::VecDeque;
use std::time::Duration;

/// Default tolerance, in percent of the mean segment throughput.
pub const DEFAULT_PCT: f64 = 7.5;

/// Default number of trailing segments that must agree.
pub const DEFAULT_SAMPLES: usize = 25;

/// Default segment length.
pub const DEFAULT_SEGMENT: Duration = Duration::from_secs(1);

/// Parameters of the stopping rule.
#[derive(Clone, Debug, PartialEq)]
pub struct AutoTermOpt {
    /// Hard upper bound of the run. A zero duration disables automatic termination.
    pub duration: Duration,
    pub pct: f64,
    pub samples: usize,
    pub segment: Duration,
}

impl AutoTermOpt {
    pub fn enabled(&self) -> bool {
        !self.duration.is_zero()
    }
}

impl Default for AutoTermOpt {
    fn default() -> Self {
        Self {
            duration: Duration::ZERO,
            pct: DEFAULT_PCT,
            samples: DEFAULT_SAMPLES,
            segment: DEFAULT_SEGMENT,
        }
    }
}

/// The state of one stopping rule, fed by the collector.
#[derive(Debug)]
pub struct AutoTerminator {
    ctx: Context,
    op_type: OpType,
    opt: AutoTermOpt,
    start: Instant,
    /// Index of the segment stored at the front of `counts`.
    base: u64,
    counts: VecDeque<u64>,
    /// The last segment index that has been evaluated.
    checked: u64,
    fired: bool,
}

impl AutoTerminator {
    /// Wrap `parent` into a child context that this monitor may cancel, and which expires after
    /// `opt.duration`.
    pub fn new(parent: &Context, op_type: OpType, opt: AutoTermOpt) -> Self {
        let ctx = parent.with_timeout(opt.duration);
        Self::with_start(ctx, op_type, opt, Instant::now())
    }

    fn with_start(ctx: Context, op_type: OpType, opt: AutoTermOpt, start: Instant) -> Self {
        let capacity = opt.samples + 1;
        Self {
            ctx,
            op_type,
            opt,
            start,
            base: 0,
            counts: VecDeque::with_capacity(capacity),
            checked: 0,
            fired: false,
        }
    }

    /// The context workers should run under.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn fired(&self) -> bool {
        self.fired
    }

    fn segment_of(&self, t: Instant) -> u64 {
        let elapsed = t.saturating_duration_since(self.start);
        (elapsed.as_nanos() / self.opt.segment.as_nanos().max(1)) as u64
    }

    /// Account for one finished operation.
    pub fn observe(&mut self, op: &Operation) {
        if op.op_type != self.op_type || op.is_error() {
            return;
        }
        let seg = self.segment_of(op.end);
        if seg < self.base {
            return;
        }
        let idx = (seg - self.base) as usize;
        if idx >= self.counts.len() {
            self.counts.resize(idx + 1, 0);
        }
        self.counts[idx] += 1;
    }

    /// Evaluate the rule at `now`. Returns `true` if this call cancelled the context.
    pub fn check(&mut self, now: Instant) -> bool {
        if self.fired || self.ctx.is_done() {
            return false;
        }
        // segments strictly before `current` are complete
        let current = self.segment_of(now);
        if current <= self.checked {
            return false;
        }
        self.checked = current;
        if (current as usize) < self.opt.samples {
            return false;
        }
        let first = current - self.opt.samples as u64;
        // drop segments that will never be looked at again
        while self.base < first {
            self.counts.pop_front();
            self.base += 1;
        }
        let window: Vec<f64> = (first..current)
            .map(|seg| {
                let idx = (seg - self.base) as usize;
                self.counts.get(idx).copied().unwrap_or(0) as f64
            })
            .collect();
        if is_stable(&window, self.opt.pct) {
            log::debug!(
                "{} throughput stable over the last {} segments, terminating",
                self.op_type,
                self.opt.samples
            );
            self.fired = true;
            self.ctx.cancel();
            return true;
        }
        false
    }
}

/// Whether every value is within `pct` percent of the mean of all values.
fn is_stable(window: &[f64], pct: f64) -> bool {
    if window.is_empty() {
        return false;
    }
    let mean = window.iter().sum::<f64>() / window.len() as f64;
    if mean <= 0.0 {
        return false;
    }
    let tolerance = mean * pct / 100.0;
    window.iter().all(|v| (v - mean).abs() <= tolerance)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opt(samples: usize) -> AutoTermOpt {
        AutoTermOpt {
            duration: Duration::from_secs(3600),
            pct: 10.0,
            samples,
            segment: Duration::from_millis(100),
        }
    }

    fn op(op_type: OpType, end: Instant, error: bool) -> Operation {
        Operation {
            op_type,
            worker: 0,
            target: "c/ns/t".to_string(),
            objects: 1,
            endpoint: "c".to_string(),
            start: end,
            end,
            error: error.then(|| "boom".to_string()),
        }
    }

    fn feed(term: &mut AutoTerminator, start: Instant, per_segment: &[u64]) {
        for (seg, n) in per_segment.iter().enumerate() {
            let t = start + Duration::from_millis(100 * seg as u64 + 50);
            for _ in 0..*n {
                term.observe(&op(OpType::TableGet, t, false));
            }
        }
    }

    #[test]
    fn stability() {
        assert!(is_stable(&[100.0, 105.0, 95.0], 7.5));
        assert!(!is_stable(&[100.0, 120.0, 80.0], 7.5));
        assert!(!is_stable(&[0.0, 0.0, 0.0], 7.5));
        assert!(!is_stable(&[], 7.5));
    }

    #[test]
    fn fires_on_stable_throughput() {
        let start = Instant::now();
        let ctx = Context::background().with_timeout(Duration::from_secs(3600));
        let mut term = AutoTerminator::with_start(ctx, OpType::TableGet, opt(5), start);
        feed(&mut term, start, &[100, 101, 99, 100, 100, 102]);

        // only 4 complete segments
        assert!(!term.check(start + Duration::from_millis(450)));
        assert!(!term.context().is_done());

        assert!(term.check(start + Duration::from_millis(550)));
        assert!(term.fired());
        assert!(term.context().is_done());
        // single fire
        assert!(!term.check(start + Duration::from_millis(650)));
    }

    #[test]
    fn keeps_running_while_ramping() {
        let start = Instant::now();
        let ctx = Context::background().with_timeout(Duration::from_secs(3600));
        let mut term = AutoTerminator::with_start(ctx, OpType::TableGet, opt(3), start);
        feed(&mut term, start, &[10, 50, 100, 150, 200]);
        for seg in 3..=5 {
            assert!(!term.check(start + Duration::from_millis(100 * seg)));
        }
        assert!(!term.context().is_done());
    }

    #[test]
    fn ignores_errors_and_other_types() {
        let start = Instant::now();
        let ctx = Context::background().with_timeout(Duration::from_secs(3600));
        let mut term = AutoTerminator::with_start(ctx, OpType::TableGet, opt(3), start);
        for seg in 0..3u64 {
            let t = start + Duration::from_millis(100 * seg + 50);
            for _ in 0..100 {
                term.observe(&op(OpType::TableUpdate, t, false));
                term.observe(&op(OpType::TableGet, t, true));
            }
        }
        assert!(!term.check(start + Duration::from_millis(350)));
    }

    #[test]
    fn hard_deadline() {
        let parent = Context::background();
        let o = AutoTermOpt {
            duration: Duration::from_millis(30),
            ..opt(5)
        };
        let term = AutoTerminator::new(&parent, OpType::TableGet, o);
        assert!(!term.context().is_done());
        std::thread::sleep(Duration::from_millis(50));
        assert!(term.context().is_done());
        assert!(!parent.is_done());
    }

    #[test]
    fn disabled_by_default() {
        assert!(!AutoTermOpt::default().enabled());
    }
}
