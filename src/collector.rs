//! The measurement sink.
//!
//! Workers push one [`Operation`] per request attempt into a bounded [`Sink`]. When the buffer is
//! full, the worker blocks until the consumer catches up: a slow consumer throttles the producers
//! instead of losing measurements. [`Collector`] owns the consuming end on a dedicated thread that
//! aggregates the stream into a [`Summary`] and feeds the registered [`AutoTerminator`]s.

use crate::autoterm::{AutoTermOpt, AutoTerminator};
use crate::{Context, OpType, Operation};
use hdrhistogram::Histogram;
use log::debug;
use parking_lot::Mutex;
use quanta::Instant;
use std::collections::BTreeMap;
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Default capacity of the operation channel.
pub const DEFAULT_CAPACITY: usize = 1024;

/// How often the consumer evaluates the stopping rules when the stream is quiet.
const TICK: Duration = Duration::from_millis(50);

/// The producing end, cloned into every worker.
#[derive(Clone, Debug)]
pub struct Sink(SyncSender<Operation>);

impl Sink {
    /// Hand over an operation, blocking while the channel is full. Returns `false` if nobody
    /// consumes the stream anymore.
    pub fn send(&self, op: Operation) -> bool {
        self.0.send(op).is_ok()
    }
}

/// A bounded operation channel. The receiving end is for callers that aggregate on their own.
pub fn channel(capacity: usize) -> (Sink, Receiver<Operation>) {
    let (tx, rx) = sync_channel(capacity);
    (Sink(tx), rx)
}

/// Aggregated measurements of one [`OpType`].
#[derive(Clone, Debug)]
pub struct OpStats {
    /// Every attempt, failed or not.
    pub total: u64,
    pub errors: u64,
    /// Latency of successful requests, in nanoseconds.
    pub hdr: Histogram<u64>,
    pub first_start: Option<Instant>,
    pub last_end: Option<Instant>,
}

impl OpStats {
    fn new() -> Self {
        Self {
            total: 0,
            errors: 0,
            hdr: Histogram::new(3).expect("3 significant figures is a valid precision"),
            first_start: None,
            last_end: None,
        }
    }

    fn record(&mut self, op: &Operation) {
        self.total += 1;
        if op.is_error() {
            self.errors += 1;
        } else {
            self.hdr.saturating_record(op.duration().as_nanos() as u64);
        }
        self.first_start = Some(match self.first_start {
            Some(t) => t.min(op.start),
            None => op.start,
        });
        self.last_end = Some(match self.last_end {
            Some(t) => t.max(op.end),
            None => op.end,
        });
    }

    /// Time between the first request's start and the last request's end.
    pub fn span(&self) -> Duration {
        match (self.first_start, self.last_end) {
            (Some(s), Some(e)) => e.saturating_duration_since(s),
            _ => Duration::ZERO,
        }
    }
}

/// Everything the collector saw during a run.
#[derive(Clone, Debug, Default)]
pub struct Summary {
    pub ops: BTreeMap<OpType, OpStats>,
    /// Whether an auto-terminator ended the run.
    pub autoterm_fired: bool,
}

impl Summary {
    pub fn total(&self) -> u64 {
        self.ops.values().map(|s| s.total).sum()
    }

    pub fn errors(&self) -> u64 {
        self.ops.values().map(|s| s.errors).sum()
    }

    fn record(&mut self, op: &Operation) {
        self.ops
            .entry(op.op_type)
            .or_insert_with(OpStats::new)
            .record(op);
    }

    /// Print one `finish` line per operation type.
    pub fn print_finish(&self, phase: usize) {
        for (op_type, stats) in self.ops.iter() {
            let duration = stats.span().as_secs_f64();
            let ops = if duration > 0.0 {
                (stats.total - stats.errors) as f64 / duration
            } else {
                0.0
            };
            print!(
                "phase {} finish {} duration {:.2} total {} errors {} ops {:.2}",
                phase, op_type, duration, stats.total, stats.errors, ops
            );
            let hdr = &stats.hdr;
            if !hdr.is_empty() {
                print!(
                    " min_us {:.2} max_us {:.2} avg_us {:.2} \
                     p50_us {:.2} p95_us {:.2} p99_us {:.2} p999_us {:.2}",
                    hdr.min() as f64 / 1000.0,
                    hdr.max() as f64 / 1000.0,
                    hdr.mean() / 1000.0,
                    hdr.value_at_quantile(0.50) as f64 / 1000.0,
                    hdr.value_at_quantile(0.95) as f64 / 1000.0,
                    hdr.value_at_quantile(0.99) as f64 / 1000.0,
                    hdr.value_at_quantile(0.999) as f64 / 1000.0,
                );
            }
            println!();
        }
    }
}

/// Collector options.
#[derive(Clone, Debug)]
pub struct CollectorOpt {
    pub capacity: usize,
    /// Print a throughput line every second, labelled with this phase id.
    pub interval: Option<usize>,
}

impl Default for CollectorOpt {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            interval: None,
        }
    }
}

type Monitors = Arc<Mutex<Vec<AutoTerminator>>>;

/// A cloneable handle for registering stopping rules with a running [`Collector`].
#[derive(Clone)]
pub struct AutoTermHook(Monitors);

impl AutoTermHook {
    /// Attach a stopping rule for `op_type` and return the context it may cancel.
    pub fn attach(&self, ctx: &Context, op_type: OpType, opt: AutoTermOpt) -> Context {
        let term = AutoTerminator::new(ctx, op_type, opt);
        let ctx = term.context().clone();
        self.0.lock().push(term);
        ctx
    }
}

/// Owns the consumer thread of an operation channel.
pub struct Collector {
    sink: Sink,
    monitors: Monitors,
    consumer: JoinHandle<Summary>,
}

impl Collector {
    pub fn new(opt: &CollectorOpt) -> Self {
        let (sink, rx) = channel(opt.capacity);
        let monitors: Monitors = Arc::new(Mutex::new(Vec::new()));
        let consumer = {
            let monitors = monitors.clone();
            let interval = opt.interval;
            std::thread::spawn(move || consume(rx, monitors, interval))
        };
        Self {
            sink,
            monitors,
            consumer,
        }
    }

    pub fn sink(&self) -> Sink {
        self.sink.clone()
    }

    pub fn hook(&self) -> AutoTermHook {
        AutoTermHook(self.monitors.clone())
    }

    /// Attach a stopping rule for `op_type` and return the context it may cancel.
    pub fn auto_term(&self, ctx: &Context, op_type: OpType, opt: AutoTermOpt) -> Context {
        self.hook().attach(ctx, op_type, opt)
    }

    /// Close the collector's own sink and wait for the consumer to drain the channel. Every other
    /// [`Sink`] clone must have been dropped already, or this blocks until they are.
    pub fn finish(self) -> Summary {
        let Self { sink, consumer, .. } = self;
        drop(sink);
        match consumer.join() {
            Ok(summary) => summary,
            Err(e) => std::panic::resume_unwind(e),
        }
    }
}

/// Requests seen since the last interval line.
struct Window {
    since: Instant,
    start: Instant,
    second: u64,
    total: u64,
    errors: u64,
}

/// One interval line.
#[derive(Debug, PartialEq)]
struct Tick {
    second: u64,
    elapsed: Duration,
    total: u64,
    errors: u64,
    /// Successful requests per second over the window.
    rate: f64,
}

impl Window {
    fn new(since: Instant) -> Self {
        Self {
            since,
            start: since,
            second: 1,
            total: 0,
            errors: 0,
        }
    }

    fn record(&mut self, op: &Operation) {
        self.total += 1;
        if op.is_error() {
            self.errors += 1;
        }
    }

    /// Close the window once the next whole second of the run has passed. A window that ran
    /// late is measured over its actual length.
    fn tick(&mut self, now: Instant) -> Option<Tick> {
        let elapsed = now.saturating_duration_since(self.since);
        if elapsed < Duration::from_secs(self.second) {
            return None;
        }
        let span = now.saturating_duration_since(self.start).as_secs_f64();
        let ok = self.total - self.errors;
        let tick = Tick {
            second: self.second,
            elapsed,
            total: self.total,
            errors: self.errors,
            rate: if span > 0.0 { ok as f64 / span } else { 0.0 },
        };
        self.second = elapsed.as_secs() + 1;
        self.start = now;
        self.total = 0;
        self.errors = 0;
        Some(tick)
    }
}

impl Tick {
    fn print(&self, phase: usize) {
        println!(
            "phase {} second {} elapsed {:.2} total {} errors {} ops {:.2}",
            phase,
            self.second,
            self.elapsed.as_secs_f64(),
            self.total,
            self.errors,
            self.rate,
        );
    }
}

fn consume(rx: Receiver<Operation>, monitors: Monitors, interval: Option<usize>) -> Summary {
    let mut summary = Summary::default();
    let mut last_tick = Instant::now();
    let mut window = Window::new(last_tick);

    loop {
        match rx.recv_timeout(TICK) {
            Ok(op) => {
                summary.record(&op);
                window.record(&op);
                for m in monitors.lock().iter_mut() {
                    m.observe(&op);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let now = Instant::now();
        if now - last_tick < TICK {
            continue;
        }
        last_tick = now;
        for m in monitors.lock().iter_mut() {
            m.check(now);
        }
        if let Some(phase) = interval {
            if let Some(tick) = window.tick(now) {
                tick.print(phase);
            }
        }
    }

    summary.autoterm_fired = monitors.lock().iter().any(|m| m.fired());
    debug!(
        "Collector drained: {} operations, {} errors",
        summary.total(),
        summary.errors()
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(op_type: OpType, worker: u32, error: bool) -> Operation {
        let start = Instant::now();
        Operation {
            op_type,
            worker,
            target: "c/ns/t".to_string(),
            objects: 1,
            endpoint: "c".to_string(),
            start,
            end: start + Duration::from_micros(100),
            error: error.then(|| "boom".to_string()),
        }
    }

    #[test]
    fn aggregates_per_type() {
        let collector = Collector::new(&CollectorOpt::default());
        let sink = collector.sink();
        for i in 0..10 {
            assert!(sink.send(op(OpType::TableGet, i, i % 5 == 0)));
        }
        for i in 0..3 {
            assert!(sink.send(op(OpType::TableUpdate, i, false)));
        }
        drop(sink);
        let summary = collector.finish();
        assert_eq!(summary.total(), 13);
        assert_eq!(summary.errors(), 2);
        let get = &summary.ops[&OpType::TableGet];
        assert_eq!(get.total, 10);
        assert_eq!(get.errors, 2);
        assert_eq!(get.hdr.len(), 8);
        assert_eq!(summary.ops[&OpType::TableUpdate].total, 3);
        assert!(!summary.autoterm_fired);
        summary.print_finish(0);
    }

    #[test]
    fn full_channel_blocks_producer() {
        let (sink, rx) = channel(2);
        assert!(sink.send(op(OpType::TableGet, 0, false)));
        assert!(sink.send(op(OpType::TableGet, 0, false)));
        let producer = std::thread::spawn(move || sink.send(op(OpType::TableGet, 0, false)));
        std::thread::sleep(Duration::from_millis(30));
        assert!(!producer.is_finished());
        rx.recv().unwrap();
        assert!(producer.join().unwrap());
        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn closed_channel_is_reported() {
        let (sink, rx) = channel(2);
        drop(rx);
        assert!(!sink.send(op(OpType::TableGet, 0, false)));
    }

    #[test]
    fn auto_term_cancels_on_steady_stream() {
        let collector = Collector::new(&CollectorOpt::default());
        let root = Context::background();
        let opt = AutoTermOpt {
            duration: Duration::from_secs(30),
            pct: 50.0,
            samples: 3,
            segment: Duration::from_millis(50),
        };
        let ctx = collector.auto_term(&root, OpType::TableGet, opt);
        let sink = collector.sink();
        let producer = {
            let ctx = ctx.clone();
            std::thread::spawn(move || {
                while !ctx.is_done() {
                    sink.send(op(OpType::TableGet, 0, false));
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
        };
        producer.join().unwrap();
        let summary = collector.finish();
        assert!(summary.autoterm_fired);
        assert!(!root.is_done());
    }

    #[test]
    fn window_resets_every_line() {
        let t0 = Instant::now();
        let mut window = Window::new(t0);
        for i in 0..10 {
            window.record(&op(OpType::TableGet, 0, i % 5 == 0));
        }
        assert_eq!(window.tick(t0 + Duration::from_millis(500)), None);

        // the consumer was busy, so this window is two seconds long
        let tick = window.tick(t0 + Duration::from_secs(2)).unwrap();
        assert_eq!(
            tick,
            Tick {
                second: 1,
                elapsed: Duration::from_secs(2),
                total: 10,
                errors: 2,
                rate: 4.0,
            }
        );
        assert_eq!(window.tick(t0 + Duration::from_millis(2500)), None);

        for _ in 0..3 {
            window.record(&op(OpType::TableUpdate, 1, false));
        }
        let tick = window.tick(t0 + Duration::from_secs(3)).unwrap();
        assert_eq!((tick.second, tick.total, tick.errors), (3, 3, 0));
        assert_eq!(tick.rate, 3.0);
    }

    #[test]
    fn interval_lines_while_running() {
        let collector = Collector::new(&CollectorOpt {
            interval: Some(0),
            ..Default::default()
        });
        let sink = collector.sink();
        let producer = std::thread::spawn(move || {
            let start = std::time::Instant::now();
            let mut sent = 0u64;
            while start.elapsed() < Duration::from_millis(1200) {
                assert!(sink.send(op(OpType::TableGet, 0, sent % 7 == 0)));
                sent += 1;
                std::thread::sleep(Duration::from_millis(1));
            }
            sent
        });
        let sent = producer.join().unwrap();
        let summary = collector.finish();
        assert_eq!(summary.total(), sent);
        assert_eq!(summary.errors(), sent.div_ceil(7));
    }
}
