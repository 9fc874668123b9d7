//! The core benchmark functionality.
//!
//! A benchmark in this crate actually refers to a group of benchmark runs, named **phases**. Users
//! can provide one or multiple phases that will be run sequentially against the same catalog,
//! each with different configurations. Every phase is one [`BenchmarkJob`] that goes through
//! prepare, start and cleanup.
//!
//! ## Configuration Format
//!
//! A benchmark configuration file is formatted in TOML. It consists of the definition of multiple
//! phases, each is defined in a dictionary named `benchmark`. Phases are organized in an array, so
//! the configuration of each phase starts with `[[benchmark]]`. It also supports a `[global]`
//! section in the configuration file that will override the missing field in each phase. This can
//! reduce the number of repeated options in each phase (e.g., shared options).
//!
//! A configuration file generally looks like the following:
//!
//! ```toml
//! [global]
//! seed = 42
//! timeout = 30.0
//!
//! [[benchmark]]
//! readers = [{ count = 8, mean = 0.3, variance = 0.0278 }]
//! writers = [{ count = 2, mean = 0.7, variance = 0.0278 }]
//!
//! [[benchmark]]
//! # phase 2 configuration
//! ```
//!
//! Besides the benchmark phases, the full configuration also contains a `[catalog]` section (see
//! [`mod@crate::catalogs`]) and a `[tree]` section (see [`mod@crate::tree`]).
//!
//! Available options and their usage can be found in [`BenchmarkOpt`] and [`GlobalOpt`], for phase
//! and global options, respectively.
//!
//! Any option can be overwritten via environment variables prefixed with `CATBENCH_`, with `__`
//! separating nested keys. For example, `CATBENCH_GLOBAL__SEED=7` overrides `seed` in `[global]`.
//!
//! ## Workers
//!
//! Each entry of `readers` and `writers` is a [`Distribution`]: `count` workers that concentrate
//! their requests around the relative position `mean` of the ordered table list, with a spread of
//! `sqrt(variance)`. Readers fetch tables, writers update a property of them. Worker ids are
//! assigned in spawn order, reader groups first. Every worker's random stream is seeded from the
//! base `seed` plus its group and id, so the same configuration always produces the same
//! per-worker sequence of tables.
//!
//! A phase ends when its `timeout` expires, when the `ops` quota is used up, when the
//! auto-terminator decides throughput is stable, or on Ctrl-C, whichever comes first.
//!
//! ## Output Format
//!
//! All outputs are in plain text format, easy to process with shell scripts and gnuplot.
//!
//! ### Interval Output (when `report` is `interval` or `all`)
//!
//! ```txt
//! phase 0 second 1 elapsed 1.00 total 4012 errors 0 ops 4012.00
//! phase 0 second 2 elapsed 2.00 total 3987 errors 2 ops 3985.00
//! ```
//!
//! Where `total` counts all request attempts finished during that second, `errors` the failed
//! ones, and `ops` the successful requests per second.
//!
//! ### Finish Output (when `report` is `finish` or `all`)
//!
//! One line per operation type, after all workers have exited:
//!
//! ```txt
//! phase 0 finish TABLE_GET duration 10.00 total 40000 errors 0 ops 4000.00 min_us 100.00 max_us 900.00 avg_us 200.00 p50_us 190.00 p95_us 300.00 p99_us 500.00 p999_us 800.00
//! ```
//!
//! The latency figures are in microseconds and only cover successful requests. They are omitted
//! if no request succeeded.

use crate::autoterm::AutoTermOpt;
use crate::catalogs::{self, CatalogOpt};
use crate::collector::{AutoTermHook, Collector, CollectorOpt, Sink, Summary, DEFAULT_CAPACITY};
use crate::context::seconds;
use crate::limiter::{Permit, RateLimiter, Throttle};
use crate::sampler::{worker_seed, Distribution, WeightedSampler};
use crate::thread::{DefaultThread, JoinHandle, Thread};
use crate::tree::{TableTree, TreeOpt};
use crate::*;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use log::{debug, info, warn};
use quanta::Instant;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

// {{{ benchmark

/// How the results are printed out.
/// "hidden": no results
/// "interval": a throughput line every second
/// "finish": only the finish metrics
/// "all": equals to interval + finish
#[derive(Clone, Copy, Debug, PartialEq)]
enum ReportMode {
    Hidden,
    Interval,
    Finish,
    All,
}

impl ReportMode {
    fn interval(&self) -> bool {
        matches!(self, ReportMode::Interval | ReportMode::All)
    }

    fn finish(&self) -> bool {
        matches!(self, ReportMode::Finish | ReportMode::All)
    }
}

/// The configuration of a single benchmark phase deserialized from a TOML string.
///
/// The fields are optional to ease parsing from TOML, as there can be global parameters that are
/// set for them.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct BenchmarkOpt {
    /// Base seed of all workers' random streams.
    ///
    /// Default: 42.
    pub seed: Option<u64>,

    /// How long this phase will run, unit is seconds. If neither this nor `ops` is given, the
    /// phase runs until the auto-terminator fires or the process is interrupted.
    pub timeout: Option<f32>,

    /// Target total request rate across all workers, in requests per second.
    ///
    /// Default: unlimited.
    pub rps: Option<f64>,

    /// Total number of requests in this phase. Once used up, workers exit.
    pub ops: Option<u64>,

    /// Maximum duration of an auto-terminated phase, in seconds. A positive value enables
    /// automatic termination as soon as throughput has stabilized.
    ///
    /// Default: 0 (disabled).
    pub autoterm: Option<f32>,

    /// Auto-termination tolerance, in percent of the mean segment throughput.
    ///
    /// Default: 7.5.
    pub autoterm_pct: Option<f64>,

    /// Number of trailing segments the auto-terminator compares.
    ///
    /// Default: 25.
    pub autoterm_samples: Option<usize>,

    /// Length of an auto-termination segment, in seconds.
    ///
    /// Default: 1.0.
    pub autoterm_segment: Option<f32>,

    /// Capacity of the operation channel between workers and the collector.
    ///
    /// Default: 1024.
    pub queue: Option<usize>,

    /// Report mode:
    ///
    /// - "hidden": not reported.
    /// - "interval": a throughput line is printed every second.
    /// - "finish": after all workers exit, per-operation metrics are printed.
    /// - "all": equals to "interval" + "finish".
    pub report: Option<String>,

    /// Reader groups.
    pub readers: Option<Vec<Distribution>>,

    /// Writer groups.
    pub writers: Option<Vec<Distribution>>,
}

fn positive(v: f64) -> bool {
    v.is_finite() && v > 0.0
}

impl BenchmarkOpt {
    /// Internal function called after all global options are applied. This will test if the opt
    /// can be a valid benchmark.
    fn sanity(&self) -> Result<(), Error> {
        let groups = self
            .readers
            .iter()
            .flatten()
            .map(|d| ("readers", d))
            .chain(self.writers.iter().flatten().map(|d| ("writers", d)));
        let mut workers = 0usize;
        for (name, d) in groups {
            if !(0.0..=1.0).contains(&d.mean) {
                return Err(Error::config(format!(
                    "{} mean should be between 0.0 and 1.0, got {}",
                    name, d.mean
                )));
            }
            if !(d.variance.is_finite() && d.variance >= 0.0) {
                return Err(Error::config(format!(
                    "{} variance should be non-negative, got {}",
                    name, d.variance
                )));
            }
            workers += d.count;
        }
        if workers == 0 {
            return Err(Error::config("at least one reader or writer is required"));
        }
        if let Some(t) = self.timeout {
            if !positive(t.into()) {
                return Err(Error::config("timeout should be positive if given"));
            }
            seconds("timeout", t)?;
        }
        if let Some(r) = self.rps {
            if !positive(r) {
                return Err(Error::config("rps should be positive if given"));
            }
        }
        if self.ops == Some(0) {
            return Err(Error::config("ops should be positive if given"));
        }
        if let Some(t) = self.autoterm {
            if !(t.is_finite() && t >= 0.0) {
                return Err(Error::config("autoterm should not be negative"));
            }
            seconds("autoterm", t)?;
        }
        if let Some(p) = self.autoterm_pct {
            if !positive(p) {
                return Err(Error::config("autoterm_pct should be positive if given"));
            }
        }
        if let Some(s) = self.autoterm_samples {
            if s < 2 {
                return Err(Error::config("autoterm_samples should be at least 2"));
            }
        }
        if let Some(s) = self.autoterm_segment {
            if !positive(s.into()) {
                return Err(Error::config("autoterm_segment should be positive if given"));
            }
            seconds("autoterm_segment", s)?;
        }
        if self.queue == Some(0) {
            return Err(Error::config("queue should be positive if given"));
        }
        match self.report.as_deref().unwrap_or("all") {
            "hidden" | "interval" | "finish" | "all" => {}
            _ => {
                return Err(Error::config(
                    "report mode should be one of: hidden, interval, finish, all",
                ))
            }
        }
        Ok(())
    }
}

/// The configuration of a benchmark phase, validated and with all defaults filled in.
#[derive(Clone, Debug, PartialEq)]
pub struct Benchmark {
    seed: u64,
    timeout: Option<Duration>,
    rps: Option<f64>,
    ops: Option<u64>,
    autoterm: AutoTermOpt,
    queue: usize,
    report: ReportMode,
    readers: Vec<Distribution>,
    writers: Vec<Distribution>,
}

impl Benchmark {
    /// The constructor of Benchmark expects all global options have been applied.
    fn new(opt: &BenchmarkOpt) -> Result<Self, Error> {
        opt.sanity()?;
        let defaults = AutoTermOpt::default();
        let autoterm = AutoTermOpt {
            duration: seconds("autoterm", opt.autoterm.unwrap_or(0.0))?,
            pct: opt.autoterm_pct.unwrap_or(defaults.pct),
            samples: opt.autoterm_samples.unwrap_or(defaults.samples),
            segment: match opt.autoterm_segment {
                Some(s) => seconds("autoterm_segment", s)?,
                None => defaults.segment,
            },
        };
        let timeout = match opt.timeout {
            Some(t) => Some(seconds("timeout", t)?),
            None => None,
        };
        let report = match opt.report.as_deref().unwrap_or("all") {
            "hidden" => ReportMode::Hidden,
            "interval" => ReportMode::Interval,
            "finish" => ReportMode::Finish,
            _ => ReportMode::All,
        };
        Ok(Self {
            seed: opt.seed.unwrap_or(42),
            timeout,
            rps: opt.rps,
            ops: opt.ops,
            autoterm,
            queue: opt.queue.unwrap_or(DEFAULT_CAPACITY),
            report,
            readers: opt.readers.clone().unwrap_or_default(),
            writers: opt.writers.clone().unwrap_or_default(),
        })
    }

    /// A phase with the given groups and every other option at its default.
    pub fn with_groups(
        seed: u64,
        readers: Vec<Distribution>,
        writers: Vec<Distribution>,
    ) -> Result<Self, Error> {
        let opt = BenchmarkOpt {
            seed: Some(seed),
            readers: Some(readers),
            writers: Some(writers),
            ..Default::default()
        };
        Self::new(&opt)
    }

    /// Total number of workers across all groups.
    pub fn workers(&self) -> usize {
        self.readers
            .iter()
            .chain(self.writers.iter())
            .map(|d| d.count)
            .sum()
    }

    /// The operation type the auto-terminator watches: that of the first group that has workers.
    fn monitored_op(&self) -> OpType {
        if self.readers.iter().any(|d| d.count > 0) {
            OpType::TableGet
        } else {
            OpType::TableUpdate
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn autoterm(&self) -> &AutoTermOpt {
        &self.autoterm
    }
}

// }}} benchmark

// {{{ benchmarkgroup

/// The global options that go to the `[global]` section.
///
/// They will override missing fields in each `[[benchmark]]` section, if the corresponding option
/// is missing. For the usage of each option, please refer to [`BenchmarkOpt`].
#[derive(Deserialize, Clone, Debug, Default)]
pub struct GlobalOpt {
    pub seed: Option<u64>,
    pub timeout: Option<f32>,
    pub rps: Option<f64>,
    pub ops: Option<u64>,
    pub autoterm: Option<f32>,
    pub autoterm_pct: Option<f64>,
    pub autoterm_samples: Option<usize>,
    pub autoterm_segment: Option<f32>,
    pub queue: Option<usize>,
    pub report: Option<String>,
    pub readers: Option<Vec<Distribution>>,
    pub writers: Option<Vec<Distribution>>,
}

impl GlobalOpt {
    fn apply(&self, opt: &mut BenchmarkOpt) {
        opt.seed = opt.seed.or(self.seed);
        opt.timeout = opt.timeout.or(self.timeout);
        opt.rps = opt.rps.or(self.rps);
        opt.ops = opt.ops.or(self.ops);
        opt.autoterm = opt.autoterm.or(self.autoterm);
        opt.autoterm_pct = opt.autoterm_pct.or(self.autoterm_pct);
        opt.autoterm_samples = opt.autoterm_samples.or(self.autoterm_samples);
        opt.autoterm_segment = opt.autoterm_segment.or(self.autoterm_segment);
        opt.queue = opt.queue.or(self.queue);
        opt.report = opt.report.take().or_else(|| self.report.clone());
        opt.readers = opt.readers.take().or_else(|| self.readers.clone());
        opt.writers = opt.writers.take().or_else(|| self.writers.clone());
    }
}

/// The configuration of a group of benchmark(s). It has a global option that could possibly
/// override benchmark-local options.
#[derive(Deserialize, Clone, Debug)]
struct BenchmarkGroupOpt {
    /// Global parameters (optional)
    global: Option<GlobalOpt>,

    /// Catalog configuration
    catalog: CatalogOpt,

    /// Table universe (optional, defaults apply)
    tree: Option<TreeOpt>,

    /// Array of the parameters of consisting Benchmark(s)
    benchmark: Vec<BenchmarkOpt>,
}

/// A catalog, its table universe, and the phases to run against it.
pub struct BenchmarkGroup {
    pub catalog: Arc<dyn Catalog>,
    pub tree: TreeOpt,
    pub phases: Vec<Arc<Benchmark>>,
}

// }}} benchmarkgroup

// {{{ job

/// The lifecycle of a [`BenchmarkJob`]. Transitions only go forward, one step at a time.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobState {
    Created,
    Prepared,
    Running,
    Cleaned,
}

impl JobState {
    fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Prepared => "prepared",
            JobState::Running => "running",
            JobState::Cleaned => "cleaned",
        }
    }
}

/// Which remote operation a worker issues against its sampled table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Reader,
    Writer,
}

impl Role {
    fn op_type(&self) -> OpType {
        match self {
            Role::Reader => OpType::TableGet,
            Role::Writer => OpType::TableUpdate,
        }
    }

    fn seed_offset(&self) -> u64 {
        match self {
            Role::Reader => 1000,
            Role::Writer => 2000,
        }
    }
}

/// One run of a [`Benchmark`] against a catalog.
///
/// The job owns the table universe once prepared, and spawns/joins the workers in
/// [`BenchmarkJob::start`]. Measurements go to the [`Sink`] it was created with.
pub struct BenchmarkJob {
    benchmark: Arc<Benchmark>,
    catalog: Arc<dyn Catalog>,
    catalog_name: Arc<str>,
    provider: Box<dyn TargetProvider>,
    targets: Arc<Vec<Target>>,
    sink: Sink,
    limiter: Option<Arc<dyn RateLimiter>>,
    autoterm: Option<AutoTermHook>,
    status: Arc<dyn StatusSink>,
    thread: Box<dyn Thread>,
    state: JobState,
}

impl BenchmarkJob {
    pub fn new(
        benchmark: Arc<Benchmark>,
        catalog: Arc<dyn Catalog>,
        catalog_name: &str,
        provider: Box<dyn TargetProvider>,
        sink: Sink,
    ) -> Self {
        Self {
            benchmark,
            catalog,
            catalog_name: catalog_name.into(),
            provider,
            targets: Arc::new(Vec::new()),
            sink,
            limiter: None,
            autoterm: None,
            status: Arc::new(LogStatus),
            thread: Box::new(DefaultThread),
            state: JobState::Created,
        }
    }

    pub fn with_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Let the job attach its stopping rule to a collector. Only used if the benchmark enables
    /// automatic termination.
    pub fn with_auto_term(mut self, hook: AutoTermHook) -> Self {
        self.autoterm = Some(hook);
        self
    }

    pub fn with_status(mut self, status: Arc<dyn StatusSink>) -> Self {
        self.status = status;
        self
    }

    pub fn with_thread(mut self, thread: Box<dyn Thread>) -> Self {
        self.thread = thread;
        self
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// The resolved table universe. Empty until prepared.
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    fn expect(&self, expected: JobState) -> Result<(), Error> {
        if self.state != expected {
            return Err(Error::InvalidState {
                expected: expected.as_str(),
                found: self.state.as_str(),
            });
        }
        Ok(())
    }

    /// Resolve the table universe and probe the catalog with the first table.
    pub fn prepare(&mut self, ctx: &Context) -> Result<(), Error> {
        self.expect(JobState::Created)?;
        self.status.report(&format!(
            "Loading dataset info: {} tables",
            self.provider.total_count()
        ));
        let targets = self.provider.all_targets();
        let first = match targets.first() {
            Some(first) => first,
            None => return Err(Error::NoTargets),
        };

        self.status.report("Verifying catalog connectivity...");
        let mut handle = self.catalog.handle();
        handle
            .fetch(ctx, &self.catalog_name, &first.namespace, &first.name)
            .map_err(|source| Error::Connectivity {
                target: first.label(&self.catalog_name),
                source,
            })?;

        self.status.report(&format!(
            "Preparation complete - {} tables available for weighted workload",
            targets.len()
        ));
        self.targets = Arc::new(targets);
        self.state = JobState::Prepared;
        Ok(())
    }

    /// Spawn every worker, then block until all of them have exited.
    ///
    /// Workers park on `signal` before issuing anything, so the caller must release it from
    /// another thread, typically with [`StartSignal::release_when`] and [`Benchmark::workers`].
    /// Workers exit when `ctx` is done, when the auto-terminator fires, or when the rate limiter
    /// reports the end of the run. Request failures never end the run. Returns the number of
    /// spawned workers.
    ///
    /// If a worker cannot be spawned, the workers already running are released and stopped, then
    /// joined, and the spawn error is returned. The job stays `Running`.
    pub fn start(&mut self, ctx: &Context, signal: &StartSignal) -> Result<usize, Error> {
        self.expect(JobState::Prepared)?;
        self.state = JobState::Running;

        let run = ctx.with_cancel();
        let ctx = match self.autoterm {
            Some(ref hook) if self.benchmark.autoterm.enabled() => hook.attach(
                &run,
                self.benchmark.monitored_op(),
                self.benchmark.autoterm.clone(),
            ),
            _ => run.clone(),
        };

        let mut handles: Vec<Box<dyn JoinHandle>> = Vec::with_capacity(self.benchmark.workers());
        let mut id = 0usize;
        let groups = self
            .benchmark
            .readers
            .iter()
            .enumerate()
            .map(|(g, d)| (Role::Reader, g, d))
            .chain(
                self.benchmark
                    .writers
                    .iter()
                    .enumerate()
                    .map(|(g, d)| (Role::Writer, g, d)),
            );
        let mut failure = None;
        'spawn: for (role, group, dist) in groups {
            for _ in 0..dist.count {
                let context = WorkerContext {
                    id,
                    role,
                    dist: *dist,
                    seed: worker_seed(self.benchmark.seed, role.seed_offset(), group, id),
                    catalog: self.catalog.clone(),
                    catalog_name: self.catalog_name.clone(),
                    targets: self.targets.clone(),
                    sink: self.sink.clone(),
                    limiter: self.limiter.clone(),
                    ctx: ctx.clone(),
                    signal: signal.clone(),
                };
                let name = format!("catbench-worker-{}", id);
                match self.thread.spawn(name, Box::new(move || bench_worker(context))) {
                    Ok(handle) => handles.push(handle),
                    Err(e) => {
                        failure = Some(e);
                        break 'spawn;
                    }
                }
                id += 1;
            }
        }

        if let Some(e) = failure {
            warn!("Failed to spawn worker {}, stopping the ones already running", id);
            // cancel first, so that released workers exit without issuing anything
            run.cancel();
            signal.release();
            while let Some(handle) = handles.pop() {
                handle.join();
            }
            return Err(e);
        }
        debug!("Spawned {} workers", id);

        while let Some(handle) = handles.pop() {
            handle.join();
        }
        debug!("All {} workers exited", id);
        Ok(id)
    }

    /// Nothing is created by this workload, so there is nothing to tear down.
    pub fn cleanup(&mut self, _ctx: &Context) -> Result<(), Error> {
        self.expect(JobState::Running)?;
        self.status
            .report("Cleanup: skipping (weighted benchmark does not delete data)");
        self.state = JobState::Cleaned;
        Ok(())
    }
}

struct WorkerContext {
    /// Global worker id, in spawn order
    id: usize,
    role: Role,
    dist: Distribution,
    seed: u64,
    catalog: Arc<dyn Catalog>,
    catalog_name: Arc<str>,
    targets: Arc<Vec<Target>>,
    sink: Sink,
    limiter: Option<Arc<dyn RateLimiter>>,
    ctx: Context,
    signal: StartSignal,
}

fn bench_worker(context: WorkerContext) {
    let WorkerContext {
        id,
        role,
        dist,
        seed,
        catalog,
        catalog_name,
        targets,
        sink,
        limiter,
        ctx,
        signal,
    } = context;

    let mut handle = catalog.handle();
    let mut sampler = WeightedSampler::new(&dist, seed);
    let op_type = role.op_type();
    let n = targets.len();
    let mut count = 0u64;

    // start at the same time as everyone else
    signal.wait();

    loop {
        if ctx.is_done() {
            break;
        }
        if let Some(ref limiter) = limiter {
            if limiter.acquire(&ctx) == Permit::Exhausted {
                break;
            }
        }

        let target = &targets[sampler.sample(n)];
        let patch = match role {
            Role::Reader => None,
            Role::Writer => Some(TablePatch::touch()),
        };

        let start = Instant::now();
        let result = match patch {
            None => handle.fetch(&ctx, &catalog_name, &target.namespace, &target.name),
            Some(ref patch) => {
                handle.mutate(&ctx, &catalog_name, &target.namespace, &target.name, patch)
            }
        };
        let end = Instant::now();

        let op = Operation {
            op_type,
            worker: id as u32,
            target: target.label(&catalog_name),
            objects: 1,
            endpoint: catalog_name.to_string(),
            start,
            end,
            error: result.err().map(|e| e.to_string()),
        };
        if !sink.send(op) {
            warn!("Worker {} lost its collector, stopping", id);
            break;
        }
        count += 1;
    }

    debug!(
        "Worker {} ({:?}) exited after {} operations, {} sampler fallbacks",
        id,
        role,
        count,
        sampler.exhausted()
    );
}

// }}} job

// {{{ bencher

/// Parse a full configuration (catalog, tree, global and phases) and open the catalog.
pub fn init(text: &str) -> Result<BenchmarkGroup, Error> {
    let opt: BenchmarkGroupOpt = Figment::new()
        .merge(Toml::string(text))
        .merge(Env::prefixed("CATBENCH_").split("__"))
        .extract()?;
    debug!(
        "Creating benchmark group with the following configurations: {:?}",
        opt
    );
    let global = opt.global.clone().unwrap_or_default();
    let phases = opt
        .benchmark
        .iter()
        .map(|o| {
            let mut o = o.clone();
            global.apply(&mut o);
            Benchmark::new(&o).map(Arc::new)
        })
        .collect::<Result<Vec<_>, _>>()?;
    let catalog = catalogs::open(&opt.catalog)?;
    Ok(BenchmarkGroup {
        catalog,
        tree: opt.tree.unwrap_or_default(),
        phases,
    })
}

impl BenchmarkGroup {
    /// Run all phases sequentially. Stops early if `ctx` is cancelled.
    pub fn run(&self, ctx: &Context) -> Result<Vec<Summary>, Error> {
        self.run_with(ctx, Arc::new(LogStatus))
    }

    pub fn run_with(
        &self,
        ctx: &Context,
        status: Arc<dyn StatusSink>,
    ) -> Result<Vec<Summary>, Error> {
        let mut summaries = Vec::with_capacity(self.phases.len());
        for (i, p) in self.phases.iter().enumerate() {
            if ctx.is_done() {
                info!("Interrupted, skipping the remaining {} phase(s)", self.phases.len() - i);
                break;
            }
            let summary = bench_phase(
                self.catalog.clone(),
                &self.tree,
                p.clone(),
                i,
                ctx,
                status.clone(),
            )?;
            summaries.push(summary);
        }
        Ok(summaries)
    }
}

fn bench_phase(
    catalog: Arc<dyn Catalog>,
    tree: &TreeOpt,
    benchmark: Arc<Benchmark>,
    phase: usize,
    ctx: &Context,
    status: Arc<dyn StatusSink>,
) -> Result<Summary, Error> {
    let collector = Collector::new(&CollectorOpt {
        capacity: benchmark.queue,
        interval: benchmark.report.interval().then_some(phase),
    });

    let mut job = BenchmarkJob::new(
        benchmark.clone(),
        catalog,
        &tree.catalog,
        Box::new(TableTree::new(tree)),
        collector.sink(),
    )
    .with_auto_term(collector.hook())
    .with_status(status);
    if let Some(throttle) = Throttle::new(benchmark.rps, benchmark.ops)? {
        job = job.with_limiter(Arc::new(throttle));
    }

    job.prepare(ctx)?;

    // the phase timeout covers the run only, not the connectivity check
    let ctx = match benchmark.timeout {
        Some(timeout) => ctx.with_timeout(timeout),
        None => ctx.with_cancel(),
    };
    let signal = StartSignal::new();
    let workers = benchmark.workers();
    let started = std::thread::scope(|s| {
        s.spawn(|| signal.release_when(workers));
        let result = job.start(&ctx, &signal);
        // unblocks the releaser if start bailed out before spawning
        signal.release();
        result
    })?;
    debug!("Phase {} finished with {} workers", phase, started);

    job.cleanup(&ctx)?;
    drop(job);

    let summary = collector.finish();
    if benchmark.report.finish() {
        summary.print_finish(phase);
    }
    Ok(summary)
}

// }}} bencher

// {{{ tests


// }}} tests
