#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! A benchmark engine that drives skewed, reproducible, concurrent load against a table catalog
//! and measures every request.
//!
//! With `catbench`, you describe a benchmark in TOML: how many reader and writer workers to run,
//! where in the ordered table list each group of workers should concentrate its traffic, and how
//! the run should end (timeout, request quota, or automatic termination once throughput has
//! settled). Every request attempt becomes exactly one [`Operation`] that is funneled into a
//! collector for aggregation.
//!
//! A few key design choices include:
//!
//! - Every worker owns its random stream, seeded from the base seed plus its group and worker
//! offsets. Runs are reproducible and workers never contend on randomness.
//! - Workers are plain threads that park on a shared [`StartSignal`] until every one of them has
//! been spawned, so measurement starts at the same instant for all of them.
//! - Catalogs are black boxes behind the [`Catalog`] trait. They are created dynamically from a
//! TOML table and registered with [`inventory`], so new catalogs can be plugged in from other
//! crates without touching this one.
//!
//! More detailed usage could be found in the module-level rustdocs:
//!
//! - [`mod@bench`] for the config format of a benchmark.
//! - [`mod@catalogs`] for the config format of a built-in catalog.
//! - [`mod@tree`] for the config format of the table universe.
//! - [`cmdline()`] for the usage of the default command line interface.

use quanta::Instant;
use std::collections::BTreeMap;
use std::fmt;

/// A catalog that can be benchmarked.
///
/// This trait is used for owned catalogs, with which a per-worker handle can be created.
pub trait Catalog: Send + Sync + 'static {
    /// Create a handle that is exclusively used by one worker thread.
    fn handle(&self) -> Box<dyn CatalogHandle>;
}

/// A per-worker handle that references a [`Catalog`].
///
/// Both calls must return promptly with [`CatalogError::Cancelled`] when `ctx` is already done,
/// and should not outlive its deadline.
pub trait CatalogHandle: Send {
    /// Load a table's current metadata.
    fn fetch(
        &mut self,
        ctx: &Context,
        catalog: &str,
        namespace: &[String],
        name: &str,
    ) -> Result<TableRecord, CatalogError>;

    /// Apply a patch to a table and return the updated metadata.
    fn mutate(
        &mut self,
        ctx: &Context,
        catalog: &str,
        namespace: &[String],
        name: &str,
        patch: &TablePatch,
    ) -> Result<TableRecord, CatalogError>;
}

/// What the catalog returns for a table. Only the parts the benchmark cares about are kept.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TableRecord {
    pub metadata_location: Option<String>,
    pub properties: BTreeMap<String, String>,
}

/// A write-style change sent to a table.
#[derive(Clone, Debug, PartialEq)]
pub enum TablePatch {
    /// Add or overwrite table properties.
    SetProperties(BTreeMap<String, String>),
}

impl TablePatch {
    /// The patch issued by writer workers: stamp `last_updated` with the current unix millis.
    pub fn touch() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let mut updates = BTreeMap::new();
        updates.insert("last_updated".to_string(), now.to_string());
        Self::SetProperties(updates)
    }
}

/// A single table in the target universe.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct Target {
    pub namespace: Vec<String>,
    pub name: String,
}

impl Target {
    pub fn new(namespace: &[&str], name: &str) -> Self {
        Self {
            namespace: namespace.iter().map(|s| s.to_string()).collect(),
            name: name.to_string(),
        }
    }

    /// The identifier recorded on an [`Operation`]: `catalog/ns1.ns2/name`.
    pub fn label(&self, catalog: &str) -> String {
        format!("{}/{}/{}", catalog, self.namespace.join("."), self.name)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace.join("."), self.name)
    }
}

/// The source of the ordered table list that workers sample from.
///
/// Repeated calls to [`TargetProvider::all_targets`] must yield the same order.
pub trait TargetProvider {
    fn total_count(&self) -> usize;

    fn all_targets(&self) -> Vec<Target>;
}

impl TargetProvider for Vec<Target> {
    fn total_count(&self) -> usize {
        self.len()
    }

    fn all_targets(&self) -> Vec<Target> {
        self.clone()
    }
}

/// Fire-and-forget progress messages emitted while a job prepares and cleans up.
pub trait StatusSink {
    fn report(&self, message: &str);
}

/// A [`StatusSink`] that forwards every message to the `info` log level.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogStatus;

impl StatusSink for LogStatus {
    fn report(&self, message: &str) {
        log::info!("{}", message);
    }
}

/// The kind of request an [`Operation`] measured.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub enum OpType {
    /// A read-style fetch of a table.
    TableGet,
    /// A write-style property update of a table.
    TableUpdate,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::TableGet => "TABLE_GET",
            OpType::TableUpdate => "TABLE_UPDATE",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One completed (or failed) request attempt.
///
/// Created by exactly one worker, sent once into the collector, never changed afterwards.
#[derive(Clone, Debug)]
pub struct Operation {
    pub op_type: OpType,
    /// The worker that issued the request.
    pub worker: u32,
    /// See [`Target::label`].
    pub target: String,
    pub objects: u32,
    pub endpoint: String,
    pub start: Instant,
    pub end: Instant,
    /// Set iff the request failed.
    pub error: Option<String>,
}

impl Operation {
    pub fn duration(&self) -> std::time::Duration {
        self.end.duration_since(self.start)
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

pub mod autoterm;
pub mod bench;
pub mod catalogs;
mod cmdline;
pub mod collector;
pub mod context;
mod error;
pub mod limiter;
pub mod sampler;
pub mod signal;
pub mod thread;
pub mod tree;

pub use cmdline::cmdline;
pub use context::Context;
pub use error::{CatalogError, Error};
pub use signal::StartSignal;

pub extern crate inventory;
pub extern crate toml;
