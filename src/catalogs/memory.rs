//! An in-process catalog backed by a [`hashbrown::HashMap`] behind a [`RwLock`].
//!
//! ## Configuration Format
//!
//! ``` toml
//! [catalog]
//! name = "memory"
//! latency_us = 0    # simulated service time of every request, in microseconds (optional)
//! strict = false    # reject unknown tables with 404 instead of creating them (optional)
//! ```
//!
//! Every table starts out empty. Each update merges the patched properties and bumps the table's
//! metadata version, which shows up in its metadata location.

use crate::catalogs::{parse_opt, Registry};
use crate::*;
use hashbrown::HashMap;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Deserialize, Clone, Debug, Default)]
pub struct MemoryCatalogOpt {
    #[serde(default)]
    pub latency_us: u64,
    #[serde(default)]
    pub strict: bool,
}

struct TableState {
    version: u64,
    properties: BTreeMap<String, String>,
}

impl TableState {
    fn new() -> Self {
        Self {
            version: 0,
            properties: BTreeMap::new(),
        }
    }

    fn record(&self, key: &str) -> TableRecord {
        TableRecord {
            metadata_location: Some(format!(
                "memory://{}/metadata/v{}.metadata.json",
                key, self.version
            )),
            properties: self.properties.clone(),
        }
    }
}

#[derive(Clone)]
pub struct MemoryCatalog {
    tables: Arc<RwLock<HashMap<String, TableState>>>,
    latency: Duration,
    strict: bool,
    fetches: Arc<AtomicU64>,
    mutations: Arc<AtomicU64>,
}

impl MemoryCatalog {
    pub fn new(opt: &MemoryCatalogOpt) -> Self {
        Self {
            tables: Arc::new(RwLock::new(HashMap::new())),
            latency: Duration::from_micros(opt.latency_us),
            strict: opt.strict,
            fetches: Arc::new(AtomicU64::new(0)),
            mutations: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn new_catalog(opt: &toml::Table) -> Result<Arc<dyn Catalog>, Error> {
        let opt: MemoryCatalogOpt = parse_opt(opt)?;
        Ok(Arc::new(Self::new(&opt)))
    }

    /// Create a table up front, so that it is known even to a strict catalog.
    pub fn create(&self, catalog: &str, target: &Target) {
        self.tables
            .write()
            .entry(key(catalog, &target.namespace, &target.name))
            .or_insert_with(TableState::new);
    }

    pub fn len(&self) -> usize {
        self.tables.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of (fetch, mutate) calls served so far.
    pub fn calls(&self) -> (u64, u64) {
        (
            self.fetches.load(Ordering::Relaxed),
            self.mutations.load(Ordering::Relaxed),
        )
    }

    /// Simulate service time. Fails if the context ends first.
    fn serve(&self, ctx: &Context) -> Result<(), CatalogError> {
        if ctx.is_done() {
            return Err(CatalogError::Cancelled);
        }
        if !self.latency.is_zero() && !ctx.sleep(self.latency) {
            return Err(CatalogError::Cancelled);
        }
        Ok(())
    }

    fn not_found(key: &str) -> CatalogError {
        CatalogError::Rejected {
            status: 404,
            message: format!("table {} does not exist", key),
        }
    }
}

fn key(catalog: &str, namespace: &[String], name: &str) -> String {
    format!("{}/{}/{}", catalog, namespace.join("\u{1f}"), name)
}

impl Catalog for MemoryCatalog {
    fn handle(&self) -> Box<dyn CatalogHandle> {
        Box::new(self.clone())
    }
}

impl CatalogHandle for MemoryCatalog {
    fn fetch(
        &mut self,
        ctx: &Context,
        catalog: &str,
        namespace: &[String],
        name: &str,
    ) -> Result<TableRecord, CatalogError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        self.serve(ctx)?;
        let key = key(catalog, namespace, name);
        if let Some(table) = self.tables.read().get(&key) {
            return Ok(table.record(&key));
        }
        if self.strict {
            return Err(Self::not_found(&key));
        }
        let mut tables = self.tables.write();
        let table = tables.entry(key.clone()).or_insert_with(TableState::new);
        Ok(table.record(&key))
    }

    fn mutate(
        &mut self,
        ctx: &Context,
        catalog: &str,
        namespace: &[String],
        name: &str,
        patch: &TablePatch,
    ) -> Result<TableRecord, CatalogError> {
        self.mutations.fetch_add(1, Ordering::Relaxed);
        self.serve(ctx)?;
        let key = key(catalog, namespace, name);
        let mut tables = self.tables.write();
        if self.strict && !tables.contains_key(&key) {
            return Err(Self::not_found(&key));
        }
        let table = tables.entry(key.clone()).or_insert_with(TableState::new);
        match patch {
            TablePatch::SetProperties(updates) => {
                for (k, v) in updates.iter() {
                    table.properties.insert(k.clone(), v.clone());
                }
            }
        }
        table.version += 1;
        Ok(table.record(&key))
    }
}

inventory::submit! {
    Registry::new("memory", MemoryCatalog::new_catalog)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn autocreate_and_update() {
        let catalog = MemoryCatalog::new(&MemoryCatalogOpt::default());
        let mut handle = catalog.handle();
        let ctx = Context::background();
        let ns = ns(&["a", "b"]);

        let record = handle.fetch(&ctx, "c", &ns, "t").unwrap();
        assert!(record.properties.is_empty());
        assert_eq!(
            record.metadata_location.as_deref(),
            Some("memory://c/a\u{1f}b/t/metadata/v0.metadata.json")
        );
        assert_eq!(catalog.len(), 1);

        let mut updates = BTreeMap::new();
        updates.insert("owner".to_string(), "me".to_string());
        let record = handle
            .mutate(&ctx, "c", &ns, "t", &TablePatch::SetProperties(updates))
            .unwrap();
        assert_eq!(record.properties["owner"], "me");
        assert!(record.metadata_location.unwrap().ends_with("v1.metadata.json"));

        let record = handle
            .mutate(&ctx, "c", &ns, "t", &TablePatch::touch())
            .unwrap();
        assert_eq!(record.properties.len(), 2);
        assert!(record.properties["last_updated"].parse::<u128>().is_ok());

        assert_eq!(handle.fetch(&ctx, "c", &ns, "t").unwrap(), record);
        assert_eq!(catalog.calls(), (2, 2));
    }

    #[test]
    fn strict_rejects_unknown() {
        let catalog = MemoryCatalog::new(&MemoryCatalogOpt {
            strict: true,
            ..Default::default()
        });
        let mut handle = catalog.handle();
        let ctx = Context::background();
        let known = Target::new(&["ns"], "known");
        catalog.create("c", &known);

        assert!(handle.fetch(&ctx, "c", &known.namespace, "known").is_ok());
        match handle.fetch(&ctx, "c", &known.namespace, "unknown") {
            Err(CatalogError::Rejected { status, .. }) => assert_eq!(status, 404),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(matches!(
            handle.mutate(&ctx, "c", &known.namespace, "unknown", &TablePatch::touch()),
            Err(CatalogError::Rejected { status: 404, .. })
        ));
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn latency_respects_cancellation() {
        let catalog = MemoryCatalog::new(&MemoryCatalogOpt {
            latency_us: 10_000_000,
            ..Default::default()
        });
        let mut handle = catalog.handle();
        let ctx = Context::background().with_timeout(Duration::from_millis(30));
        let start = std::time::Instant::now();
        assert_eq!(
            handle.fetch(&ctx, "c", &ns(&["ns"]), "t"),
            Err(CatalogError::Cancelled)
        );
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(catalog.is_empty());
    }

    #[test]
    fn handles_share_state() {
        let catalog = MemoryCatalog::new(&MemoryCatalogOpt::default());
        let ctx = Context::background();
        let n = ns(&["ns"]);
        std::thread::scope(|s| {
            for _ in 0..4 {
                let mut handle = catalog.handle();
                let (ctx, n) = (&ctx, &n);
                s.spawn(move || {
                    for _ in 0..100 {
                        handle.mutate(ctx, "c", n, "t", &TablePatch::touch()).unwrap();
                    }
                });
            }
        });
        let record = catalog.handle().fetch(&ctx, "c", &n, "t").unwrap();
        assert!(record
            .metadata_location
            .unwrap()
            .ends_with("v400.metadata.json"));
    }
}
