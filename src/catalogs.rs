//! Adapters for built-in and external table catalogs.
//!
//! ## Configuration Format
//!
//! The catalog is selected by the `[catalog]` section of the configuration. `name` picks the
//! registered adapter, and every other key is handed to that adapter's constructor:
//!
//! ``` toml
//! [catalog]
//! name = "rest"
//! uri = "http://localhost:8181"
//! ```
//!
//! ## Built-in Catalogs
//!
//! - [`null`]: answers every request with an empty record. Measures the engine's own overhead.
//! - [`memory`]: an in-process catalog that keeps tables in memory.
//! - [`rest`]: a remote catalog speaking the Iceberg REST protocol over HTTP.
//!
//! ## Registering New Catalogs
//!
//! When users would like to dynamically register new catalogs from their own crate, first of all,
//! they need to implement the corresponding [`Catalog`]/[`CatalogHandle`] for it. Then, they need
//! to create a constructor function with a signature of
//! `fn(&toml::Table) -> Result<Arc<dyn Catalog>, Error>`.
//!
//! The final step is to register the catalog's constructor (along with its name) using
//! [`inventory`]. A minimal example would be: `inventory::submit! { Registry::new("name",
//! constructor_fn) };`.

use crate::*;
use hashbrown::HashMap;
use log::debug;
use serde::Deserialize;
use std::sync::Arc;
use toml::Table;

/// The signature of a catalog constructor.
pub type Constructor = fn(&Table) -> Result<Arc<dyn Catalog>, Error>;

/// The centralized registry that maps the name of a catalog adapter to its constructor function.
///
/// A user-defined catalog can use the [`inventory::submit!`] macro to register itself to be used
/// in the benchmark framework.
pub struct Registry<'a> {
    pub(crate) name: &'a str,
    constructor: Constructor,
}

impl<'a> Registry<'a> {
    pub const fn new(name: &'a str, constructor: Constructor) -> Self {
        Self { name, constructor }
    }
}

inventory::collect!(Registry<'static>);

/// The `[catalog]` section: the adapter name plus its own options.
#[derive(Deserialize, Clone, Debug)]
pub(crate) struct CatalogOpt {
    name: String,
    #[serde(flatten)]
    opt: Table,
}

/// Names of all registered catalogs, sorted.
pub fn registered() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = inventory::iter::<Registry>
        .into_iter()
        .map(|r| r.name)
        .collect();
    names.sort_unstable();
    names
}

pub(crate) fn open(opt: &CatalogOpt) -> Result<Arc<dyn Catalog>, Error> {
    // construct the lookup table.. this will be done every time
    let mut registered: HashMap<&'static str, Constructor> = HashMap::new();
    for r in inventory::iter::<Registry> {
        debug!("Adding supported catalog: {}", r.name);
        if registered.insert(r.name, r.constructor).is_some() {
            return Err(Error::config(format!(
                "catalog {} is registered more than once",
                r.name
            )));
        }
    }
    let f = registered
        .get(opt.name.as_str())
        .ok_or_else(|| Error::UnknownCatalog(opt.name.clone()))?;
    f(&opt.opt)
}

/// Deserialize an adapter's options out of the `[catalog]` table.
pub(crate) fn parse_opt<T: serde::de::DeserializeOwned>(opt: &Table) -> Result<T, Error> {
    opt.clone()
        .try_into()
        .map_err(|e: toml::de::Error| Error::config(format!("invalid catalog options: {}", e)))
}

pub mod memory;
pub mod null;
pub mod rest;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        assert_eq!(registered(), vec!["memory", "null", "rest"]);
    }

    #[test]
    fn open_by_name() {
        let opt: CatalogOpt = toml::from_str("name = \"memory\"\nlatency_us = 0").unwrap();
        let catalog = open(&opt).unwrap();
        let mut handle = catalog.handle();
        let record = handle
            .fetch(&Context::background(), "c", &["ns".to_string()], "t")
            .unwrap();
        assert!(record.metadata_location.is_some());
    }

    #[test]
    fn unknown_name() {
        let opt: CatalogOpt = toml::from_str("name = \"hive\"").unwrap();
        assert!(matches!(open(&opt), Err(Error::UnknownCatalog(n)) if n == "hive"));
    }

    #[test]
    fn bad_options() {
        let opt: CatalogOpt = toml::from_str("name = \"memory\"\nlatency_us = \"slow\"").unwrap();
        assert!(matches!(open(&opt), Err(Error::Config(_))));
    }
}
