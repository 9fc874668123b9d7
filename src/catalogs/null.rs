//! A catalog that does nothing.
//!
//! ## Configuration Format
//!
//! ``` toml
//! [catalog]
//! name = "null"
//! ```

use crate::catalogs::Registry;
use crate::*;
use std::sync::Arc;

/// NullCatalog answers every request with an empty record. It can be used to measure the
/// overhead of the engine itself.
#[derive(Clone, Debug, Default)]
pub struct NullCatalog;

impl NullCatalog {
    pub fn new() -> Self {
        Self
    }

    pub fn new_catalog(_opt: &toml::Table) -> Result<Arc<dyn Catalog>, Error> {
        Ok(Arc::new(Self::new()))
    }
}

impl Catalog for NullCatalog {
    fn handle(&self) -> Box<dyn CatalogHandle> {
        Box::new(self.clone())
    }
}

impl CatalogHandle for NullCatalog {
    fn fetch(
        &mut self,
        ctx: &Context,
        _catalog: &str,
        _namespace: &[String],
        _name: &str,
    ) -> Result<TableRecord, CatalogError> {
        if ctx.is_done() {
            return Err(CatalogError::Cancelled);
        }
        Ok(TableRecord::default())
    }

    fn mutate(
        &mut self,
        ctx: &Context,
        _catalog: &str,
        _namespace: &[String],
        _name: &str,
        _patch: &TablePatch,
    ) -> Result<TableRecord, CatalogError> {
        if ctx.is_done() {
            return Err(CatalogError::Cancelled);
        }
        Ok(TableRecord::default())
    }
}

inventory::submit! {
    Registry::new("null", NullCatalog::new_catalog)
}
