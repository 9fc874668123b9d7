//! The table universe: an N-ary namespace tree with a fixed number of tables per leaf.
//!
//! ## Configuration Format
//!
//! ``` toml
//! [tree]
//! catalog = "benchmark_catalog" # catalog (warehouse) name used in every request
//! namespace_width = 2           # children per namespace
//! namespace_depth = 3           # levels of namespaces; leaves are at this depth
//! tables_per_ns = 5             # tables in every leaf namespace
//! ```
//!
//! Namespaces are named after their path: the second child of `ns_1` is `ns_1_1`. Tables are
//! named `table_0`, `table_1`, and so on. Enumeration is depth-first and always yields the same
//! order, so a sampled index refers to the same table for the whole run.

use crate::{Target, TargetProvider};
use serde::Deserialize;

fn default_catalog() -> String {
    "benchmark_catalog".to_string()
}

fn default_width() -> usize {
    2
}

fn default_depth() -> usize {
    3
}

fn default_tables() -> usize {
    5
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct TreeOpt {
    #[serde(default = "default_catalog")]
    pub catalog: String,
    #[serde(default = "default_width")]
    pub namespace_width: usize,
    #[serde(default = "default_depth")]
    pub namespace_depth: usize,
    #[serde(default = "default_tables")]
    pub tables_per_ns: usize,
}

impl Default for TreeOpt {
    fn default() -> Self {
        Self {
            catalog: default_catalog(),
            namespace_width: default_width(),
            namespace_depth: default_depth(),
            tables_per_ns: default_tables(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TableTree {
    opt: TreeOpt,
}

impl TableTree {
    pub fn new(opt: &TreeOpt) -> Self {
        Self { opt: opt.clone() }
    }

    pub fn catalog(&self) -> &str {
        &self.opt.catalog
    }

    fn leaves(&self) -> usize {
        let depth = u32::try_from(self.opt.namespace_depth).unwrap_or(u32::MAX);
        self.opt.namespace_width.saturating_pow(depth)
    }

    fn walk(&self, path: &mut Vec<String>, out: &mut Vec<Target>) {
        if path.len() == self.opt.namespace_depth {
            for t in 0..self.opt.tables_per_ns {
                out.push(Target {
                    namespace: path.clone(),
                    name: format!("table_{}", t),
                });
            }
            return;
        }
        for child in 0..self.opt.namespace_width {
            let name = match path.last() {
                Some(parent) => format!("{}_{}", parent, child),
                None => format!("ns_{}", child),
            };
            path.push(name);
            self.walk(path, out);
            path.pop();
        }
    }
}

impl TargetProvider for TableTree {
    fn total_count(&self) -> usize {
        if self.opt.namespace_depth == 0 {
            return 0;
        }
        self.leaves().saturating_mul(self.opt.tables_per_ns)
    }

    fn all_targets(&self) -> Vec<Target> {
        let mut out = Vec::with_capacity(self.total_count());
        if self.opt.namespace_depth > 0 {
            self.walk(&mut Vec::with_capacity(self.opt.namespace_depth), &mut out);
        }
        out
    }
}
