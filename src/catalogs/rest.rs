//! A remote catalog speaking the Iceberg REST protocol, using [`reqwest`]'s blocking client.
//!
//! ## Configuration Format
//!
//! ``` toml
//! [catalog]
//! name = "rest"
//! uri = "http://localhost:8181" # catalog service endpoint
//! prefix = "/v1"                # API path prefix (optional)
//! token = "..."                 # bearer token (optional)
//! timeout = 30.0                # per-request timeout in seconds (optional)
//! ```
//!
//! Reads are `GET {uri}{prefix}/{catalog}/namespaces/{namespace}/tables/{name}`, and writes are a
//! `POST` to the same path with a table commit that carries the patch. Multi-level namespaces are
//! joined with the unit separator (`0x1F`). Requests never outlive the deadline of the context
//! they are issued under.

use crate::catalogs::{parse_opt, Registry};
use crate::context::seconds;
use crate::*;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn default_prefix() -> String {
    "/v1".to_string()
}

fn default_timeout() -> f32 {
    30.0
}

#[derive(Deserialize, Clone, Debug)]
pub struct RestCatalogOpt {
    pub uri: String,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    pub token: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout: f32,
}

#[derive(Clone, Debug)]
pub struct RestCatalog {
    client: Client,
    base: Url,
    token: Option<String>,
    timeout: Duration,
}

impl RestCatalog {
    pub fn new(opt: &RestCatalogOpt) -> Result<Self, Error> {
        if !(opt.timeout.is_finite() && opt.timeout > 0.0) {
            return Err(Error::config("rest catalog timeout should be positive"));
        }
        let timeout = seconds("rest catalog timeout", opt.timeout)?;
        let base = format!("{}{}", opt.uri.trim_end_matches('/'), opt.prefix);
        let base = Url::parse(&base)
            .map_err(|e| Error::config(format!("invalid catalog uri {}: {}", base, e)))?;
        if base.cannot_be_a_base() {
            return Err(Error::config(format!("invalid catalog uri {}", base)));
        }
        let client = Client::builder()
            .build()
            .map_err(|e| Error::config(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            client,
            base,
            token: opt.token.clone(),
            timeout,
        })
    }

    pub fn new_catalog(opt: &toml::Table) -> Result<Arc<dyn Catalog>, Error> {
        let opt: RestCatalogOpt = parse_opt(opt)?;
        Ok(Arc::new(Self::new(&opt)?))
    }

    fn table_url(&self, catalog: &str, namespace: &[String], name: &str) -> Url {
        let mut url = self.base.clone();
        let namespace = namespace.join("\u{1f}");
        // checked in the constructor
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(&[catalog, "namespaces", namespace.as_str(), "tables", name]);
        }
        url
    }

    fn execute(&self, ctx: &Context, request: RequestBuilder) -> Result<TableRecord, CatalogError> {
        if ctx.is_done() {
            return Err(CatalogError::Cancelled);
        }
        let timeout = match ctx.remaining() {
            Some(left) if left.is_zero() => return Err(CatalogError::Cancelled),
            Some(left) => left.min(self.timeout),
            None => self.timeout,
        };
        let mut request = request.timeout(timeout);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .map_err(|e| CatalogError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(CatalogError::Rejected {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }
        let result: LoadTableResult = response
            .json()
            .map_err(|e| CatalogError::Transport(format!("invalid response body: {}", e)))?;
        Ok(result.into())
    }
}

impl Catalog for RestCatalog {
    fn handle(&self) -> Box<dyn CatalogHandle> {
        Box::new(self.clone())
    }
}

impl CatalogHandle for RestCatalog {
    fn fetch(
        &mut self,
        ctx: &Context,
        catalog: &str,
        namespace: &[String],
        name: &str,
    ) -> Result<TableRecord, CatalogError> {
        let url = self.table_url(catalog, namespace, name);
        self.execute(ctx, self.client.get(url))
    }

    fn mutate(
        &mut self,
        ctx: &Context,
        catalog: &str,
        namespace: &[String],
        name: &str,
        patch: &TablePatch,
    ) -> Result<TableRecord, CatalogError> {
        let url = self.table_url(catalog, namespace, name);
        let commit = CommitTableRequest::from(patch);
        self.execute(ctx, self.client.post(url).json(&commit))
    }
}

inventory::submit! {
    Registry::new("rest", RestCatalog::new_catalog)
}

// {{{ wire

#[derive(Serialize)]
struct CommitTableRequest<'a> {
    requirements: Vec<serde_json::Value>,
    updates: Vec<TableUpdate<'a>>,
}

#[derive(Serialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
enum TableUpdate<'a> {
    SetProperties {
        updates: &'a BTreeMap<String, String>,
    },
}

impl<'a> From<&'a TablePatch> for CommitTableRequest<'a> {
    fn from(patch: &'a TablePatch) -> Self {
        let update = match patch {
            TablePatch::SetProperties(updates) => TableUpdate::SetProperties { updates },
        };
        Self {
            requirements: Vec::new(),
            updates: vec![update],
        }
    }
}

#[derive(Deserialize)]
struct LoadTableResult {
    #[serde(rename = "metadata-location")]
    metadata_location: Option<String>,
    #[serde(default)]
    metadata: TableMetadata,
}

#[derive(Deserialize, Default)]
struct TableMetadata {
    #[serde(default)]
    properties: BTreeMap<String, String>,
}

impl From<LoadTableResult> for TableRecord {
    fn from(result: LoadTableResult) -> Self {
        Self {
            metadata_location: result.metadata_location,
            properties: result.metadata.properties,
        }
    }
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorModel,
}

#[derive(Deserialize)]
struct ErrorModel {
    message: String,
}

/// The message of a catalog error response, or the raw body if it is not one.
fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(response) => response.error.message,
        Err(_) => body.trim().to_string(),
    }
}

// }}} wire
