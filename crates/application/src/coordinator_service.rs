//! Route resolution and per-target endpoint memoization.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tollgate_core::{AppError, AppResult};
use tollgate_domain::{EndpointCatalog, RouteTarget};
use tracing::{debug, info};
use url::Url;

use crate::admission_service::{AdmissionChain, CoordinatorConfig};
use crate::coordination_ports::{CoordinationStore, HttpTransport};

mod context;
mod endpoint;

#[cfg(test)]
mod tests;

pub use context::{InFlightGuard, RequestContext};
pub use endpoint::Endpoint;

/// Entry point for rate-limited requests from one worker process.
pub struct Coordinator {
    store: Arc<dyn CoordinationStore>,
    config: CoordinatorConfig,
    catalog: Option<EndpointCatalog>,
    endpoints: RwLock<HashMap<RouteTarget, Arc<Endpoint>>>,
    context: Arc<RequestContext>,
}

impl Coordinator {
    /// Creates a coordinator that groups uncatalogued URLs by their leading path segments.
    #[must_use]
    pub fn new(store: Arc<dyn CoordinationStore>, config: CoordinatorConfig) -> Self {
        Self {
            store,
            config,
            catalog: None,
            endpoints: RwLock::new(HashMap::new()),
            context: Arc::new(RequestContext::new()),
        }
    }

    /// Resolves URLs through `catalog` before falling back to the default grouping.
    #[must_use]
    pub fn with_catalog(mut self, catalog: EndpointCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Returns the context shared by every endpoint.
    #[must_use]
    pub fn context(&self) -> Arc<RequestContext> {
        self.context.clone()
    }

    /// Returns the number of endpoints created so far.
    pub async fn endpoint_count(&self) -> usize {
        self.endpoints.read().await.len()
    }

    /// Returns the endpoint serving `url`, creating it on first use.
    pub async fn resolve(&self, url: &Url) -> AppResult<Arc<Endpoint>> {
        let (target, operation) = match &self.catalog {
            Some(catalog) => catalog.resolve(url)?,
            None => (EndpointCatalog::resolve_uncatalogued(url)?, None),
        };

        if let Some(endpoint) = self.endpoints.read().await.get(&target) {
            return Ok(endpoint.clone());
        }

        let mut endpoints = self.endpoints.write().await;
        if let Some(endpoint) = endpoints.get(&target) {
            return Ok(endpoint.clone());
        }

        let chain = AdmissionChain::for_target(&target, self.store.clone(), &self.config)?;
        debug!(
            server = target.server(),
            group = target.group(),
            "created endpoint"
        );
        let endpoint = Arc::new(Endpoint::new(
            target.clone(),
            operation,
            chain,
            self.context.clone(),
        ));
        endpoints.insert(target, endpoint.clone());
        Ok(endpoint)
    }

    /// Resolves `url` and sends it through its endpoint.
    pub async fn request(&self, url: &Url, transport: &dyn HttpTransport) -> AppResult<Vec<u8>> {
        self.resolve(url).await?.request(url, transport).await
    }

    /// Builds the URL of a catalog operation on `server`.
    pub fn url_for(
        &self,
        server: &str,
        operation: &str,
        parameters: &[(&str, &str)],
    ) -> AppResult<Url> {
        self.catalog
            .as_ref()
            .ok_or_else(|| {
                AppError::Validation("coordinator has no endpoint catalog".to_owned())
            })?
            .url_for(server, operation, parameters)
    }

    /// Refuses new requests and waits for in-flight ones to finish realigning.
    pub async fn shutdown(&self) {
        info!(
            in_flight = self.context.in_flight(),
            "coordinator shutting down"
        );
        self.context.shutdown().await;
    }
}
