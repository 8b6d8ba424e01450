use std::sync::Arc;

use tokio::time::Instant;
use tollgate_core::AppResult;
use tollgate_domain::{OperationSpec, RouteTarget, ScopeKey};
use tracing::warn;
use url::Url;

use crate::coordination_ports::{CoordinationStore, HttpTransport};

use super::classify::{classify, retry_at_ms, throttle_directive};
use super::{Admission, CoordinatorConfig, LayerOrder, RateLimitHeaders, ScopeLayer};

/// Ordered scope layers wrapped around one transport call.
///
/// Layers admit in order and realign in reverse order, so the first layer is the
/// last to see the response.
pub struct AdmissionChain {
    layers: Vec<ScopeLayer>,
}

impl AdmissionChain {
    /// Creates a chain from explicit layers.
    #[must_use]
    pub fn new(layers: Vec<ScopeLayer>) -> Self {
        Self { layers }
    }

    /// Builds the server and endpoint-group layers of one route target.
    pub fn for_target(
        target: &RouteTarget,
        store: Arc<dyn CoordinationStore>,
        config: &CoordinatorConfig,
    ) -> AppResult<Self> {
        let layer = |key: ScopeKey, headers: RateLimitHeaders| {
            ScopeLayer::new(
                key,
                headers,
                store.clone(),
                config.safety_margin,
                config.bootstrap_span_seconds,
                config.bootstrap_retry,
            )
        };

        let server = layer(
            ScopeKey::server(config.namespace.as_str(), target.server())?,
            config.server_headers.clone(),
        );
        let group = layer(
            ScopeKey::group(config.namespace.as_str(), target.server(), target.group())?,
            config.group_headers.clone(),
        );

        let layers = match config.layer_order {
            LayerOrder::ServerFirst => vec![server, group],
            LayerOrder::GroupFirst => vec![group, server],
        };
        Ok(Self::new(layers))
    }

    /// Returns the layers in admission order.
    #[must_use]
    pub fn layers(&self) -> &[ScopeLayer] {
        self.layers.as_slice()
    }

    /// Admits, sends and realigns one request, then classifies the response.
    ///
    /// `now_ms` is the epoch-ms at which the request is admitted. Realignment and
    /// relative retry delays are anchored at the time the response arrived, measured
    /// from `now_ms` on the monotonic clock.
    ///
    /// A blocked layer stops the request before the transport is called, and any
    /// bootstrap probe won by an earlier layer is released. Once a response arrives
    /// every layer realigns, even for failure statuses; realignment errors are logged
    /// and never replace the response outcome.
    pub async fn execute(
        &self,
        url: &Url,
        transport: &dyn HttpTransport,
        operation: Option<&OperationSpec>,
        now_ms: i64,
    ) -> AppResult<Vec<u8>> {
        let started = Instant::now();
        let mut probes = Vec::new();
        for layer in &self.layers {
            match layer.admit(now_ms).await {
                Ok(Admission::Permitted) => {}
                Ok(Admission::Probe) => probes.push(layer),
                Err(error) => {
                    abandon_probes(probes.as_slice()).await;
                    return Err(error);
                }
            }
        }

        let response = match transport.get(url).await {
            Ok(response) => response,
            Err(error) => {
                abandon_probes(probes.as_slice()).await;
                return Err(error);
            }
        };
        let received_ms = now_ms
            .saturating_add(i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX));

        let throttle = throttle_directive(&response);
        let retry_at = throttle
            .as_ref()
            .map(|directive| retry_at_ms(directive, received_ms));
        for layer in self.layers.iter().rev() {
            if let Err(error) = layer.realign(&response, received_ms, retry_at).await {
                warn!(
                    scope = %layer.key(),
                    status = response.status(),
                    error = %error,
                    "failed to realign scope ledger"
                );
            }
        }

        classify(response, operation, throttle)
    }
}

async fn abandon_probes(probes: &[&ScopeLayer]) {
    for layer in probes {
        if let Err(error) = layer.abandon_probe().await {
            warn!(
                scope = %layer.key(),
                error = %error,
                "failed to release bootstrap placeholder"
            );
        }
    }
}
