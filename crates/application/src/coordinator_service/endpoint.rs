use std::sync::Arc;

use chrono::Utc;
use tollgate_core::{AppError, AppResult, RetryDirective};
use tollgate_domain::{OperationSpec, RouteTarget};
use tracing::debug;
use url::Url;

use crate::admission_service::AdmissionChain;
use crate::coordination_ports::HttpTransport;

use super::context::RequestContext;

/// Admission chain of one (server, endpoint-group) pair.
///
/// Created once per route target and reused for the lifetime of the coordinator,
/// so cached limits persist across requests.
pub struct Endpoint {
    target: RouteTarget,
    operation: Option<OperationSpec>,
    chain: AdmissionChain,
    context: Arc<RequestContext>,
}

impl Endpoint {
    /// Creates an endpoint.
    #[must_use]
    pub fn new(
        target: RouteTarget,
        operation: Option<OperationSpec>,
        chain: AdmissionChain,
        context: Arc<RequestContext>,
    ) -> Self {
        Self {
            target,
            operation,
            chain,
            context,
        }
    }

    /// Returns the route target.
    #[must_use]
    pub fn target(&self) -> &RouteTarget {
        &self.target
    }

    /// Returns the catalog operation, when the endpoint was resolved through one.
    #[must_use]
    pub fn operation(&self) -> Option<&OperationSpec> {
        self.operation.as_ref()
    }

    /// Returns the admission chain.
    #[must_use]
    pub fn chain(&self) -> &AdmissionChain {
        &self.chain
    }

    /// Sends one request through the admission chain and returns the response body.
    pub async fn request(&self, url: &Url, transport: &dyn HttpTransport) -> AppResult<Vec<u8>> {
        let _in_flight = self.context.enter()?;
        let now = Utc::now();
        self.context.check_resume(now).await?;

        let result = self
            .chain
            .execute(url, transport, self.operation.as_ref(), now.timestamp_millis())
            .await;

        if let Err(AppError::RemoteThrottled {
            retry: RetryDirective::At(resume_at),
        }) = &result
        {
            debug!(
                server = self.target.server(),
                group = self.target.group(),
                resume_at = %resume_at,
                "provider demanded an absolute resume time"
            );
            self.context.resume_not_before(*resume_at).await;
        }

        result
    }
}
