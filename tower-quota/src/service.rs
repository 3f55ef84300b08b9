use std::future::Future;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use http::HeaderValue;
use tower::BoxError;
use tower::Service;
use tower::ServiceExt;

use quota_queue::Endpoint;
use quota_queue::Priority;

use crate::AdmissionHandle;
use crate::AdmitError;
use crate::Catalog;
use crate::RequestMode;
use crate::ResolveError;
use crate::metrics::ResponseMetrics;
use crate::report;

/// A request already mapped onto its endpoint and priority class.
#[derive(Debug, Clone)]
pub struct Routed<R> {
    pub request: R,
    pub endpoint: Endpoint,
    /// The concrete method path, without a leading slash.
    pub method: String,
    pub priority: Priority,
}

impl<B> Routed<http::Request<B>> {
    /// Resolves an inbound HTTP request against `catalog`, reading its priority from
    /// the `X-Priority` header.
    pub fn from_request(
        catalog: &Catalog,
        mode: RequestMode,
        request: http::Request<B>,
    ) -> Result<Self, ResolveError> {
        let host = request
            .headers()
            .get(http::header::HOST)
            .and_then(|host| host.to_str().ok())
            .or_else(|| request.uri().host());
        let resolved = catalog.resolve(mode, host, request.uri().path())?;

        let priority = Priority::from_header(
            request
                .headers()
                .get(report::PRIORITY)
                .and_then(|value| value.to_str().ok()),
        );

        Ok(Self {
            request,
            endpoint: resolved.endpoint,
            method: resolved.method,
            priority,
        })
    }
}

/// What the upstream executor receives once a credential was granted.
#[derive(Debug, Clone)]
pub struct Dispatch<R> {
    pub request: R,
    pub endpoint: Endpoint,
    pub method: String,
    /// Zero-based index of the credential to send the request with.
    pub credential: usize,
}

/// Admits each request through the controller before handing it to the upstream executor.
///
/// Requests wait in their endpoint's queue rather than in `poll_ready`, so this service
/// is always ready.
#[derive(Clone, Debug)]
pub struct AdmissionService<S> {
    inner: S,
    handle: AdmissionHandle,
    refund_on_failure: bool,
    metrics: ResponseMetrics,
}

impl<S> AdmissionService<S> {
    pub fn new(inner: S, handle: AdmissionHandle) -> Self {
        Self {
            inner,
            refund_on_failure: handle.refund_on_failure(),
            handle,
            metrics: ResponseMetrics::new(),
        }
    }

    /// Give a call's quota back when the upstream fails or answers with a `5xx`.
    pub fn with_refund_on_failure(mut self, refund_on_failure: bool) -> Self {
        self.refund_on_failure = refund_on_failure;
        self
    }
}

impl<S, R, B> Service<Routed<R>> for AdmissionService<S>
where
    S: Service<Dispatch<R>, Response = http::Response<B>> + Clone + Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send,
    R: Send + 'static,
    B: Send + 'static,
{
    type Response = http::Response<B>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, routed: Routed<R>) -> Self::Future {
        let inner = self.inner.clone();
        let handle = self.handle.clone();
        let metrics = self.metrics.clone();
        let refund_on_failure = self.refund_on_failure;

        Box::pin(async move {
            let Routed {
                request,
                endpoint,
                method,
                priority,
            } = routed;

            let grant = match handle.acquire(&endpoint, priority).await {
                Ok(grant) => grant,
                Err(error) => {
                    metrics.record_rejection(&endpoint, &error);
                    return Err(Box::new(error) as BoxError);
                }
            };
            let credential = grant.credential;

            let dispatch = Dispatch {
                request,
                endpoint: endpoint.clone(),
                method,
                credential,
            };
            let result = inner.oneshot(dispatch).await.map_err(Into::<BoxError>::into);
            let mut response = match result {
                Ok(response) => response,
                Err(error) => {
                    metrics.record(Some(credential), &endpoint, 500);
                    if refund_on_failure {
                        refund(&handle, &endpoint, credential).await;
                    }
                    return Err(Box::new(AdmitError::Upstream(error.to_string())) as BoxError);
                }
            };

            let status = response.status();
            metrics.record(Some(credential), &endpoint, status.as_u16());

            if report::should_report(status, grant.refresh) {
                match report::upstream_report(status, response.headers(), handle.clock().now()) {
                    Ok(quota) => {
                        if let Err(error) = handle.report(&endpoint.id, credential, quota).await {
                            tracing::debug!(endpoint = %endpoint.id, %error, "report not delivered");
                        }
                    }
                    Err(error) => {
                        tracing::warn!(endpoint = %endpoint.id, credential, %error, "malformed quota report");
                    }
                }
            }

            if refund_on_failure && status.is_server_error() {
                refund(&handle, &endpoint, credential).await;
            }

            response
                .headers_mut()
                .insert(report::KEY, HeaderValue::from(credential + 1));
            Ok(response)
        })
    }
}

async fn refund(handle: &AdmissionHandle, endpoint: &Endpoint, credential: usize) {
    if let Err(error) = handle.refund(&endpoint.id, credential).await {
        tracing::debug!(endpoint = %endpoint.id, %error, "refund not delivered");
    }
}
