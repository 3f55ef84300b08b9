use tower::Layer;

use crate::AdmissionHandle;
use crate::service::AdmissionService;

/// Admits requests through a running [`AdmissionHandle`].
#[derive(Clone, Debug)]
pub struct AdmissionLayer {
    handle: AdmissionHandle,
    refund_on_failure: bool,
}

impl AdmissionLayer {
    /// Create an AdmissionLayer. Refunds follow the handle's configuration.
    pub fn new(handle: AdmissionHandle) -> Self {
        Self {
            refund_on_failure: handle.refund_on_failure(),
            handle,
        }
    }

    /// Set whether a failed upstream call gives its quota back.
    ///
    /// A call counts as failed when the upstream executor errors or answers with a `5xx`.
    pub fn with_refund_on_failure(mut self, refund_on_failure: bool) -> Self {
        self.refund_on_failure = refund_on_failure;
        self
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService::new(service, self.handle.clone())
            .with_refund_on_failure(self.refund_on_failure)
    }
}
