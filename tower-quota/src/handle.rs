use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio::time::timeout_at;

use quota_queue::Endpoint;
use quota_queue::Grant;
use quota_queue::Priority;
use quota_queue::UpstreamReport;

use crate::AdmitError;
use crate::Config;
use crate::ConfigError;
use crate::LoopState;
use crate::controller::Controller;
use crate::controller::Event;
use crate::request::Acquire;
use crate::request::PendingRequest;

/// Cloneable entry point to a running admission controller.
///
/// All clones talk to the same single loop. The loop stops when [`AdmissionHandle::shutdown`]
/// is called, or once every clone has been dropped.
#[derive(Clone, Debug)]
pub struct AdmissionHandle {
    events: mpsc::Sender<Event>,
    shutdown: Arc<watch::Sender<bool>>,
    state: watch::Receiver<LoopState>,
    clock: quanta::Clock,
    request_timeout: Duration,
    caller_margin: Duration,
    shutdown_grace: Duration,
    refund_on_failure: bool,
}

impl AdmissionHandle {
    /// Validates `config` and spawns the admission loop on the current tokio runtime.
    pub fn start(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;

        let (events, receiver) = mpsc::channel(config.event_buffer);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (state_tx, state) = watch::channel(LoopState::Running);

        let controller = Controller::new(&config, receiver, shutdown_rx, state_tx);
        tokio::spawn(controller.run());

        Ok(Self {
            events,
            shutdown: Arc::new(shutdown),
            state,
            clock: config.clock,
            request_timeout: config.request_timeout,
            caller_margin: config.caller_margin,
            shutdown_grace: config.shutdown_grace,
            refund_on_failure: config.refund_on_failure,
        })
    }

    /// The clock every quota decision is made on.
    pub fn clock(&self) -> &quanta::Clock {
        &self.clock
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Whether a failed upstream call gives its quota back, as configured.
    pub fn refund_on_failure(&self) -> bool {
        self.refund_on_failure
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Queues a request for `endpoint` and waits for a credential.
    ///
    /// The whole wait, handing the request to the loop included, is bounded by the request
    /// timeout plus the caller margin. A request the loop silently dropped on expiry, or one
    /// stuck behind a full event buffer, still resolves.
    pub async fn acquire(&self, endpoint: &Endpoint, priority: Priority) -> Result<Grant, AdmitError> {
        if self.state() != LoopState::Running {
            return Err(AdmitError::Closed);
        }

        let deadline = tokio::time::Instant::now() + self.request_timeout + self.caller_margin;
        let (request, slot) = PendingRequest::new(self.clock.now() + self.request_timeout);
        let event = Event::Admit {
            endpoint: endpoint.clone(),
            priority,
            request,
        };
        timeout_at(deadline, self.send(event))
            .await
            .map_err(|_| AdmitError::Timeout)??;

        Acquire::new(timeout_at(deadline, slot), self.clock.clone()).await
    }

    /// Hands the loop what an upstream response said about `credential`'s quota.
    pub async fn report(
        &self,
        endpoint: &str,
        credential: usize,
        report: UpstreamReport,
    ) -> Result<(), AdmitError> {
        self.send(Event::Report {
            endpoint: endpoint.to_string(),
            credential,
            report,
        })
        .await
    }

    /// Returns one call to `credential`'s quota on `endpoint`.
    pub async fn refund(&self, endpoint: &str, credential: usize) -> Result<(), AdmitError> {
        self.send(Event::Refund {
            endpoint: endpoint.to_string(),
            credential,
        })
        .await
    }

    /// Stops the loop, failing every queued caller, and waits for it to finish.
    ///
    /// Gives up with [`AdmitError::Timeout`] after the configured shutdown grace.
    pub async fn shutdown(&self) -> Result<(), AdmitError> {
        self.shutdown.send_replace(true);

        let mut state = self.state.clone();
        match timeout(
            self.shutdown_grace,
            state.wait_for(|state| *state == LoopState::Stopped),
        )
        .await
        {
            // A closed state channel means the loop has already gone.
            Ok(_) => Ok(()),
            Err(_) => {
                tracing::warn!("admission loop did not stop in time");
                Err(AdmitError::Timeout)
            }
        }
    }

    async fn send(&self, event: Event) -> Result<(), AdmitError> {
        self.events.send(event).await.map_err(|_| AdmitError::Closed)
    }
}
