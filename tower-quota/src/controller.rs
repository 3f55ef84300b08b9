use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time::Interval;
use tokio::time::MissedTickBehavior;
use tokio::time::interval;

use quota_queue::Endpoint;
use quota_queue::Priority;
use quota_queue::QueueDirectory;
use quota_queue::QueueFull;
use quota_queue::UpstreamReport;
use quota_queue::Waiter;

use crate::Config;
use crate::metrics::QueueMetrics;
use crate::request::PendingRequest;

/// Lifecycle of the admission loop, published through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    ShuttingDown,
    Stopped,
}

/// Messages accepted by the admission loop.
#[derive(Debug)]
pub(crate) enum Event {
    Admit {
        endpoint: Endpoint,
        priority: Priority,
        request: PendingRequest,
    },
    Report {
        endpoint: String,
        credential: usize,
        report: UpstreamReport,
    },
    Refund {
        endpoint: String,
        credential: usize,
    },
}

/// The single owner of every queue and quota. Nothing else mutates admission state.
pub(crate) struct Controller {
    directory: QueueDirectory<PendingRequest>,
    events: mpsc::Receiver<Event>,
    shutdown: watch::Receiver<bool>,
    state: watch::Sender<LoopState>,
    clock: quanta::Clock,
    poll_interval: Duration,
    cleanup_interval: Duration,
    metrics_interval: Option<Duration>,
    priority_batch: usize,
    normal_batch: usize,
    metrics: Option<QueueMetrics>,
}

impl Controller {
    pub(crate) fn new(
        config: &Config,
        events: mpsc::Receiver<Event>,
        shutdown: watch::Receiver<bool>,
        state: watch::Sender<LoopState>,
    ) -> Self {
        Self {
            directory: QueueDirectory::new(config.directory_settings()),
            events,
            shutdown,
            state,
            clock: config.clock.clone(),
            poll_interval: config.poll_interval,
            cleanup_interval: config.cleanup_interval,
            metrics_interval: config.metrics_interval,
            priority_batch: config.priority_batch,
            normal_batch: config.normal_batch,
            metrics: config.metrics_interval.map(|_| QueueMetrics::new()),
        }
    }

    pub(crate) async fn run(mut self) {
        let mut poll = interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup = interval(self.cleanup_interval);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut metrics = self.metrics_interval.map(interval);

        tracing::info!("admission loop started");

        loop {
            // Unbiased, so a steady stream of events cannot starve the ticks.
            tokio::select! {
                // Also fires once every handle is gone.
                _ = self.shutdown.changed() => break,
                Some(event) = self.events.recv() => self.handle(event),
                _ = poll.tick() => self.poll(),
                _ = cleanup.tick() => self.clean_up(),
                _ = maybe_tick(&mut metrics) => self.record_metrics(),
            }
        }

        self.stop();
    }

    fn handle(&mut self, event: Event) {
        let now = self.clock.now();
        match event {
            Event::Admit {
                endpoint,
                priority,
                request,
            } => {
                if let Err(QueueFull { waiter, retry_at }) =
                    self.directory.enqueue(&endpoint, priority, request, now)
                {
                    tracing::debug!(endpoint = %endpoint.id, %priority, "queue full");
                    waiter.reject(Some(retry_at));
                }
            }
            Event::Report {
                endpoint,
                credential,
                report,
            } => {
                if !self.directory.has_pairing(&endpoint, credential) {
                    tracing::warn!(%endpoint, credential, "report for unknown pairing");
                    return;
                }
                if let Some(capacity) = self.directory.apply_report(&endpoint, credential, &report, now) {
                    tracing::debug!(%endpoint, credential, capacity, "capacity re-estimated");
                }
                // Resizing mid-penalty would size queues from a blackout.
                if report.retry_after.is_none() {
                    self.directory.adjust_capacity();
                }
            }
            Event::Refund {
                endpoint,
                credential,
            } => {
                let refunded = self.directory.refund(&endpoint, credential);
                tracing::debug!(%endpoint, credential, refunded, "refund");
            }
        }
    }

    fn poll(&mut self) {
        let now = self.clock.now();
        self.directory.refill(now);
        self.directory
            .process(Priority::High, self.priority_batch, now);
        self.directory
            .process(Priority::Normal, self.normal_batch, now);
    }

    fn clean_up(&mut self) {
        let retired = self.directory.clean_up(self.clock.now());
        if retired > 0 {
            tracing::debug!(retired, "cleanup tick");
        }
    }

    fn record_metrics(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record(&self.directory);
        }
    }

    fn stop(mut self) {
        self.state.send_replace(LoopState::ShuttingDown);

        // Refuse whatever is still in flight towards us.
        self.events.close();
        let mut drained = 0;
        while let Ok(event) = self.events.try_recv() {
            if let Event::Admit { request, .. } = event {
                request.reject(None);
                drained += 1;
            }
        }
        drained += self.directory.drain_all();

        tracing::info!(drained, "admission loop stopped");
        self.state.send_replace(LoopState::Stopped);
    }
}

async fn maybe_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
