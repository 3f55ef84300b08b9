use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Gauge;

use quota_queue::Endpoint;
use quota_queue::Priority;
use quota_queue::QueueDirectory;
use quota_queue::Waiter;

use crate::AdmitError;

const METER: &str = "tower_quota";

/// Response code recorded for requests refused before reaching the upstream. Keeps local
/// rejections apart from upstream 429s.
const REJECTED: u16 = 430;

/// Queue gauges, recorded on the controller's metrics tick.
#[derive(Clone, Debug)]
pub(crate) struct QueueMetrics {
    max_size: Gauge<u64>,
    filled: Gauge<u64>,
    count: Gauge<u64>,
}

impl QueueMetrics {
    pub(crate) fn new() -> Self {
        let meter = global::meter(METER);
        Self {
            max_size: meter
                .u64_gauge("queue_max_size")
                .with_description("Maximum size of a queue")
                .build(),
            filled: meter
                .u64_gauge("queue_currently_filled")
                .with_description("Current amount of requests in the queue")
                .build(),
            count: meter
                .u64_gauge("queue_count")
                .with_description("Current count of queues")
                .build(),
        }
    }

    pub(crate) fn record<W: Waiter>(&self, directory: &QueueDirectory<W>) {
        for snapshot in directory.snapshots() {
            let labels = [
                KeyValue::new("platform", snapshot.endpoint.platform.clone()),
                KeyValue::new("endpoint", format!("/{}", snapshot.endpoint.pattern)),
                KeyValue::new("priority", snapshot.priority.as_str()),
            ];
            self.max_size.record(snapshot.capacity as u64, &labels);
            self.filled.record(snapshot.len as u64, &labels);
        }

        for priority in [Priority::Normal, Priority::High] {
            self.count.record(
                directory.queue_count(priority) as u64,
                &[KeyValue::new("priority", priority.as_str())],
            );
        }
    }
}

/// Per credential response codes, recorded by the admission service.
#[derive(Clone, Debug)]
pub(crate) struct ResponseMetrics {
    codes: Counter<u64>,
}

impl ResponseMetrics {
    pub(crate) fn new() -> Self {
        let meter = global::meter(METER);
        Self {
            codes: meter
                .u64_counter("key_response_code_count")
                .with_description(
                    "Number of responses by key ID, platform, endpoint and response code",
                )
                .build(),
        }
    }

    /// `credential` is zero-based; it is labelled 1-based, or `NO-KEY` when none was granted.
    pub(crate) fn record(&self, credential: Option<usize>, endpoint: &Endpoint, code: u16) {
        let key_id = credential.map_or_else(|| "NO-KEY".to_string(), |id| (id + 1).to_string());
        self.codes.add(
            1,
            &[
                KeyValue::new("key_id", key_id),
                KeyValue::new("platform", endpoint.platform.clone()),
                KeyValue::new("endpoint", format!("/{}", endpoint.pattern)),
                KeyValue::new("response_code", i64::from(code)),
            ],
        );
    }

    pub(crate) fn record_rejection(&self, endpoint: &Endpoint, error: &AdmitError) {
        let code = match error {
            AdmitError::RateLimited { .. } => REJECTED,
            AdmitError::Timeout => 408,
            AdmitError::Closed => 503,
            AdmitError::Upstream(_) => 502,
        };
        self.record(None, endpoint, code);
    }
}
